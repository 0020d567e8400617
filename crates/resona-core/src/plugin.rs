//! Plugin contracts
//!
//! Defines the decode (input) and device (output) state machine traits that
//! codec and audio backends implement, the negotiated sample format they
//! exchange, and the registry used to resolve a file path to an input plugin.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::track::TrackMetadata;


/// Byte order of the samples produced by a decode session or expected by an
/// output device.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum ByteOrder {
    Little,
    Big,
}


impl ByteOrder {
    /// Returns the byte order of the host.
    pub fn native() -> Self {
        if cfg!( target_endian = "big" ) {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}


impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::native()
    }
}


/// Negotiated sample format of an open decode or device session.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct SampleFormat {
    /// Bits per sample.
    pub bits: u32,
    /// Number of interleaved channels.
    pub channels: u32,
    /// Sampling rate in Hz.
    pub rate: u32,
    pub byte_order: ByteOrder,
}


/// Errors reported by input plugins.
#[derive( Debug, Error )]
pub enum InputError {
    #[error( "Cannot open track: {0}" )]
    Open( String ),

    #[error( "Cannot find a supported audio stream" )]
    NoSupportedStream,

    #[error( "Stream reports a zero-sized read buffer" )]
    ZeroSizeStream,

    #[error( "Cannot read from track: {0}" )]
    Decode( String ),

    #[error( "Cannot get metadata: {0}" )]
    Metadata( String ),

    #[error( "No input plugin resolved for this track" )]
    NoPlugin,

    #[error( "A decode session is already open for this track" )]
    SessionOpen,

    #[error( "No decode session is open for this track" )]
    NoSession,
}


/// Errors reported by output plugins.
#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Device is not open" )]
    NotOpen,

    #[error( "Device is not started" )]
    NotStarted,

    #[error( "{0} channels not supported" )]
    UnsupportedChannels( u32 ),

    #[error( "{0} bits per sample not supported" )]
    UnsupportedEncoding( u32 ),

    #[error( "Sampling rate {0} Hz not supported" )]
    UnsupportedRate( u32 ),

    #[error( "Cannot start stream: {0}" )]
    Stream( String ),

    #[error( "Playback error: {0}" )]
    Write( String ),

    #[error( "Cannot change the volume level: {0}" )]
    Volume( String ),
}


/// One open decode session.
///
/// Obtained from [`InputPlugin::open`] and owned by a single track while open.
/// The session is driven from one execution context at a time; dropping it
/// releases the codec instance and all buffers.
pub trait DecodeSession: Send {
    /// Fills `samples` with decoded audio up to its capacity, draining any
    /// samples carried over from the previous call first.
    ///
    /// Returns the number of samples written, `Ok( 0 )` exactly once at clean
    /// end of stream, or a terminal error. After a terminal error or end of
    /// stream the caller must drop the session instead of calling `read`
    /// again.
    fn read( &mut self, samples: &mut [i16] ) -> Result<usize, InputError>;

    /// Seeks to the nearest valid decode boundary at or before `seconds`.
    ///
    /// A position past the end of the stream leaves the running position
    /// unchanged; the failure is logged but not surfaced.
    fn seek( &mut self, seconds: u32 );

    /// Returns the current position in whole seconds.
    fn position( &self ) -> u32;
}


/// A codec backend that can decode tracks of the formats it declares.
///
/// `open` and `read_metadata` are independent: `read_metadata` acquires and
/// releases its own private resources and may be called whether or not a
/// decode session is open.
pub trait InputPlugin: Send + Sync {
    fn name( &self ) -> &'static str;


    /// Plugins with a higher priority win when several declare the same
    /// extension.
    fn priority( &self ) -> u32;


    /// File extensions this plugin can decode, lower case.
    fn extensions( &self ) -> &'static [&'static str];


    /// Opens a decode session for the resource at `path` and returns it
    /// together with the negotiated sample format.
    ///
    /// On failure every partially acquired resource is released before
    /// returning.
    fn open( &self, path: &Path ) -> Result<( Box<dyn DecodeSession>, SampleFormat ), InputError>;


    /// Extracts whatever tags the resource carries into `metadata`.
    ///
    /// Absent tags leave the corresponding field at its default. Numeric tags
    /// are rendered as decimal text; the duration is computed from the
    /// resource's native time scale.
    fn read_metadata( &self, path: &Path, metadata: &mut TrackMetadata ) -> Result<(), InputError>;
}


/// A device backend implementing the output state machine
/// `Closed -> Opened -> Started <-> Stopped`.
pub trait OutputPlugin {
    fn name( &self ) -> &'static str;


    /// Registers device configuration needed before first use. Called once
    /// per process for every compiled backend.
    fn init( &mut self );


    /// Acquires the format-independent device resources. Backends with
    /// volume support probe and cache the current level here so it can be
    /// reported before `start`.
    fn open( &mut self ) -> Result<(), OutputError>;


    /// Negotiates `format` with the device: channel count and sample
    /// encoding must match exactly, the rate within 0.5% of the request.
    ///
    /// Returns the format actually in effect (the device decides the byte
    /// order). On failure the partially opened device is released and the
    /// previously reported buffer size is left intact.
    fn start( &mut self, format: &SampleFormat ) -> Result<SampleFormat, OutputError>;


    /// Writes the whole buffer, blocking until everything is queued on the
    /// device. Short writes and device errors are fatal for the session.
    fn write( &mut self, samples: &[i16] ) -> Result<(), OutputError>;


    /// Stops the stream and releases the device handle. Best-effort caches
    /// the current volume first; always succeeds.
    fn stop( &mut self );


    /// The negotiated output buffer size in samples, or the backend default
    /// if the device did not report one.
    fn buffer_size( &self ) -> usize;


    /// Current volume level, 0-100. While the device is closed this is the
    /// cached level that will be applied on the next `start`.
    fn volume( &self ) -> u32;


    /// Sets the volume level, 0-100. Issued directly to the device while
    /// started, cached otherwise. Device-level failures are recoverable and
    /// leave the session open.
    fn set_volume( &mut self, percent: u32 ) -> Result<(), OutputError>;


    /// Releases the process-wide configuration state.
    fn close( &mut self );
}


/// Registry of input plugins, consulted to resolve a path to a decoder.
///
/// Registration happens once at startup from the embedding application; the
/// registry itself is immutable afterwards and shared behind an `Arc`.
#[derive( Default )]
pub struct PluginRegistry {
    inputs: Vec<Arc<dyn InputPlugin>>,
}


impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }


    /// Registers an input plugin.
    pub fn register_input( &mut self, plugin: Arc<dyn InputPlugin> ) {
        tracing::debug!( "registered input plugin: {}", plugin.name() );
        self.inputs.push( plugin );
    }


    /// Resolves an input plugin for `path` by extension.
    ///
    /// Among the registered plugins whose extension set contains the path's
    /// extension (case-insensitive), the one with the highest priority wins.
    /// A path without an extension resolves to nothing.
    pub fn resolve_input( &self, path: &Path ) -> Option<Arc<dyn InputPlugin>> {
        let ext = path.extension().and_then( |e| e.to_str() )?.to_lowercase();

        self.inputs
            .iter()
            .filter( |p| p.extensions().contains( &ext.as_str() ) )
            .max_by_key( |p| p.priority() )
            .cloned()
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    struct FakePlugin {
        name: &'static str,
        priority: u32,
        extensions: &'static [&'static str],
    }


    impl InputPlugin for FakePlugin {
        fn name( &self ) -> &'static str {
            self.name
        }

        fn priority( &self ) -> u32 {
            self.priority
        }

        fn extensions( &self ) -> &'static [&'static str] {
            self.extensions
        }

        fn open( &self, _path: &Path ) -> Result<( Box<dyn DecodeSession>, SampleFormat ), InputError> {
            Err( InputError::NoSupportedStream )
        }

        fn read_metadata( &self, _path: &Path, _metadata: &mut TrackMetadata ) -> Result<(), InputError> {
            Ok(())
        }
    }


    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register_input( Arc::new( FakePlugin {
            name: "generic",
            priority: 1,
            extensions: &[ "flac", "ogg", "wav" ],
        } ) );
        registry.register_input( Arc::new( FakePlugin {
            name: "container",
            priority: 5,
            extensions: &[ "m4a", "wav" ],
        } ) );
        registry
    }


    #[test]
    fn test_resolve_by_extension() {
        let registry = registry();
        let plugin = registry.resolve_input( Path::new( "/m/a.flac" ) ).unwrap();
        assert_eq!( plugin.name(), "generic" );
    }


    #[test]
    fn test_resolve_case_insensitive() {
        let registry = registry();
        let plugin = registry.resolve_input( Path::new( "/m/a.FLAC" ) ).unwrap();
        assert_eq!( plugin.name(), "generic" );
    }


    #[test]
    fn test_resolve_prefers_priority() {
        let registry = registry();
        let plugin = registry.resolve_input( Path::new( "/m/a.wav" ) ).unwrap();
        assert_eq!( plugin.name(), "container" );
    }


    #[test]
    fn test_resolve_no_extension() {
        let registry = registry();
        assert!( registry.resolve_input( Path::new( "/m/noext" ) ).is_none() );
    }


    #[test]
    fn test_resolve_unknown_extension() {
        let registry = registry();
        assert!( registry.resolve_input( Path::new( "/m/a.mid" ) ).is_none() );
    }


    #[test]
    fn test_native_byte_order_is_default() {
        assert_eq!( ByteOrder::default(), ByteOrder::native() );
    }
}
