//! PCM output plugin
//!
//! A fixed-format device backend via cpal: the negotiated stream must match
//! the requested channel count and signed 16-bit encoding exactly, and the
//! sampling rate within 0.5%. Volume is applied in software on the shared
//! sample ring and cached across stop/start and while the device is closed.
//!
//! Note: cpal streams are not `Send`; keep a `PcmOutput` on the thread that
//! started it.

use std::collections::VecDeque;
use std::sync::atomic::{ AtomicBool, AtomicU32, Ordering };
use std::sync::{ Arc, Mutex };
use std::thread;
use std::time::Duration;

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use cpal::SupportedBufferSize;

use crate::plugin::{ ByteOrder, OutputError, OutputPlugin, SampleFormat };


/// Buffer size reported when the device does not report one, in samples.
const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default volume level before anything is cached.
const DEFAULT_VOLUME: u32 = 100;


/// Shared sample ring between `write` (producer) and the device callback
/// (consumer). Applies the volume level while draining.
struct SampleRing {
    buffer: Mutex<VecDeque<i16>>,
    capacity: usize,
    /// Volume percent, 0-100.
    volume: AtomicU32,
    /// Set by the stream error callback; fatal for the session.
    failed: AtomicBool,
}


impl SampleRing {
    fn new( capacity: usize, volume: u32 ) -> Self {
        Self {
            buffer: Mutex::new( VecDeque::with_capacity( capacity ) ),
            capacity,
            volume: AtomicU32::new( volume ),
            failed: AtomicBool::new( false ),
        }
    }


    /// Pushes samples, returning how many fit.
    fn push( &self, samples: &[i16] ) -> usize {
        let mut buf = self.buffer.lock().unwrap();
        let available = self.capacity.saturating_sub( buf.len() );
        let to_push = samples.len().min( available );
        buf.extend( samples[ ..to_push ].iter().copied() );
        to_push
    }


    /// Drains into the device buffer, padding with silence and applying the
    /// volume level.
    fn pop( &self, output: &mut [i16] ) {
        let volume = self.volume.load( Ordering::Relaxed );
        let mut buf = self.buffer.lock().unwrap();

        let to_pop = output.len().min( buf.len() );
        for sample in output[ ..to_pop ].iter_mut() {
            *sample = buf.pop_front().unwrap();
        }
        for sample in output[ to_pop.. ].iter_mut() {
            *sample = 0;
        }

        if volume != 100 {
            for sample in output[ ..to_pop ].iter_mut() {
                *sample = ( *sample as i32 * volume as i32 / 100 ) as i16;
            }
        }
    }


    fn set_volume( &self, percent: u32 ) {
        self.volume.store( percent, Ordering::Relaxed );
    }


    fn volume( &self ) -> u32 {
        self.volume.load( Ordering::Relaxed )
    }


    fn fail( &self ) {
        self.failed.store( true, Ordering::Relaxed );
    }


    fn has_failed( &self ) -> bool {
        self.failed.load( Ordering::Relaxed )
    }
}


/// One supported device configuration, reduced to what negotiation needs.
struct ConfigCandidate {
    channels: u16,
    sample_format: cpal::SampleFormat,
    min_rate: u32,
    max_rate: u32,
}


/// Whether `actual` is within 0.5% of the requested sampling rate.
fn rate_within_tolerance( requested: u32, actual: u32 ) -> bool {
    let requested = requested as u64;
    let actual = actual as u64;
    actual * 1000 >= requested * 995 && actual * 1000 <= requested * 1005
}


/// Negotiates a device configuration in fixed order: channel count (exact),
/// sample encoding (exact), sampling rate (within 0.5%).
///
/// Returns the candidate index and the rate to open it at.
fn negotiate(
    candidates: &[ConfigCandidate],
    want: &SampleFormat,
) -> Result<( usize, u32 ), OutputError> {
    if !candidates.iter().any( |c| c.channels as u32 == want.channels ) {
        return Err( OutputError::UnsupportedChannels( want.channels ) );
    }

    if want.bits != 16
        || !candidates.iter().any( |c| {
            c.channels as u32 == want.channels && c.sample_format == cpal::SampleFormat::I16
        } )
    {
        return Err( OutputError::UnsupportedEncoding( want.bits ) );
    }

    for ( i, candidate ) in candidates.iter().enumerate() {
        if candidate.channels as u32 != want.channels
            || candidate.sample_format != cpal::SampleFormat::I16
        {
            continue;
        }

        let rate = want.rate.clamp( candidate.min_rate, candidate.max_rate );
        if rate_within_tolerance( want.rate, rate ) {
            return Ok(( i, rate ));
        }
    }

    Err( OutputError::UnsupportedRate( want.rate ) )
}


/// PCM device backend.
pub struct PcmOutput {
    device_name: Option<String>,
    device: Option<cpal::Device>,
    stream: Option<cpal::Stream>,
    ring: Option<Arc<SampleRing>>,
    cached_volume: u32,
    buffer_size: usize,
}


impl PcmOutput {
    /// Creates the backend. `device_name` selects a specific output device;
    /// `None` uses the system default.
    pub fn new( device_name: Option<String> ) -> Self {
        Self {
            device_name,
            device: None,
            stream: None,
            ring: None,
            cached_volume: DEFAULT_VOLUME,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}


impl OutputPlugin for PcmOutput {
    fn name( &self ) -> &'static str {
        "pcm"
    }


    fn init( &mut self ) {
        match &self.device_name {
            Some( name ) => tracing::info!( "pcm: configured device {}", name ),
            None => tracing::info!( "pcm: using default device" ),
        }
    }


    fn open( &mut self ) -> Result<(), OutputError> {
        let host = cpal::default_host();

        let device = match &self.device_name {
            Some( name ) => host
                .output_devices()
                .map_err( |e| OutputError::Stream( e.to_string() ) )?
                .find( |d| d.name().map( |n| n == *name ).unwrap_or( false ) )
                .ok_or( OutputError::NoDevice )?,
            None => host.default_output_device().ok_or( OutputError::NoDevice )?,
        };

        tracing::info!( "pcm: opened device {:?}", device.name().ok() );

        // Software volume: the cached level is the device level, valid
        // before start.
        tracing::debug!( "pcm: volume {}%", self.cached_volume );

        self.device = Some( device );
        Ok(())
    }


    fn start( &mut self, format: &SampleFormat ) -> Result<SampleFormat, OutputError> {
        let device = self.device.as_ref().ok_or( OutputError::NotOpen )?;

        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err( |e| OutputError::Stream( e.to_string() ) )?
            .collect();

        let candidates: Vec<ConfigCandidate> = ranges
            .iter()
            .map( |r| ConfigCandidate {
                channels: r.channels(),
                sample_format: r.sample_format(),
                min_rate: r.min_sample_rate().0,
                max_rate: r.max_sample_rate().0,
            } )
            .collect();

        let ( index, rate ) = negotiate( &candidates, format )?;

        let buffer_size = match ranges[ index ].buffer_size() {
            SupportedBufferSize::Range { min, max } => {
                DEFAULT_BUFFER_SIZE.clamp( *min as usize, *max as usize )
            }
            SupportedBufferSize::Unknown => DEFAULT_BUFFER_SIZE,
        };

        let config = cpal::StreamConfig {
            channels: format.channels as u16,
            sample_rate: cpal::SampleRate( rate ),
            buffer_size: cpal::BufferSize::Default,
        };

        // ~500ms of audio between producer and device callback.
        let capacity = rate as usize * format.channels as usize / 2;
        let ring = Arc::new( SampleRing::new( capacity, self.cached_volume ) );

        let consumer = Arc::clone( &ring );
        let watchdog = Arc::clone( &ring );
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    consumer.pop( data );
                },
                move |err| {
                    tracing::error!( "pcm: stream error: {}", err );
                    watchdog.fail();
                },
                None,
            )
            .map_err( |e| OutputError::Stream( e.to_string() ) )?;

        // A play failure drops the stream here, releasing the device.
        stream.play().map_err( |e| OutputError::Stream( e.to_string() ) )?;

        tracing::info!(
            "pcm: started: {} channels, {} Hz, buffer {} samples",
            format.channels,
            rate,
            buffer_size
        );

        self.buffer_size = buffer_size;
        self.ring = Some( ring );
        self.stream = Some( stream );

        Ok( SampleFormat {
            bits: 16,
            channels: format.channels,
            rate,
            byte_order: ByteOrder::native(),
        } )
    }


    fn write( &mut self, samples: &[i16] ) -> Result<(), OutputError> {
        let ring = self.ring.as_ref().ok_or( OutputError::NotStarted )?;

        let mut offset = 0;
        while offset < samples.len() {
            if ring.has_failed() {
                return Err( OutputError::Write( "device stream failed".to_string() ) );
            }

            let pushed = ring.push( &samples[ offset.. ] );
            offset += pushed;
            if pushed == 0 {
                // Ring full; wait for the device callback to drain it.
                thread::sleep( Duration::from_millis( 5 ) );
            }
        }

        Ok(())
    }


    fn stop( &mut self ) {
        if let Some( ring ) = self.ring.take() {
            self.cached_volume = ring.volume();
        }
        self.stream = None;
        tracing::debug!( "pcm: stopped" );
    }


    fn buffer_size( &self ) -> usize {
        self.buffer_size
    }


    fn volume( &self ) -> u32 {
        self.ring
            .as_ref()
            .map( |ring| ring.volume() )
            .unwrap_or( self.cached_volume )
    }


    fn set_volume( &mut self, percent: u32 ) -> Result<(), OutputError> {
        let percent = percent.min( 100 );
        match &self.ring {
            Some( ring ) => ring.set_volume( percent ),
            None => self.cached_volume = percent,
        }
        Ok(())
    }


    fn close( &mut self ) {
        self.stream = None;
        self.ring = None;
        self.device = None;
        tracing::debug!( "pcm: closed" );
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn candidate( channels: u16, sample_format: cpal::SampleFormat, min: u32, max: u32 ) -> ConfigCandidate {
        ConfigCandidate {
            channels,
            sample_format,
            min_rate: min,
            max_rate: max,
        }
    }


    fn stereo_44100() -> SampleFormat {
        SampleFormat {
            bits: 16,
            channels: 2,
            rate: 44100,
            byte_order: ByteOrder::native(),
        }
    }


    #[test]
    fn test_rate_tolerance_accepts_half_percent() {
        assert!( rate_within_tolerance( 44100, 44100 ) );
        assert!( rate_within_tolerance( 44100, 44000 ) );
        assert!( rate_within_tolerance( 44100, 44300 ) );
        assert!( !rate_within_tolerance( 44100, 46000 ) );
        assert!( !rate_within_tolerance( 44100, 43000 ) );
    }


    #[test]
    fn test_negotiate_exact_rate() {
        let candidates = [ candidate( 2, cpal::SampleFormat::I16, 8000, 48000 ) ];
        let ( index, rate ) = negotiate( &candidates, &stereo_44100() ).unwrap();
        assert_eq!( index, 0 );
        assert_eq!( rate, 44100 );
    }


    #[test]
    fn test_negotiate_nearby_rate() {
        // The device tops out at 44000 Hz, within 0.5% of the request.
        let candidates = [ candidate( 2, cpal::SampleFormat::I16, 8000, 44000 ) ];
        let ( _, rate ) = negotiate( &candidates, &stereo_44100() ).unwrap();
        assert_eq!( rate, 44000 );
    }


    #[test]
    fn test_negotiate_rejects_far_rate() {
        let candidates = [ candidate( 2, cpal::SampleFormat::I16, 46000, 46000 ) ];
        assert!( matches!(
            negotiate( &candidates, &stereo_44100() ),
            Err( OutputError::UnsupportedRate( 44100 ) )
        ) );
    }


    #[test]
    fn test_negotiate_rejects_channel_mismatch() {
        let candidates = [ candidate( 6, cpal::SampleFormat::I16, 8000, 48000 ) ];
        assert!( matches!(
            negotiate( &candidates, &stereo_44100() ),
            Err( OutputError::UnsupportedChannels( 2 ) )
        ) );
    }


    #[test]
    fn test_negotiate_rejects_encoding_mismatch() {
        let candidates = [ candidate( 2, cpal::SampleFormat::F32, 8000, 48000 ) ];
        assert!( matches!(
            negotiate( &candidates, &stereo_44100() ),
            Err( OutputError::UnsupportedEncoding( 16 ) )
        ) );
    }


    #[test]
    fn test_volume_is_cached_while_closed() {
        let mut output = PcmOutput::new( None );
        assert_eq!( output.volume(), DEFAULT_VOLUME );

        output.set_volume( 35 ).unwrap();
        assert_eq!( output.volume(), 35 );

        // Out-of-range levels are clamped.
        output.set_volume( 250 ).unwrap();
        assert_eq!( output.volume(), 100 );
    }


    #[test]
    fn test_start_before_open_keeps_default_buffer_size() {
        let mut output = PcmOutput::new( None );
        assert!( matches!(
            output.start( &stereo_44100() ),
            Err( OutputError::NotOpen )
        ) );
        assert_eq!( output.buffer_size(), DEFAULT_BUFFER_SIZE );
    }


    #[test]
    fn test_write_before_start_fails() {
        let mut output = PcmOutput::new( None );
        assert!( matches!(
            output.write( &[0; 8] ),
            Err( OutputError::NotStarted )
        ) );
    }


    #[test]
    fn test_ring_applies_volume_and_pads_silence() {
        let ring = SampleRing::new( 8, 50 );
        assert_eq!( ring.push( &[ 1000, -1000 ] ), 2 );

        let mut out = [ 123i16; 4 ];
        ring.pop( &mut out );
        assert_eq!( out, [ 500, -500, 0, 0 ] );
    }


    #[test]
    fn test_ring_push_respects_capacity() {
        let ring = SampleRing::new( 4, 100 );
        assert_eq!( ring.push( &[ 1, 2, 3, 4, 5, 6 ] ), 4 );
        assert_eq!( ring.push( &[ 7 ] ), 0 );

        let mut out = [ 0i16; 4 ];
        ring.pop( &mut out );
        assert_eq!( out, [ 1, 2, 3, 4 ] );
        assert_eq!( ring.push( &[ 7 ] ), 1 );
    }
}
