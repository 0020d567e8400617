//! Container input plugin
//!
//! Decodes MP4-family containers holding an AAC or ALAC elementary stream.
//! A container may carry several audio streams; they are scanned in
//! declaration order and the first whose encoded-object type is in the
//! supported set is selected. Opening fails if none qualifies.

use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{
    Decoder, DecoderOptions, CodecType, CODEC_TYPE_AAC, CODEC_TYPE_ALAC,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{ FormatOptions, FormatReader, SeekMode, SeekTo, Track };
use symphonia::core::meta::MetadataOptions;
use symphonia::core::units::{ Time, TimeBase };

use crate::ip::{ collect_tags, duration_secs, open_media_source };
use crate::plugin::{ ByteOrder, DecodeSession, InputError, InputPlugin, SampleFormat };
use crate::track::TrackMetadata;


/// Elementary-stream types this plugin can decode.
const SUPPORTED_CODECS: &[CodecType] = &[ CODEC_TYPE_AAC, CODEC_TYPE_ALAC ];


/// MP4-family container decoder.
pub struct ContainerInput;


impl ContainerInput {
    /// Probes the container and selects the decodable stream.
    fn open_format( path: &Path ) -> Result<Box<dyn FormatReader>, InputError> {
        let ( mss, hint ) = open_media_source( path )?;

        let probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |e| {
                tracing::error!( "{}: probe: {}", path.display(), e );
                InputError::Open( e.to_string() )
            } )?;

        Ok( probed.format )
    }


    /// Scans the container's streams for one with a supported elementary
    /// stream type.
    fn select_stream( format: &dyn FormatReader ) -> Result<&Track, InputError> {
        format
            .tracks()
            .iter()
            .find( |t| SUPPORTED_CODECS.contains( &t.codec_params.codec ) )
            .ok_or( InputError::NoSupportedStream )
    }
}


impl InputPlugin for ContainerInput {
    fn name( &self ) -> &'static str {
        "container"
    }


    fn priority( &self ) -> u32 {
        10
    }


    fn extensions( &self ) -> &'static [&'static str] {
        &[ "aac", "m4a", "m4b", "mp4" ]
    }


    fn open( &self, path: &Path ) -> Result<( Box<dyn DecodeSession>, SampleFormat ), InputError> {
        let format = Self::open_format( path )?;
        let stream = Self::select_stream( format.as_ref() )?;

        let track_id = stream.id;
        let params = stream.codec_params.clone();

        // The decode buffer is sized from the largest packet the container
        // reports; a report of zero means the resource is unusable.
        let max_frames = params.max_frames_per_packet.unwrap_or( 0 );
        if max_frames == 0 {
            tracing::error!( "{}: container reports no packet size", path.display() );
            return Err( InputError::ZeroSizeStream );
        }

        let rate = params
            .sample_rate
            .filter( |r| *r > 0 )
            .ok_or_else( || InputError::Open( "unknown sample rate".to_string() ) )?;
        let channels = params
            .channels
            .filter( |c| c.count() > 0 )
            .ok_or_else( || InputError::Open( "unknown channel layout".to_string() ) )?;

        let decoder = symphonia::default::get_codecs()
            .make( &params, &DecoderOptions::default() )
            .map_err( |e| {
                tracing::error!( "{}: decoder: {}", path.display(), e );
                InputError::Open( e.to_string() )
            } )?;

        let session = ContainerSession {
            format,
            decoder,
            track_id,
            rate,
            channels: channels.count() as u32,
            time_base: params.time_base.unwrap_or_else( || TimeBase::new( 1, rate ) ),
            sample_buf: SampleBuffer::new(
                max_frames,
                symphonia::core::audio::SignalSpec::new( rate, channels ),
            ),
            pending: Vec::new(),
            pending_pos: 0,
            position_samples: 0,
            eof: false,
        };

        let format = SampleFormat {
            bits: 16,
            channels: session.channels,
            rate,
            byte_order: ByteOrder::native(),
        };

        Ok(( Box::new( session ), format ))
    }


    fn read_metadata( &self, path: &Path, metadata: &mut TrackMetadata ) -> Result<(), InputError> {
        let ( mss, hint ) = open_media_source( path )?;

        let mut probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |e| InputError::Metadata( e.to_string() ) )?;

        let stream = Self::select_stream( probed.format.as_ref() )?;
        metadata.duration = duration_secs( &stream.codec_params );

        if let Some( revision ) = probed.metadata.get().as_ref().and_then( |m| m.current() ) {
            collect_tags( revision.tags(), metadata );
        }
        if let Some( revision ) = probed.format.metadata().current() {
            collect_tags( revision.tags(), metadata );
        }

        Ok(())
    }
}


/// 16-bit output convention; sample count is interleaved across channels.
struct ContainerSession {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    rate: u32,
    channels: u32,
    time_base: TimeBase,
    sample_buf: SampleBuffer<i16>,
    // Decoded but unconsumed samples carried over from the previous read.
    pending: Vec<i16>,
    pending_pos: usize,
    position_samples: u64,
    eof: bool,
}


impl ContainerSession {
    /// Decodes the next non-empty frame into the carry-over buffer.
    ///
    /// Returns `Ok( false )` at end of stream. Unlike the generic plugin, a
    /// decode error inside a container is terminal.
    fn next_frame( &mut self ) -> Result<bool, InputError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok( packet ) => packet,
                Err( SymphoniaError::IoError( ref e ) )
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok( false );
                }
                Err( e ) => {
                    tracing::error!( "next_packet: {}", e );
                    return Err( InputError::Decode( e.to_string() ) );
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode( &packet ) {
                Ok( decoded ) => decoded,
                Err( e ) => {
                    tracing::error!( "decode: {}", e );
                    return Err( InputError::Decode( e.to_string() ) );
                }
            };

            // Priming frames decode to zero samples; consume and skip them.
            if decoded.frames() == 0 {
                continue;
            }

            if self.sample_buf.capacity() < decoded.frames() * self.channels as usize {
                self.sample_buf = SampleBuffer::new( decoded.frames() as u64, *decoded.spec() );
            }
            self.sample_buf.copy_interleaved_ref( decoded );

            self.pending.clear();
            self.pending.extend_from_slice( self.sample_buf.samples() );
            self.pending_pos = 0;
            return Ok( true );
        }
    }
}


impl DecodeSession for ContainerSession {
    fn read( &mut self, samples: &mut [i16] ) -> Result<usize, InputError> {
        let mut written = 0;

        while written < samples.len() {
            if self.pending_pos < self.pending.len() {
                let available = &self.pending[ self.pending_pos.. ];
                let n = available.len().min( samples.len() - written );
                samples[ written..written + n ].copy_from_slice( &available[ ..n ] );
                written += n;
                self.pending_pos += n;
                continue;
            }

            if self.eof {
                break;
            }

            if !self.next_frame()? {
                self.eof = true;
            }
        }

        self.position_samples += written as u64;
        Ok( written )
    }


    fn seek( &mut self, seconds: u32 ) {
        let target = SeekTo::Time {
            time: Time::from( seconds as f64 ),
            track_id: Some( self.track_id ),
        };

        match self.format.seek( SeekMode::Accurate, target ) {
            Ok( seeked ) => {
                self.decoder.reset();
                self.pending.clear();
                self.pending_pos = 0;

                let landed = self.time_base.calc_time( seeked.actual_ts ).seconds;
                self.position_samples = landed * self.rate as u64 * self.channels as u64;
            }
            Err( e ) => {
                // No valid decode boundary; the position stays where it was.
                tracing::info!( "seek to {}s failed: {}", seconds, e );
            }
        }
    }


    fn position( &self ) -> u32 {
        if self.rate == 0 || self.channels == 0 {
            return 0;
        }
        ( self.position_samples / self.channels as u64 / self.rate as u64 ) as u32
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    use std::fs;


    /// Minimal mono 16-bit PCM WAV file. Its stream probes fine but is
    /// outside this plugin's elementary-stream set.
    fn wav_bytes( samples: &[i16] ) -> Vec<u8> {
        let data_len = ( samples.len() * 2 ) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice( b"RIFF" );
        bytes.extend_from_slice( &( 36 + data_len ).to_le_bytes() );
        bytes.extend_from_slice( b"WAVE" );
        bytes.extend_from_slice( b"fmt " );
        bytes.extend_from_slice( &16u32.to_le_bytes() );
        bytes.extend_from_slice( &1u16.to_le_bytes() );
        bytes.extend_from_slice( &1u16.to_le_bytes() );
        bytes.extend_from_slice( &8000u32.to_le_bytes() );
        bytes.extend_from_slice( &16000u32.to_le_bytes() );
        bytes.extend_from_slice( &2u16.to_le_bytes() );
        bytes.extend_from_slice( &16u16.to_le_bytes() );
        bytes.extend_from_slice( b"data" );
        bytes.extend_from_slice( &data_len.to_le_bytes() );
        for sample in samples {
            bytes.extend_from_slice( &sample.to_le_bytes() );
        }
        bytes
    }


    #[test]
    fn test_open_rejects_unsupported_elementary_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "stream.wav" );
        fs::write( &path, wav_bytes( &[0; 4000] ) ).unwrap();

        assert!( matches!(
            ContainerInput.open( &path ),
            Err( InputError::NoSupportedStream )
        ) );
    }


    #[test]
    fn test_open_fails_on_unprobeable_resource() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "noise.m4a" );
        fs::write( &path, b"not a container" ).unwrap();

        assert!( matches!(
            ContainerInput.open( &path ),
            Err( InputError::Open( _ ) )
        ) );
    }
}
