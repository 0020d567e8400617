//! Generic input plugin
//!
//! A catch-all decoder for every format Symphonia can probe. I/O problems
//! and fatal codec conditions are data-path errors returned from the read
//! call; recoverable decode errors skip the bad packet and carry on.

use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{ Decoder, DecoderOptions, CODEC_TYPE_NULL };
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{ FormatOptions, FormatReader, SeekMode, SeekTo, Track };
use symphonia::core::meta::MetadataOptions;
use symphonia::core::units::{ Time, TimeBase };

use crate::ip::{ collect_tags, duration_secs, open_media_source };
use crate::plugin::{ ByteOrder, DecodeSession, InputError, InputPlugin, SampleFormat };
use crate::track::TrackMetadata;


/// Multi-format sample decoder.
pub struct GenericInput;


impl GenericInput {
    fn select_stream( format: &dyn FormatReader ) -> Result<&Track, InputError> {
        format
            .tracks()
            .iter()
            .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .ok_or( InputError::NoSupportedStream )
    }
}


impl InputPlugin for GenericInput {
    fn name( &self ) -> &'static str {
        "generic"
    }


    fn priority( &self ) -> u32 {
        1
    }


    fn extensions( &self ) -> &'static [&'static str] {
        &[
            "aif", "aifc", "aiff",
            "flac",
            "mkv", "webm",
            "mp1", "mp2", "mp3",
            "oga", "ogg", "opus",
            "wav", "wave",
        ]
    }


    fn open( &self, path: &Path ) -> Result<( Box<dyn DecodeSession>, SampleFormat ), InputError> {
        let ( mss, hint ) = open_media_source( path )?;

        let probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |e| {
                tracing::error!( "{}: probe: {}", path.display(), e );
                InputError::Open( e.to_string() )
            } )?;

        let format = probed.format;
        let stream = Self::select_stream( format.as_ref() )?;

        let track_id = stream.id;
        let params = stream.codec_params.clone();

        let rate = params
            .sample_rate
            .filter( |r| *r > 0 )
            .ok_or_else( || InputError::Open( "unknown sample rate".to_string() ) )?;
        let channels = params
            .channels
            .map( |c| c.count() as u32 )
            .filter( |c| *c > 0 )
            .ok_or_else( || InputError::Open( "unknown channel layout".to_string() ) )?;

        let decoder = symphonia::default::get_codecs()
            .make( &params, &DecoderOptions::default() )
            .map_err( |e| {
                tracing::error!( "{}: decoder: {}", path.display(), e );
                InputError::Open( e.to_string() )
            } )?;

        let session = GenericSession {
            format,
            decoder,
            track_id,
            rate,
            channels,
            time_base: params.time_base.unwrap_or_else( || TimeBase::new( 1, rate ) ),
            sample_buf: None,
            pending: Vec::new(),
            pending_pos: 0,
            position_samples: 0,
            eof: false,
        };

        let negotiated = SampleFormat {
            bits: 16,
            channels,
            rate,
            byte_order: ByteOrder::native(),
        };

        Ok(( Box::new( session ), negotiated ))
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
struct GenericSession {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    rate: u32,
    channels: u32,
    time_base: TimeBase,
    // Created on the first decoded frame, once the signal spec is known.
    sample_buf: Option<SampleBuffer<i16>>,
    pending: Vec<i16>,
    pending_pos: usize,
    position_samples: u64,
    eof: bool,
}


impl GenericSession {
    /// Decodes the next non-empty frame into the carry-over buffer.
    ///
    /// Returns `Ok( false )` at end of stream. Recoverable decode errors
    /// skip the packet; anything else is returned to the caller.
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
                Err( SymphoniaError::DecodeError( e ) ) => {
                    // Recoverable; skip this packet.
                    tracing::debug!( "skipping undecodable packet: {}", e );
                    continue;
                }
                Err( e ) => {
                    tracing::error!( "decode: {}", e );
                    return Err( InputError::Decode( e.to_string() ) );
                }
            };

            if decoded.frames() == 0 {
                continue;
            }

            let needed = decoded.frames() * self.channels as usize;
            if self.sample_buf.as_ref().map( |b| b.capacity() < needed ).unwrap_or( true ) {
                self.sample_buf = Some( SampleBuffer::new( decoded.frames() as u64, *decoded.spec() ) );
            }

            let sample_buf = self.sample_buf.as_mut().unwrap();
            sample_buf.copy_interleaved_ref( decoded );

            self.pending.clear();
            self.pending.extend_from_slice( sample_buf.samples() );
            self.pending_pos = 0;
            return Ok( true );
        }
    }
}


impl DecodeSession for GenericSession {
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
    use std::path::PathBuf;

    use tempfile::TempDir;


    const RATE: u32 = 8000;


    /// Minimal mono 16-bit PCM WAV container around `samples`.
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
        bytes.extend_from_slice( &RATE.to_le_bytes() );
        bytes.extend_from_slice( &( RATE * 2 ).to_le_bytes() );
        bytes.extend_from_slice( &2u16.to_le_bytes() );
        bytes.extend_from_slice( &16u16.to_le_bytes() );
        bytes.extend_from_slice( b"data" );
        bytes.extend_from_slice( &data_len.to_le_bytes() );
        for sample in samples {
            bytes.extend_from_slice( &sample.to_le_bytes() );
        }
        bytes
    }


    fn write_wav( dir: &TempDir, samples: &[i16] ) -> PathBuf {
        let path = dir.path().join( "tone.wav" );
        fs::write( &path, wav_bytes( samples ) ).unwrap();
        path
    }


    fn ramp( len: usize ) -> Vec<i16> {
        ( 0..len ).map( |i| ( i % 2000 ) as i16 - 1000 ).collect()
    }


    #[test]
    fn test_open_negotiates_stream_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav( &dir, &ramp( 4000 ) );

        let ( _session, format ) = GenericInput.open( &path ).unwrap();
        assert_eq!( format.bits, 16 );
        assert_eq!( format.channels, 1 );
        assert_eq!( format.rate, RATE );
    }


    #[test]
    fn test_read_drains_across_partial_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let samples = ramp( 12000 );
        let path = write_wav( &dir, &samples );

        let ( mut session, _format ) = GenericInput.open( &path ).unwrap();

        // An odd buffer size never lines up with a decoded frame, so every
        // call after the first starts by draining carried-over samples.
        let mut decoded = Vec::new();
        let mut buf = [0i16; 777];
        loop {
            let n = session.read( &mut buf ).unwrap();
            if n == 0 {
                break;
            }
            decoded.extend_from_slice( &buf[ ..n ] );
        }

        assert_eq!( decoded, samples );
    }


    #[test]
    fn test_read_signals_end_of_stream_once() {
        let dir = tempfile::tempdir().unwrap();
        let samples = ramp( 12000 );
        let path = write_wav( &dir, &samples );

        let ( mut session, _format ) = GenericInput.open( &path ).unwrap();

        let mut total = 0;
        let mut buf = [0i16; 4096];
        loop {
            let n = session.read( &mut buf ).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }

        assert_eq!( total, samples.len() );
        // 12000 mono samples at 8000 Hz, truncated to whole seconds.
        assert_eq!( session.position(), 1 );
    }


    #[test]
    fn test_seek_lands_at_or_before_requested_second() {
        let dir = tempfile::tempdir().unwrap();
        let samples = ramp( 12000 );
        let path = write_wav( &dir, &samples );

        let ( mut session, _format ) = GenericInput.open( &path ).unwrap();
        session.seek( 1 );
        assert!( session.position() <= 1 );

        let mut decoded = Vec::new();
        let mut buf = [0i16; 4096];
        loop {
            let n = session.read( &mut buf ).unwrap();
            if n == 0 {
                break;
            }
            decoded.extend_from_slice( &buf[ ..n ] );
        }

        // Decoding resumes at the boundary actually landed on, which is at
        // or before the requested second, and runs to the end of the stream.
        assert!( decoded.len() >= samples.len() - RATE as usize );
        assert_eq!( decoded, &samples[ samples.len() - decoded.len().. ] );
    }


    #[test]
    fn test_metadata_duration_from_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav( &dir, &ramp( 12000 ) );

        let mut metadata = TrackMetadata::default();
        GenericInput.read_metadata( &path, &mut metadata ).unwrap();
        assert_eq!( metadata.duration, 1 );
    }
}
