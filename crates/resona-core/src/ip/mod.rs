//! Reference input plugins
//!
//! Two Symphonia-backed decoders: a container decoder for MP4-family files
//! holding an AAC or ALAC elementary stream, and a generic decoder for
//! everything else Symphonia can probe. Shared here: tag extraction and
//! duration computation, identical for both.

use std::fs::File;
use std::path::Path;

use symphonia::core::codecs::CodecParameters;
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::{ StandardTagKey, Tag };
use symphonia::core::probe::Hint;

use crate::plugin::InputError;
use crate::track::TrackMetadata;

pub mod container;
pub mod generic;

pub use container::ContainerInput;
pub use generic::GenericInput;


/// Opens the resource at `path` as a Symphonia media source, with an
/// extension hint for the probe.
fn open_media_source( path: &Path ) -> Result<( MediaSourceStream, Hint ), InputError> {
    let file = File::open( path ).map_err( |e| {
        tracing::error!( "{}: open: {}", path.display(), e );
        InputError::Open( e.to_string() )
    } )?;

    let mss = MediaSourceStream::new( Box::new( file ), MediaSourceStreamOptions::default() );

    let mut hint = Hint::new();
    if let Some( ext ) = path.extension().and_then( |e| e.to_str() ) {
        hint.with_extension( ext );
    }

    Ok(( mss, hint ))
}


/// Copies the tags of one metadata revision into `metadata`. The first
/// occurrence of a tag wins; absent tags leave the field untouched.
fn collect_tags( tags: &[Tag], metadata: &mut TrackMetadata ) {
    for tag in tags {
        let Some( key ) = tag.std_key else {
            continue;
        };
        let value = tag.value.to_string();

        match key {
            StandardTagKey::Album => fill( &mut metadata.album, value ),
            StandardTagKey::AlbumArtist => fill( &mut metadata.albumartist, value ),
            StandardTagKey::Artist => fill( &mut metadata.artist, value ),
            StandardTagKey::Comment => fill( &mut metadata.comment, value ),
            StandardTagKey::Date | StandardTagKey::ReleaseDate => {
                fill( &mut metadata.date, value )
            }
            StandardTagKey::DiscNumber => {
                fill_index_total( &mut metadata.discnumber, &mut metadata.disctotal, &value )
            }
            StandardTagKey::DiscTotal => fill( &mut metadata.disctotal, decimal( &value ) ),
            StandardTagKey::Genre => fill( &mut metadata.genre, value ),
            StandardTagKey::TrackTitle => fill( &mut metadata.title, value ),
            StandardTagKey::TrackNumber => {
                fill_index_total( &mut metadata.tracknumber, &mut metadata.tracktotal, &value )
            }
            StandardTagKey::TrackTotal => fill( &mut metadata.tracktotal, decimal( &value ) ),
            _ => {}
        }
    }
}


fn fill( slot: &mut Option<String>, value: String ) {
    if slot.is_none() && !value.is_empty() {
        *slot = Some( value );
    }
}


/// Splits an "index/total" tag value and renders both parts as decimal text.
fn fill_index_total( index: &mut Option<String>, total: &mut Option<String>, value: &str ) {
    match value.split_once( '/' ) {
        Some(( i, t )) => {
            fill( index, decimal( i ) );
            fill( total, decimal( t ) );
        }
        None => fill( index, decimal( value ) ),
    }
}


/// Renders a numeric tag as decimal text, leaving non-numeric values as-is.
fn decimal( value: &str ) -> String {
    match value.trim().parse::<u64>() {
        Ok( n ) => n.to_string(),
        Err( _ ) => value.trim().to_string(),
    }
}


/// Duration of a stream in whole seconds, via its native time scale when the
/// resource reports one.
fn duration_secs( params: &CodecParameters ) -> u32 {
    let Some( frames ) = params.n_frames else {
        return 0;
    };

    if let Some( time_base ) = params.time_base {
        time_base.calc_time( frames ).seconds as u32
    } else if let Some( rate ) = params.sample_rate.filter( |r| *r > 0 ) {
        ( frames / rate as u64 ) as u32
    } else {
        0
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    use symphonia::core::meta::Value;


    fn tag( key: StandardTagKey, value: &str ) -> Tag {
        Tag::new( Some( key ), "", Value::String( value.to_string() ) )
    }


    #[test]
    fn test_collect_tags_first_wins() {
        let mut metadata = TrackMetadata::default();
        collect_tags(
            &[
                tag( StandardTagKey::Artist, "Arctic Monkeys" ),
                tag( StandardTagKey::Artist, "Someone Else" ),
            ],
            &mut metadata,
        );
        assert_eq!( metadata.artist.as_deref(), Some( "Arctic Monkeys" ) );
    }


    #[test]
    fn test_collect_tags_splits_index_total() {
        let mut metadata = TrackMetadata::default();
        collect_tags( &[ tag( StandardTagKey::TrackNumber, "03/12" ) ], &mut metadata );
        assert_eq!( metadata.tracknumber.as_deref(), Some( "3" ) );
        assert_eq!( metadata.tracktotal.as_deref(), Some( "12" ) );
    }


    #[test]
    fn test_collect_tags_keeps_non_numeric_text() {
        let mut metadata = TrackMetadata::default();
        collect_tags( &[ tag( StandardTagKey::Date, "1998-05-21" ) ], &mut metadata );
        assert_eq!( metadata.date.as_deref(), Some( "1998-05-21" ) );
    }


    #[test]
    fn test_empty_tag_leaves_field_absent() {
        let mut metadata = TrackMetadata::default();
        collect_tags( &[ tag( StandardTagKey::Genre, "" ) ], &mut metadata );
        assert_eq!( metadata.genre, None );
    }


    #[test]
    fn test_duration_from_sample_rate() {
        let mut params = CodecParameters::new();
        params.with_sample_rate( 44100 );
        params.with_n_frames( 44100 * 185 );
        assert_eq!( duration_secs( &params ), 185 );
    }


    #[test]
    fn test_duration_unknown_is_zero() {
        assert_eq!( duration_secs( &CodecParameters::new() ), 0 );
    }
}
