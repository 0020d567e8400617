//! Metadata cache
//!
//! A sequential persisted store of track metadata snapshots. Opened in read
//! or write mode, never both: a load reads snapshots until a read fails, a
//! flush rewrites the whole file. Fields are NUL-terminated; absent fields
//! are empty. The file starts with a format version number.

use std::fs::File;
use std::io::{ self, BufRead, BufReader, BufWriter, ErrorKind, Write };
use std::path::{ Path, PathBuf };

use thiserror::Error;

use crate::track::TrackMetadata;


/// Current cache file format version.
const CACHE_VERSION: u32 = 1;


/// Errors that can occur with the metadata cache.
///
/// During a load, `Truncated` and `BadNumber` are indistinguishable from a
/// clean end of data and simply stop the read loop.
#[derive( Debug, Error )]
pub enum CacheError {
    #[error( "Cannot access metadata cache file: {0}" )]
    Io( #[from] io::Error ),

    #[error( "Unsupported metadata cache version {0}" )]
    UnsupportedVersion( u32 ),

    #[error( "Metadata cache entry is truncated" )]
    Truncated,

    #[error( "Invalid number in metadata cache: {0}" )]
    BadNumber( String ),
}


/// One snapshot read from or written to the cache.
#[derive( Debug, Clone, PartialEq, Eq )]
pub struct CacheEntry {
    pub path: PathBuf,
    pub metadata: TrackMetadata,
}


/// Read half of the cache, producing one [`CacheEntry`] per call.
pub struct CacheReader {
    reader: BufReader<File>,
    version: u32,
}


impl CacheReader {
    /// Opens the cache file for reading and checks the version.
    ///
    /// A missing file is not an error: there simply is no cache yet, and
    /// `Ok( None )` is returned.
    pub fn open( path: &Path ) -> Result<Option<Self>, CacheError> {
        let file = match File::open( path ) {
            Ok( file ) => file,
            Err( e ) if e.kind() == ErrorKind::NotFound => return Ok( None ),
            Err( e ) => {
                tracing::error!( "{}: cannot open metadata cache: {}", path.display(), e );
                return Err( CacheError::Io( e ) );
            }
        };

        let mut cache = Self {
            reader: BufReader::new( file ),
            version: 0,
        };

        cache.version = cache.read_number()?;
        tracing::info!( "reading metadata cache version {}", cache.version );

        if cache.version > CACHE_VERSION {
            tracing::error!( "unsupported metadata cache version {}", cache.version );
            return Err( CacheError::UnsupportedVersion( cache.version ) );
        }

        Ok( Some( cache ) )
    }


    /// Reads the next snapshot.
    ///
    /// Any failure, including a clean end of data, means the entry is
    /// unusable and ends the load loop.
    pub fn read_entry( &mut self ) -> Result<CacheEntry, CacheError> {
        let path = PathBuf::from( self.read_field()? );
        let metadata = TrackMetadata {
            artist: self.read_string()?,
            album: self.read_string()?,
            albumartist: self.read_string()?,
            comment: self.read_string()?,
            date: self.read_string()?,
            discnumber: self.read_string()?,
            disctotal: self.read_string()?,
            tracknumber: self.read_string()?,
            tracktotal: self.read_string()?,
            title: self.read_string()?,
            duration: self.read_number()?,
            genre: self.read_string()?,
        };

        Ok( CacheEntry { path, metadata } )
    }


    /// Reads one NUL-terminated field.
    fn read_field( &mut self ) -> Result<String, CacheError> {
        let mut field = Vec::new();
        let n = self.reader.read_until( b'\0', &mut field )?;

        // End of data, or an entry cut off without its separator.
        if n == 0 || field.pop() != Some( b'\0' ) {
            return Err( CacheError::Truncated );
        }

        Ok( String::from_utf8_lossy( &field ).into_owned() )
    }


    fn read_string( &mut self ) -> Result<Option<String>, CacheError> {
        let field = self.read_field()?;
        Ok( if field.is_empty() { None } else { Some( field ) } )
    }


    fn read_number( &mut self ) -> Result<u32, CacheError> {
        let field = self.read_field()?;
        field.parse().map_err( |_| {
            tracing::error!( "{}: invalid number in metadata cache", field );
            CacheError::BadNumber( field )
        } )
    }
}


/// Write half of the cache. The previous contents are replaced; a flush is
/// always a full rewrite.
pub struct CacheWriter {
    writer: BufWriter<File>,
}


impl CacheWriter {
    /// Creates (or truncates) the cache file and writes the version header.
    pub fn open( path: &Path ) -> Result<Self, CacheError> {
        let file = File::create( path ).map_err( |e| {
            tracing::error!( "{}: cannot open metadata cache: {}", path.display(), e );
            e
        } )?;

        tracing::info!( "writing metadata cache version {}", CACHE_VERSION );

        let mut cache = Self { writer: BufWriter::new( file ) };
        cache.write_number( CACHE_VERSION )?;
        Ok( cache )
    }


    /// Writes one snapshot. Field order must mirror [`CacheReader::read_entry`].
    pub fn write_entry( &mut self, entry: &CacheEntry ) -> Result<(), CacheError> {
        self.write_field( entry.path.to_string_lossy().as_bytes() )?;

        let meta = &entry.metadata;
        self.write_string( &meta.artist )?;
        self.write_string( &meta.album )?;
        self.write_string( &meta.albumartist )?;
        self.write_string( &meta.comment )?;
        self.write_string( &meta.date )?;
        self.write_string( &meta.discnumber )?;
        self.write_string( &meta.disctotal )?;
        self.write_string( &meta.tracknumber )?;
        self.write_string( &meta.tracktotal )?;
        self.write_string( &meta.title )?;
        self.write_number( meta.duration )?;
        self.write_string( &meta.genre )?;

        Ok(())
    }


    /// Flushes and closes the cache file.
    pub fn close( mut self ) -> Result<(), CacheError> {
        self.writer.flush()?;
        Ok(())
    }


    /// Writes one NUL-terminated field. Embedded NULs would shift the
    /// framing of every following field, so they are stripped.
    fn write_field( &mut self, field: &[u8] ) -> Result<(), CacheError> {
        for chunk in field.split( |b| *b == b'\0' ) {
            self.writer.write_all( chunk )?;
        }
        self.writer.write_all( b"\0" )?;
        Ok(())
    }


    fn write_string( &mut self, field: &Option<String> ) -> Result<(), CacheError> {
        self.write_field( field.as_deref().unwrap_or( "" ).as_bytes() )
    }


    fn write_number( &mut self, number: u32 ) -> Result<(), CacheError> {
        self.write_field( number.to_string().as_bytes() )
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    use std::fs;


    fn entry( path: &str, artist: Option<&str>, tracknumber: Option<&str>, duration: u32 ) -> CacheEntry {
        CacheEntry {
            path: PathBuf::from( path ),
            metadata: TrackMetadata {
                artist: artist.map( str::to_string ),
                tracknumber: tracknumber.map( str::to_string ),
                duration,
                ..TrackMetadata::default()
            },
        }
    }


    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "metadata" );

        let first = entry( "/m/a.flac", Some( "Arctic" ), Some( "3" ), 185 );
        let second = entry( "/m/b.flac", None, None, 0 );

        let mut writer = CacheWriter::open( &path ).unwrap();
        writer.write_entry( &first ).unwrap();
        writer.write_entry( &second ).unwrap();
        writer.close().unwrap();

        let mut reader = CacheReader::open( &path ).unwrap().unwrap();
        assert_eq!( reader.read_entry().unwrap(), first );
        assert_eq!( reader.read_entry().unwrap(), second );
        assert!( reader.read_entry().is_err() );
    }


    #[test]
    fn test_embedded_nul_does_not_break_framing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "metadata" );

        // Tag values are arbitrary strings and may carry a NUL.
        let first = entry( "/m/a.flac", Some( "AB\0CD" ), Some( "3" ), 185 );
        let second = entry( "/m/b.flac", Some( "Arctic" ), None, 10 );

        let mut writer = CacheWriter::open( &path ).unwrap();
        writer.write_entry( &first ).unwrap();
        writer.write_entry( &second ).unwrap();
        writer.close().unwrap();

        let mut reader = CacheReader::open( &path ).unwrap().unwrap();
        let got = reader.read_entry().unwrap();
        assert_eq!( got.path, first.path );
        assert_eq!( got.metadata.artist.as_deref(), Some( "ABCD" ) );
        assert_eq!( got.metadata.tracknumber.as_deref(), Some( "3" ) );
        assert_eq!( got.metadata.duration, 185 );
        assert_eq!( reader.read_entry().unwrap(), second );
    }


    #[test]
    fn test_missing_file_is_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let reader = CacheReader::open( &dir.path().join( "missing" ) ).unwrap();
        assert!( reader.is_none() );
    }


    #[test]
    fn test_truncated_entry_stops_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "metadata" );

        let mut writer = CacheWriter::open( &path ).unwrap();
        writer.write_entry( &entry( "/m/a.flac", Some( "Arctic" ), None, 10 ) ).unwrap();
        writer.close().unwrap();

        // Cut the last entry short.
        let bytes = fs::read( &path ).unwrap();
        fs::write( &path, &bytes[ ..bytes.len() - 4 ] ).unwrap();

        let mut reader = CacheReader::open( &path ).unwrap().unwrap();
        assert!( matches!( reader.read_entry(), Err( CacheError::Truncated ) ) );
    }


    #[test]
    fn test_newer_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "metadata" );
        fs::write( &path, b"99\0" ).unwrap();

        assert!( matches!(
            CacheReader::open( &path ),
            Err( CacheError::UnsupportedVersion( 99 ) )
        ) );
    }


    #[test]
    fn test_bad_duration_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "metadata" );
        fs::write( &path, b"1\0/m/a.flac\0\0\0\0\0\0\0\0\0\0\0not-a-number\0\0" ).unwrap();

        let mut reader = CacheReader::open( &path ).unwrap().unwrap();
        assert!( matches!( reader.read_entry(), Err( CacheError::BadNumber( _ ) ) ) );
    }
}
