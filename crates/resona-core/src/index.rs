//! Track index
//!
//! The process-wide store of tracks, unique by normalized path. Owns every
//! track entity, mediates creation and lookup, runs bulk metadata refreshes
//! and keeps the metadata cache in sync. Entries are never individually
//! freed; removal from display views elsewhere does not touch the index.

use std::collections::btree_map::{ BTreeMap, Entry };
use std::path::{ Component, Path, PathBuf };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex };

use thiserror::Error;

use crate::cache::{ CacheEntry, CacheError, CacheReader, CacheWriter };
use crate::plugin::{ InputPlugin, PluginRegistry };
use crate::track::{ Track, TrackMetadata, TrackStatus };


/// Errors that can occur with index operations.
#[derive( Debug, Error )]
pub enum IndexError {
    #[error( "{0}: Unsupported file format" )]
    UnsupportedFormat( PathBuf ),

    #[error( "{0}: track already in index" )]
    DuplicateEntry( PathBuf ),

    #[error( transparent )]
    Cache( #[from] CacheError ),
}


/// The process-wide track store.
///
/// Initialized once at startup with [`TrackIndex::load_from_cache`] and torn
/// down once with [`TrackIndex::shutdown`]. Structural mutation (insert) is
/// expected from a single maintenance context; metadata reads may happen
/// concurrently with a refresh pass under the per-track metadata lock.
pub struct TrackIndex {
    registry: Arc<PluginRegistry>,
    cache_path: PathBuf,
    entries: Mutex<BTreeMap<PathBuf, Arc<Track>>>,
    dirty: AtomicBool,
}


impl TrackIndex {
    pub fn new( registry: Arc<PluginRegistry>, cache_path: PathBuf ) -> Self {
        Self {
            registry,
            cache_path,
            entries: Mutex::new( BTreeMap::new() ),
            dirty: AtomicBool::new( false ),
        }
    }


    /// Default location of the metadata cache file.
    pub fn default_cache_path() -> Option<PathBuf> {
        dirs::data_local_dir().map( |d| d.join( "resona" ).join( "metadata" ) )
    }


    /// Number of entries resident in the index, tombstoned ones included.
    pub fn len( &self ) -> usize {
        self.entries.lock().unwrap().len()
    }


    pub fn is_empty( &self ) -> bool {
        self.entries.lock().unwrap().is_empty()
    }


    /// Whether the index has unsaved changes.
    pub fn is_dirty( &self ) -> bool {
        self.dirty.load( Ordering::Relaxed )
    }


    /// Looks up an existing entry without creating one.
    pub fn get( &self, path: &Path ) -> Option<Arc<Track>> {
        let path = normalize_path( path );
        self.entries.lock().unwrap().get( &path ).cloned()
    }


    /// Returns the entry for `path`, creating it if necessary.
    ///
    /// An entry without a resolvable plugin fails with
    /// [`IndexError::UnsupportedFormat`]. A new entry resolves its plugin
    /// eagerly (`explicit` wins over the registry) and fetches its metadata
    /// before insertion; a fetch failure is logged and leaves the fields at
    /// their defaults.
    pub fn get_or_create(
        &self,
        path: &Path,
        explicit: Option<Arc<dyn InputPlugin>>,
    ) -> Result<Arc<Track>, IndexError> {
        let path = normalize_path( path );

        if let Some( track ) = self.entries.lock().unwrap().get( &path ).cloned() {
            return if track.ensure_plugin( explicit, &self.registry ).is_some() {
                Ok( track )
            } else {
                Err( IndexError::UnsupportedFormat( path ) )
            };
        }

        let plugin = explicit
            .or_else( || self.registry.resolve_input( &path ) )
            .ok_or_else( || IndexError::UnsupportedFormat( path.clone() ) )?;

        self.add_new_entry( path, Some( plugin ) )
    }


    /// Like [`TrackIndex::get_or_create`], but tolerates an unresolved plugin
    /// at creation time; resolution is deferred to first real use.
    ///
    /// Used when a path's format is not yet relevant, e.g. for entries that
    /// are only pending a metadata refresh.
    pub fn get_or_create_lazy( &self, path: &Path ) -> Result<Arc<Track>, IndexError> {
        let path = normalize_path( path );

        if let Some( track ) = self.entries.lock().unwrap().get( &path ).cloned() {
            return Ok( track );
        }

        let plugin = self.registry.resolve_input( &path );
        self.add_new_entry( path, plugin )
    }


    /// Constructs, metadata-fetches and inserts a new entry, marking the
    /// index dirty.
    fn add_new_entry(
        &self,
        path: PathBuf,
        plugin: Option<Arc<dyn InputPlugin>>,
    ) -> Result<Arc<Track>, IndexError> {
        let track = Arc::new( Track::new( path, plugin.clone() ) );

        if let Some( plugin ) = plugin {
            let mut metadata = track.lock_metadata();
            if let Err( e ) = plugin.read_metadata( track.path(), &mut metadata ) {
                tracing::warn!( "{}: {}", track.path().display(), e );
            }
        }

        self.insert( Arc::clone( &track ) )?;
        self.dirty.store( true, Ordering::Relaxed );
        Ok( track )
    }


    /// Inserts an entry. A duplicate path should never happen; it is logged
    /// and the insert aborted, leaving the original entry in place.
    fn insert( &self, track: Arc<Track> ) -> Result<(), IndexError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.entry( track.path().to_path_buf() ) {
            Entry::Occupied( _ ) => {
                tracing::error!( "{}: track already in index", track.path().display() );
                Err( IndexError::DuplicateEntry( track.path().to_path_buf() ) )
            }
            Entry::Vacant( slot ) => {
                slot.insert( track );
                Ok(())
            }
        }
    }


    /// Re-fetches the metadata of every entry, in index order.
    ///
    /// Entries whose file is no longer reachable are tombstoned when
    /// `remove_missing` is set and skipped otherwise. Entries without a
    /// resolvable plugin are logged and skipped. The index is marked dirty
    /// unconditionally at the end of the pass: a full cache rewrite is cheap
    /// and idempotent, so precise change detection is not attempted.
    pub fn refresh_all( &self, remove_missing: bool ) {
        let tracks: Vec<Arc<Track>> = self.entries.lock().unwrap().values().cloned().collect();
        let total = tracks.len();

        for ( i, track ) in tracks.iter().enumerate() {
            tracing::info!(
                "updating track {} of {} ({}%)",
                i + 1,
                total,
                100 * ( i + 1 ) / total
            );

            if !track.path().exists() {
                if remove_missing {
                    track.tombstone();
                }
                continue;
            }

            let Some( plugin ) = track.ensure_plugin( None, &self.registry ) else {
                tracing::error!( "{}: no input plugin found", track.path().display() );
                continue;
            };

            let mut metadata = track.lock_metadata();
            *metadata = TrackMetadata::default();
            if let Err( e ) = plugin.read_metadata( track.path(), &mut metadata ) {
                tracing::warn!( "{}: {}", track.path().display(), e );
            }
        }

        self.dirty.store( true, Ordering::Relaxed );
    }


    /// Writes every non-tombstoned entry to the cache, in index order, and
    /// clears the dirty flag. Idempotent.
    pub fn flush_to_cache( &self ) -> Result<(), IndexError> {
        if let Some( parent ) = self.cache_path.parent() {
            std::fs::create_dir_all( parent ).map_err( CacheError::Io )?;
        }

        let mut writer = CacheWriter::open( &self.cache_path )?;

        let tracks: Vec<Arc<Track>> = self.entries.lock().unwrap().values().cloned().collect();
        for track in tracks {
            if track.status() == TrackStatus::Tombstoned {
                continue;
            }
            let entry = CacheEntry {
                path: track.path().to_path_buf(),
                metadata: track.lock_metadata().clone(),
            };
            writer.write_entry( &entry )?;
        }

        writer.close()?;
        self.dirty.store( false, Ordering::Relaxed );
        Ok(())
    }


    /// Loads cached snapshots into the index, once at startup.
    ///
    /// Snapshots are read until one fails: end of data and corruption are
    /// indistinguishable and both stop the loop, discarding the failed entry.
    /// Plugins are left unresolved. A missing cache file just means an empty
    /// index.
    pub fn load_from_cache( &self ) -> Result<(), IndexError> {
        let Some( mut reader ) = CacheReader::open( &self.cache_path )? else {
            return Ok(());
        };

        loop {
            let entry = match reader.read_entry() {
                Ok( entry ) => entry,
                Err( e ) => {
                    tracing::debug!( "end of metadata cache: {}", e );
                    break;
                }
            };

            let track = Arc::new( Track::new( entry.path, None ) );
            *track.lock_metadata() = entry.metadata;

            // Defensive: a duplicate in the cache file is discarded.
            let _ = self.insert( track );
        }

        Ok(())
    }


    /// Flushes unsaved changes and releases every entry.
    pub fn shutdown( &self ) -> Result<(), IndexError> {
        if self.is_dirty() {
            self.flush_to_cache()?;
        }
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}


/// Lexically normalizes a path so equivalent spellings map to one index key.
///
/// Removes `.` components and redundant separators. `..` components are kept
/// as-is: resolving them needs the filesystem and lookup keys must be stable
/// whether or not the file currently exists.
fn normalize_path( path: &Path ) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            other => normalized.push( other ),
        }
    }
    normalized
}


#[cfg( test )]
mod tests {
    use super::*;

    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    use crate::plugin::{ DecodeSession, InputError, SampleFormat };


    /// Counts metadata fetches so tests can assert the cache is trusted.
    struct StubPlugin {
        extensions: &'static [&'static str],
        metadata_calls: AtomicUsize,
    }


    impl StubPlugin {
        fn new( extensions: &'static [&'static str] ) -> Arc<Self> {
            Arc::new( Self {
                extensions,
                metadata_calls: AtomicUsize::new( 0 ),
            } )
        }
    }


    impl InputPlugin for StubPlugin {
        fn name( &self ) -> &'static str {
            "stub"
        }

        fn priority( &self ) -> u32 {
            0
        }

        fn extensions( &self ) -> &'static [&'static str] {
            self.extensions
        }

        fn open( &self, _path: &Path ) -> Result<( Box<dyn DecodeSession>, SampleFormat ), InputError> {
            Err( InputError::NoSupportedStream )
        }

        fn read_metadata( &self, _path: &Path, metadata: &mut TrackMetadata ) -> Result<(), InputError> {
            self.metadata_calls.fetch_add( 1, Ordering::Relaxed );
            metadata.artist = Some( "Arctic".to_string() );
            metadata.tracknumber = Some( "3".to_string() );
            metadata.duration = 185;
            Ok(())
        }
    }


    fn index_with_stub( cache_path: PathBuf ) -> ( TrackIndex, Arc<StubPlugin> ) {
        let stub = StubPlugin::new( &[ "flac" ] );
        let mut registry = PluginRegistry::new();
        registry.register_input( stub.clone() );
        ( TrackIndex::new( Arc::new( registry ), cache_path ), stub )
    }


    #[test]
    fn test_get_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ( index, stub ) = index_with_stub( dir.path().join( "metadata" ) );

        let first = index.get_or_create( Path::new( "/m/a.flac" ), None ).unwrap();
        let second = index.get_or_create( Path::new( "/m/a.flac" ), None ).unwrap();

        assert!( Arc::ptr_eq( &first, &second ) );
        assert_eq!( index.len(), 1 );
        assert_eq!( stub.metadata_calls.load( Ordering::Relaxed ), 1 );
    }


    #[test]
    fn test_get_or_create_normalizes_path() {
        let dir = tempfile::tempdir().unwrap();
        let ( index, _stub ) = index_with_stub( dir.path().join( "metadata" ) );

        let first = index.get_or_create( Path::new( "/m/a.flac" ), None ).unwrap();
        let second = index.get_or_create( Path::new( "/m/./a.flac" ), None ).unwrap();

        assert!( Arc::ptr_eq( &first, &second ) );
        assert_eq!( index.len(), 1 );
    }


    #[test]
    fn test_get_or_create_unsupported_format() {
        let dir = tempfile::tempdir().unwrap();
        let ( index, _stub ) = index_with_stub( dir.path().join( "metadata" ) );

        let result = index.get_or_create( Path::new( "/m/a.mid" ), None );
        assert!( matches!( result, Err( IndexError::UnsupportedFormat( _ ) ) ) );
        assert_eq!( index.len(), 0 );
    }


    #[test]
    fn test_lazy_creation_tolerates_unresolved_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let ( index, stub ) = index_with_stub( dir.path().join( "metadata" ) );

        let track = index.get_or_create_lazy( Path::new( "/m/a.mid" ) ).unwrap();
        assert!( track.plugin().is_none() );
        assert_eq!( stub.metadata_calls.load( Ordering::Relaxed ), 0 );
        assert_eq!( index.len(), 1 );

        // Eager lookup of the same entry still fails to resolve.
        let result = index.get_or_create( Path::new( "/m/a.mid" ), None );
        assert!( matches!( result, Err( IndexError::UnsupportedFormat( _ ) ) ) );
    }


    #[test]
    fn test_cache_round_trip_skips_refetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join( "metadata" );

        let ( index, stub ) = index_with_stub( cache_path.clone() );
        index.get_or_create( Path::new( "/m/a.flac" ), None ).unwrap();
        assert!( index.is_dirty() );
        index.flush_to_cache().unwrap();
        assert!( !index.is_dirty() );

        // A fresh index reproduces the snapshot without asking the plugin.
        let ( reloaded, stub2 ) = index_with_stub( cache_path );
        reloaded.load_from_cache().unwrap();
        assert_eq!( reloaded.len(), 1 );

        let track = reloaded.get_or_create( Path::new( "/m/a.flac" ), None ).unwrap();
        let metadata = track.lock_metadata().clone();
        assert_eq!( metadata.artist.as_deref(), Some( "Arctic" ) );
        assert_eq!( metadata.tracknumber.as_deref(), Some( "3" ) );
        assert_eq!( metadata.duration, 185 );
        assert_eq!( stub2.metadata_calls.load( Ordering::Relaxed ), 0 );
        let _ = stub;
    }


    #[test]
    fn test_tombstoned_entry_is_not_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join( "metadata" );

        let ( index, _stub ) = index_with_stub( cache_path.clone() );
        index.get_or_create( Path::new( "/m/keep.flac" ), None ).unwrap();
        let doomed = index.get_or_create( Path::new( "/m/gone.flac" ), None ).unwrap();
        doomed.tombstone();
        index.flush_to_cache().unwrap();

        // Tombstoned entries stay resident until teardown.
        assert_eq!( index.len(), 2 );

        let ( reloaded, _stub2 ) = index_with_stub( cache_path );
        reloaded.load_from_cache().unwrap();
        assert_eq!( reloaded.len(), 1 );
        assert!( reloaded.get( Path::new( "/m/keep.flac" ) ).is_some() );
        assert!( reloaded.get( Path::new( "/m/gone.flac" ) ).is_none() );
    }


    #[test]
    fn test_refresh_tombstones_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let ( index, _stub ) = index_with_stub( dir.path().join( "metadata" ) );

        // A file that exists and one that does not.
        let present = dir.path().join( "present.flac" );
        fs::write( &present, b"" ).unwrap();
        index.get_or_create( &present, None ).unwrap();
        let missing = index.get_or_create( Path::new( "/m/missing.flac" ), None ).unwrap();

        index.refresh_all( false );
        assert_eq!( missing.status(), TrackStatus::Active );

        index.refresh_all( true );
        assert_eq!( missing.status(), TrackStatus::Tombstoned );
        assert!( index.is_dirty() );
    }


    #[test]
    fn test_refresh_resets_and_refetches_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let ( index, stub ) = index_with_stub( dir.path().join( "metadata" ) );

        let path = dir.path().join( "a.flac" );
        fs::write( &path, b"" ).unwrap();
        let track = index.get_or_create( &path, None ).unwrap();
        track.lock_metadata().comment = Some( "stale".to_string() );

        index.refresh_all( false );

        let metadata = track.lock_metadata().clone();
        assert_eq!( metadata.comment, None );
        assert_eq!( metadata.artist.as_deref(), Some( "Arctic" ) );
        assert_eq!( stub.metadata_calls.load( Ordering::Relaxed ), 2 );
    }


    #[test]
    fn test_corrupt_cache_keeps_earlier_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join( "metadata" );

        let ( index, _stub ) = index_with_stub( cache_path.clone() );
        index.get_or_create( Path::new( "/m/a.flac" ), None ).unwrap();
        index.get_or_create( Path::new( "/m/b.flac" ), None ).unwrap();
        index.flush_to_cache().unwrap();

        // Chop into the second entry.
        let bytes = fs::read( &cache_path ).unwrap();
        fs::write( &cache_path, &bytes[ ..bytes.len() - 6 ] ).unwrap();

        let ( reloaded, _stub2 ) = index_with_stub( cache_path );
        reloaded.load_from_cache().unwrap();
        assert_eq!( reloaded.len(), 1 );
        assert!( reloaded.get( Path::new( "/m/a.flac" ) ).is_some() );
    }


    #[test]
    fn test_shutdown_flushes_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join( "metadata" );

        let ( index, _stub ) = index_with_stub( cache_path.clone() );
        index.get_or_create( Path::new( "/m/a.flac" ), None ).unwrap();
        index.shutdown().unwrap();
        assert_eq!( index.len(), 0 );

        let ( reloaded, _stub2 ) = index_with_stub( cache_path );
        reloaded.load_from_cache().unwrap();
        assert_eq!( reloaded.len(), 1 );
    }
}
