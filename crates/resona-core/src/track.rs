//! Track entity
//!
//! One playable audio resource: its metadata snapshot, its resolved input
//! plugin, and at most one live decode session. Also home to the display
//! ordering used by presentation layers.

use std::cmp::Ordering;
use std::path::{ Path, PathBuf };
use std::sync::{ Arc, Mutex, MutexGuard, RwLock };

use crate::plugin::{ DecodeSession, InputError, InputPlugin, PluginRegistry, SampleFormat };


/// Metadata fields of a track. Absent tags stay `None`.
#[derive( Debug, Clone, Default, PartialEq, Eq )]
pub struct TrackMetadata {
    pub album: Option<String>,
    pub albumartist: Option<String>,
    pub artist: Option<String>,
    pub comment: Option<String>,
    pub date: Option<String>,
    pub discnumber: Option<String>,
    pub disctotal: Option<String>,
    pub genre: Option<String>,
    pub title: Option<String>,
    pub tracknumber: Option<String>,
    pub tracktotal: Option<String>,
    /// Duration in whole seconds.
    pub duration: u32,
}


/// Persistence status of a track.
///
/// Tombstoned tracks stay resident in memory but are excluded from the next
/// cache flush.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum TrackStatus {
    #[default]
    Active,
    Tombstoned,
}


struct ActiveSession {
    session: Box<dyn DecodeSession>,
    format: SampleFormat,
}


/// One playable audio resource.
///
/// Uniquely identified by its normalized path. The input plugin reference is
/// a shared handle into the registry; many tracks reference the same plugin.
/// At most one decode session is open at any time, and the negotiated sample
/// format is only available while it is.
pub struct Track {
    path: PathBuf,
    plugin: RwLock<Option<Arc<dyn InputPlugin>>>,
    metadata: Mutex<TrackMetadata>,
    session: Mutex<Option<ActiveSession>>,
    status: Mutex<TrackStatus>,
}


impl Track {
    pub( crate ) fn new( path: PathBuf, plugin: Option<Arc<dyn InputPlugin>> ) -> Self {
        Self {
            path,
            plugin: RwLock::new( plugin ),
            metadata: Mutex::new( TrackMetadata::default() ),
            session: Mutex::new( None ),
            status: Mutex::new( TrackStatus::Active ),
        }
    }


    pub fn path( &self ) -> &Path {
        &self.path
    }


    /// The resolved input plugin, if any.
    pub fn plugin( &self ) -> Option<Arc<dyn InputPlugin>> {
        self.plugin.read().unwrap().clone()
    }


    /// Resolves the plugin if it is still unresolved, preferring `explicit`
    /// over a registry lookup, and returns it.
    pub( crate ) fn ensure_plugin(
        &self,
        explicit: Option<Arc<dyn InputPlugin>>,
        registry: &PluginRegistry,
    ) -> Option<Arc<dyn InputPlugin>> {
        let mut slot = self.plugin.write().unwrap();
        if slot.is_none() {
            *slot = explicit.or_else( || registry.resolve_input( &self.path ) );
        }
        slot.clone()
    }


    /// Locks the metadata fields and returns the guard.
    ///
    /// A refresh pass holds this lock while it resets and re-fetches the
    /// fields; readers that need a consistent multi-field snapshot must
    /// acquire it too.
    pub fn lock_metadata( &self ) -> MutexGuard<'_, TrackMetadata> {
        self.metadata.lock().unwrap()
    }


    pub fn status( &self ) -> TrackStatus {
        *self.status.lock().unwrap()
    }


    /// Marks the track excluded from future cache flushes. It stays resident
    /// in memory until index teardown.
    pub fn tombstone( &self ) {
        *self.status.lock().unwrap() = TrackStatus::Tombstoned;
    }


    /// Opens a decode session through the resolved plugin.
    ///
    /// Fails if no plugin is resolved or a session is already open. On
    /// success the negotiated sample format becomes available from
    /// [`Track::sample_format`].
    pub fn open_session( &self ) -> Result<(), InputError> {
        let plugin = self.plugin().ok_or( InputError::NoPlugin )?;

        let mut slot = self.session.lock().unwrap();
        if slot.is_some() {
            return Err( InputError::SessionOpen );
        }

        let ( session, format ) = plugin.open( &self.path )?;
        tracing::info!(
            "{}: opened: {} bit, {} channels, {} Hz",
            self.path.display(),
            format.bits,
            format.channels,
            format.rate
        );

        *slot = Some( ActiveSession { session, format } );
        Ok(())
    }


    /// Reads decoded samples from the open session. See [`DecodeSession::read`].
    pub fn read( &self, samples: &mut [i16] ) -> Result<usize, InputError> {
        let mut slot = self.session.lock().unwrap();
        let active = slot.as_mut().ok_or( InputError::NoSession )?;
        active.session.read( samples )
    }


    /// Seeks the open session. A no-op without an open session.
    pub fn seek( &self, seconds: u32 ) {
        if let Some( active ) = self.session.lock().unwrap().as_mut() {
            active.session.seek( seconds );
        }
    }


    /// Current position of the open session in whole seconds, `0` without one.
    pub fn position( &self ) -> u32 {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map( |active| active.session.position() )
            .unwrap_or( 0 )
    }


    /// Closes the open session, releasing the codec instance and buffers.
    pub fn close_session( &self ) {
        *self.session.lock().unwrap() = None;
    }


    /// The sample format negotiated by the open session, if any.
    pub fn sample_format( &self ) -> Option<SampleFormat> {
        self.session.lock().unwrap().as_ref().map( |active| active.format )
    }


    /// Total order used by presentation layers for sorted displays.
    ///
    /// Compares artist, date, album, disc number, track number and title,
    /// with the path as the final tie-break. Dates and disc/track numbers
    /// compare numerically when both sides parse as non-negative integers.
    pub fn display_cmp( &self, other: &Track ) -> Ordering {
        let a = self.lock_metadata().clone();
        let b = other.lock_metadata().clone();

        cmp_string( a.artist.as_deref(), b.artist.as_deref() )
            .then_with( || cmp_number( a.date.as_deref(), b.date.as_deref() ) )
            .then_with( || cmp_string( a.album.as_deref(), b.album.as_deref() ) )
            .then_with( || cmp_number( a.discnumber.as_deref(), b.discnumber.as_deref() ) )
            .then_with( || cmp_number( a.tracknumber.as_deref(), b.tracknumber.as_deref() ) )
            .then_with( || cmp_string( a.title.as_deref(), b.title.as_deref() ) )
            .then_with( || self.path.cmp( &other.path ) )
    }


    /// Case-insensitive substring search across the metadata fields and the
    /// path.
    pub fn matches( &self, query: &str ) -> bool {
        let query = query.to_lowercase();
        let meta = self.lock_metadata();

        let field_matches = |field: &Option<String>| {
            field
                .as_deref()
                .map( |v| v.to_lowercase().contains( &query ) )
                .unwrap_or( false )
        };

        field_matches( &meta.album )
            || field_matches( &meta.artist )
            || field_matches( &meta.date )
            || field_matches( &meta.genre )
            || field_matches( &meta.title )
            || field_matches( &meta.tracknumber )
            || self.path.to_string_lossy().to_lowercase().contains( &query )
    }
}


/// Case-insensitive string comparison; an absent value sorts before any
/// present one.
fn cmp_string( a: Option<&str>, b: Option<&str> ) -> Ordering {
    match ( a, b ) {
        ( None, None ) => Ordering::Equal,
        ( None, Some( _ ) ) => Ordering::Less,
        ( Some( _ ), None ) => Ordering::Greater,
        ( Some( a ), Some( b ) ) => a.to_lowercase().cmp( &b.to_lowercase() ),
    }
}


/// Numeric-aware comparison: both sides must parse as non-negative integers,
/// otherwise this falls back to the case-insensitive string comparison.
fn cmp_number( a: Option<&str>, b: Option<&str> ) -> Ordering {
    match ( a, b ) {
        ( Some( sa ), Some( sb ) ) => {
            match ( sa.parse::<u64>(), sb.parse::<u64>() ) {
                ( Ok( na ), Ok( nb ) ) => na.cmp( &nb ),
                _ => cmp_string( Some( sa ), Some( sb ) ),
            }
        }
        _ => cmp_string( a, b ),
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn track( path: &str, meta: TrackMetadata ) -> Track {
        let t = Track::new( PathBuf::from( path ), None );
        *t.lock_metadata() = meta;
        t
    }


    #[test]
    fn test_cmp_number_numeric() {
        assert_eq!( cmp_number( Some( "9" ), Some( "10" ) ), Ordering::Less );
        assert_eq!( cmp_number( Some( "10" ), Some( "10" ) ), Ordering::Equal );
    }


    #[test]
    fn test_cmp_number_falls_back_to_string() {
        // "9" > "10" as strings
        assert_eq!( cmp_number( Some( "9" ), Some( "1998-ish" ) ), Ordering::Greater );
        assert_eq!( cmp_number( Some( "unknown" ), Some( "unknown" ) ), Ordering::Equal );
    }


    #[test]
    fn test_cmp_string_absent_sorts_first() {
        assert_eq!( cmp_string( None, Some( "Zebra" ) ), Ordering::Less );
        assert_eq!( cmp_string( Some( "Zebra" ), None ), Ordering::Greater );
        assert_eq!( cmp_string( None, None ), Ordering::Equal );
    }


    #[test]
    fn test_display_cmp_absent_artist_first() {
        let a = track( "/m/a.flac", TrackMetadata::default() );
        let b = track( "/m/b.flac", TrackMetadata {
            artist: Some( "Zebra".to_string() ),
            ..TrackMetadata::default()
        } );
        assert_eq!( a.display_cmp( &b ), Ordering::Less );
        assert_eq!( b.display_cmp( &a ), Ordering::Greater );
    }


    #[test]
    fn test_display_cmp_non_numeric_date_is_deterministic() {
        let c = track( "/m/c.flac", TrackMetadata {
            artist: Some( "Same".to_string() ),
            date: Some( "unknown".to_string() ),
            ..TrackMetadata::default()
        } );
        let d = track( "/m/d.flac", TrackMetadata {
            artist: Some( "Same".to_string() ),
            date: Some( "1998".to_string() ),
            ..TrackMetadata::default()
        } );
        let first = c.display_cmp( &d );
        assert_eq!( first, c.display_cmp( &d ) );
        assert_eq!( first.reverse(), d.display_cmp( &c ) );
    }


    #[test]
    fn test_display_cmp_track_number_is_numeric() {
        let meta = |n: &str| TrackMetadata {
            artist: Some( "Same".to_string() ),
            album: Some( "Same".to_string() ),
            tracknumber: Some( n.to_string() ),
            ..TrackMetadata::default()
        };
        let a = track( "/m/a.flac", meta( "9" ) );
        let b = track( "/m/b.flac", meta( "10" ) );
        assert_eq!( a.display_cmp( &b ), Ordering::Less );
    }


    #[test]
    fn test_display_cmp_path_tie_break() {
        let a = track( "/m/a.flac", TrackMetadata::default() );
        let b = track( "/m/b.flac", TrackMetadata::default() );
        assert_eq!( a.display_cmp( &b ), Ordering::Less );
        assert_eq!( a.display_cmp( &a ), Ordering::Equal );
    }


    #[test]
    fn test_matches_searches_fields_and_path() {
        let t = track( "/music/Arctic/03.flac", TrackMetadata {
            artist: Some( "Arctic Monkeys".to_string() ),
            title: Some( "Brianstorm".to_string() ),
            ..TrackMetadata::default()
        } );
        assert!( t.matches( "arctic" ) );
        assert!( t.matches( "BRIAN" ) );
        assert!( t.matches( "03.flac" ) );
        assert!( !t.matches( "zebra" ) );
    }


    #[test]
    fn test_tombstone_status() {
        let t = track( "/m/a.flac", TrackMetadata::default() );
        assert_eq!( t.status(), TrackStatus::Active );
        t.tombstone();
        assert_eq!( t.status(), TrackStatus::Tombstoned );
    }


    #[test]
    fn test_session_ops_without_session() {
        let t = track( "/m/a.flac", TrackMetadata::default() );
        assert!( matches!( t.open_session(), Err( InputError::NoPlugin ) ) );
        assert!( matches!( t.read( &mut [0; 16] ), Err( InputError::NoSession ) ) );
        assert_eq!( t.position(), 0 );
        assert!( t.sample_format().is_none() );
    }
}
