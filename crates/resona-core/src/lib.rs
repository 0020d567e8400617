//! Resona Core - Track metadata and decode engine
//!
//! This crate provides the metadata core of an audio player: a persistent
//! track index with a metadata cache, the input plugin contract with two
//! reference decoders, and the output plugin contract with a PCM device
//! backend.

pub mod cache;
pub mod index;
pub mod ip;
pub mod op;
pub mod plugin;
pub mod track;

pub use cache::{ CacheEntry, CacheError, CacheReader, CacheWriter };
pub use index::{ IndexError, TrackIndex };
pub use ip::{ ContainerInput, GenericInput };
pub use op::PcmOutput;
pub use plugin::{
    ByteOrder, DecodeSession, InputError, InputPlugin, OutputError, OutputPlugin,
    PluginRegistry, SampleFormat,
};
pub use track::{ Track, TrackMetadata, TrackStatus };
