//! Reference output plugins

pub mod pcm;

pub use pcm::PcmOutput;
