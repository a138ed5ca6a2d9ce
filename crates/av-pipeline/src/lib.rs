//! Real-time audio/video playback pipeline.
//!
//! A [`reader::PacketReader`] thread demultiplexes a [`engine::PacketSource`] into per-track
//! bounded queues. Each track runs its own decode loop ([`track::TrackProcessor`]) that hands
//! one finished frame at a time to its consumer: the audio device callback for
//! [`audio::AudioTrackProcessor`], the [`sync::VideoRefresh`] loop for
//! [`video::VideoTrackProcessor`]. The audio clock is the master; video is skipped or sped
//! up to stay within the drift threshold.

pub mod audio;
pub mod config;
pub mod decode;
pub mod device;
pub mod engine;
pub mod packet;
pub mod pipeline;
pub mod playback;
pub mod queue;
pub mod reader;
pub mod resample;
pub mod status;
pub mod sync;
pub mod track;
pub mod video;

mod throttle;

#[cfg(test)]
mod test_support;
