//! Boundaries to the demuxer and the codec.
//!
//! The pipeline never looks inside packets or frames; it only drives these traits:
//! - [`PacketSource`] yields track-tagged packets until end of stream
//! - [`DecodeEngine`] performs the two-phase decode (submit input, then retrieve frames)

use anyhow::Result;

use crate::packet::{Packet, QueueItem};

/// Result of pulling from a [`PacketSource`].
#[derive(Debug)]
pub enum SourceEvent {
    Packet(Packet),
    EndOfStream,
}

/// Demultiplexed input.
pub trait PacketSource: Send {
    /// Next compressed packet in container order, or `EndOfStream`.
    fn next_packet(&mut self) -> Result<SourceEvent>;
}

/// Outcome of [`DecodeEngine::submit`].
#[derive(Debug)]
pub enum SubmitStatus {
    /// The engine took ownership of the input.
    Accepted,
    /// Internal buffers are full; ownership of the input goes back to the caller for a retry.
    BufferFull(QueueItem),
    /// The engine no longer accepts input because it has already seen end of stream.
    InputClosed,
}

/// Outcome of [`DecodeEngine::retrieve_frame`].
#[derive(Debug)]
pub enum Retrieved<F> {
    Frame(F),
    /// No frame is available until more input is submitted.
    NeedsMoreInput,
    /// Fully flushed after end of stream; no more frames will ever be produced.
    Exhausted,
}

/// A decoded, not yet finished frame.
pub trait DecodedFrame: Send + 'static {
    /// Presentation timestamp in the stream time base.
    fn pts(&self) -> Option<i64>;
}

/// Codec driven by a track's decode loop.
///
/// `Err` from either call is unrecoverable for the track.
pub trait DecodeEngine: Send + 'static {
    type Frame: DecodedFrame;

    fn submit(&mut self, input: QueueItem) -> Result<SubmitStatus>;

    fn retrieve_frame(&mut self) -> Result<Retrieved<Self::Frame>>;
}

/// Decoded interleaved PCM.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PcmFrame {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
    pub pts: Option<i64>,
}

impl PcmFrame {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

impl DecodedFrame for PcmFrame {
    fn pts(&self) -> Option<i64> {
        self.pts
    }
}
