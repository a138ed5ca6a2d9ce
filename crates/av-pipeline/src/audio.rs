//! Audio variant of the track processor.
//!
//! Decoded frames are resampled into the output format by an [`AudioResampler`] and handed
//! to the device callback through [`AudioTrackProcessor::consume_audio`]. The callback side
//! never waits for data: when nothing is ready it receives silence.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;

use crate::config::PipelineConfig;
use crate::engine::DecodeEngine;
use crate::packet::{QueueItem, TimeBase, TrackKind};
use crate::throttle::WarnThrottle;
use crate::track::{FrameFinisher, PacketSink, TrackProcessor};

/// Output sample layout produced by a resampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: usize,
}

/// Size of one resampled chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResampledSize {
    /// Interleaved `f32` samples written.
    pub samples: usize,
    pub bytes: usize,
}

impl ResampledSize {
    pub fn from_samples(samples: usize) -> Self {
        Self {
            samples,
            bytes: samples * std::mem::size_of::<f32>(),
        }
    }
}

/// Converts decoded audio into the interleaved `f32` layout the output device expects.
pub trait AudioResampler<F>: Send + 'static {
    fn output_spec(&self) -> AudioSpec;

    /// Write the converted samples of `frame` into `out` (cleared by the caller).
    fn resample(&mut self, frame: &F, out: &mut Vec<f32>) -> Result<ResampledSize>;
}

/// Audio finishing step: resample, then timestamp.
///
/// Frames without a usable timestamp are placed right after the previous chunk.
/// Frames the resampler only buffered produce no chunk; their timestamp is carried to
/// the chunk that eventually contains their samples.
struct ResampleFinisher<R> {
    resampler: R,
    spec: AudioSpec,
    last_samples: usize,
    carried_pts_ms: Option<u64>,
}

impl<R> ResampleFinisher<R> {
    fn chunk_duration_ms(&self, samples: usize) -> u64 {
        let per_second = self.spec.sample_rate as u64 * self.spec.channels.max(1) as u64;
        if per_second == 0 {
            return 0;
        }
        samples as u64 * 1000 / per_second
    }
}

impl<F, R> FrameFinisher<F> for ResampleFinisher<R>
where
    R: AudioResampler<F>,
{
    type Output = Vec<f32>;

    fn finish(
        &mut self,
        frame: &F,
        stream_pts_ms: Option<u64>,
        prev_pts_ms: Option<u64>,
        out: &mut Vec<f32>,
    ) -> Result<Option<u64>> {
        out.clear();
        let size = self.resampler.resample(frame, out)?;
        let pts = stream_pts_ms.unwrap_or_else(|| match prev_pts_ms {
            Some(prev) => prev + self.chunk_duration_ms(self.last_samples),
            None => 0,
        });
        if size.samples == 0 {
            self.carried_pts_ms.get_or_insert(pts);
            return Ok(None);
        }
        self.last_samples = size.samples;
        Ok(Some(self.carried_pts_ms.take().unwrap_or(pts)))
    }
}

/// Track processor feeding a real-time audio callback.
pub struct AudioTrackProcessor {
    track: TrackProcessor<Vec<f32>>,
    spec: AudioSpec,
    mismatch_warn: WarnThrottle,
    size_mismatches: AtomicU64,
}

impl AudioTrackProcessor {
    pub fn new<E, R>(time_base: TimeBase, config: &PipelineConfig, engine: E, resampler: R) -> Self
    where
        E: DecodeEngine,
        R: AudioResampler<E::Frame>,
    {
        let spec = resampler.output_spec();
        let finisher = ResampleFinisher {
            resampler,
            spec,
            last_samples: 0,
            carried_pts_ms: None,
        };
        let track = TrackProcessor::new(TrackKind::Audio, time_base, config, engine, finisher);
        Self {
            mismatch_warn: WarnThrottle::new(track.warn_interval()),
            track,
            spec,
            size_mismatches: AtomicU64::new(0),
        }
    }

    /// Rate and channel count of the samples handed to the callback.
    pub fn output_spec(&self) -> AudioSpec {
        self.spec
    }

    /// Fill `buffer` for the output device; called from the device callback.
    ///
    /// - Ready frame: `buffer` receives the full resampled chunk (which may differ from
    ///   `requested_len`; the difference is reported, not fatal), the clock advances and the
    ///   decode loop is woken.
    /// - No ready frame: `buffer` becomes `requested_len` zeros and the clock is unchanged.
    ///
    /// Returns the number of samples now in `buffer`.
    pub fn consume_audio(&self, buffer: &mut Vec<f32>, requested_len: usize) -> usize {
        let copied = self.track.take_ready(|pcm, _pts| {
            buffer.clear();
            buffer.extend_from_slice(pcm);
            pcm.len()
        });

        match copied {
            Some(len) => {
                if len != requested_len {
                    self.size_mismatches.fetch_add(1, Ordering::Relaxed);
                    if self.mismatch_warn.allow() {
                        tracing::warn!(
                            resampled = len,
                            requested = requested_len,
                            "resampled chunk size differs from the output request"
                        );
                    }
                }
                len
            }
            None => {
                buffer.clear();
                buffer.resize(requested_len, 0.0);
                if self.track.record_starvation() {
                    tracing::warn!(
                        requested = requested_len,
                        queued = self.track.queued_packets(),
                        "audio frame not ready; writing silence"
                    );
                }
                requested_len
            }
        }
    }

    /// Number of consumed chunks whose size differed from the request.
    pub fn size_mismatches(&self) -> u64 {
        self.size_mismatches.load(Ordering::Relaxed)
    }
}

impl Deref for AudioTrackProcessor {
    type Target = TrackProcessor<Vec<f32>>;

    fn deref(&self) -> &Self::Target {
        &self.track
    }
}

impl PacketSink for AudioTrackProcessor {
    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn push_packet(&self, item: QueueItem) {
        self.track.push_packet(item)
    }

    fn needs_packet(&self) -> bool {
        self.track.needs_packet()
    }

    fn is_terminal(&self) -> bool {
        self.track.state().is_terminal()
    }
}
