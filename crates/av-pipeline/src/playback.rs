//! CPAL output stream driven by an [`AudioTrackProcessor`].
//!
//! The callback:
//! - pulls whole resampled chunks through `consume_audio` into a callback-owned staging buffer
//! - writes silence for the rest of the callback when no chunk is ready
//! - applies basic channel mapping (mono/stereo, best-effort otherwise)
//! - converts `f32` samples to the device sample format

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::audio::AudioTrackProcessor;

/// Options for the output callback.
#[derive(Clone, Debug, Default)]
pub struct PlaybackConfig {
    /// Expected resampled chunk size in frames, used as the `consume_audio` request.
    ///
    /// Usually the fixed device buffer size; `0` means "one callback buffer".
    pub chunk_frames: usize,

    /// When set and `true`, the callback outputs silence and does not consume frames.
    pub paused: Option<Arc<AtomicBool>>,

    /// When set, the callback increments this by the number of output frames produced.
    pub played_frames: Option<Arc<AtomicU64>>,
}

/// Build a CPAL output stream playing `audio`.
///
/// The processor's output rate must match `config.sample_rate`.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    audio: Arc<AudioTrackProcessor>,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream> {
    let spec = audio.output_spec();
    if spec.sample_rate != config.sample_rate {
        return Err(anyhow!(
            "audio track produces {} Hz but the stream runs at {} Hz",
            spec.sample_rate,
            config.sample_rate
        ));
    }
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, audio, cfg),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, audio, cfg),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, audio, cfg),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, audio, cfg),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    audio: Arc<AudioTrackProcessor>,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = (config.channels as usize).max(1);
    let mut state = PlaybackState {
        pos: 0,
        src_channels: audio.output_spec().channels.max(1),
        src: Vec::new(),
    };
    let chunk_frames = cfg.chunk_frames;
    let PlaybackConfig {
        paused,
        played_frames,
        ..
    } = cfg;

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if paused.as_ref().is_some_and(|p| p.load(Ordering::Relaxed)) {
                    data.fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
                    return;
                }

                let frames = data.len() / channels_out;
                for frame in 0..frames {
                    if state.pos >= state.src.len() {
                        state.refill(&audio, chunk_frames, frames - frame);
                    }
                    for ch in 0..channels_out {
                        let sample = next_sample_mapped(&mut state, channels_out, ch);
                        data[frame * channels_out + ch] =
                            <T as cpal::Sample>::from_sample::<f32>(sample);
                    }
                }

                if let Some(counter) = &played_frames {
                    counter.fetch_add(frames as u64, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )
        .context("build output stream")?;

    Ok(stream)
}

/// Staging buffer owned by the output callback.
struct PlaybackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

impl PlaybackState {
    /// Replace the drained staging buffer with the next chunk.
    ///
    /// When nothing is ready the request covers only the rest of this callback, so
    /// silence never delays a chunk that arrives before the next callback.
    fn refill(&mut self, audio: &AudioTrackProcessor, chunk_frames: usize, frames_left: usize) {
        self.pos = 0;
        let wanted_frames = if audio.is_frame_ready() && chunk_frames > 0 {
            chunk_frames
        } else {
            frames_left
        };
        audio.consume_audio(&mut self.src, wanted_frames * self.src_channels);
    }
}

/// Read one output sample for `dst_ch`, applying a simple channel mapping.
///
/// - mono to stereo: duplicate channel 0
/// - stereo to mono: average L/R
/// - other layouts: clamp to the available channels
///
/// `st.pos` advances once per destination frame (after the last channel).
fn next_sample_mapped(st: &mut PlaybackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &PlaybackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, _) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels - 1), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}
