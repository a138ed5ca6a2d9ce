//! Rubato resampler for the audio track.
//!
//! Converts decoded interleaved `f32` PCM from the source rate to the output device rate.
//! The sinc resampler consumes fixed-size input chunks; leftover frames from one decoded
//! frame are carried into the next call, so chunk boundaries do not introduce gaps.

use anyhow::{Context, Result, bail};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::audio::{AudioResampler, AudioSpec, ResampledSize};
use crate::engine::PcmFrame;

/// Sinc resampler sized lazily from the first decoded frame.
pub struct RubatoResampler {
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    /// Built on the first frame: (resampler, input chunk in frames).
    inner: Option<(Async<f32>, usize)>,
    /// Interleaved input not yet consumed by the resampler.
    carry: Vec<f32>,
    scratch: Vec<f32>,
}

impl RubatoResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize) -> Self {
        Self {
            src_rate,
            dst_rate,
            channels: channels.max(1),
            inner: None,
            carry: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.src_rate == self.dst_rate
    }

    fn build(&self, chunk_frames: usize) -> Result<Async<f32>> {
        let f_ratio = self.dst_rate as f64 / self.src_rate as f64;

        let sinc_len = 128;
        let oversampling_factor = 256;
        let interpolation = SincInterpolationType::Cubic;
        let window = WindowFunction::BlackmanHarris2;
        let f_cutoff = calculate_cutoff(sinc_len, window);

        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff,
            interpolation,
            oversampling_factor,
            window,
        };

        tracing::debug!(
            src_rate = self.src_rate,
            dst_rate = self.dst_rate,
            chunk_frames,
            "building resampler"
        );
        Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            self.channels,
            FixedAsync::Input,
        )
        .context("resampler init")
    }

    fn output_capacity_frames(&self, chunk_frames: usize) -> usize {
        let ratio = self.dst_rate as f64 / self.src_rate as f64;
        (chunk_frames as f64 * ratio * 1.1).ceil() as usize + chunk_frames
    }
}

impl AudioResampler<PcmFrame> for RubatoResampler {
    fn output_spec(&self) -> AudioSpec {
        AudioSpec {
            sample_rate: self.dst_rate,
            channels: self.channels,
        }
    }

    fn resample(&mut self, frame: &PcmFrame, out: &mut Vec<f32>) -> Result<ResampledSize> {
        if frame.channels != self.channels {
            bail!(
                "decoded frame has {} channels, resampler expects {}",
                frame.channels,
                self.channels
            );
        }
        if frame.sample_rate != self.src_rate {
            bail!(
                "decoded frame rate {} Hz differs from stream rate {} Hz",
                frame.sample_rate,
                self.src_rate
            );
        }

        if self.is_passthrough() {
            out.extend_from_slice(&frame.samples);
            return Ok(ResampledSize::from_samples(frame.samples.len()));
        }

        let channels = self.channels;
        if self.inner.is_none() {
            let chunk_frames = frame.frames().max(1);
            let resampler = self.build(chunk_frames)?;
            self.scratch = vec![0.0f32; self.output_capacity_frames(chunk_frames) * channels];
            self.inner = Some((resampler, chunk_frames));
        }
        let Some((resampler, chunk_frames)) = self.inner.as_mut() else {
            return Ok(ResampledSize::from_samples(0));
        };
        let chunk_frames = *chunk_frames;
        let chunk_samples = chunk_frames * channels;

        self.carry.extend_from_slice(&frame.samples);

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        };

        let start = out.len();
        let mut consumed = 0;
        while self.carry.len() - consumed >= chunk_samples {
            let input = &self.carry[consumed..consumed + chunk_samples];
            let input_adapter = InterleavedSlice::new(input, channels, chunk_frames)
                .context("interleaved slice (input)")?;

            let out_capacity_frames = self.scratch.len() / channels;
            let mut output_adapter =
                InterleavedSlice::new_mut(&mut self.scratch, channels, out_capacity_frames)
                    .context("interleaved slice (output)")?;

            let (_nbr_in, nbr_out) = resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
                .context("resampler process")?;

            out.extend_from_slice(&self.scratch[..nbr_out * channels]);
            consumed += chunk_samples;
        }
        self.carry.drain(..consumed);

        Ok(ResampledSize::from_samples(out.len() - start))
    }
}
