//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices with their rate ranges
//! - selecting either the default device or a device by substring match
//! - choosing a stream config and a callback buffer size

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default device when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let Some(needle) = needle else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device"));
    };

    host.output_devices()
        .context("enumerate output devices")?
        .find(|d| {
            d.description()
                .map(|desc| matches_device_name(&desc.name(), needle))
                .unwrap_or(false)
        })
        .ok_or_else(|| anyhow!("no output device matched: {needle}"))
}

/// Pick the best supported output config for `target_rate` (usually the source rate).
///
/// Prefers the highest rate that is `<= target_rate`, then the lowest rate above it; without
/// a target the highest rate wins. Ties go to the better sample format (`F32` first).
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;

    for range in device
        .supported_output_configs()
        .context("query supported output configs")?
    {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            below_target: target_rate.is_none_or(|t| rate <= t),
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = best
            .as_ref()
            .is_none_or(|(current, _)| candidate.is_better_than(current, target_rate));
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("no supported output configs"))
}

/// Callback buffer size in frames: `preferred` clamped to what the device advertises.
///
/// Returns `None` when the device does not report a range, leaving the default in place.
pub fn pick_buffer_size(
    config: &cpal::SupportedStreamConfig,
    preferred_frames: u32,
) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed(preferred_frames.clamp(*min, (*max).max(*min))))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Output device metadata for `list-devices`.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    /// Supported rate range, when the device reports one.
    pub rates: Option<(u32, u32)>,
}

/// Describe every output device of `host`.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|desc| desc.name().to_string());

    let mut out = Vec::new();
    for (index, device) in host
        .output_devices()
        .context("enumerate output devices")?
        .enumerate()
    {
        let name = match device.description() {
            Ok(desc) => desc.name().to_string(),
            Err(e) => {
                tracing::debug!(index, "skipping device without description: {e}");
                continue;
            }
        };
        let rates = device.supported_output_configs().ok().and_then(|ranges| {
            ranges.fold(None, |acc: Option<(u32, u32)>, r| {
                let (lo, hi) = (r.min_sample_rate(), r.max_sample_rate());
                Some(acc.map_or((lo, hi), |(a, b)| (a.min(lo), b.max(hi))))
            })
        });
        out.push(DeviceInfo {
            index,
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            rates,
        });
    }
    Ok(out)
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    below_target: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, other: &Candidate, target_rate: Option<u32>) -> bool {
        if self.below_target != other.below_target {
            return self.below_target;
        }
        if self.rate != other.rate {
            // Below the target the closest (highest) rate wins; above it the lowest one.
            return if self.below_target || target_rate.is_none() {
                self.rate > other.rate
            } else {
                self.rate < other.rate
            };
        }
        self.format_rank < other.format_rank
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
