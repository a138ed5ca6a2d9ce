//! avplay: plays a media file through the `av-pipeline` track processors.
//!
//! ## Pipeline
//! 1. **Read**: a reader thread demuxes the file (Symphonia) into per-track packet queues.
//! 2. **Decode**: each track's decode loop decodes and resamples (Rubato) one frame at a time.
//! 3. **Playback**: the CPAL callback takes the ready frame, or plays silence when none is ready.
//!
//! Ctrl-C requests a cooperative shutdown: the reader stops and every decode loop is closed
//! within its retry budget.

mod cli;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use av_pipeline::audio::AudioTrackProcessor;
use av_pipeline::decode::{SymphoniaDecoder, SymphoniaSource};
use av_pipeline::device;
use av_pipeline::packet::TrackKind;
use av_pipeline::pipeline::{Pipeline, PlaybackEnd};
use av_pipeline::playback::{PlaybackConfig, build_output_stream};
use av_pipeline::resample::RubatoResampler;
use clap::Parser;
use cpal::traits::{DeviceTrait, StreamTrait};
use tracing_subscriber::EnvFilter;

/// Time left for the device to play the last chunk before teardown.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,avplay=info,av_pipeline=info")
        }))
        .init();
    let host = cpal::default_host();

    match &args.cmd {
        cli::Command::ListDevices => {
            for d in device::list_devices(&host)? {
                let marker = if d.is_default { " (default)" } else { "" };
                match d.rates {
                    Some((min, max)) => println!("#{}: {}{marker} [{min}-{max} Hz]", d.index, d.name),
                    None => println!("#{}: {}{marker}", d.index, d.name),
                }
            }
        }
        cli::Command::Play { path } => {
            let cancel = Arc::new(AtomicBool::new(false));
            let cancel_for_signal = cancel.clone();
            let _ = ctrlc::set_handler(move || {
                cancel_for_signal.store(true, Ordering::Relaxed);
            });

            let device = device::pick_device(&host, args.device.as_deref())?;
            tracing::info!(device = %device.description()?, "output device");
            play_file(&device, &args, path, &cancel)?;
        }
    }

    Ok(())
}

fn play_file(device: &cpal::Device, args: &cli::Args, path: &Path, cancel: &AtomicBool) -> Result<()> {
    let config = args.pipeline_config();
    tracing::debug!(?config, "pipeline config");
    let source = SymphoniaSource::open(path)?;
    let track = source
        .default_audio_track()
        .cloned()
        .ok_or_else(|| anyhow!("no playable audio track in {:?}", path))?;
    let src_rate = track
        .sample_rate
        .ok_or_else(|| anyhow!("unknown sample rate"))?;
    let channels = track.channels.ok_or_else(|| anyhow!("unknown channel layout"))?;
    tracing::info!(
        track = %track.id,
        codec = track.codec.as_deref().unwrap_or("unknown"),
        channels,
        rate_hz = src_rate,
        duration_ms = ?track.duration_ms,
        "source"
    );

    let out_config = device::pick_output_config(device, Some(src_rate))?;
    let mut stream_config: cpal::StreamConfig = out_config.clone().into();
    let mut chunk_frames = 0;
    if let Some(buf) = device::pick_buffer_size(&out_config, args.chunk_frames) {
        if let cpal::BufferSize::Fixed(frames) = buf {
            chunk_frames = frames as usize;
        }
        stream_config.buffer_size = buf;
    }
    tracing::info!(
        rate_hz = stream_config.sample_rate,
        channels = stream_config.channels,
        format = ?out_config.sample_format(),
        chunk_frames,
        "output stream"
    );

    let decoder = SymphoniaDecoder::new(&track.codec_params)?;
    let resampler = RubatoResampler::new(src_rate, stream_config.sample_rate, channels);
    let audio = Arc::new(AudioTrackProcessor::new(
        track.time_base,
        &config,
        decoder,
        resampler,
    ));

    let played_frames = Arc::new(AtomicU64::new(0));
    let stream = build_output_stream(
        device,
        &stream_config,
        out_config.sample_format(),
        audio.clone(),
        PlaybackConfig {
            chunk_frames,
            paused: None,
            played_frames: Some(played_frames.clone()),
        },
    )?;

    let mut pipeline = Pipeline::new(config).with_audio(track.id, audio.clone());
    pipeline.start(Box::new(source))?;
    stream.play().context("start output stream")?;

    let end = pipeline.wait_until_finished_or_cancel(cancel);
    let audio_played_out = match &end {
        PlaybackEnd::Finished => true,
        PlaybackEnd::Failed { finished, .. } => finished.contains(&TrackKind::Audio),
        PlaybackEnd::Cancelled => false,
    };
    if audio_played_out {
        std::thread::sleep(DRAIN_GRACE);
    }
    drop(stream);

    let status = pipeline.status();
    let report = pipeline.shutdown();
    tracing::info!(
        played_frames = played_frames.load(Ordering::Relaxed),
        clock_ms = audio.clock_ms(),
        starved = status.audio.as_ref().map(|a| a.starved_events).unwrap_or(0),
        size_mismatches = audio.size_mismatches(),
        clean = report.is_clean(),
        "playback ended: {end:?}"
    );

    match end {
        PlaybackEnd::Failed { failures, .. } => {
            let reasons: Vec<String> = failures.iter().map(ToString::to_string).collect();
            Err(anyhow!(reasons.join("; ")))
        }
        PlaybackEnd::Finished | PlaybackEnd::Cancelled => Ok(()),
    }
}

