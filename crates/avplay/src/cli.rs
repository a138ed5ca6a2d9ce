use std::path::PathBuf;
use std::time::Duration;

use av_pipeline::config::PipelineConfig;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "avplay", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Packets a track may queue before the reader stops feeding it
    #[arg(long, default_value_t = 10)]
    pub watermark: usize,

    /// Audio/video drift (ms) tolerated before the video cadence is corrected
    #[arg(long, default_value_t = 30)]
    pub drift_threshold_ms: u64,

    /// Wake/check rounds when closing a decode loop
    #[arg(long, default_value_t = 5)]
    pub close_attempts: u32,

    /// Delay between close rounds (ms)
    #[arg(long, default_value_t = 20)]
    pub close_retry_ms: u64,

    /// Reader sleep when every track queue is full (ms)
    #[arg(long, default_value_t = 15)]
    pub reader_poll_ms: u64,

    /// Preferred output callback size in frames
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: u32,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a local media file
    Play {
        /// Path to the media file
        path: PathBuf,
    },

    /// List output devices and exit
    ListDevices,
}

impl Args {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            packet_high_watermark: self.watermark,
            reader_poll_interval: Duration::from_millis(self.reader_poll_ms),
            close_attempts: self.close_attempts,
            close_retry_interval: Duration::from_millis(self.close_retry_ms),
            drift_threshold_ms: self.drift_threshold_ms,
            ..PipelineConfig::default()
        }
        .sanitized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_defaults() {
        let args = Args::parse_from(["avplay", "play", "clip.flac"]);
        let cfg = args.pipeline_config();
        let defaults = PipelineConfig::default();
        assert_eq!(cfg.packet_high_watermark, defaults.packet_high_watermark);
        assert_eq!(cfg.reader_poll_interval, defaults.reader_poll_interval);
        assert_eq!(cfg.close_attempts, defaults.close_attempts);
        assert_eq!(cfg.close_retry_interval, defaults.close_retry_interval);
        assert_eq!(cfg.drift_threshold_ms, defaults.drift_threshold_ms);
        assert!(matches!(args.cmd, Command::Play { .. }));
    }

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "avplay",
            "--watermark",
            "3",
            "--drift-threshold-ms",
            "50",
            "--close-retry-ms",
            "5",
            "list-devices",
        ]);
        let cfg = args.pipeline_config();
        assert_eq!(cfg.packet_high_watermark, 3);
        assert_eq!(cfg.drift_threshold_ms, 50);
        assert_eq!(cfg.close_retry_interval, Duration::from_millis(5));
        assert!(matches!(args.cmd, Command::ListDevices));
    }

    #[test]
    fn zero_watermark_falls_back_to_default() {
        let args = Args::parse_from(["avplay", "--watermark", "0", "list-devices"]);
        assert_eq!(args.pipeline_config().packet_high_watermark, 10);
    }
}
