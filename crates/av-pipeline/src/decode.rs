//! Symphonia-backed packet source and decode engine.
//!
//! - [`SymphoniaSource`] probes the container and yields track-tagged packets
//! - [`SymphoniaDecoder`] wraps Symphonia's one-shot `decode` into the two-phase
//!   submit/retrieve protocol, buffering at most one decoded frame

use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::engine::{
    DecodeEngine, PacketSource, PcmFrame, Retrieved, SourceEvent, SubmitStatus,
};
use crate::packet::{Packet, QueueItem, TimeBase, TrackId, TrackKind};

/// A track discovered while probing.
#[derive(Clone, Debug)]
pub struct SourceTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub time_base: TimeBase,
    pub codec_params: CodecParameters,
    pub sample_rate: Option<u32>,
    pub channels: Option<usize>,
    /// Codec name (best-effort).
    pub codec: Option<String>,
    pub duration_ms: Option<u64>,
}

impl SourceTrack {
    fn from_symphonia(track: &symphonia::core::formats::Track) -> Option<Self> {
        let params = &track.codec_params;
        // Symphonia only demuxes audio; a track without a rate is not playable here.
        let sample_rate = params.sample_rate?;
        let time_base = params
            .time_base
            .map(|tb| TimeBase::new(tb.numer, tb.denom))
            .unwrap_or(TimeBase::new(1, sample_rate));
        Some(Self {
            id: TrackId(track.id),
            kind: TrackKind::Audio,
            time_base,
            codec_params: params.clone(),
            sample_rate: Some(sample_rate),
            channels: params.channels.map(|c| c.count()),
            codec: codec_name_from_params(params),
            duration_ms: duration_ms_from_codec_params(params),
        })
    }
}

/// Demuxer over a probed Symphonia format reader.
pub struct SymphoniaSource {
    format: Box<dyn FormatReader>,
    tracks: Vec<SourceTrack>,
    default_track: Option<TrackId>,
}

impl SymphoniaSource {
    /// Probe the file at `path`, using its extension as a hint.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        Self::from_media_source(Box::new(file), hint)
    }

    /// Probe an arbitrary Symphonia [`MediaSource`] (seekable or not).
    pub fn from_media_source(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(source, Default::default());

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .context("probe media container")?;

        let format = probed.format;
        let tracks: Vec<SourceTrack> = format
            .tracks()
            .iter()
            .filter_map(SourceTrack::from_symphonia)
            .collect();
        let default_track = format.default_track().map(|t| TrackId(t.id));

        tracing::info!(
            tracks = tracks.len(),
            default = ?default_track,
            "media source opened"
        );

        Ok(Self {
            format,
            tracks,
            default_track,
        })
    }

    pub fn tracks(&self) -> &[SourceTrack] {
        &self.tracks
    }

    /// Container default track if it is audio, else the first audio track.
    pub fn default_audio_track(&self) -> Option<&SourceTrack> {
        let audio = |t: &&SourceTrack| t.kind == TrackKind::Audio;
        self.default_track
            .and_then(|id| self.tracks.iter().filter(audio).find(|t| t.id == id))
            .or_else(|| self.tracks.iter().find(audio))
    }
}

impl PacketSource for SymphoniaSource {
    fn next_packet(&mut self) -> Result<SourceEvent> {
        match self.format.next_packet() {
            Ok(packet) => {
                let track = TrackId(packet.track_id());
                let pts = i64::try_from(packet.ts()).ok();
                let duration = packet.dur();
                let mut out = Packet::new(track, pts, packet.data);
                out.duration = duration;
                Ok(SourceEvent::Packet(out))
            }
            Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                Ok(SourceEvent::EndOfStream)
            }
            Err(e) => Err(anyhow!(e).context("demux next packet")),
        }
    }
}

/// Two-phase adapter around a Symphonia decoder.
pub struct SymphoniaDecoder {
    decoder: Box<dyn Decoder>,
    ready: Option<PcmFrame>,
    sample_buf: Option<SampleBuffer<f32>>,
    draining: bool,
}

impl SymphoniaDecoder {
    pub fn new(codec_params: &CodecParameters) -> Result<Self> {
        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .context("create decoder")?;
        Ok(Self {
            decoder,
            ready: None,
            sample_buf: None,
            draining: false,
        })
    }

    fn decode(&mut self, packet: Packet) -> Result<()> {
        let ts = packet.pts.and_then(|p| u64::try_from(p).ok()).unwrap_or(0);
        let symphonia_packet = symphonia::core::formats::Packet::new_from_boxed_slice(
            packet.track.0,
            ts,
            packet.duration,
            packet.data,
        );

        let decoded = match self.decoder.decode(&symphonia_packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                tracing::warn!(pts = ?packet.pts, "dropping undecodable packet: {reason}");
                return Ok(());
            }
            Err(e) => return Err(anyhow!(e).context("decode packet")),
        };

        let frames = decoded.frames();
        if frames == 0 {
            return Ok(());
        }
        let spec = *decoded.spec();
        let needs_alloc = self
            .sample_buf
            .as_ref()
            .is_none_or(|buf| buf.capacity() < frames);
        if needs_alloc {
            self.sample_buf = Some(SampleBuffer::<f32>::new(frames as u64, spec));
        }
        let Some(sample_buf) = self.sample_buf.as_mut() else {
            return Ok(());
        };
        sample_buf.copy_interleaved_ref(decoded);

        self.ready = Some(PcmFrame {
            samples: sample_buf.samples().to_vec(),
            channels: spec.channels.count(),
            sample_rate: spec.rate,
            pts: packet.pts,
        });
        Ok(())
    }
}

impl DecodeEngine for SymphoniaDecoder {
    type Frame = PcmFrame;

    fn submit(&mut self, input: QueueItem) -> Result<SubmitStatus> {
        if self.draining {
            return Ok(SubmitStatus::InputClosed);
        }
        match input {
            QueueItem::EndMarker => {
                self.draining = true;
                Ok(SubmitStatus::Accepted)
            }
            QueueItem::Packet(packet) => {
                if self.ready.is_some() {
                    return Ok(SubmitStatus::BufferFull(QueueItem::Packet(packet)));
                }
                self.decode(packet)?;
                Ok(SubmitStatus::Accepted)
            }
        }
    }

    fn retrieve_frame(&mut self) -> Result<Retrieved<PcmFrame>> {
        Ok(match self.ready.take() {
            Some(frame) => Retrieved::Frame(frame),
            None if self.draining => Retrieved::Exhausted,
            None => Retrieved::NeedsMoreInput,
        })
    }
}

/// Best-effort duration in milliseconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label for logs.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
