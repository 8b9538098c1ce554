//! Source decoders for streaming playback
//!
//! `SourceDecoder` is the single type the streamer's IO thread pulls from.
//! Reads fill interleaved f32 frames at the file's own channel count; the
//! caller adapts channel layout.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use orb_core::Sample;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::{FileError, FileResult};

// ═══════════════════════════════════════════════════════════════════════════════
// FORMAT DETECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Container format, from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Flac,
    Mp3,
    Ogg,
    Aiff,
    Unknown,
}

impl AudioFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "wav" | "wave" => Self::Wav,
            "flac" => Self::Flac,
            "mp3" => Self::Mp3,
            "ogg" | "oga" => Self::Ogg,
            "aif" | "aiff" | "aifc" => Self::Aiff,
            _ => Self::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::Unknown)
    }
}

/// What a source produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSpec {
    pub sample_rate: u32,
    pub channels: u16,
    /// 0 when the container does not say
    pub total_frames: u64,
}

impl SourceSpec {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.total_frames as f64 / self.sample_rate as f64
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE DECODER
// ═══════════════════════════════════════════════════════════════════════════════

/// Tagged decoder variants; dispatch is a match, not a vtable
pub enum SourceDecoder {
    Wav(WavSource),
    Compressed(CompressedSource),
    Memory(MemorySource),
}

impl SourceDecoder {
    /// Open a file, picking the decoder from its extension
    pub fn open<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(FileError::NotFound(path.display().to_string()));
        }

        let decoder = match AudioFormat::from_path(path) {
            AudioFormat::Wav => Self::Wav(WavSource::open(path)?),
            _ => Self::Compressed(CompressedSource::open(path)?),
        };

        let spec = decoder.spec();
        if spec.channels == 0 || spec.sample_rate == 0 {
            return Err(FileError::InvalidFile(format!(
                "{}: {} channels at {} Hz",
                path.display(),
                spec.channels,
                spec.sample_rate
            )));
        }

        log::debug!(
            "Opened {} ({} ch, {} Hz, {} frames)",
            path.display(),
            spec.channels,
            spec.sample_rate,
            spec.total_frames
        );
        Ok(decoder)
    }

    /// In-memory source over interleaved samples
    pub fn from_interleaved(
        samples: impl Into<Arc<[Sample]>>,
        channels: u16,
        sample_rate: u32,
    ) -> FileResult<Self> {
        Ok(Self::Memory(MemorySource::new(samples.into(), channels, sample_rate)?))
    }

    pub fn spec(&self) -> SourceSpec {
        match self {
            Self::Wav(s) => s.spec,
            Self::Compressed(s) => s.spec,
            Self::Memory(s) => s.spec,
        }
    }

    /// Fill `out` with whole interleaved frames. Returns frames read;
    /// fewer than requested means end of data was reached.
    pub fn read(&mut self, out: &mut [Sample]) -> FileResult<usize> {
        let channels = self.spec().channels as usize;
        let frames = out.len() / channels;
        if frames == 0 {
            return Ok(0);
        }
        let out = &mut out[..frames * channels];
        match self {
            Self::Wav(s) => s.read(out),
            Self::Compressed(s) => s.read(out),
            Self::Memory(s) => Ok(s.read(out)),
        }
    }

    /// Reposition so the next read starts at `frame`
    pub fn seek(&mut self, frame: u64) -> FileResult<()> {
        match self {
            Self::Wav(s) => s.seek(frame),
            Self::Compressed(s) => s.seek(frame),
            Self::Memory(s) => {
                s.seek(frame);
                Ok(())
            }
        }
    }

    /// Frame the next read starts at
    pub fn position(&self) -> u64 {
        match self {
            Self::Wav(s) => s.position,
            Self::Compressed(s) => s.position,
            Self::Memory(s) => s.position,
        }
    }
}

impl std::fmt::Debug for SourceDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Wav(_) => "Wav",
            Self::Compressed(_) => "Compressed",
            Self::Memory(_) => "Memory",
        };
        f.debug_struct("SourceDecoder")
            .field("kind", &kind)
            .field("spec", &self.spec())
            .field("position", &self.position())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WAV (hound)
// ═══════════════════════════════════════════════════════════════════════════════

pub struct WavSource {
    reader: hound::WavReader<BufReader<File>>,
    spec: SourceSpec,
    sample_format: hound::SampleFormat,
    /// 1 / 2^(bits-1) for integer formats
    int_scale: f32,
    position: u64,
}

impl WavSource {
    fn open(path: &Path) -> FileResult<Self> {
        let reader = hound::WavReader::open(path)?;
        let wav = reader.spec();
        let spec = SourceSpec {
            sample_rate: wav.sample_rate,
            channels: wav.channels,
            total_frames: reader.duration() as u64,
        };
        let int_scale = 1.0 / (1u64 << (wav.bits_per_sample.clamp(1, 32) - 1)) as f32;

        Ok(Self {
            reader,
            spec,
            sample_format: wav.sample_format,
            int_scale,
            position: 0,
        })
    }

    fn read(&mut self, out: &mut [Sample]) -> FileResult<usize> {
        let channels = self.spec.channels as usize;
        let mut filled = 0;

        match self.sample_format {
            hound::SampleFormat::Float => {
                for (slot, sample) in out.iter_mut().zip(self.reader.samples::<f32>()) {
                    *slot = sample?;
                    filled += 1;
                }
            }
            hound::SampleFormat::Int => {
                let scale = self.int_scale;
                for (slot, sample) in out.iter_mut().zip(self.reader.samples::<i32>()) {
                    *slot = sample? as f32 * scale;
                    filled += 1;
                }
            }
        }

        let frames = filled / channels;
        self.position += frames as u64;
        Ok(frames)
    }

    fn seek(&mut self, frame: u64) -> FileResult<()> {
        let frame = frame.min(self.spec.total_frames);
        self.reader.seek(frame as u32)?;
        self.position = frame;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPRESSED (symphonia)
// ═══════════════════════════════════════════════════════════════════════════════

pub struct CompressedSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    spec: SourceSpec,
    /// Decoded frames not yet handed out
    pending: Vec<Sample>,
    pending_offset: usize,
    sample_buf: Option<SampleBuffer<Sample>>,
    /// Frames to discard after an accurate seek landed early
    skip_frames: u64,
    position: u64,
    finished: bool,
}

impl CompressedSource {
    fn open(path: &Path) -> FileResult<Self> {
        let file = File::open(path).map_err(|_| FileError::NotFound(path.display().to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| FileError::InvalidFile("No audio track found".to_string()))?;

        let track_id = track.id;
        let spec = SourceSpec {
            sample_rate: track.codec_params.sample_rate.unwrap_or(0),
            channels: track.codec_params.channels.map(|c| c.count() as u16).unwrap_or(0),
            total_frames: track.codec_params.n_frames.unwrap_or(0),
        };

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            track_id,
            spec,
            pending: Vec::new(),
            pending_offset: 0,
            sample_buf: None,
            skip_frames: 0,
            position: 0,
            finished: false,
        })
    }

    /// Decode the next packet into `pending`. Returns false at end of stream.
    fn decode_next(&mut self) -> FileResult<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(e.into()),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(msg)) => {
                    log::debug!("Skipping undecodable packet: {}", msg);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let spec = *decoded.spec();
            let frames = decoded.capacity();
            // SampleBuffer capacity counts samples, not frames
            let reuse = self
                .sample_buf
                .as_ref()
                .is_some_and(|buf| buf.capacity() >= frames * spec.channels.count());
            if !reuse {
                self.sample_buf = Some(SampleBuffer::new(frames as u64, spec));
            }
            let Some(buf) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending.extend_from_slice(buf.samples());
            self.pending_offset = 0;
            return Ok(true);
        }
    }

    fn read(&mut self, out: &mut [Sample]) -> FileResult<usize> {
        let channels = self.spec.channels as usize;
        let mut written = 0;

        while written < out.len() && !self.finished {
            if self.pending_offset >= self.pending.len() {
                if !self.decode_next()? {
                    self.finished = true;
                    break;
                }
                if self.skip_frames > 0 {
                    let available = (self.pending.len() / channels) as u64;
                    let skip = self.skip_frames.min(available);
                    self.pending_offset = skip as usize * channels;
                    self.skip_frames -= skip;
                }
                continue;
            }

            let take = (out.len() - written).min(self.pending.len() - self.pending_offset);
            out[written..written + take]
                .copy_from_slice(&self.pending[self.pending_offset..self.pending_offset + take]);
            written += take;
            self.pending_offset += take;
        }

        let frames = written / channels;
        self.position += frames as u64;
        Ok(frames)
    }

    fn seek(&mut self, frame: u64) -> FileResult<()> {
        let seeked = self.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: frame,
                track_id: self.track_id,
            },
        )?;
        self.decoder.reset();
        self.pending.clear();
        self.pending_offset = 0;
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        self.position = seeked.required_ts;
        self.finished = false;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMORY
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared interleaved samples with a private read cursor
pub struct MemorySource {
    samples: Arc<[Sample]>,
    spec: SourceSpec,
    position: u64,
}

impl MemorySource {
    pub fn new(samples: Arc<[Sample]>, channels: u16, sample_rate: u32) -> FileResult<Self> {
        if channels == 0 {
            return Err(FileError::InvalidArg("channel count must be non-zero".to_string()));
        }
        if sample_rate == 0 {
            return Err(FileError::InvalidArg("sample rate must be non-zero".to_string()));
        }
        let total_frames = (samples.len() / channels as usize) as u64;
        Ok(Self {
            samples,
            spec: SourceSpec {
                sample_rate,
                channels,
                total_frames,
            },
            position: 0,
        })
    }

    fn read(&mut self, out: &mut [Sample]) -> usize {
        let channels = self.spec.channels as usize;
        let start = self.position as usize * channels;
        let end = self.spec.total_frames as usize * channels;
        let take = out.len().min(end.saturating_sub(start));
        out[..take].copy_from_slice(&self.samples[start..start + take]);
        let frames = take / channels;
        self.position += frames as u64;
        frames
    }

    fn seek(&mut self, frame: u64) {
        self.position = frame.min(self.spec.total_frames);
    }
}
