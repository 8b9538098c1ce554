//! orb-render: offline host harness
//!
//! Loads audio files as tracks, renders them through the engine with a
//! null device sink, records the master output to WAV and prints the
//! engine statistics as JSON.
//!
//! Usage:
//!   orb-render music.wav dialog.flac -o mix.wav --seconds 30
//!   orb-render a.wav b.wav c.wav --channels 6 --mode surround --circle 2.0 --downmix stereo.wav
//!   orb-render voice.wav --mode binaural-hrtf --hrtf subject.orbh --config engine.json

mod sink;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use crossbeam_channel::RecvTimeoutError;
use orb_engine::{Engine, EngineConfig, TrackId};
use orb_file::SourceDecoder;
use orb_spatial::{OutputLayout, SpatialMode, surround};

use crate::sink::NullSink;

/// Frames converted per downmix pass
const DOWNMIX_CHUNK: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "orb-render", about = "Render audio files through the Orbis engine")]
struct Cli {
    /// Input audio files, one track each
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Recorded master output (WAV)
    #[arg(short, long, default_value = "orb-render.wav")]
    output: PathBuf,

    /// Seconds to render
    #[arg(short, long, default_value_t = 10.0)]
    seconds: f32,

    /// Engine configuration (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    sample_rate: Option<u32>,

    /// Frames per block
    #[arg(long)]
    buffer: Option<usize>,

    /// Output channels: 1, 2, 6 or 8
    #[arg(long)]
    channels: Option<usize>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Place the tracks evenly on a circle of this radius (meters) around the listener
    #[arg(long)]
    circle: Option<f32>,

    /// Loop every input
    #[arg(long = "loop")]
    looping: bool,

    /// Master volume, 0..=2
    #[arg(long, default_value_t = 1.0)]
    volume: f32,

    /// HRTF blob for binaural rendering
    #[arg(long)]
    hrtf: Option<PathBuf>,

    /// Also write an ITU stereo down-mix of a surround render
    #[arg(long)]
    downmix: Option<PathBuf>,

    /// Pace rendering to wall-clock time like a real device
    #[arg(long)]
    realtime: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Basic,
    Spatial3d,
    BinauralHrtf,
    Surround,
}

impl From<ModeArg> for SpatialMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Basic => SpatialMode::Basic,
            ModeArg::Spatial3d => SpatialMode::Spatial3d,
            ModeArg::BinauralHrtf => SpatialMode::BinauralHrtf,
            ModeArg::Surround => SpatialMode::Surround,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = build_config(&cli)?;
    let engine = Arc::new(Engine::new(config).context("Failed to create engine")?);

    if let Some(path) = &cli.hrtf {
        engine
            .load_hrtf(path)
            .with_context(|| format!("Failed to load HRTF set {}", path.display()))?;
    }
    engine.set_master_volume(cli.volume)?;

    let tracks = load_tracks(&engine, &cli)?;
    if let Some(radius) = cli.circle {
        place_on_circle(&engine, &tracks, radius)?;
    }

    if !engine.wait_until_primed(Duration::from_secs(10)) {
        log::warn!("Sources not fully buffered, rendering anyway");
    }

    engine
        .start_recording(&cli.output)
        .with_context(|| format!("Failed to start recording to {}", cli.output.display()))?;
    engine.start();

    let total_frames = (cli.seconds.max(0.0) as f64 * engine.sample_rate() as f64) as u64;
    let cancel = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let handle = NullSink::for_engine(&engine, cli.realtime).spawn(
        Arc::clone(&engine),
        total_frames,
        Arc::clone(&cancel),
        done_tx,
    )?;

    // Control loop: forward audio-thread log records until the sink finishes
    let report = loop {
        match done_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(report) => break report,
            Err(RecvTimeoutError::Timeout) => {
                engine.drain_log();
            }
            Err(RecvTimeoutError::Disconnected) => {
                cancel.store(true, Ordering::Release);
                bail!("Render thread exited without a report");
            }
        }
    };
    if handle.join().is_err() {
        bail!("Render thread panicked");
    }

    let recording = engine.stop_recording()?;
    let stats = engine.stats();
    engine.stop();

    log::info!(
        "Rendered {} frames in {} blocks ({:.2}s, {} late), {} frames written to {}",
        report.frames,
        report.blocks,
        report.elapsed.as_secs_f64(),
        report.late_blocks,
        recording.frames_written,
        cli.output.display()
    );

    if let Some(path) = &cli.downmix {
        downmix_file(&cli.output, path, engine.layout())?;
    }

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn build_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(sample_rate) = cli.sample_rate {
        config.sample_rate = sample_rate;
    }
    if let Some(buffer) = cli.buffer {
        config.buffer_frames = buffer;
    }
    if let Some(channels) = cli.channels {
        config.channels = channels;
    }
    if let Some(mode) = cli.mode {
        config.spatial_mode = mode.into();
    }
    config.validate()?;
    Ok(config)
}

fn load_tracks(engine: &Engine, cli: &Cli) -> Result<Vec<TrackId>> {
    let mut tracks = Vec::with_capacity(cli.inputs.len());
    for path in &cli.inputs {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "track".to_string());
        let id = engine.add_track(&name);
        engine
            .load_track(id, path, cli.looping)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        tracks.push(id);
    }
    Ok(tracks)
}

/// Evenly spaced azimuths starting straight ahead, clockwise seen from above
fn place_on_circle(engine: &Engine, tracks: &[TrackId], radius: f32) -> Result<()> {
    if !radius.is_finite() || radius <= 0.0 {
        bail!("Circle radius must be positive, got {}", radius);
    }
    let count = tracks.len().max(1) as f32;
    for (i, &id) in tracks.iter().enumerate() {
        let azimuth = std::f32::consts::TAU * i as f32 / count;
        let (x, z) = (radius * azimuth.sin(), radius * azimuth.cos());
        engine.set_track_position(id, x, 0.0, z)?;
        log::info!("Track {} at {:.0} degrees, {:.1} m", id, azimuth.to_degrees(), radius);
    }
    Ok(())
}

/// Fold a recorded surround file to stereo
fn downmix_file(input: &Path, output: &Path, layout: OutputLayout) -> Result<()> {
    if !layout.is_surround() {
        log::warn!("Down-mix skipped: output layout is {}", layout.name());
        return Ok(());
    }

    let mut source = SourceDecoder::open(input)?;
    let spec = source.spec();
    let mut writer = hound::WavWriter::create(
        output,
        hound::WavSpec {
            channels: 2,
            sample_rate: spec.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        },
    )
    .with_context(|| format!("Failed to create {}", output.display()))?;

    let channels = layout.channel_count();
    let mut block = vec![0.0f32; DOWNMIX_CHUNK * channels];
    let mut stereo = vec![0.0f32; DOWNMIX_CHUNK * 2];
    loop {
        let frames = source.read(&mut block)?;
        if frames == 0 {
            break;
        }
        surround::downmix_to_stereo(layout, &block[..frames * channels], &mut stereo[..frames * 2], frames)?;
        for &s in &stereo[..frames * 2] {
            writer.write_sample(s)?;
        }
    }
    writer.finalize()?;

    log::info!("Down-mix written to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tone(path: &Path, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 48000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for _ in 0..channels {
                writer.write_sample((i as f32 * 0.03).sin() * 0.5).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "orb-render",
            "a.wav",
            "--sample-rate",
            "44100",
            "--channels",
            "6",
            "--mode",
            "surround",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 6);
        assert_eq!(config.spatial_mode, SpatialMode::Surround);
        assert_eq!(config.buffer_frames, 512);
    }

    #[test]
    fn test_bad_channel_count_rejected() {
        let cli = Cli::parse_from(["orb-render", "a.wav", "--channels", "4"]);
        assert!(build_config(&cli).is_err());
    }

    #[test]
    fn test_downmix_writes_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let surround = dir.path().join("mix51.wav");
        let stereo = dir.path().join("mix20.wav");
        write_tone(&surround, 6, 5000);

        downmix_file(&surround, &stereo, OutputLayout::Surround51).unwrap();
        let reader = hound::WavReader::open(&stereo).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.len(), 5000 * 2);
    }

    #[test]
    fn test_circle_placement() {
        let engine = orb_engine::create_engine(48000, 256, 2).unwrap();
        let ids: Vec<TrackId> = (0..4).map(|i| engine.add_track(&format!("t{}", i))).collect();
        place_on_circle(&engine, &ids, 2.0).unwrap();

        let right = engine.track_params(ids[1]).unwrap().position();
        assert!((right.x - 2.0).abs() < 1e-5);
        assert!(right.z.abs() < 1e-5);
        assert!(place_on_circle(&engine, &ids, 0.0).is_err());
    }
}
