//! HRTF database
//!
//! Measured or synthetic head-related impulse responses indexed by
//! direction. Lookup is nearest neighbour by angular distance, which is
//! cheap enough to repeat whenever a source moves.
//!
//! ## Blob format (little endian)
//! ```text
//! "ORBH"  u32 version  u32 sample_rate  u32 ir_length  u32 count  u32 flags
//! count x { f32 azimuth_deg  f32 elevation_deg  f32[ir_length] left  f32[ir_length] right }
//! ```
//! Flag bit 0 marks responses that already contain interaural delay.

use std::path::Path;

use crate::error::{SpatialError, SpatialResult};
use crate::position::{Spherical, Vec3};

const MAGIC: &[u8; 4] = b"ORBH";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 24;
const FLAG_INCLUDES_ITD: u32 = 1;

/// Longest impulse response accepted, in samples
pub const MAX_HRIR_LENGTH: usize = 1024;

/// Impulse response length of the synthetic set
pub const SYNTHETIC_HRIR_LENGTH: usize = 128;

/// Left/right impulse responses for one direction
#[derive(Debug, Clone, PartialEq)]
pub struct HrirPair {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl HrirPair {
    pub fn new(left: Vec<f32>, right: Vec<f32>) -> Self {
        Self { left, right }
    }

    pub fn length(&self) -> usize {
        self.left.len().max(self.right.len())
    }
}

#[derive(Debug, Clone)]
struct HrtfEntry {
    azimuth: f32,
    elevation: f32,
    /// Unit direction, used for angular distance
    direction: Vec3,
    hrir: HrirPair,
}

/// Set of HRIRs sharing one sample rate and length
#[derive(Debug, Clone)]
pub struct HrtfDatabase {
    sample_rate: u32,
    ir_length: usize,
    includes_itd: bool,
    entries: Vec<HrtfEntry>,
}

impl HrtfDatabase {
    pub fn new(sample_rate: u32, ir_length: usize, includes_itd: bool) -> SpatialResult<Self> {
        if ir_length == 0 || ir_length > MAX_HRIR_LENGTH {
            return Err(SpatialError::InvalidHrtf(format!(
                "impulse length {} outside 1..={}",
                ir_length, MAX_HRIR_LENGTH
            )));
        }
        if sample_rate == 0 {
            return Err(SpatialError::InvalidHrtf("sample rate is zero".into()));
        }
        Ok(Self {
            sample_rate,
            ir_length,
            includes_itd,
            entries: Vec::new(),
        })
    }

    /// Built-in head model: constant-power level difference, a low-passed
    /// far ear and an elevation-dependent pinna notch. Contains no ITD.
    pub fn synthetic(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(8000);
        let mut db = Self {
            sample_rate,
            ir_length: SYNTHETIC_HRIR_LENGTH,
            includes_itd: false,
            entries: Vec::new(),
        };

        for el_step in 0..7 {
            let elevation = -40.0 + el_step as f32 * 20.0;
            for az_step in 0..24 {
                let azimuth = -180.0 + az_step as f32 * 15.0;
                let hrir = synthetic_hrir(azimuth, elevation, sample_rate as f64);
                db.push_entry(azimuth, elevation, hrir);
            }
        }

        log::debug!(
            "Synthetic HRTF: {} directions, {} taps @ {} Hz",
            db.len(),
            db.ir_length,
            sample_rate
        );
        db
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn ir_length(&self) -> usize {
        self.ir_length
    }

    pub fn includes_itd(&self) -> bool {
        self.includes_itd
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a measurement. Shorter responses are zero-padded.
    pub fn insert(&mut self, azimuth: f32, elevation: f32, mut hrir: HrirPair) -> SpatialResult<()> {
        if !azimuth.is_finite() || !elevation.is_finite() {
            return Err(SpatialError::InvalidParameter("non-finite HRTF direction".into()));
        }
        if hrir.length() > self.ir_length {
            return Err(SpatialError::InvalidHrtf(format!(
                "impulse length {} exceeds database length {}",
                hrir.length(),
                self.ir_length
            )));
        }
        hrir.left.resize(self.ir_length, 0.0);
        hrir.right.resize(self.ir_length, 0.0);
        self.push_entry(azimuth, elevation.clamp(-90.0, 90.0), hrir);
        Ok(())
    }

    fn push_entry(&mut self, azimuth: f32, elevation: f32, hrir: HrirPair) {
        let direction = Spherical::new(azimuth, elevation, 1.0).to_cartesian();
        self.entries.push(HrtfEntry {
            azimuth,
            elevation,
            direction,
            hrir,
        });
    }

    /// Index of the entry closest to the direction (largest dot product)
    pub fn nearest_index(&self, azimuth: f32, elevation: f32) -> Option<usize> {
        let target = Spherical::new(azimuth, elevation, 1.0).to_cartesian();
        let mut best = None;
        let mut best_dot = f32::NEG_INFINITY;
        for (i, entry) in self.entries.iter().enumerate() {
            let dot = entry.direction.dot(target);
            if dot > best_dot {
                best_dot = dot;
                best = Some(i);
            }
        }
        best
    }

    pub fn nearest(&self, azimuth: f32, elevation: f32) -> Option<&HrirPair> {
        self.nearest_index(azimuth, elevation).map(|i| &self.entries[i].hrir)
    }

    pub fn get(&self, index: usize) -> Option<&HrirPair> {
        self.entries.get(index).map(|e| &e.hrir)
    }

    /// Direction of an entry in degrees
    pub fn direction_of(&self, index: usize) -> Option<(f32, f32)> {
        self.entries.get(index).map(|e| (e.azimuth, e.elevation))
    }

    // ─── Serialization ──────────────────────────────────────────────────────

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_LEN + self.entries.len() * (8 + self.ir_length * 8));
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&(self.ir_length as u32).to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        let flags = if self.includes_itd { FLAG_INCLUDES_ITD } else { 0 };
        out.extend_from_slice(&flags.to_le_bytes());

        for entry in &self.entries {
            out.extend_from_slice(&entry.azimuth.to_le_bytes());
            out.extend_from_slice(&entry.elevation.to_le_bytes());
            for &s in entry.hrir.left.iter().chain(entry.hrir.right.iter()) {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> SpatialResult<Self> {
        if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
            return Err(SpatialError::InvalidHrtf("missing ORBH header".into()));
        }
        let mut reader = LeReader::new(&bytes[4..]);
        let version = reader.u32()?;
        if version != VERSION {
            return Err(SpatialError::InvalidHrtf(format!("unsupported version {}", version)));
        }
        let sample_rate = reader.u32()?;
        let ir_length = reader.u32()? as usize;
        let count = reader.u32()? as usize;
        let flags = reader.u32()?;

        let mut db = Self::new(sample_rate, ir_length, flags & FLAG_INCLUDES_ITD != 0)?;

        let entry_len = 8 + ir_length * 8;
        let expected = count
            .checked_mul(entry_len)
            .ok_or_else(|| SpatialError::InvalidHrtf("entry count overflow".into()))?;
        if reader.remaining() != expected {
            return Err(SpatialError::InvalidHrtf(format!(
                "expected {} payload bytes, found {}",
                expected,
                reader.remaining()
            )));
        }

        db.entries.reserve(count);
        for _ in 0..count {
            let azimuth = reader.f32()?;
            let elevation = reader.f32()?;
            let mut left = Vec::with_capacity(ir_length);
            let mut right = Vec::with_capacity(ir_length);
            for _ in 0..ir_length {
                left.push(reader.f32()?);
            }
            for _ in 0..ir_length {
                right.push(reader.f32()?);
            }
            db.insert(azimuth, elevation, HrirPair::new(left, right))?;
        }
        Ok(db)
    }

    pub fn load(path: impl AsRef<Path>) -> SpatialResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let db = Self::from_bytes(&bytes)?;
        log::info!(
            "Loaded HRTF {:?}: {} directions, {} taps",
            path.as_ref(),
            db.len(),
            db.ir_length
        );
        Ok(db)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> SpatialResult<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

struct LeReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> LeReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take4(&mut self) -> SpatialResult<[u8; 4]> {
        let end = self.pos + 4;
        let chunk = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| SpatialError::InvalidHrtf("truncated data".into()))?;
        self.pos = end;
        let mut out = [0u8; 4];
        out.copy_from_slice(chunk);
        Ok(out)
    }

    fn u32(&mut self) -> SpatialResult<u32> {
        self.take4().map(u32::from_le_bytes)
    }

    fn f32(&mut self) -> SpatialResult<f32> {
        self.take4().map(f32::from_le_bytes)
    }
}

/// Fill `out` with the impulse response of a one-pole low-pass scaled so
/// its DC gain is `gain`
fn one_pole_response(out: &mut [f32], gain: f32, cutoff: f64, sample_rate: f64) {
    let a = 1.0 - (-2.0 * std::f64::consts::PI * cutoff / sample_rate).exp();
    let mut tap = a;
    let mut sum = 0.0;
    for s in out.iter_mut() {
        *s = tap as f32;
        sum += tap;
        tap *= 1.0 - a;
    }
    let norm = if sum > 0.0 { gain as f64 / sum } else { 0.0 };
    for s in out.iter_mut() {
        *s = (*s as f64 * norm) as f32;
    }
}

fn synthetic_hrir(azimuth: f32, elevation: f32, sample_rate: f64) -> HrirPair {
    let az = azimuth.to_radians();
    let el = elevation.to_radians();

    // -1 = hard left, +1 = hard right
    let lateral = az.sin() * el.cos();
    let angle = (lateral + 1.0) * std::f32::consts::FRAC_PI_4;
    let (gain_l, gain_r) = (angle.cos(), angle.sin());

    // Head shadow darkens the far ear; sources behind lose some air
    let rear = az.cos() < 0.0;
    let near_cutoff = if rear { 9000.0 } else { 20000.0 };
    let far_cutoff = 20000.0 - 17000.0 * lateral.abs() as f64;
    let (cut_l, cut_r) = if lateral >= 0.0 {
        (far_cutoff.min(near_cutoff), near_cutoff)
    } else {
        (near_cutoff, far_cutoff.min(near_cutoff))
    };

    let mut left = vec![0.0f32; SYNTHETIC_HRIR_LENGTH];
    let mut right = vec![0.0f32; SYNTHETIC_HRIR_LENGTH];
    one_pole_response(&mut left, gain_l, cut_l.min(sample_rate * 0.45), sample_rate);
    one_pole_response(&mut right, gain_r, cut_r.min(sample_rate * 0.45), sample_rate);

    // Pinna reflection: the notch moves up in frequency with elevation
    let pinna_ms = 0.25 - 0.15 * ((elevation + 40.0) / 120.0).clamp(0.0, 1.0) as f64;
    let pinna_tap = ((pinna_ms * 0.001 * sample_rate).round() as usize).clamp(1, SYNTHETIC_HRIR_LENGTH - 1);
    left[pinna_tap] -= 0.2 * gain_l;
    right[pinna_tap] -= 0.2 * gain_r;

    HrirPair::new(left, right)
}
