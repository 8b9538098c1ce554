//! Lock-free meter slots shared between the audio thread and observers

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use orb_dsp::LevelReading;

/// f32 stored as bits
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Latest block reading, written by the audio thread
#[derive(Debug, Default)]
pub struct MeterData {
    pub peak: AtomicF32,
    pub rms: AtomicF32,
    pub peak_l: AtomicF32,
    pub peak_r: AtomicF32,
    pub rms_l: AtomicF32,
    pub rms_r: AtomicF32,
    pub clipping: AtomicBool,
}

impl MeterData {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn store(&self, reading: &LevelReading) {
        self.peak.store(reading.peak);
        self.rms.store(reading.rms);
        self.peak_l.store(reading.peak_l);
        self.peak_r.store(reading.peak_r);
        self.rms_l.store(reading.rms_l);
        self.rms_r.store(reading.rms_r);
        self.clipping.store(reading.clipping, Ordering::Relaxed);
    }

    pub fn load(&self) -> LevelReading {
        LevelReading {
            peak: self.peak.load(),
            rms: self.rms.load(),
            peak_l: self.peak_l.load(),
            peak_r: self.peak_r.load(),
            rms_l: self.rms_l.load(),
            rms_r: self.rms_r.load(),
            clipping: self.clipping.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn reset(&self) {
        self.store(&LevelReading::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_load() {
        let meter = MeterData::new();
        let reading = LevelReading {
            peak: 0.9,
            rms: 0.5,
            peak_l: 0.9,
            peak_r: 0.3,
            rms_l: 0.6,
            rms_r: 0.2,
            clipping: false,
        };
        meter.store(&reading);
        assert_eq!(meter.load(), reading);

        meter.reset();
        assert_eq!(meter.load(), LevelReading::default());
    }

    #[test]
    fn test_atomic_f32_bits() {
        let value = AtomicF32::new(-0.0);
        assert!(value.load().is_sign_negative());
        value.store(f32::MIN_POSITIVE);
        assert_eq!(value.load(), f32::MIN_POSITIVE);
    }
}
