//! Fractional delay line
//!
//! Power-of-two circular buffer read with linear interpolation. Used for
//! ITD, Doppler, crossfeed and early reflection taps.

use orb_core::Sample;

use crate::Processor;

#[derive(Debug, Clone)]
pub struct FractionalDelay {
    buffer: Vec<f64>,
    mask: usize,
    /// Index of the most recently written sample
    last: usize,
}

impl FractionalDelay {
    /// Room for at least `max_delay` samples of delay
    pub fn new(max_delay: usize) -> Self {
        let size = (max_delay + 2).next_power_of_two();
        Self {
            buffer: vec![0.0; size],
            mask: size - 1,
            last: 0,
        }
    }

    /// Longest delay `read` can return without clamping
    pub fn max_delay(&self) -> f64 {
        (self.buffer.len() - 2) as f64
    }

    #[inline]
    pub fn push(&mut self, input: f64) {
        self.last = (self.last + 1) & self.mask;
        self.buffer[self.last] = input;
    }

    /// Sample written `delay` pushes ago (0.0 is the newest)
    #[inline]
    pub fn read(&self, delay: f64) -> f64 {
        let delay = delay.clamp(0.0, self.max_delay());
        let whole = delay as usize;
        let frac = delay - whole as f64;

        let newer = self.buffer[self.last.wrapping_sub(whole) & self.mask];
        let older = self.buffer[self.last.wrapping_sub(whole + 1) & self.mask];
        newer + (older - newer) * frac
    }

    /// Push then read in one step
    #[inline]
    pub fn process(&mut self, input: Sample, delay: f64) -> Sample {
        self.push(input as f64);
        self.read(delay) as Sample
    }
}

impl Processor for FractionalDelay {
    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.last = 0;
    }

    fn latency(&self) -> usize {
        0
    }
}
