//! SIMD detection and denormal protection
//!
//! Detection runs once per process; callers cache the resulting level or a
//! kernel table built from it. Denormal flushing is per thread and scoped
//! by `DenormalGuard`.

use std::sync::OnceLock;

/// Vector instruction set chosen for hot kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SimdLevel {
    Scalar = 0,
    /// 128-bit, 4 f32 lanes
    Sse2 = 1,
    /// 256-bit, 8 f32 lanes
    Avx = 2,
    /// ARM 128-bit, 4 f32 lanes
    Neon = 3,
}

impl SimdLevel {
    /// f32 lanes per vector
    pub const fn lanes(self) -> usize {
        match self {
            SimdLevel::Scalar => 1,
            SimdLevel::Sse2 | SimdLevel::Neon => 4,
            SimdLevel::Avx => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SimdLevel::Scalar => "Scalar",
            SimdLevel::Sse2 => "SSE2",
            SimdLevel::Avx => "AVX",
            SimdLevel::Neon => "NEON",
        }
    }
}

static DETECTED_SIMD_LEVEL: OnceLock<SimdLevel> = OnceLock::new();

/// Best level supported by the running CPU (detected once)
pub fn simd_level() -> SimdLevel {
    *DETECTED_SIMD_LEVEL.get_or_init(|| {
        let level = detect();
        log::debug!("SIMD level: {}", level.name());
        level
    })
}

fn detect() -> SimdLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx") {
            return SimdLevel::Avx;
        }
        // SSE2 is part of the x86_64 baseline
        SimdLevel::Sse2
    }

    #[cfg(target_arch = "aarch64")]
    {
        SimdLevel::Neon
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        SimdLevel::Scalar
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DENORMAL PROTECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Flush-to-zero for the current thread while alive.
///
/// On x86_64 sets MXCSR DAZ (bit 6) and FTZ (bit 15); on aarch64 sets
/// FPCR.FZ (bit 24). The previous register value is restored on drop.
pub struct DenormalGuard {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    previous: u64,
    // Register state is per thread
    _not_send: std::marker::PhantomData<*const ()>,
}

#[cfg(target_arch = "x86_64")]
const MXCSR_DAZ_FTZ: u32 = 0x8040;

#[cfg(target_arch = "aarch64")]
const FPCR_FZ: u64 = 1 << 24;

impl DenormalGuard {
    #[allow(deprecated)]
    #[cfg(target_arch = "x86_64")]
    pub fn new() -> Self {
        use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};
        // SAFETY: only changes floating-point rounding/flush flags of this thread
        let previous = unsafe {
            let mxcsr = _mm_getcsr();
            _mm_setcsr(mxcsr | MXCSR_DAZ_FTZ);
            mxcsr
        };
        Self {
            previous: previous as u64,
            _not_send: std::marker::PhantomData,
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn new() -> Self {
        let previous: u64;
        // SAFETY: FPCR reads/writes only affect this thread's FP behavior
        unsafe {
            std::arch::asm!("mrs {}, fpcr", out(reg) previous, options(nomem, nostack));
            std::arch::asm!("msr fpcr, {}", in(reg) previous | FPCR_FZ, options(nomem, nostack));
        }
        Self {
            previous,
            _not_send: std::marker::PhantomData,
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn new() -> Self {
        Self {
            _not_send: std::marker::PhantomData,
        }
    }

    /// Whether flush-to-zero is currently on for this thread
    #[allow(deprecated)]
    pub fn is_active() -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: reading MXCSR has no side effects
            let mxcsr = unsafe { std::arch::x86_64::_mm_getcsr() };
            mxcsr & MXCSR_DAZ_FTZ == MXCSR_DAZ_FTZ
        }

        #[cfg(target_arch = "aarch64")]
        {
            let fpcr: u64;
            // SAFETY: reading FPCR has no side effects
            unsafe {
                std::arch::asm!("mrs {}, fpcr", out(reg) fpcr, options(nomem, nostack));
            }
            fpcr & FPCR_FZ != 0
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            false
        }
    }
}

impl Default for DenormalGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DenormalGuard {
    #[allow(deprecated)]
    fn drop(&mut self) {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: restores the value read in `new` on the same thread
            unsafe { std::arch::x86_64::_mm_setcsr(self.previous as u32) };
        }

        #[cfg(target_arch = "aarch64")]
        {
            // SAFETY: restores the value read in `new` on the same thread
            unsafe {
                std::arch::asm!("msr fpcr, {}", in(reg) self.previous, options(nomem, nostack));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_is_stable() {
        assert_eq!(simd_level(), simd_level());
        assert!(simd_level().lanes() >= 1);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_guard_sets_and_restores() {
        let before = DenormalGuard::is_active();
        {
            let _guard = DenormalGuard::new();
            assert!(DenormalGuard::is_active());
        }
        assert_eq!(DenormalGuard::is_active(), before);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_denormals_flushed_under_guard() {
        let _guard = DenormalGuard::new();
        let tiny = std::hint::black_box(f32::MIN_POSITIVE);
        let result = std::hint::black_box(tiny * std::hint::black_box(0.5));
        assert_eq!(result, 0.0);
    }
}
