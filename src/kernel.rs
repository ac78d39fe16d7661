//! Smoothing kernels.
//!
//! A kernel is a radially symmetric, compactly supported weighting function
//! normalized so its volume integral is one. `h_power` is the power of the
//! smoothing length dividing the kernel in the deposition weight: 3 for
//! volumetric kernels, 2 for projected (column) kernels. `max_d` is the
//! support radius in units of the smoothing length.
//!
//! The deposition inner loops read kernel values through a sample table
//! indexed by squared displacement. The table is computed lazily on first
//! use; initialization is guarded so concurrent render workers can share a
//! kernel.

use std::sync::OnceLock;

/// Spacing of the sample table in units of (d/h)^2.
const SAMPLE_STEP: f64 = 0.02;
/// Number of samples covering (d/h)^2 in [0, 4], i.e. support radius 2.
const N_SAMPLES: usize = 201;

pub trait Kernel: Send + Sync {
    /// Kernel value at displacement `d` (in units of h, for h = 1).
    fn value(&self, d: f64) -> f64;

    /// Power of h in the deposition denominator: 3 volumetric, 2 projected.
    fn h_power(&self) -> i32;

    /// Support radius in units of h.
    fn max_d(&self) -> f64;

    /// The cached sample table, indexed by (d/h)^2 in steps of
    /// [`SAMPLE_STEP`].
    fn samples(&self) -> &[f32];

    /// Table lookup by squared displacement, linearly interpolated between
    /// samples. Zero outside the support.
    fn sample_d2(&self, d2: f64) -> f64 {
        let x = d2 / SAMPLE_STEP;
        let idx = x as usize;
        let table = self.samples();
        if idx + 1 >= table.len() {
            return 0.0;
        }
        let t = x - idx as f64;
        table[idx] as f64 * (1.0 - t) + table[idx + 1] as f64 * t
    }
}

fn build_samples(value: impl Fn(f64) -> f64) -> Vec<f32> {
    (0..N_SAMPLES)
        .map(|i| value((i as f64 * SAMPLE_STEP).sqrt()) as f32)
        .collect()
}

/// The cubic (M4) spline kernel, support radius 2h.
pub struct CubicSpline {
    samples: OnceLock<Vec<f32>>,
}

impl CubicSpline {
    pub fn new() -> Self {
        CubicSpline {
            samples: OnceLock::new(),
        }
    }

    fn spline(d: f64) -> f64 {
        let f = if d < 1.0 {
            1.0 - 1.5 * d * d + 0.75 * d * d * d
        } else if d < 2.0 {
            0.25 * (2.0 - d).powi(3)
        } else {
            0.0
        };
        f / std::f64::consts::PI
    }
}

impl Default for CubicSpline {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CubicSpline {
    fn value(&self, d: f64) -> f64 {
        Self::spline(d)
    }

    fn h_power(&self) -> i32 {
        3
    }

    fn max_d(&self) -> f64 {
        2.0
    }

    fn samples(&self) -> &[f32] {
        self.samples.get_or_init(|| build_samples(Self::spline))
    }
}

/// A projected (column-integrated) kernel: the line-of-sight integral of a
/// volumetric kernel. Used for perspective images and line-of-sight
/// spherical renders, where each pixel represents a skewer rather than a
/// plane sample.
pub struct Projected<K: Kernel> {
    inner: K,
    samples: OnceLock<Vec<f32>>,
}

impl<K: Kernel> Projected<K> {
    pub fn new(inner: K) -> Self {
        Projected {
            inner,
            samples: OnceLock::new(),
        }
    }

    /// Integrate the inner kernel along z over its full support at impact
    /// parameter `d`, by Simpson's rule.
    fn column(&self, d: f64) -> f64 {
        let max_d = self.inner.max_d();
        if d >= max_d {
            return 0.0;
        }
        let zmax = (max_d * max_d - d * d).sqrt();
        let n = 100;
        let dz = zmax / n as f64;
        let f = |z: f64| self.inner.value((z * z + d * d).sqrt());
        let mut acc = f(0.0) + f(zmax);
        for i in 1..n {
            let w = if i % 2 == 1 { 4.0 } else { 2.0 };
            acc += w * f(i as f64 * dz);
        }
        2.0 * acc * dz / 3.0
    }
}

impl Default for Projected<CubicSpline> {
    fn default() -> Self {
        Projected::new(CubicSpline::new())
    }
}

impl<K: Kernel> Kernel for Projected<K> {
    fn value(&self, d: f64) -> f64 {
        self.column(d)
    }

    fn h_power(&self) -> i32 {
        2
    }

    fn max_d(&self) -> f64 {
        self.inner.max_d()
    }

    fn samples(&self) -> &[f32] {
        self.samples
            .get_or_init(|| build_samples(|d| self.column(d)))
    }
}

/// Uniform kernel over a sphere of radius `max_d`.
pub struct TopHat {
    max_d: f64,
    samples: OnceLock<Vec<f32>>,
}

impl TopHat {
    /// The support radius is capped at 2h, the range the shared sample
    /// table covers; a wider sphere would silently lose deposition beyond
    /// it in the table-driven inner loops.
    pub fn new(max_d: f64) -> Self {
        TopHat {
            max_d: max_d.min(2.0),
            samples: OnceLock::new(),
        }
    }
}

impl Default for TopHat {
    fn default() -> Self {
        TopHat::new(2.0)
    }
}

impl Kernel for TopHat {
    fn value(&self, d: f64) -> f64 {
        if d < self.max_d {
            3.0 / (4.0 * std::f64::consts::PI * self.max_d.powi(3))
        } else {
            0.0
        }
    }

    fn h_power(&self) -> i32 {
        3
    }

    fn max_d(&self) -> f64 {
        self.max_d
    }

    fn samples(&self) -> &[f32] {
        let max_d = self.max_d;
        self.samples.get_or_init(|| {
            build_samples(|d| {
                if d < max_d {
                    3.0 / (4.0 * std::f64::consts::PI * max_d.powi(3))
                } else {
                    0.0
                }
            })
        })
    }
}
