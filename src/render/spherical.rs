//! All-sky spherical shell rendering.
//!
//! Maps particles onto the sphere of radius `distance` around the origin,
//! using the HEALPix-style ring pixelization: 12 * nside^2 equal-area
//! pixels arranged on iso-latitude rings. Only pixel centre directions are
//! needed here, so the pixelization is generated directly rather than
//! through an external library.
//!
//! Two modes follow from the kernel:
//! - volumetric (h_power 3): the field sampled on the shell itself, from
//!   particles whose support reaches it;
//! - projected (h_power 2): the column integrated along each sight line
//!   from the origin out to the shell, from particles inside it.
//!
//! Volumetric kernel values are looked up from ring-averaged bins of width
//! `kstep` in d/h, mirroring the shell geometry: all points of a pixel at
//! the same particle distance share one weight.

use log::debug;
use nalgebra::Vector3;

use super::{resolve_units, threaded_sum, ParticleArrays};
use crate::kernel::Kernel;
use crate::snap::{SimSnap, SphError};
use crate::units::Units;

/// A rendered all-sky map in ring pixel order.
#[derive(Debug, Clone)]
pub struct SphericalView {
    pub nside: usize,
    pub data: Vec<f32>,
    pub units: Units,
}

impl SphericalView {
    pub fn npix(&self) -> usize {
        12 * self.nside * self.nside
    }

    pub fn mean(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum::<f64>() / self.data.len() as f64
    }
}

/// Options for [`render_spherical`].
#[derive(Debug, Clone)]
pub struct SphericalOptions {
    /// Logical name of the scalar quantity to render.
    pub qty: String,
    /// Pixelization parameter; the map has `12 * nside^2` pixels.
    pub nside: usize,
    /// Radius of the shell being imaged.
    pub distance: f64,
    /// Bin width in d/h for the ring-averaged kernel table.
    pub kstep: f64,
    pub out_units: Option<Units>,
    pub threaded: Option<usize>,
    /// Divide by a unit-quantity render to suppress kernel noise.
    pub denoise: bool,
}

impl Default for SphericalOptions {
    fn default() -> Self {
        SphericalOptions {
            qty: "rho".to_string(),
            nside: 32,
            distance: 1.0,
            kstep: 0.05,
            out_units: None,
            threaded: None,
            denoise: false,
        }
    }
}

/// Render a scalar quantity onto an all-sky shell map.
pub fn render_spherical(
    snap: &mut SimSnap,
    kernel: &dyn Kernel,
    opts: &SphericalOptions,
) -> Result<SphericalView, SphError> {
    if opts.nside == 0 {
        return Err(SphError::Render("nside must be positive".to_string()));
    }
    let p = ParticleArrays::gather(snap, &opts.qty)?;
    let pix = ring_centers(opts.nside);
    let weights = ring_weights(kernel, opts.kstep);
    let workers = opts.threaded.unwrap_or(snap.config.threaded_image).max(1);
    debug!(
        "rendering nside={} shell at distance {} from {} particles ({} workers)",
        opts.nside,
        opts.distance,
        p.len(),
        workers
    );

    let (factor, mut units) = resolve_units(&p, kernel.h_power(), opts.out_units)?;
    let mut data = threaded_sum(workers, pix.len(), |offset, step| {
        spherical_core(&p, kernel, &pix, opts.distance, opts.kstep, &weights, offset, step)
    });
    for v in &mut data {
        *v *= factor as f32;
    }

    if opts.denoise {
        let ones = p.with_unit_qty();
        let (norm_factor, _) = resolve_units(&ones, kernel.h_power(), None)?;
        let mut norm = threaded_sum(workers, pix.len(), |offset, step| {
            spherical_core(&ones, kernel, &pix, opts.distance, opts.kstep, &weights, offset, step)
        });
        for v in &mut norm {
            *v *= norm_factor as f32;
        }
        for (d, n) in data.iter_mut().zip(&norm) {
            if *n != 0.0 {
                *d /= *n;
            }
        }
        if opts.out_units.is_none() {
            units = p.qty_units;
        }
    }

    Ok(SphericalView {
        nside: opts.nside,
        data,
        units,
    })
}

/// Pixel centre directions of the ring pixelization, north to south.
pub(crate) fn ring_centers(nside: usize) -> Vec<Vector3<f64>> {
    let ns = nside as f64;
    let mut out = Vec::with_capacity(12 * nside * nside);
    let push_ring = |out: &mut Vec<Vector3<f64>>, z: f64, count: usize, phi0: f64, dphi: f64| {
        let s = (1.0 - z * z).max(0.0).sqrt();
        for j in 0..count {
            let phi = phi0 + j as f64 * dphi;
            out.push(Vector3::new(s * phi.cos(), s * phi.sin(), z));
        }
    };
    // North polar cap: ring i has 4i pixels.
    for i in 1..nside {
        let fi = i as f64;
        let z = 1.0 - fi * fi / (3.0 * ns * ns);
        let dphi = std::f64::consts::FRAC_PI_2 / fi;
        push_ring(&mut out, z, 4 * i, 0.5 * dphi, dphi);
    }
    // Equatorial belt: rings of 4 * nside pixels with alternating offset.
    for i in nside..=3 * nside {
        let z = 4.0 / 3.0 - 2.0 * i as f64 / (3.0 * ns);
        let dphi = std::f64::consts::FRAC_PI_2 / ns;
        let s = ((i - nside + 1) % 2) as f64;
        push_ring(&mut out, z, 4 * nside, 0.5 * s * dphi, dphi);
    }
    // South polar cap mirrors the north.
    for i in (1..nside).rev() {
        let fi = i as f64;
        let z = -(1.0 - fi * fi / (3.0 * ns * ns));
        let dphi = std::f64::consts::FRAC_PI_2 / fi;
        push_ring(&mut out, z, 4 * i, 0.5 * dphi, dphi);
    }
    out
}

/// Ring-averaged kernel table: bin `b` holds the area-weighted mean of the
/// kernel over displacements `[b, b+1) * kstep`.
fn ring_weights(kernel: &dyn Kernel, kstep: f64) -> Vec<f64> {
    let nbins = (kernel.max_d() / kstep).ceil() as usize;
    let sub = 20;
    (0..nbins)
        .map(|b| {
            let d0 = b as f64 * kstep;
            let d1 = ((b + 1) as f64 * kstep).min(kernel.max_d());
            let dx = (d1 - d0) / sub as f64;
            let mut integral = 0.0;
            for k in 0..sub {
                let x = d0 + (k as f64 + 0.5) * dx;
                integral += x * kernel.value(x) * dx;
            }
            2.0 * integral / (d1 * d1 - d0 * d0)
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn spherical_core(
    p: &ParticleArrays,
    kernel: &dyn Kernel,
    pix: &[Vector3<f64>],
    distance: f64,
    kstep: f64,
    weights: &[f64],
    offset: usize,
    step: usize,
) -> Vec<f32> {
    let hp = kernel.h_power();
    let max_d = kernel.max_d();
    let max_d2 = max_d * max_d;
    let mut out = vec![0.0f32; pix.len()];

    for i in (offset..p.len()).step_by(step) {
        let q = Vector3::new(p.x[i], p.y[i], p.z[i]);
        let r = q.norm();
        if r == 0.0 {
            continue;
        }
        let u = q / r;
        let h = p.sm[i];

        if hp == 3 {
            let support = h * max_d;
            let dr = r - distance;
            if dr.abs() >= support {
                continue;
            }
            // Shell points closer than the support radius satisfy
            // cos(angle) > (r^2 + D^2 - s^2) / (2 r D).
            let cos_limit =
                (r * r + distance * distance - support * support) / (2.0 * r * distance);
            let w = p.weight(i) / (h * h * h);
            let inv_h = 1.0 / h;
            for (k, v) in pix.iter().enumerate() {
                let cos_a = u.dot(v);
                if cos_a <= cos_limit {
                    continue;
                }
                let d3 = (r * r + distance * distance - 2.0 * r * distance * cos_a)
                    .max(0.0)
                    .sqrt();
                let bin = (d3 * inv_h / kstep) as usize;
                if bin < weights.len() {
                    out[k] += (w * weights[bin]) as f32;
                }
            }
        } else {
            // Column mode: sight lines run from the origin to the shell,
            // so only interior particles contribute.
            if r >= distance {
                continue;
            }
            let w = p.weight(i) / (h * h);
            let inv_h2 = 1.0 / (h * h);
            for (k, v) in pix.iter().enumerate() {
                let cos_a = u.dot(v);
                if cos_a <= 0.0 {
                    continue;
                }
                let sin2 = (1.0 - cos_a * cos_a).max(0.0);
                let b2 = r * r * sin2;
                let q2 = b2 * inv_h2;
                if q2 < max_d2 {
                    out[k] += (w * kernel.sample_d2(q2)) as f32;
                }
            }
        }
    }
    out
}
