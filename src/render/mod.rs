//! Kernel rasterization (CPU implementation).
//!
//! This module turns smoothed particles into gridded outputs:
//! - `image`: 2D images, orthographic or perspective
//! - `grid`: 3D voxel grids
//! - `spherical`: all-sky shell maps on an equal-area pixelization
//!
//! Every renderer deposits `qty * mass / rho * W(d/h) / h^p` per particle,
//! with `p` the kernel's h-power. Deposition is exact per particle; the
//! multi-resolution acceleration and shard smoothing are the only
//! approximate steps, and both are opt-in.

pub mod grid;
pub mod image;
pub mod spherical;

// Re-export
pub use grid::{to_3d_grid, Grid3, GridOptions};
pub use image::{render_image, ImageOptions};
pub use spherical::{render_spherical, SphericalOptions, SphericalView};

use rayon::prelude::*;
use std::path::Path;

use crate::snap::{SimSnap, SphError};
use crate::units::Units;

/// Particle data pulled out of a snapshot once per render, so the inner
/// loops work on plain slices.
pub(crate) struct ParticleArrays {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub sm: Vec<f64>,
    pub qty: Vec<f64>,
    pub mass: Vec<f64>,
    pub rho: Vec<f64>,
    pub qty_units: Units,
    pub mass_units: Units,
    pub rho_units: Units,
    pub sm_units: Units,
    pub pos_units: Units,
}

impl ParticleArrays {
    pub fn gather(snap: &mut SimSnap, qty: &str) -> Result<Self, SphError> {
        let qty_arr = snap.get(qty)?;
        if qty_arr.dims != 1 {
            return Err(SphError::Render(format!(
                "quantity {} is not a scalar array",
                qty
            )));
        }
        let qty_units = qty_arr.units;
        let qty = qty_arr.to_f64();
        let x = snap.get_column("pos", 0)?;
        let y = snap.get_column("pos", 1)?;
        let z = snap.get_column("pos", 2)?;
        let sm = snap.get_f64("smooth")?;
        let rho = snap.get_f64("rho")?;
        let mass = crate::smooth::mass_array(snap)?;
        Ok(ParticleArrays {
            x,
            y,
            z,
            sm,
            qty,
            mass,
            rho,
            qty_units,
            mass_units: crate::smooth::mass_units(snap),
            rho_units: snap.units_of("rho")?,
            sm_units: snap.units_of("smooth")?,
            pos_units: snap.units_of("pos")?,
        })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Deposition weight of particle `i`, before the kernel factor.
    pub fn weight(&self, i: usize) -> f64 {
        self.qty[i] * self.mass[i] / self.rho[i]
    }

    /// The same arrays with the quantity replaced by ones, for the
    /// denoising normalization pass.
    pub fn with_unit_qty(&self) -> Self {
        ParticleArrays {
            x: self.x.clone(),
            y: self.y.clone(),
            z: self.z.clone(),
            sm: self.sm.clone(),
            qty: vec![1.0; self.qty.len()],
            mass: self.mass.clone(),
            rho: self.rho.clone(),
            qty_units: Units::dimensionless(),
            mass_units: self.mass_units,
            rho_units: self.rho_units,
            sm_units: self.sm_units,
            pos_units: self.pos_units,
        }
    }
}

/// Resolve the numeric conversion factor and output units for a render.
///
/// Without a unit request, the deposition's native `mass / rho` volume is
/// normalized to position units, leaving `qty * length^(3 - h_power)`.
/// With one, the full composite `qty * mass / (rho * smooth^h_power)` is
/// converted and must be dimensionally compatible.
pub(crate) fn resolve_units(
    p: &ParticleArrays,
    h_power: i32,
    out: Option<Units>,
) -> Result<(f64, Units), SphError> {
    match out {
        None => {
            let factor = (p.mass_units / p.rho_units).ratio(&p.pos_units.powi(3))?;
            Ok((factor, p.qty_units * p.pos_units.powi(3 - h_power)))
        }
        Some(out) => {
            let native = p.qty_units * p.mass_units / (p.rho_units * p.sm_units.powi(h_power));
            Ok((native.ratio(&out)?, out))
        }
    }
}

/// A rendered 2D image with attached units. Row-major, `data[y * nx + x]`.
#[derive(Debug, Clone)]
pub struct Image {
    pub nx: usize,
    pub ny: usize,
    pub data: Vec<f32>,
    pub units: Units,
}

impl Image {
    pub fn new(nx: usize, ny: usize, units: Units) -> Self {
        Image {
            nx,
            ny,
            data: vec![0.0; nx * ny],
            units,
        }
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.nx + x]
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }

    /// Save as an 8-bit grayscale PNG, linearly mapping the value range.
    pub fn save_png(&self, path: &Path) -> Result<(), SphError> {
        let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
        for &v in &self.data {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        let range = if hi > lo { hi - lo } else { 1.0 };
        let pixels: Vec<u8> = self
            .data
            .iter()
            .map(|&v| (255.0 * (v - lo) / range) as u8)
            .collect();
        let img = ::image::GrayImage::from_raw(self.nx as u32, self.ny as u32, pixels)
            .unwrap_or_else(|| ::image::GrayImage::new(self.nx as u32, self.ny as u32));
        img.save(path).map_err(SphError::Image)
    }
}

/// Bilinear upsample of a row-major buffer to a new resolution. Values are
/// treated as field samples at pixel positions, so no sum-preserving
/// rescale is applied; callers deposit at matched pixel areas instead.
pub(crate) fn zoom_bilinear(
    src: &[f32],
    snx: usize,
    sny: usize,
    nx: usize,
    ny: usize,
) -> Vec<f32> {
    let mut out = vec![0.0f32; nx * ny];
    if snx == 0 || sny == 0 {
        return out;
    }
    for y in 0..ny {
        let fy = if ny > 1 {
            y as f64 * (sny - 1) as f64 / (ny - 1) as f64
        } else {
            0.0
        };
        let y0 = fy as usize;
        let y1 = (y0 + 1).min(sny - 1);
        let ty = fy - y0 as f64;
        for x in 0..nx {
            let fx = if nx > 1 {
                x as f64 * (snx - 1) as f64 / (nx - 1) as f64
            } else {
                0.0
            };
            let x0 = fx as usize;
            let x1 = (x0 + 1).min(snx - 1);
            let tx = fx - x0 as f64;
            let v00 = src[y0 * snx + x0] as f64;
            let v01 = src[y0 * snx + x1] as f64;
            let v10 = src[y1 * snx + x0] as f64;
            let v11 = src[y1 * snx + x1] as f64;
            let v = v00 * (1.0 - tx) * (1.0 - ty)
                + v01 * tx * (1.0 - ty)
                + v10 * (1.0 - tx) * ty
                + v11 * tx * ty;
            out[y * nx + x] = v as f32;
        }
    }
    out
}

/// Run `render(offset, step)` across `workers` particle strides in
/// parallel and sum the partial buffers. Addition is exact, so the
/// threaded result equals the single-threaded one up to float summation
/// order.
pub(crate) fn threaded_sum<F>(workers: usize, len: usize, render: F) -> Vec<f32>
where
    F: Fn(usize, usize) -> Vec<f32> + Sync,
{
    let workers = workers.max(1);
    if workers == 1 {
        return render(0, 1);
    }
    let partials: Vec<Vec<f32>> = (0..workers)
        .into_par_iter()
        .map(|w| render(w, workers))
        .collect();
    let mut out = vec![0.0f32; len];
    for p in partials {
        for (o, v) in out.iter_mut().zip(p) {
            *o += v;
        }
    }
    out
}
