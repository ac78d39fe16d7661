//! 2D image rendering, orthographic or perspective.
//!
//! The view plane is the x/y plane at `z_plane`. A perspective render
//! places a pinhole camera on the z axis at `z_camera` looking down it;
//! particle positions and smoothing lengths are scaled by
//! `z_camera / (z_camera - z)`, and a projected (column) kernel is
//! required since each pixel then represents a sight line.
//!
//! With `approximate_fast`, particles are partitioned by their on-screen
//! size in pixels and large ones are deposited at power-of-two reduced
//! resolutions, then bilinearly upsampled and summed. Level count is
//! `floor(log2(nx / 20))`, so the coarsest grid stays around 20 pixels
//! across.

use log::debug;

use super::{resolve_units, threaded_sum, zoom_bilinear, Image, ParticleArrays};
use crate::kernel::Kernel;
use crate::snap::{SimSnap, SphError};
use crate::units::Units;

/// Options for [`render_image`]. `x2` is the half-width of the field of
/// view; the remaining bounds default to a symmetric window with square
/// pixels.
#[derive(Debug, Clone)]
pub struct ImageOptions {
    /// Logical name of the scalar quantity to render.
    pub qty: String,
    pub x2: f64,
    pub x1: Option<f64>,
    pub y1: Option<f64>,
    pub y2: Option<f64>,
    pub nx: usize,
    pub ny: Option<usize>,
    /// z of the view plane (orthographic) or focal plane (perspective).
    pub z_plane: f64,
    /// z of the pinhole camera; enables perspective projection.
    pub z_camera: Option<f64>,
    /// Requested output units; defaults to the quantity's natural
    /// image units.
    pub out_units: Option<Units>,
    /// Interpret the smoothing array as pixel rather than world lengths.
    pub smooth_in_pixels: bool,
    /// Override the configured multi-resolution acceleration.
    pub approximate_fast: Option<bool>,
    /// Override the configured worker count.
    pub threaded: Option<usize>,
    /// Divide by a unit-quantity render to suppress kernel noise.
    pub denoise: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        ImageOptions {
            qty: "rho".to_string(),
            x2: 100.0,
            x1: None,
            y1: None,
            y2: None,
            nx: 500,
            ny: None,
            z_plane: 0.0,
            z_camera: None,
            out_units: None,
            smooth_in_pixels: false,
            approximate_fast: None,
            threaded: None,
            denoise: false,
        }
    }
}

/// Pixel grid geometry: origin corner, pixel pitch, resolution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GridGeom {
    pub x1: f64,
    pub y1: f64,
    pub dx: f64,
    pub dy: f64,
    pub nx: usize,
    pub ny: usize,
}

impl GridGeom {
    /// The power-of-two reduced grid for one acceleration level. The
    /// origin shifts by half the pitch difference so coarse pixel centres
    /// stay aligned with fine ones under corner-anchored interpolation.
    fn downgrade(&self, factor: usize) -> GridGeom {
        GridGeom {
            x1: self.x1 - 0.5 * self.dx * (factor - 1) as f64,
            y1: self.y1 - 0.5 * self.dy * (factor - 1) as f64,
            dx: self.dx * factor as f64,
            dy: self.dy * factor as f64,
            nx: self.nx / factor,
            ny: self.ny / factor,
        }
    }
}

/// Render a scalar quantity to a 2D image.
pub fn render_image(
    snap: &mut SimSnap,
    kernel: &dyn Kernel,
    opts: &ImageOptions,
) -> Result<Image, SphError> {
    if opts.z_camera.is_some() && kernel.h_power() != 2 {
        return Err(SphError::KernelMismatch(
            "perspective rendering needs a projected kernel".to_string(),
        ));
    }

    let nx = opts.nx;
    let ny = opts.ny.unwrap_or(nx);
    let x2 = opts.x2;
    let x1 = opts.x1.unwrap_or(-x2);
    let y2 = opts.y2.unwrap_or(x2 * ny as f64 / nx as f64);
    let y1 = opts.y1.unwrap_or(-y2);
    let geom = GridGeom {
        x1,
        y1,
        dx: (x2 - x1) / nx as f64,
        dy: (y2 - y1) / ny as f64,
        nx,
        ny,
    };

    let mut p = ParticleArrays::gather(snap, &opts.qty)?;
    if opts.smooth_in_pixels {
        for h in &mut p.sm {
            *h *= geom.dx;
        }
    }

    let approximate = opts
        .approximate_fast
        .unwrap_or(snap.config.approximate_fast);
    let levels = if approximate {
        (((nx.min(ny) as f64) / 20.0).log2().floor() as usize).max(1)
    } else {
        1
    };
    let workers = opts.threaded.unwrap_or(snap.config.threaded_image).max(1);
    debug!(
        "rendering {}x{} image of {} from {} particles ({} levels, {} workers)",
        nx,
        ny,
        opts.qty,
        p.len(),
        levels,
        workers
    );

    let (factor, mut units) = resolve_units(&p, kernel.h_power(), opts.out_units)?;
    let mut data = render_particles(&p, kernel, &geom, opts.z_plane, opts.z_camera, levels, workers);
    for v in &mut data {
        *v *= factor as f32;
    }

    if opts.denoise {
        let ones = p.with_unit_qty();
        let (norm_factor, _) = resolve_units(&ones, kernel.h_power(), None)?;
        let mut norm =
            render_particles(&ones, kernel, &geom, opts.z_plane, opts.z_camera, levels, workers);
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

    Ok(Image { nx, ny, data, units })
}

/// Full deposition pass: particle strides across workers, size classes
/// across resolution levels.
pub(crate) fn render_particles(
    p: &ParticleArrays,
    kernel: &dyn Kernel,
    geom: &GridGeom,
    z_plane: f64,
    z_camera: Option<f64>,
    levels: usize,
    workers: usize,
) -> Vec<f32> {
    threaded_sum(workers, geom.nx * geom.ny, |offset, step| {
        // With a single level every size class renders at full resolution.
        let base_hi = if levels == 1 { f64::INFINITY } else { 2.0 };
        let mut base = render_core(p, kernel, geom, z_plane, z_camera, (0.0, base_hi), offset, step);
        let mut down = 1usize;
        for level in 1..levels {
            down *= 2;
            let coarse = geom.downgrade(down);
            if coarse.nx < 2 || coarse.ny < 2 {
                break;
            }
            let hi = if level == levels - 1 { 1e5 } else { 2.0 };
            let img = render_core(p, kernel, &coarse, z_plane, z_camera, (1.0, hi), offset, step);
            let up = zoom_bilinear(&img, coarse.nx, coarse.ny, geom.nx, geom.ny);
            for (b, u) in base.iter_mut().zip(up) {
                *b += u;
            }
        }
        base
    })
}

/// Deposit every `step`-th particle whose on-screen smoothing length in
/// pixels falls in `[range.0, range.1)` onto one grid.
fn render_core(
    p: &ParticleArrays,
    kernel: &dyn Kernel,
    g: &GridGeom,
    z_plane: f64,
    z_camera: Option<f64>,
    range: (f64, f64),
    offset: usize,
    step: usize,
) -> Vec<f32> {
    let hp = kernel.h_power();
    let max_d = kernel.max_d();
    let max_d2 = max_d * max_d;
    let mut out = vec![0.0f32; g.nx * g.ny];

    for i in (offset..p.len()).step_by(step) {
        let mut px = p.x[i];
        let mut py = p.y[i];
        let pz = p.z[i] - z_plane;
        let mut h = p.sm[i];

        if let Some(zc) = z_camera {
            let depth = zc - p.z[i];
            // Particles behind or at the camera are invisible.
            if depth <= 0.0 {
                continue;
            }
            let s = zc / depth;
            px *= s;
            py *= s;
            h *= s;
        }

        let h_px = h / g.dx;
        if h_px < range.0 || h_px >= range.1 {
            continue;
        }

        let support = h * max_d;
        let pz2 = if hp == 3 {
            if pz.abs() >= support {
                continue;
            }
            pz * pz
        } else {
            0.0
        };
        let r_xy = (support * support - pz2).sqrt();

        if px + r_xy < g.x1
            || px - r_xy > g.x1 + g.dx * g.nx as f64
            || py + r_xy < g.y1
            || py - r_xy > g.y1 + g.dy * g.ny as f64
        {
            continue;
        }

        if hp == 2 && support < 0.5 * g.dx.min(g.dy) {
            // Sub-pixel footprint would miss every pixel centre; the whole
            // column lands on the nearest pixel instead.
            let ix = ((px - g.x1) / g.dx - 0.5).round();
            let iy = ((py - g.y1) / g.dy - 0.5).round();
            if ix >= 0.0 && iy >= 0.0 && (ix as usize) < g.nx && (iy as usize) < g.ny {
                out[iy as usize * g.nx + ix as usize] += (p.weight(i) / (g.dx * g.dy)) as f32;
            }
            continue;
        }

        let w = p.weight(i) / h.powi(hp);
        let inv_h2 = 1.0 / (h * h);

        let ix0 = (((px - r_xy - g.x1) / g.dx) - 0.5).ceil().max(0.0) as usize;
        let iy0 = (((py - r_xy - g.y1) / g.dy) - 0.5).ceil().max(0.0) as usize;
        let fx1 = (((px + r_xy - g.x1) / g.dx) - 0.5).floor();
        let fy1 = (((py + r_xy - g.y1) / g.dy) - 0.5).floor();
        if fx1 < 0.0 || fy1 < 0.0 {
            continue;
        }
        let ix1 = (fx1 as usize).min(g.nx - 1);
        let iy1 = (fy1 as usize).min(g.ny - 1);

        for iy in iy0..=iy1 {
            let cy = g.y1 + (iy as f64 + 0.5) * g.dy;
            let dy2 = (cy - py) * (cy - py);
            let row = iy * g.nx;
            for ix in ix0..=ix1 {
                let cx = g.x1 + (ix as f64 + 0.5) * g.dx;
                let d2 = (cx - px) * (cx - px) + dy2 + pz2;
                let q2 = d2 * inv_h2;
                if q2 < max_d2 {
                    out[row + ix] += (w * kernel.sample_d2(q2)) as f32;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SphConfig;
    use crate::kernel::{CubicSpline, Projected};
    use crate::snap::SimArray;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Snapshot with preset smoothing and density so renders do not invoke
    /// the neighbour machinery.
    fn preset_snap(pos: Vec<f64>, sm: Vec<f64>, mass: Vec<f64>) -> SimSnap {
        let n = sm.len();
        let m = Units::mass_unit(1.0);
        let l = Units::length_unit(1.0);
        SimSnap::from_arrays(
            n,
            vec![
                ("pos", SimArray::from_f64(pos, 3, l)),
                ("smooth", SimArray::from_f64(sm, 1, l)),
                ("mass", SimArray::from_f64(mass.clone(), 1, m)),
                ("rho", SimArray::from_f64(vec![1.0; n], 1, m / l.powi(3))),
            ],
            SphConfig::default(),
        )
    }

    fn random_cloud(n: usize, seed: u64) -> SimSnap {
        let mut rng = StdRng::seed_from_u64(seed);
        let pos: Vec<f64> = (0..n * 3).map(|_| rng.gen::<f64>() - 0.5).collect();
        let sm: Vec<f64> = (0..n).map(|_| 0.02 + 0.2 * rng.gen::<f64>()).collect();
        preset_snap(pos, sm, vec![1.0; n])
    }

    fn column_sum(im: &Image, dx: f64, dy: f64) -> f64 {
        im.sum() * dx * dy
    }

    #[test]
    fn test_column_render_conserves_mass() {
        let snap_mass = 1.0;
        let mut snap = preset_snap(vec![0.0, 0.0, 0.0], vec![0.3], vec![snap_mass]);
        let kernel = Projected::new(CubicSpline::new());
        let opts = ImageOptions {
            qty: "rho".to_string(),
            x2: 1.0,
            nx: 200,
            approximate_fast: Some(false),
            ..Default::default()
        };
        let im = render_image(&mut snap, &kernel, &opts).unwrap();
        let dx = 2.0 / 200.0;
        assert_relative_eq!(column_sum(&im, dx, dx), snap_mass, max_relative = 0.01);
    }

    #[test]
    fn test_subpixel_particles_keep_their_mass() {
        // Smoothing far below the pixel pitch.
        let mut snap = preset_snap(vec![0.1, -0.2, 0.0], vec![0.0005], vec![2.5]);
        let kernel = Projected::new(CubicSpline::new());
        let opts = ImageOptions {
            qty: "rho".to_string(),
            x2: 1.0,
            nx: 100,
            approximate_fast: Some(false),
            ..Default::default()
        };
        let im = render_image(&mut snap, &kernel, &opts).unwrap();
        let dx = 2.0 / 100.0;
        assert_relative_eq!(column_sum(&im, dx, dx), 2.5, max_relative = 1e-4);
    }

    #[test]
    fn test_multires_approximates_exact() {
        let kernel = Projected::new(CubicSpline::new());
        let base = ImageOptions {
            qty: "rho".to_string(),
            x2: 1.0,
            nx: 256,
            ..Default::default()
        };
        let exact = {
            let mut snap = random_cloud(150, 21);
            let opts = ImageOptions {
                approximate_fast: Some(false),
                ..base.clone()
            };
            render_image(&mut snap, &kernel, &opts).unwrap()
        };
        let fast = {
            let mut snap = random_cloud(150, 21);
            let opts = ImageOptions {
                approximate_fast: Some(true),
                ..base
            };
            render_image(&mut snap, &kernel, &opts).unwrap()
        };
        let dx = 2.0 / 256.0;
        let (se, sf) = (column_sum(&exact, dx, dx), column_sum(&fast, dx, dx));
        assert_relative_eq!(se, sf, max_relative = 0.05);
    }

    #[test]
    fn test_threaded_matches_serial() {
        let kernel = CubicSpline::new();
        let mk_opts = |workers| ImageOptions {
            qty: "rho".to_string(),
            x2: 1.0,
            nx: 64,
            threaded: Some(workers),
            approximate_fast: Some(false),
            ..Default::default()
        };
        let serial = {
            let mut snap = random_cloud(100, 3);
            render_image(&mut snap, &kernel, &mk_opts(1)).unwrap()
        };
        let parallel = {
            let mut snap = random_cloud(100, 3);
            render_image(&mut snap, &kernel, &mk_opts(4)).unwrap()
        };
        for (s, p) in serial.data.iter().zip(&parallel.data) {
            assert_relative_eq!(*s, *p, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_perspective_requires_projected_kernel() {
        let mut snap = random_cloud(10, 1);
        let kernel = CubicSpline::new();
        let opts = ImageOptions {
            z_camera: Some(5.0),
            ..Default::default()
        };
        assert!(matches!(
            render_image(&mut snap, &kernel, &opts),
            Err(SphError::KernelMismatch(_))
        ));
    }

    #[test]
    fn test_perspective_magnifies_near_particles() {
        // One particle halfway to the camera doubles its apparent size, so
        // its peak column density drops relative to the orthographic view.
        let mut snap = preset_snap(vec![0.0, 0.0, 0.5], vec![0.2], vec![1.0]);
        let kernel = Projected::new(CubicSpline::new());
        let ortho = render_image(
            &mut snap,
            &kernel,
            &ImageOptions {
                qty: "rho".to_string(),
                x2: 1.0,
                nx: 128,
                approximate_fast: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        let persp = render_image(
            &mut snap,
            &kernel,
            &ImageOptions {
                qty: "rho".to_string(),
                x2: 1.0,
                nx: 128,
                z_camera: Some(1.0),
                approximate_fast: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        let peak = |im: &Image| im.data.iter().cloned().fold(f32::MIN, f32::max);
        assert!(peak(&persp) < peak(&ortho));
        // Magnification by 2 spreads the same column over 4x the area.
        assert_relative_eq!(
            peak(&persp),
            peak(&ortho) / 4.0,
            max_relative = 0.05
        );
    }

    #[test]
    fn test_denoised_uniform_field_is_flat() {
        // qty = rho and rho preset to 1 everywhere: the denoised estimate
        // of a constant field is the constant.
        let mut snap = random_cloud(400, 17);
        let kernel = CubicSpline::new();
        let opts = ImageOptions {
            qty: "rho".to_string(),
            x2: 0.4,
            nx: 32,
            denoise: true,
            approximate_fast: Some(false),
            ..Default::default()
        };
        let im = render_image(&mut snap, &kernel, &opts).unwrap();
        let centre = im.get(16, 16);
        assert_relative_eq!(centre, 1.0, max_relative = 0.05);
    }

    #[test]
    fn test_image_units_without_request() {
        // Column render of a density has units mass / length^2.
        let mut snap = preset_snap(vec![0.0; 3], vec![0.3], vec![1.0]);
        let kernel = Projected::new(CubicSpline::new());
        let im = render_image(
            &mut snap,
            &kernel,
            &ImageOptions {
                qty: "rho".to_string(),
                x2: 1.0,
                nx: 32,
                ..Default::default()
            },
        )
        .unwrap();
        let want = Units::mass_unit(1.0) / Units::length_unit(1.0).powi(2);
        assert!(im.units.compatible(&want));
    }
}
