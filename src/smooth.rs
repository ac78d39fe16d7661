//! Smoothing length and SPH density estimation.
//!
//! Both quantities are served through the derived-array registry on
//! [`SimSnap`]: `smooth` is half the distance to the configured neighbour
//! count, `rho` is the kernel-weighted neighbour mass sum using those
//! smoothing lengths.
//!
//! With `threaded_smooth = K > 1` the particle set is stride-partitioned
//! into K shards, each getting its own tree built and searched in parallel.
//! Neighbour queries then see only every K-th particle, so the raw results
//! are statistically biased by the local dilution: smoothing lengths come
//! out larger by K^(1/3) and densities smaller by K. Both are rescaled to
//! compensate. The sharded estimate converges to the exact one for smooth
//! particle distributions but is not bit-identical to it.

use log::debug;
use rayon::prelude::*;

use crate::snap::{SimArray, SimSnap, SphError};
use crate::tree::{KdTree, PopulateField};
use crate::units::Units;

fn to_vec3(flat: &[f64]) -> Vec<[f64; 3]> {
    flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect()
}

/// Per-particle masses, falling back to the header mass table when no mass
/// block is on disk, or to unit masses for snapshots with no backing files.
pub(crate) fn mass_array(snap: &mut SimSnap) -> Result<Vec<f64>, SphError> {
    match snap.get_f64("mass") {
        Ok(m) => Ok(m),
        Err(SphError::Gadget(e)) => Err(SphError::Gadget(e)),
        Err(_) => {
            let npart = snap.npart();
            if let Some(source) = snap.source() {
                let table = source.header().mass;
                let mut out = Vec::with_capacity(snap.len());
                for t in 0..6 {
                    out.extend(std::iter::repeat(table[t]).take(npart[t] as usize));
                }
                Ok(out)
            } else {
                Ok(vec![1.0; snap.len()])
            }
        }
    }
}

/// Build the neighbour tree (or shard trees) if not already cached.
pub(crate) fn ensure_trees(snap: &mut SimSnap) -> Result<(), SphError> {
    if snap.trees.is_some() {
        return Ok(());
    }
    let n = snap.len();
    let pos = to_vec3(&snap.get_f64("pos")?);
    let vel = match snap.get_f64("vel") {
        Ok(v) => to_vec3(&v),
        Err(SphError::Gadget(e)) => return Err(SphError::Gadget(e)),
        Err(_) => vec![[0.0; 3]; n],
    };
    let mass = mass_array(snap)?;
    let leafsize = snap.config.tree_leafsize;
    let k = snap.config.threaded_smooth.max(1);

    let trees = if k <= 1 {
        debug!("building neighbour tree over {} particles", n);
        vec![KdTree::build(pos, vel, mass, leafsize)]
    } else {
        debug!("building {} shard trees over {} particles", k, n);
        (0..k)
            .into_par_iter()
            .map(|s| {
                let p: Vec<[f64; 3]> = pos.iter().skip(s).step_by(k).copied().collect();
                let v: Vec<[f64; 3]> = vel.iter().skip(s).step_by(k).copied().collect();
                let m: Vec<f64> = mass.iter().skip(s).step_by(k).copied().collect();
                KdTree::build(p, v, m, leafsize)
            })
            .collect()
    };
    snap.trees = Some(trees);
    Ok(())
}

/// Run one populate pass over the cached tree(s), scattering shard results
/// back into global particle order.
fn populate_all(
    snap: &mut SimSnap,
    field: PopulateField,
    smooth: Option<&[f64]>,
) -> Result<Vec<f64>, SphError> {
    ensure_trees(snap)?;
    let nn = snap.config.smooth_particles;
    let n = snap.len();
    // The trees are lifted out for the duration of the pass so workers can
    // borrow them while the snapshot stays accessible.
    let trees = match snap.trees.take() {
        Some(t) => t,
        None => return Err(SphError::MissingArray("pos".into())),
    };
    let k = trees.len();

    let mut out = vec![0.0f64; n];
    if k == 1 {
        trees[0].populate(&mut out, field, nn, smooth);
    } else {
        let subs: Vec<Vec<f64>> = trees
            .par_iter()
            .enumerate()
            .map(|(s, tree)| {
                let mut sub = vec![0.0f64; tree.len()];
                let sub_smooth: Option<Vec<f64>> =
                    smooth.map(|sm| sm.iter().skip(s).step_by(k).copied().collect());
                tree.populate(&mut sub, field, nn, sub_smooth.as_deref());
                sub
            })
            .collect();
        for (s, sub) in subs.iter().enumerate() {
            for (j, &v) in sub.iter().enumerate() {
                out[s + k * j] = v;
            }
        }
        // Undo the shard dilution bias.
        match field {
            PopulateField::Smooth => {
                let f = (k as f64).powf(1.0 / 3.0);
                for v in &mut out {
                    *v /= f;
                }
            }
            PopulateField::Rho => {
                for v in &mut out {
                    *v *= k as f64;
                }
            }
        }
    }
    snap.trees = Some(trees);
    Ok(out)
}

/// Units of the per-particle masses, whatever their origin.
pub(crate) fn mass_units(snap: &mut SimSnap) -> Units {
    match snap.units_of("mass") {
        Ok(u) => u,
        Err(_) => snap
            .source()
            .map(|s| s.config.mass_units)
            .unwrap_or_else(|| Units::mass_unit(1.0)),
    }
}

/// Derived smoothing length: half the radius enclosing
/// `smooth_particles` neighbours (the particle itself included).
pub fn smooth(snap: &mut SimSnap) -> Result<SimArray, SphError> {
    let units = snap.units_of("pos")?;
    let out = populate_all(snap, PopulateField::Smooth, None)?;
    Ok(SimArray::from_f64(out, 1, units))
}

/// Derived SPH density from the cubic spline kernel over
/// `smooth_particles` neighbours.
pub fn rho(snap: &mut SimSnap) -> Result<SimArray, SphError> {
    let sm = snap.get_f64("smooth")?;
    let pos_units = snap.units_of("pos")?;
    let m_units = mass_units(snap);
    let out = populate_all(snap, PopulateField::Rho, Some(&sm))?;
    Ok(SimArray::from_f64(out, 1, m_units / pos_units.powi(3)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SphConfig;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn lattice_snap(side: usize, mass: f64, config: SphConfig) -> SimSnap {
        let spacing = 0.1;
        let mut pos = Vec::new();
        for i in 0..side {
            for j in 0..side {
                for k in 0..side {
                    pos.push(i as f64 * spacing);
                    pos.push(j as f64 * spacing);
                    pos.push(k as f64 * spacing);
                }
            }
        }
        let n = side * side * side;
        SimSnap::from_arrays(
            n,
            vec![
                (
                    "pos",
                    SimArray::from_f64(pos, 3, Units::length_unit(1.0)),
                ),
                (
                    "mass",
                    SimArray::from_f64(vec![mass; n], 1, Units::mass_unit(1.0)),
                ),
            ],
            config,
        )
    }

    fn random_snap(n: usize, seed: u64, config: SphConfig) -> SimSnap {
        let mut rng = StdRng::seed_from_u64(seed);
        let pos: Vec<f64> = (0..n * 3).map(|_| rng.gen::<f64>()).collect();
        SimSnap::from_arrays(
            n,
            vec![
                (
                    "pos",
                    SimArray::from_f64(pos, 3, Units::length_unit(1.0)),
                ),
                (
                    "mass",
                    SimArray::from_f64(vec![1.0 / n as f64; n], 1, Units::mass_unit(1.0)),
                ),
            ],
            config,
        )
    }

    #[test]
    fn test_lattice_density_near_nominal() {
        // Interior lattice particles should recover mass / spacing^3.
        let mut snap = lattice_snap(10, 2.0, SphConfig::default());
        let rho = snap.get_f64("rho").unwrap();
        let nominal = 2.0 / 0.1f64.powi(3);
        // Centre of the lattice: i = j = k = 5.
        let centre = 5 * 100 + 5 * 10 + 5;
        assert_relative_eq!(rho[centre], nominal, max_relative = 0.15);
    }

    #[test]
    fn test_smooth_units_follow_positions() {
        let mut snap = lattice_snap(6, 1.0, SphConfig::default());
        let units = snap.get("smooth").unwrap().units;
        assert!(units.compatible(&Units::length_unit(1.0)));
        let rho_units = snap.get("rho").unwrap().units;
        assert!(rho_units.compatible(&(Units::mass_unit(1.0) / Units::length_unit(1.0).powi(3))));
    }

    #[test]
    fn test_trees_cached_between_passes() {
        let mut snap = random_snap(300, 5, SphConfig::default());
        snap.get("smooth").unwrap();
        assert!(snap.trees.is_some());
        snap.get("rho").unwrap();
        assert_eq!(snap.trees.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_sharded_smooth_tracks_exact() {
        let exact = {
            let mut snap = random_snap(2000, 9, SphConfig::default());
            snap.get_f64("smooth").unwrap()
        };
        let sharded = {
            let config = SphConfig {
                threaded_smooth: 4,
                ..Default::default()
            };
            let mut snap = random_snap(2000, 9, config);
            snap.get_f64("smooth").unwrap()
        };
        let mean_ratio: f64 = exact
            .iter()
            .zip(&sharded)
            .map(|(e, s)| s / e)
            .sum::<f64>()
            / exact.len() as f64;
        // The rescaled shard estimate is approximate, not exact.
        assert!((mean_ratio - 1.0).abs() < 0.1, "mean ratio {}", mean_ratio);
    }

    #[test]
    fn test_sharded_density_tracks_exact() {
        let exact = {
            let mut snap = random_snap(2000, 13, SphConfig::default());
            snap.get_f64("rho").unwrap()
        };
        let sharded = {
            let config = SphConfig {
                threaded_smooth: 4,
                ..Default::default()
            };
            let mut snap = random_snap(2000, 13, config);
            snap.get_f64("rho").unwrap()
        };
        let mean_ratio: f64 =
            exact.iter().zip(&sharded).map(|(e, s)| s / e).sum::<f64>() / exact.len() as f64;
        assert!((mean_ratio - 1.0).abs() < 0.15, "mean ratio {}", mean_ratio);
    }

    #[test]
    fn test_mass_fallback_for_synthetic_snapshots() {
        // No mass array: unit masses are assumed.
        let n = 200;
        let mut rng = StdRng::seed_from_u64(1);
        let pos: Vec<f64> = (0..n * 3).map(|_| rng.gen::<f64>()).collect();
        let mut snap = SimSnap::from_arrays(
            n,
            vec![(
                "pos",
                SimArray::from_f64(pos, 3, Units::length_unit(1.0)),
            )],
            SphConfig::default(),
        );
        let rho = snap.get_f64("rho").unwrap();
        assert!(rho.iter().all(|&r| r > 0.0));
    }
}
