//! Multi-file logical snapshot.
//!
//! Large simulations split one snapshot across numbered files
//! (`snap_020.0`, `snap_020.1`, ...), each a complete container with its
//! own header. This layer opens the set, verifies the headers agree,
//! aggregates particle counts, and presents named quantities that
//! concatenate seamlessly across the files in family-major order.

use std::path::{Path, PathBuf};

use log::warn;

use crate::config::GadgetConfig;
use crate::io::gadget::{GadgetError, GadgetFile, GadgetHeader};
use crate::snap::{Family, SimArray, SphError};
use crate::units::Units;

/// A logical snapshot spanning one or more physical files.
pub struct GadgetSnapshot {
    files: Vec<GadgetFile>,
    header: GadgetHeader,
    npart: [u64; 6],
    pub config: GadgetConfig,
}

impl GadgetSnapshot {
    /// Open a snapshot. `path` may name either a single file or the first
    /// member of a numbered set; a bare stem is also accepted when the
    /// `.0` member exists.
    pub fn open(path: &Path, config: GadgetConfig) -> Result<Self, GadgetError> {
        let (first_path, numbered) = resolve_first_file(path);
        let first = GadgetFile::open(&first_path, &config)?;

        let expected = first.header.num_files.max(1) as usize;
        let mut files = vec![first];

        if expected > 1 {
            if let Some(base) = numbered {
                for i in 1..expected {
                    let p = PathBuf::from(format!("{}.{}", base.display(), i));
                    let f = GadgetFile::open(&p, &config)?;
                    if !headers_agree(&files[0].header, &f.header) {
                        warn!(
                            "header of {} disagrees with {}; skipping file",
                            p.display(),
                            first_path.display()
                        );
                        continue;
                    }
                    files.push(f);
                }
            } else {
                warn!(
                    "{} names {} files but has no numeric suffix; loading it alone",
                    first_path.display(),
                    expected
                );
            }
        }

        let mut npart = [0u64; 6];
        for f in &files {
            for t in 0..6 {
                npart[t] += f.header.npart[t] as u64;
            }
        }

        let mut header = files[0].header.clone();
        if files.len() == expected {
            // Repair the split global counts from what is actually on disk.
            for t in 0..6 {
                header.npart_total[t] = (npart[t] & 0xffff_ffff) as u32;
                header.nall_hw[t] = (npart[t] >> 32) as u32;
            }
        }

        Ok(GadgetSnapshot {
            files,
            header,
            npart,
            config,
        })
    }

    pub fn header(&self) -> &GadgetHeader {
        &self.header
    }

    /// Aggregate particle count per type across the loaded files.
    pub fn npart(&self) -> [u64; 6] {
        self.npart
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> &[GadgetFile] {
        &self.files
    }

    /// Logical names of every quantity present in at least one file.
    pub fn loadable_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for f in &self.files {
            for name in f.block_names() {
                if name == "HEAD" {
                    continue;
                }
                let logical = self.config.logical_name(name);
                if !keys.contains(&logical) {
                    keys.push(logical);
                }
            }
        }
        keys.sort();
        keys
    }

    /// Which particle types have rows of `disk` in some file.
    fn block_types(&self, disk: &str) -> [bool; 6] {
        let mut present = [false; 6];
        for f in &self.files {
            if let Some(b) = f.block(disk) {
                for t in 0..6 {
                    present[t] |= b.p_types[t] && f.header.npart[t] > 0;
                }
            }
        }
        present
    }

    /// Read a quantity, concatenated across files.
    ///
    /// With `family` given, only that family's rows are returned, and the
    /// quantity must exist for it. Without, the quantity must exist for
    /// every family that has particles; rows come out family-major (all
    /// gas, then all dark matter, ...), matching the in-memory layout.
    pub fn read_quantity(
        &self,
        name: &str,
        family: Option<Family>,
    ) -> Result<SimArray, SphError> {
        let disk = self.config.block_name(name);
        let present = self.block_types(&disk);

        let types: Vec<usize> = match family {
            Some(f) => {
                let t = f.gadget_type();
                if self.npart[t] == 0 || !present[t] {
                    return Err(SphError::NoSuchArray(name.to_string()));
                }
                vec![t]
            }
            None => {
                let types: Vec<usize> = (0..6).filter(|&t| self.npart[t] > 0).collect();
                if types.iter().any(|&t| !present[t]) {
                    return Err(SphError::NotForAllFamilies(name.to_string()));
                }
                types
            }
        };

        let dims = self
            .files
            .iter()
            .find_map(|f| f.block(&disk).map(|b| b.dims() as usize))
            .ok_or_else(|| SphError::NoSuchArray(name.to_string()))?;

        let mut accum = None;
        for &t in &types {
            for f in &self.files {
                let parts = f.block_parts(&disk, Some(t));
                if parts == 0 {
                    continue;
                }
                let (_, data) = f.read_block(&disk, Some(t), parts)?;
                match &mut accum {
                    None => accum = Some(data),
                    Some(acc) => acc.append(&data),
                }
            }
        }
        let data = accum.ok_or_else(|| SphError::NoSuchArray(name.to_string()))?;
        Ok(SimArray {
            data,
            dims,
            units: quantity_units(&self.config, name),
        })
    }

    /// Write a quantity back, splitting it across files by each file's own
    /// particle counts. Creates the block in every file first if absent.
    pub fn write_quantity(
        &mut self,
        name: &str,
        array: &SimArray,
        family: Option<Family>,
    ) -> Result<(), SphError> {
        let disk = self.config.block_name(name);

        if !self.files.iter().any(|f| f.has_block(&disk)) {
            let dtype = array.data.dtype();
            let partlen = array.dims as u64 * dtype.size();
            let empty = array.data.slice(0, 0);
            // A family-specific write creates a block holding only that
            // family's rows; otherwise every type gets rows.
            let p_types = family.map(|fam| {
                let mut p = [false; 6];
                p[fam.gadget_type()] = true;
                p
            });
            for f in &mut self.files {
                let rows: u64 = match p_types {
                    Some(p) => (0..6)
                        .filter(|&t| p[t])
                        .map(|t| f.header.npart[t] as u64)
                        .sum(),
                    None => f.header.total_particles(),
                };
                f.add_block(&disk, rows * partlen, partlen, dtype, p_types)?;
                // A whole-block zero-length write lays down the record
                // markers, so the file stays scannable before the per-type
                // payload writes below land.
                f.write_block(&disk, None, &empty)?;
            }
        }

        let types: Vec<usize> = match family {
            Some(f) => vec![f.gadget_type()],
            None => (0..6).filter(|&t| self.npart[t] > 0).collect(),
        };

        let mut expected = 0u64;
        for &t in &types {
            for f in &self.files {
                expected += f.block_parts(&disk, Some(t));
            }
        }
        if array.rows() as u64 != expected {
            return Err(SphError::Gadget(GadgetError::SizeMismatch {
                name: disk,
                capacity: expected * array.dims as u64,
                requested: array.data.len() as u64,
            }));
        }

        let mut offset = 0usize;
        for &t in &types {
            for f in &self.files {
                let count = f.block_parts(&disk, Some(t)) as usize * array.dims;
                if count == 0 {
                    continue;
                }
                let chunk = array.data.slice(offset, count);
                f.write_block(&disk, Some(t), &chunk)?;
                offset += count;
            }
        }
        Ok(())
    }

    /// Write a header record to every file. Per-file particle counts are
    /// preserved by the container layer.
    pub fn write_headers(&self, header: &GadgetHeader) -> Result<(), GadgetError> {
        for f in &self.files {
            f.write_header(header)?;
        }
        Ok(())
    }
}

/// Resolve the opening path: the file itself, or the `.0` member of a
/// numbered set. Returns the path to open plus the numbering base if the
/// name carries a numeric suffix.
fn resolve_first_file(path: &Path) -> (PathBuf, Option<PathBuf>) {
    if !path.exists() {
        let candidate = PathBuf::from(format!("{}.0", path.display()));
        if candidate.exists() {
            return (candidate, Some(path.to_path_buf()));
        }
    }
    let base = path.to_str().and_then(|s| {
        s.rsplit_once('.').and_then(|(stem, suffix)| {
            suffix.parse::<u32>().ok().map(|_| PathBuf::from(stem))
        })
    });
    (path.to_path_buf(), base)
}

/// Whether two file headers describe the same snapshot.
fn headers_agree(a: &GadgetHeader, b: &GadgetHeader) -> bool {
    a.time == b.time
        && a.redshift == b.redshift
        && a.flag_sfr == b.flag_sfr
        && a.flag_feedback == b.flag_feedback
        && a.flag_cooling == b.flag_cooling
        && a.num_files == b.num_files
        && a.box_size == b.box_size
        && a.omega0 == b.omega0
        && a.omega_lambda == b.omega_lambda
        && a.hubble_param == b.hubble_param
        && a.flag_stellarage == b.flag_stellarage
        && a.flag_metals == b.flag_metals
        && a.mass == b.mass
        && a.npart_total == b.npart_total
}

/// Units attached to a quantity at load time.
fn quantity_units(config: &GadgetConfig, name: &str) -> Units {
    match name {
        "pos" | "smooth" => config.pos_units,
        "vel" => config.vel_units,
        "mass" => config.mass_units,
        "rho" => config.mass_units / config.pos_units.powi(3),
        "u" => config.vel_units.powi(2),
        _ => Units::dimensionless(),
    }
}
