//! Runtime configuration.
//!
//! Block name lists for the legacy format, the array-name translation
//! table, smoothing parameters and threading all live in explicit structs
//! passed to constructors. Build once at startup and treat as immutable.

use serde::{Deserialize, Serialize};

use crate::units::Units;

/// Configuration for the Gadget container format layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GadgetConfig {
    /// Ordered block names for legacy (format 1) files, which carry no
    /// names on disk. Consumed in file order during the scan.
    pub legacy_block_names: Vec<String>,
    /// Mapping from on-disk 4-character block names to logical array names.
    pub name_map: Vec<(String, String)>,
    /// Units attached to the position/velocity/mass arrays at load time.
    pub pos_units: Units,
    pub vel_units: Units,
    pub mass_units: Units,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        GadgetConfig {
            legacy_block_names: ["HEAD", "POS ", "VEL ", "ID  ", "MASS", "U   ", "RHO ", "HSML"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            name_map: [
                ("POS ", "pos"),
                ("VEL ", "vel"),
                ("ID  ", "id"),
                ("MASS", "mass"),
                ("U   ", "u"),
                ("RHO ", "rho"),
                ("HSML", "smooth"),
            ]
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect(),
            pos_units: Units::length_unit(1.0),
            vel_units: Units::velocity_unit(1.0),
            mass_units: Units::mass_unit(1.0),
        }
    }
}

impl GadgetConfig {
    /// Normalize a name into on-disk form: upper case, space-padded to 4.
    pub fn disk_name(name: &str) -> String {
        let mut n = name.to_uppercase();
        n.truncate(4);
        format!("{:<4}", n)
    }

    /// Translate an on-disk block name to a logical array name.
    ///
    /// Names absent from the map fall back to lower case with trailing
    /// spaces trimmed.
    pub fn logical_name(&self, disk: &str) -> String {
        for (d, l) in &self.name_map {
            if d == disk {
                return l.clone();
            }
        }
        disk.trim_end().to_lowercase()
    }

    /// Translate a logical array name to its on-disk block name.
    pub fn block_name(&self, logical: &str) -> String {
        for (d, l) in &self.name_map {
            if l == logical {
                return d.clone();
            }
        }
        Self::disk_name(logical)
    }
}

/// Configuration for tree construction, smoothing and rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SphConfig {
    /// Number of nearest neighbours used for smoothing length and density.
    pub smooth_particles: usize,
    /// Maximum number of points per tree leaf.
    pub tree_leafsize: usize,
    /// Shard count for parallel tree build; 0 or 1 builds a single tree.
    pub threaded_smooth: usize,
    /// Worker count for threaded rendering; 0 or 1 renders single-threaded.
    pub threaded_image: usize,
    /// Default for the multi-resolution rendering acceleration.
    pub approximate_fast: bool,
}

impl Default for SphConfig {
    fn default() -> Self {
        SphConfig {
            smooth_particles: 32,
            tree_leafsize: 16,
            threaded_smooth: 0,
            threaded_image: 0,
            approximate_fast: true,
        }
    }
}
