//! In-memory snapshot: named particle arrays, families, derived quantities.
//!
//! This is the thin surface the I/O and rendering layers communicate
//! through. Arrays are dense, one row per particle, in particle-type order.
//! Quantities that are computed rather than loaded (`smooth`, `rho`) go
//! through an explicit derived-quantity registry and are memoized into the
//! array store on first access.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use thiserror::Error;

use crate::config::SphConfig;
use crate::io::gadget::{BlockData, GadgetError};
use crate::io::snap::GadgetSnapshot;
use crate::tree::KdTree;
use crate::units::{Units, UnitsError};

/// Errors from the snapshot, smoothing and rendering layers.
#[derive(Debug, Error)]
pub enum SphError {
    #[error(transparent)]
    Gadget(#[from] GadgetError),

    #[error(transparent)]
    Units(#[from] UnitsError),

    #[error("array {0} is not available for all families")]
    NotForAllFamilies(String),

    #[error("no array {0} on disk for the requested family")]
    NoSuchArray(String),

    #[error("array {0} is not present in this snapshot")]
    MissingArray(String),

    #[error("kernel mismatch: {0}")]
    KernelMismatch(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Particle families, one per Gadget particle type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Gas,
    DarkMatter,
    Disk,
    Bulge,
    Star,
    Boundary,
}

impl Family {
    pub const ALL: [Family; 6] = [
        Family::Gas,
        Family::DarkMatter,
        Family::Disk,
        Family::Bulge,
        Family::Star,
        Family::Boundary,
    ];

    /// The Gadget particle type index this family maps to.
    pub fn gadget_type(self) -> usize {
        match self {
            Family::Gas => 0,
            Family::DarkMatter => 1,
            Family::Disk => 2,
            Family::Bulge => 3,
            Family::Star => 4,
            Family::Boundary => 5,
        }
    }

    pub fn from_gadget_type(t: usize) -> Option<Family> {
        Family::ALL.get(t).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::Gas => "gas",
            Family::DarkMatter => "dm",
            Family::Disk => "disk",
            Family::Bulge => "bulge",
            Family::Star => "star",
            Family::Boundary => "bndry",
        }
    }
}

/// A dense per-particle array with column count and attached units.
#[derive(Debug, Clone)]
pub struct SimArray {
    pub data: BlockData,
    /// Columns per particle: 3 for vectors, 1 for scalars.
    pub dims: usize,
    pub units: Units,
}

impl SimArray {
    pub fn from_f64(data: Vec<f64>, dims: usize, units: Units) -> Self {
        SimArray {
            data: BlockData::F64(data),
            dims,
            units,
        }
    }

    pub fn from_f32(data: Vec<f32>, dims: usize, units: Units) -> Self {
        SimArray {
            data: BlockData::F32(data),
            dims,
            units,
        }
    }

    /// Number of particle rows.
    pub fn rows(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    pub fn to_f64(&self) -> Vec<f64> {
        self.data.to_f64()
    }
}

type DerivedFn = fn(&mut SimSnap) -> Result<SimArray, SphError>;

/// The in-memory snapshot.
pub struct SimSnap {
    arrays: HashMap<String, SimArray>,
    npart: [u64; 6],
    pub config: SphConfig,
    source: Option<GadgetSnapshot>,
    derived: Vec<(&'static str, DerivedFn)>,
    computed: HashSet<String>,
    /// Neighbour trees, built lazily on first smoothing pass. One entry for
    /// an unsharded build, K entries for a stride-K sharded build.
    pub(crate) trees: Option<Vec<KdTree>>,
}

impl SimSnap {
    /// Wrap a loaded multi-file snapshot.
    pub fn new(source: GadgetSnapshot, config: SphConfig) -> Self {
        let npart = source.npart();
        SimSnap {
            arrays: HashMap::new(),
            npart,
            config,
            source: Some(source),
            derived: default_registry(),
            computed: HashSet::new(),
            trees: None,
        }
    }

    /// Build a snapshot from in-memory arrays, gas particles only. Used for
    /// synthetic data and tests.
    pub fn from_arrays(n: usize, arrays: Vec<(&str, SimArray)>, config: SphConfig) -> Self {
        let mut snap = SimSnap {
            arrays: HashMap::new(),
            npart: [n as u64, 0, 0, 0, 0, 0],
            config,
            source: None,
            derived: default_registry(),
            computed: HashSet::new(),
            trees: None,
        };
        for (name, arr) in arrays {
            snap.arrays.insert(name.to_string(), arr);
        }
        snap
    }

    /// Total particle count.
    pub fn len(&self) -> usize {
        self.npart.iter().sum::<u64>() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn npart(&self) -> [u64; 6] {
        self.npart
    }

    /// Families present, with the particle row range each occupies.
    pub fn families(&self) -> Vec<(Family, Range<usize>)> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        for f in Family::ALL {
            let n = self.npart[f.gadget_type()] as usize;
            if n > 0 {
                out.push((f, offset..offset + n));
            }
            offset += n;
        }
        out
    }

    /// True if `name` is served by the derived-quantity registry.
    pub fn is_derived(&self, name: &str) -> bool {
        self.derived.iter().any(|(n, _)| *n == name)
    }

    /// Fetch an array, loading it from disk or computing it through the
    /// derived registry if necessary. Derived results are memoized.
    pub fn get(&mut self, name: &str) -> Result<&SimArray, SphError> {
        if !self.arrays.contains_key(name) {
            if let Some(f) = self
                .derived
                .iter()
                .find(|(n, _)| *n == name)
                .map(|&(_, f)| f)
            {
                let arr = f(self)?;
                self.arrays.insert(name.to_string(), arr);
                self.computed.insert(name.to_string());
            } else if let Some(source) = self.source.as_ref() {
                let arr = source.read_quantity(name, None)?;
                self.arrays.insert(name.to_string(), arr);
            } else {
                return Err(SphError::MissingArray(name.to_string()));
            }
        }
        Ok(&self.arrays[name])
    }

    /// Fetch an array flattened to f64, cloning.
    pub fn get_f64(&mut self, name: &str) -> Result<Vec<f64>, SphError> {
        Ok(self.get(name)?.to_f64())
    }

    /// Fetch one column of a 3-vector array (0 = x, 1 = y, 2 = z).
    pub fn get_column(&mut self, name: &str, col: usize) -> Result<Vec<f64>, SphError> {
        let arr = self.get(name)?;
        let dims = arr.dims;
        assert!(col < dims);
        let flat = arr.to_f64();
        Ok(flat.iter().skip(col).step_by(dims).copied().collect())
    }

    /// One family's rows of an array, flattened to f64.
    pub fn get_family_f64(&mut self, name: &str, family: Family) -> Result<Vec<f64>, SphError> {
        let range = self
            .families()
            .into_iter()
            .find(|(f, _)| *f == family)
            .map(|(_, r)| r)
            .unwrap_or(0..0);
        let arr = self.get(name)?;
        let dims = arr.dims;
        let flat = arr.to_f64();
        Ok(flat[range.start * dims..range.end * dims].to_vec())
    }

    /// Units of an array without forcing a load of data already present.
    pub fn units_of(&mut self, name: &str) -> Result<Units, SphError> {
        Ok(self.get(name)?.units)
    }

    /// Install or replace an array.
    pub fn set(&mut self, name: &str, array: SimArray) {
        // Positions changed means any cached tree is stale.
        if name == "pos" {
            self.trees = None;
        }
        self.arrays.insert(name.to_string(), array);
    }

    pub fn remove(&mut self, name: &str) -> Option<SimArray> {
        self.computed.remove(name);
        self.arrays.remove(name)
    }

    pub fn has_array(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    /// Write the header and every loaded, non-derived array back to the
    /// source files. Computed quantities are never written.
    pub fn write_back(&mut self) -> Result<(), SphError> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| SphError::MissingArray("snapshot has no backing files".into()))?;
        let result = (|| {
            let header = source.header().clone();
            source.write_headers(&header)?;
            let mut names: Vec<String> = self
                .arrays
                .keys()
                .filter(|n| !self.is_derived(n) && !self.computed.contains(*n))
                .cloned()
                .collect();
            names.sort();
            for name in names {
                source.write_quantity(&name, &self.arrays[&name], None)?;
            }
            Ok(())
        })();
        self.source = Some(source);
        result
    }

    pub fn source(&self) -> Option<&GadgetSnapshot> {
        self.source.as_ref()
    }
}

fn default_registry() -> Vec<(&'static str, DerivedFn)> {
    vec![
        ("smooth", crate::smooth::smooth),
        ("rho", crate::smooth::rho),
    ]
}
