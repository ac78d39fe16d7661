//! # sphrast: Gadget snapshot I/O and SPH kernel rasterization
//!
//! This crate reads and writes Gadget-format N-body/SPH snapshots (both the
//! legacy block-list format and the self-describing "format 2" variant,
//! in either byte order, split across multiple files) and renders particle
//! fields with smoothed-particle-hydrodynamics kernel-weighted scatter.
//!
//! ## Architecture
//!
//! - `io`: the segmented binary container format (block table, header,
//!   type/presence heuristics) and the multi-file logical snapshot
//! - `snap`: in-memory particle arrays, families, derived-quantity registry
//! - `tree`: k-d tree for nearest-neighbour queries, optionally sharded
//! - `smooth`: per-particle smoothing length and SPH density estimation
//! - `kernel`: compactly-supported smoothing kernels (spline, projected,
//!   top-hat) with a cached sample table
//! - `render`: kernel-weighted deposition onto 2D images, 3D grids and
//!   spherical shells, with multi-resolution and threaded acceleration
//! - `units`: symbolic unit bookkeeping for rendered outputs
//!
//! The typical pipeline: open a snapshot, let `smooth`/`rho` be computed on
//! demand through the derived-quantity registry, then call one of the
//! renderers in `render`.

pub mod config;
pub mod io;
pub mod kernel;
pub mod render;
pub mod smooth;
pub mod snap;
pub mod tree;
pub mod units;

pub use config::{GadgetConfig, SphConfig};
pub use io::gadget::{GadgetError, GadgetFile, GadgetHeader};
pub use io::snap::GadgetSnapshot;
pub use kernel::{CubicSpline, Kernel, Projected, TopHat};
pub use render::{
    render_image, render_spherical, to_3d_grid, Grid3, GridOptions, Image, ImageOptions,
    SphericalOptions, SphericalView,
};
pub use snap::{Family, SimArray, SimSnap, SphError};
pub use tree::KdTree;
pub use units::{Units, UnitsError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
