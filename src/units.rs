//! Symbolic unit bookkeeping for particle arrays and rendered outputs.
//!
//! Rendered images carry units of `qty × mass / (rho × smooth^h_power)`;
//! this module tracks just enough dimensional structure to form such
//! composites and to convert between compatible unit systems. A full unit
//! library (named units, parsing, physical constants) is out of scope.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a conversion between incompatible dimensions is
/// requested.
#[derive(Debug, Error)]
#[error("incompatible units: cannot convert {from} to {to}")]
pub struct UnitsError {
    pub from: Units,
    pub to: Units,
}

/// A unit expressed as a scale factor times integer powers of the three
/// base dimensions (mass, length, time).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Units {
    /// Multiplicative scale relative to the (arbitrary) base system.
    pub scale: f64,
    /// Power of the mass dimension.
    pub mass: i32,
    /// Power of the length dimension.
    pub length: i32,
    /// Power of the time dimension.
    pub time: i32,
}

impl Units {
    pub fn dimensionless() -> Self {
        Units {
            scale: 1.0,
            mass: 0,
            length: 0,
            time: 0,
        }
    }

    pub fn mass_unit(scale: f64) -> Self {
        Units {
            scale,
            mass: 1,
            length: 0,
            time: 0,
        }
    }

    pub fn length_unit(scale: f64) -> Self {
        Units {
            scale,
            mass: 0,
            length: 1,
            time: 0,
        }
    }

    pub fn velocity_unit(scale: f64) -> Self {
        Units {
            scale,
            mass: 0,
            length: 1,
            time: -1,
        }
    }

    /// Raise to an integer power.
    pub fn powi(self, n: i32) -> Self {
        Units {
            scale: self.scale.powi(n),
            mass: self.mass * n,
            length: self.length * n,
            time: self.time * n,
        }
    }

    /// True if the two units share the same dimension exponents.
    pub fn compatible(&self, other: &Units) -> bool {
        self.mass == other.mass && self.length == other.length && self.time == other.time
    }

    /// The numeric factor converting a value in `self` to a value in `to`.
    ///
    /// Fails if the dimensions differ.
    pub fn ratio(&self, to: &Units) -> Result<f64, UnitsError> {
        if !self.compatible(to) {
            return Err(UnitsError {
                from: *self,
                to: *to,
            });
        }
        Ok(self.scale / to.scale)
    }
}

impl std::ops::Mul for Units {
    type Output = Units;

    fn mul(self, rhs: Units) -> Units {
        Units {
            scale: self.scale * rhs.scale,
            mass: self.mass + rhs.mass,
            length: self.length + rhs.length,
            time: self.time + rhs.time,
        }
    }
}

impl std::ops::Div for Units {
    type Output = Units;

    fn div(self, rhs: Units) -> Units {
        Units {
            scale: self.scale / rhs.scale,
            mass: self.mass - rhs.mass,
            length: self.length - rhs.length,
            time: self.time - rhs.time,
        }
    }
}

impl std::fmt::Display for Units {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.6e} M^{} L^{} T^{}",
            self.scale, self.mass, self.length, self.time
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ratio_same_dimension() {
        let kpc = Units::length_unit(1.0);
        let mpc = Units::length_unit(1000.0);
        assert_relative_eq!(mpc.ratio(&kpc).unwrap(), 1000.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ratio_incompatible_fails() {
        let m = Units::mass_unit(1.0);
        let l = Units::length_unit(1.0);
        assert!(m.ratio(&l).is_err());
    }

    #[test]
    fn test_density_composite() {
        let m = Units::mass_unit(2.0);
        let l = Units::length_unit(3.0);
        let rho = m / l.powi(3);
        assert_eq!(rho.mass, 1);
        assert_eq!(rho.length, -3);
        assert_relative_eq!(rho.scale, 2.0 / 27.0, epsilon = 1e-12);
    }

    #[test]
    fn test_image_weighting_is_dimensionless() {
        // qty * mass / (rho * smooth^3) with qty = rho cancels to mass/...
        let m = Units::mass_unit(1.0);
        let l = Units::length_unit(1.0);
        let rho = m / l.powi(3);
        let w = rho * m / (rho * l.powi(3));
        assert!(w.compatible(&(m / l.powi(3) * l.powi(3))));
    }
}
