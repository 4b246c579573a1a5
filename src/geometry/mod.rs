//! Geometry utilities: SE3 transforms and small matrix helpers.

pub mod se3;

pub use se3::SE3;

use nalgebra::{Matrix3, Vector3};

/// Skew-symmetric (cross-product) matrix of a vector.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skew_annihilates_own_vector() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        assert!((skew(&v) * v).norm() < 1e-12);
    }

    #[test]
    fn test_skew_is_antisymmetric() {
        let s = skew(&Vector3::new(-0.5, 4.0, 2.0));
        assert!((s + s.transpose()).norm() < 1e-12);
    }
}
