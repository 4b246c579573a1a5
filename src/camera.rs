//! Pinhole camera model and sensor configuration.

use nalgebra::{Matrix3, Vector3};

/// Sensor modality the keyframes were produced with.
///
/// The sensor decides the neighbor count used by triangulation and fusion,
/// the observation threshold applied by map-point culling, which parallax
/// branch triangulation may take, and whether keyframe culling restricts
/// itself to close stereo points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Monocular,
    Stereo,
    RgbD,
}

impl Sensor {
    pub fn is_monocular(&self) -> bool {
        matches!(self, Sensor::Monocular)
    }

    /// Number of covisibility neighbors visited by triangulation and fusion.
    pub fn triangulation_neighbors(&self) -> usize {
        if self.is_monocular() {
            20
        } else {
            10
        }
    }

    /// Observation count at or below which a recent map point is culled.
    pub fn culling_obs_threshold(&self) -> usize {
        if self.is_monocular() {
            2
        } else {
            3
        }
    }
}

/// Pinhole intrinsics of a single camera.
///
/// Poses are world-to-camera, so projecting a world point is
/// `pose.transform_point(p)` followed by [`CameraModel::project`].
#[derive(Debug, Clone, Copy)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub inv_fx: f64,
    pub inv_fy: f64,
    pub width: f64,
    pub height: f64,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: f64, height: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            inv_fx: 1.0 / fx,
            inv_fy: 1.0 / fy,
            width,
            height,
        }
    }

    /// Calibration matrix K.
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// The caller is responsible for checking `p_cam.z > 0` first.
    pub fn project(&self, p_cam: &Vector3<f64>) -> (f64, f64) {
        let inv_z = 1.0 / p_cam.z;
        (
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        )
    }

    /// Back-project a pixel to the unit-depth ray in the camera frame.
    pub fn backproject(&self, u: f64, v: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * self.inv_fx, (v - self.cy) * self.inv_fy, 1.0)
    }

    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && u < self.width && v >= 0.0 && v < self.height
    }
}
