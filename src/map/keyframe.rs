//! KeyFrame - a pose snapshot attached to the map.
//!
//! Keyframes are the nodes of the covisibility graph. Each one carries the
//! per-feature arrays produced by the front end (undistorted keypoints,
//! descriptors, stereo right-image coordinates and depths), its intrinsics,
//! its world-to-camera pose, and the slot-indexed associations to map
//! points. Culling marks a keyframe bad instead of destroying it, so stale
//! ids held by other threads keep resolving.

use std::collections::HashMap;

use nalgebra::{Matrix3, Vector3};

use crate::camera::CameraModel;
use crate::geometry::SE3;

use super::types::{KeyFrameId, MapPointId};

/// 256-bit ORB descriptor.
pub type Descriptor = [u8; 32];

/// An undistorted keypoint with its pyramid octave.
#[derive(Debug, Clone, Copy)]
pub struct KeyPoint {
    pub x: f64,
    pub y: f64,
    pub octave: usize,
}

/// Per-octave scale factors and squared scale uncertainties of the
/// feature pyramid the keypoints were extracted from.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    /// Scale ratio between consecutive octaves (typically 1.2).
    pub scale_factor: f64,
    /// `scale_factor^i` for octave i.
    pub factors: Vec<f64>,
    /// `factors[i]^2`, the reprojection variance scale at octave i.
    pub sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(scale_factor: f64, n_levels: usize) -> Self {
        let factors: Vec<f64> = (0..n_levels)
            .map(|i| scale_factor.powi(i as i32))
            .collect();
        let sigma2 = factors.iter().map(|f| f * f).collect();
        Self {
            scale_factor,
            factors,
            sigma2,
        }
    }

    pub fn n_levels(&self) -> usize {
        self.factors.len()
    }
}

/// Everything the front end hands over when it spawns a keyframe.
///
/// The per-feature arrays are parallel: slot i of `keypoints`,
/// `descriptors`, `u_right` and `depth` all describe the same feature.
/// `u_right` and `depth` hold a negative sentinel where no stereo/RGB-D
/// measurement exists.
pub struct KeyFrameData {
    pub pose: SE3,
    pub camera: CameraModel,
    pub baseline: f64,
    pub bf: f64,
    pub th_depth: f64,
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub u_right: Vec<f64>,
    pub depth: Vec<f64>,
    pub pyramid: ScalePyramid,
}

impl KeyFrameData {
    /// Monocular keyframe: no stereo measurements, zero baseline.
    pub fn monocular(
        pose: SE3,
        camera: CameraModel,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        pyramid: ScalePyramid,
    ) -> Self {
        let n = keypoints.len();
        Self {
            pose,
            camera,
            baseline: 0.0,
            bf: 0.0,
            th_depth: 0.0,
            keypoints,
            descriptors,
            u_right: vec![-1.0; n],
            depth: vec![-1.0; n],
            pyramid,
        }
    }
}

/// A keyframe in the map.
#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// World-to-camera transform (T_cw).
    pub pose: SE3,

    pub camera: CameraModel,

    /// Stereo baseline in meters, 0 for monocular.
    pub baseline: f64,

    /// `baseline * fx`.
    pub bf: f64,

    /// Depth below which a stereo point counts as "close".
    pub th_depth: f64,

    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,

    /// Right-image u coordinate per feature, negative when unavailable.
    pub u_right: Vec<f64>,

    /// Measured depth per feature, negative when unavailable.
    pub depth: Vec<f64>,

    pub pyramid: ScalePyramid,

    /// Slot index -> associated map point.
    pub map_point_ids: Vec<Option<MapPointId>>,

    /// Covisibility adjacency: neighbor -> shared observation count.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    /// Neighbors ordered by descending weight, rebuilt lazily.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,
    covisibility_dirty: bool,

    /// Marks this keyframe as already collected as a fusion target for the
    /// given current keyframe, so neighbor expansion does not revisit it.
    pub fuse_target_for_kf: Option<KeyFrameId>,

    pub is_bad: bool,
}

impl KeyFrame {
    pub fn new(id: KeyFrameId, data: KeyFrameData) -> Self {
        let n = data.keypoints.len();
        Self {
            id,
            pose: data.pose,
            camera: data.camera,
            baseline: data.baseline,
            bf: data.bf,
            th_depth: data.th_depth,
            keypoints: data.keypoints,
            descriptors: data.descriptors,
            u_right: data.u_right,
            depth: data.depth,
            pyramid: data.pyramid,
            map_point_ids: vec![None; n],
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
            fuse_target_for_kf: None,
            is_bad: false,
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        let r_inv = self.pose.rotation.inverse();
        -(r_inv * self.pose.translation)
    }

    /// World-to-camera rotation matrix.
    pub fn rotation(&self) -> Matrix3<f64> {
        self.pose.rotation_matrix()
    }

    /// World-to-camera translation.
    pub fn translation(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// Whether feature `idx` carries a stereo/RGB-D measurement.
    pub fn has_stereo_measurement(&self, idx: usize) -> bool {
        self.u_right.get(idx).is_some_and(|&ur| ur >= 0.0)
    }

    /// Back-project feature `idx` through its measured depth into world
    /// coordinates. `None` when no depth is available.
    pub fn unproject_stereo(&self, idx: usize) -> Option<Vector3<f64>> {
        let z = *self.depth.get(idx)?;
        if z <= 0.0 {
            return None;
        }
        let kp = &self.keypoints[idx];
        let p_cam = self.camera.backproject(kp.x, kp.y) * z;
        Some(self.pose.inverse().transform_point(&p_cam))
    }

    // ------------------------------------------------------------------
    // Map point slots
    // ------------------------------------------------------------------

    pub fn map_point(&self, idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(idx).copied().flatten()
    }

    pub(crate) fn set_map_point(&mut self, idx: usize, mp_id: MapPointId) {
        if idx < self.map_point_ids.len() {
            self.map_point_ids[idx] = Some(mp_id);
        }
    }

    pub(crate) fn erase_map_point(&mut self, idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(idx).and_then(|slot| slot.take())
    }

    /// All occupied slots as (slot, map point) pairs.
    pub fn observed_points(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(i, mp)| mp.map(|id| (i, id)))
    }

    // ------------------------------------------------------------------
    // Covisibility graph
    // ------------------------------------------------------------------

    pub fn covisibility_weight(&self, other: KeyFrameId) -> usize {
        self.covisibility_weights.get(&other).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    pub(crate) fn set_covisibility_weight(&mut self, other: KeyFrameId, weight: usize) {
        if other == self.id {
            return;
        }
        if weight == 0 {
            self.covisibility_weights.remove(&other);
        } else {
            self.covisibility_weights.insert(other, weight);
        }
        self.covisibility_dirty = true;
    }

    pub(crate) fn erase_covisibility(&mut self, other: KeyFrameId) {
        if self.covisibility_weights.remove(&other).is_some() {
            self.covisibility_dirty = true;
        }
    }

    pub(crate) fn clear_covisibility(&mut self) {
        self.covisibility_weights.clear();
        self.ordered_covisibles.clear();
        self.covisibility_dirty = false;
    }

    pub(crate) fn replace_covisibility(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_dirty = true;
    }

    /// The `n` neighbors sharing the most observations, best first.
    pub fn best_covisibles(&mut self, n: usize) -> Vec<KeyFrameId> {
        self.ensure_ordered();
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// All neighbors ordered by descending weight.
    pub fn covisible_keyframes(&mut self) -> Vec<KeyFrameId> {
        self.ensure_ordered();
        self.ordered_covisibles.iter().map(|(id, _)| *id).collect()
    }

    fn ensure_ordered(&mut self) {
        if !self.covisibility_dirty {
            return;
        }
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(&id, &w)| (id, w))
            .collect();
        // Tie-break on id for a deterministic ordering.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }

    // ------------------------------------------------------------------
    // Spatial queries
    // ------------------------------------------------------------------

    /// Indices of keypoints within `radius` pixels of (u, v), optionally
    /// restricted to an octave range.
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        let mut indices = Vec::new();

        for (i, kp) in self.keypoints.iter().enumerate() {
            if min_level.is_some_and(|min| kp.octave < min) {
                continue;
            }
            if max_level.is_some_and(|max| kp.octave > max) {
                continue;
            }
            let du = kp.x - u;
            let dv = kp.y - v;
            if du * du + dv * dv <= radius_sq {
                indices.push(i);
            }
        }

        indices
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("num_features", &self.num_features())
            .field(
                "num_map_points",
                &self.map_point_ids.iter().flatten().count(),
            )
            .field("covisibles", &self.covisibility_weights.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keyframe(id: u64, n_features: usize) -> KeyFrame {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0);
        let keypoints = (0..n_features)
            .map(|i| KeyPoint {
                x: 10.0 * i as f64,
                y: 5.0 * i as f64,
                octave: 0,
            })
            .collect();
        let descriptors = vec![[0u8; 32]; n_features];
        KeyFrame::new(
            KeyFrameId(id),
            KeyFrameData::monocular(
                SE3::identity(),
                camera,
                keypoints,
                descriptors,
                ScalePyramid::new(1.2, 8),
            ),
        )
    }

    #[test]
    fn test_slot_association() {
        let mut kf = test_keyframe(1, 10);

        kf.set_map_point(3, MapPointId(100));
        assert_eq!(kf.map_point(3), Some(MapPointId(100)));
        assert_eq!(kf.map_point(4), None);

        assert_eq!(kf.erase_map_point(3), Some(MapPointId(100)));
        assert_eq!(kf.map_point(3), None);
        assert_eq!(kf.observed_points().count(), 0);
    }

    #[test]
    fn test_best_covisibles_ordering() {
        let mut kf = test_keyframe(1, 0);
        kf.set_covisibility_weight(KeyFrameId(2), 50);
        kf.set_covisibility_weight(KeyFrameId(3), 100);
        kf.set_covisibility_weight(KeyFrameId(4), 25);

        assert_eq!(
            kf.best_covisibles(2),
            vec![KeyFrameId(3), KeyFrameId(2)]
        );
        assert_eq!(kf.covisibility_weight(KeyFrameId(9)), 0);

        // Dropping a weight to zero removes the edge.
        kf.set_covisibility_weight(KeyFrameId(3), 0);
        assert_eq!(kf.best_covisibles(10).len(), 2);
    }

    #[test]
    fn test_no_self_edge() {
        let mut kf = test_keyframe(1, 0);
        kf.set_covisibility_weight(KeyFrameId(1), 10);
        assert_eq!(kf.covisibility_weight(KeyFrameId(1)), 0);
    }

    #[test]
    fn test_unproject_stereo() {
        let mut kf = test_keyframe(0, 3);
        // Feature 1 at the principal point with 2m depth.
        kf.keypoints[1] = KeyPoint {
            x: 320.0,
            y: 240.0,
            octave: 0,
        };
        kf.depth[1] = 2.0;

        assert_eq!(kf.unproject_stereo(0), None);
        let p = kf.unproject_stereo(1).unwrap();
        assert!((p - Vector3::new(0.0, 0.0, 2.0)).norm() < 1e-12);
    }

    #[test]
    fn test_features_in_area_levels() {
        let mut kf = test_keyframe(0, 4);
        kf.keypoints = vec![
            KeyPoint {
                x: 100.0,
                y: 100.0,
                octave: 0,
            },
            KeyPoint {
                x: 102.0,
                y: 101.0,
                octave: 2,
            },
            KeyPoint {
                x: 103.0,
                y: 99.0,
                octave: 5,
            },
            KeyPoint {
                x: 300.0,
                y: 300.0,
                octave: 0,
            },
        ];

        let found = kf.features_in_area(100.0, 100.0, 10.0, None, None);
        assert_eq!(found, vec![0, 1, 2]);

        let found = kf.features_in_area(100.0, 100.0, 10.0, Some(1), Some(3));
        assert_eq!(found, vec![1]);
    }
}
