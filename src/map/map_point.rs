//! MapPoint - a triangulated 3D landmark.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::keyframe::{Descriptor, KeyFrame};
use super::types::{KeyFrameId, MapPointId};

/// A 3D landmark observed by one or more keyframes.
///
/// Besides its world position, a map point tracks which keyframe slots
/// observe it, a representative descriptor (the observation descriptor
/// with the smallest median Hamming distance to the others), the mean
/// viewing direction, and the distance range over which its scale is
/// valid. The `visible`/`found` counters feed the found ratio used by
/// map-point culling.
#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// World position.
    pub position: Vector3<f64>,

    /// Representative descriptor over all observations.
    pub descriptor: Descriptor,

    /// Observing keyframe -> feature slot in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction, unit length once observed.
    pub normal: Vector3<f64>,

    /// Closest distance at which the point's scale is still valid.
    pub min_distance: f64,

    /// Farthest such distance.
    pub max_distance: f64,

    /// Times the tracker predicted this point visible.
    pub visible_count: u32,

    /// Times the tracker actually matched it.
    pub found_count: u32,

    /// Keyframe that first observed this point.
    pub first_kf_id: KeyFrameId,

    /// Marks this point as already queued as a fusion candidate for the
    /// given current keyframe.
    pub fuse_candidate_for_kf: Option<KeyFrameId>,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 0,
            found_count: 0,
            first_kf_id,
            fuse_candidate_for_kf: None,
            is_bad: false,
        }
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    pub(crate) fn add_observation(&mut self, kf_id: KeyFrameId, slot: usize) {
        self.observations.insert(kf_id, slot);
    }

    pub(crate) fn erase_observation(&mut self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.remove(&kf_id)
    }

    /// found / visible, defaulting to 1.0 for never-predicted points so a
    /// freshly triangulated point is not penalized.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    /// Called by the tracker when the point falls into a frame's frustum.
    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    /// Called by the tracker when the point is matched in a frame.
    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }

    /// Predict the pyramid octave this point would be detected at when
    /// viewed from `distance` by `kf`.
    pub fn predict_scale(&self, distance: f64, kf: &KeyFrame) -> usize {
        if distance <= 0.0 || self.max_distance <= 0.0 {
            return 0;
        }
        let ratio = self.max_distance / distance;
        let level = (ratio.ln() / kf.pyramid.scale_factor.ln()).ceil();
        (level.max(0.0) as usize).min(kf.pyramid.n_levels() - 1)
    }

    pub(crate) fn set_bad(&mut self) {
        self.is_bad = true;
        self.observations.clear();
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("found_ratio", &self.found_ratio())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
