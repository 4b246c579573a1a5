//! Map - owner of the keyframe and map-point tables.
//!
//! The map assigns monotonic ids, keeps every keyframe/map-point
//! cross-link bidirectional, and maintains the covisibility weights so
//! that an edge weight always equals the number of currently shared
//! non-bad observations. Culled entities stay resident as tombstones:
//! lookups by a stale id succeed and report `is_bad`, while the iteration
//! methods skip them.

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::debug;

use super::keyframe::{Descriptor, KeyFrame, KeyFrameData};
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};
use crate::matching::descriptor_distance;

pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,
    next_kf_id: u64,
    next_mp_id: u64,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Insert a keyframe built by the tracker, assigning the next id.
    pub fn insert_keyframe(&mut self, data: KeyFrameData) -> KeyFrameId {
        let id = KeyFrameId(self.next_kf_id);
        self.next_kf_id += 1;
        self.keyframes.insert(id, KeyFrame::new(id, data));
        id
    }

    /// Create a map point with no observations yet.
    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        id
    }

    // ------------------------------------------------------------------
    // Lookup and iteration
    // ------------------------------------------------------------------

    /// Resolve a keyframe id, including tombstones. Callers must check
    /// `is_bad` before geometric use.
    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    /// Non-bad keyframes.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values().filter(|kf| !kf.is_bad)
    }

    /// Non-bad map points.
    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values().filter(|mp| !mp.is_bad)
    }

    pub fn keyframes_in_map(&self) -> usize {
        self.keyframes().count()
    }

    pub fn map_points_in_map(&self) -> usize {
        self.map_points().count()
    }

    // ------------------------------------------------------------------
    // Associations
    // ------------------------------------------------------------------

    /// Create the bidirectional observation (kf, slot) -> mp, updating
    /// covisibility weights with every other observer of the point.
    ///
    /// Returns false if either entity is missing or bad.
    pub fn add_observation(&mut self, kf_id: KeyFrameId, slot: usize, mp_id: MapPointId) -> bool {
        let ok = match (self.keyframes.get(&kf_id), self.map_points.get(&mp_id)) {
            (Some(kf), Some(mp)) => !kf.is_bad && !mp.is_bad && slot < kf.num_features(),
            _ => false,
        };
        if !ok {
            return false;
        }

        // A slot holds at most one point; detach a different occupant.
        // A link to the same point (a tracked match awaiting ingestion)
        // stays and is completed below.
        if let Some(prev) = self.keyframes[&kf_id].map_point(slot) {
            if prev != mp_id {
                self.erase_observation(kf_id, prev);
            }
        }

        let mp = self.map_points.get_mut(&mp_id).expect("checked above");
        if mp.observed_by(kf_id) {
            // Idempotent for the same slot; a second slot is refused.
            return mp.observations.get(&kf_id) == Some(&slot);
        }

        let co_observers: Vec<KeyFrameId> =
            mp.observations.keys().copied().filter(|&k| k != kf_id).collect();
        mp.add_observation(kf_id, slot);
        self.keyframes
            .get_mut(&kf_id)
            .expect("checked above")
            .set_map_point(slot, mp_id);

        for other in co_observers {
            let w = self.keyframes[&kf_id].covisibility_weight(other) + 1;
            self.keyframes
                .get_mut(&kf_id)
                .unwrap()
                .set_covisibility_weight(other, w);
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.set_covisibility_weight(kf_id, w);
            }
        }

        true
    }

    /// Record a tracker match: link `slot` of `kf_id` to `mp_id` without
    /// registering the observation. Ingestion of the keyframe completes
    /// the link into a full bidirectional observation.
    pub fn set_tracked_match(&mut self, kf_id: KeyFrameId, slot: usize, mp_id: MapPointId) {
        if !self.map_points.get(&mp_id).is_some_and(|mp| !mp.is_bad) {
            return;
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            if slot < kf.num_features() && kf.map_point(slot).is_none() {
                kf.set_map_point(slot, mp_id);
            }
        }
    }

    /// Remove the observation of `mp_id` by `kf_id`, decrementing the
    /// covisibility weights with the remaining observers.
    ///
    /// A point left with fewer than two observing keyframes no longer
    /// constrains anything and is tombstoned.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId, mp_id: MapPointId) {
        let slot = match self.map_points.get_mut(&mp_id) {
            Some(mp) => match mp.erase_observation(kf_id) {
                Some(slot) => slot,
                None => return,
            },
            None => return,
        };

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            if kf.map_point(slot) == Some(mp_id) {
                kf.erase_map_point(slot);
            }
        }

        let remaining: Vec<KeyFrameId> = self.map_points[&mp_id]
            .observations
            .keys()
            .copied()
            .collect();
        for other in &remaining {
            self.decrement_covisibility(kf_id, *other);
        }

        let dying = {
            let mp = &self.map_points[&mp_id];
            !mp.is_bad && mp.num_observations() < 2
        };
        if dying {
            self.set_map_point_bad(mp_id);
        }
    }

    fn decrement_covisibility(&mut self, a: KeyFrameId, b: KeyFrameId) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(kf) = self.keyframes.get_mut(&from) {
                let w = kf.covisibility_weight(to);
                kf.set_covisibility_weight(to, w.saturating_sub(1));
            }
        }
    }

    /// Recount `kf_id`'s covisibility adjacency from its observations and
    /// mirror the weights onto the neighbors. Idempotent.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let counts: HashMap<KeyFrameId, usize> = {
            let kf = match self.keyframes.get(&kf_id) {
                Some(kf) => kf,
                None => return,
            };
            let mut counts = HashMap::new();
            for (_, mp_id) in kf.observed_points() {
                let mp = match self.map_points.get(&mp_id) {
                    Some(mp) if !mp.is_bad => mp,
                    _ => continue,
                };
                // Tracked matches awaiting ingestion carry a slot link
                // but no observation yet; they share nothing.
                if !mp.observed_by(kf_id) {
                    continue;
                }
                for &observer in mp.observations.keys() {
                    if observer != kf_id {
                        *counts.entry(observer).or_insert(0) += 1;
                    }
                }
            }
            counts
        };

        let previous: Vec<KeyFrameId> = self.keyframes[&kf_id]
            .covisibility_weights()
            .keys()
            .copied()
            .collect();
        for stale in previous.iter().filter(|id| !counts.contains_key(id)) {
            if let Some(other) = self.keyframes.get_mut(stale) {
                other.erase_covisibility(kf_id);
            }
        }
        for (&other_id, &w) in &counts {
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.set_covisibility_weight(kf_id, w);
            }
        }
        self.keyframes
            .get_mut(&kf_id)
            .unwrap()
            .replace_covisibility(counts);
    }

    // ------------------------------------------------------------------
    // Tombstoning
    // ------------------------------------------------------------------

    /// Retire a map point: detach it from every observing keyframe,
    /// fix up covisibility, and leave a bad tombstone behind.
    pub fn set_map_point_bad(&mut self, mp_id: MapPointId) {
        let observers: Vec<(KeyFrameId, usize)> = match self.map_points.get_mut(&mp_id) {
            Some(mp) if !mp.is_bad => {
                let obs = mp.observations.iter().map(|(&k, &s)| (k, s)).collect();
                mp.set_bad();
                obs
            }
            _ => return,
        };

        for &(kf_id, slot) in &observers {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if kf.map_point(slot) == Some(mp_id) {
                    kf.erase_map_point(slot);
                }
            }
        }

        // Every observer pair loses one shared observation.
        for (i, &(a, _)) in observers.iter().enumerate() {
            for &(b, _) in &observers[i + 1..] {
                self.decrement_covisibility(a, b);
            }
        }
    }

    /// Retire a keyframe: detach its observations from every map point,
    /// drop its covisibility edges, and leave a bad tombstone so stale
    /// ids still resolve.
    pub fn set_keyframe_bad(&mut self, kf_id: KeyFrameId) {
        let observed: Vec<MapPointId> = match self.keyframes.get(&kf_id) {
            Some(kf) if !kf.is_bad => kf.observed_points().map(|(_, mp)| mp).collect(),
            _ => return,
        };

        for mp_id in observed {
            self.erase_observation(kf_id, mp_id);
        }

        let neighbors: Vec<KeyFrameId> = self.keyframes[&kf_id]
            .covisibility_weights()
            .keys()
            .copied()
            .collect();
        for other in neighbors {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }

        let kf = self.keyframes.get_mut(&kf_id).unwrap();
        kf.clear_covisibility();
        kf.is_bad = true;
        debug!("{kf_id} marked bad");
    }

    /// Resolve a fusion collision: tombstone `old_id` and migrate its
    /// observations and tracking counters onto `new_id`.
    ///
    /// Keyframes that already observe the surviving point simply lose the
    /// duplicate slot.
    pub fn replace_map_point(&mut self, old_id: MapPointId, new_id: MapPointId) {
        if old_id == new_id {
            return;
        }
        let (observers, visible, found) = match self.map_points.get(&old_id) {
            Some(old) if !old.is_bad => (
                old.observations.iter().map(|(&k, &s)| (k, s)).collect::<Vec<_>>(),
                old.visible_count,
                old.found_count,
            ),
            _ => return,
        };
        if !self.map_points.get(&new_id).is_some_and(|mp| !mp.is_bad) {
            return;
        }

        self.set_map_point_bad(old_id);

        for (kf_id, slot) in observers {
            let already = self.map_points[&new_id].observed_by(kf_id);
            if !already {
                self.add_observation(kf_id, slot, new_id);
            }
        }

        let new_mp = self.map_points.get_mut(&new_id).unwrap();
        new_mp.increase_visible(visible);
        new_mp.increase_found(found);

        self.compute_distinctive_descriptor(new_id);
        self.update_normal_and_depth(new_id);
    }

    // ------------------------------------------------------------------
    // Derived map-point state
    // ------------------------------------------------------------------

    /// Re-elect the representative descriptor: the observation descriptor
    /// with the least median Hamming distance to all the others.
    ///
    /// Observations are visited in keyframe-id order so the result is
    /// deterministic for a given observation set.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) {
        let descriptors: Vec<Descriptor> = {
            let mp = match self.map_points.get(&mp_id) {
                Some(mp) if !mp.is_bad => mp,
                _ => return,
            };
            let mut obs: Vec<(KeyFrameId, usize)> =
                mp.observations.iter().map(|(&k, &s)| (k, s)).collect();
            obs.sort_by_key(|&(k, _)| k);
            obs.iter()
                .filter_map(|&(kf_id, slot)| {
                    let kf = self.keyframes.get(&kf_id)?;
                    if kf.is_bad {
                        return None;
                    }
                    kf.descriptors.get(slot).copied()
                })
                .collect()
        };
        if descriptors.is_empty() {
            return;
        }

        let n = descriptors.len();
        let mut best_idx = 0;
        let mut best_median = u32::MAX;
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n)
                .map(|j| descriptor_distance(&descriptors[i], &descriptors[j]))
                .collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }

        self.map_points.get_mut(&mp_id).unwrap().descriptor = descriptors[best_idx];
    }

    /// Recompute the mean viewing direction and the scale-valid distance
    /// range from the current observation set.
    ///
    /// The range is anchored at the reference observation (the first
    /// observer when it still observes the point) and its octave.
    pub fn update_normal_and_depth(&mut self, mp_id: MapPointId) {
        let (position, observers, first_kf) = match self.map_points.get(&mp_id) {
            Some(mp) if !mp.is_bad && !mp.observations.is_empty() => {
                let mut obs: Vec<(KeyFrameId, usize)> =
                    mp.observations.iter().map(|(&k, &s)| (k, s)).collect();
                obs.sort_by_key(|&(k, _)| k);
                (mp.position, obs, mp.first_kf_id)
            }
            _ => return,
        };

        let mut normal_sum = Vector3::zeros();
        let mut n = 0u32;
        for &(kf_id, _) in &observers {
            let kf = match self.keyframes.get(&kf_id) {
                Some(kf) if !kf.is_bad => kf,
                _ => continue,
            };
            let dir = position - kf.camera_center();
            let norm = dir.norm();
            if norm > 1e-12 {
                normal_sum += dir / norm;
                n += 1;
            }
        }
        if n == 0 {
            return;
        }

        let &(ref_kf_id, ref_slot) = observers
            .iter()
            .find(|&&(k, _)| k == first_kf)
            .unwrap_or(&observers[0]);
        let ref_kf = match self.keyframes.get(&ref_kf_id) {
            Some(kf) if !kf.is_bad => kf,
            _ => return,
        };

        let dist = (position - ref_kf.camera_center()).norm();
        let level = ref_kf.keypoints[ref_slot].octave;
        let level_factor = ref_kf.pyramid.factors[level];
        let n_levels = ref_kf.pyramid.n_levels();
        let max_distance = dist * level_factor;
        let min_distance = max_distance / ref_kf.pyramid.factors[n_levels - 1];

        let mp = self.map_points.get_mut(&mp_id).unwrap();
        mp.normal = normal_sum / n as f64;
        mp.min_distance = min_distance;
        mp.max_distance = max_distance;
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Fractional median (index `(n-1)/q`) of the camera-frame depths of
    /// the points observed by `kf_id`. `None` when nothing is observed.
    pub fn scene_median_depth(&self, kf_id: KeyFrameId, q: usize) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let rz = kf.rotation().row(2).transpose();
        let tz = kf.translation().z;

        let mut depths: Vec<f64> = kf
            .observed_points()
            .filter_map(|(_, mp_id)| {
                let mp = self.map_points.get(&mp_id)?;
                if mp.is_bad {
                    return None;
                }
                Some(rz.dot(&mp.position) + tz)
            })
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Some(depths[(depths.len() - 1) / q.max(1)])
    }

    /// Drop everything, including tombstones and the id counters.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("keyframes", &self.keyframes_in_map())
            .field("map_points", &self.map_points_in_map())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::geometry::SE3;
    use crate::map::keyframe::{KeyPoint, ScalePyramid};

    fn test_camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0)
    }

    fn insert_test_keyframe(map: &mut Map, n_features: usize, center: Vector3<f64>) -> KeyFrameId {
        // T_cw with camera at `center`, looking down +z.
        let pose = SE3::new(nalgebra::UnitQuaternion::identity(), -center);
        let keypoints = (0..n_features)
            .map(|i| KeyPoint {
                x: 50.0 + i as f64,
                y: 60.0 + i as f64,
                octave: 0,
            })
            .collect();
        let descriptors = (0..n_features).map(|i| [i as u8; 32]).collect();
        map.insert_keyframe(KeyFrameData::monocular(
            pose,
            test_camera(),
            keypoints,
            descriptors,
            ScalePyramid::new(1.2, 8),
        ))
    }

    #[test]
    fn test_monotonic_ids() {
        let mut map = Map::new();
        let a = insert_test_keyframe(&mut map, 1, Vector3::zeros());
        let b = insert_test_keyframe(&mut map, 1, Vector3::zeros());
        let c = insert_test_keyframe(&mut map, 1, Vector3::zeros());
        assert!(a < b && b < c);

        let p = map.create_map_point(Vector3::zeros(), [0u8; 32], a);
        let q = map.create_map_point(Vector3::zeros(), [0u8; 32], a);
        assert!(p < q);
    }

    #[test]
    fn test_observation_symmetry_and_covisibility() {
        let mut map = Map::new();
        let kf1 = insert_test_keyframe(&mut map, 10, Vector3::zeros());
        let kf2 = insert_test_keyframe(&mut map, 10, Vector3::new(0.2, 0.0, 0.0));
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kf1);

        assert!(map.add_observation(kf1, 0, mp));
        assert!(map.add_observation(kf2, 3, mp));

        // Symmetry: each side points back at the other.
        let point = map.map_point(mp).unwrap();
        assert_eq!(point.observations[&kf1], 0);
        assert_eq!(point.observations[&kf2], 3);
        assert_eq!(map.keyframe(kf1).unwrap().map_point(0), Some(mp));
        assert_eq!(map.keyframe(kf2).unwrap().map_point(3), Some(mp));

        // Covisibility reflects the single shared point.
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf2), 1);
        assert_eq!(map.keyframe(kf2).unwrap().covisibility_weight(kf1), 1);
    }

    #[test]
    fn test_erase_observation_tombstones_underconstrained_point() {
        let mut map = Map::new();
        let kf1 = insert_test_keyframe(&mut map, 5, Vector3::zeros());
        let kf2 = insert_test_keyframe(&mut map, 5, Vector3::new(0.2, 0.0, 0.0));
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kf1);
        map.add_observation(kf1, 0, mp);
        map.add_observation(kf2, 0, mp);

        map.erase_observation(kf1, mp);

        // One observer left: the point dies and drops out of iteration,
        // but its id still resolves.
        let point = map.map_point(mp).unwrap();
        assert!(point.is_bad);
        assert_eq!(map.map_points_in_map(), 0);
        assert_eq!(map.keyframe(kf2).unwrap().map_point(0), None);
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf2), 0);
    }

    #[test]
    fn test_update_connections_is_idempotent() {
        let mut map = Map::new();
        let kf1 = insert_test_keyframe(&mut map, 10, Vector3::zeros());
        let kf2 = insert_test_keyframe(&mut map, 10, Vector3::new(0.2, 0.0, 0.0));
        let kf3 = insert_test_keyframe(&mut map, 10, Vector3::new(0.4, 0.0, 0.0));

        for slot in 0..4 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kf1);
            map.add_observation(kf1, slot, mp);
            map.add_observation(kf2, slot, mp);
            if slot < 2 {
                map.add_observation(kf3, slot, mp);
            }
        }

        map.update_connections(kf1);
        let first: HashMap<_, _> = map.keyframe(kf1).unwrap().covisibility_weights().clone();
        map.update_connections(kf1);
        let second: HashMap<_, _> = map.keyframe(kf1).unwrap().covisibility_weights().clone();

        assert_eq!(first, second);
        assert_eq!(first[&kf2], 4);
        assert_eq!(first[&kf3], 2);
        // Mirrored on the neighbors.
        assert_eq!(map.keyframe(kf3).unwrap().covisibility_weight(kf1), 2);
    }

    #[test]
    fn test_set_keyframe_bad_detaches_everything() {
        let mut map = Map::new();
        let kf1 = insert_test_keyframe(&mut map, 10, Vector3::zeros());
        let kf2 = insert_test_keyframe(&mut map, 10, Vector3::new(0.2, 0.0, 0.0));
        let kf3 = insert_test_keyframe(&mut map, 10, Vector3::new(0.4, 0.0, 0.0));

        for slot in 0..3 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kf1);
            map.add_observation(kf1, slot, mp);
            map.add_observation(kf2, slot, mp);
            map.add_observation(kf3, slot, mp);
        }

        map.set_keyframe_bad(kf2);

        let kf2_ref = map.keyframe(kf2).unwrap();
        assert!(kf2_ref.is_bad);
        assert_eq!(map.keyframes_in_map(), 2);
        // Points survive with two observers and forget kf2.
        for mp in map.map_points() {
            assert_eq!(mp.num_observations(), 2);
            assert!(!mp.observed_by(kf2));
        }
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf2), 0);
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf3), 3);
    }

    #[test]
    fn test_replace_map_point_migrates_observations() {
        let mut map = Map::new();
        let kf1 = insert_test_keyframe(&mut map, 10, Vector3::zeros());
        let kf2 = insert_test_keyframe(&mut map, 10, Vector3::new(0.2, 0.0, 0.0));
        let kf3 = insert_test_keyframe(&mut map, 10, Vector3::new(0.4, 0.0, 0.0));

        let keeper = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [1u8; 32], kf1);
        map.add_observation(kf1, 0, keeper);
        map.add_observation(kf2, 0, keeper);

        let goner = map.create_map_point(Vector3::new(0.01, 0.0, 5.0), [2u8; 32], kf2);
        map.add_observation(kf2, 1, goner);
        map.add_observation(kf3, 1, goner);
        map.map_point_mut(goner).unwrap().increase_visible(10);
        map.map_point_mut(goner).unwrap().increase_found(5);

        map.replace_map_point(goner, keeper);

        assert!(map.map_point(goner).unwrap().is_bad);
        let kept = map.map_point(keeper).unwrap();
        // kf2 already observed the keeper, so only kf3 migrates.
        assert_eq!(kept.num_observations(), 3);
        assert!(kept.observed_by(kf3));
        assert_eq!(kept.visible_count, 10);
        assert_eq!(kept.found_count, 5);
        // kf2's duplicate slot was freed.
        assert_eq!(map.keyframe(kf2).unwrap().map_point(1), None);
    }

    #[test]
    fn test_distinctive_descriptor_is_stable() {
        let mut map = Map::new();
        let kf1 = insert_test_keyframe(&mut map, 10, Vector3::zeros());
        let kf2 = insert_test_keyframe(&mut map, 10, Vector3::new(0.2, 0.0, 0.0));
        let kf3 = insert_test_keyframe(&mut map, 10, Vector3::new(0.4, 0.0, 0.0));

        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kf1);
        // Slots 2, 3, 4 carry descriptors [2; 32], [3; 32], [4; 32].
        map.add_observation(kf1, 2, mp);
        map.add_observation(kf2, 3, mp);
        map.add_observation(kf3, 4, mp);

        map.compute_distinctive_descriptor(mp);
        let first = map.map_point(mp).unwrap().descriptor;
        map.compute_distinctive_descriptor(mp);
        let second = map.map_point(mp).unwrap().descriptor;

        assert_eq!(first, second);
        // [3; 32] sits between the others in Hamming distance.
        assert_eq!(first, [3u8; 32]);
    }

    #[test]
    fn test_update_normal_and_depth() {
        let mut map = Map::new();
        let kf1 = insert_test_keyframe(&mut map, 10, Vector3::zeros());
        let kf2 = insert_test_keyframe(&mut map, 10, Vector3::new(1.0, 0.0, 0.0));

        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 4.0), [0u8; 32], kf1);
        map.add_observation(kf1, 0, mp);
        map.add_observation(kf2, 0, mp);

        map.update_normal_and_depth(mp);
        let point = map.map_point(mp).unwrap();

        assert!((point.normal.norm() - 1.0).abs() < 0.1);
        assert!(point.normal.z > 0.9);
        assert!(point.min_distance > 0.0);
        assert!(point.min_distance <= point.max_distance);
        // Reference observation sits 4m away at octave 0.
        assert!((point.max_distance - 4.0).abs() < 1e-9);

        // Idempotent given the same observations.
        let before = (point.normal, point.min_distance, point.max_distance);
        map.update_normal_and_depth(mp);
        let point = map.map_point(mp).unwrap();
        assert_eq!(
            before,
            (point.normal, point.min_distance, point.max_distance)
        );
    }

    #[test]
    fn test_scene_median_depth() {
        let mut map = Map::new();
        let kf = insert_test_keyframe(&mut map, 10, Vector3::zeros());
        for (slot, z) in [2.0, 4.0, 6.0, 8.0, 10.0].iter().enumerate() {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, *z), [0u8; 32], kf);
            map.map_point_mut(mp).unwrap().add_observation(kf, slot);
            map.keyframe_mut(kf).unwrap().set_map_point(slot, mp);
        }

        // Index (5 - 1) / 2 = 2 of the sorted depths.
        assert_eq!(map.scene_median_depth(kf, 2), Some(6.0));
        assert_eq!(map.scene_median_depth(KeyFrameId(99), 2), None);
    }
}
