//! Neighborhood fusion (the SearchInNeighbors stage).
//!
//! Builds a target set from the current keyframe's covisibility
//! neighborhood (first-order neighbors plus their top five neighbors,
//! with per-keyframe fuse markers keeping the first-order targets from
//! reappearing), then fuses in both directions: the current keyframe's
//! map points into every target, and the union of the targets' map
//! points back into the current keyframe.
//! Surviving points get fresh descriptors and normals, and the current
//! keyframe's covisibility is rebuilt.

use tracing::debug;

use crate::camera::Sensor;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::matching::Matcher;

/// Search window scale for projection-based fusion.
const FUSE_RADIUS_FACTOR: f64 = 3.0;

/// Second-order neighbors taken per first-order neighbor.
const SECOND_ORDER_NEIGHBORS: usize = 5;

/// Fuse duplicated map points between `current_kf_id` and its
/// neighborhood. Returns the number of fused or newly attached points.
///
/// `interrupted` is polled between target keyframes during the forward
/// pass; when it reports true the stage returns early and leaves the
/// remaining reconciliation to the next pipeline iteration.
pub fn search_in_neighbors(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    sensor: Sensor,
    matcher: &Matcher,
    interrupted: &dyn Fn() -> bool,
) -> usize {
    let targets = collect_fuse_targets(map, current_kf_id, sensor);
    if targets.is_empty() {
        return 0;
    }

    let current_points: Vec<MapPointId> = match map.keyframe(current_kf_id) {
        Some(kf) if !kf.is_bad => kf.observed_points().map(|(_, mp)| mp).collect(),
        _ => return 0,
    };

    // Forward pass: project the current keyframe's points into each
    // target.
    let mut fused = 0;
    for (i, &target) in targets.iter().enumerate() {
        if i > 0 && interrupted() {
            debug!(
                "fusion interrupted after {}/{} targets",
                i,
                targets.len()
            );
            return fused;
        }
        fused += matcher.fuse(map, target, &current_points, FUSE_RADIUS_FACTOR);
    }

    // Backward pass: the union of the targets' points, deduplicated via
    // the per-point fuse marker, projected into the current keyframe.
    let mut fuse_candidates = Vec::new();
    for &target in &targets {
        let observed: Vec<MapPointId> = match map.keyframe(target) {
            Some(kf) => kf.observed_points().map(|(_, mp)| mp).collect(),
            None => continue,
        };
        for mp_id in observed {
            let mp = match map.map_point_mut(mp_id) {
                Some(mp) if !mp.is_bad => mp,
                _ => continue,
            };
            if mp.fuse_candidate_for_kf == Some(current_kf_id) {
                continue;
            }
            mp.fuse_candidate_for_kf = Some(current_kf_id);
            fuse_candidates.push(mp_id);
        }
    }
    fused += matcher.fuse(map, current_kf_id, &fuse_candidates, FUSE_RADIUS_FACTOR);

    // Refresh the surviving points of the current keyframe and rebuild
    // its covisibility.
    let survivors: Vec<MapPointId> = map
        .keyframe(current_kf_id)
        .map(|kf| kf.observed_points().map(|(_, mp)| mp).collect())
        .unwrap_or_default();
    for mp_id in survivors {
        map.compute_distinctive_descriptor(mp_id);
        map.update_normal_and_depth(mp_id);
    }
    map.update_connections(current_kf_id);

    if fused > 0 {
        debug!("{current_kf_id}: fused {fused} map points with neighbors");
    }
    fused
}

/// First-order covisibility neighbors plus their best neighbors,
/// excluding bad keyframes and the current one.
///
/// Only first-order targets set the fuse marker, so second-order
/// expansion cannot re-add them. A second-order neighbor shared by two
/// first-order neighbors can still appear twice; the repeat fuse pass
/// over it finds nothing left to attach.
fn collect_fuse_targets(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    sensor: Sensor,
) -> Vec<KeyFrameId> {
    let first_order = match map.keyframe_mut(current_kf_id) {
        Some(kf) if !kf.is_bad => kf.best_covisibles(sensor.triangulation_neighbors()),
        _ => return Vec::new(),
    };

    let mut targets = Vec::new();
    for kf_id in first_order {
        {
            let kf = match map.keyframe_mut(kf_id) {
                Some(kf) if !kf.is_bad => kf,
                _ => continue,
            };
            if kf.fuse_target_for_kf == Some(current_kf_id) {
                continue;
            }
            kf.fuse_target_for_kf = Some(current_kf_id);
        }
        targets.push(kf_id);

        let second_order = map
            .keyframe_mut(kf_id)
            .map(|kf| kf.best_covisibles(SECOND_ORDER_NEIGHBORS))
            .unwrap_or_default();
        for kf2_id in second_order {
            if kf2_id == current_kf_id {
                continue;
            }
            let kf2 = match map.keyframe(kf2_id) {
                Some(kf2) if !kf2.is_bad => kf2,
                _ => continue,
            };
            if kf2.fuse_target_for_kf == Some(current_kf_id) {
                continue;
            }
            targets.push(kf2_id);
        }
    }

    targets
}
