//! Redundancy removal: recently-created map points and keyframes.

use tracing::debug;

use crate::camera::Sensor;
use crate::map::{KeyFrameId, Map, MapPointId};

/// Found ratio below which a recent map point is discarded.
const MIN_FOUND_RATIO: f64 = 0.25;

/// Other-keyframe observation count that makes one observation redundant.
const REDUNDANT_OBS: usize = 3;

/// Fraction of redundant observations that condemns a keyframe.
const REDUNDANT_KEYFRAME_RATIO: f64 = 0.9;

/// Vet the recently-created map points against the current keyframe id.
///
/// A point is dropped from the watch list when it is already bad, culled
/// when its found ratio is poor or it failed to gather observations within
/// two keyframes of its birth, and graduated (kept alive, no longer
/// watched) once it has survived three keyframes. Returns the number of
/// points tombstoned.
pub fn cull_recent_map_points(
    map: &mut Map,
    recent: &mut Vec<MapPointId>,
    current_kf_id: KeyFrameId,
    sensor: Sensor,
) -> usize {
    let th_obs = sensor.culling_obs_threshold();
    let mut kept = Vec::with_capacity(recent.len());
    let mut condemned = Vec::new();

    for &mp_id in recent.iter() {
        let mp = match map.map_point(mp_id) {
            Some(mp) => mp,
            None => continue,
        };
        if mp.is_bad {
            continue;
        }

        let age = current_kf_id.0.saturating_sub(mp.first_kf_id.0);
        if mp.found_ratio() < MIN_FOUND_RATIO {
            condemned.push(mp_id);
        } else if age >= 2 && mp.num_observations() <= th_obs {
            condemned.push(mp_id);
        } else if age >= 3 {
            // Survived the probation window.
        } else {
            kept.push(mp_id);
        }
    }

    let culled = condemned.len();
    for mp_id in condemned {
        map.set_map_point_bad(mp_id);
    }
    *recent = kept;

    if culled > 0 {
        debug!("{current_kf_id}: culled {culled} recent map points");
    }
    culled
}

/// Retire covisible neighbors of `current_kf_id` whose observations are
/// overwhelmingly redundant.
///
/// An observation at octave `o` is redundant when at least three other
/// keyframes observe the same point at octave `o + 1` or finer. For
/// stereo/RGB-D input only close points (positive depth within the
/// keyframe's close-depth threshold) are counted. A keyframe with more
/// than 90% redundant counted observations is tombstoned; the root
/// keyframe never is.
///
/// Candidates are all judged against the same map state, then retired
/// together.
pub fn cull_redundant_keyframes(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    sensor: Sensor,
) -> usize {
    let neighbors = match map.keyframe_mut(current_kf_id) {
        Some(kf) if !kf.is_bad => kf.covisible_keyframes(),
        _ => return 0,
    };

    let mut to_cull = Vec::new();

    for kf_id in neighbors {
        if kf_id == KeyFrameId::ROOT {
            continue;
        }
        let kf = match map.keyframe(kf_id) {
            Some(kf) if !kf.is_bad => kf,
            _ => continue,
        };

        let mut n_points = 0usize;
        let mut n_redundant = 0usize;

        for (slot, mp_id) in kf.observed_points() {
            let mp = match map.map_point(mp_id) {
                Some(mp) if !mp.is_bad => mp,
                _ => continue,
            };

            if !sensor.is_monocular() {
                let d = kf.depth[slot];
                if d < 0.0 || d > kf.th_depth {
                    continue;
                }
            }
            n_points += 1;

            if mp.num_observations() <= REDUNDANT_OBS {
                continue;
            }
            let scale_level = kf.keypoints[slot].octave;
            let mut n_others = 0;
            for (&other_id, &other_slot) in &mp.observations {
                if other_id == kf_id {
                    continue;
                }
                let other = match map.keyframe(other_id) {
                    Some(other) if !other.is_bad => other,
                    _ => continue,
                };
                if other.keypoints[other_slot].octave <= scale_level + 1 {
                    n_others += 1;
                    if n_others >= REDUNDANT_OBS {
                        break;
                    }
                }
            }
            if n_others >= REDUNDANT_OBS {
                n_redundant += 1;
            }
        }

        if n_points > 0 && n_redundant as f64 > REDUNDANT_KEYFRAME_RATIO * n_points as f64 {
            to_cull.push(kf_id);
        }
    }

    let culled = to_cull.len();
    for kf_id in to_cull {
        map.set_keyframe_bad(kf_id);
    }

    if culled > 0 {
        debug!("{current_kf_id}: culled {culled} redundant keyframes");
    }
    culled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::geometry::SE3;
    use crate::map::{KeyFrameData, KeyPoint, ScalePyramid};
    use nalgebra::Vector3;

    fn insert_keyframes(map: &mut Map, n: usize, n_features: usize) -> Vec<KeyFrameId> {
        let cam = CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0);
        (0..n)
            .map(|k| {
                let pose = SE3::new(
                    nalgebra::UnitQuaternion::identity(),
                    Vector3::new(-0.05 * k as f64, 0.0, 0.0),
                );
                let keypoints = (0..n_features)
                    .map(|i| KeyPoint {
                        x: 10.0 + i as f64,
                        y: 20.0 + i as f64,
                        octave: 0,
                    })
                    .collect();
                map.insert_keyframe(KeyFrameData::monocular(
                    pose,
                    cam,
                    keypoints,
                    vec![[0u8; 32]; n_features],
                    ScalePyramid::new(1.2, 8),
                ))
            })
            .collect()
    }

    #[test]
    fn test_poor_found_ratio_is_culled() {
        let mut map = Map::new();
        let kfs = insert_keyframes(&mut map, 2, 4);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kfs[0]);
        map.add_observation(kfs[0], 0, mp);
        map.add_observation(kfs[1], 0, mp);
        map.map_point_mut(mp).unwrap().increase_visible(10);
        map.map_point_mut(mp).unwrap().increase_found(1);

        let mut recent = vec![mp];
        let culled = cull_recent_map_points(&mut map, &mut recent, kfs[1], Sensor::Monocular);

        assert_eq!(culled, 1);
        assert!(recent.is_empty());
        assert!(map.map_point(mp).unwrap().is_bad);
    }

    #[test]
    fn test_found_ratio_at_boundary_survives() {
        let mut map = Map::new();
        let kfs = insert_keyframes(&mut map, 2, 4);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kfs[0]);
        map.add_observation(kfs[0], 0, mp);
        map.add_observation(kfs[1], 0, mp);
        // Exactly 0.25: not below the threshold.
        map.map_point_mut(mp).unwrap().increase_visible(4);
        map.map_point_mut(mp).unwrap().increase_found(1);

        let mut recent = vec![mp];
        let culled = cull_recent_map_points(&mut map, &mut recent, kfs[1], Sensor::Monocular);

        assert_eq!(culled, 0);
        assert!(!map.map_point(mp).unwrap().is_bad);
        // Age 1: still on probation.
        assert_eq!(recent, vec![mp]);
    }

    #[test]
    fn test_underobserved_point_is_culled_after_two_keyframes() {
        let mut map = Map::new();
        let kfs = insert_keyframes(&mut map, 3, 4);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kfs[0]);
        map.add_observation(kfs[0], 0, mp);
        map.add_observation(kfs[1], 0, mp);

        // Monocular threshold is 2 observations; age is 2.
        let mut recent = vec![mp];
        let culled = cull_recent_map_points(&mut map, &mut recent, kfs[2], Sensor::Monocular);

        assert_eq!(culled, 1);
        assert!(map.map_point(mp).unwrap().is_bad);
    }

    #[test]
    fn test_well_observed_point_graduates() {
        let mut map = Map::new();
        let kfs = insert_keyframes(&mut map, 4, 4);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kfs[0]);
        for &kf in &kfs[..3] {
            map.add_observation(kf, 0, mp);
        }

        let mut recent = vec![mp];
        let culled = cull_recent_map_points(&mut map, &mut recent, kfs[3], Sensor::Monocular);

        assert_eq!(culled, 0);
        assert!(recent.is_empty(), "graduated points leave the watch list");
        assert!(!map.map_point(mp).unwrap().is_bad);
    }

    #[test]
    fn test_redundant_keyframes_are_culled_and_root_survives() {
        let mut map = Map::new();
        let kfs = insert_keyframes(&mut map, 5, 100);

        // All five keyframes observe the same 100 points at octave 0.
        for slot in 0..100 {
            let mp = map.create_map_point(
                Vector3::new(0.0, 0.0, 5.0 + slot as f64 * 0.01),
                [0u8; 32],
                kfs[0],
            );
            for &kf in &kfs {
                map.add_observation(kf, slot, mp);
            }
        }

        let culled = cull_redundant_keyframes(&mut map, kfs[0], Sensor::Monocular);

        assert_eq!(culled, 4);
        assert!(!map.keyframe(kfs[0]).unwrap().is_bad);
        for &kf in &kfs[1..] {
            assert!(map.keyframe(kf).unwrap().is_bad);
        }
        // Detaching the four observers leaves each point with only the
        // root observation, below the two-observer floor, so the points
        // are tombstoned with their keyframes.
        assert_eq!(map.map_points_in_map(), 0);
    }

    #[test]
    fn test_keyframe_with_unique_view_survives() {
        let mut map = Map::new();
        let kfs = insert_keyframes(&mut map, 3, 10);

        // kfs[1] shares slots 0..5 with the others but is the sole pair
        // observer of slots 5..10 together with kfs[2]: nothing redundant.
        for slot in 0..5 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], kfs[0]);
            for &kf in &kfs {
                map.add_observation(kf, slot, mp);
            }
        }
        for slot in 5..10 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 6.0), [0u8; 32], kfs[1]);
            map.add_observation(kfs[1], slot, mp);
            map.add_observation(kfs[2], slot, mp);
        }

        let culled = cull_redundant_keyframes(&mut map, kfs[0], Sensor::Monocular);

        assert_eq!(culled, 0);
        assert!(!map.keyframe(kfs[1]).unwrap().is_bad);
    }
}
