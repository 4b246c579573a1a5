//! Descriptor matching services used by local mapping.
//!
//! Two operations are exposed: an epipolar-constrained search producing
//! candidate feature pairs for two-view triangulation, and a
//! projection-based fuse that attaches existing map points to a keyframe
//! or merges duplicates. Both work purely on descriptor distances and
//! image geometry; feature extraction happens upstream.

use nalgebra::Matrix3;

use crate::map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};

/// Strict descriptor distance bound for accepting a match.
pub const TH_LOW: u32 = 50;

/// Loose descriptor distance bound. Part of the matcher contract for the
/// tracking-side projection searches; the local-mapping searches in this
/// module only accept matches under [`TH_LOW`].
pub const TH_HIGH: u32 = 100;

/// Hamming distance between two 256-bit descriptors.
pub fn descriptor_distance(a: &[u8; 32], b: &[u8; 32]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// A configured matcher instance.
///
/// `nn_ratio` is the Lowe ratio applied to the triangulation search
/// (0.6 there, a permissive 0.9 default elsewhere).
pub struct Matcher {
    nn_ratio: f64,
}

impl Default for Matcher {
    fn default() -> Self {
        Self { nn_ratio: 0.9 }
    }
}

impl Matcher {
    pub fn new(nn_ratio: f64) -> Self {
        Self { nn_ratio }
    }

    /// Find feature pairs between two keyframes that are unmatched,
    /// descriptor-similar, and consistent with the fundamental matrix
    /// `F12` (x1ᵀ F12 x2 = 0).
    ///
    /// Pairs where both features lack a stereo measurement are also
    /// required to stay away from the epipole in the second image, since
    /// a match near the epipole carries no parallax.
    pub fn search_for_triangulation(
        &self,
        map: &Map,
        kf1_id: KeyFrameId,
        kf2_id: KeyFrameId,
        f12: &Matrix3<f64>,
    ) -> Vec<(usize, usize)> {
        let (kf1, kf2) = match (map.keyframe(kf1_id), map.keyframe(kf2_id)) {
            (Some(a), Some(b)) if !a.is_bad && !b.is_bad => (a, b),
            _ => return Vec::new(),
        };

        // Epipole: camera 1's center projected into image 2.
        let c1_in_2 = kf2.pose.transform_point(&kf1.camera_center());
        let epipole = if c1_in_2.z.abs() > 1e-9 {
            Some(kf2.camera.project(&c1_in_2))
        } else {
            None
        };

        let mut matches = Vec::new();
        let mut matched2 = vec![false; kf2.num_features()];

        for idx1 in 0..kf1.num_features() {
            if kf1.map_point(idx1).is_some() {
                continue;
            }
            let kp1 = &kf1.keypoints[idx1];
            let d1 = &kf1.descriptors[idx1];
            let stereo1 = kf1.has_stereo_measurement(idx1);

            let mut best_dist = u32::MAX;
            let mut second_dist = u32::MAX;
            let mut best_idx2 = None;

            for idx2 in 0..kf2.num_features() {
                if matched2[idx2] || kf2.map_point(idx2).is_some() {
                    continue;
                }
                let dist = descriptor_distance(d1, &kf2.descriptors[idx2]);
                if dist > TH_LOW {
                    continue;
                }

                let kp2 = &kf2.keypoints[idx2];
                if !stereo1 && !kf2.has_stereo_measurement(idx2) {
                    if let Some((ex, ey)) = epipole {
                        let dx = ex - kp2.x;
                        let dy = ey - kp2.y;
                        let factor = kf2.pyramid.factors[kp2.octave];
                        if dx * dx + dy * dy < 100.0 * factor * factor {
                            continue;
                        }
                    }
                }

                if !epipolar_line_check(kp1.x, kp1.y, kp2.x, kp2.y, f12, kf2, kp2.octave) {
                    continue;
                }

                if dist < best_dist {
                    second_dist = best_dist;
                    best_dist = dist;
                    best_idx2 = Some(idx2);
                } else if dist < second_dist {
                    second_dist = dist;
                }
            }

            if let Some(idx2) = best_idx2 {
                if second_dist == u32::MAX
                    || (best_dist as f64) < self.nn_ratio * second_dist as f64
                {
                    matches.push((idx1, idx2));
                    matched2[idx2] = true;
                }
            }
        }

        matches
    }

    /// Project map points into `target_kf_id` and reconcile them with its
    /// features: an empty slot gains an observation, an occupied slot
    /// triggers a merge that keeps the point with more observations.
    ///
    /// `radius_factor` scales the per-octave search window (3.0 in the
    /// pipeline). Returns the number of attached or merged points.
    pub fn fuse(
        &self,
        map: &mut Map,
        target_kf_id: KeyFrameId,
        candidates: &[MapPointId],
        radius_factor: f64,
    ) -> usize {
        let mut fused = 0;

        for &mp_id in candidates {
            // Snapshot what we need so the map can be mutated afterwards.
            let projection = {
                let kf = match map.keyframe(target_kf_id) {
                    Some(kf) if !kf.is_bad => kf,
                    _ => return fused,
                };
                let mp = match map.map_point(mp_id) {
                    Some(mp) if !mp.is_bad => mp,
                    _ => continue,
                };
                if mp.observed_by(target_kf_id) {
                    continue;
                }
                project_for_fusion(kf, mp, radius_factor)
            };

            let (best_idx, best_dist) = match projection {
                Some(hit) => hit,
                None => continue,
            };
            if best_dist > TH_LOW {
                continue;
            }

            match map.keyframe(target_kf_id).and_then(|kf| kf.map_point(best_idx)) {
                Some(existing) if existing != mp_id => {
                    let existing_obs = map
                        .map_point(existing)
                        .map(|mp| mp.num_observations())
                        .unwrap_or(0);
                    let incoming_obs = map
                        .map_point(mp_id)
                        .map(|mp| mp.num_observations())
                        .unwrap_or(0);
                    // The better-constrained point survives; ties go to
                    // the projected point.
                    if existing_obs > incoming_obs {
                        map.replace_map_point(mp_id, existing);
                    } else {
                        map.replace_map_point(existing, mp_id);
                    }
                    fused += 1;
                }
                None => {
                    if map.add_observation(target_kf_id, best_idx, mp_id) {
                        fused += 1;
                    }
                }
                _ => {}
            }
        }

        fused
    }
}

/// Project a map point into a keyframe and pick the best matching feature
/// in the scale-predicted window. `None` when the point does not project
/// acceptably or no candidate feature passes the reprojection gate.
fn project_for_fusion(kf: &KeyFrame, mp: &MapPoint, radius_factor: f64) -> Option<(usize, u32)> {
    let p_cam = kf.pose.transform_point(&mp.position);
    if p_cam.z <= 0.0 {
        return None;
    }

    let (u, v) = kf.camera.project(&p_cam);
    if !kf.camera.is_in_image(u, v) {
        return None;
    }
    let inv_z = 1.0 / p_cam.z;
    let ur = u - kf.bf * inv_z;

    let po = mp.position - kf.camera_center();
    let dist = po.norm();
    if !mp.is_in_distance_range(dist) {
        return None;
    }

    // Viewing direction within 60 degrees of the point's normal.
    if po.dot(&mp.normal) < 0.5 * dist {
        return None;
    }

    let level = mp.predict_scale(dist, kf);
    let radius = radius_factor * kf.pyramid.factors[level];
    let in_area = kf.features_in_area(u, v, radius, Some(level.saturating_sub(1)), Some(level));

    let mut best: Option<(usize, u32)> = None;
    for idx in in_area {
        let kp = &kf.keypoints[idx];
        let inv_sigma2 = 1.0 / kf.pyramid.sigma2[kp.octave];

        let ex = u - kp.x;
        let ey = v - kp.y;
        let passes = if kf.has_stereo_measurement(idx) {
            let er = ur - kf.u_right[idx];
            (ex * ex + ey * ey + er * er) * inv_sigma2 <= 7.815
        } else {
            (ex * ex + ey * ey) * inv_sigma2 <= 5.991
        };
        if !passes {
            continue;
        }

        let desc_dist = descriptor_distance(&mp.descriptor, &kf.descriptors[idx]);
        if best.map_or(true, |(_, d)| desc_dist < d) {
            best = Some((idx, desc_dist));
        }
    }

    best
}

/// Squared distance of (x2, y2) to the epipolar line of (x1, y1) under
/// F12, gated at the 1-dof 95% chi-square scaled by the octave variance.
fn epipolar_line_check(
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    f12: &Matrix3<f64>,
    kf2: &KeyFrame,
    octave2: usize,
) -> bool {
    let a = x1 * f12[(0, 0)] + y1 * f12[(1, 0)] + f12[(2, 0)];
    let b = x1 * f12[(0, 1)] + y1 * f12[(1, 1)] + f12[(2, 1)];
    let c = x1 * f12[(0, 2)] + y1 * f12[(1, 2)] + f12[(2, 2)];

    let num = a * x2 + b * y2 + c;
    let den = a * a + b * b;
    if den <= 0.0 {
        return false;
    }

    num * num / den < 3.84 * kf2.pyramid.sigma2[octave2]
}
