//! Two-view map point creation (the CreateNewMapPoints stage).
//!
//! For every sufficiently-separated covisibility neighbor of the current
//! keyframe, unmatched features are paired through the epipolar-constrained
//! matcher search and recovered in 3D, either by linear triangulation or by
//! unprojecting a stereo depth when the stereo parallax is the stronger
//! constraint. Candidates are gated on cheirality, per-octave reprojection
//! error, and scale consistency before a map point is born.

use nalgebra::{Matrix3, Matrix4, SMatrix, Vector3};
use tracing::debug;

use crate::camera::{CameraModel, Sensor};
use crate::map::{Descriptor, KeyFrame, KeyFrameId, Map, MapPointId};
use crate::matching::Matcher;

/// Minimum baseline-to-median-depth ratio for monocular pairs.
const MIN_BASELINE_DEPTH_RATIO: f64 = 0.01;

/// Ray-parallax cosine above which a monocular pair is too degenerate to
/// triangulate (about 1.15 degrees).
const MAX_COS_PARALLAX_MONO: f64 = 0.9998;

/// Triangulate new map points between `current_kf_id` and its best
/// covisibility neighbors, appending the survivors to `recent_points`.
///
/// `interrupted` is polled once per neighbor after the first; when it
/// reports true (a new keyframe is waiting), the pass returns early with
/// whatever it created so far.
pub fn create_new_map_points(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    sensor: Sensor,
    matcher: &Matcher,
    recent_points: &mut Vec<MapPointId>,
    interrupted: &dyn Fn() -> bool,
) -> usize {
    let neighbors = match map.keyframe_mut(current_kf_id) {
        Some(kf) if !kf.is_bad => kf.best_covisibles(sensor.triangulation_neighbors()),
        _ => return 0,
    };

    let mut n_new = 0;

    for (i, &neighbor_id) in neighbors.iter().enumerate() {
        if i > 0 && interrupted() {
            debug!(
                "triangulation interrupted after {}/{} neighbors",
                i,
                neighbors.len()
            );
            return n_new;
        }

        // Baseline gate and epipolar geometry for this pair.
        let matches = {
            let (kf1, kf2) = match (map.keyframe(current_kf_id), map.keyframe(neighbor_id)) {
                (Some(a), Some(b)) if !a.is_bad && !b.is_bad => (a, b),
                _ => continue,
            };

            let baseline = (kf2.camera_center() - kf1.camera_center()).norm();
            if sensor.is_monocular() {
                match map.scene_median_depth(neighbor_id, 2) {
                    Some(d) if d > 0.0 && baseline / d >= MIN_BASELINE_DEPTH_RATIO => {}
                    _ => continue,
                }
            } else if baseline < kf2.baseline {
                continue;
            }

            let f12 = compute_f12(kf1, kf2);
            matcher.search_for_triangulation(map, current_kf_id, neighbor_id, &f12)
        };

        for (idx1, idx2) in matches {
            let candidate = {
                let kf1 = map.keyframe(current_kf_id).expect("current resolved above");
                let kf2 = map.keyframe(neighbor_id).expect("neighbor resolved above");
                triangulate_candidate(kf1, kf2, idx1, idx2)
            };

            if let Some((x3d, descriptor)) = candidate {
                let mp_id = map.create_map_point(x3d, descriptor, current_kf_id);
                map.add_observation(current_kf_id, idx1, mp_id);
                map.add_observation(neighbor_id, idx2, mp_id);
                map.compute_distinctive_descriptor(mp_id);
                map.update_normal_and_depth(mp_id);
                recent_points.push(mp_id);
                n_new += 1;
            }
        }
    }

    if n_new > 0 {
        debug!("{current_kf_id}: triangulated {n_new} new map points");
    }
    n_new
}

/// Gate one matched feature pair and recover its 3D point.
///
/// Returns the world point and the descriptor seeding the new map point,
/// or `None` when any gate rejects the pair.
fn triangulate_candidate(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    idx1: usize,
    idx2: usize,
) -> Option<(Vector3<f64>, Descriptor)> {
    let kp1 = kf1.keypoints[idx1];
    let kp2 = kf2.keypoints[idx2];
    let stereo1 = kf1.has_stereo_measurement(idx1);
    let stereo2 = kf2.has_stereo_measurement(idx2);

    // Rays in world coordinates for the parallax test.
    let xn1 = kf1.camera.backproject(kp1.x, kp1.y);
    let xn2 = kf2.camera.backproject(kp2.x, kp2.y);
    let ray1 = kf1.rotation().transpose() * xn1;
    let ray2 = kf2.rotation().transpose() * xn2;
    let cos_parallax_rays = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());

    // Stereo-derived parallax: the angle the baseline subtends at the
    // measured depth. Kept above any ray parallax when unavailable.
    let mut cos_parallax_stereo1 = cos_parallax_rays + 1.0;
    let mut cos_parallax_stereo2 = cos_parallax_rays + 1.0;
    if stereo1 {
        cos_parallax_stereo1 = (2.0 * (kf1.baseline / 2.0).atan2(kf1.depth[idx1])).cos();
    } else if stereo2 {
        cos_parallax_stereo2 = (2.0 * (kf2.baseline / 2.0).atan2(kf2.depth[idx2])).cos();
    }
    let cos_parallax_stereo = cos_parallax_stereo1.min(cos_parallax_stereo2);

    let x3d = if cos_parallax_rays < cos_parallax_stereo
        && cos_parallax_rays > 0.0
        && (stereo1 || stereo2 || cos_parallax_rays < MAX_COS_PARALLAX_MONO)
    {
        linear_triangulation(&xn1, &xn2, &projection_matrix(kf1), &projection_matrix(kf2))?
    } else if stereo1 && cos_parallax_stereo1 < cos_parallax_stereo2 {
        kf1.unproject_stereo(idx1)?
    } else if stereo2 && cos_parallax_stereo2 < cos_parallax_stereo1 {
        kf2.unproject_stereo(idx2)?
    } else {
        // No stereo and too little parallax.
        return None;
    };

    // Cheirality: in front of both cameras.
    let p_cam1 = kf1.pose.transform_point(&x3d);
    if p_cam1.z <= 0.0 {
        return None;
    }
    let p_cam2 = kf2.pose.transform_point(&x3d);
    if p_cam2.z <= 0.0 {
        return None;
    }

    reprojection_gate(kf1, idx1, &p_cam1, stereo1)?;
    reprojection_gate(kf2, idx2, &p_cam2, stereo2)?;

    // Scale consistency: the distance ratio must agree with the octave
    // ratio up to a multiplicative slack.
    let dist1 = (x3d - kf1.camera_center()).norm();
    let dist2 = (x3d - kf2.camera_center()).norm();
    if dist1 == 0.0 || dist2 == 0.0 {
        return None;
    }
    let ratio_dist = dist2 / dist1;
    let ratio_octave = kf1.pyramid.factors[kp1.octave] / kf2.pyramid.factors[kp2.octave];
    let ratio_factor = 1.5 * kf1.pyramid.scale_factor;
    if ratio_dist * ratio_factor < ratio_octave || ratio_dist > ratio_octave * ratio_factor {
        return None;
    }

    Some((x3d, kf1.descriptors[idx1]))
}

/// Chi-square reprojection gate: 5.991·σ² for the two monocular residuals,
/// 7.815·σ² when the stereo right-image coordinate adds a third.
fn reprojection_gate(kf: &KeyFrame, idx: usize, p_cam: &Vector3<f64>, stereo: bool) -> Option<()> {
    let kp = kf.keypoints[idx];
    let sigma2 = kf.pyramid.sigma2[kp.octave];
    let (u, v) = kf.camera.project(p_cam);
    let err_x = u - kp.x;
    let err_y = v - kp.y;

    let ok = if stereo {
        let u_r = u - kf.bf / p_cam.z;
        let err_r = u_r - kf.u_right[idx];
        err_x * err_x + err_y * err_y + err_r * err_r <= 7.815 * sigma2
    } else {
        err_x * err_x + err_y * err_y <= 5.991 * sigma2
    };
    ok.then_some(())
}

/// Fundamental matrix between two keyframes:
/// `F12 = K1⁻ᵀ · [t12]× · R12 · K2⁻¹` with `R12 = R1w R2wᵀ` and
/// `t12 = −R12 t2w + t1w`.
pub fn compute_f12(kf1: &KeyFrame, kf2: &KeyFrame) -> Matrix3<f64> {
    let r1w = kf1.rotation();
    let t1w = kf1.translation();
    let r2w = kf2.rotation();
    let t2w = kf2.translation();

    let r12 = r1w * r2w.transpose();
    let t12 = -(r12 * t2w) + t1w;

    let k1_inv = inverse_k(&kf1.camera);
    let k2_inv = inverse_k(&kf2.camera);

    k1_inv.transpose() * crate::geometry::skew(&t12) * r12 * k2_inv
}

fn inverse_k(camera: &CameraModel) -> Matrix3<f64> {
    Matrix3::new(
        camera.inv_fx, 0.0, -camera.cx * camera.inv_fx, //
        0.0, camera.inv_fy, -camera.cy * camera.inv_fy, //
        0.0, 0.0, 1.0,
    )
}

/// World-to-camera 3x4 projection matrix `[R | t]`.
fn projection_matrix(kf: &KeyFrame) -> SMatrix<f64, 3, 4> {
    let r = kf.rotation();
    let t = kf.translation();
    SMatrix::<f64, 3, 4>::from_columns(&[
        r.column(0).into_owned(),
        r.column(1).into_owned(),
        r.column(2).into_owned(),
        t,
    ])
}

/// Linear (DLT) triangulation from two unit-depth rays and their
/// world-to-camera projection matrices.
///
/// Solves the homogeneous 4x4 system by SVD; a vanishing homogeneous
/// coordinate means the geometry is degenerate and yields `None`.
fn linear_triangulation(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    tcw1: &SMatrix<f64, 3, 4>,
    tcw2: &SMatrix<f64, 3, 4>,
) -> Option<Vector3<f64>> {
    let mut a = Matrix4::<f64>::zeros();
    a.set_row(0, &(xn1.x * tcw1.row(2) - tcw1.row(0)));
    a.set_row(1, &(xn1.y * tcw1.row(2) - tcw1.row(1)));
    a.set_row(2, &(xn2.x * tcw2.row(2) - tcw2.row(0)));
    a.set_row(3, &(xn2.y * tcw2.row(2) - tcw2.row(1)));

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let h = v_t.row(3);

    let w = h[3];
    if w.abs() < 1e-10 {
        return None;
    }
    Some(Vector3::new(h[0] / w, h[1] / w, h[2] / w))
}
