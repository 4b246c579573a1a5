//! Local bundle adjustment adapter.
//!
//! The adapter runs in three phases so the long solve never blocks the
//! other threads on the map lock:
//!
//! 1. **collect** - under a read lock, snapshot the local window: the
//!    current keyframe plus its covisibility neighbors, every map point
//!    they observe, and the fixed keyframes that also observe those
//!    points.
//! 2. **solve** - lock-free Levenberg-Marquardt on the reprojection
//!    residuals, with Huber weighting and per-octave information. The
//!    shared abort flag is polled every iteration; tripping it returns
//!    whatever improvement has been committed so far.
//! 3. **apply** - under a write lock, write refined poses and positions
//!    back, skipping anything tombstoned in the meantime.

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix2x6, UnitQuaternion, Vector2, Vector3};

use crate::camera::CameraModel;
use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map, MapPointId};

pub struct LocalBaConfig {
    pub max_iterations: usize,
    /// Huber kernel threshold in pixels.
    pub huber_threshold: f64,
    pub gradient_tolerance: f64,
    pub param_tolerance: f64,
}

impl Default for LocalBaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            huber_threshold: 5.991_f64.sqrt(),
            gradient_tolerance: 1e-8,
            param_tolerance: 1e-8,
        }
    }
}

/// One reprojection constraint.
pub struct BaObservation {
    pub kf_id: KeyFrameId,
    pub mp_id: MapPointId,
    pub uv: Vector2<f64>,
    /// Inverse of the octave reprojection variance.
    pub inv_sigma2: f64,
    /// False when the observing keyframe's pose is held fixed.
    pub kf_optimized: bool,
}

/// Snapshot of the local window, self-contained for lock-free solving.
pub struct LocalBaProblem {
    pub anchor_kf_id: KeyFrameId,
    pub optimized_kf_ids: Vec<KeyFrameId>,
    pub mp_ids: Vec<MapPointId>,
    /// World-to-camera poses of the optimized keyframes.
    pub optimized_kf_poses: HashMap<KeyFrameId, SE3>,
    /// World-to-camera poses of the anchor and the fixed observers.
    pub fixed_kf_poses: HashMap<KeyFrameId, SE3>,
    pub mp_positions: HashMap<MapPointId, Vector3<f64>>,
    pub cameras: HashMap<KeyFrameId, CameraModel>,
    pub observations: Vec<BaObservation>,
}

/// Refined values ready to be written back.
pub struct LocalBaResult {
    pub poses: HashMap<KeyFrameId, SE3>,
    pub positions: HashMap<MapPointId, Vector3<f64>>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// PHASE 1: snapshot the local window around `current_kf_id`.
///
/// The oldest local keyframe anchors the gauge and is held fixed together
/// with the out-of-window observers. Returns `None` when there is nothing
/// to optimize.
pub fn collect_local_ba_data(
    map: &Map,
    current_kf_id: KeyFrameId,
    _config: &LocalBaConfig,
) -> Option<LocalBaProblem> {
    let current = map.keyframe(current_kf_id)?;
    if current.is_bad {
        return None;
    }

    // Local keyframes: current plus covisibility neighbors, id-ordered
    // for determinism.
    let mut local_kf_ids: Vec<KeyFrameId> = current
        .covisibility_weights()
        .keys()
        .copied()
        .filter(|&id| map.keyframe(id).is_some_and(|kf| !kf.is_bad))
        .collect();
    local_kf_ids.push(current_kf_id);
    local_kf_ids.sort();
    local_kf_ids.dedup();

    // Local map points: everything the local keyframes observe.
    let mut mp_ids: Vec<MapPointId> = Vec::new();
    let mut mp_seen: HashSet<MapPointId> = HashSet::new();
    for &kf_id in &local_kf_ids {
        let kf = map.keyframe(kf_id)?;
        for (_, mp_id) in kf.observed_points() {
            if map.map_point(mp_id).is_some_and(|mp| !mp.is_bad) && mp_seen.insert(mp_id) {
                mp_ids.push(mp_id);
            }
        }
    }
    mp_ids.sort();
    if mp_ids.is_empty() {
        return None;
    }

    // Fixed keyframes: observers of local points outside the window.
    let local_kf_set: HashSet<KeyFrameId> = local_kf_ids.iter().copied().collect();
    let mut fixed_kf_ids: Vec<KeyFrameId> = Vec::new();
    let mut fixed_seen: HashSet<KeyFrameId> = HashSet::new();
    for &mp_id in &mp_ids {
        for &kf_id in map.map_point(mp_id)?.observations.keys() {
            if !local_kf_set.contains(&kf_id)
                && map.keyframe(kf_id).is_some_and(|kf| !kf.is_bad)
                && fixed_seen.insert(kf_id)
            {
                fixed_kf_ids.push(kf_id);
            }
        }
    }

    // The oldest local keyframe pins the gauge.
    let anchor_kf_id = *local_kf_ids.first()?;
    let optimized_kf_ids: Vec<KeyFrameId> =
        local_kf_ids.iter().skip(1).copied().collect();

    let mut optimized_kf_poses = HashMap::new();
    for &kf_id in &optimized_kf_ids {
        optimized_kf_poses.insert(kf_id, map.keyframe(kf_id)?.pose.clone());
    }
    let mut fixed_kf_poses = HashMap::new();
    fixed_kf_poses.insert(anchor_kf_id, map.keyframe(anchor_kf_id)?.pose.clone());
    for &kf_id in &fixed_kf_ids {
        fixed_kf_poses.insert(kf_id, map.keyframe(kf_id)?.pose.clone());
    }

    let mut mp_positions = HashMap::new();
    for &mp_id in &mp_ids {
        mp_positions.insert(mp_id, map.map_point(mp_id)?.position);
    }

    // Observations from every involved keyframe onto the local points.
    let mp_set: HashSet<MapPointId> = mp_ids.iter().copied().collect();
    let optimized_set: HashSet<KeyFrameId> = optimized_kf_ids.iter().copied().collect();
    let mut cameras = HashMap::new();
    let mut observations = Vec::new();
    for &kf_id in local_kf_ids.iter().chain(fixed_kf_ids.iter()) {
        let kf = map.keyframe(kf_id)?;
        cameras.insert(kf_id, kf.camera);
        for (slot, mp_id) in kf.observed_points() {
            if !mp_set.contains(&mp_id) {
                continue;
            }
            let kp = kf.keypoints[slot];
            observations.push(BaObservation {
                kf_id,
                mp_id,
                uv: Vector2::new(kp.x, kp.y),
                inv_sigma2: 1.0 / kf.pyramid.sigma2[kp.octave],
                kf_optimized: optimized_set.contains(&kf_id),
            });
        }
    }
    if observations.is_empty() {
        return None;
    }

    Some(LocalBaProblem {
        anchor_kf_id,
        optimized_kf_ids,
        mp_ids,
        optimized_kf_poses,
        fixed_kf_poses,
        mp_positions,
        cameras,
        observations,
    })
}

/// PHASE 2: Levenberg-Marquardt over the snapshot. Holds no locks.
///
/// `should_stop` is polled at the top of every iteration; when it reports
/// true the current (possibly partial) estimate is returned.
pub fn solve_local_ba(
    problem: &LocalBaProblem,
    config: &LocalBaConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<LocalBaResult> {
    let num_kf_params = problem.optimized_kf_ids.len();
    let num_mp_params = problem.mp_ids.len();
    let num_params = num_kf_params * 6 + num_mp_params * 3;
    let num_residuals = problem.observations.len() * 2;
    if num_params == 0 || num_residuals == 0 {
        return None;
    }

    let kf_index: HashMap<KeyFrameId, usize> = problem
        .optimized_kf_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();
    let mp_index: HashMap<MapPointId, usize> = problem
        .mp_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();

    // Parameter layout: [6 per optimized pose | 3 per point], poses as
    // axis-angle + translation of T_cw.
    let mut params = DVector::zeros(num_params);
    for (i, &kf_id) in problem.optimized_kf_ids.iter().enumerate() {
        let pose = &problem.optimized_kf_poses[&kf_id];
        let (rot, trans) = se3_to_params(pose);
        params.fixed_rows_mut::<3>(i * 6).copy_from(&rot);
        params.fixed_rows_mut::<3>(i * 6 + 3).copy_from(&trans);
    }
    for (i, &mp_id) in problem.mp_ids.iter().enumerate() {
        params
            .fixed_rows_mut::<3>(num_kf_params * 6 + i * 3)
            .copy_from(&problem.mp_positions[&mp_id]);
    }

    let eval = Evaluator {
        problem,
        kf_index: &kf_index,
        mp_index: &mp_index,
        num_kf_params,
        huber_threshold: config.huber_threshold,
    };

    let initial_residuals = eval.residuals(&params);
    let initial_error = initial_residuals.norm() / (num_residuals as f64).sqrt();

    let mut current = params;
    let mut iterations = 0;
    let mut lambda = 1e-3;
    let (lambda_up, lambda_down) = (10.0, 0.1);
    let (min_lambda, max_lambda) = (1e-10, 1e10);

    for iter in 0..config.max_iterations {
        if should_stop() {
            break;
        }
        iterations = iter + 1;

        let residuals = eval.residuals(&current);
        let jacobian = eval.jacobian(&current);
        let error_sq = residuals.norm_squared();

        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < config.gradient_tolerance {
            break;
        }
        let mut damped = jacobian.transpose() * &jacobian;
        for i in 0..num_params {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }

        let delta = match damped.lu().solve(&(-&gradient)) {
            Some(d) => d,
            None => break,
        };
        if delta.norm() < config.param_tolerance * (current.norm() + config.param_tolerance) {
            break;
        }

        let trial = &current + &delta;
        if eval.residuals(&trial).norm_squared() < error_sq {
            current = trial;
            lambda = (lambda * lambda_down).max(min_lambda);
        } else {
            lambda = (lambda * lambda_up).min(max_lambda);
        }
    }

    let final_error = eval.residuals(&current).norm() / (num_residuals as f64).sqrt();

    let mut poses = HashMap::new();
    for (i, &kf_id) in problem.optimized_kf_ids.iter().enumerate() {
        let rot = current.fixed_rows::<3>(i * 6).into_owned();
        let trans = current.fixed_rows::<3>(i * 6 + 3).into_owned();
        poses.insert(kf_id, se3_from_params(&rot, &trans));
    }
    let mut positions = HashMap::new();
    for (i, &mp_id) in problem.mp_ids.iter().enumerate() {
        positions.insert(
            mp_id,
            current.fixed_rows::<3>(num_kf_params * 6 + i * 3).into_owned(),
        );
    }

    Some(LocalBaResult {
        poses,
        positions,
        iterations,
        initial_error,
        final_error,
    })
}

/// PHASE 3: write refined values back, skipping tombstoned entities.
/// Returns the number of entities updated.
pub fn apply_local_ba(map: &mut Map, result: &LocalBaResult) -> usize {
    let mut updated = 0;
    for (kf_id, pose) in &result.poses {
        if let Some(kf) = map.keyframe_mut(*kf_id) {
            if !kf.is_bad {
                kf.pose = pose.clone();
                updated += 1;
            }
        }
    }
    for (mp_id, position) in &result.positions {
        if let Some(mp) = map.map_point_mut(*mp_id) {
            if !mp.is_bad {
                mp.position = *position;
                updated += 1;
            }
        }
    }
    updated
}

// ----------------------------------------------------------------------
// Residuals and Jacobians
// ----------------------------------------------------------------------

struct Evaluator<'a> {
    problem: &'a LocalBaProblem,
    kf_index: &'a HashMap<KeyFrameId, usize>,
    mp_index: &'a HashMap<MapPointId, usize>,
    num_kf_params: usize,
    huber_threshold: f64,
}

impl<'a> Evaluator<'a> {
    fn pose_for(&self, params: &DVector<f64>, obs: &BaObservation) -> SE3 {
        if obs.kf_optimized {
            let i = self.kf_index[&obs.kf_id];
            let rot = params.fixed_rows::<3>(i * 6).into_owned();
            let trans = params.fixed_rows::<3>(i * 6 + 3).into_owned();
            se3_from_params(&rot, &trans)
        } else {
            self.problem.fixed_kf_poses[&obs.kf_id].clone()
        }
    }

    fn point_for(&self, params: &DVector<f64>, obs: &BaObservation) -> Vector3<f64> {
        let i = self.mp_index[&obs.mp_id];
        params
            .fixed_rows::<3>(self.num_kf_params * 6 + i * 3)
            .into_owned()
    }

    /// Observation weight: octave information times the Huber factor.
    fn weight(&self, error: &Vector2<f64>, inv_sigma2: f64) -> f64 {
        let norm = error.norm() * inv_sigma2.sqrt();
        let huber = if norm <= self.huber_threshold {
            1.0
        } else {
            self.huber_threshold / norm
        };
        (inv_sigma2 * huber).sqrt()
    }

    fn error(&self, pose_cw: &SE3, point: &Vector3<f64>, obs: &BaObservation) -> Vector2<f64> {
        let p_cam = pose_cw.transform_point(point);
        if p_cam.z <= 1e-3 {
            // Behind the camera: a large constant residual keeps the
            // solver away without producing NaNs.
            return Vector2::new(100.0, 100.0);
        }
        let camera = &self.problem.cameras[&obs.kf_id];
        let (u, v) = camera.project(&p_cam);
        Vector2::new(obs.uv.x - u, obs.uv.y - v)
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let mut r = DVector::zeros(self.problem.observations.len() * 2);
        for (i, obs) in self.problem.observations.iter().enumerate() {
            let pose = self.pose_for(params, obs);
            let point = self.point_for(params, obs);
            let e = self.error(&pose, &point, obs);
            let w = self.weight(&e, obs.inv_sigma2);
            r[i * 2] = w * e.x;
            r[i * 2 + 1] = w * e.y;
        }
        r
    }

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let num_params = self.num_kf_params * 6 + self.mp_index.len() * 3;
        let mut j = DMatrix::zeros(self.problem.observations.len() * 2, num_params);

        for (i, obs) in self.problem.observations.iter().enumerate() {
            let pose = self.pose_for(params, obs);
            let point = self.point_for(params, obs);
            let e = self.error(&pose, &point, obs);
            let w = self.weight(&e, obs.inv_sigma2);
            let camera = &self.problem.cameras[&obs.kf_id];

            if obs.kf_optimized {
                let jp = jacobian_pose(camera, &pose, &point) * w;
                let base = self.kf_index[&obs.kf_id] * 6;
                for row in 0..2 {
                    for col in 0..6 {
                        j[(i * 2 + row, base + col)] = jp[(row, col)];
                    }
                }
            }

            let jx = jacobian_point(camera, &pose, &point) * w;
            let base = self.num_kf_params * 6 + self.mp_index[&obs.mp_id] * 3;
            for row in 0..2 {
                for col in 0..3 {
                    j[(i * 2 + row, base + col)] = jx[(row, col)];
                }
            }
        }

        j
    }
}

/// Derivative of the residual w.r.t. the pose parameters
/// [rot_x, rot_y, rot_z, t_x, t_y, t_z] of T_cw.
fn jacobian_pose(camera: &CameraModel, pose_cw: &SE3, point: &Vector3<f64>) -> Matrix2x6<f64> {
    let p = pose_cw.transform_point(point);
    if p.z.abs() < 1e-6 {
        return Matrix2x6::zeros();
    }
    let (x, y, z) = (p.x, p.y, p.z);
    let inv_z = 1.0 / z;
    let inv_z2 = inv_z * inv_z;
    let (fx, fy) = (camera.fx, camera.fy);

    Matrix2x6::new(
        x * y * inv_z2 * fx,
        -(1.0 + x * x * inv_z2) * fx,
        y * inv_z * fx,
        -inv_z * fx,
        0.0,
        x * inv_z2 * fx,
        //
        (1.0 + y * y * inv_z2) * fy,
        -x * y * inv_z2 * fy,
        -x * inv_z * fy,
        0.0,
        -inv_z * fy,
        y * inv_z2 * fy,
    )
}

/// Derivative of the residual w.r.t. the world point.
fn jacobian_point(camera: &CameraModel, pose_cw: &SE3, point: &Vector3<f64>) -> Matrix2x3<f64> {
    let p = pose_cw.transform_point(point);
    if p.z.abs() < 1e-6 {
        return Matrix2x3::zeros();
    }
    let inv_z = 1.0 / p.z;
    let (fx, fy) = (camera.fx, camera.fy);

    let tmp = Matrix2x3::new(
        fx, 0.0, -fx * p.x * inv_z, //
        0.0, fy, -fy * p.y * inv_z,
    );
    (-inv_z) * tmp * pose_cw.rotation_matrix()
}

fn se3_to_params(pose: &SE3) -> (Vector3<f64>, Vector3<f64>) {
    (pose.rotation.scaled_axis(), pose.translation)
}

fn se3_from_params(axis_angle: &Vector3<f64>, translation: &Vector3<f64>) -> SE3 {
    let angle = axis_angle.norm();
    let rotation = if angle > 1e-10 {
        UnitQuaternion::from_axis_angle(
            &nalgebra::Unit::new_normalize(*axis_angle / angle),
            angle,
        )
    } else {
        UnitQuaternion::identity()
    };
    SE3::new(rotation, *translation)
}
