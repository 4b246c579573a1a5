//! The local mapping worker and its control surface.
//!
//! One long-running thread drains the keyframe queue the tracker feeds and
//! drives each keyframe through the pipeline: ingest, recent-point
//! culling, triangulation, neighborhood fusion, local bundle adjustment,
//! keyframe culling, and handoff to the loop closer. The tracker and the
//! loop closer steer the worker through the request flags implemented
//! here; all cancellation is cooperative.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::camera::Sensor;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::matching::Matcher;
use crate::optimizer::{
    apply_local_ba, collect_local_ba_data, solve_local_ba, LocalBaConfig,
};

use super::culling::{cull_recent_map_points, cull_redundant_keyframes};
use super::search_in_neighbors::search_in_neighbors;
use super::triangulation::create_new_map_points;

/// Idle/stopped polling quantum. The loop never busy-spins; every wait is
/// a multiple of this sleep.
const SLEEP_QUANTUM: Duration = Duration::from_millis(3);

/// Ratio used by the epipolar triangulation matcher.
const TRIANGULATION_NN_RATIO: f64 = 0.6;

/// Minimum keyframes in the map before local BA is worth running.
const MIN_KEYFRAMES_FOR_BA: usize = 2;

#[derive(Default)]
struct StopFlags {
    stopped: bool,
    stop_requested: bool,
    not_stop: bool,
}

#[derive(Default)]
struct FinishFlags {
    requested: bool,
    finished: bool,
}

/// The local mapping subsystem.
///
/// Shared between the worker thread (which calls [`LocalMapping::run`])
/// and its clients, so every field is interior-mutable behind its own
/// lock. The map lock is never held across a sleep, and the queue lock is
/// never held while entity state is touched.
pub struct LocalMapping {
    map: Arc<RwLock<Map>>,
    sensor: Sensor,

    triangulation_matcher: Matcher,
    fusion_matcher: Matcher,
    ba_config: LocalBaConfig,

    new_keyframes: Mutex<VecDeque<KeyFrameId>>,
    recent_points: Mutex<Vec<MapPointId>>,

    abort_ba: AtomicBool,
    accept_keyframes: AtomicBool,

    stop: Mutex<StopFlags>,
    reset_requested: Mutex<bool>,
    finish: Mutex<FinishFlags>,

    loop_closer: Option<Sender<KeyFrameId>>,
}

impl LocalMapping {
    /// Build the subsystem over a shared map.
    ///
    /// `loop_closer`, when present, receives every processed keyframe id.
    pub fn new(
        map: Arc<RwLock<Map>>,
        sensor: Sensor,
        loop_closer: Option<Sender<KeyFrameId>>,
    ) -> Self {
        Self {
            map,
            sensor,
            triangulation_matcher: Matcher::new(TRIANGULATION_NN_RATIO),
            fusion_matcher: Matcher::default(),
            ba_config: LocalBaConfig::default(),
            new_keyframes: Mutex::new(VecDeque::new()),
            recent_points: Mutex::new(Vec::new()),
            abort_ba: AtomicBool::new(false),
            accept_keyframes: AtomicBool::new(true),
            stop: Mutex::new(StopFlags::default()),
            reset_requested: Mutex::new(false),
            finish: Mutex::new(FinishFlags {
                requested: false,
                finished: true,
            }),
            loop_closer,
        }
    }

    // ------------------------------------------------------------------
    // Worker loop
    // ------------------------------------------------------------------

    /// Drive the pipeline until finish is requested. Run this on a
    /// dedicated thread.
    pub fn run(&self) {
        info!("local mapping started");
        self.finish.lock().finished = false;

        loop {
            // The tracker sees the mapper as busy while an iteration is
            // in flight.
            self.set_accept_keyframes(false);

            if self.check_new_keyframes() {
                if let Some(kf_id) = self.process_new_keyframe() {
                    self.map_point_culling(kf_id);
                    self.create_new_map_points(kf_id);

                    if !self.check_new_keyframes() {
                        self.search_in_neighbors(kf_id);
                    }

                    self.abort_ba.store(false, Ordering::SeqCst);

                    if !self.check_new_keyframes() && !self.stop_requested() {
                        if self.map.read().keyframes_in_map() > MIN_KEYFRAMES_FOR_BA {
                            self.local_bundle_adjustment(kf_id);
                        }
                        self.keyframe_culling(kf_id);
                    }

                    if let Some(sender) = &self.loop_closer {
                        let _ = sender.send(kf_id);
                    }
                }
            } else if self.stop() {
                // Safe point: idle and asked to pause.
                while self.is_stopped() && !self.check_finish() {
                    std::thread::sleep(SLEEP_QUANTUM);
                }
                if self.check_finish() {
                    break;
                }
            }

            self.reset_if_requested();
            self.set_accept_keyframes(true);

            if self.check_finish() {
                break;
            }
            std::thread::sleep(SLEEP_QUANTUM);
        }

        self.set_finish();
        info!("local mapping finished");
    }

    // ------------------------------------------------------------------
    // Pipeline stages
    // ------------------------------------------------------------------

    /// Dequeue the oldest keyframe, register the tracker's matches as
    /// observations, queue fresh stereo points for vetting, and bring the
    /// covisibility graph up to date.
    fn process_new_keyframe(&self) -> Option<KeyFrameId> {
        let kf_id = self.new_keyframes.lock().pop_front()?;

        let mut map = self.map.write();
        let slot_points: Vec<(usize, MapPointId)> = match map.keyframe(kf_id) {
            Some(kf) if !kf.is_bad => kf.observed_points().collect(),
            _ => return None,
        };

        let mut recent = self.recent_points.lock();
        for (slot, mp_id) in slot_points {
            let observed = match map.map_point(mp_id) {
                Some(mp) if !mp.is_bad => mp.observed_by(kf_id),
                _ => continue,
            };
            if !observed {
                // A match made by the tracker against the existing map.
                map.add_observation(kf_id, slot, mp_id);
                map.update_normal_and_depth(mp_id);
                map.compute_distinctive_descriptor(mp_id);
            } else {
                // A stereo/RGB-D point the tracker created this frame;
                // it must earn its observations before it stays.
                recent.push(mp_id);
            }
        }
        drop(recent);

        map.update_connections(kf_id);
        debug!("{kf_id}: ingested");
        Some(kf_id)
    }

    fn map_point_culling(&self, kf_id: KeyFrameId) {
        let mut map = self.map.write();
        let mut recent = self.recent_points.lock();
        cull_recent_map_points(&mut map, &mut recent, kf_id, self.sensor);
    }

    fn create_new_map_points(&self, kf_id: KeyFrameId) {
        let mut map = self.map.write();
        let mut recent = self.recent_points.lock();
        create_new_map_points(
            &mut map,
            kf_id,
            self.sensor,
            &self.triangulation_matcher,
            &mut recent,
            &|| self.check_new_keyframes(),
        );
    }

    fn search_in_neighbors(&self, kf_id: KeyFrameId) {
        let mut map = self.map.write();
        search_in_neighbors(&mut map, kf_id, self.sensor, &self.fusion_matcher, &|| {
            self.check_new_keyframes()
        });
    }

    /// Three-phase local BA: snapshot the local window under the read
    /// lock, solve without any lock, write refined poses and positions
    /// back under the write lock. The solver polls the shared abort flag
    /// and returns whatever partial improvement it has when it trips.
    fn local_bundle_adjustment(&self, kf_id: KeyFrameId) {
        let problem = {
            let map = self.map.read();
            collect_local_ba_data(&map, kf_id, &self.ba_config)
        };
        let problem = match problem {
            Some(p) => p,
            None => return,
        };

        let result = solve_local_ba(&problem, &self.ba_config, &|| {
            self.abort_ba.load(Ordering::SeqCst)
        });

        if let Some(result) = result {
            let mut map = self.map.write();
            let updated = apply_local_ba(&mut map, &result);
            debug!(
                "{kf_id}: local BA {} iters, error {:.3} -> {:.3} ({updated} updated)",
                result.iterations, result.initial_error, result.final_error
            );
        }
    }

    fn keyframe_culling(&self, kf_id: KeyFrameId) {
        let mut map = self.map.write();
        cull_redundant_keyframes(&mut map, kf_id, self.sensor);
    }

    // ------------------------------------------------------------------
    // Tracker interface
    // ------------------------------------------------------------------

    /// Enqueue a keyframe already inserted into the map by the tracker.
    /// Any running bundle adjustment is told to wrap up.
    pub fn insert_keyframe(&self, kf_id: KeyFrameId) {
        self.new_keyframes.lock().push_back(kf_id);
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    /// Whether the mapper is ready for another keyframe. The tracker uses
    /// this as back-pressure before spawning one.
    pub fn accept_keyframes(&self) -> bool {
        self.accept_keyframes.load(Ordering::SeqCst)
    }

    fn set_accept_keyframes(&self, flag: bool) {
        self.accept_keyframes.store(flag, Ordering::SeqCst);
    }

    /// Number of keyframes waiting in the queue.
    pub fn queued_keyframes(&self) -> usize {
        self.new_keyframes.lock().len()
    }

    fn check_new_keyframes(&self) -> bool {
        !self.new_keyframes.lock().is_empty()
    }

    /// Force the running bundle adjustment to return early.
    pub fn interrupt_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Stop / release
    // ------------------------------------------------------------------

    /// Ask the worker to pause at its next safe point.
    pub fn request_stop(&self) {
        self.stop.lock().stop_requested = true;
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    /// Honor a pending stop request unless vetoed. Returns whether the
    /// worker transitioned to stopped.
    pub fn stop(&self) -> bool {
        let mut stop = self.stop.lock();
        if stop.stop_requested && !stop.not_stop {
            stop.stopped = true;
            info!("local mapping stopped");
            true
        } else {
            false
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.lock().stopped
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.lock().stop_requested
    }

    /// Veto stopping (the tracker needs a live mapper, e.g. during
    /// relocalization). Fails if the worker is already stopped.
    pub fn set_not_stop(&self, flag: bool) -> bool {
        let mut stop = self.stop.lock();
        if flag && stop.stopped {
            return false;
        }
        stop.not_stop = flag;
        true
    }

    /// Resume after a stop: discard the pending queue and clear the stop
    /// state.
    pub fn release(&self) {
        let mut stop = self.stop.lock();
        let finish = self.finish.lock();
        if finish.finished {
            return;
        }
        stop.stopped = false;
        stop.stop_requested = false;
        self.new_keyframes.lock().clear();
        info!("local mapping released");
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Ask the worker to drop all in-flight state, blocking until it has:
    /// the pending queue and the recent-point watch list are empty when
    /// this returns.
    pub fn request_reset(&self) {
        *self.reset_requested.lock() = true;
        loop {
            if !*self.reset_requested.lock() {
                break;
            }
            std::thread::sleep(SLEEP_QUANTUM);
        }
    }

    fn reset_if_requested(&self) {
        let mut requested = self.reset_requested.lock();
        if *requested {
            self.new_keyframes.lock().clear();
            self.recent_points.lock().clear();
            *requested = false;
            info!("local mapping reset");
        }
    }

    // ------------------------------------------------------------------
    // Finish
    // ------------------------------------------------------------------

    /// Begin the termination protocol; the worker exits at its next
    /// checkpoint.
    pub fn request_finish(&self) {
        self.finish.lock().requested = true;
    }

    fn check_finish(&self) -> bool {
        self.finish.lock().requested
    }

    fn set_finish(&self) {
        self.finish.lock().finished = true;
        self.stop.lock().stopped = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finish.lock().finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::geometry::SE3;
    use crate::map::{KeyFrameData, KeyPoint, ScalePyramid};
    use nalgebra::{UnitQuaternion, Vector3};

    fn mapper_over(map: Map) -> LocalMapping {
        LocalMapping::new(Arc::new(RwLock::new(map)), Sensor::Monocular, None)
    }

    fn insert_plain_keyframe(map: &mut Map) -> KeyFrameId {
        let cam = CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0);
        map.insert_keyframe(KeyFrameData::monocular(
            SE3::new(UnitQuaternion::identity(), Vector3::zeros()),
            cam,
            vec![KeyPoint { x: 320.0, y: 240.0, octave: 0 }],
            vec![[0u8; 32]],
            ScalePyramid::new(1.2, 8),
        ))
    }

    #[test]
    fn test_stop_requires_request() {
        let mapper = mapper_over(Map::new());
        assert!(!mapper.stop());
        assert!(!mapper.is_stopped());

        mapper.request_stop();
        assert!(mapper.stop_requested());
        assert!(mapper.stop());
        assert!(mapper.is_stopped());
    }

    #[test]
    fn test_not_stop_vetoes_stop() {
        let mapper = mapper_over(Map::new());
        assert!(mapper.set_not_stop(true));

        mapper.request_stop();
        assert!(!mapper.stop(), "veto holds");

        assert!(mapper.set_not_stop(false));
        assert!(mapper.stop());

        // Once stopped, the veto can no longer be taken.
        assert!(!mapper.set_not_stop(true));
    }

    #[test]
    fn test_release_discards_queue_and_clears_stop() {
        let mut map = Map::new();
        let kf = insert_plain_keyframe(&mut map);
        let mapper = mapper_over(map);
        mapper.finish.lock().finished = false;

        mapper.insert_keyframe(kf);
        mapper.request_stop();
        assert!(mapper.stop());
        assert_eq!(mapper.queued_keyframes(), 1);

        mapper.release();
        assert!(!mapper.is_stopped());
        assert!(!mapper.stop_requested());
        assert_eq!(mapper.queued_keyframes(), 0);
    }

    #[test]
    fn test_release_after_finish_is_a_noop() {
        let mapper = mapper_over(Map::new());
        mapper.request_stop();
        assert!(mapper.stop());
        // finished defaults to true before run(); release must not clear.
        mapper.release();
        assert!(mapper.is_stopped());
    }

    #[test]
    fn test_insert_keyframe_sets_abort_ba() {
        let mut map = Map::new();
        let kf = insert_plain_keyframe(&mut map);
        let mapper = mapper_over(map);

        assert!(!mapper.abort_ba.load(Ordering::SeqCst));
        mapper.insert_keyframe(kf);
        assert!(mapper.abort_ba.load(Ordering::SeqCst));
        assert!(mapper.check_new_keyframes());
    }

    #[test]
    fn test_ba_gate_needs_more_than_two_keyframes() {
        let mut map = Map::new();
        insert_plain_keyframe(&mut map);
        insert_plain_keyframe(&mut map);
        let mapper = mapper_over(map);

        assert!(mapper.map.read().keyframes_in_map() <= MIN_KEYFRAMES_FOR_BA);
    }

    #[test]
    fn test_process_new_keyframe_splits_matches_and_fresh_points() {
        let cam = CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0);
        let mut map = Map::new();

        // An older keyframe owning an established point.
        let old_kf = map.insert_keyframe(KeyFrameData::monocular(
            SE3::identity(),
            cam,
            vec![KeyPoint { x: 300.0, y: 200.0, octave: 0 }; 2],
            vec![[1u8; 32]; 2],
            ScalePyramid::new(1.2, 8),
        ));
        let prior_kf = map.insert_keyframe(KeyFrameData::monocular(
            SE3::identity(),
            cam,
            vec![KeyPoint { x: 300.0, y: 200.0, octave: 0 }; 2],
            vec![[1u8; 32]; 2],
            ScalePyramid::new(1.2, 8),
        ));
        let tracked = map.create_map_point(Vector3::new(0.0, 0.0, 4.0), [1u8; 32], old_kf);
        map.add_observation(old_kf, 0, tracked);
        map.add_observation(prior_kf, 0, tracked);

        // The new keyframe: slot 0 matched by the tracker (link only),
        // slot 1 a fresh stereo point with the observation registered.
        let new_kf = map.insert_keyframe(KeyFrameData::monocular(
            SE3::identity(),
            cam,
            vec![KeyPoint { x: 300.0, y: 200.0, octave: 0 }; 2],
            vec![[1u8; 32]; 2],
            ScalePyramid::new(1.2, 8),
        ));
        map.keyframe_mut(new_kf).unwrap().set_map_point(0, tracked);
        let fresh = map.create_map_point(Vector3::new(0.1, 0.0, 2.0), [2u8; 32], new_kf);
        map.add_observation(new_kf, 1, fresh);

        let mapper = LocalMapping::new(Arc::new(RwLock::new(map)), Sensor::Monocular, None);
        mapper.insert_keyframe(new_kf);
        let processed = mapper.process_new_keyframe().unwrap();
        assert_eq!(processed, new_kf);

        let map = mapper.map.read();
        // The tracked match became a full observation.
        assert!(map.map_point(tracked).unwrap().observed_by(new_kf));
        // The fresh point landed on the probation list.
        assert_eq!(*mapper.recent_points.lock(), vec![fresh]);
        // Covisibility recounted: new_kf shares the tracked point with
        // both observers.
        assert_eq!(map.keyframe(new_kf).unwrap().covisibility_weight(old_kf), 1);
        assert_eq!(
            map.keyframe(new_kf).unwrap().covisibility_weight(prior_kf),
            1
        );
    }
}
