//! Nonlinear refinement of the local pose/point subgraph.

pub mod local_ba;

pub use local_ba::{
    apply_local_ba, collect_local_ba_data, solve_local_ba, BaObservation, LocalBaConfig,
    LocalBaProblem, LocalBaResult,
};
