//! The map graph: keyframes, map points, and their cross-links.

pub mod keyframe;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::{Descriptor, KeyFrame, KeyFrameData, KeyPoint, ScalePyramid};
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
