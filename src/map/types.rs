//! Identifier types for map entities.

/// Identity of a keyframe within the map.
///
/// Assigned by the map's monotonic counter at insertion, never reused.
/// Ids double as lightweight handles: looking up a culled keyframe still
/// resolves to its tombstone entry rather than dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    /// The root keyframe, which keyframe culling never removes.
    pub const ROOT: KeyFrameId = KeyFrameId(0);
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Identity of a map point within the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapPointId(pub u64);

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}
