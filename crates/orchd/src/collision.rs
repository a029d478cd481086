//! Whether a track's next step may start alongside the runs already active.

use orch_core::pattern::scopes_overlap;
use orch_core::types::{CollisionPolicy, TrackId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionDecision {
    Start,
    /// Declared scope overlaps the active run on `blocked_by`.
    Defer { blocked_by: TrackId },
}

/// Apply `policy` to a candidate step. `active` pairs each busy track with
/// the `owns` of the step it is running. An empty `owns` is undeclared and
/// collides with everything under `serialize`.
pub fn check_collision<S: AsRef<str>>(
    policy: CollisionPolicy,
    candidate_owns: &[S],
    active: &[(TrackId, Vec<String>)],
) -> CollisionDecision {
    if policy == CollisionPolicy::Parallel {
        return CollisionDecision::Start;
    }
    active
        .iter()
        .find(|(_, owns)| scopes_overlap(candidate_owns, owns))
        .map(|(track, _)| CollisionDecision::Defer {
            blocked_by: track.clone(),
        })
        .unwrap_or(CollisionDecision::Start)
}
