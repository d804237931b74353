//! Portable event kinds shared by every backend.

/// A portable, semantic performance-event label. Each backend resolves a
/// `EventKind` to its own native descriptor; not every kind is resolvable on
/// every host, which is exactly what [`Session::event_available`] probes.
///
/// [`Session::event_available`]: crate::session::Session::event_available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    None,
    Cycles,
    Instructions,
    Branches,
    BranchMisses,
    L1iLoads,
    L1iLoadMisses,
    L1dLoads,
    L1dLoadMisses,
    L1dStores,
    L1dStoreMisses,
    LlcLoads,
    LlcLoadMisses,
    LlcStores,
    LlcStoreMisses,
}

impl EventKind {
    /// All portable kinds in a stable order, for `event_available` sweeps
    /// (used by the `pmubench-list` binary).
    pub const ALL: &'static [EventKind] = &[
        EventKind::Cycles,
        EventKind::Instructions,
        EventKind::Branches,
        EventKind::BranchMisses,
        EventKind::L1iLoads,
        EventKind::L1iLoadMisses,
        EventKind::L1dLoads,
        EventKind::L1dLoadMisses,
        EventKind::L1dStores,
        EventKind::L1dStoreMisses,
        EventKind::LlcLoads,
        EventKind::LlcLoadMisses,
        EventKind::LlcStores,
        EventKind::LlcStoreMisses,
    ];
}
