//! Replay event classification.
//!
//! Consumers that walk a capture's event stream (pixel history, the data
//! store, interop event selection) dispatch on a tagged event kind through a
//! single visitor rather than per-consumer callback interfaces.

/// What a captured event does, as far as replay analysis cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Rasterizing draw (indexed or not).
    Draw,
    /// Compute dispatch.
    Dispatch,
    /// Task/mesh pipeline dispatch.
    MeshDispatch,
    /// Clears, copies, resolves, blits: writes without running a shader the
    /// analysis can instrument.
    Misc,
    /// Render-pass begin/end markers.
    PassBoundary,
}

impl EventKind {
    /// Whether the event writes render targets directly, without rasterizing
    /// through the tested pipeline stages.
    pub fn is_direct_write(self) -> bool {
        self == EventKind::Misc
    }

    /// Whether the event produces post-transform geometry to fetch.
    pub fn has_stage_output(self) -> bool {
        matches!(self, EventKind::Draw | EventKind::MeshDispatch)
    }
}

/// One captured event as replay consumers see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEvent {
    pub event_id: u64,
    pub kind: EventKind,
    /// Whether this Misc event is a clear (relevant to pixel history).
    pub is_clear: bool,
}

pub trait EventVisitor {
    fn draw(&mut self, event: &ReplayEvent);
    fn dispatch(&mut self, event: &ReplayEvent);
    fn mesh_dispatch(&mut self, event: &ReplayEvent);
    fn misc(&mut self, event: &ReplayEvent);
    fn pass_boundary(&mut self, event: &ReplayEvent);
}

pub fn visit_event<V: EventVisitor>(visitor: &mut V, event: &ReplayEvent) {
    match event.kind {
        EventKind::Draw => visitor.draw(event),
        EventKind::Dispatch => visitor.dispatch(event),
        EventKind::MeshDispatch => visitor.mesh_dispatch(event),
        EventKind::Misc => visitor.misc(event),
        EventKind::PassBoundary => visitor.pass_boundary(event),
    }
}
