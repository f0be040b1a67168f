//! Session layer: capture lifecycle, event selection, and background fetch
//! plumbing over the replay crates. This is the surface external
//! collaborators (UI shell, capture container, interop socket) talk to.

pub mod context;
pub mod fetch;

pub use context::CaptureContext;
pub use fetch::{FetchHandle, ProcessingTag, ProgressSink};
