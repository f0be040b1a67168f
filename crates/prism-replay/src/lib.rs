//! GPU round-trip execution for replay analysis.
//!
//! A fetch operation patches a captured pipeline's shaders (via
//! `prism-annotate`), runs the result on the device, and reads the produced
//! data back for CPU-side inspection. This crate owns that round trip:
//!
//! - [`context`]: the session-scoped device context and capability probe.
//! - [`driver`]: the narrow GPU interface the executor drives, so the
//!   control flow (retries, sizing loops, teardown ordering) is testable
//!   against an in-process stub.
//! - [`vulkan`]: the real `ash`-backed driver.
//! - [`executor`]: the per-fetch state machine.
//! - [`store`]: the post-transform data store caching fetch results.
//! - [`pixel_history`]: the per-pixel event history engine.
//!
//! Everything below the session returns soft failures as status strings on
//! the result object; only device loss escalates, through the session's
//! device-lost hook.

pub mod context;
pub mod driver;
pub mod event;
pub mod executor;
pub mod pixel_history;
pub mod store;
pub mod vulkan;

pub use context::{DeviceContext, ReplayCaps};
pub use driver::{BufferHandle, BufferUse, DriverError, GpuDriver};
pub use event::{EventKind, EventVisitor};
pub use executor::{Executor, FetchState, PostVsFetch, StageData};
pub use pixel_history::{PixelHistoryQuery, PixelModification};
pub use store::{PostTransformStore, StoreKey};
pub use vulkan::{create_context, VulkanDriver};
