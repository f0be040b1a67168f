//! The GPU interface the executor drives.
//!
//! The executor's correctness lives in its control flow (grow-and-replay,
//! per-instance sizing, teardown ordering), not in the Vulkan calls
//! themselves, so that control flow talks to this trait. The production
//! implementation is [`crate::vulkan::VulkanDriver`]; tests substitute
//! in-process stubs.

use crate::context::ReplayCaps;
use prism_spirv::SpecValues;
use thiserror::Error;

/// Opaque driver-owned buffer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// How a fetch buffer is used; drives usage flags and memory-type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUse {
    /// Device-local storage written by patched shaders.
    Storage,
    /// Device-local storage also addressed via buffer device address.
    StorageAddressed,
    /// Host-visible readback target.
    Readback,
    /// Host-visible upload source (rebased indices, compacted attributes).
    Upload,
    /// Transform-feedback capture target.
    TransformFeedback,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("allocation of {requested} bytes exceeds device limit {limit}")]
    AllocationTooLarge { requested: u64, limit: u64 },
    #[error("out of device or host memory")]
    OutOfMemory,
    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),
    #[error("mapped pointer was null after successful map")]
    MappedPointerNull,
    #[error("missing capability: {0}")]
    CapabilityMissing(&'static str),
    #[error("device lost")]
    DeviceLost,
    #[error("command recording failed: {0}")]
    Recording(String),
}

impl DriverError {
    /// Device loss is the one category that is not locally recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::DeviceLost)
    }
}

/// A compute dispatch over a patched shader module.
#[derive(Debug, Clone)]
pub struct ComputePass<'a> {
    pub spirv: &'a [u32],
    pub entry: &'a str,
    pub spec_values: &'a SpecValues,
    pub group_count: [u32; 3],
    /// Buffers bound (or addressed) by the pass, slot order matching the
    /// annotator's slot numbering.
    pub buffers: &'a [BufferHandle],
}

/// A replayed captured draw, identified by raw pipeline-state handles owned
/// by the capture collaborator.
#[derive(Debug, Clone)]
pub struct DrawReplay {
    pub pipeline: u64,
    pub vertex_buffers: Vec<(u64, u64)>,
    pub index_buffer: Option<(u64, u64)>,
    pub vertex_count: u32,
    pub first_vertex: u32,
}

/// Result of a transform-feedback capture pass.
///
/// The stream query yields primitive counts only; byte totals are for the
/// caller to derive from the capture declaration's per-primitive stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfbStats {
    /// Primitives actually written into the capture buffer.
    pub primitives_written: u64,
    /// Primitives the draw generated, regardless of capture capacity.
    pub primitives_needed: u64,
}

pub trait GpuDriver {
    fn caps(&self) -> ReplayCaps;

    /// Largest single storage-buffer allocation the device accepts.
    fn max_buffer_bytes(&self) -> u64;

    fn create_buffer(&mut self, size: u64, usage: BufferUse)
        -> Result<BufferHandle, DriverError>;
    fn destroy_buffer(&mut self, handle: BufferHandle);

    /// Device address of an addressed buffer, split into (lo, hi) words the
    /// annotator's spec constants consume.
    fn buffer_address(&self, handle: BufferHandle) -> Result<(u32, u32), DriverError>;

    fn write_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DriverError>;

    /// Submits a compute pass and blocks until it completes. The driver
    /// zero-fills every bound buffer, barriers, dispatches, barriers, and
    /// copies into its readback shadow before signaling.
    fn run_compute(&mut self, pass: &ComputePass<'_>) -> Result<(), DriverError>;

    /// Replays a captured draw with transform feedback capturing into
    /// `capture`, for the first `instance_count` instances.
    fn run_xfb_draw(
        &mut self,
        draw: &DrawReplay,
        instance_count: u32,
        capture: BufferHandle,
        capacity_bytes: u64,
    ) -> Result<XfbStats, DriverError>;

    /// Replays a captured draw bracketed by an occlusion query scoped to a
    /// one-pixel scissor; returns the sample-passed count.
    fn run_occlusion_draw(
        &mut self,
        draw: &DrawReplay,
        pixel: (u32, u32),
    ) -> Result<u64, DriverError>;

    fn read_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, DriverError>;

    /// CPU/GPU synchronization checkpoint.
    fn wait_idle(&mut self) -> Result<(), DriverError>;
}
