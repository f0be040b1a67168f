//! The per-fetch GPU round-trip state machine.
//!
//! Every fetch walks `Idle → AllocatingBuffers → BuildingPipeline →
//! RecordingCommands → Submitted → ReadingBack → Done | Failed`. Failures
//! below device loss never escape as errors: the fetch lands in `Failed` and
//! the returned data carries a human-readable status string. Temporaries
//! (upload buffers, count-pass buffers) are destroyed on every path; only
//! the final result buffer survives, handed to the data store.
//!
//! The per-instance transform-feedback sizing loop replays the draw with
//! 1, 2, … N instances and differences the combined byte counts, because the
//! query cannot attribute bytes to individual instances. That is O(N²) in
//! replay cost; a sync checkpoint every [`SYNC_CHECKPOINT_INSTANCES`] bounds
//! command-buffer growth on pathological instance counts.

use crate::context::DeviceLostHook;
use crate::driver::{BufferHandle, BufferUse, ComputePass, DrawReplay, DriverError, GpuDriver};
use prism_annotate::meshout::{all_counts_empty, decode_meshlet_counts, MeshCaptureShader};
use prism_annotate::postvs::{
    derive_clip_planes, PostVsShader, SPEC_ID_INSTANCE_COUNT, SPEC_ID_VERTEX_COUNT,
    SPEC_ID_VIEW_COUNT,
};
use prism_annotate::strategy::SPEC_ID_ADDR_BASE;
use prism_spirv::opcode::builtin;
use prism_spirv::SpecValues;

pub const SYNC_CHECKPOINT_INSTANCES: u32 = 1000;

const POSTVS_ENTRY: &str = "main";
const DISPATCH_WIDTH: u32 = prism_annotate::postvs::DISPATCH_WIDTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    AllocatingBuffers,
    BuildingPipeline,
    RecordingCommands,
    Submitted,
    ReadingBack,
    Done,
    Failed,
}

/// A post-vertex-stage fetch request: the rewritten shader plus the CPU-side
/// payloads it pulls from.
#[derive(Debug, Clone)]
pub struct PostVsFetch {
    pub shader: PostVsShader,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub view_count: u32,
    /// Fetch indices for `SLOT_INDEX`; `None` for non-indexed draws.
    pub index_words: Option<Vec<u32>>,
    /// Compacted attribute payloads, one per declared input, in slot order.
    pub attributes: Vec<Vec<u8>>,
    pub base_vertex: i32,
}

/// A mesh-output fetch request: count-pass and commit-pass modules over the
/// same meshlet layout, plus the dispatch size.
#[derive(Debug, Clone)]
pub struct MeshFetch {
    pub count_shader: MeshCaptureShader,
    pub commit_shader: MeshCaptureShader,
    pub entry: String,
    pub group_count: [u32; 3],
}

/// What the stage-output viewers consume.
///
/// A non-empty `status` means a soft failure: render the message, not an
/// empty mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct StageData {
    pub vertex_buffer: Option<BufferHandle>,
    pub index_buffer: Option<BufferHandle>,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub base_vertex: i32,
    pub near_plane: f32,
    pub far_plane: f32,
    pub flip_y: bool,
    pub status: String,
}

impl StageData {
    pub fn failed(status: impl Into<String>) -> StageData {
        StageData {
            vertex_buffer: None,
            index_buffer: None,
            vertex_stride: 0,
            vertex_count: 0,
            instance_count: 0,
            base_vertex: 0,
            near_plane: 0.0,
            far_plane: 0.0,
            flip_y: false,
            status: status.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status.is_empty()
    }
}

pub struct Executor<D: GpuDriver> {
    driver: D,
    state: FetchState,
    device_lost: Option<DeviceLostHook>,
}

/// Buffers created during one fetch, torn down before the fetch returns.
/// Handles moved out (via `keep`) survive as the fetch's result.
struct Temporaries {
    handles: Vec<BufferHandle>,
}

impl Temporaries {
    fn new() -> Temporaries {
        Temporaries {
            handles: Vec::new(),
        }
    }

    fn track(&mut self, handle: BufferHandle) -> BufferHandle {
        self.handles.push(handle);
        handle
    }

    fn keep(&mut self, handle: BufferHandle) {
        self.handles.retain(|&h| h != handle);
    }

    fn teardown<D: GpuDriver>(self, driver: &mut D) {
        for handle in self.handles {
            driver.destroy_buffer(handle);
        }
    }
}

impl<D: GpuDriver> Executor<D> {
    pub fn new(driver: D) -> Executor<D> {
        Executor {
            driver,
            state: FetchState::Idle,
            device_lost: None,
        }
    }

    pub fn with_device_lost(mut self, hook: DeviceLostHook) -> Executor<D> {
        self.device_lost = Some(hook);
        self
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Releases a result buffer previously handed out in a `StageData`.
    /// Called by the data store, the sole owner of cached buffers.
    pub fn release_buffer(&mut self, handle: BufferHandle) {
        self.driver.destroy_buffer(handle);
    }

    fn fail(&mut self, temporaries: Temporaries, err: &DriverError) -> StageData {
        if err.is_fatal() {
            if let Some(hook) = &self.device_lost {
                hook("gpu fetch");
            }
            tracing::error!(error = %err, "device lost during fetch");
        } else {
            tracing::warn!(error = %err, "fetch failed");
        }
        temporaries.teardown(&mut self.driver);
        self.state = FetchState::Failed;
        StageData::failed(err.to_string())
    }

    /// Fetches the post-vertex-stage output of a draw by running the
    /// rewritten compute shader over the pulled inputs.
    pub fn fetch_post_vs(&mut self, req: &PostVsFetch) -> StageData {
        let mut temporaries = Temporaries::new();
        self.state = FetchState::AllocatingBuffers;

        let threads = req.vertex_count as u64 * req.instance_count as u64 * req.view_count as u64;
        if threads == 0 {
            self.state = FetchState::Done;
            return StageData::failed("draw produces no vertices");
        }
        let output_bytes = threads * req.shader.record_stride as u64;
        if output_bytes > self.driver.max_buffer_bytes() {
            self.state = FetchState::Failed;
            return StageData::failed(format!(
                "post-transform output of {output_bytes} bytes exceeds device limit {}",
                self.driver.max_buffer_bytes()
            ));
        }

        let output = match self.driver.create_buffer(output_bytes, BufferUse::StorageAddressed) {
            Ok(b) => temporaries.track(b),
            Err(e) => return self.fail(temporaries, &e),
        };
        let mut buffers = vec![output];

        let index = match &req.index_words {
            Some(words) => {
                let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
                match self.upload(&mut temporaries, &bytes) {
                    Ok(b) => b,
                    Err(e) => return self.fail(temporaries, &e),
                }
            }
            // Slot 1 must still be bound; a one-word placeholder suffices
            // because the shader never reads it for non-indexed draws.
            None => match self.upload(&mut temporaries, &[0u8; 4]) {
                Ok(b) => b,
                Err(e) => return self.fail(temporaries, &e),
            },
        };
        buffers.push(index);
        for payload in &req.attributes {
            let data: &[u8] = if payload.is_empty() { &[0u8; 4] } else { payload };
            match self.upload(&mut temporaries, data) {
                Ok(b) => buffers.push(b),
                Err(e) => return self.fail(temporaries, &e),
            }
        }

        self.state = FetchState::BuildingPipeline;
        let mut spec = SpecValues::new();
        spec.set(SPEC_ID_VERTEX_COUNT, req.vertex_count as u64);
        spec.set(SPEC_ID_INSTANCE_COUNT, req.instance_count as u64);
        spec.set(SPEC_ID_VIEW_COUNT, req.view_count as u64);
        if let Err(e) = self.set_address_constants(&mut spec, &buffers) {
            return self.fail(temporaries, &e);
        }

        self.state = FetchState::RecordingCommands;
        let groups = (threads as u32).div_ceil(DISPATCH_WIDTH);
        let pass = ComputePass {
            spirv: &req.shader.words,
            entry: POSTVS_ENTRY,
            spec_values: &spec,
            group_count: [groups, 1, 1],
            buffers: &buffers,
        };
        self.state = FetchState::Submitted;
        if let Err(e) = self.driver.run_compute(&pass) {
            return self.fail(temporaries, &e);
        }

        self.state = FetchState::ReadingBack;
        let (near, far) = match self.read_clip_planes(req, output, threads) {
            Ok(planes) => planes,
            Err(e) => return self.fail(temporaries, &e),
        };

        temporaries.keep(output);
        temporaries.teardown(&mut self.driver);
        self.state = FetchState::Done;
        StageData {
            vertex_buffer: Some(output),
            index_buffer: None,
            vertex_stride: req.shader.record_stride,
            vertex_count: req.vertex_count,
            instance_count: req.instance_count,
            base_vertex: req.base_vertex,
            near_plane: near,
            far_plane: far,
            flip_y: true,
            status: String::new(),
        }
    }

    /// Fetches mesh-shader output with the two-pass count-then-commit
    /// protocol: a counting dispatch sizes the real allocation, then a full
    /// dispatch fills it.
    pub fn fetch_mesh_output(&mut self, req: &MeshFetch) -> StageData {
        let mut temporaries = Temporaries::new();
        self.state = FetchState::AllocatingBuffers;

        let groups =
            req.group_count[0] as u64 * req.group_count[1] as u64 * req.group_count[2] as u64;
        if groups == 0 {
            self.state = FetchState::Done;
            return StageData::failed("mesh dispatch has zero groups");
        }
        let layout = &req.count_shader.layout;
        let record_bytes = groups * layout.total_size as u64;
        if record_bytes > self.driver.max_buffer_bytes() {
            self.state = FetchState::Failed;
            return StageData::failed(format!(
                "meshlet capture of {record_bytes} bytes exceeds device limit {}",
                self.driver.max_buffer_bytes()
            ));
        }

        // Count pass: headers only, but the capture layout (and therefore the
        // buffer size) is the same in both passes.
        let count_buffer = match self.driver.create_buffer(record_bytes, BufferUse::StorageAddressed)
        {
            Ok(b) => temporaries.track(b),
            Err(e) => return self.fail(temporaries, &e),
        };
        if let Err(e) = self.run_mesh_pass(&req.count_shader, &req.entry, req.group_count, count_buffer)
        {
            return self.fail(temporaries, &e);
        }

        self.state = FetchState::ReadingBack;
        let count_bytes = match self.driver.read_buffer(count_buffer, 0, record_bytes) {
            Ok(b) => b,
            Err(e) => return self.fail(temporaries, &e),
        };
        let counts = decode_meshlet_counts(&count_bytes, layout, groups as u32);
        if counts
            .iter()
            .any(|c| c.vertices > layout.max_vertices || c.primitives > layout.max_primitives)
        {
            // Corrupted counts mean the patched shader and this reader
            // disagree about the layout. Log loudly, skip the event.
            tracing::error!(
                groups,
                "meshlet counts exceed declared limits; skipping event"
            );
            temporaries.teardown(&mut self.driver);
            self.state = FetchState::Failed;
            return StageData::failed("corrupted meshlet counts from capture pass");
        }
        if all_counts_empty(&counts) {
            temporaries.teardown(&mut self.driver);
            self.state = FetchState::Done;
            return StageData::failed("No mesh output data generated");
        }

        // Commit pass into a fresh buffer of the same layout; the count
        // buffer becomes a temporary.
        self.state = FetchState::AllocatingBuffers;
        let commit_buffer = match self.driver.create_buffer(record_bytes, BufferUse::StorageAddressed)
        {
            Ok(b) => temporaries.track(b),
            Err(e) => return self.fail(temporaries, &e),
        };
        if let Err(e) =
            self.run_mesh_pass(&req.commit_shader, &req.entry, req.group_count, commit_buffer)
        {
            return self.fail(temporaries, &e);
        }

        let total_vertices: u64 = counts.iter().map(|c| c.vertices as u64).sum();
        temporaries.keep(commit_buffer);
        temporaries.teardown(&mut self.driver);
        self.state = FetchState::Done;
        StageData {
            vertex_buffer: Some(commit_buffer),
            index_buffer: None,
            vertex_stride: layout.vertex_stride,
            vertex_count: total_vertices as u32,
            instance_count: 1,
            base_vertex: 0,
            near_plane: 0.0,
            far_plane: 0.0,
            flip_y: true,
            status: String::new(),
        }
    }

    /// Captures a draw's transform-feedback output, growing the buffer and
    /// replaying until it fits. Each retry grows capacity to at least the
    /// last observed demand, so the loop terminates.
    ///
    /// `primitive_stride` is the byte size of one captured primitive record,
    /// from the pipeline's capture declaration; the stream query reports
    /// primitive counts only.
    pub fn fetch_transform_feedback(
        &mut self,
        draw: &DrawReplay,
        instance_count: u32,
        primitive_stride: u64,
        initial_capacity: u64,
    ) -> StageData {
        let mut temporaries = Temporaries::new();
        let mut capacity = initial_capacity.max(4096);

        let (buffer, written) = loop {
            self.state = FetchState::AllocatingBuffers;
            if capacity > self.driver.max_buffer_bytes() {
                self.state = FetchState::Failed;
                temporaries.teardown(&mut self.driver);
                return StageData::failed(format!(
                    "transform feedback needs {capacity} bytes, device limit is {}",
                    self.driver.max_buffer_bytes()
                ));
            }
            let buffer = match self.driver.create_buffer(capacity, BufferUse::TransformFeedback) {
                Ok(b) => temporaries.track(b),
                Err(e) => return self.fail(temporaries, &e),
            };

            self.state = FetchState::Submitted;
            let stats = match self.driver.run_xfb_draw(draw, instance_count, buffer, capacity) {
                Ok(s) => s,
                Err(e) => return self.fail(temporaries, &e),
            };

            if stats.primitives_needed > stats.primitives_written {
                let needed = demand_bytes(&stats, primitive_stride, capacity);
                tracing::debug!(capacity, needed, "transform feedback overflow, replaying");
                self.driver.destroy_buffer(buffer);
                temporaries.keep(buffer);
                capacity = needed.max(capacity + 1);
                continue;
            }
            break (buffer, stats.primitives_written);
        };

        temporaries.keep(buffer);
        temporaries.teardown(&mut self.driver);
        self.state = FetchState::Done;
        StageData {
            vertex_buffer: Some(buffer),
            index_buffer: None,
            vertex_stride: primitive_stride as u32,
            vertex_count: written as u32,
            instance_count,
            base_vertex: 0,
            near_plane: 0.0,
            far_plane: 0.0,
            flip_y: true,
            status: String::new(),
        }
    }

    /// Per-instance transform-feedback byte contributions.
    ///
    /// Replays the draw with `numInstances = 1, 2, … n` and differences the
    /// combined primitive counts: the query result is not separable per
    /// instance. Bytes are each instance's primitive delta times the capture
    /// declaration's per-primitive stride.
    pub fn fetch_instance_sizes(
        &mut self,
        draw: &DrawReplay,
        instance_count: u32,
        primitive_stride: u64,
        capacity: u64,
    ) -> Result<Vec<u64>, DriverError> {
        let mut temporaries = Temporaries::new();
        self.state = FetchState::AllocatingBuffers;
        let buffer = match self.driver.create_buffer(capacity, BufferUse::TransformFeedback) {
            Ok(b) => temporaries.track(b),
            Err(e) => {
                self.fail_for_error(&e);
                temporaries.teardown(&mut self.driver);
                return Err(e);
            }
        };

        let mut sizes = Vec::with_capacity(instance_count as usize);
        let mut previous = 0u64;
        for n in 1..=instance_count {
            self.state = FetchState::Submitted;
            let stats = match self.driver.run_xfb_draw(draw, n, buffer, capacity) {
                Ok(s) => s,
                Err(e) => {
                    self.fail_for_error(&e);
                    temporaries.teardown(&mut self.driver);
                    return Err(e);
                }
            };
            let delta = stats.primitives_written.saturating_sub(previous);
            sizes.push(delta * primitive_stride);
            previous = stats.primitives_written;

            if n % SYNC_CHECKPOINT_INSTANCES == 0 {
                self.driver.wait_idle()?;
            }
        }

        temporaries.teardown(&mut self.driver);
        self.state = FetchState::Done;
        Ok(sizes)
    }

    fn fail_for_error(&mut self, err: &DriverError) {
        if err.is_fatal() {
            if let Some(hook) = &self.device_lost {
                hook("gpu fetch");
            }
        }
        self.state = FetchState::Failed;
    }

    fn upload(
        &mut self,
        temporaries: &mut Temporaries,
        data: &[u8],
    ) -> Result<BufferHandle, DriverError> {
        let buffer = self
            .driver
            .create_buffer(data.len() as u64, BufferUse::Upload)?;
        temporaries.track(buffer);
        self.driver.write_buffer(buffer, 0, data)?;
        Ok(buffer)
    }

    /// Seeds the per-slot address spec constants when the strategy uses
    /// device addresses. In descriptor mode the driver binds the arrayed
    /// descriptor instead and the constants stay at their defaults.
    fn set_address_constants(
        &self,
        spec: &mut SpecValues,
        buffers: &[BufferHandle],
    ) -> Result<(), DriverError> {
        if !self.driver.caps().address_mode().uses_device_address() {
            return Ok(());
        }
        for (slot, &buffer) in buffers.iter().enumerate() {
            let (lo, hi) = self.driver.buffer_address(buffer)?;
            let base = SPEC_ID_ADDR_BASE + 2 * slot as u32;
            spec.set(base, lo as u64);
            spec.set(base + 1, hi as u64);
        }
        Ok(())
    }

    /// Reads back the position records and derives near/far planes from the
    /// perspective-divide heuristic.
    fn read_clip_planes(
        &mut self,
        req: &PostVsFetch,
        output: BufferHandle,
        threads: u64,
    ) -> Result<(f32, f32), DriverError> {
        let Some(position) = req
            .shader
            .fields
            .iter()
            .find(|f| f.builtin == Some(builtin::POSITION))
        else {
            return Ok((0.0, 0.0));
        };
        let stride = req.shader.record_stride as u64;
        let sample = threads.min(64);
        let bytes = self.driver.read_buffer(output, 0, sample * stride)?;

        let mut positions = Vec::with_capacity(sample as usize);
        for t in 0..sample {
            let base = (t * stride + position.offset as u64) as usize;
            let Some(slice) = bytes.get(base..base + 16) else {
                break;
            };
            let mut v = [0.0f32; 4];
            for (k, out) in v.iter_mut().enumerate() {
                let word = u32::from_le_bytes([
                    slice[k * 4],
                    slice[k * 4 + 1],
                    slice[k * 4 + 2],
                    slice[k * 4 + 3],
                ]);
                *out = f32::from_bits(word);
            }
            positions.push(v);
        }
        Ok(derive_clip_planes(&positions))
    }

    fn run_mesh_pass(
        &mut self,
        shader: &MeshCaptureShader,
        entry: &str,
        group_count: [u32; 3],
        capture: BufferHandle,
    ) -> Result<(), DriverError> {
        self.state = FetchState::BuildingPipeline;
        let mut spec = SpecValues::new();
        self.set_address_constants(&mut spec, &[capture])?;
        self.state = FetchState::RecordingCommands;
        let pass = ComputePass {
            spirv: &shader.words,
            entry,
            spec_values: &spec,
            group_count,
            buffers: &[capture],
        };
        self.state = FetchState::Submitted;
        self.driver.run_compute(&pass)
    }
}

fn demand_bytes(stats: &crate::driver::XfbStats, primitive_stride: u64, capacity: u64) -> u64 {
    if primitive_stride == 0 {
        return capacity * 2;
    }
    stats.primitives_needed * primitive_stride
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ReplayCaps;
    use crate::driver::XfbStats;
    use prism_annotate::postvs::RecordField;
    use std::collections::HashSet;

    /// Deterministic in-process driver recording every call.
    struct StubDriver {
        caps: ReplayCaps,
        limit: u64,
        next_handle: u64,
        live: HashSet<BufferHandle>,
        created: u32,
        destroyed: u32,
        compute_runs: u32,
        xfb_runs: u32,
        idles: u32,
        /// Primitives the fake draw "needs" per instance.
        prims_per_instance: u64,
        bytes_per_prim: u64,
        fail_compute: Option<DriverError>,
        readback: Vec<u8>,
    }

    impl StubDriver {
        fn new() -> StubDriver {
            StubDriver {
                caps: ReplayCaps::BDA_KHR,
                limit: 1 << 30,
                next_handle: 1,
                live: HashSet::new(),
                created: 0,
                destroyed: 0,
                compute_runs: 0,
                xfb_runs: 0,
                idles: 0,
                prims_per_instance: 10,
                bytes_per_prim: 16,
                fail_compute: None,
                readback: Vec::new(),
            }
        }
    }

    impl GpuDriver for StubDriver {
        fn caps(&self) -> ReplayCaps {
            self.caps
        }

        fn max_buffer_bytes(&self) -> u64 {
            self.limit
        }

        fn create_buffer(
            &mut self,
            size: u64,
            _usage: BufferUse,
        ) -> Result<BufferHandle, DriverError> {
            if size > self.limit {
                return Err(DriverError::AllocationTooLarge {
                    requested: size,
                    limit: self.limit,
                });
            }
            let handle = BufferHandle(self.next_handle);
            self.next_handle += 1;
            self.live.insert(handle);
            self.created += 1;
            Ok(handle)
        }

        fn destroy_buffer(&mut self, handle: BufferHandle) {
            assert!(self.live.remove(&handle), "double free of {handle:?}");
            self.destroyed += 1;
        }

        fn buffer_address(&self, handle: BufferHandle) -> Result<(u32, u32), DriverError> {
            Ok((handle.0 as u32, 0))
        }

        fn write_buffer(
            &mut self,
            _handle: BufferHandle,
            _offset: u64,
            _data: &[u8],
        ) -> Result<(), DriverError> {
            Ok(())
        }

        fn run_compute(&mut self, _pass: &ComputePass<'_>) -> Result<(), DriverError> {
            if let Some(err) = self.fail_compute.clone() {
                return Err(err);
            }
            self.compute_runs += 1;
            Ok(())
        }

        fn run_xfb_draw(
            &mut self,
            _draw: &DrawReplay,
            instance_count: u32,
            _capture: BufferHandle,
            capacity_bytes: u64,
        ) -> Result<XfbStats, DriverError> {
            self.xfb_runs += 1;
            let needed = self.prims_per_instance * instance_count as u64;
            let fit = (capacity_bytes / self.bytes_per_prim).min(needed);
            Ok(XfbStats {
                primitives_written: fit,
                primitives_needed: needed,
            })
        }

        fn run_occlusion_draw(
            &mut self,
            _draw: &DrawReplay,
            _pixel: (u32, u32),
        ) -> Result<u64, DriverError> {
            Ok(0)
        }

        fn read_buffer(
            &mut self,
            _handle: BufferHandle,
            offset: u64,
            len: u64,
        ) -> Result<Vec<u8>, DriverError> {
            let start = (offset as usize).min(self.readback.len());
            let end = ((offset + len) as usize).min(self.readback.len());
            let mut out = self.readback[start..end].to_vec();
            out.resize(len as usize, 0);
            Ok(out)
        }

        fn wait_idle(&mut self) -> Result<(), DriverError> {
            self.idles += 1;
            Ok(())
        }
    }

    fn toy_shader() -> PostVsShader {
        PostVsShader {
            words: vec![0x0723_0203, 0x0001_0300, 0, 10, 0],
            record_stride: 16,
            fields: vec![RecordField {
                location: None,
                builtin: Some(builtin::POSITION),
                offset: 0,
                byte_size: 16,
            }],
            slot_count: 3,
            has_position: true,
        }
    }

    fn toy_fetch() -> PostVsFetch {
        PostVsFetch {
            shader: toy_shader(),
            vertex_count: 8,
            instance_count: 1,
            view_count: 1,
            index_words: Some(vec![0, 1, 2, 3]),
            attributes: vec![vec![0u8; 64]],
            base_vertex: 0,
        }
    }

    fn draw() -> DrawReplay {
        DrawReplay {
            pipeline: 1,
            vertex_buffers: vec![(2, 64)],
            index_buffer: None,
            vertex_count: 30,
            first_vertex: 0,
        }
    }

    #[test]
    fn post_vs_fetch_keeps_only_the_result_buffer() {
        let mut executor = Executor::new(StubDriver::new());
        let data = executor.fetch_post_vs(&toy_fetch());

        assert!(data.is_valid());
        assert_eq!(executor.state(), FetchState::Done);
        let result = data.vertex_buffer.unwrap();
        let driver = executor.driver();
        assert_eq!(driver.live.len(), 1);
        assert!(driver.live.contains(&result));
        // output + index + one attribute created; two destroyed.
        assert_eq!(driver.created, 3);
        assert_eq!(driver.destroyed, 2);
    }

    #[test]
    fn oversized_allocation_fails_with_status() {
        let mut driver = StubDriver::new();
        driver.limit = 16;
        let mut executor = Executor::new(driver);
        let data = executor.fetch_post_vs(&toy_fetch());

        assert!(!data.is_valid());
        assert!(data.status.contains("exceeds device limit"));
        assert_eq!(executor.state(), FetchState::Failed);
        assert!(executor.driver().live.is_empty());
    }

    #[test]
    fn compute_failure_tears_down_everything() {
        let mut driver = StubDriver::new();
        driver.fail_compute = Some(DriverError::OutOfMemory);
        let mut executor = Executor::new(driver);
        let data = executor.fetch_post_vs(&toy_fetch());

        assert!(!data.is_valid());
        assert_eq!(executor.state(), FetchState::Failed);
        assert!(executor.driver().live.is_empty());
    }

    #[test]
    fn device_lost_fires_session_hook() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let fired = Arc::new(AtomicBool::new(false));
        let seen = fired.clone();
        let mut driver = StubDriver::new();
        driver.fail_compute = Some(DriverError::DeviceLost);
        let mut executor = Executor::new(driver)
            .with_device_lost(Arc::new(move |_| seen.store(true, Ordering::SeqCst)));

        let data = executor.fetch_post_vs(&toy_fetch());
        assert!(!data.is_valid());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn transform_feedback_grows_until_it_fits() {
        // 30 vertices => 300 primitives at 16 bytes: 4800 bytes needed,
        // initial capacity forces at least one regrow.
        let mut executor = Executor::new(StubDriver::new());
        let data = executor.fetch_transform_feedback(&draw(), 30, 16, 64);

        assert!(data.is_valid());
        assert!(executor.driver().xfb_runs >= 2);
        assert_eq!(executor.driver().live.len(), 1);
        assert_eq!(executor.state(), FetchState::Done);
    }

    #[test]
    fn instance_sizing_differences_cumulative_counts() {
        let mut executor = Executor::new(StubDriver::new());
        let sizes = executor
            .fetch_instance_sizes(&draw(), 5, 16, 1 << 20)
            .expect("sizes");

        // Every instance contributes the same 10 prims * 16 bytes.
        assert_eq!(sizes, vec![160, 160, 160, 160, 160]);
        assert!(executor.driver().live.is_empty());
    }

    #[test]
    fn instance_sizes_derive_from_primitive_counts_not_capacity() {
        // The same draw measured against wildly different capture capacities
        // must report identical per-instance sizes: only primitive counts
        // come from the query, bytes come from the record stride.
        let mut executor = Executor::new(StubDriver::new());
        let small = executor
            .fetch_instance_sizes(&draw(), 4, 16, 1 << 12)
            .expect("sizes");
        let large = executor
            .fetch_instance_sizes(&draw(), 4, 16, 1 << 24)
            .expect("sizes");

        assert_eq!(small, large);
        assert_eq!(small, vec![160, 160, 160, 160]);
        // In particular the first instance is not credited with the whole
        // capture buffer.
        assert!(small[0] < 1 << 12);
    }

    #[test]
    fn instance_sizing_checkpoints_every_thousand() {
        let mut executor = Executor::new(StubDriver::new());
        let sizes = executor
            .fetch_instance_sizes(&draw(), 2500, 16, 1 << 24)
            .expect("sizes");
        assert_eq!(sizes.len(), 2500);
        assert_eq!(executor.driver().idles, 2);
    }

    #[test]
    fn empty_mesh_counts_yield_status_not_empty_success() {
        use prism_annotate::meshout::plan_meshlet_layout;

        let layout = plan_meshlet_layout(3, 1, 3, 16, 0, false);
        let shader = MeshCaptureShader {
            words: vec![0x0723_0203, 0x0001_0400, 0, 10, 0],
            layout: layout.clone(),
        };
        let mut driver = StubDriver::new();
        // Readback of all zeroes: every group reports 0 verts, 0 prims.
        driver.readback = vec![0u8; layout.total_size as usize * 4];
        let mut executor = Executor::new(driver);

        let data = executor.fetch_mesh_output(&MeshFetch {
            count_shader: shader.clone(),
            commit_shader: shader,
            entry: "main".to_string(),
            group_count: [4, 1, 1],
        });
        assert_eq!(data.status, "No mesh output data generated");
        assert!(executor.driver().live.is_empty());
    }

    #[test]
    fn corrupted_mesh_counts_skip_the_event() {
        use prism_annotate::meshout::plan_meshlet_layout;

        let layout = plan_meshlet_layout(3, 1, 3, 16, 0, false);
        let shader = MeshCaptureShader {
            words: vec![0x0723_0203, 0x0001_0400, 0, 10, 0],
            layout: layout.clone(),
        };
        let mut driver = StubDriver::new();
        let mut readback = vec![0u8; layout.total_size as usize];
        readback[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        driver.readback = readback;
        let mut executor = Executor::new(driver);

        let data = executor.fetch_mesh_output(&MeshFetch {
            count_shader: shader.clone(),
            commit_shader: shader,
            entry: "main".to_string(),
            group_count: [1, 1, 1],
        });
        assert!(data.status.contains("corrupted meshlet counts"));
        assert_eq!(executor.state(), FetchState::Failed);
        assert!(executor.driver().live.is_empty());
    }
}
