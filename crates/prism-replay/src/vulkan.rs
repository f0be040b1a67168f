//! The `ash`-backed production driver.
//!
//! One `VulkanDriver` per session, built over the session's
//! [`DeviceContext`]. Every submit is synchronous: record, submit, wait the
//! fence. Replay analysis has no use for overlap and the simple model makes
//! teardown ordering trivial.
//!
//! Pipelines, shader modules, and descriptor pools created for a pass are
//! destroyed before the pass returns; only buffers outlive a call, tracked
//! in the handle table until `destroy_buffer`.

use std::collections::HashMap;
use std::ffi::CString;

use ash::vk;
use ash::vk::Handle as _;
use tracing::{debug, warn};

use crate::context::{DeviceContext, DeviceLostHook, ReplayCaps};
use crate::driver::{
    BufferHandle, BufferUse, ComputePass, DrawReplay, DriverError, GpuDriver, XfbStats,
};
use prism_annotate::strategy::{AddressMode, RESERVED_BINDING, RESERVED_SET};

const APP_NAME: &std::ffi::CStr = c"prism-replay";

struct OwnedBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    host_visible: bool,
}

pub struct VulkanDriver {
    ctx: DeviceContext,
    xfb: Option<ash::ext::transform_feedback::Device>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    buffers: HashMap<u64, OwnedBuffer>,
    next_buffer_id: u64,
}

impl VulkanDriver {
    /// Creates the session's instance, device, and probe results, then the
    /// driver over them.
    pub fn create(device_lost: Option<DeviceLostHook>) -> Result<VulkanDriver, DriverError> {
        let ctx = create_context(device_lost)?;
        VulkanDriver::new(ctx)
    }

    pub fn new(ctx: DeviceContext) -> Result<VulkanDriver, DriverError> {
        let device = &ctx.device;
        let xfb = if ctx.caps.contains(ReplayCaps::TRANSFORM_FEEDBACK) {
            Some(ash::ext::transform_feedback::Device::new(
                &ctx.instance,
                device,
            ))
        } else {
            None
        };
        unsafe {
            let command_pool = device
                .create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .queue_family_index(ctx.queue_family_index)
                        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                    None,
                )
                .map_err(map_vk)?;
            let command_buffer = device
                .allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(command_pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                )
                .map_err(map_vk)?[0];
            let fence = device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(map_vk)?;
            Ok(VulkanDriver {
                ctx,
                xfb,
                command_pool,
                command_buffer,
                fence,
                buffers: HashMap::new(),
                next_buffer_id: 1,
            })
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Tears down every owned object and the device context.
    pub fn destroy(mut self) {
        unsafe {
            for (_, owned) in self.buffers.drain() {
                self.ctx.device.destroy_buffer(owned.buffer, None);
                self.ctx.device.free_memory(owned.memory, None);
            }
            self.ctx.device.destroy_fence(self.fence, None);
            self.ctx.device.destroy_command_pool(self.command_pool, None);
        }
        self.ctx.destroy();
    }

    fn owned(&self, handle: BufferHandle) -> Result<&OwnedBuffer, DriverError> {
        self.buffers
            .get(&handle.0)
            .ok_or(DriverError::Recording("unknown buffer handle".to_string()))
    }

    fn check(&self, result: vk::Result) -> Result<(), DriverError> {
        if result == vk::Result::SUCCESS {
            return Ok(());
        }
        let err = map_vk(result);
        if err.is_fatal() {
            self.ctx.notify_device_lost("vulkan submit");
        }
        Err(err)
    }

    /// Records `record` into the shared command buffer, submits, and waits.
    fn submit_sync<F>(&mut self, record: F) -> Result<(), DriverError>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<(), DriverError>,
    {
        let device = &self.ctx.device;
        let cb = self.command_buffer;
        unsafe {
            device
                .begin_command_buffer(
                    cb,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(map_vk)?;
            record(device, cb)?;
            device.end_command_buffer(cb).map_err(map_vk)?;

            let submit = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cb));
            let result = device.queue_submit(self.ctx.queue, &[submit], self.fence);
            if let Err(e) = result {
                self.check(e)?;
            }
            let waited = device.wait_for_fences(&[self.fence], true, u64::MAX);
            if let Err(e) = waited {
                self.check(e)?;
            }
            device.reset_fences(&[self.fence]).map_err(map_vk)?;
        }
        Ok(())
    }

    fn allocate(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        addressed: bool,
    ) -> Result<OwnedBuffer, DriverError> {
        let device = &self.ctx.device;
        unsafe {
            let buffer = device
                .create_buffer(
                    &vk::BufferCreateInfo::default()
                        .size(size)
                        .usage(usage)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE),
                    None,
                )
                .map_err(map_vk)?;
            let requirements = device.get_buffer_memory_requirements(buffer);
            let Some(type_index) = self
                .ctx
                .find_memory_type(requirements.memory_type_bits, properties)
            else {
                device.destroy_buffer(buffer, None);
                return Err(DriverError::OutOfMemory);
            };

            let mut flags_info = vk::MemoryAllocateFlagsInfo::default()
                .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
            let mut alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(type_index);
            if addressed {
                alloc_info = alloc_info.push_next(&mut flags_info);
            }
            let memory = match device.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    return Err(map_vk(e));
                }
            };
            if let Err(e) = device.bind_buffer_memory(buffer, memory, 0) {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
                return Err(map_vk(e));
            }
            Ok(OwnedBuffer {
                buffer,
                memory,
                size,
                host_visible: properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            })
        }
    }

    /// Maps `memory` and runs `access` over the mapped bytes. A null mapped
    /// pointer after a successful map is a driver fault; it is logged and
    /// surfaced as a status-string failure, never dereferenced.
    fn with_mapped<T>(
        &self,
        owned: &OwnedBuffer,
        access: impl FnOnce(*mut u8) -> T,
    ) -> Result<T, DriverError> {
        let device = &self.ctx.device;
        unsafe {
            let ptr = device
                .map_memory(owned.memory, 0, owned.size, vk::MemoryMapFlags::empty())
                .map_err(map_vk)?;
            if ptr.is_null() {
                warn!("mapMemory succeeded but returned a null pointer");
                device.unmap_memory(owned.memory);
                return Err(DriverError::MappedPointerNull);
            }
            let out = access(ptr.cast::<u8>());
            device.unmap_memory(owned.memory);
            Ok(out)
        }
    }

    /// Builds the one-pass descriptor set for descriptor-binding mode.
    /// Returns the pool (destroyed by the caller), layout, and set.
    fn build_descriptors(
        &self,
        buffers: &[BufferHandle],
    ) -> Result<(vk::DescriptorPool, vk::DescriptorSetLayout, vk::DescriptorSet), DriverError>
    {
        let device = &self.ctx.device;
        let count = buffers.len() as u32;
        let infos: Vec<vk::DescriptorBufferInfo> = buffers
            .iter()
            .map(|&h| {
                let owned = self.owned(h)?;
                Ok(vk::DescriptorBufferInfo::default()
                    .buffer(owned.buffer)
                    .offset(0)
                    .range(vk::WHOLE_SIZE))
            })
            .collect::<Result<_, DriverError>>()?;
        unsafe {
            let binding = vk::DescriptorSetLayoutBinding::default()
                .binding(RESERVED_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(count)
                .stage_flags(vk::ShaderStageFlags::COMPUTE);
            let layout = device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::default()
                        .bindings(std::slice::from_ref(&binding)),
                    None,
                )
                .map_err(map_vk)?;

            let pool_size = vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(count);
            let pool = match device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(1)
                    .pool_sizes(std::slice::from_ref(&pool_size)),
                None,
            ) {
                Ok(pool) => pool,
                Err(e) => {
                    device.destroy_descriptor_set_layout(layout, None);
                    return Err(map_vk(e));
                }
            };
            let set = match device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(std::slice::from_ref(&layout)),
            ) {
                Ok(sets) => sets[0],
                Err(e) => {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(layout, None);
                    return Err(map_vk(e));
                }
            };

            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(RESERVED_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&infos);
            device.update_descriptor_sets(&[write], &[]);
            Ok((pool, layout, set))
        }
    }
}

impl GpuDriver for VulkanDriver {
    fn caps(&self) -> ReplayCaps {
        self.ctx.caps
    }

    fn max_buffer_bytes(&self) -> u64 {
        self.ctx.limits.max_storage_buffer_range as u64
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUse,
    ) -> Result<BufferHandle, DriverError> {
        if size > self.max_buffer_bytes() {
            return Err(DriverError::AllocationTooLarge {
                requested: size,
                limit: self.max_buffer_bytes(),
            });
        }
        let addressed = usage == BufferUse::StorageAddressed
            && self.ctx.caps.address_mode().uses_device_address();
        let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let mut properties = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        match usage {
            BufferUse::Storage | BufferUse::StorageAddressed => {
                flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
            }
            BufferUse::Upload | BufferUse::Readback => {
                flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
                properties =
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
            }
            BufferUse::TransformFeedback => {
                flags |= vk::BufferUsageFlags::TRANSFORM_FEEDBACK_BUFFER_EXT;
            }
        }
        if addressed {
            flags |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }

        let owned = self.allocate(size, flags, properties, addressed)?;
        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(id, owned);
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, handle: BufferHandle) {
        if let Some(owned) = self.buffers.remove(&handle.0) {
            unsafe {
                self.ctx.device.destroy_buffer(owned.buffer, None);
                self.ctx.device.free_memory(owned.memory, None);
            }
        } else {
            warn!(handle = handle.0, "destroy of unknown buffer handle");
        }
    }

    fn buffer_address(&self, handle: BufferHandle) -> Result<(u32, u32), DriverError> {
        if !self.ctx.caps.address_mode().uses_device_address() {
            return Err(DriverError::CapabilityMissing("buffer device address"));
        }
        let owned = self.owned(handle)?;
        let address = unsafe {
            self.ctx.device.get_buffer_device_address(
                &vk::BufferDeviceAddressInfo::default().buffer(owned.buffer),
            )
        };
        Ok((address as u32, (address >> 32) as u32))
    }

    fn write_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let owned = self.owned(handle)?;
        if offset + data.len() as u64 > owned.size {
            return Err(DriverError::Recording("write out of bounds".to_string()));
        }
        if owned.host_visible {
            return self.with_mapped(owned, |ptr| unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
            });
        }

        // Device-local target: stage and copy.
        let staging = self.allocate(
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            false,
        )?;
        let copy_result = (|| {
            self.with_mapped(&staging, |ptr| unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
            })?;
            let dst = self.owned(handle)?.buffer;
            let src = staging.buffer;
            let region = vk::BufferCopy::default()
                .src_offset(0)
                .dst_offset(offset)
                .size(data.len() as u64);
            self.submit_sync(|device, cb| unsafe {
                device.cmd_copy_buffer(cb, src, dst, &[region]);
                Ok(())
            })
        })();
        unsafe {
            self.ctx.device.destroy_buffer(staging.buffer, None);
            self.ctx.device.free_memory(staging.memory, None);
        }
        copy_result
    }

    fn run_compute(&mut self, pass: &ComputePass<'_>) -> Result<(), DriverError> {
        let device = self.ctx.device.clone();
        let mode = self.ctx.caps.address_mode();

        let mut bound: Vec<vk::Buffer> = Vec::with_capacity(pass.buffers.len());
        for &h in pass.buffers {
            bound.push(self.owned(h)?.buffer);
        }

        let descriptors = if mode == AddressMode::DescriptorBinding {
            Some(self.build_descriptors(pass.buffers)?)
        } else {
            None
        };

        let entry_name = CString::new(pass.entry)
            .map_err(|_| DriverError::Recording("entry name contains NUL".to_string()))?;

        // Specialization data: every constant the annotators declare is one
        // 32-bit word.
        let mut spec_entries: Vec<vk::SpecializationMapEntry> = Vec::new();
        let mut spec_data: Vec<u8> = Vec::new();
        let mut pairs: Vec<(u32, u64)> = pass.spec_values.iter().collect();
        pairs.sort_by_key(|&(id, _)| id);
        for (id, value) in pairs {
            spec_entries.push(
                vk::SpecializationMapEntry::default()
                    .constant_id(id)
                    .offset(spec_data.len() as u32)
                    .size(4),
            );
            spec_data.extend((value as u32).to_le_bytes());
        }
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&spec_entries)
            .data(&spec_data);

        let built = unsafe {
            build_compute_pipeline(
                &device,
                pass.spirv,
                &entry_name,
                &spec_info,
                descriptors.map(|(_, layout, _)| layout),
            )
        };
        let (module, layout, pipeline) = match built {
            Ok(objects) => objects,
            Err(e) => {
                unsafe { destroy_descriptors(&device, descriptors) };
                return Err(e);
            }
        };

        let group_count = pass.group_count;
        let descriptor_set = descriptors.map(|(_, _, set)| set);
        let submit = self.submit_sync(|device, cb| unsafe {
            // Zero-fill every bound buffer before the dispatch touches it.
            for &buffer in &bound {
                device.cmd_fill_buffer(cb, buffer, 0, vk::WHOLE_SIZE, 0);
            }
            let fill_barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[fill_barrier],
                &[],
                &[],
            );
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipeline);
            if let Some(set) = descriptor_set {
                device.cmd_bind_descriptor_sets(
                    cb,
                    vk::PipelineBindPoint::COMPUTE,
                    layout,
                    RESERVED_SET,
                    &[set],
                    &[],
                );
            }
            device.cmd_dispatch(cb, group_count[0], group_count[1], group_count[2]);
            let write_barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::HOST_READ);
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[write_barrier],
                &[],
                &[],
            );
            Ok(())
        });

        unsafe {
            device.destroy_pipeline(pipeline, None);
            device.destroy_pipeline_layout(layout, None);
            device.destroy_shader_module(module, None);
            destroy_descriptors(&device, descriptors);
        }
        submit
    }

    fn run_xfb_draw(
        &mut self,
        draw: &DrawReplay,
        instance_count: u32,
        capture: BufferHandle,
        capacity_bytes: u64,
    ) -> Result<XfbStats, DriverError> {
        let Some(xfb) = self.xfb.clone() else {
            return Err(DriverError::CapabilityMissing("transform feedback"));
        };
        let device = self.ctx.device.clone();
        let capture_buffer = self.owned(capture)?.buffer;
        let pipeline = vk::Pipeline::from_raw(draw.pipeline);
        let vertex_buffers: Vec<vk::Buffer> = draw
            .vertex_buffers
            .iter()
            .map(|&(raw, _)| vk::Buffer::from_raw(raw))
            .collect();
        let offsets: Vec<u64> = draw.vertex_buffers.iter().map(|_| 0).collect();
        let index = draw
            .index_buffer
            .map(|(raw, _)| vk::Buffer::from_raw(raw));

        let pool = unsafe {
            device
                .create_query_pool(
                    &vk::QueryPoolCreateInfo::default()
                        .query_type(vk::QueryType::TRANSFORM_FEEDBACK_STREAM_EXT)
                        .query_count(1),
                    None,
                )
                .map_err(map_vk)?
        };

        let vertex_count = draw.vertex_count;
        let first_vertex = draw.first_vertex;
        let submit = self.submit_sync(|device, cb| unsafe {
            device.cmd_reset_query_pool(cb, pool, 0, 1);
            let rendering = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: 1,
                        height: 1,
                    },
                })
                .layer_count(1);
            device.cmd_begin_rendering(cb, &rendering);
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline);
            if !vertex_buffers.is_empty() {
                device.cmd_bind_vertex_buffers(cb, 0, &vertex_buffers, &offsets);
            }
            (xfb.fp().cmd_bind_transform_feedback_buffers_ext)(
                cb,
                0,
                1,
                [capture_buffer].as_ptr(),
                [0].as_ptr(),
                [capacity_bytes].as_ptr(),
            );
            (xfb.fp().cmd_begin_query_indexed_ext)(cb, pool, 0, vk::QueryControlFlags::empty(), 0);
            (xfb.fp().cmd_begin_transform_feedback_ext)(
                cb,
                0,
                0,
                std::ptr::null(),
                std::ptr::null(),
            );
            if let Some(index_buffer) = index {
                device.cmd_bind_index_buffer(cb, index_buffer, 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(cb, vertex_count, instance_count, 0, first_vertex as i32, 0);
            } else {
                device.cmd_draw(cb, vertex_count, instance_count, first_vertex, 0);
            }
            (xfb.fp().cmd_end_transform_feedback_ext)(cb, 0, 0, std::ptr::null(), std::ptr::null());
            (xfb.fp().cmd_end_query_indexed_ext)(cb, pool, 0, 0);
            device.cmd_end_rendering(cb);
            Ok(())
        });

        let stats = submit.and_then(|()| unsafe {
            // (primitivesWritten, primitivesNeeded) per the stream query.
            let mut results = [0u64; 2];
            device
                .get_query_pool_results(
                    pool,
                    0,
                    &mut results,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .map_err(map_vk)?;
            Ok(XfbStats {
                primitives_written: results[0],
                primitives_needed: results[1],
            })
        });
        unsafe {
            device.destroy_query_pool(pool, None);
        }
        debug!(?stats, "transform feedback pass");
        stats
    }

    fn run_occlusion_draw(
        &mut self,
        draw: &DrawReplay,
        pixel: (u32, u32),
    ) -> Result<u64, DriverError> {
        let device = self.ctx.device.clone();
        let pipeline = vk::Pipeline::from_raw(draw.pipeline);
        let vertex_buffers: Vec<vk::Buffer> = draw
            .vertex_buffers
            .iter()
            .map(|&(raw, _)| vk::Buffer::from_raw(raw))
            .collect();
        let offsets: Vec<u64> = draw.vertex_buffers.iter().map(|_| 0).collect();
        let index = draw
            .index_buffer
            .map(|(raw, _)| vk::Buffer::from_raw(raw));
        let precise = self.ctx.caps.contains(ReplayCaps::OCCLUSION_PRECISE);

        let pool = unsafe {
            device
                .create_query_pool(
                    &vk::QueryPoolCreateInfo::default()
                        .query_type(vk::QueryType::OCCLUSION)
                        .query_count(1),
                    None,
                )
                .map_err(map_vk)?
        };

        let vertex_count = draw.vertex_count;
        let first_vertex = draw.first_vertex;
        let instance_count = 1;
        let submit = self.submit_sync(|device, cb| unsafe {
            device.cmd_reset_query_pool(cb, pool, 0, 1);
            let rendering = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D {
                        x: pixel.0 as i32,
                        y: pixel.1 as i32,
                    },
                    extent: vk::Extent2D {
                        width: 1,
                        height: 1,
                    },
                })
                .layer_count(1);
            device.cmd_begin_rendering(cb, &rendering);
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline);
            // Replayed pipelines are rebuilt with dynamic scissor so the
            // query can be scoped to the one pixel.
            device.cmd_set_scissor(
                cb,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D {
                        x: pixel.0 as i32,
                        y: pixel.1 as i32,
                    },
                    extent: vk::Extent2D {
                        width: 1,
                        height: 1,
                    },
                }],
            );
            if !vertex_buffers.is_empty() {
                device.cmd_bind_vertex_buffers(cb, 0, &vertex_buffers, &offsets);
            }
            let flags = if precise {
                vk::QueryControlFlags::PRECISE
            } else {
                vk::QueryControlFlags::empty()
            };
            device.cmd_begin_query(cb, pool, 0, flags);
            if let Some(index_buffer) = index {
                device.cmd_bind_index_buffer(cb, index_buffer, 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(cb, vertex_count, instance_count, 0, first_vertex as i32, 0);
            } else {
                device.cmd_draw(cb, vertex_count, instance_count, first_vertex, 0);
            }
            device.cmd_end_query(cb, pool, 0);
            device.cmd_end_rendering(cb);
            Ok(())
        });

        let samples = submit.and_then(|()| unsafe {
            let mut results = [0u64; 1];
            device
                .get_query_pool_results(
                    pool,
                    0,
                    &mut results,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .map_err(map_vk)?;
            Ok(results[0])
        });
        unsafe {
            device.destroy_query_pool(pool, None);
        }
        samples
    }

    fn read_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, DriverError> {
        let owned = self.owned(handle)?;
        let len = len.min(owned.size.saturating_sub(offset));
        if len == 0 {
            return Ok(Vec::new());
        }
        if owned.host_visible {
            return self.with_mapped(owned, |ptr| unsafe {
                let mut out = vec![0u8; len as usize];
                std::ptr::copy_nonoverlapping(
                    ptr.add(offset as usize).cast_const(),
                    out.as_mut_ptr(),
                    len as usize,
                );
                out
            });
        }

        let source = owned.buffer;
        let staging = self.allocate(
            len,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            false,
        )?;
        let region = vk::BufferCopy::default()
            .src_offset(offset)
            .dst_offset(0)
            .size(len);
        let copied = self
            .submit_sync(|device, cb| unsafe {
                device.cmd_copy_buffer(cb, source, staging.buffer, &[region]);
                let barrier = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::HOST_READ);
                device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
                Ok(())
            })
            .and_then(|()| {
                self.with_mapped(&staging, |ptr| unsafe {
                    let mut out = vec![0u8; len as usize];
                    std::ptr::copy_nonoverlapping(ptr.cast_const(), out.as_mut_ptr(), len as usize);
                    out
                })
            });
        unsafe {
            self.ctx.device.destroy_buffer(staging.buffer, None);
            self.ctx.device.free_memory(staging.memory, None);
        }
        copied
    }

    fn wait_idle(&mut self) -> Result<(), DriverError> {
        unsafe {
            self.ctx.device.queue_wait_idle(self.ctx.queue).map_err(map_vk)
        }
    }
}

unsafe fn build_compute_pipeline(
    device: &ash::Device,
    spirv: &[u32],
    entry_name: &std::ffi::CStr,
    spec_info: &vk::SpecializationInfo<'_>,
    set_layout: Option<vk::DescriptorSetLayout>,
) -> Result<(vk::ShaderModule, vk::PipelineLayout, vk::Pipeline), DriverError> {
    let module = device
        .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(spirv), None)
        .map_err(|e| DriverError::PipelineCreation(format!("shader module: {e}")))?;

    let set_layouts: Vec<vk::DescriptorSetLayout> = set_layout.into_iter().collect();
    let layout = match device.create_pipeline_layout(
        &vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts),
        None,
    ) {
        Ok(layout) => layout,
        Err(e) => {
            device.destroy_shader_module(module, None);
            return Err(DriverError::PipelineCreation(format!("layout: {e}")));
        }
    };

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(entry_name)
        .specialization_info(spec_info);
    let info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);
    match device.create_compute_pipelines(
        vk::PipelineCache::null(),
        std::slice::from_ref(&info),
        None,
    ) {
        Ok(pipelines) => Ok((module, layout, pipelines[0])),
        Err((_, e)) => {
            device.destroy_pipeline_layout(layout, None);
            device.destroy_shader_module(module, None);
            Err(DriverError::PipelineCreation(format!("pipeline: {e}")))
        }
    }
}

unsafe fn destroy_descriptors(
    device: &ash::Device,
    descriptors: Option<(vk::DescriptorPool, vk::DescriptorSetLayout, vk::DescriptorSet)>,
) {
    if let Some((pool, layout, _)) = descriptors {
        device.destroy_descriptor_pool(pool, None);
        device.destroy_descriptor_set_layout(layout, None);
    }
}

fn map_vk(result: vk::Result) -> DriverError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            DriverError::OutOfMemory
        }
        vk::Result::ERROR_DEVICE_LOST => DriverError::DeviceLost,
        other => DriverError::Recording(format!("{other:?}")),
    }
}

/// Builds the session's instance and device and probes capabilities.
pub fn create_context(device_lost: Option<DeviceLostHook>) -> Result<DeviceContext, DriverError> {
    unsafe {
        let entry = ash::Entry::load()
            .map_err(|e| DriverError::Recording(format!("loading vulkan: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .api_version(vk::API_VERSION_1_3);
        let instance = entry
            .create_instance(
                &vk::InstanceCreateInfo::default().application_info(&app_info),
                None,
            )
            .map_err(|e| DriverError::Recording(format!("creating instance: {e}")))?;

        let physical_devices = instance.enumerate_physical_devices().map_err(map_vk)?;
        let Some(&physical_device) = physical_devices.first() else {
            instance.destroy_instance(None);
            return Err(DriverError::CapabilityMissing("no vulkan device"));
        };

        let queue_families =
            instance.get_physical_device_queue_family_properties(physical_device);
        let Some(queue_family_index) = queue_families.iter().position(|f| {
            f.queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        }) else {
            instance.destroy_instance(None);
            return Err(DriverError::CapabilityMissing("no graphics+compute queue"));
        };
        let queue_family_index = queue_family_index as u32;

        let available: Vec<vk::ExtensionProperties> = instance
            .enumerate_device_extension_properties(physical_device)
            .map_err(map_vk)?;
        let has_ext = |name: &std::ffi::CStr| {
            available
                .iter()
                .any(|p| p.extension_name_as_c_str().map_or(false, |n| n == name))
        };

        let mut bda = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
        let mut xfb = vk::PhysicalDeviceTransformFeedbackFeaturesEXT::default();
        let mut mesh = vk::PhysicalDeviceMeshShaderFeaturesEXT::default();
        let mut multiview = vk::PhysicalDeviceMultiviewFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut bda)
            .push_next(&mut xfb)
            .push_next(&mut mesh)
            .push_next(&mut multiview);
        instance.get_physical_device_features2(physical_device, &mut features2);
        let base = features2.features;

        let mut caps = ReplayCaps::empty();
        if bda.buffer_device_address != 0 && has_ext(ash::khr::buffer_device_address::NAME) {
            caps |= ReplayCaps::BDA_KHR;
        }
        if has_ext(ash::ext::buffer_device_address::NAME) {
            caps |= ReplayCaps::BDA_EXT;
        }
        if base.shader_int64 != 0 {
            caps |= ReplayCaps::SHADER_INT64;
        }
        if xfb.transform_feedback != 0 && has_ext(ash::ext::transform_feedback::NAME) {
            caps |= ReplayCaps::TRANSFORM_FEEDBACK;
        }
        if mesh.mesh_shader != 0 && has_ext(ash::ext::mesh_shader::NAME) {
            caps |= ReplayCaps::MESH_SHADER;
        }
        if base.vertex_pipeline_stores_and_atomics != 0 {
            caps |= ReplayCaps::VERTEX_STORES;
        }
        if base.fragment_stores_and_atomics != 0 {
            caps |= ReplayCaps::FRAGMENT_STORES;
        }
        if base.occlusion_query_precise != 0 {
            caps |= ReplayCaps::OCCLUSION_PRECISE;
        }
        if multiview.multiview != 0 {
            caps |= ReplayCaps::MULTIVIEW;
        }

        let mut extensions: Vec<*const std::ffi::c_char> = Vec::new();
        if caps.contains(ReplayCaps::BDA_KHR) {
            extensions.push(ash::khr::buffer_device_address::NAME.as_ptr());
        }
        if caps.contains(ReplayCaps::TRANSFORM_FEEDBACK) {
            extensions.push(ash::ext::transform_feedback::NAME.as_ptr());
        }
        if caps.contains(ReplayCaps::MESH_SHADER) {
            extensions.push(ash::ext::mesh_shader::NAME.as_ptr());
        }

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);

        let mut enable_bda = vk::PhysicalDeviceBufferDeviceAddressFeatures::default()
            .buffer_device_address(caps.contains(ReplayCaps::BDA_KHR));
        let mut enable_xfb = vk::PhysicalDeviceTransformFeedbackFeaturesEXT::default()
            .transform_feedback(caps.contains(ReplayCaps::TRANSFORM_FEEDBACK));
        let mut enable_mesh = vk::PhysicalDeviceMeshShaderFeaturesEXT::default()
            .mesh_shader(caps.contains(ReplayCaps::MESH_SHADER))
            .task_shader(caps.contains(ReplayCaps::MESH_SHADER));
        let mut enable_multiview = vk::PhysicalDeviceMultiviewFeatures::default()
            .multiview(caps.contains(ReplayCaps::MULTIVIEW));
        let enabled_features = vk::PhysicalDeviceFeatures::default()
            .shader_int64(caps.contains(ReplayCaps::SHADER_INT64))
            .vertex_pipeline_stores_and_atomics(caps.contains(ReplayCaps::VERTEX_STORES))
            .fragment_stores_and_atomics(caps.contains(ReplayCaps::FRAGMENT_STORES))
            .occlusion_query_precise(caps.contains(ReplayCaps::OCCLUSION_PRECISE));
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&enabled_features)
            .push_next(&mut enable_bda)
            .push_next(&mut enable_xfb)
            .push_next(&mut enable_mesh)
            .push_next(&mut enable_multiview);
        let device = instance
            .create_device(physical_device, &device_info, None)
            .map_err(|e| {
                instance.destroy_instance(None);
                DriverError::Recording(format!("creating device: {e}"))
            })?;
        let queue = device.get_device_queue(queue_family_index, 0);

        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        debug!(
            device = properties.device_id,
            caps = ?caps,
            "replay device context created"
        );
        Ok(DeviceContext {
            entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            caps,
            limits: properties.limits,
            memory_properties,
            device_lost,
        })
    }
}
