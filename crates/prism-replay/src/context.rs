//! Session-scoped device context.
//!
//! One `DeviceContext` is constructed when a capture session opens and torn
//! down when it closes. Nothing in this crate reaches for global state; every
//! component that needs the device receives the context (or a driver built
//! from it) explicitly.

use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;
use prism_annotate::strategy::AddressMode;

bitflags! {
    /// Probed device capabilities the fetch paths branch on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReplayCaps: u32 {
        /// `VK_KHR_buffer_device_address` (or core 1.2 equivalent).
        const BDA_KHR = 1 << 0;
        /// `VK_EXT_buffer_device_address` legacy path.
        const BDA_EXT = 1 << 1;
        const SHADER_INT64 = 1 << 2;
        const TRANSFORM_FEEDBACK = 1 << 3;
        const MESH_SHADER = 1 << 4;
        /// Storage writes usable from the vertex stage.
        const VERTEX_STORES = 1 << 5;
        /// Storage writes usable from the fragment stage.
        const FRAGMENT_STORES = 1 << 6;
        /// Occlusion queries with precise sample counts.
        const OCCLUSION_PRECISE = 1 << 7;
        const MULTIVIEW = 1 << 8;
    }
}

impl ReplayCaps {
    /// Addressing strategy the annotators should use on this device.
    pub fn address_mode(self) -> AddressMode {
        AddressMode::choose(
            self.contains(ReplayCaps::BDA_KHR),
            self.contains(ReplayCaps::BDA_EXT),
            self.contains(ReplayCaps::SHADER_INT64),
        )
    }
}

/// Invoked once when the device is lost; the session must stop issuing GPU
/// work after this fires.
pub type DeviceLostHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Owned Vulkan handles plus probe results for one replay session.
///
/// Handles are owned: `DeviceContext::destroy` tears them down in reverse
/// creation order. The context is deliberately not `Clone`.
pub struct DeviceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub caps: ReplayCaps,
    pub limits: vk::PhysicalDeviceLimits,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub device_lost: Option<DeviceLostHook>,
}

impl DeviceContext {
    /// Index of a memory type satisfying `required` among `type_bits`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        find_memory_type(&self.memory_properties, type_bits, required)
    }

    pub fn notify_device_lost(&self, what: &str) {
        tracing::error!(what, "device lost");
        if let Some(hook) = &self.device_lost {
            hook(what);
        }
    }

    /// Destroys the device and instance. Callers must have destroyed every
    /// child object first.
    pub fn destroy(self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

pub(crate) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_mode_prefers_khr() {
        let caps = ReplayCaps::BDA_KHR | ReplayCaps::BDA_EXT | ReplayCaps::SHADER_INT64;
        assert_eq!(caps.address_mode(), AddressMode::BufferAddressKhr);
    }

    #[test]
    fn address_mode_ext_requires_int64() {
        assert_eq!(
            ReplayCaps::BDA_EXT.address_mode(),
            AddressMode::DescriptorBinding
        );
        assert_eq!(
            (ReplayCaps::BDA_EXT | ReplayCaps::SHADER_INT64).address_mode(),
            AddressMode::BufferAddressExt
        );
    }

    #[test]
    fn memory_type_selection_respects_type_bits() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        // Type 1 excluded by the requirement bits.
        assert_eq!(
            find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }
}
