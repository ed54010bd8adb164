use ash::{
    extensions::{ext, khr},
    vk,
};
use std::{ffi, sync::Mutex};

mod init;
mod resource;
mod surface;

pub use resource::mip_level_count;
pub use surface::{Frame, FRAME_COUNT};

/// Timeout for fence waits and swapchain acquisition.
/// Running past it means the device is lost or the driver is wedged,
/// so expiry is fatal rather than retried.
pub const WAIT_TIMEOUT_NS: u64 = 10_000_000_000;

#[derive(Debug)]
pub struct ContextDesc {
    pub validation: bool,
    pub overlay: bool,
}

#[derive(Debug)]
pub struct NotSupportedError;

/// Ray tracing limits the shader binding table layout and the
/// acceleration structure builds depend on.
#[derive(Clone, Copy, Debug)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_base_alignment: u32,
    pub scratch_offset_alignment: u32,
}

pub(super) struct Instance {
    pub core: ash::Instance,
    pub debug_utils: ext::DebugUtils,
    pub get_physical_device_properties2: khr::GetPhysicalDeviceProperties2,
    pub surface: khr::Surface,
}

pub(super) struct Device {
    pub core: ash::Device,
    pub swapchain: khr::Swapchain,
    pub acceleration_structure: khr::AccelerationStructure,
    pub ray_tracing_pipeline: khr::RayTracingPipeline,
}

pub(super) struct MemoryManager {
    allocator: gpu_alloc::GpuAllocator<vk::DeviceMemory>,
    slab: slab::Slab<gpu_alloc::MemoryBlock<vk::DeviceMemory>>,
    valid_ash_memory_types: u32,
}

pub struct Context {
    pub(super) memory: Mutex<MemoryManager>,
    pub(super) device: Device,
    pub(super) queue_family_index: u32,
    pub(super) queue: Mutex<vk::Queue>,
    pub(super) surface: Mutex<surface::Surface>,
    pub(super) physical_device: vk::PhysicalDevice,
    pub(super) transfer_pool: vk::CommandPool,
    limits: vk::PhysicalDeviceLimits,
    ray_tracing_properties: RayTracingProperties,
    pub(super) instance: Instance,
    _entry: ash::Entry,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Memory {
    /// Device-local, not host reachable.
    Device,
    /// Host-visible and coherent, persistently mapped.
    Upload,
}

#[derive(Debug)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: Memory,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Buffer {
    pub raw: vk::Buffer,
    memory_handle: usize,
    mapped_data: *mut u8,
}

impl Buffer {
    /// Base of the persistent mapping. Null for `Memory::Device` buffers.
    pub fn data(&self) -> *mut u8 {
        self.mapped_data
    }
}

#[derive(Debug)]
pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub format: vk::Format,
    pub size: vk::Extent2D,
    pub mip_level_count: u32,
    pub usage: vk::ImageUsageFlags,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Texture {
    pub raw: vk::Image,
    memory_handle: usize,
}

impl Context {
    pub fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.ray_tracing_properties
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    pub(super) fn core(&self) -> &ash::Device {
        &self.device.core
    }

    pub fn buffer_device_address(&self, buffer: Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer.raw);
        unsafe { self.device.core.get_buffer_device_address(&info) }
    }

    pub fn wait_idle(&self) {
        let _ = unsafe { self.device.core.device_wait_idle() };
    }

    /// Records and submits a one-shot command buffer, then blocks on a fence.
    /// Used for uploads and acceleration structure builds, never per frame.
    pub(super) fn single_time_commands(&self, record: impl FnOnce(vk::CommandBuffer)) {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.transfer_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd_buf = unsafe {
            self.device
                .core
                .allocate_command_buffers(&alloc_info)
                .unwrap()[0]
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .core
                .begin_command_buffer(cmd_buf, &begin_info)
                .unwrap();
        }

        record(cmd_buf);

        let cmd_bufs = [cmd_buf];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&cmd_bufs).build();
        let fence_info = vk::FenceCreateInfo::builder();
        unsafe {
            self.device.core.end_command_buffer(cmd_buf).unwrap();
            let fence = self.device.core.create_fence(&fence_info, None).unwrap();
            {
                let queue = self.queue.lock().unwrap();
                self.device
                    .core
                    .queue_submit(*queue, &[submit_info], fence)
                    .unwrap();
            }
            self.device
                .core
                .wait_for_fences(&[fence], true, WAIT_TIMEOUT_NS)
                .unwrap();
            self.device.core.destroy_fence(fence, None);
            self.device
                .core
                .free_command_buffers(self.transfer_pool, &cmd_bufs);
        }
    }

    pub(super) fn set_object_name(
        &self,
        object_type: vk::ObjectType,
        object: impl vk::Handle,
        name: &str,
    ) {
        let name_cstr = ffi::CString::new(name).unwrap();
        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(object.as_raw())
            .object_name(&name_cstr);
        let _ = unsafe {
            self.instance
                .debug_utils
                .set_debug_utils_object_name(self.device.core.handle(), &name_info)
        };
    }

    pub fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, name: &str) {
        let name_cstr = ffi::CString::new(name).unwrap();
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name_cstr);
        unsafe {
            self.instance
                .debug_utils
                .cmd_begin_debug_utils_label(command_buffer, &label);
        }
    }

    pub fn cmd_end_label(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.instance
                .debug_utils
                .cmd_end_debug_utils_label(command_buffer);
        }
    }
}
