use ash::vk;

use crate::{gpu, pipeline};

pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Every group gets one slot of `shader_group_base_alignment` bytes, so
/// slot addresses stay aligned no matter how small the handles are.
/// Sizing by handle size instead would under-allocate the table.
pub fn table_size(props: &gpu::RayTracingProperties) -> u64 {
    pipeline::group::COUNT as u64 * props.shader_group_base_alignment as u64
}

/// The buffer carries one extra slot of padding. The driver only aligns
/// allocations to the buffer's memory requirements, so the table base is
/// rounded up inside the buffer instead.
pub fn table_allocation_size(props: &gpu::RayTracingProperties) -> u64 {
    table_size(props) + props.shader_group_base_alignment as u64
}

#[derive(Clone, Copy, Debug)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Carves the table into the regions `vkCmdTraceRaysKHR` takes. The
/// miss region spans two slots, common miss first and the shadow miss
/// reached through the trace call's miss index.
pub fn regions(table_address: vk::DeviceAddress, props: &gpu::RayTracingProperties) -> SbtRegions {
    let slot = props.shader_group_base_alignment as u64;
    let slot_address = |group| table_address + group as u64 * slot;
    SbtRegions {
        hit: vk::StridedDeviceAddressRegionKHR {
            device_address: slot_address(pipeline::group::CLOSEST_HIT),
            stride: slot,
            size: slot,
        },
        // For the ray generation region the size must equal the stride.
        raygen: vk::StridedDeviceAddressRegionKHR {
            device_address: slot_address(pipeline::group::RAY_GEN),
            stride: slot,
            size: slot,
        },
        miss: vk::StridedDeviceAddressRegionKHR {
            device_address: slot_address(pipeline::group::MISS),
            stride: slot,
            size: 2 * slot,
        },
        callable: vk::StridedDeviceAddressRegionKHR::default(),
    }
}

pub struct ShaderBindingTable {
    pub buffer: gpu::Buffer,
    pub regions: SbtRegions,
}

impl ShaderBindingTable {
    /// Fetches the group handles and lays them out one per aligned slot.
    pub fn new(context: &gpu::Context, rt_pipeline: &pipeline::RayTracingPipeline) -> Self {
        let props = context.ray_tracing_properties();
        let handle_size = props.shader_group_handle_size as usize;
        let slot = props.shader_group_base_alignment as usize;

        let handles = unsafe {
            context
                .device
                .ray_tracing_pipeline
                .get_ray_tracing_shader_group_handles(
                    rt_pipeline.raw,
                    0,
                    pipeline::group::COUNT,
                    pipeline::group::COUNT as usize * handle_size,
                )
                .unwrap()
        };

        let buffer = context.create_buffer(gpu::BufferDesc {
            name: "shader binding table",
            size: table_allocation_size(&props),
            usage: vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            memory: gpu::Memory::Upload,
        });

        let base_address = context.buffer_device_address(buffer);
        let table_address = align_up(base_address, slot as u64);
        let lead = (table_address - base_address) as usize;
        for group in 0..pipeline::group::COUNT as usize {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    handles[group * handle_size..].as_ptr(),
                    buffer.data().add(lead + group * slot),
                    handle_size,
                );
            }
        }

        ShaderBindingTable {
            buffer,
            regions: regions(table_address, &props),
        }
    }

    pub fn destroy(self, context: &gpu::Context) {
        context.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROPS: gpu::RayTracingProperties = gpu::RayTracingProperties {
        shader_group_handle_size: 32,
        shader_group_base_alignment: 64,
        scratch_offset_alignment: 128,
    };

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn table_holds_one_slot_per_group() {
        // Handles are 32 bytes but each occupies a full 64 byte slot.
        assert_eq!(table_size(&PROPS), 4 * 64);
    }

    #[test]
    fn padded_allocation_fits_the_table_at_any_base() {
        // The buffer may land on any boundary the driver picks. The
        // worst case base wastes one byte short of a full slot.
        for base in [0x10000, 0x10001, 0x1003f, 0x10040] {
            let table_base = align_up(base, 64);
            assert!(table_base - base + table_size(&PROPS) <= table_allocation_size(&PROPS));
        }
    }

    #[test]
    fn regions_split_the_table() {
        let base = 0x10000;
        let regions = regions(base, &PROPS);

        assert_eq!(regions.hit.device_address, base);
        assert_eq!(regions.hit.stride, 64);
        assert_eq!(regions.hit.size, 64);

        assert_eq!(regions.raygen.device_address, base + 64);
        assert_eq!(regions.raygen.size, regions.raygen.stride);

        assert_eq!(regions.miss.device_address, base + 2 * 64);
        assert_eq!(regions.miss.stride, 64);
        assert_eq!(regions.miss.size, 2 * 64);

        assert_eq!(regions.callable.device_address, 0);
        assert_eq!(regions.callable.size, 0);
    }
}
