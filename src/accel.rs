use ash::vk;
use std::{mem, ptr};

use crate::{geometry, gpu};

pub struct AccelerationStructure {
    pub raw: vk::AccelerationStructureKHR,
    pub buffer: gpu::Buffer,
    pub device_address: u64,
}

impl AccelerationStructure {
    pub fn destroy(self, context: &gpu::Context) {
        unsafe {
            context
                .device
                .acceleration_structure
                .destroy_acceleration_structure(self.raw, None);
        }
        context.destroy_buffer(self.buffer);
    }
}

/// Row-major 3x4 matrix, the top of a column-major 4x4 transposed.
pub fn transform_rows(transform: glam::Mat4) -> vk::TransformMatrixKHR {
    let m = transform.transpose().to_cols_array();
    let mut matrix = [0.0; 12];
    matrix.copy_from_slice(&m[..12]);
    vk::TransformMatrixKHR { matrix }
}

/// The one instance the top level holds: hit group record zero, all ray
/// masks pass, and no face culling since the trace calls never ask for it.
pub fn instance_record(
    blas_address: u64,
    transform: glam::Mat4,
) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: transform_rows(transform),
        instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xff),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

/// Queries sizes, allocates storage and scratch, runs the build on the
/// transfer queue, and frees the scratch once the build fence signals.
fn build(
    context: &gpu::Context,
    ty: vk::AccelerationStructureTypeKHR,
    geometries: &[vk::AccelerationStructureGeometryKHR],
    ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    name: &str,
) -> AccelerationStructure {
    let rt = &context.device.acceleration_structure;
    let primitive_counts = ranges
        .iter()
        .map(|range| range.primitive_count)
        .collect::<Vec<_>>();

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(ty)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries)
        .build();

    let sizes = unsafe {
        rt.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &primitive_counts,
        )
    };
    log::debug!(
        "{} build sizes: storage {}, scratch {}",
        name,
        sizes.acceleration_structure_size,
        sizes.build_scratch_size,
    );

    let buffer = context.create_buffer(gpu::BufferDesc {
        name,
        size: sizes.acceleration_structure_size,
        usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        memory: gpu::Memory::Device,
    });
    let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
        .buffer(buffer.raw)
        .size(sizes.acceleration_structure_size)
        .ty(ty);
    let raw = unsafe { rt.create_acceleration_structure(&create_info, None).unwrap() };

    // Slack for rounding the device address up to the scratch alignment.
    let scratch_alignment = context.ray_tracing_properties().scratch_offset_alignment as u64;
    let scratch = context.create_buffer(gpu::BufferDesc {
        name: "build scratch",
        size: sizes.build_scratch_size + scratch_alignment,
        usage: vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        memory: gpu::Memory::Device,
    });

    build_info.dst_acceleration_structure = raw;
    build_info.scratch_data = vk::DeviceOrHostAddressKHR {
        device_address: crate::sbt::align_up(
            context.buffer_device_address(scratch),
            scratch_alignment,
        ),
    };

    context.single_time_commands(|cmd_buf| unsafe {
        rt.cmd_build_acceleration_structures(cmd_buf, &[build_info], &[ranges]);
    });
    // The fence wait above retired the build, the scratch is free to go.
    context.destroy_buffer(scratch);

    let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
        .acceleration_structure(raw);
    let device_address = unsafe { rt.get_acceleration_structure_device_address(&address_info) };

    AccelerationStructure {
        raw,
        buffer,
        device_address,
    }
}

/// One bottom level structure per scene, one triangles geometry per chunk.
/// Every geometry reads the shared buffer from its base, relying on the
/// globally rewritten indices.
#[profiling::function]
pub fn build_bottom_level(
    context: &gpu::Context,
    geometry: &geometry::SceneGeometry,
) -> AccelerationStructure {
    let base_address = context.buffer_device_address(geometry.buffer);
    let index_address = base_address + geometry.layout.index_region_offset;

    let mut geometries = Vec::with_capacity(geometry.layout.chunks.len());
    let mut ranges = Vec::with_capacity(geometry.layout.chunks.len());
    for chunk in geometry.layout.chunks.iter() {
        geometries.push(
            vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                        .vertex_format(vk::Format::R32G32B32_SFLOAT)
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: base_address,
                        })
                        .vertex_stride(mem::size_of::<crate::scene::Vertex>() as u64)
                        .max_vertex(chunk.max_vertex)
                        .index_type(vk::IndexType::UINT32)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: index_address,
                        })
                        .build(),
                })
                .build(),
        );
        ranges.push(vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: chunk.triangle_count,
            primitive_offset: chunk.index_byte_offset,
            first_vertex: 0,
            transform_offset: 0,
        });
    }

    build(
        context,
        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        &geometries,
        &ranges,
        "blas",
    )
}

#[profiling::function]
pub fn build_top_level(
    context: &gpu::Context,
    bottom_level: &AccelerationStructure,
    transform: glam::Mat4,
) -> AccelerationStructure {
    let instance = instance_record(bottom_level.device_address, transform);
    let instance_buffer = context.create_buffer(gpu::BufferDesc {
        name: "tlas instance",
        size: mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64,
        usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        memory: gpu::Memory::Upload,
    });
    unsafe {
        ptr::copy_nonoverlapping(
            &instance as *const vk::AccelerationStructureInstanceKHR as *const u8,
            instance_buffer.data(),
            mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
        );
    }

    let geometries = [vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: context.buffer_device_address(instance_buffer),
                })
                .build(),
        })
        .build()];
    let ranges = [vk::AccelerationStructureBuildRangeInfoKHR {
        primitive_count: 1,
        primitive_offset: 0,
        first_vertex: 0,
        transform_offset: 0,
    }];

    let tlas = build(
        context,
        vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        &geometries,
        &ranges,
        "tlas",
    );
    context.destroy_buffer(instance_buffer);
    tlas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_masks_everything_in() {
        let record = instance_record(0xdead_beef, glam::Mat4::IDENTITY);
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 0);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xff);
        assert_eq!(
            record
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            0
        );
        assert_eq!(
            u32::from(
                record
                    .instance_shader_binding_table_record_offset_and_flags
                    .high_8()
            ),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        let reference = unsafe { record.acceleration_structure_reference.device_handle };
        assert_eq!(reference, 0xdead_beef);
    }

    #[test]
    fn transform_is_row_major() {
        let rows = transform_rows(glam::Mat4::from_scale_rotation_translation(
            glam::Vec3::splat(0.01),
            glam::Quat::IDENTITY,
            glam::Vec3::new(1.0, 2.0, 3.0),
        ));
        assert_eq!(rows.matrix[0], 0.01);
        assert_eq!(rows.matrix[5], 0.01);
        assert_eq!(rows.matrix[10], 0.01);
        assert_eq!([rows.matrix[3], rows.matrix[7], rows.matrix[11]], [
            1.0, 2.0, 3.0
        ]);
    }
}
