use ash::vk;

use crate::{accel, geometry, gpu};

/// Binding slots of the common set, shared by the ray generation and the
/// closest hit stages.
pub mod common {
    pub const ACCELERATION_STRUCTURE: u32 = 0;
    pub const UNIFORMS: u32 = 1;
    pub const TRIANGLES: u32 = 2;
    pub const VERTICES: u32 = 3;
    pub const OUTPUT_IMAGE: u32 = 4;
}

/// Descriptor demand of one scene. Derived up front so the pool can be
/// created before any set is allocated.
pub fn pool_sizes(texture_capacity: u32) -> Vec<vk::DescriptorPoolSize> {
    vec![
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 3,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: texture_capacity.max(1),
        },
    ]
}

/// The three descriptor sets of the ray tracing pipeline: scene-wide
/// resources, per-chunk material records, and the bindless texture array.
pub struct BindingTables {
    pub pool: vk::DescriptorPool,
    pub layouts: [vk::DescriptorSetLayout; 3],
    pub common_set: vk::DescriptorSet,
    pub material_set: vk::DescriptorSet,
    pub texture_set: vk::DescriptorSet,
    texture_capacity: u32,
}

impl BindingTables {
    pub fn new(context: &gpu::Context, texture_count: u32) -> Self {
        let device = context.core();
        let texture_capacity = texture_count.max(1);

        let common_bindings = [
            vk::DescriptorSetLayoutBinding {
                binding: common::ACCELERATION_STRUCTURE,
                descriptor_type: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::RAYGEN_KHR
                    | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ..Default::default()
            },
            vk::DescriptorSetLayoutBinding {
                binding: common::UNIFORMS,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::RAYGEN_KHR
                    | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ..Default::default()
            },
            vk::DescriptorSetLayoutBinding {
                binding: common::TRIANGLES,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ..Default::default()
            },
            vk::DescriptorSetLayoutBinding {
                binding: common::VERTICES,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ..Default::default()
            },
            vk::DescriptorSetLayoutBinding {
                binding: common::OUTPUT_IMAGE,
                descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::RAYGEN_KHR,
                ..Default::default()
            },
        ];
        let common_info =
            vk::DescriptorSetLayoutCreateInfo::builder().bindings(&common_bindings);
        let common_layout =
            unsafe { device.create_descriptor_set_layout(&common_info, None).unwrap() };

        let material_bindings = [vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ..Default::default()
        }];
        let material_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND];
        let mut material_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&material_flags);
        let material_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&material_bindings)
            .push_next(&mut material_flags_info);
        let material_layout = unsafe {
            device
                .create_descriptor_set_layout(&material_info, None)
                .unwrap()
        };

        let texture_bindings = [vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: texture_capacity,
            stage_flags: vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ..Default::default()
        }];
        let texture_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT];
        let mut texture_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&texture_flags);
        let texture_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&texture_bindings)
            .push_next(&mut texture_flags_info);
        let texture_layout = unsafe {
            device
                .create_descriptor_set_layout(&texture_info, None)
                .unwrap()
        };

        let sizes = pool_sizes(texture_capacity);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(3)
            .pool_sizes(&sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None).unwrap() };

        let fixed_layouts = [common_layout, material_layout];
        let fixed_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&fixed_layouts);
        let fixed_sets = unsafe { device.allocate_descriptor_sets(&fixed_info).unwrap() };

        let texture_counts = [texture_capacity];
        let mut variable_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder()
            .descriptor_counts(&texture_counts);
        let texture_layouts = [texture_layout];
        let texture_alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&texture_layouts)
            .push_next(&mut variable_info);
        let texture_sets =
            unsafe { device.allocate_descriptor_sets(&texture_alloc_info).unwrap() };

        log::debug!(
            "Created binding tables with {} texture slots",
            texture_capacity
        );

        BindingTables {
            pool,
            layouts: [common_layout, material_layout, texture_layout],
            common_set: fixed_sets[0],
            material_set: fixed_sets[1],
            texture_set: texture_sets[0],
            texture_capacity,
        }
    }

    /// Points the common set at the built scene. Called once, after the
    /// acceleration structures exist.
    pub fn write_common(
        &self,
        context: &gpu::Context,
        top_level: &accel::AccelerationStructure,
        scene_geometry: &geometry::SceneGeometry,
        uniform_buffer: gpu::Buffer,
        uniform_range: u64,
        output_view: vk::ImageView,
    ) {
        let tlas_handles = [top_level.raw];
        let mut tlas_info = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
            .acceleration_structures(&tlas_handles);
        let mut tlas_write = vk::WriteDescriptorSet::builder()
            .dst_set(self.common_set)
            .dst_binding(common::ACCELERATION_STRUCTURE)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut tlas_info)
            .build();
        // The extension struct carries the payload, so the count is not
        // inferred from an info array here.
        tlas_write.descriptor_count = 1;

        let uniform_info = [vk::DescriptorBufferInfo {
            buffer: uniform_buffer.raw,
            offset: 0,
            range: uniform_range,
        }];
        let triangle_info = [vk::DescriptorBufferInfo {
            buffer: scene_geometry.triangle_buffer.raw,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let vertex_info = [vk::DescriptorBufferInfo {
            buffer: scene_geometry.buffer.raw,
            offset: 0,
            range: scene_geometry.layout.index_region_offset,
        }];
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: output_view,
            image_layout: vk::ImageLayout::GENERAL,
        }];

        let writes = [
            tlas_write,
            vk::WriteDescriptorSet::builder()
                .dst_set(self.common_set)
                .dst_binding(common::UNIFORMS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&uniform_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(self.common_set)
                .dst_binding(common::TRIANGLES)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&triangle_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(self.common_set)
                .dst_binding(common::VERTICES)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&vertex_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(self.common_set)
                .dst_binding(common::OUTPUT_IMAGE)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&image_info)
                .build(),
        ];
        unsafe { context.core().update_descriptor_sets(&writes, &[]) };
    }

    pub fn write_materials(&self, context: &gpu::Context, material_buffer: gpu::Buffer) {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: material_buffer.raw,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.material_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info)
            .build();
        unsafe { context.core().update_descriptor_sets(&[write], &[]) };
    }

    /// Fills the leading slots of the texture array. The rest stays
    /// unwritten, which the partially bound flag allows.
    pub fn write_textures(
        &self,
        context: &gpu::Context,
        sampler: vk::Sampler,
        views: &[vk::ImageView],
    ) {
        assert!(views.len() as u32 <= self.texture_capacity);
        if views.is_empty() {
            return;
        }
        let image_infos = views
            .iter()
            .map(|&view| vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect::<Vec<_>>();
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.texture_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_infos)
            .build();
        unsafe { context.core().update_descriptor_sets(&[write], &[]) };
    }

    pub fn destroy(self, context: &gpu::Context) {
        let device = context.core();
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
            for layout in self.layouts {
                device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_covers_every_binding() {
        let sizes = pool_sizes(7);
        let count_of = |ty| {
            sizes
                .iter()
                .find(|size| size.ty == ty)
                .map(|size| size.descriptor_count)
                .unwrap()
        };
        assert_eq!(count_of(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR), 1);
        assert_eq!(count_of(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC), 1);
        // Triangle table, vertices, and material records.
        assert_eq!(count_of(vk::DescriptorType::STORAGE_BUFFER), 3);
        assert_eq!(count_of(vk::DescriptorType::STORAGE_IMAGE), 1);
        assert_eq!(count_of(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 7);
    }

    #[test]
    fn textureless_scene_still_gets_a_slot() {
        let sizes = pool_sizes(0);
        let samplers = sizes
            .iter()
            .find(|size| size.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(samplers.descriptor_count, 1);
    }
}
