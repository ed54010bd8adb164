use ash::{util::read_spv, vk};
use std::{ffi, fs, io, path::Path};

use crate::gpu;

/// Shader group slots, in the order the binding table regions expect
/// them. The hit group leads so that region zero is the hit region.
pub mod group {
    pub const CLOSEST_HIT: u32 = 0;
    pub const RAY_GEN: u32 = 1;
    pub const MISS: u32 = 2;
    pub const SHADOW_MISS: u32 = 3;
    pub const COUNT: u32 = 4;
}

/// Shadow rays are traced from the primary hit, so two levels total.
pub const MAX_RAY_RECURSION_DEPTH: u32 = 2;

const ENTRY_POINT: &ffi::CStr = unsafe { ffi::CStr::from_bytes_with_nul_unchecked(b"main\0") };

pub struct RayTracingPipeline {
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

fn load_shader_module(
    context: &gpu::Context,
    path: &Path,
) -> Result<vk::ShaderModule, io::Error> {
    let mut file = fs::File::open(path).map_err(|err| {
        log::error!("Unable to open shader {}: {}", path.display(), err);
        err
    })?;
    let spv = read_spv(&mut file)?;
    let vk_info = vk::ShaderModuleCreateInfo::builder().code(&spv);
    let raw = unsafe {
        context
            .core()
            .create_shader_module(&vk_info, None)
            .unwrap()
    };
    context.set_object_name(
        vk::ObjectType::SHADER_MODULE,
        raw,
        &path.display().to_string(),
    );
    Ok(raw)
}

impl RayTracingPipeline {
    /// Builds the pipeline from precompiled SPIR-V. Stage and group
    /// indices coincide since every group references exactly one stage.
    pub fn new(
        context: &gpu::Context,
        set_layouts: &[vk::DescriptorSetLayout],
        closest_hit: &Path,
        ray_gen: &Path,
        miss: &Path,
        shadow_miss: &Path,
    ) -> Result<Self, io::Error> {
        let device = context.core();

        // All modules load before any other object is created, so a
        // missing shader file leaves nothing behind.
        let mut modules = Vec::with_capacity(group::COUNT as usize);
        for path in [closest_hit, ray_gen, miss, shadow_miss] {
            match load_shader_module(context, path) {
                Ok(module) => modules.push(module),
                Err(err) => {
                    for module in modules {
                        unsafe { device.destroy_shader_module(module, None) };
                    }
                    return Err(err);
                }
            }
        }

        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None).unwrap() };
        let stage_flags = [
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            vk::ShaderStageFlags::RAYGEN_KHR,
            vk::ShaderStageFlags::MISS_KHR,
            vk::ShaderStageFlags::MISS_KHR,
        ];
        let stages = modules
            .iter()
            .zip(stage_flags)
            .map(|(&module, stage)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage)
                    .module(module)
                    .name(ENTRY_POINT)
                    .build()
            })
            .collect::<Vec<_>>();

        let mut groups = Vec::with_capacity(group::COUNT as usize);
        groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(group::CLOSEST_HIT)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build(),
        );
        for general in [group::RAY_GEN, group::MISS, group::SHADOW_MISS] {
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(general)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
                    .build(),
            );
        }

        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(MAX_RAY_RECURSION_DEPTH)
            .layout(layout)
            .build();
        let raw = unsafe {
            context
                .device
                .ray_tracing_pipeline
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    &[create_info],
                    None,
                )
                .unwrap()[0]
        };
        context.set_object_name(vk::ObjectType::PIPELINE, raw, "ray tracing");

        for module in modules {
            unsafe { device.destroy_shader_module(module, None) };
        }

        Ok(RayTracingPipeline { raw, layout })
    }

    pub fn destroy(self, context: &gpu::Context) {
        let device = context.core();
        unsafe {
            device.destroy_pipeline(self.raw, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::group;

    #[test]
    fn hit_group_leads() {
        assert_eq!(group::CLOSEST_HIT, 0);
        assert_eq!(group::RAY_GEN, 1);
        // The two miss groups are adjacent so one strided region covers
        // both, with the shadow miss selected by the trace call's offset.
        assert_eq!(group::SHADOW_MISS, group::MISS + 1);
        assert_eq!(group::COUNT, 4);
    }
}
