use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::{io, mem, path::PathBuf, ptr};

use crate::{accel, binding, camera, geometry, gpu, pipeline, sbt, scene};

/// Fixed scene lighting, four point lights along a diagonal.
pub const LIGHT_POSITIONS: [[f32; 4]; 4] = [
    [6.0, 6.0, 0.0, 0.0],
    [2.0, 5.0, 0.0, 0.0],
    [-2.0, 4.0, 0.0, 0.0],
    [-6.0, 3.0, 0.0, 0.0],
];

/// Per-frame shader constants. The ray generation stage reconstructs
/// rays from the inverse matrices, the hit stage shades with the camera
/// basis and the lights.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view_inverse: [[f32; 4]; 4],
    pub proj_inverse: [[f32; 4]; 4],
    pub position: [f32; 4],
    pub right: [f32; 4],
    pub up: [f32; 4],
    pub forward: [f32; 4],
    pub light_positions: [[f32; 4]; 4],
}

impl FrameUniforms {
    pub fn from_camera(camera: &camera::Camera) -> Self {
        let point = |v: glam::Vec3| [v.x, v.y, v.z, 1.0];
        let direction = |v: glam::Vec3| [v.x, v.y, v.z, 0.0];
        FrameUniforms {
            view_inverse: camera.view().inverse().to_cols_array_2d(),
            proj_inverse: camera.projection().inverse().to_cols_array_2d(),
            position: point(camera.position),
            right: direction(camera.right()),
            up: direction(camera.up()),
            forward: direction(camera.forward()),
            light_positions: LIGHT_POSITIONS,
        }
    }
}

/// Byte offset of a frame slot inside the uniform ring buffer.
pub fn uniform_slot_offset(min_alignment: u64, slot: u32) -> u64 {
    sbt::align_up(mem::size_of::<FrameUniforms>() as u64, min_alignment) * slot as u64
}

#[derive(Clone, Debug)]
pub struct ShaderPaths {
    pub closest_hit: PathBuf,
    pub ray_gen: PathBuf,
    pub miss: PathBuf,
    pub shadow_miss: PathBuf,
}

#[derive(Debug)]
pub struct RendererDesc {
    pub validation: bool,
    pub overlay: bool,
    /// Applied to the single scene instance when the top level is built.
    pub scene_transform: glam::Mat4,
}

#[derive(Debug)]
pub enum InitError {
    NotSupported(gpu::NotSupportedError),
    Shader(io::Error),
}

impl From<gpu::NotSupportedError> for InitError {
    fn from(err: gpu::NotSupportedError) -> Self {
        InitError::NotSupported(err)
    }
}
impl From<io::Error> for InitError {
    fn from(err: io::Error) -> Self {
        InitError::Shader(err)
    }
}

struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    /// Signals when this slot's last submission retired. Created
    /// signaled so the first wait on every slot passes.
    fence: vk::Fence,
    render_finished: vk::Semaphore,
}

pub struct Renderer {
    context: gpu::Context,
    scene_geometry: geometry::SceneGeometry,
    bottom_level: accel::AccelerationStructure,
    top_level: accel::AccelerationStructure,
    bindings: binding::BindingTables,
    rt_pipeline: pipeline::RayTracingPipeline,
    table: sbt::ShaderBindingTable,
    textures: Vec<(gpu::Texture, vk::ImageView)>,
    sampler: vk::Sampler,
    target: gpu::Texture,
    target_view: vk::ImageView,
    uniform_buffer: gpu::Buffer,
    uniform_alignment: u64,
    command_pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    extent: vk::Extent2D,
}

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

impl Renderer {
    #[profiling::function]
    pub fn new<
        I: raw_window_handle::HasRawWindowHandle + raw_window_handle::HasRawDisplayHandle,
    >(
        window: &I,
        size: vk::Extent2D,
        scene: &scene::Scene,
        shaders: &ShaderPaths,
        desc: RendererDesc,
    ) -> Result<Self, InitError> {
        scene.validate();

        let context = unsafe {
            gpu::Context::init_windowed(
                window,
                gpu::ContextDesc {
                    validation: desc.validation,
                    overlay: desc.overlay,
                },
            )?
        };
        let slot_count = context.configure_swapchain(size);

        let scene_geometry = geometry::SceneGeometry::new(&context, scene);
        let bottom_level = accel::build_bottom_level(&context, &scene_geometry);
        let top_level = accel::build_top_level(&context, &bottom_level, desc.scene_transform);

        let mut max_mip_count = 1;
        let textures = scene
            .images
            .iter()
            .enumerate()
            .map(|(index, image)| {
                let image_size = vk::Extent2D {
                    width: image.width,
                    height: image.height,
                };
                max_mip_count = max_mip_count.max(gpu::mip_level_count(image_size));
                context.create_texture_init(&format!("scene texture {}", index), image_size, &image.rgba8)
            })
            .collect::<Vec<_>>();
        let sampler = context.create_sampler(max_mip_count as f32);

        // RGBA8 is the one storage format universally supported. The
        // per-frame blit swizzles into whatever the swapchain negotiated.
        let target = context.create_texture(gpu::TextureDesc {
            name: "ray traced color",
            format: vk::Format::R8G8B8A8_UNORM,
            size,
            mip_level_count: 1,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        });
        let target_view = context.create_texture_view(target, vk::Format::R8G8B8A8_UNORM, 1);
        context.single_time_commands(|cmd_buf| {
            let barrier = vk::ImageMemoryBarrier::builder()
                .dst_access_mask(vk::AccessFlags::SHADER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(target.raw)
                .subresource_range(COLOR_RANGE)
                .build();
            unsafe {
                context.core().cmd_pipeline_barrier(
                    cmd_buf,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        });

        let uniform_alignment = context.limits().min_uniform_buffer_offset_alignment;
        let uniform_buffer = context.create_buffer(gpu::BufferDesc {
            name: "frame uniforms",
            size: uniform_slot_offset(uniform_alignment, slot_count),
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            memory: gpu::Memory::Upload,
        });

        let bindings = binding::BindingTables::new(&context, scene.images.len() as u32);
        bindings.write_common(
            &context,
            &top_level,
            &scene_geometry,
            uniform_buffer,
            mem::size_of::<FrameUniforms>() as u64,
            target_view,
        );
        bindings.write_materials(&context, scene_geometry.material_buffer);
        bindings.write_textures(
            &context,
            sampler,
            &textures.iter().map(|&(_, view)| view).collect::<Vec<_>>(),
        );

        let rt_pipeline = pipeline::RayTracingPipeline::new(
            &context,
            &bindings.layouts,
            &shaders.closest_hit,
            &shaders.ray_gen,
            &shaders.miss,
            &shaders.shadow_miss,
        )?;
        let table = sbt::ShaderBindingTable::new(&context, &rt_pipeline);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(context.queue_family_index);
        let command_pool = unsafe {
            context
                .core()
                .create_command_pool(&pool_info, None)
                .unwrap()
        };
        let cmd_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slot_count);
        let command_buffers =
            unsafe { context.core().allocate_command_buffers(&cmd_info).unwrap() };
        let slots = command_buffers
            .into_iter()
            .map(|command_buffer| {
                let fence_info =
                    vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
                let semaphore_info = vk::SemaphoreCreateInfo::builder();
                unsafe {
                    FrameSlot {
                        command_buffer,
                        fence: context.core().create_fence(&fence_info, None).unwrap(),
                        render_finished: context
                            .core()
                            .create_semaphore(&semaphore_info, None)
                            .unwrap(),
                    }
                }
            })
            .collect();

        log::info!(
            "Renderer ready: {}x{}, {} frame slots, {} textures",
            size.width,
            size.height,
            slot_count,
            textures.len(),
        );

        Ok(Renderer {
            context,
            scene_geometry,
            bottom_level,
            top_level,
            bindings,
            rt_pipeline,
            table,
            textures,
            sampler,
            target,
            target_view,
            uniform_buffer,
            uniform_alignment,
            command_pool,
            slots,
            extent: size,
        })
    }

    fn record(&self, slot: &FrameSlot, swapchain_image: vk::Image, uniform_offset: u32) {
        let device = self.context.core();
        let cmd_buf = slot.command_buffer;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device.begin_command_buffer(cmd_buf, &begin_info).unwrap();

            self.context.cmd_begin_label(cmd_buf, "ray trace");
            device.cmd_bind_pipeline(
                cmd_buf,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.rt_pipeline.raw,
            );
            device.cmd_bind_descriptor_sets(
                cmd_buf,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.rt_pipeline.layout,
                0,
                &[
                    self.bindings.common_set,
                    self.bindings.material_set,
                    self.bindings.texture_set,
                ],
                &[uniform_offset],
            );
            self.context.device.ray_tracing_pipeline.cmd_trace_rays(
                cmd_buf,
                &self.table.regions.raygen,
                &self.table.regions.miss,
                &self.table.regions.hit,
                &self.table.regions.callable,
                self.extent.width,
                self.extent.height,
                1,
            );
            self.context.cmd_end_label(cmd_buf);

            self.context.cmd_begin_label(cmd_buf, "present blit");
            let to_blit = [
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                    .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                    .old_layout(vk::ImageLayout::GENERAL)
                    .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(self.target.raw)
                    .subresource_range(COLOR_RANGE)
                    .build(),
                vk::ImageMemoryBarrier::builder()
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(swapchain_image)
                    .subresource_range(COLOR_RANGE)
                    .build(),
            ];
            device.cmd_pipeline_barrier(
                cmd_buf,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &to_blit,
            );

            let full_extent = [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: self.extent.width as i32,
                    y: self.extent.height as i32,
                    z: 1,
                },
            ];
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: full_extent,
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: full_extent,
            };
            device.cmd_blit_image(
                cmd_buf,
                self.target.raw,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::NEAREST,
            );

            let to_present = [
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                    .dst_access_mask(vk::AccessFlags::SHADER_WRITE)
                    .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .new_layout(vk::ImageLayout::GENERAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(self.target.raw)
                    .subresource_range(COLOR_RANGE)
                    .build(),
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(swapchain_image)
                    .subresource_range(COLOR_RANGE)
                    .build(),
            ];
            device.cmd_pipeline_barrier(
                cmd_buf,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                    | vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &to_present,
            );
            self.context.cmd_end_label(cmd_buf);

            device.end_command_buffer(cmd_buf).unwrap();
        }
    }

    /// Renders one frame: acquire, throttle on the slot fence, write the
    /// slot's uniforms, re-record, submit, present.
    #[profiling::function]
    pub fn render(&mut self, camera: &camera::Camera) {
        let device = self.context.core();
        let frame = self.context.acquire_frame();
        let slot = &self.slots[frame.image_index as usize];

        unsafe {
            device
                .wait_for_fences(&[slot.fence], true, gpu::WAIT_TIMEOUT_NS)
                .unwrap();
            device.reset_fences(&[slot.fence]).unwrap();
        }

        // The fence wait above proves the GPU is done with this slot's
        // uniform region, so the write below cannot race the shader.
        let uniform_offset = uniform_slot_offset(self.uniform_alignment, frame.image_index);
        let uniforms = FrameUniforms::from_camera(camera);
        unsafe {
            ptr::copy_nonoverlapping(
                bytemuck::bytes_of(&uniforms).as_ptr(),
                self.uniform_buffer.data().add(uniform_offset as usize),
                mem::size_of::<FrameUniforms>(),
            );
        }

        self.record(slot, frame.image, uniform_offset as u32);

        let wait_semaphores = [frame.acquire_semaphore];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let command_buffers = [slot.command_buffer];
        let signal_semaphores = [slot.render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        let swapchains = [self.context.swapchain_handle()];
        unsafe {
            let queue = self.context.queue.lock().unwrap();
            device
                .queue_submit(*queue, &[submit_info], slot.fence)
                .unwrap();

            let image_indices = [frame.image_index];
            let present_info = vk::PresentInfoKHR::builder()
                .wait_semaphores(&signal_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);
            self.context
                .device
                .swapchain
                .queue_present(*queue, &present_info)
                .unwrap();
        }
        profiling::finish_frame!();
    }

    pub fn aspect(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }

    /// Waits for the device to go idle, then releases everything.
    pub fn destroy(self) {
        self.context.wait_idle();
        let device = self.context.core();
        unsafe {
            for slot in self.slots.iter() {
                device.destroy_fence(slot.fence, None);
                device.destroy_semaphore(slot.render_finished, None);
            }
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.target_view, None);
            for &(_, view) in self.textures.iter() {
                device.destroy_image_view(view, None);
            }
        }
        self.table.destroy(&self.context);
        self.rt_pipeline.destroy(&self.context);
        self.bindings.destroy(&self.context);
        for (texture, _) in self.textures {
            self.context.destroy_texture(texture);
        }
        self.context.destroy_texture(self.target);
        self.context.destroy_buffer(self.uniform_buffer);
        self.top_level.destroy(&self.context);
        self.bottom_level.destroy(&self.context);
        self.scene_geometry.destroy(&self.context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniforms_are_tightly_packed() {
        // Two matrices, four camera vectors, four lights.
        assert_eq!(mem::size_of::<FrameUniforms>(), 2 * 64 + 4 * 16 + 64);
    }

    #[test]
    fn uniform_slots_respect_the_alignment() {
        assert_eq!(uniform_slot_offset(256, 0), 0);
        assert_eq!(uniform_slot_offset(256, 1), 256);
        assert_eq!(uniform_slot_offset(64, 2), 2 * 256);
        // A coarse alignment pads every slot up.
        assert_eq!(uniform_slot_offset(1024, 1), 1024);
    }
}
