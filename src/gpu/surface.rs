use ash::vk;
use std::mem;

/// Frames in flight. The swapchain, the uniform ring, and the fence pool
/// are all sized by this.
pub const FRAME_COUNT: u32 = 3;

pub(super) struct Surface {
    pub raw: vk::SurfaceKHR,
    pub swapchain: vk::SwapchainKHR,
    pub frames: Vec<InternalFrame>,
    pub next_semaphore: vk::Semaphore,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

pub(super) struct InternalFrame {
    pub image: vk::Image,
    pub acquire_semaphore: vk::Semaphore,
}

#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub image_index: u32,
    pub image: vk::Image,
    pub acquire_semaphore: vk::Semaphore,
}

impl super::Context {
    /// (Re)creates the swapchain for the given size and returns the
    /// effective image count. All images come out in `PRESENT_SRC_KHR`
    /// so the per-frame barriers always see the same starting layout.
    pub fn configure_swapchain(&self, size: vk::Extent2D) -> u32 {
        let mut surface = self.surface.lock().unwrap();

        let capabilities = unsafe {
            self.instance
                .surface
                .get_physical_device_surface_capabilities(self.physical_device, surface.raw)
                .unwrap()
        };
        if size.width < capabilities.min_image_extent.width
            || size.width > capabilities.max_image_extent.width
            || size.height < capabilities.min_image_extent.height
            || size.height > capabilities.max_image_extent.height
        {
            log::warn!(
                "Requested size {}x{} is outside of surface capabilities",
                size.width,
                size.height
            );
        }

        let effective_frame_count = FRAME_COUNT.max(capabilities.min_image_count).min(
            if capabilities.max_image_count != 0 {
                capabilities.max_image_count
            } else {
                !0
            },
        );
        if effective_frame_count != FRAME_COUNT {
            log::warn!(
                "Requested frame count {} is outside of surface capabilities, clamping to {}",
                FRAME_COUNT,
                effective_frame_count,
            );
        }

        let present_modes = unsafe {
            self.instance
                .surface
                .get_physical_device_surface_present_modes(self.physical_device, surface.raw)
                .unwrap()
        };
        let present_mode = if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        };

        let formats = unsafe {
            self.instance
                .surface
                .get_physical_device_surface_formats(self.physical_device, surface.raw)
                .unwrap()
        };
        let surface_format = formats
            .iter()
            .find(|sf| {
                sf.format == vk::Format::B8G8R8A8_UNORM
                    && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .cloned()
            .unwrap();

        let queue_families = [self.queue_family_index];
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.raw)
            .min_image_count(effective_frame_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(size)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .queue_family_indices(&queue_families)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .old_swapchain(surface.swapchain);
        let new_swapchain = unsafe {
            self.device
                .swapchain
                .create_swapchain(&create_info, None)
                .unwrap()
        };

        // destroy the old swapchain
        unsafe {
            self.device
                .swapchain
                .destroy_swapchain(surface.swapchain, None);
        }
        for frame in surface.frames.drain(..) {
            unsafe {
                self.device
                    .core
                    .destroy_semaphore(frame.acquire_semaphore, None);
            }
        }

        let images = unsafe {
            self.device
                .swapchain
                .get_swapchain_images(new_swapchain)
                .unwrap()
        };
        for &image in images.iter() {
            let semaphore_create_info = vk::SemaphoreCreateInfo::builder();
            let acquire_semaphore = unsafe {
                self.device
                    .core
                    .create_semaphore(&semaphore_create_info, None)
                    .unwrap()
            };
            surface.frames.push(InternalFrame {
                image,
                acquire_semaphore,
            });
        }

        self.single_time_commands(|cmd_buf| {
            let barriers = surface
                .frames
                .iter()
                .map(|frame| {
                    vk::ImageMemoryBarrier::builder()
                        .old_layout(vk::ImageLayout::UNDEFINED)
                        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(frame.image)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .build()
                })
                .collect::<Vec<_>>();
            unsafe {
                self.device.core.cmd_pipeline_barrier(
                    cmd_buf,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &barriers,
                );
            }
        });

        surface.swapchain = new_swapchain;
        surface.extent = size;
        surface.format = surface_format.format;
        surface.frames.len() as u32
    }

    pub fn surface_extent(&self) -> vk::Extent2D {
        self.surface.lock().unwrap().extent
    }

    pub fn swapchain_handle(&self) -> vk::SwapchainKHR {
        self.surface.lock().unwrap().swapchain
    }

    /// Blocks until the presentation engine hands out an image. The
    /// semaphore rotation keeps one unused acquire semaphore around,
    /// since the image index is only known after the wait is enqueued.
    pub fn acquire_frame(&self) -> Frame {
        let mut surface = self.surface.lock().unwrap();
        let acquire_semaphore = surface.next_semaphore;
        let (index, _suboptimal) = unsafe {
            self.device
                .swapchain
                .acquire_next_image(
                    surface.swapchain,
                    super::WAIT_TIMEOUT_NS,
                    acquire_semaphore,
                    vk::Fence::null(),
                )
                .unwrap()
        };
        surface.next_semaphore = mem::replace(
            &mut surface.frames[index as usize].acquire_semaphore,
            acquire_semaphore,
        );
        Frame {
            image_index: index,
            image: surface.frames[index as usize].image,
            acquire_semaphore,
        }
    }
}
