use ash::vk;
use gpu_alloc_ash::AshMemoryDevice;
use std::ptr;

struct Allocation {
    memory: vk::DeviceMemory,
    offset: u64,
    handle: usize,
    data: *mut u8,
}

/// Full mip chain length for a 2D extent.
pub fn mip_level_count(size: vk::Extent2D) -> u32 {
    32 - size.width.max(size.height).max(1).leading_zeros()
}

impl super::Context {
    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        memory: super::Memory,
        device_address: bool,
    ) -> Allocation {
        let mut manager = self.memory.lock().unwrap();
        let mut alloc_usage = match memory {
            super::Memory::Device => gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS,
            super::Memory::Upload => {
                gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::UPLOAD
            }
        };
        if device_address {
            alloc_usage |= gpu_alloc::UsageFlags::DEVICE_ADDRESS;
        }
        let memory_types = requirements.memory_type_bits & manager.valid_ash_memory_types;
        let mut block = unsafe {
            manager
                .allocator
                .alloc(
                    AshMemoryDevice::wrap(&self.device.core),
                    gpu_alloc::Request {
                        size: requirements.size,
                        align_mask: requirements.alignment - 1,
                        usage: alloc_usage,
                        memory_types,
                    },
                )
                .unwrap()
        };
        let data = if memory == super::Memory::Device {
            ptr::null_mut()
        } else {
            unsafe {
                block
                    .map(
                        AshMemoryDevice::wrap(&self.device.core),
                        0,
                        requirements.size as usize,
                    )
                    .unwrap()
                    .as_ptr()
            }
        };
        Allocation {
            memory: *block.memory(),
            offset: block.offset(),
            handle: manager.slab.insert(block),
            data,
        }
    }

    fn free_memory(&self, handle: usize) {
        let mut manager = self.memory.lock().unwrap();
        let block = manager.slab.remove(handle);
        unsafe {
            manager
                .allocator
                .dealloc(AshMemoryDevice::wrap(&self.device.core), block);
        }
    }

    pub fn create_buffer(&self, desc: super::BufferDesc) -> super::Buffer {
        let vk_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw = unsafe { self.device.core.create_buffer(&vk_info, None).unwrap() };
        let requirements = unsafe { self.device.core.get_buffer_memory_requirements(raw) };
        let needs_address = desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let allocation = self.allocate_memory(requirements, desc.memory, needs_address);

        unsafe {
            self.device
                .core
                .bind_buffer_memory(raw, allocation.memory, allocation.offset)
                .unwrap();
        }
        if !desc.name.is_empty() {
            self.set_object_name(vk::ObjectType::BUFFER, raw, desc.name);
        }

        super::Buffer {
            raw,
            memory_handle: allocation.handle,
            mapped_data: allocation.data,
        }
    }

    pub fn destroy_buffer(&self, buffer: super::Buffer) {
        unsafe { self.device.core.destroy_buffer(buffer.raw, None) };
        self.free_memory(buffer.memory_handle);
    }

    /// Creates a device-local buffer and fills it through a staging copy.
    pub fn create_buffer_init(
        &self,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> super::Buffer {
        let buffer = self.create_buffer(super::BufferDesc {
            name,
            size: data.len() as u64,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            memory: super::Memory::Device,
        });
        let staging = self.create_buffer(super::BufferDesc {
            name: "staging",
            size: data.len() as u64,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory: super::Memory::Upload,
        });
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), staging.data(), data.len());
        }
        self.single_time_commands(|cmd_buf| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: data.len() as u64,
            };
            unsafe {
                self.device
                    .core
                    .cmd_copy_buffer(cmd_buf, staging.raw, buffer.raw, &[region]);
            }
        });
        self.destroy_buffer(staging);
        buffer
    }

    pub fn create_texture(&self, desc: super::TextureDesc) -> super::Texture {
        let vk_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.size.width,
                height: desc.size.height,
                depth: 1,
            })
            .mip_levels(desc.mip_level_count)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let raw = unsafe { self.device.core.create_image(&vk_info, None).unwrap() };
        let requirements = unsafe { self.device.core.get_image_memory_requirements(raw) };
        let allocation = self.allocate_memory(requirements, super::Memory::Device, false);

        unsafe {
            self.device
                .core
                .bind_image_memory(raw, allocation.memory, allocation.offset)
                .unwrap();
        }
        if !desc.name.is_empty() {
            self.set_object_name(vk::ObjectType::IMAGE, raw, desc.name);
        }

        super::Texture {
            raw,
            memory_handle: allocation.handle,
        }
    }

    pub fn destroy_texture(&self, texture: super::Texture) {
        unsafe { self.device.core.destroy_image(texture.raw, None) };
        self.free_memory(texture.memory_handle);
    }

    pub fn create_texture_view(
        &self,
        texture: super::Texture,
        format: vk::Format,
        mip_level_count: u32,
    ) -> vk::ImageView {
        let vk_info = vk::ImageViewCreateInfo::builder()
            .image(texture.raw)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: mip_level_count,
                base_array_layer: 0,
                layer_count: 1,
            });
        unsafe { self.device.core.create_image_view(&vk_info, None).unwrap() }
    }

    pub fn create_sampler(&self, max_lod: f32) -> vk::Sampler {
        let vk_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(self.limits.max_sampler_anisotropy)
            .max_lod(max_lod);
        unsafe { self.device.core.create_sampler(&vk_info, None).unwrap() }
    }

    /// Uploads RGBA8 pixels into mip 0 and blits the rest of the chain,
    /// leaving the whole image in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn create_texture_init(
        &self,
        name: &str,
        size: vk::Extent2D,
        pixels: &[u8],
    ) -> (super::Texture, vk::ImageView) {
        let format = vk::Format::R8G8B8A8_UNORM;
        let mip_count = mip_level_count(size);
        let texture = self.create_texture(super::TextureDesc {
            name,
            format,
            size,
            mip_level_count: mip_count,
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
        });

        let staging = self.create_buffer(super::BufferDesc {
            name: "texture staging",
            size: pixels.len() as u64,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory: super::Memory::Upload,
        });
        unsafe {
            ptr::copy_nonoverlapping(pixels.as_ptr(), staging.data(), pixels.len());
        }

        self.single_time_commands(|cmd_buf| unsafe {
            let whole_range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: mip_count,
                base_array_layer: 0,
                layer_count: 1,
            };
            let to_transfer_dst = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(texture.raw)
                .subresource_range(whole_range)
                .build();
            self.device.core.cmd_pipeline_barrier(
                cmd_buf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer_dst],
            );

            let copy = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: size.width,
                    height: size.height,
                    depth: 1,
                },
            };
            self.device.core.cmd_copy_buffer_to_image(
                cmd_buf,
                staging.raw,
                texture.raw,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );

            // Each level is blitted from the previous one, so the source
            // level flips to `TRANSFER_SRC` right before its blit.
            let mut mip_size = size;
            for level in 1..mip_count {
                let src_range = vk::ImageSubresourceRange {
                    base_mip_level: level - 1,
                    level_count: 1,
                    ..whole_range
                };
                let to_transfer_src = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(texture.raw)
                    .subresource_range(src_range)
                    .build();
                self.device.core.cmd_pipeline_barrier(
                    cmd_buf,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_transfer_src],
                );

                let next_size = vk::Extent2D {
                    width: (mip_size.width / 2).max(1),
                    height: (mip_size.height / 2).max(1),
                };
                let blit = vk::ImageBlit {
                    src_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: level - 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    src_offsets: [
                        vk::Offset3D::default(),
                        vk::Offset3D {
                            x: mip_size.width as i32,
                            y: mip_size.height as i32,
                            z: 1,
                        },
                    ],
                    dst_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: level,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    dst_offsets: [
                        vk::Offset3D::default(),
                        vk::Offset3D {
                            x: next_size.width as i32,
                            y: next_size.height as i32,
                            z: 1,
                        },
                    ],
                };
                self.device.core.cmd_blit_image(
                    cmd_buf,
                    texture.raw,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    texture.raw,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
                mip_size = next_size;
            }

            // All levels but the last are in `TRANSFER_SRC` now.
            let mut sampled_barriers = Vec::new();
            if mip_count > 1 {
                sampled_barriers.push(
                    vk::ImageMemoryBarrier::builder()
                        .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                        .dst_access_mask(vk::AccessFlags::SHADER_READ)
                        .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(texture.raw)
                        .subresource_range(vk::ImageSubresourceRange {
                            level_count: mip_count - 1,
                            ..whole_range
                        })
                        .build(),
                );
            }
            sampled_barriers.push(
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(texture.raw)
                    .subresource_range(vk::ImageSubresourceRange {
                        base_mip_level: mip_count - 1,
                        level_count: 1,
                        ..whole_range
                    })
                    .build(),
            );
            self.device.core.cmd_pipeline_barrier(
                cmd_buf,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &sampled_barriers,
            );
        });
        self.destroy_buffer(staging);

        let view = self.create_texture_view(texture, format, mip_count);
        (texture, view)
    }
}

#[cfg(test)]
mod tests {
    use super::mip_level_count;
    use ash::vk;

    #[test]
    fn mip_chain_length() {
        let extent = |width, height| vk::Extent2D { width, height };
        assert_eq!(mip_level_count(extent(1, 1)), 1);
        assert_eq!(mip_level_count(extent(256, 256)), 9);
        assert_eq!(mip_level_count(extent(640, 480)), 10);
        assert_eq!(mip_level_count(extent(1, 512)), 10);
    }
}
