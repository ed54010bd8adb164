use ash::{
    extensions::{ext, khr},
    vk,
};
use std::{ffi, sync::Mutex};

use super::{surface, ContextDesc};

mod layer {
    use std::ffi::CStr;
    pub const KHRONOS_VALIDATION: &CStr =
        unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };
    pub const MESA_OVERLAY: &CStr =
        unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_MESA_overlay\0") };
}

const REQUIRED_DEVICE_EXTENSIONS: &[&ffi::CStr] = &[
    vk::KhrSwapchainFn::name(),
    vk::KhrDeferredHostOperationsFn::name(),
    vk::KhrAccelerationStructureFn::name(),
    vk::KhrRayTracingPipelineFn::name(),
];

#[derive(Debug)]
struct AdapterCapabilities {
    properties: vk::PhysicalDeviceProperties,
    queue_family_index: u32,
    ray_tracing: super::RayTracingProperties,
}

unsafe fn inspect_adapter(
    phd: vk::PhysicalDevice,
    instance: &super::Instance,
    driver_api_version: u32,
    surface: vk::SurfaceKHR,
) -> Option<AdapterCapabilities> {
    let supported_extension_properties = instance
        .core
        .enumerate_device_extension_properties(phd)
        .unwrap();
    let supported_extensions = supported_extension_properties
        .iter()
        .map(|ext_prop| ffi::CStr::from_ptr(ext_prop.extension_name.as_ptr()))
        .collect::<Vec<_>>();
    for extension in REQUIRED_DEVICE_EXTENSIONS {
        if !supported_extensions.contains(extension) {
            log::warn!(
                "Rejected for device extension {:?} not supported",
                extension
            );
            return None;
        }
    }

    let mut ray_tracing_pipeline_properties =
        vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut acceleration_structure_properties =
        vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut descriptor_indexing_properties =
        vk::PhysicalDeviceDescriptorIndexingPropertiesEXT::default();
    let mut properties2_khr = vk::PhysicalDeviceProperties2KHR::builder()
        .push_next(&mut ray_tracing_pipeline_properties)
        .push_next(&mut acceleration_structure_properties)
        .push_next(&mut descriptor_indexing_properties);
    instance
        .get_physical_device_properties2
        .get_physical_device_properties2(phd, &mut properties2_khr);

    let properties = properties2_khr.properties;
    let name = ffi::CStr::from_ptr(properties.device_name.as_ptr());
    log::info!("Adapter {:?}", name);

    let api_version = properties.api_version.min(driver_api_version);
    if api_version < vk::API_VERSION_1_2 {
        // `vkGetBufferDeviceAddress` is called through the core 1.2 table.
        log::warn!("\tRejected for API version {}", api_version);
        return None;
    }

    let queue_families = instance
        .core
        .get_physical_device_queue_family_properties(phd);
    let queue_family_index = match queue_families.iter().enumerate().position(|(index, info)| {
        info.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && instance
                .surface
                .get_physical_device_surface_support(phd, index as u32, surface)
                == Ok(true)
    }) {
        Some(index) => index as u32,
        None => {
            log::warn!("Rejected for not presenting to the window surface");
            return None;
        }
    };

    let mut buffer_device_address_features =
        vk::PhysicalDeviceBufferDeviceAddressFeaturesKHR::default();
    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut ray_tracing_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut descriptor_indexing_features =
        vk::PhysicalDeviceDescriptorIndexingFeaturesEXT::default();
    let mut features2_khr = vk::PhysicalDeviceFeatures2::builder()
        .push_next(&mut buffer_device_address_features)
        .push_next(&mut acceleration_structure_features)
        .push_next(&mut ray_tracing_pipeline_features)
        .push_next(&mut descriptor_indexing_features);
    instance
        .get_physical_device_properties2
        .get_physical_device_features2(phd, &mut features2_khr);

    if buffer_device_address_features.buffer_device_address == vk::FALSE {
        log::warn!(
            "\tRejected for buffer device address. Features = {:?}",
            buffer_device_address_features
        );
        return None;
    }
    if acceleration_structure_features.acceleration_structure == vk::FALSE
        || acceleration_structure_properties.max_geometry_count == 0
    {
        log::warn!(
            "\tRejected for acceleration structures. Properties = {:?}. Features = {:?}",
            acceleration_structure_properties,
            acceleration_structure_features
        );
        return None;
    }
    if ray_tracing_pipeline_features.ray_tracing_pipeline == vk::FALSE
        || ray_tracing_pipeline_properties.max_ray_recursion_depth < 2
    {
        log::warn!(
            "\tRejected for the ray tracing pipeline. Properties = {:?}. Features = {:?}",
            ray_tracing_pipeline_properties,
            ray_tracing_pipeline_features
        );
        return None;
    }
    if descriptor_indexing_features.descriptor_binding_partially_bound == vk::FALSE
        || descriptor_indexing_features.descriptor_binding_variable_descriptor_count == vk::FALSE
        || descriptor_indexing_features.runtime_descriptor_array == vk::FALSE
        || descriptor_indexing_features.shader_sampled_image_array_non_uniform_indexing
            == vk::FALSE
    {
        log::warn!(
            "\tRejected for descriptor indexing. Features = {:?}",
            descriptor_indexing_features
        );
        return None;
    }

    log::debug!(
        "Ray tracing pipeline properties: {:#?}",
        ray_tracing_pipeline_properties
    );

    Some(AdapterCapabilities {
        properties,
        queue_family_index,
        ray_tracing: super::RayTracingProperties {
            shader_group_handle_size: ray_tracing_pipeline_properties.shader_group_handle_size,
            shader_group_base_alignment: ray_tracing_pipeline_properties
                .shader_group_base_alignment,
            scratch_offset_alignment: acceleration_structure_properties
                .min_acceleration_structure_scratch_offset_alignment,
        },
    })
}

impl super::Context {
    pub unsafe fn init_windowed<
        I: raw_window_handle::HasRawWindowHandle + raw_window_handle::HasRawDisplayHandle,
    >(
        window: &I,
        desc: ContextDesc,
    ) -> Result<Self, super::NotSupportedError> {
        let (rwh, rdh) = (window.raw_window_handle(), window.raw_display_handle());

        let entry = match ash::Entry::load() {
            Ok(entry) => entry,
            Err(err) => {
                log::error!("Missing Vulkan entry points: {:?}", err);
                return Err(super::NotSupportedError);
            }
        };
        let driver_api_version = match entry.try_enumerate_instance_version() {
            // Vulkan 1.1+
            Ok(Some(version)) => version,
            Ok(None) => return Err(super::NotSupportedError),
            Err(err) => {
                log::error!("try_enumerate_instance_version: {:?}", err);
                return Err(super::NotSupportedError);
            }
        };

        let supported_layers = match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers,
            Err(err) => {
                log::error!("enumerate_instance_layer_properties: {:?}", err);
                return Err(super::NotSupportedError);
            }
        };
        let supported_layer_names = supported_layers
            .iter()
            .map(|properties| ffi::CStr::from_ptr(properties.layer_name.as_ptr()))
            .collect::<Vec<_>>();

        let mut layers: Vec<&'static ffi::CStr> = Vec::new();
        let mut requested_layers = Vec::<&ffi::CStr>::new();
        if desc.validation {
            requested_layers.push(layer::KHRONOS_VALIDATION);
        }
        if desc.overlay {
            requested_layers.push(layer::MESA_OVERLAY);
        }
        for name in requested_layers {
            if supported_layer_names.contains(&name) {
                layers.push(name);
            } else {
                log::warn!("Requested layer is not found: {:?}", name);
            }
        }

        let supported_instance_extension_properties =
            match entry.enumerate_instance_extension_properties(None) {
                Ok(extensions) => extensions,
                Err(err) => {
                    log::error!("enumerate_instance_extension_properties: {:?}", err);
                    return Err(super::NotSupportedError);
                }
            };
        let supported_instance_extensions = supported_instance_extension_properties
            .iter()
            .map(|ext_prop| ffi::CStr::from_ptr(ext_prop.extension_name.as_ptr()))
            .collect::<Vec<_>>();

        let core_instance = {
            let mut instance_extensions = vec![
                ext::DebugUtils::name(),
                vk::KhrGetPhysicalDeviceProperties2Fn::name(),
            ];
            instance_extensions.extend(
                ash_window::enumerate_required_extensions(rdh)
                    .unwrap()
                    .iter()
                    .map(|&ptr| ffi::CStr::from_ptr(ptr)),
            );

            for inst_ext in instance_extensions.iter() {
                if !supported_instance_extensions.contains(inst_ext) {
                    log::error!("Instance extension {:?} is not supported", inst_ext);
                    return Err(super::NotSupportedError);
                }
            }

            let app_info = vk::ApplicationInfo::builder()
                .engine_name(ffi::CStr::from_bytes_with_nul(b"glint\0").unwrap())
                .engine_version(1)
                .api_version(vk::HEADER_VERSION_COMPLETE);
            let str_pointers = layers
                .iter()
                .chain(instance_extensions.iter())
                .map(|&s| s.as_ptr())
                .collect::<Vec<_>>();
            let (layer_strings, extension_strings) = str_pointers.split_at(layers.len());
            let create_info = vk::InstanceCreateInfo::builder()
                .application_info(&app_info)
                .enabled_layer_names(layer_strings)
                .enabled_extension_names(extension_strings);
            entry.create_instance(&create_info, None).unwrap()
        };

        let vk_surface =
            ash_window::create_surface(&entry, &core_instance, rdh, rwh, None).unwrap();

        let instance = super::Instance {
            debug_utils: ext::DebugUtils::new(&entry, &core_instance),
            get_physical_device_properties2: khr::GetPhysicalDeviceProperties2::new(
                &entry,
                &core_instance,
            ),
            surface: khr::Surface::new(&entry, &core_instance),
            core: core_instance,
        };

        let physical_devices = instance.core.enumerate_physical_devices().unwrap();
        let (physical_device, capabilities) = physical_devices
            .into_iter()
            .find_map(|phd| {
                inspect_adapter(phd, &instance, driver_api_version, vk_surface)
                    .map(|caps| (phd, caps))
            })
            .ok_or(super::NotSupportedError)?;

        log::debug!("Adapter {:#?}", capabilities);

        let device_core = {
            let family_info = vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(capabilities.queue_family_index)
                .queue_priorities(&[1.0])
                .build();
            let family_infos = [family_info];

            let str_pointers = REQUIRED_DEVICE_EXTENSIONS
                .iter()
                .map(|&s| s.as_ptr())
                .collect::<Vec<_>>();

            let core_features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);
            let mut khr_buffer_device_address =
                vk::PhysicalDeviceBufferDeviceAddressFeaturesKHR::builder()
                    .buffer_device_address(true);
            let mut khr_acceleration_structure =
                vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
                    .acceleration_structure(true);
            let mut khr_ray_tracing_pipeline =
                vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder()
                    .ray_tracing_pipeline(true);
            let mut ext_descriptor_indexing =
                vk::PhysicalDeviceDescriptorIndexingFeaturesEXT::builder()
                    .descriptor_binding_partially_bound(true)
                    .descriptor_binding_variable_descriptor_count(true)
                    .runtime_descriptor_array(true)
                    // The hit shader indexes the texture array with
                    // `nonuniformEXT`.
                    .shader_sampled_image_array_non_uniform_indexing(true);
            let device_create_info = vk::DeviceCreateInfo::builder()
                .queue_create_infos(&family_infos)
                .enabled_extension_names(&str_pointers)
                .enabled_features(&core_features)
                .push_next(&mut khr_buffer_device_address)
                .push_next(&mut khr_acceleration_structure)
                .push_next(&mut khr_ray_tracing_pipeline)
                .push_next(&mut ext_descriptor_indexing);

            instance
                .core
                .create_device(physical_device, &device_create_info, None)
                .unwrap()
        };

        let device = super::Device {
            swapchain: khr::Swapchain::new(&instance.core, &device_core),
            acceleration_structure: khr::AccelerationStructure::new(&instance.core, &device_core),
            ray_tracing_pipeline: khr::RayTracingPipeline::new(&instance.core, &device_core),
            core: device_core,
        };

        let memory_manager = {
            let mem_properties = instance
                .core
                .get_physical_device_memory_properties(physical_device);
            let memory_types =
                &mem_properties.memory_types[..mem_properties.memory_type_count as usize];
            let limits = &capabilities.properties.limits;
            let config = gpu_alloc::Config::i_am_prototyping();

            let properties = gpu_alloc::DeviceProperties {
                max_memory_allocation_count: limits.max_memory_allocation_count,
                max_memory_allocation_size: u64::max_value(),
                non_coherent_atom_size: limits.non_coherent_atom_size,
                memory_types: memory_types
                    .iter()
                    .map(|memory_type| gpu_alloc::MemoryType {
                        props: gpu_alloc::MemoryPropertyFlags::from_bits_truncate(
                            memory_type.property_flags.as_raw() as u8,
                        ),
                        heap: memory_type.heap_index,
                    })
                    .collect(),
                memory_heaps: mem_properties.memory_heaps
                    [..mem_properties.memory_heap_count as usize]
                    .iter()
                    .map(|&memory_heap| gpu_alloc::MemoryHeap {
                        size: memory_heap.size,
                    })
                    .collect(),
                buffer_device_address: true,
            };

            let known_memory_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED
                | vk::MemoryPropertyFlags::LAZILY_ALLOCATED;
            let valid_ash_memory_types = memory_types.iter().enumerate().fold(0, |u, (i, mem)| {
                if known_memory_flags.contains(mem.property_flags) {
                    u | (1 << i)
                } else {
                    u
                }
            });
            super::MemoryManager {
                allocator: gpu_alloc::GpuAllocator::new(config, properties),
                slab: slab::Slab::new(),
                valid_ash_memory_types,
            }
        };

        let queue = device
            .core
            .get_device_queue(capabilities.queue_family_index, 0);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(capabilities.queue_family_index);
        let transfer_pool = device.core.create_command_pool(&pool_info, None).unwrap();

        let semaphore_create_info = vk::SemaphoreCreateInfo::builder();
        let next_semaphore = device
            .core
            .create_semaphore(&semaphore_create_info, None)
            .unwrap();
        let surface = surface::Surface {
            raw: vk_surface,
            swapchain: vk::SwapchainKHR::null(),
            frames: Vec::new(),
            next_semaphore,
            extent: vk::Extent2D::default(),
            format: vk::Format::UNDEFINED,
        };

        Ok(super::Context {
            memory: Mutex::new(memory_manager),
            device,
            queue_family_index: capabilities.queue_family_index,
            queue: Mutex::new(queue),
            surface: Mutex::new(surface),
            physical_device,
            transfer_pool,
            limits: capabilities.properties.limits,
            ray_tracing_properties: capabilities.ray_tracing,
            instance,
            _entry: entry,
        })
    }
}
