//! Device bootstrap: instance, surface, physical device selection, logical
//! device, queues, and the swap chain.
//!
//! Physical devices are rated by whether they expose the required queues,
//! extensions, swap-chain support, and features; the best-rated one wins.
//! The swap chain prefers B8G8R8A8_SRGB with a non-linear SRGB color space
//! and MAILBOX presentation, falling back to FIFO which is always there.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr;
use ash::vk;
use config::Config;
use log::{debug, error, info, warn};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::command_buffer::QueueUsage;
use crate::frame::MAX_SWAP_CHAIN_IMAGES;
use crate::memory::{HostAllocationTable, MemoryManager};
use crate::pool::Handle;
use crate::texture::Texture;

pub struct DeviceInfo<'a> {
    pub config: &'a Config,
    pub display_handle: RawDisplayHandle,
    pub window_handle: RawWindowHandle,
}

pub struct CommandQueue {
    pub flags: QueueUsage,
    pub family_index: u32,
    pub handle: vk::Queue,
    pub command_pool: vk::CommandPool,
}

pub struct SwapChain {
    pub handle: vk::SwapchainKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    views: Vec<vk::ImageView>,
    pub textures: Vec<Handle<Texture>>,
}

pub struct Device {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface_loader: khr::Surface,
    pub(crate) swapchain_loader: khr::Swapchain,
    surface: vk::SurfaceKHR,
    physical: vk::PhysicalDevice,
    device: ash::Device,
    queues: Vec<CommandQueue>,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    enabled_features: vk::PhysicalDeviceFeatures,
    depth_stencil_format: vk::Format,
    has_stencil: bool,
    host_allocs: HostAllocationTable,
    swap_chain: Option<SwapChain>,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || (*data).p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*data).p_message).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("vulkan: {}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("vulkan: {}", message);
    } else {
        debug!("vulkan: {}", message);
    }
    vk::FALSE
}

struct QueueFamilyPicks {
    graphics: u32,
    present: u32,
    transfer: u32,
    compute: u32,
}

fn pick_queue_families(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    physical: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Option<QueueFamilyPicks> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical) };
    let find = |flags: vk::QueueFlags| -> Option<u32> {
        families
            .iter()
            .position(|f| f.queue_flags.contains(flags))
            .map(|it| it as u32)
    };
    let present = families.iter().enumerate().find_map(|(it, _)| {
        let supported = unsafe {
            surface_loader
                .get_physical_device_surface_support(physical, it as u32, surface)
                .unwrap_or(false)
        };
        supported.then_some(it as u32)
    })?;
    Some(QueueFamilyPicks {
        graphics: find(vk::QueueFlags::GRAPHICS)?,
        present,
        transfer: find(vk::QueueFlags::TRANSFER)?,
        compute: find(vk::QueueFlags::COMPUTE)?,
    })
}

fn rate_physical_device(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    physical: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Option<(f32, vk::PhysicalDeviceFeatures)> {
    pick_queue_families(instance, surface_loader, physical, surface)?;

    let extensions = unsafe {
        instance
            .enumerate_device_extension_properties(physical)
            .ok()?
    };
    let has_swapchain = extensions.iter().any(|ext| {
        let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
        name == khr::Swapchain::name()
    });
    if !has_swapchain {
        return None;
    }

    let formats = unsafe {
        surface_loader
            .get_physical_device_surface_formats(physical, surface)
            .ok()?
    };
    let present_modes = unsafe {
        surface_loader
            .get_physical_device_surface_present_modes(physical, surface)
            .ok()?
    };
    if formats.is_empty() || present_modes.is_empty() {
        return None;
    }

    let supported = unsafe { instance.get_physical_device_features(physical) };
    let mut features = vk::PhysicalDeviceFeatures::default();
    let mut rating = 1.0;
    if supported.sampler_anisotropy != 0 {
        features.sampler_anisotropy = vk::TRUE;
        rating += 1.0;
    }
    let properties = unsafe { instance.get_physical_device_properties(physical) };
    if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        rating += 2.0;
    }
    Some((rating, features))
}

fn pick_depth_stencil_format(
    instance: &ash::Instance,
    physical: vk::PhysicalDevice,
) -> (vk::Format, bool) {
    // highest precision first; the first three carry a stencil aspect
    let candidates = [
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D24_UNORM_S8_UINT,
        vk::Format::D16_UNORM_S8_UINT,
        vk::Format::D32_SFLOAT,
        vk::Format::D16_UNORM,
    ];
    for (it, &format) in candidates.iter().enumerate() {
        let props = unsafe { instance.get_physical_device_format_properties(physical, format) };
        if props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return (format, it < 3);
        }
    }
    panic!("no depth-stencil format supports DEPTH_STENCIL_ATTACHMENT");
}

impl Device {
    pub fn new(info: &DeviceInfo) -> Device {
        let host_allocs = HostAllocationTable::new();

        let entry = unsafe { ash::Entry::load().expect("failed to load the vulkan loader") };
        let app_name = info
            .config
            .get::<String>("gfx.application_name")
            .unwrap_or_else(|_| "kiln".to_string());
        let app_name = CString::new(app_name).expect("application name contains a NUL byte");
        let validation = info
            .config
            .get::<bool>("gfx.vulkan_validation")
            .unwrap_or(false);

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&app_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extension_names: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(info.display_handle)
                .expect("no surface extensions for this display")
                .to_vec();
        if validation {
            extension_names.push(DebugUtils::name().as_ptr());
        }
        let layer_names: Vec<CString> = if validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            Vec::new()
        };
        let layer_name_ptrs: Vec<*const c_char> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_name_ptrs);
        let instance = unsafe {
            entry
                .create_instance(&instance_info, Some(host_allocs.callbacks()))
                .expect("vkCreateInstance failed")
        };

        let debug_utils = if validation {
            let loader = DebugUtils::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            let messenger = unsafe {
                loader
                    .create_debug_utils_messenger(&messenger_info, None)
                    .expect("vkCreateDebugUtilsMessengerEXT failed")
            };
            Some((loader, messenger))
        } else {
            None
        };

        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                info.display_handle,
                info.window_handle,
                None,
            )
            .expect("vkCreateSurfaceKHR failed")
        };
        let surface_loader = khr::Surface::new(&entry, &instance);

        // rate and pick a physical device
        let physical_devices = unsafe {
            instance
                .enumerate_physical_devices()
                .expect("vkEnumeratePhysicalDevices failed")
        };
        let mut best: Option<(f32, vk::PhysicalDevice, vk::PhysicalDeviceFeatures)> = None;
        for &candidate in &physical_devices {
            if let Some((rating, features)) =
                rate_physical_device(&instance, &surface_loader, candidate, surface)
            {
                if best.map_or(true, |(best_rating, _, _)| rating > best_rating) {
                    best = Some((rating, candidate, features));
                }
            }
        }
        let (_, physical, enabled_features) =
            best.expect("no physical device is suitable for rendering");
        let properties = unsafe { instance.get_physical_device_properties(physical) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        info!("physical device: {}", device_name.to_string_lossy());

        let picks = pick_queue_families(&instance, &surface_loader, physical, surface)
            .expect("queue families disappeared after rating");
        let mut unique_families: Vec<u32> = vec![picks.graphics];
        for family in [picks.present, picks.transfer, picks.compute] {
            if !unique_families.contains(&family) {
                unique_families.push(family);
            }
        }
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let device_extensions = [khr::Swapchain::name().as_ptr()];
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_extensions)
            .enabled_features(&enabled_features);
        let device = unsafe {
            instance
                .create_device(physical, &device_info, Some(host_allocs.callbacks()))
                .expect("vkCreateDevice failed")
        };

        let mut queues = Vec::with_capacity(unique_families.len());
        for &family in &unique_families {
            let mut flags = QueueUsage::empty();
            if family == picks.graphics {
                flags |= QueueUsage::GRAPHICS;
            }
            if family == picks.present {
                flags |= QueueUsage::PRESENT;
            }
            if family == picks.transfer {
                flags |= QueueUsage::TRANSFER;
            }
            if family == picks.compute {
                flags |= QueueUsage::COMPUTE;
            }
            let handle = unsafe { device.get_device_queue(family, 0) };
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);
            let command_pool = unsafe {
                device
                    .create_command_pool(&pool_info, Some(host_allocs.callbacks()))
                    .expect("vkCreateCommandPool failed")
            };
            queues.push(CommandQueue {
                flags,
                family_index: family,
                handle,
                command_pool,
            });
        }

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical) };
        let (depth_stencil_format, has_stencil) = pick_depth_stencil_format(&instance, physical);
        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        Device {
            _entry: entry,
            instance,
            debug_utils,
            surface_loader,
            swapchain_loader,
            surface,
            physical,
            device,
            queues,
            properties,
            memory_properties,
            enabled_features,
            depth_stencil_format,
            has_stencil,
            host_allocs,
            swap_chain: None,
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn callbacks(&self) -> Option<&vk::AllocationCallbacks> {
        Some(self.host_allocs.callbacks())
    }

    /// First queue serving any of the requested usages.
    pub fn queue(&self, usage: QueueUsage) -> &CommandQueue {
        self.queues
            .iter()
            .find(|queue| queue.flags.intersects(usage))
            .expect("no queue supports the requested usage")
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.enabled_features
    }

    pub fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    pub fn depth_stencil_format(&self) -> vk::Format {
        self.depth_stencil_format
    }

    pub fn has_stencil(&self) -> bool {
        self.has_stencil
    }

    pub fn supported_framebuffer_sample_counts(&self) -> vk::SampleCountFlags {
        let limits = &self.properties.limits;
        limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts
    }

    pub fn swap_chain(&self) -> &SwapChain {
        self.swap_chain.as_ref().expect("swap chain is not created")
    }

    pub fn swap_chain_texture(&self, image_index: u32) -> Handle<Texture> {
        self.swap_chain().textures[image_index as usize]
    }

    pub fn wait_idle(&self) {
        unsafe {
            self.device
                .device_wait_idle()
                .expect("vkDeviceWaitIdle failed");
        }
    }

    pub fn create_swap_chain(&mut self, mem: &mut MemoryManager, window_extent: (u32, u32)) {
        assert!(self.swap_chain.is_none());
        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical, self.surface)
                .expect("vkGetPhysicalDeviceSurfaceCapabilitiesKHR failed")
        };
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical, self.surface)
                .expect("vkGetPhysicalDeviceSurfaceFormatsKHR failed")
        };
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical, self.surface)
                .expect("vkGetPhysicalDeviceSurfacePresentModesKHR failed")
        };

        let surface_format = formats
            .iter()
            .copied()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .unwrap_or(formats[0]);
        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO);
        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: window_extent.0.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: window_extent.1.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };
        // max_image_count == 0 means no upper bound
        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count != 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let graphics_family = self.queue(QueueUsage::GRAPHICS).family_index;
        let present_family = self.queue(QueueUsage::PRESENT).family_index;
        let family_indices = [graphics_family, present_family];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        create_info = if graphics_family == present_family {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };
        let handle = unsafe {
            self.swapchain_loader
                .create_swapchain(&create_info, Some(self.host_allocs.callbacks()))
                .expect("vkCreateSwapchainKHR failed")
        };

        let images = unsafe {
            self.swapchain_loader
                .get_swapchain_images(handle)
                .expect("vkGetSwapchainImagesKHR failed")
        };
        assert!(images.len() <= MAX_SWAP_CHAIN_IMAGES);
        let mut views = Vec::with_capacity(images.len());
        let mut textures = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe {
                self.device
                    .create_image_view(&view_info, Some(self.host_allocs.callbacks()))
                    .expect("vkCreateImageView failed")
            };
            views.push(view);
            let texture = Texture::from_swap_chain(extent, surface_format.format, image, view);
            textures.push(mem.pools.textures.take(texture));
        }
        debug!(
            "swap chain: {} images, {:?}, {}x{}",
            images.len(),
            surface_format.format,
            extent.width,
            extent.height
        );

        self.swap_chain = Some(SwapChain {
            handle,
            surface_format,
            extent,
            views,
            textures,
        });
    }

    pub fn destroy_swap_chain(&mut self, mem: &mut MemoryManager) {
        let swap_chain = self.swap_chain.take().expect("swap chain is not created");
        for handle in swap_chain.textures {
            // swap-chain textures own neither image nor view
            mem.pools.textures.release(handle);
        }
        unsafe {
            for view in swap_chain.views {
                self.device
                    .destroy_image_view(view, Some(self.host_allocs.callbacks()));
            }
            self.swapchain_loader
                .destroy_swapchain(swap_chain.handle, Some(self.host_allocs.callbacks()));
        }
    }

    /// Final teardown; everything that uses the device must be gone. The
    /// struct is unusable afterwards.
    pub fn destroy(&mut self) {
        unsafe {
            for queue in &self.queues {
                self.device
                    .destroy_command_pool(queue.command_pool, Some(self.host_allocs.callbacks()));
            }
            self.device
                .destroy_device(Some(self.host_allocs.callbacks()));
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance
                .destroy_instance(Some(self.host_allocs.callbacks()));
        }
    }
}
