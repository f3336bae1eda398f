// Vulkan Device Context - core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation from raw window handles
// - Physical device selection (prefer discrete GPU)
// - Graphics/present queue family resolution
// - Logical device + queue creation
// - Synchronous one-shot command execution

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::command::CommandManager;

/// Vulkan device wrapper with automatic cleanup.
///
/// The logical device outlives every other GPU object: components hold an
/// `Arc<DeviceContext>` and the context drops last.
pub struct DeviceContext {
    // Vulkan handles (order matters for drop!)
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::extensions::khr::Surface,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles; family indices are resolved once and never change
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceContext {
    /// Create the device context for a presentation surface.
    ///
    /// Fails before constructing anything observable if no device exposes a
    /// graphics family and a family able to present to the surface.
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device context: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, display_handle, app_name, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        let surface = Self::create_surface(&entry, &instance, display_handle, window_handle)?;

        let (physical_device, graphics_queue_family, present_queue_family) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let (device, graphics_queue, present_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            present_queue_family,
        )?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={}, present={}",
            graphics_queue_family,
            present_queue_family
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            surface,
            surface_loader,
            instance,
            _entry: entry,
            graphics_queue,
            present_queue,
            graphics_queue_family,
            present_queue_family,
            debug_utils,
            properties,
            memory_properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        display_handle: RawDisplayHandle,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("ember")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Surface extensions for this platform, plus debug utils if validating
        let mut extensions = Self::surface_extension_names(display_handle)?;
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    /// Instance extensions needed to present to this display system.
    fn surface_extension_names(
        display_handle: RawDisplayHandle,
    ) -> Result<Vec<*const std::ffi::c_char>> {
        use ash::extensions::khr;

        let wsi_extension = match display_handle {
            RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
            RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
            RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
            RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
            other => anyhow::bail!("Unsupported display system: {:?}", other),
        };

        Ok(vec![khr::Surface::name().as_ptr(), wsi_extension.as_ptr()])
    }

    fn create_surface(
        entry: &Entry,
        instance: &ash::Instance,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<vk::SurfaceKHR> {
        use ash::extensions::khr;

        let surface = match (display_handle, window_handle) {
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
                let dpy = display
                    .display
                    .map(|d| d.as_ptr())
                    .unwrap_or(std::ptr::null_mut());
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy.cast())
                    .window(window.window);
                let loader = khr::XlibSurface::new(entry, instance);
                unsafe { loader.create_xlib_surface(&create_info, None) }
            }
            (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
                let connection = display
                    .connection
                    .map(|c| c.as_ptr())
                    .unwrap_or(std::ptr::null_mut());
                let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                    .connection(connection.cast())
                    .window(window.window.get());
                let loader = khr::XcbSurface::new(entry, instance);
                unsafe { loader.create_xcb_surface(&create_info, None) }
            }
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr().cast())
                    .surface(window.surface.as_ptr().cast());
                let loader = khr::WaylandSurface::new(entry, instance);
                unsafe { loader.create_wayland_surface(&create_info, None) }
            }
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
                let hinstance = window.hinstance.map(|h| h.get()).unwrap_or(0)
                    as *const std::ffi::c_void;
                let hwnd = window.hwnd.get() as *const std::ffi::c_void;
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance)
                    .hwnd(hwnd);
                let loader = khr::Win32Surface::new(entry, instance);
                unsafe { loader.create_win32_surface(&create_info, None) }
            }
            _ => anyhow::bail!("Unsupported window handle type"),
        };

        surface.context("Failed to create presentation surface")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Prefer a discrete GPU; any enumerated device with suitable queue
    /// families is an acceptable fallback.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best: Option<(vk::PhysicalDevice, u32, u32)> = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            let Some((graphics_family, present_family)) =
                Self::find_queue_families(instance, surface_loader, surface, device)?
            else {
                continue;
            };

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best = Some((device, graphics_family, present_family));
            }
        }

        best.ok_or_else(|| {
            anyhow::anyhow!("No GPU with graphics and presentation support found")
        })
    }

    /// One family supporting graphics and one able to present to the
    /// surface; they may coincide.
    fn find_queue_families(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<Option<(u32, u32)>> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics = None;
        let mut present = None;

        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;

            if graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                graphics = Some(index);
            }

            if present.is_none() {
                let supported = unsafe {
                    surface_loader.get_physical_device_surface_support(device, index, surface)
                }?;
                if supported {
                    present = Some(index);
                }
            }

            if let (Some(g), Some(p)) = (graphics, present) {
                return Ok(Some((g, p)));
            }
        }

        Ok(None)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        present_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];

        let mut unique_families = vec![graphics_queue_family];
        if present_queue_family != graphics_queue_family {
            unique_families.push(present_queue_family);
        }

        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = vec![ash::extensions::khr::Swapchain::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    /// Synchronous escape hatch for setup-time transfers: record into a
    /// one-shot command buffer, submit, and block until the queue is idle.
    /// Throughput does not matter here; correctness and simplicity do.
    pub fn execute<F>(&self, commands: &mut CommandManager, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let id = commands.allocate_buffer()?;
        let cmd = commands.buffer(id)?;

        commands.begin(cmd)?;
        record(cmd);
        commands.end(cmd)?;
        commands.submit(self.graphics_queue, cmd)?;

        unsafe { self.device.queue_wait_idle(self.graphics_queue) }
            .context("Queue wait failed after one-shot submit")?;

        commands.free_buffer(id)?;
        Ok(())
    }

    /// Wait for the device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying device context...");

        let _ = self.wait_idle();

        // Cleanup in reverse order of creation
        unsafe {
            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
