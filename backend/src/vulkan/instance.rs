use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::c_void;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::{ExtDebugUtilsExtension, KhrSurfaceExtension};
use vulkanalia::window as vk_window;
use winit::window::Window;

use super::constants;
use crate::config::BackendConfig;

/// The instance and its debug messenger. Destroyed on drop.
#[derive(Debug)]
pub struct VulkanInstance {
    pub vk_instance: Instance,
    messenger: Option<vk::DebugUtilsMessengerEXT>,
    validation: bool,
    debug_utils: bool,
}

impl VulkanInstance {
    /// Creates the instance. With a window, the surface extensions it needs
    /// are enabled too.
    pub unsafe fn new(
        window: Option<&Window>,
        entry: &Entry,
        config: &BackendConfig,
    ) -> Result<VulkanInstance> {
        let application_name = CString::new(config.application_name.as_str())?;
        let application_info = vk::ApplicationInfo::builder()
            .application_name(application_name.as_bytes_with_nul())
            .application_version(vk::make_version(1, 0, 0))
            .engine_name(b"Alaska\0")
            .engine_version(vk::make_version(1, 0, 0))
            .api_version(vk::make_version(1, 0, 0));

        // Layers
        let available_layers = entry
            .enumerate_instance_layer_properties()?
            .iter()
            .map(|l| l.layer_name)
            .collect::<HashSet<_>>();

        let validation =
            config.validation && available_layers.contains(&constants::VALIDATION_LAYER);
        if config.validation && !validation {
            warn!("Validation layer requested but not installed; continuing without it.");
        }

        let layers = if validation {
            vec![constants::VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        // Extensions
        let available_extensions = entry
            .enumerate_instance_extension_properties(None)?
            .iter()
            .map(|e| e.extension_name)
            .collect::<HashSet<_>>();

        let mut extensions = match window {
            Some(window) => vk_window::get_required_instance_extensions(window)
                .iter()
                .map(|e| e.as_ptr())
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };

        // Required by Vulkan SDK on macOS since 1.3.216.
        let flags = if cfg!(target_os = "macos")
            && entry.version()? >= constants::PORTABILITY_MACOS_VERSION
        {
            info!("Enabling extensions for macOS portability.");
            extensions.push(
                vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_EXTENSION
                    .name
                    .as_ptr(),
            );
            extensions.push(vk::KHR_PORTABILITY_ENUMERATION_EXTENSION.name.as_ptr());
            vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
        } else {
            vk::InstanceCreateFlags::empty()
        };

        let debug_utils = available_extensions.contains(&vk::EXT_DEBUG_UTILS_EXTENSION.name);
        if debug_utils {
            extensions.push(vk::EXT_DEBUG_UTILS_EXTENSION.name.as_ptr());
        } else {
            info!("VK_EXT_debug_utils unavailable; labels and messenger disabled.");
        }

        // Create
        let mut info = vk::InstanceCreateInfo::builder()
            .application_info(&application_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions)
            .flags(flags);

        let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::all())
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .user_callback(Some(debug_callback));

        let messenger_enabled = validation && debug_utils;
        if messenger_enabled {
            info = info.push_next(&mut debug_info);
        }

        let instance = entry.create_instance(&info, None)?;

        // Messenger
        let messenger = if messenger_enabled {
            match instance.create_debug_utils_messenger_ext(&debug_info, None) {
                Ok(messenger) => Some(messenger),
                Err(error) => {
                    instance.destroy_instance(None);
                    return Err(anyhow!("Failed to create debug messenger: {}", error));
                }
            }
        } else {
            None
        };

        info!(
            "Created Vulkan instance (validation: {}, debug utils: {}).",
            validation, debug_utils
        );

        Ok(VulkanInstance {
            vk_instance: instance,
            messenger,
            validation,
            debug_utils,
        })
    }

    /// Whether the validation layer was actually enabled.
    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    pub fn debug_utils_supported(&self) -> bool {
        self.debug_utils
    }

    pub unsafe fn create_surface(&self, window: &Window) -> Result<vk::SurfaceKHR> {
        Ok(vk_window::create_surface(&self.vk_instance, window, window)?)
    }

    pub unsafe fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.vk_instance.destroy_surface_khr(surface, None);
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some(messenger) = self.messenger.take() {
                self.vk_instance
                    .destroy_debug_utils_messenger_ext(messenger, None);
            }
            self.vk_instance.destroy_instance(None);
        }
    }
}

/// Validation severities mapped onto `log` levels. Info messages are chatty
/// enough to live at debug.
fn message_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Level {
    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        Level::Error
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        Level::Warn
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        Level::Debug
    } else {
        Level::Trace
    }
}

extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    let data = unsafe { *data };
    let message = unsafe { CStr::from_ptr(data.message) }.to_string_lossy();
    log!(message_level(severity), "({:?}) {}", type_, message);
    vk::FALSE
}
