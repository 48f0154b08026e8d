use std::collections::HashSet;

use anyhow::{anyhow, Result};
use log::*;
use thiserror::Error;
use vulkanalia::prelude::v1_0::*;

use super::constants;
use super::instance::VulkanInstance;
use crate::config::BackendConfig;
use crate::error::BackendError;

#[derive(Debug, Error)]
#[error("Missing {0}.")]
pub struct SuitabilityError(pub &'static str);

/// What selection needs to know about one enumerated device.
#[derive(Clone, Debug)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub graphics_family: Option<u32>,
}

impl PhysicalDeviceInfo {
    fn check(&self) -> Result<u32, SuitabilityError> {
        if vk::version_major(self.api_version) < 1 {
            return Err(SuitabilityError("Vulkan 1.0 support"));
        }
        self.graphics_family
            .ok_or(SuitabilityError("graphics queue family"))
    }
}

/// Higher is preferred.
pub fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// Index of the device to use: suitable devices only, restricted to names
/// containing `preferred` when any does, best type first, enumeration order
/// breaking ties.
pub fn choose_physical_device(
    candidates: &[PhysicalDeviceInfo],
    preferred: Option<&str>,
) -> Option<usize> {
    let suitable = candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| match candidate.check() {
            Ok(_) => true,
            Err(error) => {
                warn!("Skipping physical device (`{}`): {}", candidate.name, error);
                false
            }
        })
        .collect::<Vec<_>>();

    let named = preferred
        .map(|name| {
            suitable
                .iter()
                .filter(|(_, c)| c.name.contains(name))
                .copied()
                .collect::<Vec<_>>()
        })
        .filter(|named| !named.is_empty());
    if preferred.is_some() && named.is_none() {
        warn!("No device matches `{}`; ignoring preference.", preferred.unwrap_or_default());
    }
    let pool = named.unwrap_or(suitable);

    // max_by_key keeps the last maximum, so rank by (type, reverse position).
    pool.iter()
        .max_by_key(|(i, c)| (device_type_rank(c.device_type), usize::MAX - *i))
        .map(|(i, _)| *i)
}

/// Optional features resolved at device creation. Absent ones stay `false`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub debug_markers: bool,
    pub debug_utils: bool,
    pub portability_subset: bool,
    pub maintenance: [bool; 3],
}

impl DeviceCapabilities {
    pub fn resolve(available: &HashSet<vk::ExtensionName>, debug_utils: bool) -> Self {
        let has = |extension: vk::Extension| available.contains(&extension.name);
        Self {
            debug_markers: has(vk::EXT_DEBUG_MARKER_EXTENSION),
            debug_utils,
            portability_subset: has(vk::KHR_PORTABILITY_SUBSET_EXTENSION),
            maintenance: [
                has(vk::KHR_MAINTENANCE1_EXTENSION),
                has(vk::KHR_MAINTENANCE2_EXTENSION),
                has(vk::KHR_MAINTENANCE3_EXTENSION),
            ],
        }
    }

    /// Device extensions to enable for these capabilities.
    pub fn extensions(&self) -> Vec<vk::ExtensionName> {
        let mut extensions = Vec::new();
        if self.debug_markers {
            extensions.push(vk::EXT_DEBUG_MARKER_EXTENSION.name);
        }
        // Must be enabled whenever the device exposes it.
        if self.portability_subset {
            extensions.push(vk::KHR_PORTABILITY_SUBSET_EXTENSION.name);
        }
        let maintenance = [
            vk::KHR_MAINTENANCE1_EXTENSION.name,
            vk::KHR_MAINTENANCE2_EXTENSION.name,
            vk::KHR_MAINTENANCE3_EXTENSION.name,
        ];
        for (supported, name) in self.maintenance.iter().zip(maintenance) {
            if *supported {
                extensions.push(name);
            }
        }
        extensions
    }
}

/// The chosen physical device and the properties queried once for it.
#[derive(Copy, Clone, Debug)]
pub struct SelectedDevice {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub graphics_family: u32,
}

/// The logical device. Destroyed on drop.
#[derive(Debug)]
pub struct VulkanDevice {
    pub vk_device: Device,
}

impl VulkanDevice {
    pub unsafe fn select_physical_device(
        instance: &VulkanInstance,
        config: &BackendConfig,
    ) -> Result<SelectedDevice> {
        let candidates = instance
            .vk_instance
            .enumerate_physical_devices()?
            .into_iter()
            .map(|physical_device| describe(instance, physical_device))
            .collect::<Vec<_>>();

        let index = choose_physical_device(&candidates, config.preferred_device.as_deref())
            .ok_or(BackendError::NoSuitableDevice)?;
        let chosen = &candidates[index];
        let graphics_family = chosen
            .graphics_family
            .ok_or_else(|| anyhow!(SuitabilityError("graphics queue family")))?;

        let properties = instance
            .vk_instance
            .get_physical_device_properties(chosen.handle);
        info!(
            "Selected physical device (`{}`, {:?}).",
            chosen.name, chosen.device_type
        );

        Ok(SelectedDevice {
            handle: chosen.handle,
            properties,
            features: instance
                .vk_instance
                .get_physical_device_features(chosen.handle),
            memory_properties: instance
                .vk_instance
                .get_physical_device_memory_properties(chosen.handle),
            graphics_family,
        })
    }

    /// Opens the device with one graphics queue and every optional extension
    /// the device offers.
    pub unsafe fn create_logical_device(
        instance: &VulkanInstance,
        selected: &SelectedDevice,
    ) -> Result<(VulkanDevice, vk::Queue, DeviceCapabilities)> {
        let available = instance
            .vk_instance
            .enumerate_device_extension_properties(selected.handle, None)?
            .iter()
            .map(|e| e.extension_name)
            .collect::<HashSet<_>>();
        let capabilities =
            DeviceCapabilities::resolve(&available, instance.debug_utils_supported());

        let queue_priorities = &[1.0];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(selected.graphics_family)
            .queue_priorities(queue_priorities);

        let layers = if instance.validation_enabled() {
            vec![constants::VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Only what the device offers; portability_subset included.
        let extension_names = capabilities.extensions();
        let extensions = extension_names
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();

        let features = vk::PhysicalDeviceFeatures::builder();

        let queue_infos = &[queue_info];
        let info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(queue_infos)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = instance
            .vk_instance
            .create_device(selected.handle, &info, None)?;
        let queue = device.get_device_queue(selected.graphics_family, 0);

        info!("Device capabilities: {:?}", capabilities);

        Ok((VulkanDevice { vk_device: device }, queue, capabilities))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            self.vk_device.destroy_device(None);
        }
    }
}

unsafe fn describe(
    instance: &VulkanInstance,
    physical_device: vk::PhysicalDevice,
) -> PhysicalDeviceInfo {
    let properties = instance
        .vk_instance
        .get_physical_device_properties(physical_device);
    PhysicalDeviceInfo {
        handle: physical_device,
        name: properties.device_name.to_string(),
        device_type: properties.device_type,
        api_version: properties.api_version,
        graphics_family: QueueFamilyIndices::get(instance, physical_device)
            .ok()
            .map(|indices| indices.graphics),
    }
}

#[derive(Copy, Clone, Debug)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
}

impl QueueFamilyIndices {
    pub unsafe fn get(
        instance: &VulkanInstance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let properties = instance
            .vk_instance
            .get_physical_device_queue_family_properties(physical_device);

        let graphics = properties
            .iter()
            .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32);

        if let Some(graphics) = graphics {
            Ok(Self { graphics })
        } else {
            Err(anyhow!(SuitabilityError("graphics queue family")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vulkanalia::vk::Handle;

    fn device(raw: usize, device_type: vk::PhysicalDeviceType, graphics: bool) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::from_raw(raw),
            name: format!("GPU {raw}"),
            device_type,
            api_version: vk::make_version(1, 2, 0),
            graphics_family: graphics.then_some(0),
        }
    }

    #[test]
    fn discrete_beats_integrated() {
        let candidates = [
            device(1, vk::PhysicalDeviceType::INTEGRATED_GPU, true),
            device(2, vk::PhysicalDeviceType::CPU, true),
            device(3, vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(choose_physical_device(&candidates, None), Some(2));
    }

    #[test]
    fn ties_keep_enumeration_order() {
        let candidates = [
            device(1, vk::PhysicalDeviceType::DISCRETE_GPU, true),
            device(2, vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(choose_physical_device(&candidates, None), Some(0));
    }

    #[test]
    fn devices_without_graphics_are_rejected() {
        let candidates = [
            device(1, vk::PhysicalDeviceType::DISCRETE_GPU, false),
            device(2, vk::PhysicalDeviceType::VIRTUAL_GPU, true),
        ];
        assert_eq!(choose_physical_device(&candidates, None), Some(1));

        let none = [device(1, vk::PhysicalDeviceType::DISCRETE_GPU, false)];
        assert_eq!(choose_physical_device(&none, None), None);
        assert_eq!(choose_physical_device(&[], None), None);
    }

    #[test]
    fn preferred_name_narrows_unless_nothing_matches() {
        let candidates = [
            device(1, vk::PhysicalDeviceType::DISCRETE_GPU, true),
            device(2, vk::PhysicalDeviceType::INTEGRATED_GPU, true),
        ];
        assert_eq!(choose_physical_device(&candidates, Some("GPU 2")), Some(1));
        assert_eq!(choose_physical_device(&candidates, Some("Nothing")), Some(0));
    }

    #[test]
    fn capabilities_degrade_to_false() {
        let available = [
            vk::EXT_DEBUG_MARKER_EXTENSION.name,
            vk::KHR_MAINTENANCE2_EXTENSION.name,
        ]
        .into_iter()
        .collect::<HashSet<_>>();

        let capabilities = DeviceCapabilities::resolve(&available, false);
        assert!(capabilities.debug_markers);
        assert!(!capabilities.debug_utils);
        assert!(!capabilities.portability_subset);
        assert_eq!(capabilities.maintenance, [false, true, false]);
        assert_eq!(
            capabilities.extensions(),
            vec![
                vk::EXT_DEBUG_MARKER_EXTENSION.name,
                vk::KHR_MAINTENANCE2_EXTENSION.name
            ]
        );

        let none = DeviceCapabilities::resolve(&HashSet::new(), true);
        assert_eq!(
            none,
            DeviceCapabilities {
                debug_utils: true,
                ..Default::default()
            }
        );
        assert!(none.extensions().is_empty());
    }

    #[test]
    fn portability_subset_is_enabled_only_when_offered() {
        let without = DeviceCapabilities::resolve(&HashSet::new(), false);
        assert!(!without
            .extensions()
            .contains(&vk::KHR_PORTABILITY_SUBSET_EXTENSION.name));

        let offered = [vk::KHR_PORTABILITY_SUBSET_EXTENSION.name]
            .into_iter()
            .collect::<HashSet<_>>();
        let with = DeviceCapabilities::resolve(&offered, false);
        assert!(with.portability_subset);
        assert_eq!(with.extensions(), vec![vk::KHR_PORTABILITY_SUBSET_EXTENSION.name]);
    }
}
