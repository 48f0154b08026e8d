use std::env;

use log::*;

use crate::vulkan::constants;

/// Runtime knobs of the backend. `Default` mirrors the compile-time constants.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub application_name: String,
    /// Enables the Khronos validation layer and the debug messenger.
    pub validation: bool,
    /// Restricts device selection to devices whose name contains this string,
    /// when at least one does.
    pub preferred_device: Option<String>,
    pub command_buffer_count: usize,
    pub timer_query_capacity: u32,
    /// Frames a cached render pass or framebuffer may go unused before eviction.
    pub framebuffer_eviction_frames: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            application_name: String::from("Alaska"),
            validation: constants::VALIDATION_ENABLED,
            preferred_device: None,
            command_buffer_count: constants::COMMAND_BUFFER_COUNT,
            timer_query_capacity: constants::TIMER_QUERY_CAPACITY,
            framebuffer_eviction_frames: constants::FRAMEBUFFER_EVICTION_FRAMES,
        }
    }
}

impl BackendConfig {
    /// Defaults overridden by `ALASKA_VALIDATION` and `ALASKA_DEVICE`.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup("ALASKA_VALIDATION") {
            match parse_flag(&value) {
                Some(flag) => self.validation = flag,
                None => warn!("Ignoring ALASKA_VALIDATION=`{}`.", value),
            }
        }
        if let Some(name) = lookup("ALASKA_DEVICE") {
            if !name.is_empty() {
                self.preferred_device = Some(name);
            }
        }
        self
    }

    /// The query bitset is 32 bits wide.
    pub fn timer_query_capacity(&self) -> u32 {
        self.timer_query_capacity.clamp(1, constants::MAX_TIMER_QUERY_CAPACITY)
    }

    pub fn command_buffer_count(&self) -> usize {
        self.command_buffer_count.max(1)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let config = BackendConfig::default().with_overrides(|key| match key {
            "ALASKA_VALIDATION" => Some("off".to_string()),
            "ALASKA_DEVICE" => Some("Radeon".to_string()),
            _ => None,
        });
        assert!(!config.validation);
        assert_eq!(config.preferred_device.as_deref(), Some("Radeon"));
        assert_eq!(config.command_buffer_count, constants::COMMAND_BUFFER_COUNT);
    }

    #[test]
    fn malformed_flag_keeps_default() {
        let config = BackendConfig::default().with_overrides(|key| {
            (key == "ALASKA_VALIDATION").then(|| "maybe".to_string())
        });
        assert_eq!(config.validation, constants::VALIDATION_ENABLED);
    }

    #[test]
    fn timer_capacity_is_clamped_to_bitset_width() {
        let config = BackendConfig {
            timer_query_capacity: 100,
            ..Default::default()
        };
        assert_eq!(config.timer_query_capacity(), 32);
    }
}
