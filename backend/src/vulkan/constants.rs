use vulkanalia::{vk, Version};

pub const PORTABILITY_MACOS_VERSION: Version = Version::new(1, 3, 216);
pub const VALIDATION_ENABLED: bool = cfg!(debug_assertions);
pub const VALIDATION_LAYER: vk::ExtensionName =
    vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");

pub const COMMAND_BUFFER_COUNT: usize = 3;

pub const TIMER_QUERY_CAPACITY: u32 = 16;
pub const MAX_TIMER_QUERY_CAPACITY: u32 = 32;

pub const FRAMEBUFFER_EVICTION_FRAMES: u64 = 10;

pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 2] =
    [vk::Format::D32_SFLOAT, vk::Format::X8_D24_UNORM_PACK32];

pub const EMPTY_TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
