use thiserror::Error;
use vulkanalia::vk;

/// Errors reported by the backend.
///
/// Initialisation paths wrap these in `anyhow` and abort; per-frame recording
/// paths return them directly so the caller can react to the
/// caller-correctable ones.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("No physical device with a graphics queue family was found.")]
    NoSuitableDevice,
    #[error("No memory type matches bits {type_bits:#x} with properties {required:?}.")]
    NoMatchingMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },
    #[error("The logical device was lost.")]
    DeviceLost,

    #[error("Format {format:?} has no {aspect:?} aspect.")]
    UnsupportedAspect {
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    },
    #[error("A render pass is already active.")]
    RenderPassAlreadyActive,
    #[error("No render pass is active.")]
    NoActiveRenderPass,
    #[error("All {count} subpasses of the active render pass were consumed.")]
    SubpassesExhausted { count: u32 },
    #[error("All {capacity} timer query slots are in use.")]
    QueryPoolExhausted { capacity: u32 },
    #[error("Attachment refers to a texture that no longer exists.")]
    StaleAttachment,
    #[error("Timer query has not been resolved by the GPU yet.")]
    QueryNotReady,

    #[error("Vulkan call failed: {0}")]
    Vulkan(vk::ErrorCode),
}

impl BackendError {
    /// Fatal errors require the whole context to be rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoSuitableDevice | Self::NoMatchingMemoryType { .. } | Self::DeviceLost
        )
    }
}

impl From<vk::ErrorCode> for BackendError {
    fn from(code: vk::ErrorCode) -> Self {
        if code == vk::ErrorCode::DEVICE_LOST {
            Self::DeviceLost
        } else {
            Self::Vulkan(code)
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
