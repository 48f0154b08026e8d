use vulkanalia::vk;

/// Returns the first candidate whose features for `tiling` contain `features`,
/// or `vk::Format::UNDEFINED`. Candidate order is the caller's preference.
pub fn find_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> vk::Format {
    candidates
        .iter()
        .copied()
        .find(|format| {
            let props = properties(*format);
            let supported = match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features,
                vk::ImageTiling::OPTIMAL => props.optimal_tiling_features,
                _ => vk::FormatFeatureFlags::empty(),
            };
            supported.contains(features)
        })
        .unwrap_or(vk::Format::UNDEFINED)
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Every aspect an image of `format` exposes.
pub fn format_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    let mut aspects = vk::ImageAspectFlags::empty();
    if is_depth_format(format) {
        aspects |= vk::ImageAspectFlags::DEPTH;
    }
    if has_stencil(format) {
        aspects |= vk::ImageAspectFlags::STENCIL;
    }
    if aspects.is_empty() && format != vk::Format::UNDEFINED {
        aspects = vk::ImageAspectFlags::COLOR;
    }
    aspects
}

/// Bytes per texel for the uncompressed formats the backend uploads.
pub fn texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8_UNORM => Some(1),
        vk::Format::R8G8_UNORM => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimal(features: vk::FormatFeatureFlags) -> vk::FormatProperties {
        vk::FormatProperties {
            optimal_tiling_features: features,
            ..Default::default()
        }
    }

    #[test]
    fn first_supported_candidate_wins() {
        let properties = |format| match format {
            vk::Format::D32_SFLOAT => optimal(vk::FormatFeatureFlags::SAMPLED_IMAGE),
            vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D16_UNORM => {
                optimal(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            }
            _ => vk::FormatProperties::default(),
        };
        let format = find_supported_format(
            &[
                vk::Format::D32_SFLOAT,
                vk::Format::X8_D24_UNORM_PACK32,
                vk::Format::D16_UNORM,
            ],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            properties,
        );
        assert_eq!(format, vk::Format::X8_D24_UNORM_PACK32);
    }

    #[test]
    fn tiling_selects_the_feature_set() {
        let properties = |_| optimal(vk::FormatFeatureFlags::COLOR_ATTACHMENT);
        let format = find_supported_format(
            &[vk::Format::R8G8B8A8_UNORM],
            vk::ImageTiling::LINEAR,
            vk::FormatFeatureFlags::COLOR_ATTACHMENT,
            properties,
        );
        assert_eq!(format, vk::Format::UNDEFINED);
    }

    #[test]
    fn no_candidate_yields_undefined() {
        let format = find_supported_format(
            &[vk::Format::D32_SFLOAT],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| vk::FormatProperties::default(),
        );
        assert_eq!(format, vk::Format::UNDEFINED);
    }

    #[test]
    fn aspects_follow_format_class() {
        assert_eq!(
            format_aspects(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_aspects(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            format_aspects(vk::Format::S8_UINT),
            vk::ImageAspectFlags::STENCIL
        );
    }
}
