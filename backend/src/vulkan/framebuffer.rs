use std::collections::HashMap;

use log::*;
use vulkanalia::prelude::v1_0::*;

use super::constants;
use super::disposer::{Disposer, Resource};
use super::image::VulkanAttachment;
use crate::error::BackendResult;

/// Color attachments, an optional depth attachment and the area they cover.
#[derive(Clone, Debug)]
pub struct VulkanRenderTarget {
    colors: Vec<VulkanAttachment>,
    depth: Option<VulkanAttachment>,
    extent: vk::Extent2D,
}

impl VulkanRenderTarget {
    pub fn new(
        mut colors: Vec<VulkanAttachment>,
        depth: Option<VulkanAttachment>,
        extent: vk::Extent2D,
    ) -> Self {
        if colors.len() > constants::MAX_COLOR_ATTACHMENTS {
            warn!(
                "Render target has {} color attachments, keeping the first {}.",
                colors.len(),
                constants::MAX_COLOR_ATTACHMENTS
            );
            colors.truncate(constants::MAX_COLOR_ATTACHMENTS);
        }
        Self {
            colors,
            depth,
            extent,
        }
    }

    pub fn colors(&self) -> &[VulkanAttachment] {
        &self.colors
    }

    pub fn depth(&self) -> Option<&VulkanAttachment> {
        self.depth.as_ref()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Color attachments first, then depth: the order of the render pass.
    pub fn attachments(&self) -> impl Iterator<Item = &VulkanAttachment> {
        self.colors.iter().chain(self.depth.iter())
    }

    pub fn identity(&self) -> BackendResult<Vec<(u64, u8, u16)>> {
        self.attachments()
            .map(|a| a.texture().map(|t| (t.id(), a.level, a.layer)))
            .collect()
    }
}

/// Texture ids are used rather than view handles since handles may be reused
/// once a texture is gone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<(u64, u8, u16)>,
    pub width: u32,
    pub height: u32,
}

impl FramebufferKey {
    pub fn new(render_pass: vk::RenderPass, target: &VulkanRenderTarget) -> BackendResult<Self> {
        Ok(Self {
            render_pass,
            attachments: target.identity()?,
            width: target.extent().width,
            height: target.extent().height,
        })
    }
}

#[derive(Copy, Clone, Debug)]
struct CachedFramebuffer {
    handle: vk::Framebuffer,
    last_used: u64,
}

#[derive(Debug, Default)]
pub struct FramebufferCache {
    entries: HashMap<FramebufferKey, CachedFramebuffer>,
}

impl FramebufferCache {
    pub fn get_or_create(
        &mut self,
        key: FramebufferKey,
        frame: u64,
        create: impl FnOnce(&FramebufferKey) -> BackendResult<vk::Framebuffer>,
    ) -> BackendResult<vk::Framebuffer> {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_used = frame;
            return Ok(entry.handle);
        }

        let handle = create(&key)?;
        trace!("Created framebuffer {}x{}.", key.width, key.height);
        self.entries.insert(
            key,
            CachedFramebuffer {
                handle,
                last_used: frame,
            },
        );
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn gc(&mut self, frame: u64, max_age: u64, disposer: &Disposer) {
        self.entries.retain(|key, entry| {
            let stale = frame.saturating_sub(entry.last_used) > max_age;
            if stale {
                trace!("Evicting framebuffer {}x{}.", key.width, key.height);
                disposer.retire(Resource::Framebuffer(entry.handle));
            }
            !stale
        });
    }

    pub fn clear(&mut self, disposer: &Disposer) {
        self.entries
            .drain()
            .for_each(|(_, entry)| disposer.retire(Resource::Framebuffer(entry.handle)));
    }
}

/// Creates the framebuffer for `target`, materialising one view per
/// attachment.
pub unsafe fn create_native_framebuffer(
    device: &Device,
    render_pass: vk::RenderPass,
    target: &VulkanRenderTarget,
) -> BackendResult<vk::Framebuffer> {
    let mut views = Vec::with_capacity(target.colors().len() + 1);
    for attachment in target.colors() {
        views.push(attachment.image_view(device, vk::ImageAspectFlags::COLOR)?);
    }
    if let Some(depth) = target.depth() {
        // Depth only, even for combined depth-stencil formats.
        views.push(depth.image_view(device, vk::ImageAspectFlags::DEPTH)?);
    }

    let create_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(&views)
        .width(target.extent().width)
        .height(target.extent().height)
        .layers(1);

    Ok(device.create_framebuffer(&create_info, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::image::tests::fake_texture;
    use vulkanalia::vk::Handle;

    #[test]
    fn key_tracks_texture_identity_not_handles() {
        let disposer = Disposer::new(1);
        let first = fake_texture(&disposer, vk::Format::R8G8B8A8_UNORM);
        let second = fake_texture(&disposer, vk::Format::R8G8B8A8_UNORM);
        let extent = vk::Extent2D {
            width: 8,
            height: 8,
        };
        let pass = vk::RenderPass::from_raw(1);

        let a = VulkanRenderTarget::new(vec![VulkanAttachment::new(&first, 0, 0)], None, extent);
        let b = VulkanRenderTarget::new(vec![VulkanAttachment::new(&second, 0, 0)], None, extent);
        assert_ne!(
            FramebufferKey::new(pass, &a).unwrap(),
            FramebufferKey::new(pass, &b).unwrap()
        );
        assert_eq!(
            FramebufferKey::new(pass, &a).unwrap(),
            FramebufferKey::new(pass, &a.clone()).unwrap()
        );
    }

    #[test]
    fn cache_reuses_and_evicts() {
        let disposer = Disposer::new(1);
        let texture = fake_texture(&disposer, vk::Format::R8G8B8A8_UNORM);
        let target = VulkanRenderTarget::new(
            vec![VulkanAttachment::new(&texture, 0, 0)],
            None,
            vk::Extent2D {
                width: 8,
                height: 8,
            },
        );
        let key = FramebufferKey::new(vk::RenderPass::from_raw(1), &target).unwrap();

        let mut cache = FramebufferCache::default();
        let first = cache
            .get_or_create(key.clone(), 0, |_| Ok(vk::Framebuffer::from_raw(11)))
            .unwrap();
        let again = cache
            .get_or_create(key, 3, |_| panic!("cached framebuffer expected"))
            .unwrap();
        assert_eq!(first, again);

        cache.gc(10, 10, &disposer);
        assert_eq!(cache.len(), 1);
        cache.gc(14, 10, &disposer);
        assert!(cache.is_empty());

        let mut retired = Vec::new();
        disposer.drain(|r| retired.push(r));
        assert!(retired.contains(&Resource::Framebuffer(vk::Framebuffer::from_raw(11))));
    }

    #[test]
    fn stale_attachment_has_no_identity() {
        let disposer = Disposer::new(1);
        let texture = fake_texture(&disposer, vk::Format::R8G8B8A8_UNORM);
        let target = VulkanRenderTarget::new(
            vec![VulkanAttachment::new(&texture, 0, 0)],
            None,
            vk::Extent2D {
                width: 8,
                height: 8,
            },
        );
        drop(texture);
        assert!(target.identity().is_err());
    }
}
