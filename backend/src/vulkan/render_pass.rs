use std::collections::HashMap;

use bitflags::bitflags;
use log::*;
use vulkanalia::prelude::v1_0::*;

use super::disposer::{Disposer, Resource};
use super::format;
use super::framebuffer::VulkanRenderTarget;
use super::image::VulkanAttachment;
use crate::error::{BackendError, BackendResult};

bitflags! {
    /// Buffers of a render target a pass clears or discards.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TargetBuffers: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// Per-pass policy supplied by the client.
#[derive(Copy, Clone, Debug)]
pub struct RenderPassParams {
    pub clear: TargetBuffers,
    /// Previous contents are not needed.
    pub discard_start: TargetBuffers,
    /// Contents are not needed after the pass.
    pub discard_end: TargetBuffers,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub subpass_count: u32,
}

impl Default for RenderPassParams {
    fn default() -> Self {
        Self {
            clear: TargetBuffers::empty(),
            discard_start: TargetBuffers::empty(),
            discard_end: TargetBuffers::empty(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
            clear_stencil: 0,
            subpass_count: 1,
        }
    }
}

impl RenderPassParams {
    pub fn load_op(&self, buffer: TargetBuffers) -> vk::AttachmentLoadOp {
        if self.clear.intersects(buffer) {
            vk::AttachmentLoadOp::CLEAR
        } else if self.discard_start.intersects(buffer) {
            vk::AttachmentLoadOp::DONT_CARE
        } else {
            vk::AttachmentLoadOp::LOAD
        }
    }

    pub fn store_op(&self, buffer: TargetBuffers) -> vk::AttachmentStoreOp {
        if self.discard_end.intersects(buffer) {
            vk::AttachmentStoreOp::DONT_CARE
        } else {
            vk::AttachmentStoreOp::STORE
        }
    }
}

/// Structural description of one attachment inside a render-pass key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentKey {
    fn description(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::builder()
            .format(self.format)
            .samples(self.samples)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(self.stencil_load_op)
            .stencil_store_op(self.stencil_store_op)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
            .build()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub colors: Vec<AttachmentKey>,
    pub depth: Option<AttachmentKey>,
    pub subpass_count: u32,
}

/// Layout an attachment is left in once the pass ends.
fn final_layout(depth: bool, usage: vk::ImageUsageFlags) -> vk::ImageLayout {
    let sampled = usage.contains(vk::ImageUsageFlags::SAMPLED);
    match (depth, sampled) {
        (false, true) => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        (false, false) => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        (true, true) => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        (true, false) => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    }
}

impl RenderPassKey {
    /// Derives the key from the attachments' current state and the pass policy.
    pub fn derive(target: &VulkanRenderTarget, params: &RenderPassParams) -> BackendResult<Self> {
        let attachment_key = |attachment: &VulkanAttachment,
                              buffer: TargetBuffers|
         -> BackendResult<AttachmentKey> {
            let texture = attachment.texture()?;
            let desc = texture.desc();
            let depth = buffer == TargetBuffers::DEPTH;
            let load_op = params.load_op(buffer);
            let (stencil_load_op, stencil_store_op) = if depth && format::has_stencil(desc.format) {
                (
                    params.load_op(TargetBuffers::STENCIL),
                    params.store_op(TargetBuffers::STENCIL),
                )
            } else {
                (
                    vk::AttachmentLoadOp::DONT_CARE,
                    vk::AttachmentStoreOp::DONT_CARE,
                )
            };
            let keeps_contents = load_op == vk::AttachmentLoadOp::LOAD
                || stencil_load_op == vk::AttachmentLoadOp::LOAD;
            let initial_layout = if keeps_contents {
                texture.layout(attachment.level, attachment.layer)
            } else {
                vk::ImageLayout::UNDEFINED
            };

            Ok(AttachmentKey {
                format: desc.format,
                samples: desc.samples,
                load_op,
                store_op: params.store_op(buffer),
                stencil_load_op,
                stencil_store_op,
                initial_layout,
                final_layout: final_layout(depth, desc.usage),
            })
        };

        let colors = target
            .colors()
            .iter()
            .map(|a| attachment_key(a, TargetBuffers::COLOR))
            .collect::<BackendResult<Vec<_>>>()?;
        let depth = target
            .depth()
            .map(|a| attachment_key(a, TargetBuffers::DEPTH))
            .transpose()?;

        Ok(Self {
            colors,
            depth,
            subpass_count: params.subpass_count.max(1),
        })
    }

    pub fn attachment_count(&self) -> usize {
        self.colors.len() + usize::from(self.depth.is_some())
    }

    /// Stages the external dependency into subpass 0 waits on. Attachments
    /// loaded from a read-only layout were last read by fragment shaders.
    pub fn external_src_stages(&self) -> vk::PipelineStageFlags {
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let sampled = self.colors.iter().chain(self.depth.iter()).any(|a| {
            matches!(
                a.initial_layout,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                    | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            )
        });
        if sampled {
            stages | vk::PipelineStageFlags::FRAGMENT_SHADER
        } else {
            stages
        }
    }
}

/// Builds the native render pass a key describes. Every subpass writes all
/// color attachments and the depth attachment; consecutive subpasses are
/// chained by a by-region dependency.
pub unsafe fn create_native_render_pass(
    device: &Device,
    key: &RenderPassKey,
) -> BackendResult<vk::RenderPass> {
    let mut attachments = key
        .colors
        .iter()
        .map(AttachmentKey::description)
        .collect::<Vec<_>>();
    let color_refs = (0..key.colors.len() as u32)
        .map(|i| {
            vk::AttachmentReference::builder()
                .attachment(i)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .build()
        })
        .collect::<Vec<_>>();
    let depth_ref = key.depth.map(|depth| {
        attachments.push(depth.description());
        vk::AttachmentReference::builder()
            .attachment(key.colors.len() as u32)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build()
    });

    let subpasses = (0..key.subpass_count)
        .map(|_| {
            let subpass = vk::SubpassDescription::builder()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .color_attachments(&color_refs);
            match &depth_ref {
                Some(depth_ref) => subpass.depth_stencil_attachment(depth_ref).build(),
                None => subpass.build(),
            }
        })
        .collect::<Vec<_>>();

    let attachment_stages =
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let attachment_writes = vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    let mut dependencies = vec![vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(key.external_src_stages())
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(attachment_stages)
        .dst_access_mask(attachment_writes)
        .build()];
    for i in 1..key.subpass_count {
        dependencies.push(
            vk::SubpassDependency::builder()
                .src_subpass(i - 1)
                .dst_subpass(i)
                .src_stage_mask(attachment_stages | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS)
                .src_access_mask(attachment_writes)
                .dst_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
                .dst_access_mask(
                    attachment_writes
                        | vk::AccessFlags::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
                )
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .build(),
        );
    }

    let info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    Ok(device.create_render_pass(&info, None)?)
}

#[derive(Copy, Clone, Debug)]
struct CachedRenderPass {
    handle: vk::RenderPass,
    last_used: u64,
}

/// Native render passes by structural key.
#[derive(Debug, Default)]
pub struct RenderPassCache {
    entries: HashMap<RenderPassKey, CachedRenderPass>,
}

impl RenderPassCache {
    pub fn get_or_create(
        &mut self,
        key: &RenderPassKey,
        frame: u64,
        create: impl FnOnce(&RenderPassKey) -> BackendResult<vk::RenderPass>,
    ) -> BackendResult<vk::RenderPass> {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_used = frame;
            return Ok(entry.handle);
        }

        let handle = create(key)?;
        debug!(
            "Created render pass for {} attachments, {} subpasses.",
            key.attachment_count(),
            key.subpass_count
        );
        self.entries.insert(
            key.clone(),
            CachedRenderPass {
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

    /// Retires passes unused for more than `max_age` frames. `in_use` is never
    /// evicted.
    pub fn gc(&mut self, frame: u64, max_age: u64, in_use: Option<vk::RenderPass>, disposer: &Disposer) {
        self.entries.retain(|_, entry| {
            let stale = frame.saturating_sub(entry.last_used) > max_age
                && Some(entry.handle) != in_use;
            if stale {
                trace!("Evicting render pass {:?}.", entry.handle);
                disposer.retire(Resource::RenderPass(entry.handle));
            }
            !stale
        });
    }

    pub fn clear(&mut self, disposer: &Disposer) {
        self.entries
            .drain()
            .for_each(|(_, entry)| disposer.retire(Resource::RenderPass(entry.handle)));
    }
}

/// The pass being recorded.
#[derive(Clone, Debug)]
pub struct VulkanRenderPass {
    pub render_pass: vk::RenderPass,
    pub params: RenderPassParams,
    pub current_subpass: u32,
    pub subpass_count: u32,
    /// Attachments paired with the layout they are left in.
    pub attachments: Vec<(VulkanAttachment, vk::ImageLayout)>,
}

/// no active pass → begun (subpass 0) → advanced … → ended → no active pass.
#[derive(Debug, Default)]
pub struct RenderPassState {
    current: Option<VulkanRenderPass>,
}

impl RenderPassState {
    pub fn current(&self) -> Option<&VulkanRenderPass> {
        self.current.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Fails for commands that are invalid inside a render pass.
    pub fn ensure_inactive(&self) -> BackendResult<()> {
        if self.is_active() {
            return Err(BackendError::RenderPassAlreadyActive);
        }
        Ok(())
    }

    pub fn begin(&mut self, pass: VulkanRenderPass) -> BackendResult<&VulkanRenderPass> {
        self.ensure_inactive()?;
        Ok(&*self.current.insert(VulkanRenderPass {
            current_subpass: 0,
            ..pass
        }))
    }

    pub fn next_subpass(&mut self) -> BackendResult<u32> {
        let pass = self.current.as_mut().ok_or(BackendError::NoActiveRenderPass)?;
        if pass.current_subpass + 1 >= pass.subpass_count {
            return Err(BackendError::SubpassesExhausted {
                count: pass.subpass_count,
            });
        }
        pass.current_subpass += 1;
        Ok(pass.current_subpass)
    }

    /// Ends the pass and moves each attachment to its final layout.
    pub fn end(&mut self) -> BackendResult<VulkanRenderPass> {
        let pass = self.current.take().ok_or(BackendError::NoActiveRenderPass)?;
        for (attachment, layout) in &pass.attachments {
            // A texture dropped mid-pass has nothing left to track.
            if let Ok(texture) = attachment.texture() {
                texture.set_layout(attachment.level, attachment.layer, *layout);
            }
        }
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::image::{tests::fake_texture, VulkanTexture};
    use std::cell::Cell;
    use std::rc::Rc;
    use vulkanalia::vk::Handle;

    fn target(disposer: &Disposer) -> (Rc<VulkanTexture>, Rc<VulkanTexture>, VulkanRenderTarget) {
        let color = fake_texture(disposer, vk::Format::R8G8B8A8_UNORM);
        let depth = fake_texture(disposer, vk::Format::D32_SFLOAT);
        let target = VulkanRenderTarget::new(
            vec![VulkanAttachment::new(&color, 0, 0)],
            Some(VulkanAttachment::new(&depth, 0, 0)),
            vk::Extent2D {
                width: 64,
                height: 64,
            },
        );
        (color, depth, target)
    }

    fn pass(handle: u64, subpass_count: u32) -> VulkanRenderPass {
        VulkanRenderPass {
            render_pass: vk::RenderPass::from_raw(handle),
            params: RenderPassParams {
                subpass_count,
                ..Default::default()
            },
            current_subpass: 0,
            subpass_count,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn load_and_store_ops_follow_policy() {
        let params = RenderPassParams {
            clear: TargetBuffers::COLOR,
            discard_start: TargetBuffers::DEPTH | TargetBuffers::COLOR,
            discard_end: TargetBuffers::DEPTH,
            ..Default::default()
        };
        assert_eq!(params.load_op(TargetBuffers::COLOR), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(params.load_op(TargetBuffers::DEPTH), vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(params.load_op(TargetBuffers::STENCIL), vk::AttachmentLoadOp::LOAD);
        assert_eq!(params.store_op(TargetBuffers::COLOR), vk::AttachmentStoreOp::STORE);
        assert_eq!(params.store_op(TargetBuffers::DEPTH), vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn identical_configuration_reuses_cached_pass() {
        let disposer = Disposer::new(1);
        let (_color, _depth, target) = target(&disposer);
        let params = RenderPassParams {
            clear: TargetBuffers::COLOR | TargetBuffers::DEPTH,
            ..Default::default()
        };

        let created = Cell::new(0u64);
        let create = |_: &RenderPassKey| {
            created.set(created.get() + 1);
            Ok(vk::RenderPass::from_raw(created.get()))
        };

        let mut cache = RenderPassCache::default();
        let first_key = RenderPassKey::derive(&target, &params).unwrap();
        let second_key = RenderPassKey::derive(&target, &params).unwrap();
        let first = cache.get_or_create(&first_key, 0, create).unwrap();
        let second = cache.get_or_create(&second_key, 1, create).unwrap();
        assert_eq!(first, second);
        assert_eq!(created.get(), 1);

        let loading = RenderPassParams::default();
        let other_key = RenderPassKey::derive(&target, &loading).unwrap();
        let other = cache.get_or_create(&other_key, 2, create).unwrap();
        assert_ne!(first, other);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn different_sample_count_is_a_different_key() {
        let disposer = Disposer::new(1);
        let (_color, _depth, target) = target(&disposer);
        let mut desc = crate::vulkan::image::TextureDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            64,
            64,
            vk::ImageUsageFlags::SAMPLED,
        );
        desc.samples = vk::SampleCountFlags::_4;
        let msaa = Rc::new(VulkanTexture::from_raw(
            vk::Image::from_raw(300),
            crate::vulkan::memory::MemoryBlock {
                id: 301,
                size: 1,
                pool: crate::vulkan::memory::MemoryPoolKind::GpuLocal,
            },
            desc,
            disposer.clone(),
        ));
        let msaa_target = VulkanRenderTarget::new(
            vec![VulkanAttachment::new(&msaa, 0, 0)],
            target.depth().cloned(),
            target.extent(),
        );

        let params = RenderPassParams::default();
        assert_ne!(
            RenderPassKey::derive(&target, &params).unwrap(),
            RenderPassKey::derive(&msaa_target, &params).unwrap()
        );
    }

    #[test]
    fn loading_pass_starts_from_tracked_layout() {
        let disposer = Disposer::new(1);
        let (color, _depth, target) = target(&disposer);
        color.set_layout(0, 0, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let key = RenderPassKey::derive(&target, &RenderPassParams::default()).unwrap();
        assert_eq!(key.colors[0].initial_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(key.colors[0].final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(
            key.depth.unwrap().final_layout,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );

        let clearing = RenderPassParams {
            clear: TargetBuffers::COLOR,
            ..Default::default()
        };
        let key = RenderPassKey::derive(&target, &clearing).unwrap();
        assert_eq!(key.colors[0].initial_layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn sampled_attachments_wait_on_fragment_shaders() {
        let disposer = Disposer::new(1);
        let (color, _depth, target) = target(&disposer);
        let clearing = RenderPassParams {
            clear: TargetBuffers::COLOR | TargetBuffers::DEPTH,
            ..Default::default()
        };
        let key = RenderPassKey::derive(&target, &clearing).unwrap();
        assert!(!key
            .external_src_stages()
            .contains(vk::PipelineStageFlags::FRAGMENT_SHADER));

        // Loading a texture the previous pass left sampled.
        color.set_layout(0, 0, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let key = RenderPassKey::derive(&target, &RenderPassParams::default()).unwrap();
        let stages = key.external_src_stages();
        assert!(stages.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(stages.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));

        let mut depth_only = key.clone();
        depth_only.colors.clear();
        if let Some(depth) = depth_only.depth.as_mut() {
            depth.initial_layout = vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;
        }
        assert!(depth_only
            .external_src_stages()
            .contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
    }

    #[test]
    fn end_without_begin_is_rejected() {
        let mut state = RenderPassState::default();
        assert!(matches!(state.end(), Err(BackendError::NoActiveRenderPass)));
        assert!(matches!(
            state.next_subpass(),
            Err(BackendError::NoActiveRenderPass)
        ));
    }

    #[test]
    fn begin_while_active_is_rejected() {
        let mut state = RenderPassState::default();
        assert!(state.ensure_inactive().is_ok());
        state.begin(pass(1, 1)).unwrap();
        assert!(matches!(
            state.begin(pass(2, 1)),
            Err(BackendError::RenderPassAlreadyActive)
        ));
        // Query resets and submissions are refused the same way.
        assert!(matches!(
            state.ensure_inactive(),
            Err(BackendError::RenderPassAlreadyActive)
        ));
        assert_eq!(
            state.current().unwrap().render_pass,
            vk::RenderPass::from_raw(1)
        );
    }

    #[test]
    fn subpasses_advance_until_exhausted() {
        let mut state = RenderPassState::default();
        state.begin(pass(1, 3)).unwrap();
        assert_eq!(state.current().unwrap().current_subpass, 0);
        assert_eq!(state.next_subpass().unwrap(), 1);
        assert_eq!(state.next_subpass().unwrap(), 2);
        assert!(matches!(
            state.next_subpass(),
            Err(BackendError::SubpassesExhausted { count: 3 })
        ));

        state.end().unwrap();
        assert!(!state.is_active());
        assert!(state.end().is_err());
        state.begin(pass(1, 1)).unwrap();
    }

    #[test]
    fn end_applies_final_layouts() {
        let disposer = Disposer::new(1);
        let (color, _depth, _target) = target(&disposer);
        let mut state = RenderPassState::default();
        let mut active = pass(1, 1);
        active.attachments = vec![(
            VulkanAttachment::new(&color, 0, 0),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )];

        state.begin(active).unwrap();
        assert_eq!(color.layout(0, 0), vk::ImageLayout::UNDEFINED);
        state.end().unwrap();
        assert_eq!(color.layout(0, 0), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn gc_retires_only_stale_idle_passes() {
        let disposer = Disposer::new(1);
        let (_color, _depth, target) = target(&disposer);
        let mut cache = RenderPassCache::default();

        let old_key = RenderPassKey::derive(&target, &RenderPassParams::default()).unwrap();
        let new_key = RenderPassKey::derive(
            &target,
            &RenderPassParams {
                clear: TargetBuffers::COLOR,
                ..Default::default()
            },
        )
        .unwrap();
        cache
            .get_or_create(&old_key, 0, |_| Ok(vk::RenderPass::from_raw(1)))
            .unwrap();
        cache
            .get_or_create(&new_key, 20, |_| Ok(vk::RenderPass::from_raw(2)))
            .unwrap();

        cache.gc(25, 10, None, &disposer);
        assert_eq!(cache.len(), 1);

        let mut retired = Vec::new();
        disposer.drain(|r| retired.push(r));
        assert_eq!(retired, vec![Resource::RenderPass(vk::RenderPass::from_raw(1))]);
    }
}
