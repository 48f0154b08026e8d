use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use log::*;
use vulkanalia::prelude::v1_0::*;

use super::disposer::{Disposer, Resource};
use super::format;
use super::memory::{MemoryBlock, MemoryPool};
use crate::error::{BackendError, BackendResult};

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, Debug)]
pub struct TextureDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub levels: u8,
    pub layers: u16,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
}

impl TextureDesc {
    pub fn new_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            extent: vk::Extent2D { width, height },
            levels: 1,
            layers: 1,
            samples: vk::SampleCountFlags::_1,
            usage,
        }
    }
}

/// (level, layer, aspect)
type ViewKey = (u8, u16, vk::ImageAspectFlags);

/// An image, its memory, the layout of each subresource and the views created
/// on it. Dropping the last reference retires all of them through the
/// disposer.
#[derive(Debug)]
pub struct VulkanTexture {
    id: u64,
    image: vk::Image,
    memory: MemoryBlock,
    desc: TextureDesc,
    layouts: RefCell<HashMap<(u8, u16), vk::ImageLayout>>,
    views: RefCell<HashMap<ViewKey, vk::ImageView>>,
    disposer: Disposer,
}

impl VulkanTexture {
    pub unsafe fn create(
        device: &Device,
        pool: &MemoryPool,
        disposer: &Disposer,
        desc: TextureDesc,
    ) -> BackendResult<Rc<Self>> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(u32::from(desc.levels))
            .array_layers(u32::from(desc.layers))
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .build();

        let (image, memory) = pool.create_image(device, info)?;
        let texture = Self::from_raw(image, memory, desc, disposer.clone());
        debug!(
            "Created texture #{} ({:?}, {}x{}).",
            texture.id, desc.format, desc.extent.width, desc.extent.height
        );
        Ok(Rc::new(texture))
    }

    /// Wraps handles created elsewhere. The texture takes ownership.
    pub fn from_raw(
        image: vk::Image,
        memory: MemoryBlock,
        desc: TextureDesc,
        disposer: Disposer,
    ) -> Self {
        Self {
            id: NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed),
            image,
            memory,
            desc,
            layouts: RefCell::new(HashMap::new()),
            views: RefCell::new(HashMap::new()),
            disposer,
        }
    }

    /// Process-unique, never reused.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn layout(&self, level: u8, layer: u16) -> vk::ImageLayout {
        self.layouts
            .borrow()
            .get(&(level, layer))
            .copied()
            .unwrap_or(vk::ImageLayout::UNDEFINED)
    }

    pub fn set_layout(&self, level: u8, layer: u16, layout: vk::ImageLayout) {
        self.layouts.borrow_mut().insert((level, layer), layout);
    }

    /// Returns the view of one subresource for `aspect`, calling `create` only
    /// the first time that combination is requested.
    pub fn image_view_with(
        &self,
        level: u8,
        layer: u16,
        aspect: vk::ImageAspectFlags,
        create: impl FnOnce(&vk::ImageViewCreateInfo) -> BackendResult<vk::ImageView>,
    ) -> BackendResult<vk::ImageView> {
        if aspect.is_empty() || !format::format_aspects(self.desc.format).contains(aspect) {
            return Err(BackendError::UnsupportedAspect {
                format: self.desc.format,
                aspect,
            });
        }

        let key = (level, layer, aspect);
        if let Some(view) = self.views.borrow().get(&key) {
            return Ok(*view);
        }

        let subresource_range = vk::ImageSubresourceRange::builder()
            .aspect_mask(aspect)
            .base_mip_level(u32::from(level))
            .level_count(1)
            .base_array_layer(u32::from(layer))
            .layer_count(1);
        let info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(vk::ImageViewType::_2D)
            .format(self.desc.format)
            .subresource_range(subresource_range)
            .build();

        let view = create(&info)?;
        self.views.borrow_mut().insert(key, view);
        Ok(view)
    }

    pub unsafe fn image_view(
        &self,
        device: &Device,
        level: u8,
        layer: u16,
        aspect: vk::ImageAspectFlags,
    ) -> BackendResult<vk::ImageView> {
        self.image_view_with(level, layer, aspect, |info| {
            Ok(device.create_image_view(info, None)?)
        })
    }

    /// Records a barrier moving one subresource to `new_layout`.
    pub unsafe fn transition_layout(
        &self,
        device: &Device,
        command_buffer: vk::CommandBuffer,
        level: u8,
        layer: u16,
        new_layout: vk::ImageLayout,
    ) {
        let old_layout = self.layout(level, layer);
        if old_layout == new_layout {
            return;
        }

        let masks = transition_masks(old_layout, new_layout);
        let subresource = vk::ImageSubresourceRange::builder()
            .aspect_mask(format::format_aspects(self.desc.format))
            .base_mip_level(u32::from(level))
            .level_count(1)
            .base_array_layer(u32::from(layer))
            .layer_count(1);
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(subresource)
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access);

        device.cmd_pipeline_barrier(
            command_buffer,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[] as &[vk::MemoryBarrier],
            &[] as &[vk::BufferMemoryBarrier],
            &[barrier],
        );
        self.set_layout(level, layer, new_layout);
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        for (_, view) in self.views.borrow_mut().drain() {
            self.disposer.retire(Resource::ImageView(view));
        }
        self.disposer.retire(Resource::Image(self.image));
        self.disposer.retire(Resource::Memory(self.memory));
        trace!("Retired texture #{}.", self.id);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> TransitionMasks {
    let (src_access, src_stage) = match old {
        vk::ImageLayout::UNDEFINED => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        _ => (
            vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    };

    let (dst_access, dst_stage) = match new {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    };

    TransitionMasks {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    }
}

/// One addressable 2D subresource of a texture. Does not keep the texture
/// alive.
#[derive(Clone, Debug)]
pub struct VulkanAttachment {
    texture: Weak<VulkanTexture>,
    pub level: u8,
    pub layer: u16,
}

impl VulkanAttachment {
    pub fn new(texture: &Rc<VulkanTexture>, level: u8, layer: u16) -> Self {
        Self {
            texture: Rc::downgrade(texture),
            level,
            layer,
        }
    }

    pub fn texture(&self) -> BackendResult<Rc<VulkanTexture>> {
        self.texture.upgrade().ok_or(BackendError::StaleAttachment)
    }

    pub fn image(&self) -> BackendResult<vk::Image> {
        Ok(self.texture()?.image())
    }

    pub fn format(&self) -> BackendResult<vk::Format> {
        Ok(self.texture()?.format())
    }

    pub fn layout(&self) -> BackendResult<vk::ImageLayout> {
        Ok(self.texture()?.layout(self.level, self.layer))
    }

    pub unsafe fn image_view(
        &self,
        device: &Device,
        aspect: vk::ImageAspectFlags,
    ) -> BackendResult<vk::ImageView> {
        self.texture()?
            .image_view(device, self.level, self.layer, aspect)
    }
}
