use std::ffi::CString;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::{ExtDebugMarkerExtension, ExtDebugUtilsExtension};
use vulkanalia_vma as vma;
use winit::window::Window;

use super::command_buffer::VulkanCommands;
use super::constants;
use super::device::{DeviceCapabilities, SelectedDevice, VulkanDevice};
use super::disposer::Resource;
use super::format;
use super::framebuffer::FramebufferCache;
use super::image::{TextureDesc, VulkanTexture};
use super::instance::VulkanInstance;
use super::memory::{self, MemoryPool, MemoryPoolKind};
use super::pipeline::RasterState;
use super::render_pass::{RenderPassCache, RenderPassState};
use super::stage_pool::VulkanStagePool;
use super::timestamps::VulkanTimestamps;
use crate::config::BackendConfig;
use crate::error::BackendResult;

/// Everything the backend knows about the device it drives.
///
/// Built once by [`VulkanContext::new`] and torn down by `Drop`. Fields are
/// dropped in declaration order: the memory pools release their allocator
/// before `device`, which precedes `instance`.
#[derive(Debug)]
pub struct VulkanContext {
    pub physical_device: vk::PhysicalDevice,
    pub physical_device_properties: vk::PhysicalDeviceProperties,
    pub physical_device_features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family_index: u32,
    pub capabilities: DeviceCapabilities,
    pub current_surface: Option<vk::SurfaceKHR>,
    pub render_pass_state: RenderPassState,
    pub viewport: vk::Viewport,
    pub final_depth_format: vk::Format,
    pub gpu_pool: MemoryPool,
    pub cpu_pool: MemoryPool,
    pub empty_texture: Option<Rc<VulkanTexture>>,
    pub commands: VulkanCommands,
    pub stage_pool: VulkanStagePool,
    pub render_pass_cache: RenderPassCache,
    pub framebuffer_cache: FramebufferCache,
    pub timestamps: Arc<VulkanTimestamps>,
    pub raster_state: RasterState,
    debug_markers: Vec<String>,
    pub device: VulkanDevice,
    pub instance: VulkanInstance,
}

impl VulkanContext {
    pub unsafe fn new(
        window: Option<&Window>,
        entry: &Entry,
        config: &BackendConfig,
    ) -> Result<Self> {
        let instance = VulkanInstance::new(window, entry, config)?;
        let selected = VulkanDevice::select_physical_device(&instance, config)?;
        let (device, graphics_queue, capabilities) =
            VulkanDevice::create_logical_device(&instance, &selected)?;

        let final_depth_format = select_depth_format(&instance, &selected);
        if final_depth_format == vk::Format::UNDEFINED {
            return Err(anyhow!("No supported depth attachment format."));
        }
        info!("Depth format: {:?}.", final_depth_format);

        let allocator = Arc::new(vma::Allocator::new(&vma::AllocatorOptions::new(
            &instance.vk_instance,
            &device.vk_device,
            selected.handle,
        ))?);
        let gpu_pool = MemoryPool::new(
            &allocator,
            MemoryPoolKind::GpuLocal,
            &selected.memory_properties,
        )?;
        let cpu_pool = MemoryPool::new(
            &allocator,
            MemoryPoolKind::CpuVisible,
            &selected.memory_properties,
        )?;

        let timestamps = VulkanTimestamps::create(
            &device.vk_device,
            config.timer_query_capacity(),
            selected.properties.limits.timestamp_period,
        )?;
        let commands = match VulkanCommands::create(
            &device.vk_device,
            selected.graphics_family,
            config.command_buffer_count(),
        ) {
            Ok(commands) => commands,
            Err(error) => {
                timestamps.destroy(&device.vk_device);
                return Err(error.into());
            }
        };

        // From here on `Drop` cleans up whatever was created.
        let mut context = Self {
            physical_device: selected.handle,
            physical_device_properties: selected.properties,
            physical_device_features: selected.features,
            memory_properties: selected.memory_properties,
            graphics_queue,
            graphics_queue_family_index: selected.graphics_family,
            capabilities,
            current_surface: None,
            render_pass_state: RenderPassState::default(),
            viewport: vk::Viewport::default(),
            final_depth_format,
            gpu_pool,
            cpu_pool,
            empty_texture: None,
            commands,
            stage_pool: VulkanStagePool::default(),
            render_pass_cache: RenderPassCache::default(),
            framebuffer_cache: FramebufferCache::default(),
            timestamps: Arc::new(timestamps),
            raster_state: RasterState::default(),
            debug_markers: Vec::new(),
            device,
            instance,
        };

        if let Some(window) = window {
            context.current_surface = Some(context.instance.create_surface(window)?);
        }
        context.create_empty_texture()?;

        Ok(context)
    }

    pub fn select_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> BackendResult<u32> {
        memory::select_memory_type(&self.memory_properties, type_bits, required)
    }

    pub unsafe fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> vk::Format {
        format::find_supported_format(candidates, tiling, features, |format| {
            self.instance
                .vk_instance
                .get_physical_device_format_properties(self.physical_device, format)
        })
    }

    /// Uploads the 1x1 transparent-black texture bound wherever a sampler has
    /// nothing else to read.
    pub unsafe fn create_empty_texture(&mut self) -> BackendResult<()> {
        let device = &self.device.vk_device;
        let desc = TextureDesc::new_2d(
            constants::EMPTY_TEXTURE_FORMAT,
            1,
            1,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        );
        let texture =
            VulkanTexture::create(device, &self.gpu_pool, self.commands.disposer(), desc)?;

        let texel_size = format::texel_size(constants::EMPTY_TEXTURE_FORMAT).unwrap_or(4);
        let pixel = vec![0u8; texel_size as usize];
        let stage = self
            .stage_pool
            .acquire(device, &self.cpu_pool, pixel.len() as u64)?;
        stage.write(&self.cpu_pool, &pixel)?;

        let command_buffer = self.commands.get(device)?;
        texture.transition_layout(
            device,
            command_buffer,
            0,
            0,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );

        let subresource = vk::ImageSubresourceLayers::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(subresource)
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            });
        device.cmd_copy_buffer_to_image(
            command_buffer,
            stage.buffer,
            texture.image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );

        texture.transition_layout(
            device,
            command_buffer,
            0,
            0,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        self.stage_pool
            .retire(stage, self.commands.recording_generation());

        // Replacing an older texture retires it through the disposer.
        self.empty_texture = Some(texture);
        Ok(())
    }

    pub unsafe fn push_group_marker(&mut self, label: &str) -> BackendResult<()> {
        let name = CString::new(label.replace('\0', "")).unwrap_or_default();
        let command_buffer = self.commands.get(&self.device.vk_device)?;

        if self.capabilities.debug_utils {
            let info = vk::DebugUtilsLabelEXT::builder()
                .label_name(name.as_bytes_with_nul())
                .color([0.0, 0.0, 0.0, 1.0]);
            self.instance
                .vk_instance
                .cmd_begin_debug_utils_label_ext(command_buffer, &info);
        } else if self.capabilities.debug_markers {
            let info = vk::DebugMarkerMarkerInfoEXT::builder()
                .marker_name(name.as_bytes_with_nul())
                .color([0.0, 0.0, 0.0, 1.0]);
            self.device
                .vk_device
                .cmd_debug_marker_begin_ext(command_buffer, &info);
        }

        self.debug_markers.push(label.to_owned());
        Ok(())
    }

    pub unsafe fn pop_group_marker(&mut self) -> BackendResult<()> {
        if self.debug_markers.pop().is_none() {
            warn!("pop_group_marker without a matching push.");
            return Ok(());
        }
        let command_buffer = self.commands.get(&self.device.vk_device)?;

        if self.capabilities.debug_utils {
            self.instance
                .vk_instance
                .cmd_end_debug_utils_label_ext(command_buffer);
        } else if self.capabilities.debug_markers {
            self.device
                .vk_device
                .cmd_debug_marker_end_ext(command_buffer);
        }
        Ok(())
    }

    /// Label of the innermost open group.
    pub fn current_debug_marker(&self) -> Option<&str> {
        self.debug_markers.last().map(String::as_str)
    }

    /// Destroys a resource whose submission completed and settles its
    /// bookkeeping.
    pub unsafe fn release(&self, resource: Resource) {
        match resource {
            Resource::TimerSlot(index) => self.timestamps.slots().release(index),
            Resource::Memory(block) => match block.pool {
                MemoryPoolKind::GpuLocal => self.gpu_pool.free(block),
                MemoryPoolKind::CpuVisible => self.cpu_pool.free(block),
            },
            _ => resource.destroy(&self.device.vk_device),
        }
    }

    /// Polls submissions, then releases everything they held. Returns the
    /// completed generation.
    pub unsafe fn collect_garbage(&mut self, frame: u64, max_age: u64) -> BackendResult<u64> {
        let completed = self.commands.gc(&self.device.vk_device)?;

        let disposer = self.commands.disposer().clone();
        let in_use = self.render_pass_state.current().map(|p| p.render_pass);
        self.render_pass_cache.gc(frame, max_age, in_use, &disposer);
        self.framebuffer_cache.gc(frame, max_age, &disposer);

        disposer.sweep(completed, |resource| self.release(resource));
        self.stage_pool.gc(completed);
        Ok(completed)
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(error) = self.device.vk_device.device_wait_idle() {
                error!("device_wait_idle failed during teardown: {}", error);
            }
            if let Err(error) = self.commands.wait(&self.device.vk_device) {
                warn!("Waiting on submissions during teardown failed: {}", error);
            }

            let disposer = self.commands.disposer().clone();
            self.render_pass_cache.clear(&disposer);
            self.framebuffer_cache.clear(&disposer);
            self.empty_texture = None;
            let released = disposer.drain(|resource| self.release(resource));
            disposer.close();
            debug!("Released {} deferred resources at teardown.", released);

            self.stage_pool
                .destroy(&self.device.vk_device, &self.cpu_pool);
            self.timestamps.destroy(&self.device.vk_device);
            self.commands.destroy(&self.device.vk_device);

            if self.gpu_pool.live_allocations() > 0 || self.cpu_pool.live_allocations() > 0 {
                warn!(
                    "Leaking {} GPU-local ({} bytes) and {} CPU-visible ({} bytes) allocations.",
                    self.gpu_pool.live_allocations(),
                    self.gpu_pool.live_bytes(),
                    self.cpu_pool.live_allocations(),
                    self.cpu_pool.live_bytes()
                );
                self.gpu_pool.free_all();
                self.cpu_pool.free_all();
            }

            if let Some(surface) = self.current_surface.take() {
                self.instance.destroy_surface(surface);
            }
        }
        info!("Destroyed Vulkan context.");
    }
}

unsafe fn select_depth_format(instance: &VulkanInstance, selected: &SelectedDevice) -> vk::Format {
    format::find_supported_format(
        &constants::DEPTH_FORMAT_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        |format| {
            instance
                .vk_instance
                .get_physical_device_format_properties(selected.handle, format)
        },
    )
}
