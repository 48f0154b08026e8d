use std::rc::Rc;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::loader::{LibloadingLoader, LIBRARY};
use vulkanalia::prelude::v1_0::*;
use winit::window::Window;

use crate::config::BackendConfig;
use crate::error::{BackendError, BackendResult};
use context::VulkanContext;
use disposer::Resource;
use framebuffer::{create_native_framebuffer, FramebufferKey, VulkanRenderTarget};
use image::{TextureDesc, VulkanTexture};
use pipeline::{PipelineKey, RasterState};
use render_pass::{create_native_render_pass, RenderPassKey, RenderPassParams, VulkanRenderPass};
use timestamps::TimerQuery;

pub mod command_buffer;
pub mod constants;
pub mod context;
pub mod device;
pub mod disposer;
pub mod format;
pub mod framebuffer;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod stage_pool;
pub mod timestamps;

/// Frame-recording entry points over a [`VulkanContext`].
///
/// Everything is recorded into the command stream's current buffer; nothing
/// reaches the GPU before `commit`.
#[derive(Debug)]
pub struct VulkanDriver {
    context: VulkanContext,
    config: BackendConfig,
    frame: u64,
    // Keeps the loader alive until the context is gone.
    _entry: Entry,
}

impl VulkanDriver {
    pub unsafe fn new(window: Option<&Window>, config: BackendConfig) -> Result<Self> {
        let loader = LibloadingLoader::new(LIBRARY)?;
        let entry = Entry::new(loader).map_err(|b| anyhow!("{}", b))?;
        let context = VulkanContext::new(window, &entry, &config)?;

        Ok(Self {
            context,
            config,
            frame: 0,
            _entry: entry,
        })
    }

    pub fn context(&self) -> &VulkanContext {
        &self.context
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Frames completed by `gc` so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub unsafe fn create_texture(&mut self, desc: TextureDesc) -> BackendResult<Rc<VulkanTexture>> {
        VulkanTexture::create(
            &self.context.device.vk_device,
            &self.context.gpu_pool,
            self.context.commands.disposer(),
            desc,
        )
    }

    pub fn empty_texture(&self) -> Option<Rc<VulkanTexture>> {
        self.context.empty_texture.clone()
    }

    pub fn depth_format(&self) -> vk::Format {
        self.context.final_depth_format
    }

    pub unsafe fn begin_render_pass(
        &mut self,
        target: &VulkanRenderTarget,
        params: RenderPassParams,
    ) -> BackendResult<()> {
        self.context.render_pass_state.ensure_inactive()?;

        let key = RenderPassKey::derive(target, &params)?;
        let device = &self.context.device.vk_device;
        let render_pass = self
            .context
            .render_pass_cache
            .get_or_create(&key, self.frame, |key| create_native_render_pass(device, key))?;
        let framebuffer = self.context.framebuffer_cache.get_or_create(
            FramebufferKey::new(render_pass, target)?,
            self.frame,
            |_| create_native_framebuffer(device, render_pass, target),
        )?;

        let mut clear_values = target
            .colors()
            .iter()
            .map(|_| vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: params.clear_color,
                },
            })
            .collect::<Vec<_>>();
        if target.depth().is_some() {
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: params.clear_depth,
                    stencil: params.clear_stencil,
                },
            });
        }

        let render_area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: target.extent(),
        };
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        let command_buffer = self.context.commands.get(device)?;
        device.cmd_begin_render_pass(command_buffer, &info, vk::SubpassContents::INLINE);

        let extent = target.extent();
        self.context.viewport = vk::Viewport::builder()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0)
            .build();
        device.cmd_set_viewport(command_buffer, 0, &[self.context.viewport]);
        device.cmd_set_scissor(command_buffer, 0, &[render_area]);

        let attachments = target
            .colors()
            .iter()
            .zip(key.colors.iter())
            .chain(target.depth().into_iter().zip(key.depth.iter()))
            .map(|(attachment, key)| (attachment.clone(), key.final_layout))
            .collect();

        self.context.render_pass_state.begin(VulkanRenderPass {
            render_pass,
            params,
            current_subpass: 0,
            subpass_count: key.subpass_count,
            attachments,
        })?;
        Ok(())
    }

    pub unsafe fn next_subpass(&mut self) -> BackendResult<u32> {
        let subpass = self.context.render_pass_state.next_subpass()?;
        let device = &self.context.device.vk_device;
        let command_buffer = self.context.commands.get(device)?;
        device.cmd_next_subpass(command_buffer, vk::SubpassContents::INLINE);
        Ok(subpass)
    }

    pub unsafe fn end_render_pass(&mut self) -> BackendResult<()> {
        self.context.render_pass_state.end()?;
        let device = &self.context.device.vk_device;
        let command_buffer = self.context.commands.get(device)?;
        device.cmd_end_render_pass(command_buffer);
        Ok(())
    }

    /// Stored for the next pass; applied immediately inside an active one.
    pub unsafe fn set_viewport(&mut self, viewport: vk::Viewport) -> BackendResult<()> {
        self.context.viewport = viewport;
        if self.context.render_pass_state.is_active() {
            let device = &self.context.device.vk_device;
            let command_buffer = self.context.commands.get(device)?;
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
        }
        Ok(())
    }

    pub fn set_raster_state(&mut self, raster: RasterState) {
        self.context.raster_state = raster;
    }

    /// Key of the pipeline that `program` needs in the current subpass.
    pub fn pipeline_key(&self, program: u64) -> BackendResult<PipelineKey> {
        let pass = self
            .context
            .render_pass_state
            .current()
            .ok_or(BackendError::NoActiveRenderPass)?;
        Ok(PipelineKey {
            program,
            render_pass: pass.render_pass,
            subpass: pass.current_subpass,
            raster: self.context.raster_state,
        })
    }

    pub unsafe fn push_group_marker(&mut self, label: &str) -> BackendResult<()> {
        self.context.push_group_marker(label)
    }

    pub unsafe fn pop_group_marker(&mut self) -> BackendResult<()> {
        self.context.pop_group_marker()
    }

    /// Records the start stamp. Must be called outside a render pass because
    /// the slot's queries are reset first.
    pub unsafe fn begin_timer_query(&mut self) -> BackendResult<TimerQuery> {
        self.context.render_pass_state.ensure_inactive()?;
        let device = &self.context.device.vk_device;
        let command_buffer = self.context.commands.get(device)?;
        self.context.timestamps.begin(device, command_buffer)
    }

    pub unsafe fn end_timer_query(&mut self, query: &mut TimerQuery) -> BackendResult<()> {
        let device = &self.context.device.vk_device;
        let command_buffer = self.context.commands.get(device)?;
        let generation = self.context.commands.recording_generation();
        self.context
            .timestamps
            .end(device, command_buffer, query, generation);
        Ok(())
    }

    /// Elapsed nanoseconds, or `QueryNotReady` until the submission carrying
    /// the end stamp has completed.
    pub unsafe fn timer_query_result(&self, query: &TimerQuery) -> BackendResult<u64> {
        match query.generation {
            Some(generation) if self.context.commands.tracker().is_complete(generation) => self
                .context
                .timestamps
                .elapsed_ns(&self.context.device.vk_device, query),
            _ => Err(BackendError::QueryNotReady),
        }
    }

    /// The slot returns to the pool once the GPU is done writing it.
    pub fn release_timer_query(&mut self, query: TimerQuery) {
        self.context
            .commands
            .disposer()
            .retire(Resource::TimerSlot(query.index));
    }

    /// Hands a resource owned elsewhere, such as a pipeline from an external
    /// cache, to the disposer.
    pub fn dispose(&self, resource: Resource) {
        self.context.commands.disposer().retire(resource);
    }

    /// Submits everything recorded so far. Returns the submission generation,
    /// or `None` when nothing was recorded.
    pub unsafe fn commit(&mut self) -> BackendResult<Option<u64>> {
        self.context.render_pass_state.ensure_inactive()?;
        self.context
            .commands
            .commit(&self.context.device.vk_device, self.context.graphics_queue)
    }

    /// End-of-frame housekeeping: polls submissions, releases what they held
    /// and evicts stale cache entries.
    pub unsafe fn gc(&mut self) -> BackendResult<u64> {
        let completed = self
            .context
            .collect_garbage(self.frame, self.config.framebuffer_eviction_frames)?;
        self.frame += 1;
        trace!(
            "Frame {}: completed generation {}, {} pending disposals.",
            self.frame,
            completed,
            self.context.commands.disposer().pending()
        );
        Ok(completed)
    }

    /// Submits pending work and blocks until the GPU is idle.
    pub unsafe fn finish(&mut self) -> BackendResult<()> {
        self.commit()?;
        self.context.commands.wait(&self.context.device.vk_device)?;
        self.gc()?;
        Ok(())
    }
}
