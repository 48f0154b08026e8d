use std::rc::Rc;

use anyhow::Result;
use log::*;
use vulkanalia::vk;
use winit::window::Window;

use crate::config::BackendConfig;
use crate::error::{BackendError, BackendResult};
use crate::vulkan::framebuffer::VulkanRenderTarget;
use crate::vulkan::image::{TextureDesc, VulkanAttachment, VulkanTexture};
use crate::vulkan::render_pass::{RenderPassParams, TargetBuffers};
use crate::vulkan::timestamps::TimerQuery;
use crate::vulkan::VulkanDriver;

/// Color and depth textures of the offscreen frame. The render target only
/// holds weak references, so the textures are kept here.
#[derive(Debug)]
struct Offscreen {
    _color: Rc<VulkanTexture>,
    _depth: Rc<VulkanTexture>,
    target: VulkanRenderTarget,
}

/// Records one timed offscreen pass per frame through the driver.
///
/// Fields drop in declaration order: the offscreen textures must retire
/// into the disposer before `driver` drains it and destroys the device.
#[derive(Debug)]
pub struct Renderer {
    offscreen: Option<Offscreen>,
    pending_timers: Vec<TimerQuery>,
    driver: VulkanDriver,
}

impl Renderer {
    pub unsafe fn create(window: &Window, config: BackendConfig) -> Result<Self> {
        let driver = VulkanDriver::new(Some(window), config)?;
        let mut renderer = Self {
            offscreen: None,
            pending_timers: Vec::new(),
            driver,
        };
        let size = window.inner_size();
        renderer.resize(size.width, size.height)?;
        Ok(renderer)
    }

    pub fn driver(&self) -> &VulkanDriver {
        &self.driver
    }

    /// Recreates the offscreen target. A zero-sized window renders nothing.
    pub unsafe fn resize(&mut self, width: u32, height: u32) -> BackendResult<()> {
        // Old textures retire through the disposer once their frames finish.
        self.offscreen = None;
        if width == 0 || height == 0 {
            return Ok(());
        }

        let color = self.driver.create_texture(TextureDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            width,
            height,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        ))?;
        let depth = self.driver.create_texture(TextureDesc::new_2d(
            self.driver.depth_format(),
            width,
            height,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        ))?;
        let target = VulkanRenderTarget::new(
            vec![VulkanAttachment::new(&color, 0, 0)],
            Some(VulkanAttachment::new(&depth, 0, 0)),
            vk::Extent2D { width, height },
        );

        debug!("Offscreen target resized to {}x{}.", width, height);
        self.offscreen = Some(Offscreen {
            _color: color,
            _depth: depth,
            target,
        });
        Ok(())
    }

    pub unsafe fn render(&mut self) -> BackendResult<()> {
        self.driver.gc()?;
        self.collect_timers()?;

        let Some(offscreen) = &self.offscreen else {
            return Ok(());
        };

        self.driver.push_group_marker("offscreen")?;
        let timer = match self.driver.begin_timer_query() {
            Ok(timer) => Some(timer),
            Err(BackendError::QueryPoolExhausted { .. }) => {
                debug!("All timers busy; frame {} goes untimed.", self.driver.frame());
                None
            }
            Err(error) => return Err(error),
        };

        let pulse = (self.driver.frame() % 120) as f32 / 120.0;
        let params = RenderPassParams {
            clear: TargetBuffers::COLOR | TargetBuffers::DEPTH,
            discard_end: TargetBuffers::DEPTH,
            clear_color: [0.1, 0.1, pulse, 1.0],
            ..Default::default()
        };
        if let Err(error) = self.driver.begin_render_pass(&offscreen.target, params) {
            if let Some(timer) = timer {
                self.driver.release_timer_query(timer);
            }
            return Err(error);
        }
        let key = self.driver.pipeline_key(0)?;
        trace!("Pipeline key for frame: {:?}", key);
        self.driver.end_render_pass()?;

        if let Some(mut timer) = timer {
            self.driver.end_timer_query(&mut timer)?;
            self.pending_timers.push(timer);
        }
        self.driver.pop_group_marker()?;

        self.driver.commit()?;
        Ok(())
    }

    /// Submits outstanding work and waits for it. Every timer resolves.
    pub unsafe fn finish(&mut self) -> BackendResult<()> {
        self.driver.finish()?;
        self.collect_timers()
    }

    unsafe fn collect_timers(&mut self) -> BackendResult<()> {
        let mut result = Ok(());
        let timers = std::mem::take(&mut self.pending_timers);
        for timer in timers {
            match self.driver.timer_query_result(&timer) {
                Ok(ns) => {
                    debug!("Offscreen pass took {:.3} ms on the GPU.", ns as f64 / 1e6);
                    self.driver.release_timer_query(timer);
                }
                Err(BackendError::QueryNotReady) => self.pending_timers.push(timer),
                Err(error) => {
                    self.driver.release_timer_query(timer);
                    result = result.and(Err(error));
                }
            }
        }
        result
    }
}
