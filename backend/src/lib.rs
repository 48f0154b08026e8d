#![allow(clippy::missing_safety_doc, clippy::too_many_arguments)]

use anyhow::Result;
use log::*;
use winit::dpi::LogicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::EventLoop;
use winit::window::{Window, WindowBuilder};

pub mod config;
pub mod error;
mod renderer;
pub mod vulkan;

pub use config::BackendConfig;
pub use error::{BackendError, BackendResult};
pub use renderer::Renderer;
pub use vulkan::VulkanDriver;

#[derive(Debug)]
pub struct Engine {
    window: Window,
    renderer: Renderer,
    event_loop: EventLoop<()>,
}

impl Engine {
    pub fn new(config: BackendConfig) -> Result<Engine> {
        // Window
        let event_loop = EventLoop::new()?;
        let window = WindowBuilder::new()
            .with_title(config.application_name.as_str())
            .with_inner_size(LogicalSize::new(1024, 768))
            .build(&event_loop)?;

        let renderer = unsafe { Renderer::create(&window, config)? };

        Ok(Engine {
            window,
            renderer,
            event_loop,
        })
    }

    pub fn run(self) -> Result<()> {
        let window = self.window;
        // Dropped on close so the surface goes before the window.
        let mut renderer = Some(self.renderer);

        self.event_loop.run(move |event, elwt| match event {
            // Request a redraw when all events were processed.
            Event::AboutToWait => window.request_redraw(),
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::RedrawRequested if !elwt.exiting() => {
                    let Some(renderer) = renderer.as_mut() else {
                        return;
                    };
                    match unsafe { renderer.render() } {
                        Ok(()) => {}
                        Err(error) if error.is_fatal() => {
                            error!("Fatal backend error: {}", error);
                            elwt.exit();
                        }
                        Err(error) => warn!("Frame skipped: {}", error),
                    }
                }
                WindowEvent::Resized(size) => {
                    if let Some(renderer) = renderer.as_mut() {
                        if let Err(error) = unsafe { renderer.resize(size.width, size.height) } {
                            error!("Resize failed: {}", error);
                            elwt.exit();
                        }
                    }
                }
                WindowEvent::CloseRequested => {
                    elwt.exit();
                    if let Some(mut renderer) = renderer.take() {
                        if let Err(error) = unsafe { renderer.finish() } {
                            warn!("Finishing outstanding work failed: {}", error);
                        }
                    }
                }
                _ => {}
            },
            _ => {}
        })?;

        Ok(())
    }
}
