use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::*;
use vulkanalia::prelude::v1_0::*;

use super::memory::MemoryBlock;

/// A GPU object whose destruction must wait for the GPU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    Image(vk::Image),
    ImageView(vk::ImageView),
    /// Returned to its pool rather than destroyed.
    Memory(MemoryBlock),
    Buffer(vk::Buffer),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    Pipeline(vk::Pipeline),
    /// A timer slot of the timestamp pool, released instead of destroyed.
    TimerSlot(u32),
}

impl Resource {
    /// Destroys the native object. Timer slots and memory blocks are the
    /// caller's business.
    pub unsafe fn destroy(self, device: &Device) {
        match self {
            Self::Image(image) => device.destroy_image(image, None),
            Self::ImageView(view) => device.destroy_image_view(view, None),
            Self::Buffer(buffer) => device.destroy_buffer(buffer, None),
            Self::RenderPass(render_pass) => device.destroy_render_pass(render_pass, None),
            Self::Framebuffer(framebuffer) => device.destroy_framebuffer(framebuffer, None),
            Self::Pipeline(pipeline) => device.destroy_pipeline(pipeline, None),
            Self::Memory(_) | Self::TimerSlot(_) => {}
        }
    }
}

#[derive(Debug, Default)]
struct DisposerQueue {
    /// Generation of the submission currently being recorded.
    recording: u64,
    /// Ordered by generation because `recording` only grows.
    pending: VecDeque<(u64, Resource)>,
    /// Set once the device is gone; later intents can no longer be honored.
    closed: bool,
    refused: usize,
}

/// Generation-tagged destroy queue.
///
/// Every intent is tagged with the submission being recorded when it was
/// issued, and only leaves the queue once that submission completed. Clones
/// share the same queue.
#[derive(Clone, Debug)]
pub struct Disposer {
    queue: Rc<RefCell<DisposerQueue>>,
}

impl Disposer {
    pub fn new(first_generation: u64) -> Self {
        Self {
            queue: Rc::new(RefCell::new(DisposerQueue {
                recording: first_generation,
                pending: VecDeque::new(),
                closed: false,
                refused: 0,
            })),
        }
    }

    pub fn retire(&self, resource: Resource) {
        let mut queue = self.queue.borrow_mut();
        if queue.closed {
            queue.refused += 1;
            error!("Disposer closed; {:?} outlived its device and leaks.", resource);
            return;
        }
        let generation = queue.recording;
        queue.pending.push_back((generation, resource));
    }

    /// Called once a submission is handed to the queue; later intents belong
    /// to `next`.
    pub fn advance(&self, next: u64) {
        let mut queue = self.queue.borrow_mut();
        debug_assert!(next >= queue.recording);
        queue.recording = next;
    }

    pub fn recording_generation(&self) -> u64 {
        self.queue.borrow().recording
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().pending.len()
    }

    /// Hands every intent tagged with a generation `<= completed` to
    /// `destroy`, oldest first. Returns how many were released.
    pub fn sweep(&self, completed: u64, mut destroy: impl FnMut(Resource)) -> usize {
        // Collected first so `destroy` may retire more resources.
        let due = {
            let mut queue = self.queue.borrow_mut();
            let split = queue
                .pending
                .iter()
                .position(|(generation, _)| *generation > completed)
                .unwrap_or(queue.pending.len());
            queue.pending.drain(..split).collect::<Vec<_>>()
        };

        if !due.is_empty() {
            trace!(
                "Disposer: releasing {} resources up to generation {}.",
                due.len(),
                completed
            );
        }
        let count = due.len();
        due.into_iter().for_each(|(_, resource)| destroy(resource));
        count
    }

    /// Releases everything. Only valid once the device is idle.
    pub fn drain(&self, destroy: impl FnMut(Resource)) -> usize {
        self.sweep(u64::MAX, destroy)
    }

    /// Refuses every later intent. Called right before the device goes away.
    pub fn close(&self) {
        let mut queue = self.queue.borrow_mut();
        if !queue.pending.is_empty() {
            warn!("Disposer closed with {} intents pending.", queue.pending.len());
        }
        queue.closed = true;
    }

    /// Intents issued after `close`.
    pub fn refused(&self) -> usize {
        self.queue.borrow().refused
    }
}
