use std::collections::BTreeSet;

use log::*;
use vulkanalia::prelude::v1_0::*;

use super::disposer::Disposer;
use crate::error::{BackendError, BackendResult};

/// Tracks submission generations and reports the highest generation `G` such
/// that every submission up to and including `G` has completed.
#[derive(Debug)]
pub struct SubmissionTracker {
    next: u64,
    in_flight: BTreeSet<u64>,
}

impl Default for SubmissionTracker {
    fn default() -> Self {
        Self {
            next: 1,
            in_flight: BTreeSet::new(),
        }
    }
}

impl SubmissionTracker {
    /// Generation the next submission will carry.
    pub fn next_generation(&self) -> u64 {
        self.next
    }

    pub fn submit(&mut self) -> u64 {
        let generation = self.next;
        self.next += 1;
        self.in_flight.insert(generation);
        generation
    }

    pub fn signal(&mut self, generation: u64) {
        self.in_flight.remove(&generation);
    }

    pub fn is_complete(&self, generation: u64) -> bool {
        generation <= self.completed()
    }

    pub fn completed(&self) -> u64 {
        match self.in_flight.first() {
            Some(oldest) => oldest - 1,
            None => self.next - 1,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[derive(Copy, Clone, Debug)]
struct CommandSlot {
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
    /// Generation of the submission still owning this slot.
    submitted: Option<u64>,
}

/// Ring of primary command buffers, one fence each. Everything the backend
/// records goes into the buffer returned by `get`.
#[derive(Debug)]
pub struct VulkanCommands {
    pool: vk::CommandPool,
    slots: Vec<CommandSlot>,
    current: Option<usize>,
    tracker: SubmissionTracker,
    disposer: Disposer,
}

impl VulkanCommands {
    pub unsafe fn create(
        device: &Device,
        queue_family_index: u32,
        count: usize,
    ) -> BackendResult<Self> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let pool = device.create_command_pool(&info, None)?;

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);
        let buffers = match device.allocate_command_buffers(&allocate_info) {
            Ok(buffers) => buffers,
            Err(error) => {
                device.destroy_command_pool(pool, None);
                return Err(error.into());
            }
        };

        let fence_info = vk::FenceCreateInfo::builder();
        let mut slots = Vec::with_capacity(count);
        for buffer in buffers {
            match device.create_fence(&fence_info, None) {
                Ok(fence) => slots.push(CommandSlot {
                    buffer,
                    fence,
                    submitted: None,
                }),
                Err(error) => {
                    slots.iter().for_each(|s| device.destroy_fence(s.fence, None));
                    device.destroy_command_pool(pool, None);
                    return Err(error.into());
                }
            }
        }

        let tracker = SubmissionTracker::default();
        let disposer = Disposer::new(tracker.next_generation());
        debug!("Created {} command buffers.", count);

        Ok(Self {
            pool,
            slots,
            current: None,
            tracker,
            disposer,
        })
    }

    /// The disposer bound to this stream's generations.
    pub fn disposer(&self) -> &Disposer {
        &self.disposer
    }

    pub fn tracker(&self) -> &SubmissionTracker {
        &self.tracker
    }

    /// Generation the buffer currently being recorded will carry.
    pub fn recording_generation(&self) -> u64 {
        self.tracker.next_generation()
    }

    pub fn completed_generation(&self) -> u64 {
        self.tracker.completed()
    }

    /// Returns the command buffer being recorded, starting one if needed.
    pub unsafe fn get(&mut self, device: &Device) -> BackendResult<vk::CommandBuffer> {
        if let Some(index) = self.current {
            return Ok(self.slots[index].buffer);
        }

        let index = match self.slots.iter().position(|s| s.submitted.is_none()) {
            Some(index) => index,
            None => {
                self.gc(device)?;
                match self.slots.iter().position(|s| s.submitted.is_none()) {
                    Some(index) => index,
                    None => self.wait_for_oldest(device)?,
                }
            }
        };

        let slot = self.slots[index];
        device.reset_command_buffer(slot.buffer, vk::CommandBufferResetFlags::empty())?;
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(slot.buffer, &info)?;

        self.current = Some(index);
        Ok(slot.buffer)
    }

    /// Submits the recording buffer, if any, and returns its generation.
    pub unsafe fn commit(&mut self, device: &Device, queue: vk::Queue) -> BackendResult<Option<u64>> {
        let Some(index) = self.current.take() else {
            return Ok(None);
        };
        let slot = self.slots[index];

        device.end_command_buffer(slot.buffer)?;
        device.reset_fences(&[slot.fence])?;

        let command_buffers = &[slot.buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(command_buffers);
        device.queue_submit(queue, &[submit_info], slot.fence)?;

        let generation = self.tracker.submit();
        self.slots[index].submitted = Some(generation);
        self.disposer.advance(self.tracker.next_generation());
        trace!("Submitted generation {}.", generation);

        Ok(Some(generation))
    }

    /// Polls fences without blocking; returns the completed generation.
    pub unsafe fn gc(&mut self, device: &Device) -> BackendResult<u64> {
        for slot in self.slots.iter_mut() {
            let Some(generation) = slot.submitted else {
                continue;
            };
            if device.get_fence_status(slot.fence)? == vk::SuccessCode::SUCCESS {
                slot.submitted = None;
                self.tracker.signal(generation);
            }
        }
        Ok(self.tracker.completed())
    }

    /// Blocks until every submission finished.
    pub unsafe fn wait(&mut self, device: &Device) -> BackendResult<u64> {
        let fences = self
            .slots
            .iter()
            .filter(|s| s.submitted.is_some())
            .map(|s| s.fence)
            .collect::<Vec<_>>();
        if !fences.is_empty() {
            device.wait_for_fences(&fences, true, u64::MAX)?;
        }
        self.gc(device)
    }

    unsafe fn wait_for_oldest(&mut self, device: &Device) -> BackendResult<usize> {
        let (index, generation) = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.submitted.map(|g| (i, g)))
            .min_by_key(|(_, g)| *g)
            .ok_or(BackendError::Vulkan(vk::ErrorCode::UNKNOWN))?;

        warn!("All command buffers in flight; waiting on generation {}.", generation);
        device.wait_for_fences(&[self.slots[index].fence], true, u64::MAX)?;
        self.slots[index].submitted = None;
        self.tracker.signal(generation);
        Ok(index)
    }

    pub unsafe fn destroy(&mut self, device: &Device) {
        self.slots
            .iter()
            .for_each(|s| device.destroy_fence(s.fence, None));
        self.slots.clear();
        device.destroy_command_pool(self.pool, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_is_the_contiguous_prefix() {
        let mut tracker = SubmissionTracker::default();
        assert_eq!(tracker.completed(), 0);

        let first = tracker.submit();
        let second = tracker.submit();
        let third = tracker.submit();
        assert_eq!((first, second, third), (1, 2, 3));
        assert_eq!(tracker.completed(), 0);

        tracker.signal(second);
        assert_eq!(tracker.completed(), 0);
        assert!(!tracker.is_complete(second));

        tracker.signal(first);
        assert_eq!(tracker.completed(), 2);

        tracker.signal(third);
        assert_eq!(tracker.completed(), 3);
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.next_generation(), 4);
    }

    #[test]
    fn signaling_twice_is_harmless() {
        let mut tracker = SubmissionTracker::default();
        let generation = tracker.submit();
        tracker.signal(generation);
        tracker.signal(generation);
        assert_eq!(tracker.completed(), 1);
    }
}
