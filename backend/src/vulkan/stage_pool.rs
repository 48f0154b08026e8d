use log::*;
use vulkanalia::prelude::v1_0::*;

use super::memory::{MemoryBlock, MemoryPool};
use crate::error::BackendResult;

/// A host-visible buffer used as the source of one upload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VulkanStage {
    pub buffer: vk::Buffer,
    pub memory: MemoryBlock,
    pub size: vk::DeviceSize,
}

impl VulkanStage {
    /// `pool` must be the CPU-visible pool the stage came from.
    pub unsafe fn write(&self, pool: &MemoryPool, bytes: &[u8]) -> BackendResult<()> {
        debug_assert!(bytes.len() as u64 <= self.size);
        pool.write(self.memory, bytes)
    }
}

/// Recycles staging buffers once the submission that read them completed.
#[derive(Debug, Default)]
pub struct VulkanStagePool {
    free: Vec<VulkanStage>,
    in_flight: Vec<(u64, VulkanStage)>,
}

impl VulkanStagePool {
    /// Smallest free stage of at least `size` bytes, removed from the free list.
    fn take_free(&mut self, size: vk::DeviceSize) -> Option<VulkanStage> {
        let index = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, stage)| stage.size >= size)
            .min_by_key(|(_, stage)| stage.size)
            .map(|(i, _)| i)?;
        Some(self.free.swap_remove(index))
    }

    pub unsafe fn acquire(
        &mut self,
        device: &Device,
        pool: &MemoryPool,
        size: vk::DeviceSize,
    ) -> BackendResult<VulkanStage> {
        if let Some(stage) = self.take_free(size) {
            return Ok(stage);
        }

        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let (buffer, memory) = pool.create_buffer(device, info)?;

        debug!("Created {} byte staging buffer.", size);
        Ok(VulkanStage {
            buffer,
            memory,
            size,
        })
    }

    /// The stage was read by the submission tagged `generation`.
    pub fn retire(&mut self, stage: VulkanStage, generation: u64) {
        self.in_flight.push((generation, stage));
    }

    pub fn gc(&mut self, completed: u64) {
        let (done, pending): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|(generation, _)| *generation <= completed);
        self.in_flight = pending;
        self.free.extend(done.into_iter().map(|(_, stage)| stage));
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Only valid once the device is idle.
    pub unsafe fn destroy(&mut self, device: &Device, pool: &MemoryPool) {
        let stages = self
            .free
            .drain(..)
            .chain(self.in_flight.drain(..).map(|(_, stage)| stage))
            .collect::<Vec<_>>();
        for stage in stages {
            device.destroy_buffer(stage.buffer, None);
            pool.free(stage.memory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::memory::MemoryPoolKind;
    use vulkanalia::vk::Handle;

    fn stage(raw: u64, size: vk::DeviceSize) -> VulkanStage {
        VulkanStage {
            buffer: vk::Buffer::from_raw(raw),
            memory: MemoryBlock {
                id: raw,
                size,
                pool: MemoryPoolKind::CpuVisible,
            },
            size,
        }
    }

    #[test]
    fn stages_return_only_after_completion() {
        let mut pool = VulkanStagePool::default();
        pool.retire(stage(1, 64), 3);
        pool.retire(stage(2, 64), 5);

        pool.gc(2);
        assert_eq!(pool.free_count(), 0);
        pool.gc(4);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.take_free(16), Some(stage(1, 64)));
        assert_eq!(pool.take_free(16), None);
    }

    #[test]
    fn smallest_fitting_stage_is_reused() {
        let mut pool = VulkanStagePool::default();
        pool.retire(stage(1, 1024), 1);
        pool.retire(stage(2, 128), 1);
        pool.retire(stage(3, 32), 1);
        pool.gc(1);

        assert_eq!(pool.take_free(100), Some(stage(2, 128)));
        assert_eq!(pool.take_free(2048), None);
        assert_eq!(pool.free_count(), 2);
    }
}
