use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ptr::copy_nonoverlapping as memcpy;
use std::sync::Arc;

use log::*;
use vulkanalia::prelude::v1_0::*;
use vulkanalia_vma::{self as vma, Alloc};

use crate::error::{BackendError, BackendResult};

/// Index of the lowest memory type allowed by `type_bits` whose properties
/// contain `required`.
pub fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> BackendResult<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|i| {
            let allowed = type_bits & (1 << i) != 0;
            let memory_type = memory_properties.memory_types[*i as usize];
            allowed && memory_type.property_flags.contains(required)
        })
        .ok_or(BackendError::NoMatchingMemoryType {
            type_bits,
            required,
        })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryPoolKind {
    GpuLocal,
    CpuVisible,
}

impl MemoryPoolKind {
    pub fn required_properties(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::GpuLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::CpuVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }
}

/// A sub-allocation handed out by a [`MemoryPool`]. The allocation itself
/// stays with the pool; this is only its receipt.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoryBlock {
    pub id: u64,
    pub size: vk::DeviceSize,
    pub pool: MemoryPoolKind,
}

/// Live allocations of one pool keyed by block id.
struct Ledger<A> {
    next_id: u64,
    live: HashMap<u64, (A, vk::DeviceSize)>,
}

impl<A> Ledger<A> {
    fn new() -> Self {
        Self {
            next_id: 1,
            live: HashMap::new(),
        }
    }

    fn insert(&mut self, allocation: A, size: vk::DeviceSize) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, (allocation, size));
        id
    }

    fn get(&self, id: u64) -> Option<&A> {
        self.live.get(&id).map(|(allocation, _)| allocation)
    }

    fn remove(&mut self, id: u64) -> Option<A> {
        self.live.remove(&id).map(|(allocation, _)| allocation)
    }

    fn len(&self) -> usize {
        self.live.len()
    }

    fn bytes(&self) -> vk::DeviceSize {
        self.live.values().map(|(_, size)| size).sum()
    }
}

/// One VMA pool pinned to the memory type its [`MemoryPoolKind`] resolves
/// to. Frees go through the disposer, which hands blocks back with `free`.
pub struct MemoryPool {
    kind: MemoryPoolKind,
    memory_type_index: u32,
    // Dropped before `allocator`.
    pool: vma::Pool,
    allocator: Arc<vma::Allocator>,
    ledger: RefCell<Ledger<vma::Allocation>>,
}

impl MemoryPool {
    pub unsafe fn new(
        allocator: &Arc<vma::Allocator>,
        kind: MemoryPoolKind,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
    ) -> BackendResult<Self> {
        let memory_type_index =
            select_memory_type(memory_properties, u32::MAX, kind.required_properties())?;

        let mut options = vma::PoolOptions::default();
        options.memory_type_index = memory_type_index;
        let pool = allocator.create_pool(&options)?;
        debug!("{:?} pool uses memory type {}.", kind, memory_type_index);

        Ok(Self {
            kind,
            memory_type_index,
            pool,
            allocator: allocator.clone(),
            ledger: RefCell::new(Ledger::new()),
        })
    }

    /// Creates an image bound to memory from this pool.
    pub unsafe fn create_image(
        &self,
        device: &Device,
        info: vk::ImageCreateInfo,
    ) -> BackendResult<(vk::Image, MemoryBlock)> {
        let (image, allocation) = self
            .pool
            .create_image(info, &vma::AllocationOptions::default())?;
        let size = device.get_image_memory_requirements(image).size;
        Ok((image, self.track(allocation, size)))
    }

    /// Creates a buffer bound to memory from this pool.
    pub unsafe fn create_buffer(
        &self,
        device: &Device,
        info: vk::BufferCreateInfo,
    ) -> BackendResult<(vk::Buffer, MemoryBlock)> {
        let (buffer, allocation) = self
            .pool
            .create_buffer(info, &vma::AllocationOptions::default())?;
        let size = device.get_buffer_memory_requirements(buffer).size;
        Ok((buffer, self.track(allocation, size)))
    }

    fn track(&self, allocation: vma::Allocation, size: vk::DeviceSize) -> MemoryBlock {
        let id = self.ledger.borrow_mut().insert(allocation, size);
        trace!("{:?} pool: allocated block #{} ({} bytes).", self.kind, id, size);
        MemoryBlock {
            id,
            size,
            pool: self.kind,
        }
    }

    /// Copies `bytes` to the start of a host-visible block.
    pub unsafe fn write(&self, block: MemoryBlock, bytes: &[u8]) -> BackendResult<()> {
        debug_assert!(bytes.len() as u64 <= block.size);
        let allocation = match self.ledger.borrow().get(block.id) {
            Some(allocation) => *allocation,
            None => return Err(BackendError::Vulkan(vk::ErrorCode::MEMORY_MAP_FAILED)),
        };
        let memory = self.allocator.map_memory(allocation)?;
        memcpy(bytes.as_ptr(), memory.cast(), bytes.len());
        self.allocator.unmap_memory(allocation);
        Ok(())
    }

    /// Returns a block to the pool. The resources bound to it must already be
    /// destroyed.
    pub unsafe fn free(&self, block: MemoryBlock) {
        debug_assert_eq!(block.pool, self.kind);
        match self.ledger.borrow_mut().remove(block.id) {
            Some(allocation) => self.allocator.free_memory(allocation),
            None => warn!("{:?} pool: block #{} freed twice.", self.kind, block.id),
        }
    }

    /// Frees every block still live so the pool can be destroyed. Only valid
    /// once the device is idle.
    pub unsafe fn free_all(&self) {
        let leaked = std::mem::replace(&mut *self.ledger.borrow_mut(), Ledger::new());
        for (allocation, _) in leaked.live.into_values() {
            self.allocator.free_memory(allocation);
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.ledger.borrow().len()
    }

    pub fn live_bytes(&self) -> u64 {
        self.ledger.borrow().bytes()
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("kind", &self.kind)
            .field("memory_type_index", &self.memory_type_index)
            .field("live_allocations", &self.live_allocations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = flags.len() as u32;
        for (i, flags) in flags.iter().enumerate() {
            properties.memory_types[i].property_flags = *flags;
        }
        properties
    }

    #[test]
    fn picks_lowest_index_satisfying_both_constraints() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let properties = properties(&[
            host,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            host,
            host | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        // Bits select {1, 3}; only 3 is host visible.
        let index = select_memory_type(&properties, 0b1010, host).unwrap();
        assert_eq!(index, 3);

        let index =
            select_memory_type(&properties, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn types_beyond_reported_count_are_ignored() {
        let mut properties = properties(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        properties.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let result =
            select_memory_type(&properties, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert!(matches!(
            result,
            Err(BackendError::NoMatchingMemoryType { type_bits: 0b11, .. })
        ));
    }

    #[test]
    fn pool_memory_types_follow_their_property_class() {
        let memory = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let gpu = MemoryPoolKind::GpuLocal.required_properties();
        let cpu = MemoryPoolKind::CpuVisible.required_properties();
        assert_eq!(select_memory_type(&memory, u32::MAX, gpu).unwrap(), 0);
        assert_eq!(select_memory_type(&memory, u32::MAX, cpu).unwrap(), 1);
    }

    #[test]
    fn ledger_counts_live_blocks_and_refuses_double_free() {
        let mut ledger = Ledger::new();
        let a = ledger.insert('a', 256);
        let b = ledger.insert('b', 1024);
        assert_ne!(a, b);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.bytes(), 1280);
        assert_eq!(ledger.get(b), Some(&'b'));

        assert_eq!(ledger.remove(a), Some('a'));
        assert_eq!(ledger.remove(a), None);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.bytes(), 1024);
    }
}
