use log::*;
use parking_lot::Mutex;
use vulkanalia::prelude::v1_0::*;

use crate::error::{BackendError, BackendResult};

/// Fixed set of slot indices with a lock-guarded in-use bitset.
#[derive(Debug)]
pub struct QuerySlots {
    capacity: u32,
    used: Mutex<u32>,
}

impl QuerySlots {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0 && capacity <= u32::BITS);
        Self {
            capacity,
            used: Mutex::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Never blocks on the GPU; an exhausted pool fails the request.
    pub fn acquire(&self) -> BackendResult<u32> {
        let mut used = self.used.lock();
        let index = used.trailing_ones();
        if index >= self.capacity {
            return Err(BackendError::QueryPoolExhausted {
                capacity: self.capacity,
            });
        }
        *used |= 1 << index;
        Ok(index)
    }

    /// Only call once the GPU resolved every query written to `index`.
    pub fn release(&self, index: u32) {
        debug_assert!(index < self.capacity);
        let mut used = self.used.lock();
        debug_assert!(*used & (1 << index) != 0, "slot {index} released twice");
        *used &= !(1 << index);
    }

    pub fn in_use(&self) -> u32 {
        self.used.lock().count_ones()
    }
}

/// A timer occupying slot `index`: query `2 * index` holds the start stamp and
/// `2 * index + 1` the end stamp.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimerQuery {
    pub index: u32,
    /// Submission carrying the end stamp, once written.
    pub generation: Option<u64>,
}

impl TimerQuery {
    pub fn start_query(&self) -> u32 {
        self.index * 2
    }

    pub fn stop_query(&self) -> u32 {
        self.index * 2 + 1
    }
}

/// Timestamp query pool shared by every submission context.
#[derive(Debug)]
pub struct VulkanTimestamps {
    pool: vk::QueryPool,
    slots: QuerySlots,
    period_ns: f64,
}

impl VulkanTimestamps {
    pub unsafe fn create(device: &Device, capacity: u32, period_ns: f32) -> BackendResult<Self> {
        let info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(capacity * 2);
        let pool = device.create_query_pool(&info, None)?;
        debug!(
            "Created timestamp pool with {} timers ({:.3} ns per tick).",
            capacity, period_ns
        );

        Ok(Self {
            pool,
            slots: QuerySlots::new(capacity),
            period_ns: f64::from(period_ns),
        })
    }

    pub fn pool(&self) -> vk::QueryPool {
        self.pool
    }

    pub fn slots(&self) -> &QuerySlots {
        &self.slots
    }

    pub unsafe fn begin(
        &self,
        device: &Device,
        command_buffer: vk::CommandBuffer,
    ) -> BackendResult<TimerQuery> {
        let query = TimerQuery {
            index: self.slots.acquire()?,
            generation: None,
        };
        device.cmd_reset_query_pool(command_buffer, self.pool, query.start_query(), 2);
        device.cmd_write_timestamp(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            self.pool,
            query.start_query(),
        );
        Ok(query)
    }

    pub unsafe fn end(
        &self,
        device: &Device,
        command_buffer: vk::CommandBuffer,
        query: &mut TimerQuery,
        generation: u64,
    ) {
        device.cmd_write_timestamp(
            command_buffer,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            self.pool,
            query.stop_query(),
        );
        query.generation = Some(generation);
    }

    /// Elapsed GPU time in nanoseconds. The caller guarantees the submission
    /// carrying the end stamp has completed.
    pub unsafe fn elapsed_ns(&self, device: &Device, query: &TimerQuery) -> BackendResult<u64> {
        let mut data = [0u8; 16];
        let result = device.get_query_pool_results(
            self.pool,
            query.start_query(),
            2,
            &mut data,
            8,
            vk::QueryResultFlags::_64,
        )?;
        if result == vk::SuccessCode::NOT_READY {
            return Err(BackendError::QueryNotReady);
        }

        let (start, stop) = data.split_at(8);
        let start = u64::from_ne_bytes(start.try_into().unwrap_or_default());
        let stop = u64::from_ne_bytes(stop.try_into().unwrap_or_default());
        Ok(ticks_to_ns(stop.saturating_sub(start), self.period_ns))
    }

    pub unsafe fn destroy(&self, device: &Device) {
        let outstanding = self.slots.in_use();
        if outstanding > 0 {
            warn!("Destroying timestamp pool with {} timers in use.", outstanding);
        }
        device.destroy_query_pool(self.pool, None);
    }
}

fn ticks_to_ns(ticks: u64, period_ns: f64) -> u64 {
    (ticks as f64 * period_ns).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_hands_out_lowest_free_slot() {
        let slots = QuerySlots::new(4);
        assert_eq!(slots.acquire().unwrap(), 0);
        assert_eq!(slots.acquire().unwrap(), 1);
        assert_eq!(slots.acquire().unwrap(), 2);
        slots.release(1);
        assert_eq!(slots.acquire().unwrap(), 1);
        assert_eq!(slots.in_use(), 3);
    }

    #[test]
    fn exhausted_pool_fails_instead_of_blocking() {
        let slots = QuerySlots::new(2);
        slots.acquire().unwrap();
        slots.acquire().unwrap();
        assert!(matches!(
            slots.acquire(),
            Err(BackendError::QueryPoolExhausted { capacity: 2 })
        ));
        slots.release(0);
        assert_eq!(slots.acquire().unwrap(), 0);
    }

    #[test]
    fn full_width_pool_is_usable() {
        let slots = QuerySlots::new(32);
        for expected in 0..32 {
            assert_eq!(slots.acquire().unwrap(), expected);
        }
        assert!(slots.acquire().is_err());
    }

    #[test]
    fn concurrent_acquire_never_duplicates() {
        const CAPACITY: u32 = 24;
        let slots = Arc::new(QuerySlots::new(CAPACITY));

        let handles = (0..8)
            .map(|_| {
                let slots = Arc::clone(&slots);
                thread::spawn(move || {
                    (0..CAPACITY)
                        .filter_map(|_| slots.acquire().ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for handle in handles {
            for index in handle.join().unwrap() {
                assert!(seen.insert(index), "slot {index} handed out twice");
            }
        }
        assert_eq!(seen.len() as u32, CAPACITY);
        assert_eq!(slots.in_use(), CAPACITY);
    }

    #[test]
    fn outstanding_never_exceeds_capacity_under_churn() {
        let slots = Arc::new(QuerySlots::new(3));
        let handles = (0..4)
            .map(|_| {
                let slots = Arc::clone(&slots);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Ok(index) = slots.acquire() {
                            assert!(slots.in_use() <= 3);
                            slots.release(index);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(slots.in_use(), 0);
    }

    #[test]
    fn timer_maps_to_query_pair() {
        let query = TimerQuery {
            index: 5,
            generation: None,
        };
        assert_eq!((query.start_query(), query.stop_query()), (10, 11));
        assert_eq!(ticks_to_ns(1000, 0.5), 500);
    }
}
