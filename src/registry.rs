// Copyright (C) 2019  Nexell Co., Ltd.
//
// This file is part of the nx-btc08 mining driver.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Pending-work queue and the in-flight job registry
//!
//! The chips hold a 4-deep job FIFO each; job ids on the wire are 3 bits
//! wide, so the driver keeps twice that many slots and a slot may only be
//! reused after its occupant has been handed back to the host.

use crate::hal;

use std::collections::VecDeque;

/// Depth of the on-chip job FIFO
pub const MAX_JOB_FIFO: usize = 4;

/// In-flight slots; wire job ids run 1..=JOB_ID_SLOTS
pub const JOB_ID_SLOTS: usize = MAX_JOB_FIFO * 2;

const JOB_ID_MASK: u8 = (JOB_ID_SLOTS - 1) as u8;

/// The scheduler reports "full" once this many works are pending
pub const QUEUE_FULL_LIMIT: usize = 10 * MAX_JOB_FIFO;

/// FIFO of works delivered by the host and not yet pushed to silicon
#[derive(Default)]
pub struct WorkQueue {
    items: VecDeque<hal::Work>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, work: hal::Work) {
        self.items.push_back(work);
    }

    pub fn dequeue(&mut self) -> Option<hal::Work> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= QUEUE_FULL_LIMIT
    }

    /// Empty the queue, handing the remaining works back to the caller
    pub fn drain(&mut self) -> Vec<hal::Work> {
        self.items.drain(..).collect()
    }
}

/// In-flight job table indexed by `job_id - 1`
pub struct JobRegistry {
    slots: [Option<hal::Work>; JOB_ID_SLOTS],
    /// Slot index the next job will land in; advances modulo 8
    last_queued_id: u8,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            last_queued_id: 0,
        }
    }

    /// Wire job id the next installed work will run under (1..=8)
    pub fn next_job_id(&self) -> u8 {
        self.last_queued_id + 1
    }

    /// Clear the slot the next job will occupy. A displaced occupant has
    /// exhausted its nonce range and belongs back to the host.
    pub fn evict_next_slot(&mut self) -> Option<hal::Work> {
        self.slots[self.last_queued_id as usize].take()
    }

    /// Install work under `next_job_id` and advance the allocator.
    /// Only call after the silicon accepted the job.
    pub fn commit(&mut self, work: hal::Work) -> u8 {
        let job_id = self.next_job_id();
        self.slots[self.last_queued_id as usize] = Some(work);
        self.last_queued_id = job_id & JOB_ID_MASK;
        job_id
    }

    /// Look up the in-flight work for a wire job id; `None` is a stale result
    pub fn get_mut(&mut self, job_id: u8) -> Option<&mut hal::Work> {
        debug_assert!(job_id >= 1 && job_id as usize <= JOB_ID_SLOTS);
        self.slots[(job_id - 1) as usize].as_mut()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Take out every in-flight work (flush path)
    pub fn drain(&mut self) -> Vec<hal::Work> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.take())
            .collect()
    }

    /// Restart id allocation; the caller must have drained the slots
    pub fn reset(&mut self) {
        debug_assert_eq!(self.in_flight(), 0);
        self.last_queued_id = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::null_work;

    #[test]
    fn test_queue_order_and_threshold() {
        let mut queue = WorkQueue::new();
        assert!(queue.dequeue().is_none());
        for i in 0..QUEUE_FULL_LIMIT {
            assert!(!queue.is_full());
            queue.enqueue(null_work::prepare(i as u64));
        }
        assert!(queue.is_full());
        assert_eq!(queue.len(), 40);
        let first = queue.dequeue().expect("queue is empty");
        assert_eq!(first.midstates[0][0..8], 0u64.to_le_bytes()[..]);
        assert!(!queue.is_full());
    }

    #[test]
    fn test_queue_drain() {
        let mut queue = WorkQueue::new();
        for i in 0..3 {
            queue.enqueue(null_work::prepare(i));
        }
        assert_eq!(queue.drain().len(), 3);
        assert_eq!(queue.len(), 0);
    }

    /// Successive commits walk the ids 1, 2, ... 8 and wrap back to 1
    #[test]
    fn test_job_id_sequence() {
        let mut registry = JobRegistry::new();
        let mut seen = Vec::new();
        for i in 0..=JOB_ID_SLOTS {
            assert_eq!(registry.next_job_id() as usize, (i % JOB_ID_SLOTS) + 1);
            registry.evict_next_slot();
            seen.push(registry.commit(null_work::prepare(i as u64)));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7, 8, 1]);
    }

    #[test]
    fn test_slot_reuse_evicts_prior_work() {
        let mut registry = JobRegistry::new();
        for i in 0..JOB_ID_SLOTS {
            assert!(registry.evict_next_slot().is_none());
            registry.commit(null_work::prepare(i as u64));
        }
        assert_eq!(registry.in_flight(), JOB_ID_SLOTS);

        // slot 1 comes around again; its occupant is displaced first
        let displaced = registry.evict_next_slot().expect("slot should be taken");
        assert_eq!(displaced.midstates[0][0..8], 0u64.to_le_bytes()[..]);
        let job_id = registry.commit(null_work::prepare(100));
        assert_eq!(job_id, 1);
        assert_eq!(registry.in_flight(), JOB_ID_SLOTS);
    }

    #[test]
    fn test_lookup_and_stale() {
        let mut registry = JobRegistry::new();
        registry.commit(null_work::prepare(7));
        assert!(registry.get_mut(1).is_some());
        // no work ever ran under id 3
        assert!(registry.get_mut(3).is_none());
    }

    #[test]
    fn test_drain_and_reset() {
        let mut registry = JobRegistry::new();
        for i in 0..3 {
            registry.commit(null_work::prepare(i));
        }
        let drained = registry.drain();
        assert_eq!(drained.len(), 3);
        registry.reset();
        assert_eq!(registry.next_job_id(), 1);
    }
}
