// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::collections::raw_array::RawArray;
use crate::runtime::{
    fail::{
        Fail,
        FailKind,
    },
    memory::MbufHandle,
};
use ::parking_lot::Mutex;
use ::std::sync::{
    atomic::{
        AtomicUsize,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A fixed-capacity, multi-producer, multi-consumer burst queue of mbuf handles. Producers and consumers move bursts
/// of handles in one shot; both operations are non-blocking and return the count actually moved.
pub struct Ring {
    /// Underlying slot storage.
    buffer: RawArray<MbufHandle>,
    /// Pre-computed capacity mask.
    mask: usize,
    /// Index of the first occupied slot.
    front: AtomicUsize,
    /// Index of the first free slot after the last occupied one.
    back: AtomicUsize,
    /// Serializes producers.
    push_lock: Mutex<()>,
    /// Serializes consumers.
    pop_lock: Mutex<()>,
}

/// One ring per receive-side-scaling lane. Every edge in a packet-processing graph carries one of these.
pub type Rings = Arc<Vec<Ring>>;

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Ring {
    /// Creates a ring that holds `capacity` mbuf handles.
    pub fn new(capacity: usize) -> Result<Self, Fail> {
        if !capacity.is_power_of_two() {
            return Err(Fail::new(
                FailKind::BadArgument,
                "cannot create a ring that does not have a power of two capacity",
            ));
        }
        Ok(Self {
            buffer: RawArray::new(capacity)?,
            mask: capacity - 1,
            front: AtomicUsize::new(0),
            back: AtomicUsize::new(0),
            push_lock: Mutex::new(()),
            pop_lock: Mutex::new(()),
        })
    }

    /// Returns the capacity of the target ring.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Returns the number of occupied slots in the target ring. The value is approximate while producers and
    /// consumers are active; the scheduler uses it to gauge load only.
    pub fn len(&self) -> usize {
        let front: usize = self.front.load(Ordering::Relaxed);
        let back: usize = self.back.load(Ordering::Relaxed);
        back.wrapping_sub(front)
    }

    /// Places as many handles from `data` as fit into the target ring. Returns the number of handles enqueued.
    pub fn enqueue_burst(&self, data: &[MbufHandle]) -> usize {
        let _guard = self.push_lock.lock();
        let front: usize = self.front.load(Ordering::Acquire);
        let back: usize = self.back.load(Ordering::Relaxed);
        let free: usize = self.capacity() - back.wrapping_sub(front);
        let count: usize = free.min(data.len());
        for (i, handle) in data.iter().take(count).enumerate() {
            unsafe {
                let slots: &mut [MbufHandle] = self.buffer.get_mut();
                slots[back.wrapping_add(i) & self.mask] = *handle;
            }
        }
        self.back.store(back.wrapping_add(count), Ordering::Release);
        count
    }

    /// Removes up to `out.len()` handles from the target ring. Returns the number of handles dequeued.
    pub fn dequeue_burst(&self, out: &mut [MbufHandle]) -> usize {
        let _guard = self.pop_lock.lock();
        let back: usize = self.back.load(Ordering::Acquire);
        let front: usize = self.front.load(Ordering::Relaxed);
        let available: usize = back.wrapping_sub(front);
        let count: usize = available.min(out.len());
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            unsafe {
                let slots: &mut [MbufHandle] = self.buffer.get_mut();
                *slot = slots[front.wrapping_add(i) & self.mask];
            }
        }
        self.front.store(front.wrapping_add(count), Ordering::Release);
        count
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Creates one ring per lane, each with the given capacity.
pub fn create_rings(capacity: usize, lanes: i32) -> Result<Rings, Fail> {
    if lanes <= 0 {
        return Err(Fail::new(FailKind::BadArgument, "lane count must be positive"));
    }
    let mut rings: Vec<Ring> = Vec::with_capacity(lanes as usize);
    for _ in 0..lanes {
        rings.push(Ring::new(capacity)?);
    }
    Ok(Arc::new(rings))
}

/// Sums the occupancy of every lane of the target rings.
pub fn total_len(rings: &Rings) -> usize {
    rings.iter().map(|r: &Ring| r.len()).sum()
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        create_rings,
        Ring,
        Rings,
    };
    use crate::runtime::memory::MbufHandle;
    use ::anyhow::Result;
    use ::std::thread;

    /// Tests if enqueue and dequeue move whole bursts and preserve order.
    #[test]
    fn burst_roundtrip() -> Result<()> {
        let ring: Ring = Ring::new(64)?;
        let input: Vec<MbufHandle> = (1..=32).collect();

        crate::ensure_eq!(ring.enqueue_burst(&input), 32);
        crate::ensure_eq!(ring.len(), 32);

        let mut output: [MbufHandle; 32] = [0; 32];
        crate::ensure_eq!(ring.dequeue_burst(&mut output), 32);
        crate::ensure_eq!(&output[..], &input[..]);
        crate::ensure_eq!(ring.len(), 0);
        Ok(())
    }

    /// Tests if enqueue stops at capacity and reports the shortfall.
    #[test]
    fn enqueue_is_best_effort() -> Result<()> {
        let ring: Ring = Ring::new(32)?;
        let input: Vec<MbufHandle> = (1..=40).collect();

        crate::ensure_eq!(ring.enqueue_burst(&input), 32);
        crate::ensure_eq!(ring.enqueue_burst(&input), 0);

        let mut output: [MbufHandle; 8] = [0; 8];
        crate::ensure_eq!(ring.dequeue_burst(&mut output), 8);
        crate::ensure_eq!(ring.enqueue_burst(&input[..16]), 8);
        Ok(())
    }

    /// Tests if dequeue on an empty ring returns immediately with zero.
    #[test]
    fn dequeue_empty() -> Result<()> {
        let ring: Ring = Ring::new(32)?;
        let mut output: [MbufHandle; 32] = [0; 32];
        crate::ensure_eq!(ring.dequeue_burst(&mut output), 0);
        Ok(())
    }

    /// Tests if rings reject capacities that are not a power of two.
    #[test]
    fn bad_capacity() -> Result<()> {
        crate::ensure_eq!(Ring::new(48).is_err(), true);
        Ok(())
    }

    /// Tests if every handle pushed by concurrent producers is seen exactly once by a concurrent consumer.
    #[test]
    fn concurrent_conservation() -> Result<()> {
        const PER_PRODUCER: usize = 4096;
        let rings: Rings = create_rings(1024, 1)?;

        let producers: Vec<thread::JoinHandle<()>> = (0..2)
            .map(|p: usize| {
                let rings: Rings = rings.clone();
                thread::spawn(move || {
                    let mut sent: usize = 0;
                    while sent < PER_PRODUCER {
                        let handle: MbufHandle = p * PER_PRODUCER + sent + 1;
                        sent += rings[0].enqueue_burst(&[handle]);
                    }
                })
            })
            .collect();

        let consumer: thread::JoinHandle<Vec<MbufHandle>> = {
            let rings: Rings = rings.clone();
            thread::spawn(move || {
                let mut seen: Vec<MbufHandle> = Vec::with_capacity(2 * PER_PRODUCER);
                let mut burst: [MbufHandle; 32] = [0; 32];
                while seen.len() < 2 * PER_PRODUCER {
                    let count: usize = rings[0].dequeue_burst(&mut burst);
                    seen.extend_from_slice(&burst[..count]);
                }
                seen
            })
        };

        for p in producers {
            p.join().expect("producer panicked");
        }
        let mut seen: Vec<MbufHandle> = consumer.join().expect("consumer panicked");
        seen.sort_unstable();
        seen.dedup();
        crate::ensure_eq!(seen.len(), 2 * PER_PRODUCER);
        Ok(())
    }
}
