//! Bounded multi-producer multi-consumer queue.
//!
//! The one concurrent primitive this crate offers to collaborators (the
//! logger drains it from whichever thread holds the write lock). The core
//! graph itself never touches it; all graph state is single-threaded.
//!
//! Classic sequence-per-cell design: capacity is a power of two, each cell
//! carries a sequence counter that encodes whether it is ready for the next
//! write or the next read, and producers/consumers claim positions with a
//! CAS. Push and pop never block; a full or empty queue reports failure
//! instead.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

#[repr(align(64))]
struct CachePadded<T>(T);

struct Cell<T> {
    sequence: AtomicU64,
    data: UnsafeCell<MaybeUninit<T>>,
}

pub struct MpmcQueue<T> {
    buffer: Box<[Cell<T>]>,
    buffer_mask: u64,
    enqueue_pos: CachePadded<AtomicU64>,
    dequeue_pos: CachePadded<AtomicU64>,
}

unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> MpmcQueue<T> {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "queue capacity must be a power of two"
        );
        let buffer: Box<[Cell<T>]> = (0..capacity)
            .map(|it| Cell {
                sequence: AtomicU64::new(it as u64),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        MpmcQueue {
            buffer,
            buffer_mask: (capacity - 1) as u64,
            enqueue_pos: CachePadded(AtomicU64::new(0)),
            dequeue_pos: CachePadded(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the value back when the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.0.load(Ordering::Relaxed);
        let cell = loop {
            let cell = &self.buffer[(pos & self.buffer_mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as i64 - pos as i64;
            if diff == 0 {
                match self.enqueue_pos.0.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break cell,
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.enqueue_pos.0.load(Ordering::Relaxed);
            }
        };
        unsafe { (*cell.data.get()).write(value) };
        cell.sequence.store(pos + 1, Ordering::Release);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.0.load(Ordering::Relaxed);
        let cell = loop {
            let cell = &self.buffer[(pos & self.buffer_mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as i64 - (pos + 1) as i64;
            if diff == 0 {
                match self.dequeue_pos.0.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break cell,
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.0.load(Ordering::Relaxed);
            }
        };
        let value = unsafe { (*cell.data.get()).assume_init_read() };
        cell.sequence
            .store(pos + self.buffer_mask + 1, Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order_single_thread() {
        let queue = MpmcQueue::new(8);
        for it in 0..8 {
            queue.push(it).unwrap();
        }
        assert_eq!(queue.push(99), Err(99));
        for it in 0..8 {
            assert_eq!(queue.pop(), Some(it));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    #[should_panic]
    fn capacity_must_be_power_of_two() {
        let _ = MpmcQueue::<u32>::new(6);
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        const PER_PRODUCER: u64 = 1000;
        let queue = Arc::new(MpmcQueue::new(64));
        let mut producers = Vec::new();
        for base in 0..4u64 {
            let queue = Arc::clone(&queue);
            producers.push(std::thread::spawn(move || {
                for it in 0..PER_PRODUCER {
                    let mut value = base * PER_PRODUCER + it;
                    loop {
                        match queue.push(value) {
                            Ok(()) => break,
                            Err(back) => {
                                value = back;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            consumers.push(std::thread::spawn(move || {
                let mut sum = 0u64;
                let mut received = 0u64;
                while received < PER_PRODUCER {
                    if let Some(value) = queue.pop() {
                        sum += value;
                        received += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
                sum
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }
        let total: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        let n = 4 * PER_PRODUCER;
        assert_eq!(total, n * (n - 1) / 2);
    }
}
