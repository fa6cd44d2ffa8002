//! Pools of reusable metadata I/O buffers.
//!
//! Each allocator and the scrubber own a fixed-size pool; metadata reads
//! and writes borrow a buffer and return it when done. When the pool is
//! empty the requester parks on a FIFO waiter queue and is handed the next
//! returned buffer in arrival order.

use crate::types::BLOCK_SIZE;
use crate::wait_queue::WaitQueue;

pub struct VioBuffer {
    data: Box<[u8; BLOCK_SIZE]>,
}

impl VioBuffer {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; BLOCK_SIZE]),
        }
    }

    pub fn data(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data
    }
}

pub struct VioPool<W> {
    free: Vec<VioBuffer>,
    waiters: WaitQueue<W>,
    size: usize,
}

impl<W> VioPool<W> {
    pub fn new(size: usize) -> Self {
        Self {
            free: (0..size).map(|_| VioBuffer::new()).collect(),
            waiters: WaitQueue::new(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Borrow a buffer, or park the waiter if the pool is exhausted.
    pub fn acquire(&mut self, waiter: W) -> Result<VioBuffer, ()> {
        match self.free.pop() {
            Some(buffer) => Ok(buffer),
            None => {
                self.waiters.enqueue(waiter);
                Err(())
            }
        }
    }

    /// Return a buffer. If a waiter is queued, the buffer is handed to it
    /// instead of going back on the free list.
    pub fn release(&mut self, mut buffer: VioBuffer) -> Option<(W, VioBuffer)> {
        buffer.data.fill(0);
        match self.waiters.notify_next() {
            Some(waiter) => Some((waiter, buffer)),
            None => {
                self.free.push(buffer);
                None
            }
        }
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.has_waiters()
    }

    /// Whether every buffer is home; the quiescent condition for drains.
    pub fn is_full(&self) -> bool {
        self.free.len() == self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_queues_waiters_in_order() {
        let mut pool: VioPool<u32> = VioPool::new(2);
        let a = pool.acquire(1).unwrap();
        let _b = pool.acquire(2).unwrap();
        assert!(pool.acquire(3).is_err());
        assert!(pool.acquire(4).is_err());
        assert!(pool.has_waiters());

        // The first waiter gets the returned buffer directly.
        let (waiter, buffer) = pool.release(a).unwrap();
        assert_eq!(waiter, 3);
        let (waiter, buffer) = pool.release(buffer).unwrap();
        assert_eq!(waiter, 4);
        assert!(pool.release(buffer).is_none());
        assert!(!pool.is_full());
    }

    #[test]
    fn buffers_come_back_zeroed() {
        let mut pool: VioPool<u32> = VioPool::new(1);
        let mut buffer = pool.acquire(0).unwrap();
        buffer.data_mut()[0] = 0xFF;
        pool.release(buffer);
        let buffer = pool.acquire(0).unwrap();
        assert_eq!(buffer.data()[0], 0);
    }
}
