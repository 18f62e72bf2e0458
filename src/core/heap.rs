//! Binary max-heap of prioritised messages stored in a [`SharedArray`].
//!
//! Each element is `[priority i32 LE][payload]`. The heap owns ordering
//! only: callers must hold the region's exclusive lock around `push` and
//! `pop`, since another process mutating the same array mid-sift leaves the
//! heap inconsistent.
//!
//! Equal priorities never swap, so for a given insertion sequence the pop
//! order of ties is reproducible, though not FIFO.

use crate::core::array::{array_size, SharedArray};
use crate::core::region::SharedRegion;
use crate::core::{Error, Result};

pub const PRIORITY_SIZE: usize = 4;

/// A message as stored in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageView<'a> {
    pub priority: i32,
    pub payload: &'a [u8],
}

impl<'a> MessageView<'a> {
    fn decode(elem: &'a [u8]) -> Result<Self> {
        if elem.len() < PRIORITY_SIZE {
            return Err(Error::Corrupt("heap slot shorter than priority header"));
        }
        let (prio, payload) = elem.split_at(PRIORITY_SIZE);
        let prio: [u8; PRIORITY_SIZE] = prio
            .try_into()
            .map_err(|_| Error::Corrupt("heap slot shorter than priority header"))?;
        Ok(Self {
            priority: i32::from_le_bytes(prio),
            payload,
        })
    }
}

/// Region bytes needed for a heap of `capacity` messages of at most
/// `max_message_size` payload bytes.
pub fn required_region_size(capacity: usize, max_message_size: usize) -> Result<usize> {
    if capacity == 0 || max_message_size == 0 {
        return Err(Error::InvalidConfig("queue size cannot be zero"));
    }
    let elem_size = max_message_size
        .checked_add(PRIORITY_SIZE)
        .ok_or(Error::InvalidConfig("message size overflows"))?;
    array_size(capacity, elem_size)
}

/// Smallest region that can hold heap bookkeeping at all.
pub fn min_region_size() -> usize {
    crate::core::array::ARRAY_HEADER_SIZE
}

pub struct SharedHeap<R> {
    array: SharedArray<R>,
}

impl<R: SharedRegion> SharedHeap<R> {
    pub fn create(region: R, capacity: usize, max_message_size: usize) -> Result<Self> {
        if capacity == 0 || max_message_size == 0 {
            return Err(Error::InvalidConfig("queue size cannot be zero"));
        }
        let elem_size = max_message_size
            .checked_add(PRIORITY_SIZE)
            .ok_or(Error::InvalidConfig("message size overflows"))?;
        Ok(Self {
            array: SharedArray::create(region, capacity, elem_size)?,
        })
    }

    pub fn open(region: R) -> Result<Self> {
        let array = SharedArray::open(region)?;
        if array.elem_size() < PRIORITY_SIZE {
            return Err(Error::Corrupt("heap element smaller than priority header"));
        }
        Ok(Self { array })
    }

    pub fn region(&self) -> &R {
        self.array.region()
    }

    pub fn max_message_size(&self) -> usize {
        self.array.elem_size() - PRIORITY_SIZE
    }

    pub fn max_size(&self) -> usize {
        self.array.capacity()
    }

    /// Exact length; caller must hold the lock.
    pub fn exclusive_len(&self) -> usize {
        self.array.len()
    }

    /// Lock-free length that may undercount a push in flight but never
    /// reports a message that is not there.
    pub fn observer_len(&self) -> usize {
        self.array.safe_len()
    }

    pub fn is_full(&self) -> bool {
        self.exclusive_len() >= self.max_size()
    }

    pub fn peek_max(&self) -> Result<MessageView<'_>> {
        if self.array.is_empty() {
            return Err(Error::QueueEmpty);
        }
        MessageView::decode(self.array.at(0)?)
    }

    pub fn push(&mut self, priority: i32, payload: &[u8]) -> Result<()> {
        if self.is_full() {
            return Err(Error::CapacityExceeded);
        }
        if payload.len() > self.max_message_size() {
            return Err(Error::MessageTooLarge {
                len: payload.len(),
                max: self.max_message_size(),
            });
        }
        self.array.push_back(&priority.to_le_bytes(), payload)?;
        let last = self.array.len() - 1;
        self.sift_up(last)
    }

    /// Copies the highest-priority payload into `buf` and removes it.
    ///
    /// Returns `(payload_len, priority)`. When `buf` is too small the heap is
    /// left untouched so the call can be retried with a larger buffer.
    pub fn pop(&mut self, buf: &mut [u8]) -> Result<(usize, i32)> {
        let (len, priority) = {
            let top = self.peek_max()?;
            if top.payload.len() > buf.len() {
                return Err(Error::BufferTooSmall {
                    needed: top.payload.len(),
                    available: buf.len(),
                });
            }
            buf[..top.payload.len()].copy_from_slice(top.payload);
            (top.payload.len(), top.priority)
        };
        let last = self.array.len() - 1;
        self.array.swap(0, last);
        self.array.pop_back()?;
        self.sift_down(0)?;
        Ok((len, priority))
    }

    fn priority(&self, index: usize) -> Result<i32> {
        Ok(MessageView::decode(self.array.at(index)?)?.priority)
    }

    fn sift_up(&mut self, mut index: usize) -> Result<()> {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.priority(index)? <= self.priority(parent)? {
                break;
            }
            self.array.swap(index, parent);
            index = parent;
        }
        Ok(())
    }

    fn sift_down(&mut self, mut index: usize) -> Result<()> {
        let len = self.array.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                return Ok(());
            }
            let right = left + 1;
            let mut child = left;
            if right < len && self.priority(right)? > self.priority(left)? {
                child = right;
            }
            if self.priority(child)? <= self.priority(index)? {
                return Ok(());
            }
            self.array.swap(index, child);
            index = child;
        }
    }
}
