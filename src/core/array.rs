//! Fixed-slot array laid out inside a shared region.
//!
//! ```text
//! +--------------------------- header (64 bytes) ---------------------------+
//! | magic u32 | capacity u32 | elem_size u32 | len u32 | safe_len u32 | pad |
//! +-------------------------------------------------------------------------+
//! | slot 0: [len u32][elem_size bytes] | slot 1 | ... | slot capacity-1     |
//! +-------------------------------------------------------------------------+
//! ```
//!
//! All header words are little-endian and accessed atomically. The array
//! performs no locking: every mutating call assumes the caller holds the
//! region's exclusive lock.

use std::mem::align_of;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::core::region::SharedRegion;
use crate::core::{Error, Result};

pub const ARRAY_HEADER_SIZE: usize = 64;
pub const ARRAY_MAGIC: u32 = 0x5341_5252; // 'SARR'
pub const SLOT_LEN_SIZE: usize = 4;

const MAGIC_OFFSET: usize = 0;
const CAPACITY_OFFSET: usize = 4;
const ELEM_SIZE_OFFSET: usize = 8;
const LEN_OFFSET: usize = 12;
const SAFE_LEN_OFFSET: usize = 16;

/// Bytes needed for an array of `capacity` elements of `elem_size` bytes.
pub fn array_size(capacity: usize, elem_size: usize) -> Result<usize> {
    if capacity > u32::MAX as usize || elem_size > u32::MAX as usize - SLOT_LEN_SIZE {
        return Err(Error::InvalidConfig("array dimensions exceed u32"));
    }
    (elem_size + SLOT_LEN_SIZE)
        .checked_mul(capacity)
        .and_then(|slots| slots.checked_add(ARRAY_HEADER_SIZE))
        .ok_or(Error::InvalidConfig("array size overflows usize"))
}

pub struct SharedArray<R> {
    region: R,
    base: *mut u8,
    capacity: usize,
    elem_size: usize,
}

// SAFETY: the array owns its region; the raw base pointer is only
// dereferenced through `&self`/`&mut self`.
unsafe impl<R: Send> Send for SharedArray<R> {}

impl<R: SharedRegion> SharedArray<R> {
    /// Formats `region` as an empty array.
    pub fn create(mut region: R, capacity: usize, elem_size: usize) -> Result<Self> {
        let required = array_size(capacity, elem_size)?;
        if region.len() < required {
            return Err(Error::InvalidConfig("region too small for requested capacity"));
        }
        let base = aligned_base(&mut region)?;
        let array = Self {
            region,
            base,
            capacity,
            elem_size,
        };
        array.word(CAPACITY_OFFSET).store(capacity as u32, Ordering::Relaxed);
        array.word(ELEM_SIZE_OFFSET).store(elem_size as u32, Ordering::Relaxed);
        array.word(LEN_OFFSET).store(0, Ordering::Relaxed);
        array.word(SAFE_LEN_OFFSET).store(0, Ordering::Relaxed);
        array.word(MAGIC_OFFSET).store(ARRAY_MAGIC, Ordering::Release);
        Ok(array)
    }

    /// Attaches to a region previously formatted by [`SharedArray::create`].
    pub fn open(mut region: R) -> Result<Self> {
        if region.len() < ARRAY_HEADER_SIZE {
            return Err(Error::Corrupt("region smaller than array header"));
        }
        let base = aligned_base(&mut region)?;
        let mut array = Self {
            region,
            base,
            capacity: 0,
            elem_size: 0,
        };
        if array.word(MAGIC_OFFSET).load(Ordering::Acquire) != ARRAY_MAGIC {
            return Err(Error::Corrupt("array magic mismatch"));
        }
        let capacity = array.word(CAPACITY_OFFSET).load(Ordering::Relaxed) as usize;
        let elem_size = array.word(ELEM_SIZE_OFFSET).load(Ordering::Relaxed) as usize;
        let required = array_size(capacity, elem_size)
            .map_err(|_| Error::Corrupt("array dimensions overflow"))?;
        if array.region.len() < required {
            return Err(Error::Corrupt("region smaller than recorded capacity"));
        }
        array.capacity = capacity;
        array.elem_size = elem_size;
        Ok(array)
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Exact length. Only stable while the caller holds the region lock.
    pub fn len(&self) -> usize {
        self.word(LEN_OFFSET).load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length safe to read without the lock. Never exceeds the number of
    /// fully written elements; may lag behind a push in flight.
    pub fn safe_len(&self) -> usize {
        self.word(SAFE_LEN_OFFSET).load(Ordering::Acquire) as usize
    }

    /// Logical bytes of element `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn at(&self, index: usize) -> Result<&[u8]> {
        let len = self.len();
        assert!(index < len, "index {index} out of bounds for shared array of length {len}");
        let slot = self.slot(index);
        let elem_len = u32::from_le_bytes(
            slot[..SLOT_LEN_SIZE]
                .try_into()
                .map_err(|_| Error::Corrupt("slot shorter than length prefix"))?,
        ) as usize;
        if elem_len > self.elem_size {
            return Err(Error::Corrupt("slot length exceeds element size"));
        }
        Ok(&slot[SLOT_LEN_SIZE..SLOT_LEN_SIZE + elem_len])
    }

    /// Appends `header` followed by `payload` as one element.
    pub fn push_back(&mut self, header: &[u8], payload: &[u8]) -> Result<()> {
        let len = self.len();
        if len >= self.capacity {
            return Err(Error::CapacityExceeded);
        }
        let elem_len = header.len() + payload.len();
        if elem_len > self.elem_size {
            return Err(Error::MessageTooLarge {
                len: elem_len,
                max: self.elem_size,
            });
        }
        let slot = self.slot_mut(len);
        slot[..SLOT_LEN_SIZE].copy_from_slice(&(elem_len as u32).to_le_bytes());
        let body = &mut slot[SLOT_LEN_SIZE..];
        body[..header.len()].copy_from_slice(header);
        body[header.len()..elem_len].copy_from_slice(payload);
        self.word(LEN_OFFSET).store(len as u32 + 1, Ordering::Release);
        self.word(SAFE_LEN_OFFSET).store(len as u32 + 1, Ordering::Release);
        Ok(())
    }

    /// Drops the last element.
    pub fn pop_back(&mut self) -> Result<()> {
        let len = self.len();
        if len == 0 {
            return Err(Error::QueueEmpty);
        }
        // Retract the observer length first so it never runs ahead of `len`.
        self.word(SAFE_LEN_OFFSET).store(len as u32 - 1, Ordering::Release);
        self.word(LEN_OFFSET).store(len as u32 - 1, Ordering::Release);
        Ok(())
    }

    /// Exchanges two elements in place.
    ///
    /// # Panics
    ///
    /// Panics if either index is `>= self.len()`.
    pub fn swap(&mut self, i: usize, j: usize) {
        let len = self.len();
        assert!(i < len && j < len, "swap ({i}, {j}) out of bounds for length {len}");
        if i == j {
            return;
        }
        let stride = self.stride();
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        let data = self.data_mut();
        let (left, right) = data.split_at_mut(hi * stride);
        left[lo * stride..(lo + 1) * stride].swap_with_slice(&mut right[..stride]);
    }

    fn stride(&self) -> usize {
        SLOT_LEN_SIZE + self.elem_size
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: offsets are 4-byte aligned within the 64-byte header and the
        // base was checked for alignment at construction.
        unsafe { &*(self.base.add(offset) as *const AtomicU32) }
    }

    fn slot(&self, index: usize) -> &[u8] {
        debug_assert!(index < self.capacity);
        let stride = self.stride();
        // SAFETY: index < capacity and the region holds `array_size(capacity, elem_size)` bytes.
        unsafe {
            std::slice::from_raw_parts(self.base.add(ARRAY_HEADER_SIZE + index * stride), stride)
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let stride = self.stride();
        &mut self.data_mut()[index * stride..(index + 1) * stride]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        let len = self.capacity * self.stride();
        // SAFETY: the slot area lies entirely inside the region (checked in create/open).
        unsafe { std::slice::from_raw_parts_mut(self.base.add(ARRAY_HEADER_SIZE), len) }
    }
}

fn aligned_base<R: SharedRegion>(region: &mut R) -> Result<*mut u8> {
    let base = region.as_mut_ptr();
    if base.is_null() || (base as usize) % align_of::<AtomicU32>() != 0 {
        return Err(Error::InvalidConfig("region base is misaligned"));
    }
    Ok(base)
}
