//! Shared-memory building blocks: the slot array, the priority heap laid
//! over it, and the locking and wait primitives the emulated queue needs.

pub mod array;
pub mod error;
pub mod heap;
pub mod lock;
pub mod mmap;
pub mod region;
pub mod wait;

pub use array::{array_size, SharedArray};
pub use error::{Error, Result};
pub use heap::{min_region_size, required_region_size, MessageView, SharedHeap};
pub use lock::RegionLock;
pub use mmap::MmapFile;
pub use region::SharedRegion;
