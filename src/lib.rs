//! Cross-process priority message queues.
//!
//! Two variants share one model: bounded queues of byte messages ordered by
//! priority, openable by name from any process.
//!
//! - [`mq::KernelQueue`] binds to the Linux POSIX message-queue syscalls and
//!   can stream "became non-empty" notifications through
//!   [`mq::NotifySession`].
//! - [`SharedQueue`] emulates the same behaviour with a max-heap kept
//!   entirely inside a shared-memory file, for hosts without kernel queues.

pub mod config;
pub mod core;
#[cfg(target_os = "linux")]
pub mod mq;
pub mod queue;

pub use crate::config::QueueConfig;
pub use crate::core::{Error, MessageView, Result, SharedHeap};
pub use crate::queue::SharedQueue;
