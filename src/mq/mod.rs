//! Kernel-backed queues: POSIX message queues driven through raw syscalls,
//! plus the notification bridge that streams "became non-empty" events.

pub mod notify;
pub mod queue;
pub mod sys;

pub use notify::{cancel_remote, rendezvous_path, NotifySession};
pub use queue::KernelQueue;
pub use sys::{MqAttr, NotifyCookie, SigEvent};
