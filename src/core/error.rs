use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("corrupt region: {0}")]
    Corrupt(&'static str),
    #[error("queue capacity exceeded")]
    CapacityExceeded,
    #[error("queue is empty")]
    QueueEmpty,
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("message too large: {len} bytes exceeds maximum of {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("operation timed out")]
    Timeout,
    #[error("queue not found: {0}")]
    NotFound(String),
    #[error("queue already exists: {0}")]
    AlreadyExists(String),
    #[error("notification already armed for this queue")]
    AlreadyArmed,
    #[error("failed to arm notification: {0}")]
    ArmFailed(#[source] std::io::Error),
    #[error("{operation} failed with os error {code}")]
    SyscallFailed { operation: &'static str, code: i32 },
}

impl Error {
    /// Failures the caller may retry as-is, possibly after waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::CapacityExceeded | Error::QueueEmpty
        )
    }

    /// Raw OS error code, when the failure came straight from the kernel.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::SyscallFailed { code, .. } => Some(*code),
            Error::Io(err) | Error::ArmFailed(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn retryable_classification() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::QueueEmpty.is_retryable());
        assert!(!Error::InvalidConfig("zero").is_retryable());
        assert!(!Error::AlreadyArmed.is_retryable());
    }

    #[test]
    fn syscall_failure_reports_operation_and_code() {
        let err = Error::SyscallFailed {
            operation: "mq_notify",
            code: libc::EBADF,
        };
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        assert!(err.to_string().starts_with("mq_notify failed"));
    }
}
