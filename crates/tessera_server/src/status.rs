//! Coarse process status, surfaced by `/health` and used to reject
//! requests arriving before startup finishes or during shutdown.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Init,
    Serving,
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Init => "init",
            Status::Serving => "serving",
            Status::Stopped => "stopped",
        }
    }
}

#[derive(Default)]
pub struct ServerStatus {
    value: AtomicU8,
}

impl ServerStatus {
    pub fn new() -> Self {
        Self {
            value: AtomicU8::new(0),
        }
    }

    pub fn set(&self, status: Status) {
        self.value.store(status as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> Status {
        match self.value.load(Ordering::SeqCst) {
            1 => Status::Serving,
            2 => Status::Stopped,
            _ => Status::Init,
        }
    }

    pub fn is_serving(&self) -> bool {
        self.get() == Status::Serving
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let status = ServerStatus::new();
        assert_eq!(status.get(), Status::Init);
        assert!(!status.is_serving());
        status.set(Status::Serving);
        assert!(status.is_serving());
        status.set(Status::Stopped);
        assert_eq!(status.get(), Status::Stopped);
        assert_eq!(status.get().as_str(), "stopped");
    }
}
