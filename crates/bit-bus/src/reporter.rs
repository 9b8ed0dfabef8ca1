//! # Handler Fault Reporting
//!
//! Handler errors and panics are caught by the bus and forwarded to an
//! [`ErrorReporter`] tagged with the offending handler's identity.

use crate::DEFAULT_FAULT_HISTORY;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;
use uuid::Uuid;

/// A failed handler invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerFault {
    pub subscription_id: u64,
    pub subscriber: String,
    pub message_type: String,
    pub message_id: Uuid,
    pub error: String,
    /// True when the handler panicked rather than returning an error.
    pub panicked: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Process-wide sink for handler failures.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, fault: &HandlerFault);
}

/// Reporter that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReporter;

impl ErrorReporter for LoggingReporter {
    fn report(&self, fault: &HandlerFault) {
        log_fault(fault);
    }
}

fn log_fault(fault: &HandlerFault) {
    error!(
        subscription_id = fault.subscription_id,
        subscriber = %fault.subscriber,
        message_type = %fault.message_type,
        message_id = %fault.message_id,
        panicked = fault.panicked,
        error = %fault.error,
        "Message handler failed"
    );
}

/// Logs every fault and keeps the most recent ones for diagnostics.
pub struct FaultLog {
    recent: Mutex<VecDeque<HandlerFault>>,
    capacity: usize,
    total: AtomicU64,
}

impl FaultLog {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FAULT_HISTORY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            total: AtomicU64::new(0),
        }
    }

    /// Faults reported since startup.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Most recent faults, oldest first.
    pub fn recent(&self) -> Vec<HandlerFault> {
        self.recent.lock().iter().cloned().collect()
    }
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorReporter for FaultLog {
    fn report(&self, fault: &HandlerFault) {
        log_fault(fault);
        self.total.fetch_add(1, Ordering::Relaxed);

        if self.capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(fault.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(id: u64) -> HandlerFault {
        HandlerFault {
            subscription_id: id,
            subscriber: "beta".to_string(),
            message_type: "orders/OrderCreated".to_string(),
            message_id: Uuid::new_v4(),
            error: "boom".to_string(),
            panicked: false,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_fault_log_keeps_most_recent() {
        let log = FaultLog::with_capacity(2);
        log.report(&fault(1));
        log.report(&fault(2));
        log.report(&fault(3));

        assert_eq!(log.total(), 3);
        let ids: Vec<u64> = log.recent().iter().map(|f| f.subscription_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_zero_capacity_still_counts() {
        let log = FaultLog::with_capacity(0);
        log.report(&fault(1));
        assert_eq!(log.total(), 1);
        assert!(log.recent().is_empty());
    }
}
