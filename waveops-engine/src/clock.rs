//! Wall-clock sources
//!
//! Timestamps stored in wave state must never go backwards, so the
//! coordinator runs on a monotone wrapper over the system clock. Tests
//! pin a fixed clock to get deterministic snapshots.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// A source of wall-clock time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SysClock;

impl Clock for SysClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Monotone wrapper: never returns a time earlier than the last one handed out
pub struct MonotoneClock<C: Clock> {
    inner: C,
    watermark: Mutex<DateTime<Utc>>,
}

impl<C: Clock> MonotoneClock<C> {
    /// Wrap a clock source
    pub fn new(inner: C) -> Self {
        let start = inner.now();
        Self {
            inner,
            watermark: Mutex::new(start),
        }
    }
}

impl MonotoneClock<SysClock> {
    /// Monotone system clock
    pub fn system() -> Self {
        Self::new(SysClock)
    }
}

impl<C: Clock> Clock for MonotoneClock<C> {
    fn now(&self) -> DateTime<Utc> {
        let mut watermark = self.watermark.lock();
        let now = self.inner.now();
        if now > *watermark {
            *watermark = now;
        }
        *watermark
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        self.as_ref().now()
    }
}

/// Fixed clock for tests
#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
