use std::{sync::Arc, time::SystemTime};

/// UTC time source threaded through every cache so TTL expiry is testable
/// at sub-second granularity.
pub trait Clock: Send + Sync + 'static {
    fn utc_now(&self) -> SystemTime;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time. Monotonicity is not required; drift below one cache TTL
/// is tolerable.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utc_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
