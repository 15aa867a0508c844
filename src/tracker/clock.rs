use chrono::{DateTime, Utc};

/// Source of the timestamps stamped on connection records.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// A boxed [`Clock`]
pub type BoxClock = Box<dyn Clock>;

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
