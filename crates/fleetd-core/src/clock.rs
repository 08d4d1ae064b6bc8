//! Injectable time and id sources.
//!
//! Every component that needs "now" or a fresh id takes a `&dyn Clock` /
//! `&dyn IdGen` instead of calling `Utc::now()`/`Uuid::new_v4()` directly, so
//! tests can substitute deterministic implementations.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of fresh unique identifiers.
pub trait IdGen: Send + Sync {
    fn new_id(&self) -> Uuid;
}

/// Generates random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// A clock that always returns a fixed instant, advanced manually.
    pub struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        pub fn new(at: DateTime<Utc>) -> Self {
            Self(Mutex::new(at))
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut guard = self.0.lock().unwrap();
            *guard += delta;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn uuid_gen_produces_unique_ids() {
        let gen = UuidGen;
        assert_ne!(gen.new_id(), gen.new_id());
    }
}
