use std::sync::{Arc, Mutex, PoisonError};

use crate::{LocalDuration, LocalTime};

/// Source of the current local time.
///
/// Conversations read the time through this trait so that deadlines can be
/// exercised deterministically.
pub trait Clock: Send + Sync {
    /// The current local time.
    fn now(&self) -> LocalTime;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> LocalTime {
        LocalTime::now()
    }
}

/// Clock with interior mutability.
#[derive(Debug, Clone)]
pub struct RefClock(Arc<Mutex<LocalTime>>);

impl std::ops::Deref for RefClock {
    type Target = Arc<Mutex<LocalTime>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl RefClock {
    /// Elapse time.
    pub fn elapse(&self, duration: LocalDuration) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapse(duration)
    }

    pub fn local_time(&self) -> LocalTime {
        *self.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, time: LocalTime) {
        *self.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }
}

impl Clock for RefClock {
    fn now(&self) -> LocalTime {
        self.local_time()
    }
}

impl From<LocalTime> for RefClock {
    fn from(other: LocalTime) -> Self {
        Self(Arc::new(Mutex::new(other)))
    }
}
