//! Sync permits.
//!
//! A permit must be held for the whole duration of a conversation. The pool size bounds the
//! number of concurrent conversations, and shrinks while the system reports being unhealthy:
//! permits are revoked at a fixed rate once the unhealthy duration exceeds a grace period, and
//! handed back at another rate once the system recovers.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::config::Config;
use crate::{LocalDuration, LocalTime};

/// Rates at which permits are revoked and returned.
#[derive(Debug, Clone)]
pub struct Rates {
    pub unhealthy_grace_period: LocalDuration,
    /// A rate of `1.0` means one permit per second.
    pub revoked_per_second: f64,
    pub returned_per_second: f64,
    /// Usable permits restored as soon as the system is healthy again.
    pub minimum_healthy_unrevoked: usize,
}

impl From<&Config> for Rates {
    fn from(config: &Config) -> Self {
        Self {
            unhealthy_grace_period: config.unhealthy_grace_period,
            revoked_per_second: config.permits_revoked_per_second,
            returned_per_second: config.permits_returned_per_second,
            minimum_healthy_unrevoked: config.minimum_healthy_unrevoked_permit_count,
        }
    }
}

impl Default for Rates {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Debug, Default)]
struct Pool {
    total: usize,
    acquired: usize,
    revoked: usize,
    /// Fraction of a permit carried over to the next revocation.
    revoke_carry: f64,
    /// Fraction of a permit carried over to the next return.
    return_carry: f64,
    /// Time of the last health report.
    updated_at: Option<LocalTime>,
}

impl Pool {
    fn available(&self) -> usize {
        self.total.saturating_sub(self.acquired + self.revoked)
    }
}

/// Shared pool of sync permits.
#[derive(Debug, Clone)]
pub struct Permits {
    pool: Arc<(Mutex<Pool>, Condvar)>,
    rates: Rates,
}

impl Permits {
    pub fn new(total: usize, rates: Rates) -> Self {
        Self {
            pool: Arc::new((
                Mutex::new(Pool {
                    total,
                    ..Pool::default()
                }),
                Condvar::new(),
            )),
            rates,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a permit if one is available. Never blocks.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut pool = self.lock();

        if pool.available() == 0 {
            return None;
        }
        pool.acquired += 1;

        Some(Permit {
            permits: self.clone(),
        })
    }

    fn release(&self) {
        let mut pool = self.lock();

        pool.acquired = pool.acquired.saturating_sub(1);
        self.pool.1.notify_all();
    }

    /// Whether no permits are currently revoked.
    pub fn is_healthy(&self) -> bool {
        self.lock().revoked == 0
    }

    /// Permits that can be acquired right now.
    pub fn available(&self) -> usize {
        self.lock().available()
    }

    pub fn acquired(&self) -> usize {
        self.lock().acquired
    }

    pub fn revoked(&self) -> usize {
        self.lock().revoked
    }

    pub fn total(&self) -> usize {
        self.lock().total
    }

    /// Adjust the pool to the system's health.
    ///
    /// `duration` is how long the system has been continuously unhealthy, zero when healthy.
    pub fn report_unhealthy_duration(&self, duration: LocalDuration, now: LocalTime) {
        let mut pool = self.lock();
        let since_last = pool
            .updated_at
            .map(|t| now.as_millis().saturating_sub(t.as_millis()))
            .unwrap_or(0);
        let unhealthy = duration.as_millis() as u64;
        let grace = self.rates.unhealthy_grace_period.as_millis() as u64;

        pool.updated_at = Some(now);

        if unhealthy > grace {
            // Only the time spent past the grace period counts towards revocation.
            let period = (unhealthy - grace).min(since_last);
            let amount = pool.revoke_carry + period as f64 / 1000. * self.rates.revoked_per_second;
            let whole = amount.floor();

            pool.revoke_carry = amount - whole;
            pool.return_carry = 0.;

            let revoked = (pool.revoked + whole as usize).min(pool.total);
            if revoked != pool.revoked {
                log::debug!(
                    target: "permits",
                    "System unhealthy for {}ms, revoking permits ({} -> {} of {})",
                    unhealthy,
                    pool.revoked,
                    revoked,
                    pool.total
                );
                pool.revoked = revoked;
            }
        } else if unhealthy == 0 && pool.revoked > 0 {
            let floor = pool
                .total
                .saturating_sub(self.rates.minimum_healthy_unrevoked);
            let amount = pool.return_carry + since_last as f64 / 1000. * self.rates.returned_per_second;
            let whole = amount.floor();

            pool.return_carry = amount - whole;
            pool.revoke_carry = 0.;

            let revoked = pool.revoked.min(floor).saturating_sub(whole as usize);
            log::debug!(
                target: "permits",
                "System healthy, returning permits ({} -> {} revoked of {})",
                pool.revoked,
                revoked,
                pool.total
            );
            pool.revoked = revoked;

            if revoked == 0 {
                pool.return_carry = 0.;
            }
        }
    }

    /// Revoke every permit. Permits already held stay valid until released.
    pub fn revoke_all(&self) {
        let mut pool = self.lock();

        pool.revoked = pool.total;
        pool.revoke_carry = 0.;
        pool.return_carry = 0.;
    }

    /// Grow or shrink the pool, eg. when the roster changes.
    pub fn adjust_total(&self, delta: isize) {
        let mut pool = self.lock();

        pool.total = pool.total.saturating_add_signed(delta);
        pool.revoked = pool.revoked.min(pool.total);

        log::debug!(target: "permits", "Permit pool resized to {}", pool.total);
    }

    /// Block until every acquired permit has been released.
    pub fn wait_for_all_released(&self) {
        let (_, released) = &*self.pool;
        let mut pool = self.lock();

        while pool.acquired > 0 {
            pool = released.wait(pool).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// A held sync permit, released when dropped.
#[must_use]
#[derive(Debug)]
pub struct Permit {
    permits: Permits,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.permits.release();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_acquire_release() {
        let permits = Permits::new(2, Rates::default());
        let a = permits.try_acquire().unwrap();
        let b = permits.try_acquire().unwrap();

        assert!(permits.try_acquire().is_none());
        assert_eq!(permits.acquired(), 2);

        drop(a);
        assert_eq!(permits.available(), 1);
        drop(b);
        assert_eq!(permits.available(), 2);
    }

    #[test]
    fn test_empty_pool() {
        let permits = Permits::new(0, Rates::default());

        assert!(permits.try_acquire().is_none());
        assert!(permits.is_healthy());
    }

    #[test]
    fn test_revocation() {
        let permits = Permits::new(17, Rates::default());
        let t0 = LocalTime::from_secs(100);

        permits.report_unhealthy_duration(LocalDuration::from_secs(0), t0);
        assert!(permits.is_healthy());

        // Still within the grace period.
        permits.report_unhealthy_duration(
            LocalDuration::from_millis(900),
            t0 + LocalDuration::from_millis(900),
        );
        assert!(permits.is_healthy());

        // 1.5s past the grace period, but only 1.1s since the last report.
        permits.report_unhealthy_duration(
            LocalDuration::from_millis(2500),
            t0 + LocalDuration::from_millis(2000),
        );
        assert_eq!(permits.revoked(), 5);
        assert!(!permits.is_healthy());
        assert_eq!(permits.available(), 12);

        permits.report_unhealthy_duration(
            LocalDuration::from_millis(60_000),
            t0 + LocalDuration::from_secs(60),
        );
        assert_eq!(permits.revoked(), 17);
        assert!(permits.try_acquire().is_none());
    }

    #[test]
    fn test_return() {
        let permits = Permits::new(4, Rates::default());
        let t0 = LocalTime::from_secs(100);

        permits.revoke_all();
        permits.report_unhealthy_duration(LocalDuration::from_secs(0), t0);

        // The minimum is restored right away.
        assert_eq!(permits.revoked(), 3);
        assert!(permits.try_acquire().is_some());

        permits.report_unhealthy_duration(
            LocalDuration::from_secs(0),
            t0 + LocalDuration::from_millis(1500),
        );
        assert_eq!(permits.revoked(), 2);

        permits.report_unhealthy_duration(
            LocalDuration::from_secs(0),
            t0 + LocalDuration::from_millis(2000),
        );
        assert_eq!(permits.revoked(), 1);

        permits.report_unhealthy_duration(
            LocalDuration::from_secs(0),
            t0 + LocalDuration::from_secs(10),
        );
        assert!(permits.is_healthy());
    }

    #[test]
    fn test_held_permits_survive_revocation() {
        let permits = Permits::new(3, Rates::default());
        let held = permits.try_acquire().unwrap();

        permits.revoke_all();
        assert_eq!(permits.available(), 0);
        assert_eq!(permits.acquired(), 1);

        drop(held);
        assert_eq!(permits.acquired(), 0);
        assert_eq!(permits.available(), 0);
    }

    #[test]
    fn test_adjust_total() {
        let permits = Permits::new(3, Rates::default());

        permits.adjust_total(2);
        assert_eq!(permits.total(), 5);

        permits.revoke_all();
        permits.adjust_total(-10);
        assert_eq!(permits.total(), 0);
        assert_eq!(permits.revoked(), 0);
    }

    #[test]
    fn test_wait_for_all_released() {
        let permits = Permits::new(2, Rates::default());
        let held = permits.try_acquire().unwrap();

        thread::scope(|s| {
            s.spawn(|| permits.wait_for_all_released());
            s.spawn(move || drop(held));
        });
        assert_eq!(permits.acquired(), 0);
    }
}
