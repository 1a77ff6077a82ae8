//! Process-wide call budget for the AI service.
//!
//! Two fixed windows run independently: a minute window that refills to full
//! capacity every 60 seconds from the limiter's start, and a day window that
//! refills every 24 hours. A call is granted only when both windows can cover
//! it. Check-and-decrement happens under one mutex; the lock is never held
//! across an `.await`, so the slow AI call itself runs unlocked.
//!
//! Multi-stage requests take a [`Reservation`] first: the worst-case cost is
//! deducted from the day window up front, and each stage then draws from the
//! minute window only. Units not used are returned when the reservation drops.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::RateLimitError;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Proof that `cost` units were granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Permit {
    pub cost: u32,
}

/// Point-in-time view of the budget, for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    pub per_minute: u32,
    pub per_day: u32,
    pub minute_remaining: u32,
    pub day_remaining: u32,
    /// Calls actually granted since the limiter was created.
    pub calls_granted: u64,
}

#[derive(Debug)]
struct Windows {
    minute_start: Instant,
    minute_remaining: u32,
    day_start: Instant,
    day_remaining: u32,
    day_epoch: u64,
    calls_granted: u64,
}

impl Windows {
    fn roll(&mut self, now: Instant, per_minute: u32, per_day: u32) {
        if now >= self.minute_start + MINUTE {
            let elapsed = (now - self.minute_start).as_secs() / MINUTE.as_secs();
            self.minute_start += MINUTE * elapsed as u32;
            self.minute_remaining = per_minute;
        }
        if now >= self.day_start + DAY {
            let elapsed = (now - self.day_start).as_secs() / DAY.as_secs();
            self.day_start += DAY * elapsed as u32;
            self.day_remaining = per_day;
            self.day_epoch += 1;
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    per_minute: u32,
    per_day: u32,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, per_day: u32) -> Self {
        let now = Instant::now();
        Self {
            per_minute,
            per_day,
            windows: Mutex::new(Windows {
                minute_start: now,
                minute_remaining: per_minute,
                day_start: now,
                day_remaining: per_day,
                day_epoch: 0,
                calls_granted: 0,
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.per_minute, config.per_day)
    }

    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        let mut w = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        w.roll(Instant::now(), self.per_minute, self.per_day);
        w
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let w = self.lock();
        BudgetSnapshot {
            per_minute: self.per_minute,
            per_day: self.per_day,
            minute_remaining: w.minute_remaining,
            day_remaining: w.day_remaining,
            calls_granted: w.calls_granted,
        }
    }

    /// Grant `cost` units from both windows, suspending until the minute
    /// window refills when needed. Daily exhaustion is returned, not waited out.
    pub async fn acquire(&self, cost: u32) -> Result<Permit, RateLimitError> {
        self.check_minute_capacity(cost)?;
        loop {
            let refill_at = {
                let mut w = self.lock();
                if w.day_remaining < cost {
                    return Err(RateLimitError::DailyExhausted {
                        requested: cost,
                        remaining: w.day_remaining,
                    });
                }
                if w.minute_remaining >= cost {
                    w.minute_remaining -= cost;
                    w.day_remaining -= cost;
                    w.calls_granted += u64::from(cost);
                    return Ok(Permit { cost });
                }
                w.minute_start + MINUTE
            };
            debug!(cost, "minute budget spent, waiting for refill");
            sleep_until(refill_at).await;
        }
    }

    /// Deduct `cost` units from the day window up front.
    pub fn reserve(&self, cost: u32) -> Result<Reservation<'_>, RateLimitError> {
        let mut w = self.lock();
        if w.day_remaining < cost {
            return Err(RateLimitError::DailyExhausted {
                requested: cost,
                remaining: w.day_remaining,
            });
        }
        w.day_remaining -= cost;
        Ok(Reservation {
            limiter: self,
            remaining: cost,
            epoch: w.day_epoch,
        })
    }

    fn check_minute_capacity(&self, cost: u32) -> Result<(), RateLimitError> {
        if cost > self.per_minute {
            return Err(RateLimitError::ExceedsMinuteCapacity {
                requested: cost,
                capacity: self.per_minute,
            });
        }
        Ok(())
    }
}

/// Day-window units set aside for one request.
#[derive(Debug)]
pub struct Reservation<'a> {
    limiter: &'a RateLimiter,
    remaining: u32,
    epoch: u64,
}

impl Reservation<'_> {
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Spend `cost` reserved units, waiting on the minute window only.
    pub async fn acquire(&mut self, cost: u32) -> Result<Permit, RateLimitError> {
        if cost > self.remaining {
            return Err(RateLimitError::ReservationExceeded {
                requested: cost,
                reserved: self.remaining,
            });
        }
        self.limiter.check_minute_capacity(cost)?;
        loop {
            let refill_at = {
                let mut w = self.limiter.lock();
                // Reserved units belong to the day they were taken from; after a
                // rollover each call must also be charged to the new day.
                let new_day = w.day_epoch != self.epoch;
                if new_day && w.day_remaining < cost {
                    return Err(RateLimitError::DailyExhausted {
                        requested: cost,
                        remaining: w.day_remaining,
                    });
                }
                if w.minute_remaining >= cost {
                    w.minute_remaining -= cost;
                    if new_day {
                        w.day_remaining -= cost;
                    }
                    w.calls_granted += u64::from(cost);
                    self.remaining -= cost;
                    return Ok(Permit { cost });
                }
                w.minute_start + MINUTE
            };
            debug!(cost, "minute budget spent, waiting for refill");
            sleep_until(refill_at).await;
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.remaining == 0 {
            return;
        }
        let mut w = self.limiter.lock();
        if w.day_epoch == self.epoch {
            w.day_remaining = (w.day_remaining + self.remaining).min(self.limiter.per_day);
        }
    }
}
