//! Fixed-rate tick clock.
//!
//! The clock is the heartbeat of a session. Tick `n` is due at
//! `start + n * interval`, where `start` is the instant the first tick
//! fired. Boundaries are always derived from that absolute origin, so a
//! slow tick never shifts the schedule of the ticks after it.
//!
//! # Design Principles
//!
//! - Tick numbers are sequential; a boundary is never fired twice.
//! - When processing overruns the interval, the next tick fires
//!   immediately and the overrun is counted rather than hidden.
//! - All instants come from [`tokio::time`] so tests can pause time.

use std::time::Duration;

use arena_types::Tick;
use tokio::time::Instant;

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// The tick rate is zero.
    #[error("invalid tick rate: {rate} ticks/second")]
    InvalidRate {
        /// The rejected rate.
        rate: u32,
    },

    /// Tick counter or boundary offset would overflow.
    #[error("tick counter overflow at tick {tick}")]
    Overflow {
        /// The tick that could not be scheduled.
        tick: u64,
    },
}

/// Produces tick boundaries at a fixed rate.
#[derive(Debug)]
pub struct TickClock {
    /// Interval between consecutive boundaries.
    interval: Duration,
    /// Instant tick 0 fired; set lazily by the first [`next_tick`](Self::next_tick).
    start: Option<Instant>,
    /// The tick the next call will fire.
    next: Tick,
    /// Ticks that fired late because the previous tick overran.
    overruns: u64,
    /// Optional session length.
    max_duration: Option<Duration>,
}

impl TickClock {
    /// Create a clock firing `tick_rate` times per second.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidRate`] if `tick_rate` is zero.
    pub fn new(tick_rate: u32, max_duration: Option<Duration>) -> Result<Self, ClockError> {
        let interval = Duration::from_secs(1)
            .checked_div(tick_rate)
            .filter(|d| !d.is_zero())
            .ok_or(ClockError::InvalidRate { rate: tick_rate })?;
        Ok(Self {
            interval,
            start: None,
            next: Tick::ZERO,
            overruns: 0,
            max_duration,
        })
    }

    /// Wait for the next tick boundary and return its tick number.
    ///
    /// The first call fires tick 0 immediately and fixes the origin.
    /// Subsequent calls sleep until `start + n * interval`, or return at
    /// once (counting an overrun) when that boundary has already passed.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Overflow`] if the tick counter is exhausted.
    pub async fn next_tick(&mut self) -> Result<Tick, ClockError> {
        let tick = self.next;
        let now = Instant::now();
        let start = *self.start.get_or_insert(now);
        let due = start
            .checked_add(self.offset(tick)?)
            .ok_or(ClockError::Overflow { tick: tick.value() })?;

        if now > due {
            self.overruns = self.overruns.saturating_add(1);
            tracing::debug!(
                tick = tick.value(),
                late_ms = now.saturating_duration_since(due).as_millis(),
                "Tick boundary overrun"
            );
        } else {
            tokio::time::sleep_until(due).await;
        }

        self.next = tick
            .next()
            .ok_or(ClockError::Overflow { tick: tick.value() })?;
        Ok(tick)
    }

    /// Offset of a tick's boundary from the origin.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Overflow`] if the offset does not fit a
    /// [`Duration`].
    pub fn offset(&self, tick: Tick) -> Result<Duration, ClockError> {
        const NANOS_PER_SEC: u128 = 1_000_000_000;
        let overflow = || ClockError::Overflow { tick: tick.value() };
        let total = self
            .interval
            .as_nanos()
            .checked_mul(u128::from(tick.value()))
            .ok_or_else(overflow)?;
        let secs = total.checked_div(NANOS_PER_SEC).ok_or_else(overflow)?;
        let nanos = total.checked_rem(NANOS_PER_SEC).ok_or_else(overflow)?;
        Ok(Duration::new(
            u64::try_from(secs).map_err(|_err| overflow())?,
            u32::try_from(nanos).map_err(|_err| overflow())?,
        ))
    }

    /// Whether the maximum duration has elapsed.
    ///
    /// True once the next boundary lies at or beyond the limit, or once
    /// wall time since the origin has passed it. Always false for an
    /// unbounded clock.
    pub fn deadline_reached(&self) -> bool {
        let Some(max) = self.max_duration else {
            return false;
        };
        let next_due = self.offset(self.next).map_or(true, |offset| offset >= max);
        next_due || self.elapsed() >= max
    }

    /// Time since tick 0 fired (zero before the first tick).
    pub fn elapsed(&self) -> Duration {
        self.start.map_or(Duration::ZERO, |s| s.elapsed())
    }

    /// Interval between boundaries.
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of ticks that fired late.
    pub const fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Number of ticks fired so far.
    pub const fn ticks_fired(&self) -> u64 {
        self.next.value()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_rejected() {
        let err = TickClock::new(0, None).unwrap_err();
        assert!(matches!(err, ClockError::InvalidRate { rate: 0 }));
    }

    #[test]
    fn offsets_are_absolute() {
        let clock = TickClock::new(3, None).unwrap();
        // 1/3 s does not divide evenly; offsets must not accumulate error
        // beyond the truncation of the interval itself.
        let offset = clock.offset(Tick(300)).unwrap();
        let expected = clock.interval().checked_mul(300).unwrap();
        assert_eq!(offset, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_fire_on_absolute_boundaries() {
        let mut clock = TickClock::new(20, None).unwrap();
        let origin = Instant::now();

        for n in 0..10_u32 {
            let tick = clock.next_tick().await.unwrap();
            assert_eq!(tick, Tick(u64::from(n)));
            assert_eq!(origin.elapsed(), Duration::from_millis(50).checked_mul(n).unwrap());
            // Simulated work shorter than the interval does not shift
            // later boundaries.
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(clock.overruns(), 0);
        assert_eq!(clock.ticks_fired(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn overrun_fires_immediately_and_is_counted() {
        let mut clock = TickClock::new(10, None).unwrap();
        let origin = Instant::now();

        assert_eq!(clock.next_tick().await.unwrap(), Tick(0));
        // Tick 0 takes 250ms: boundaries 1 and 2 are already past.
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(clock.next_tick().await.unwrap(), Tick(1));
        assert_eq!(clock.next_tick().await.unwrap(), Tick(2));
        assert_eq!(origin.elapsed(), Duration::from_millis(250));
        assert_eq!(clock.overruns(), 2);

        // Tick 3 is back on schedule at 300ms.
        assert_eq!(clock.next_tick().await.unwrap(), Tick(3));
        assert_eq!(origin.elapsed(), Duration::from_millis(300));
        assert_eq!(clock.overruns(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_after_max_duration() {
        let mut clock = TickClock::new(20, Some(Duration::from_secs(1))).unwrap();
        let mut fired = 0_u32;
        while !clock.deadline_reached() {
            clock.next_tick().await.unwrap();
            fired = fired.saturating_add(1);
        }
        assert_eq!(fired, 20);
    }

    #[test]
    fn unbounded_clock_never_reaches_deadline() {
        let clock = TickClock::new(20, None).unwrap();
        assert!(!clock.deadline_reached());
    }
}
