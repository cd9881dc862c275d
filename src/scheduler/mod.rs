#[cfg(target_os = "linux")]
mod timerfd;

#[cfg(target_os = "linux")]
use timerfd::TimerFd;

use heapless::Vec;
use serde::Serialize;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
#[cfg(target_os = "linux")]
use tracing::warn;

pub const MAX_RATES: usize = 9;
pub const DEFAULT_RATE_TABLE: [u32; MAX_RATES] = [1, 5, 10, 50, 100, 500, 1000, 5000, 10000];
pub const DEFAULT_RATE_INDEX: usize = 2;

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateError {
    #[error("rate table is empty")]
    EmptyTable,
    #[error("rate table holds {0} entries, at most 9 are selectable")]
    TooManyRates(usize),
    #[error("rate at index {0} is zero")]
    ZeroRate(usize),
    #[error("rate at index {0} is not above the one before it")]
    NotIncreasing(usize),
    #[error("rate {0}/s exceeds one packet per nanosecond")]
    RateTooHigh(u32),
    #[error("rate index {index} outside table of {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Ordered table of telemetry rates (packets per second) and the active entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateSelector {
    table: Vec<u32, MAX_RATES>,
    index: usize,
}

impl RateSelector {
    pub fn new(rates: &[u32], index: usize) -> Result<Self, RateError> {
        if rates.is_empty() {
            return Err(RateError::EmptyTable);
        }
        let table = Vec::from_slice(rates)
            .map_err(|()| RateError::TooManyRates(rates.len()))?;
        for (position, rate) in table.iter().enumerate() {
            if *rate == 0 {
                return Err(RateError::ZeroRate(position));
            }
            if u64::from(*rate) > NANOS_PER_SEC {
                return Err(RateError::RateTooHigh(*rate));
            }
            if position > 0 && *rate <= table[position - 1] {
                return Err(RateError::NotIncreasing(position));
            }
        }

        let mut selector = Self { table, index: 0 };
        selector.select(index)?;
        Ok(selector)
    }

    pub fn select(&mut self, index: usize) -> Result<(), RateError> {
        if index >= self.table.len() {
            return Err(RateError::IndexOutOfRange {
                index,
                len: self.table.len(),
            });
        }
        self.index = index;
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn rate(&self) -> u32 {
        self.table[self.index]
    }

    pub fn rates(&self) -> &[u32] {
        &self.table
    }

    /// Tick period of the active rate, truncated to whole nanoseconds.
    pub fn period(&self) -> Duration {
        Duration::from_nanos(NANOS_PER_SEC / u64::from(self.rate()))
    }
}

impl Default for RateSelector {
    fn default() -> Self {
        Self {
            table: Vec::from_slice(&DEFAULT_RATE_TABLE).unwrap_or_default(),
            index: DEFAULT_RATE_INDEX,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TickerStats {
    pub ticks: u64,
    /// Ticks whose deadline had already passed when it was computed.
    pub overruns: u64,
}

/// Absolute-deadline periodic timer.
///
/// The deadline advances by exactly one period per tick no matter how long the
/// previous tick took, so processing jitter never accumulates as drift. After
/// an overrun the next deadline is already in the past and `tick` returns
/// without sleeping until the schedule has caught up.
///
/// [`Ticker::new`] sleeps on tokio's timer, which has millisecond resolution
/// and follows a paused test clock. [`Ticker::precise`] waits on a kernel
/// timer instead and keeps sub-millisecond periods evenly spaced.
#[derive(Debug)]
pub struct Ticker {
    deadline: Instant,
    stats: TickerStats,
    #[cfg(target_os = "linux")]
    timer: Option<TimerFd>,
}

impl Ticker {
    /// Seed the deadline from the monotonic clock.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(deadline: Instant) -> Self {
        Self {
            deadline,
            stats: TickerStats::default(),
            #[cfg(target_os = "linux")]
            timer: None,
        }
    }

    /// Seed the deadline from the monotonic clock and wait on a high-resolution
    /// timer. Must be called inside a tokio runtime.
    pub fn precise() -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let timer = TimerFd::new()?;
            Ok(Self {
                timer: Some(timer),
                ..Self::new()
            })
        }

        #[cfg(not(target_os = "linux"))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "high-resolution timer needs Linux timerfd",
            ))
        }
    }

    pub fn is_precise(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.timer.is_some()
        }

        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    /// Move the deadline forward by one period and return it.
    pub fn advance(&mut self, period: Duration) -> Instant {
        self.deadline += period;
        self.deadline
    }

    /// Sleep until the next deadline of the currently selected rate.
    ///
    /// The rate is read here, so a selection made during the previous tick
    /// applies to this deadline and not retroactively.
    pub async fn tick(&mut self, rates: &RateSelector) -> Instant {
        let deadline = self.advance(rates.period());
        if deadline <= Instant::now() {
            self.stats.overruns += 1;
        }
        self.wait_until(deadline).await;
        self.stats.ticks += 1;
        deadline
    }

    async fn wait_until(&mut self, deadline: Instant) {
        #[cfg(target_os = "linux")]
        if let Some(timer) = &self.timer {
            let result = timer.wait_until(deadline).await;
            match result {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, "high-resolution timer failed, using millisecond timer");
                    self.timer = None;
                }
            }
        }
        sleep_until(deadline).await;
    }

    /// Re-seed the deadline to now, dropping any backlog of missed ticks.
    pub fn resync(&mut self) {
        self.deadline = Instant::now();
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn stats(&self) -> TickerStats {
        self.stats
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}
