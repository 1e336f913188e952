//! Connect, read and total time budgets for a single request attempt.

use std::time::{Duration, Instant};

use super::error::TimerError;

/// Timeout configuration for a request.
///
/// `connect` bounds establishing the connection, `read` bounds each wait for data
/// from the server, and `total` bounds connecting and reading together. `None` means
/// no limit.
///
/// A `Timeout` carries a start marker once [`Timeout::start_connect`] is called. Pools
/// always work on a [`fresh`][Timeout::fresh] copy per attempt, so a value given by the
/// caller can be reused across requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeout {
    /// Connect budget.
    pub connect: Option<Duration>,

    /// Read budget.
    pub read: Option<Duration>,

    /// Combined connect and read budget.
    pub total: Option<Duration>,

    start: Option<Instant>,
}

impl Timeout {
    /// Create a timeout from the three budgets.
    pub fn new(connect: Option<Duration>, read: Option<Duration>, total: Option<Duration>) -> Self {
        Self {
            connect,
            read,
            total,
            start: None,
        }
    }

    /// Set the connect budget.
    pub fn with_connect(mut self, connect: Duration) -> Self {
        self.connect = Some(connect);
        self
    }

    /// Set the read budget.
    pub fn with_read(mut self, read: Duration) -> Self {
        self.read = Some(read);
        self
    }

    /// Set the total budget.
    pub fn with_total(mut self, total: Duration) -> Self {
        self.total = Some(total);
        self
    }

    /// A copy of this timeout with the start marker cleared.
    pub fn fresh(&self) -> Self {
        Self::new(self.connect, self.read, self.total)
    }

    /// Start the connect clock. A timeout can only be started once.
    pub fn start_connect(&mut self) -> Result<Instant, TimerError> {
        if self.start.is_some() {
            return Err(TimerError::new("connect timer has already been started"));
        }
        let now = Instant::now();
        self.start = Some(now);
        Ok(now)
    }

    /// Time elapsed since [`Timeout::start_connect`].
    pub fn get_connect_duration(&self) -> Result<Duration, TimerError> {
        self.start
            .map(|start| start.elapsed())
            .ok_or_else(|| TimerError::new("can't get connect duration for a timer that has not started"))
    }

    /// The budget for establishing the connection.
    pub fn connect_timeout(&self) -> Option<Duration> {
        match (self.connect, self.total) {
            (Some(connect), Some(total)) => Some(connect.min(total)),
            (connect, None) => connect,
            (None, total) => total,
        }
    }

    /// The budget left for reading once connected.
    ///
    /// When `total` is set and the clock has been started, the time spent connecting
    /// is deducted, never going below zero.
    pub fn read_timeout(&self) -> Option<Duration> {
        match (self.total, self.start) {
            (Some(total), Some(start)) => {
                let remaining = total.saturating_sub(start.elapsed());
                Some(match self.read {
                    Some(read) => remaining.min(read),
                    None => remaining,
                })
            }
            _ => self.read,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        Self::new(Some(value), Some(value), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_takes_the_smaller_budget() {
        let timeout = Timeout::new(Some(Duration::from_secs(2)), None, Some(Duration::from_secs(1)));
        assert_eq!(timeout.connect_timeout(), Some(Duration::from_secs(1)));

        let timeout = Timeout::new(Some(Duration::from_secs(2)), None, None);
        assert_eq!(timeout.connect_timeout(), Some(Duration::from_secs(2)));

        let timeout = Timeout::new(None, None, Some(Duration::from_secs(3)));
        assert_eq!(timeout.connect_timeout(), Some(Duration::from_secs(3)));

        assert_eq!(Timeout::default().connect_timeout(), None);
    }

    #[test]
    fn read_before_start_is_read() {
        let timeout = Timeout::new(None, Some(Duration::from_secs(5)), Some(Duration::from_secs(1)));
        assert_eq!(timeout.read_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn read_after_start_is_bounded_by_total() {
        let mut timeout =
            Timeout::new(None, Some(Duration::from_secs(5)), Some(Duration::from_secs(1)));
        timeout.start_connect().unwrap();
        let read = timeout.read_timeout().unwrap();
        assert!(read <= Duration::from_secs(1));

        let mut timeout = Timeout::new(None, None, Some(Duration::from_millis(1)));
        timeout.start_connect().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(timeout.read_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn timer_starts_once() {
        let mut timeout = Timeout::from(Duration::from_secs(1));
        assert!(timeout.get_connect_duration().is_err());
        timeout.start_connect().unwrap();
        assert!(timeout.start_connect().is_err());
        assert!(timeout.get_connect_duration().is_ok());

        let fresh = timeout.fresh();
        assert!(fresh.get_connect_duration().is_err());
        assert_eq!(fresh.connect, Some(Duration::from_secs(1)));
        assert_eq!(fresh.read, Some(Duration::from_secs(1)));
        assert_eq!(fresh.total, None);
    }
}
