//! Rate-limited logging for high-frequency error paths
//!
//! The accept path can hit the same failure thousands of times per second (a
//! peer over its cap, fd exhaustion). The rate logger emits the first
//! occurrence immediately, counts repeats of the same message inside the
//! window, and reports the suppressed total when the message changes, the
//! window elapses, or the caller flushes after a success.

use std::time::{Duration, Instant};
use tracing::warn;

const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

pub struct RateLogger {
    window: Duration,
    last_msg: Option<String>,
    last_logged: Instant,
    suppressed: u64,
}

impl RateLogger {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self { window, last_msg: None, last_logged: Instant::now(), suppressed: 0 }
    }

    /// Log `msg`, suppressing repeats of the same message within the window.
    pub fn rate_limit_log(&mut self, msg: &str) {
        let now = Instant::now();
        match &self.last_msg {
            Some(last) if last == msg && now.duration_since(self.last_logged) < self.window => {
                self.suppressed += 1;
            }
            _ => {
                self.flush();
                warn!("{msg}");
                self.last_msg = Some(msg.to_owned());
                self.last_logged = now;
            }
        }
    }

    /// Emit the count of suppressed repeats, if any, and reset.
    pub fn flush(&mut self) {
        if self.suppressed > 0 {
            if let Some(msg) = &self.last_msg {
                warn!("[{} times suppressed] {msg}", self.suppressed);
            }
            self.suppressed = 0;
        }
        self.last_msg = None;
    }

    #[cfg(test)]
    fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

impl Default for RateLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeats_within_window_are_suppressed() {
        let mut logger = RateLogger::with_window(Duration::from_secs(10));
        logger.rate_limit_log("too many connections from 10.0.0.1");
        assert_eq!(logger.suppressed(), 0);
        for _ in 0..5 {
            logger.rate_limit_log("too many connections from 10.0.0.1");
        }
        assert_eq!(logger.suppressed(), 5);
    }

    #[test]
    fn test_message_change_resets_suppression() {
        let mut logger = RateLogger::with_window(Duration::from_secs(10));
        logger.rate_limit_log("error a");
        logger.rate_limit_log("error a");
        assert_eq!(logger.suppressed(), 1);
        logger.rate_limit_log("error b");
        assert_eq!(logger.suppressed(), 0);
    }

    #[test]
    fn test_flush_resets_state() {
        let mut logger = RateLogger::with_window(Duration::from_secs(10));
        logger.rate_limit_log("error a");
        logger.rate_limit_log("error a");
        logger.flush();
        assert_eq!(logger.suppressed(), 0);
        // After a flush the same message logs as a fresh occurrence
        logger.rate_limit_log("error a");
        assert_eq!(logger.suppressed(), 0);
    }

    #[test]
    fn test_elapsed_window_logs_again() {
        let mut logger = RateLogger::with_window(Duration::from_millis(10));
        logger.rate_limit_log("error a");
        std::thread::sleep(Duration::from_millis(20));
        logger.rate_limit_log("error a");
        assert_eq!(logger.suppressed(), 0);
    }
}
