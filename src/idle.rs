use std::time::Duration;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Active,
    Idle,
}

/// Emitted once per transition into `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEvent {
    pub idle_for: Duration,
}

/// Read-inactivity detector for a single connection.
///
/// `touch` on every decoded frame, race `expired` against the next read, and
/// call `on_expired` when it wins. While the connection stays idle `expired`
/// never resolves again, so the event fires once per quiet period instead of
/// once per poll.
#[derive(Debug)]
pub struct IdleMonitor {
    window: Option<Duration>,
    last_read: Instant,
    state: IdleState,
}

impl IdleMonitor {
    /// A `None` window disables detection entirely.
    pub fn new(window: Option<Duration>) -> Self {
        Self {
            window,
            last_read: Instant::now(),
            state: IdleState::Active,
        }
    }

    pub fn state(&self) -> IdleState {
        self.state
    }

    pub fn touch(&mut self) {
        self.last_read = Instant::now();
        self.state = IdleState::Active;
    }

    /// Resolves when the idle window has elapsed without a read.
    pub async fn expired(&self) {
        match (self.state, self.window) {
            (IdleState::Active, Some(window)) => sleep_until(self.last_read + window).await,
            _ => std::future::pending().await,
        }
    }

    pub fn on_expired(&mut self) -> Option<IdleEvent> {
        let window = self.window?;
        if self.state == IdleState::Idle {
            return None;
        }

        let idle_for = self.last_read.elapsed();
        if idle_for < window {
            return None;
        }

        self.state = IdleState::Idle;
        Some(IdleEvent { idle_for })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_quiet_period() {
        let mut monitor = IdleMonitor::new(Some(Duration::from_secs(180)));
        assert_eq!(monitor.state(), IdleState::Active);

        monitor.expired().await;
        let event = monitor.on_expired().unwrap();
        assert!(event.idle_for >= Duration::from_secs(180));
        assert_eq!(monitor.state(), IdleState::Idle);

        // No repeat while still idle
        assert!(monitor.on_expired().is_none());
        assert!(timeout(Duration::from_secs(600), monitor.expired())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_window() {
        let mut monitor = IdleMonitor::new(Some(Duration::from_secs(10)));

        advance(Duration::from_secs(8)).await;
        monitor.touch();
        advance(Duration::from_secs(8)).await;
        assert!(monitor.on_expired().is_none());
        assert_eq!(monitor.state(), IdleState::Active);

        monitor.expired().await;
        assert!(monitor.on_expired().is_some());

        // Traffic brings it back, and the next quiet period fires again
        monitor.touch();
        assert_eq!(monitor.state(), IdleState::Active);
        monitor.expired().await;
        assert!(monitor.on_expired().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_expires() {
        let mut monitor = IdleMonitor::new(None);
        assert!(timeout(Duration::from_secs(3600), monitor.expired())
            .await
            .is_err());
        assert!(monitor.on_expired().is_none());
    }
}
