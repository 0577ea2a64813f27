//! Tracing setup for the daemon and the provisioning heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per event, for log shippers.
    pub json: bool,
    /// `drover=debug` instead of `drover=info`. Streams every provisioning
    /// output line.
    pub verbose: bool,
}

impl LogConfig {
    fn directive(&self) -> &'static str {
        if self.verbose { "drover=debug" } else { "drover=info" }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `config`.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directive()));

    if config.json {
        // Job and command fields ride on the event; span close lines carry timings.
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

/// "Still running" beacon for one provisioning command.
///
/// Output readers call [`CommandHeartbeat::record_line`] for every line the
/// child prints. At most one info event per interval is emitted, tagged with
/// the client and command and carrying the line count and elapsed time. The
/// first beacon fires one interval after the command started, so short
/// commands stay silent.
pub struct CommandHeartbeat {
    client_id: String,
    command: &'static str,
    interval_ms: u64,
    started: Instant,
    last_beat_ms: AtomicU64,
    lines: AtomicU64,
}

impl CommandHeartbeat {
    pub fn new(client_id: impl Into<String>, command: &'static str, interval: Duration) -> Self {
        Self {
            client_id: client_id.into(),
            command,
            interval_ms: interval.as_millis() as u64,
            started: Instant::now(),
            last_beat_ms: AtomicU64::new(0),
            lines: AtomicU64::new(0),
        }
    }

    pub fn record_line(&self) {
        let lines = self.lines.fetch_add(1, Ordering::Relaxed) + 1;
        if self.is_due() {
            info!(
                client_id = %self.client_id,
                command = self.command,
                lines,
                elapsed_secs = self.started.elapsed().as_secs(),
                "Provisioning command still running"
            );
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Claims the current interval. Concurrent readers race on the CAS, one wins.
    fn is_due(&self) -> bool {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_beat_ms.load(Ordering::Relaxed);
        now_ms.saturating_sub(last) >= self.interval_ms
            && self
                .last_beat_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_switches_the_default_directive() {
        assert_eq!(LogConfig::default().directive(), "drover=info");
        let verbose = LogConfig {
            verbose: true,
            ..Default::default()
        };
        assert_eq!(verbose.directive(), "drover=debug");
    }

    #[test]
    fn heartbeat_waits_a_full_interval_before_the_first_beat() {
        let heartbeat = CommandHeartbeat::new("c-1", "apply", Duration::from_secs(60));
        assert!(!heartbeat.is_due());
        heartbeat.record_line();
        heartbeat.record_line();
        assert_eq!(heartbeat.lines(), 2);
    }

    #[test]
    fn heartbeat_fires_once_the_interval_elapsed() {
        let heartbeat = CommandHeartbeat::new("c-1", "plan", Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(30));
        assert!(heartbeat.is_due());
        assert!(!heartbeat.is_due());
    }
}
