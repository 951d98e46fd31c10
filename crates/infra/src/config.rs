//! Configuration loading and representation.
//!
//! Everything is read from the process environment with typed defaults.
//! `from_env_with` takes a key lookup function so tests never touch the real
//! environment.

use std::time::Duration;

use crate::broadcast::BroadcastConfig;
use crate::queue::ConsumerConfig;

/// Configuration error (fatal at startup).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got '{value}'")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{0}")]
    Inconsistent(String),
}

/// Process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub queue: ConsumerConfig,
    pub stream: BroadcastConfig,
    /// Postgres URL of the PGMQ-enabled database. `None` runs against the
    /// in-memory store (dev only).
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue: ConsumerConfig::default(),
            stream: BroadcastConfig::default(),
            database_url: None,
            database_max_connections: 5,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    pub fn from_env_with<F>(get_env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Settings::default();
        let env = Env { get: &get_env };

        let queue = ConsumerConfig {
            queue_name: env.string("QUEUE_NAME", d.queue.queue_name),
            dead_letter_queue: env.string("QUEUE_DLQ_NAME", d.queue.dead_letter_queue),
            notification_queue: env.string("QUEUE_NOTIFICATION_NAME", d.queue.notification_queue),
            batch_size: env.bounded("QUEUE_BATCH_SIZE", d.queue.batch_size, 1, 100)?,
            poll_interval: env.secs_bounded("QUEUE_POLL_INTERVAL_SECS", d.queue.poll_interval, 1, 60)?,
            visibility_window: env.secs("QUEUE_VISIBILITY_TIMEOUT_SECS", d.queue.visibility_window)?,
            error_backoff: env.secs("QUEUE_ERROR_BACKOFF_SECS", d.queue.error_backoff)?,
            notification_poll_interval: env.secs(
                "QUEUE_NOTIFICATION_POLL_INTERVAL_SECS",
                d.queue.notification_poll_interval,
            )?,
            depth_report_interval: env.secs(
                "QUEUE_DEPTH_REPORT_INTERVAL_SECS",
                d.queue.depth_report_interval,
            )?,
        };

        let stream = BroadcastConfig {
            session_queue_capacity: env.bounded(
                "STREAM_QUEUE_CAPACITY",
                d.stream.session_queue_capacity,
                1,
                100_000,
            )?,
            replay_capacity: env.bounded("STREAM_REPLAY_CAPACITY", d.stream.replay_capacity, 1, 1_000_000)?,
            replay_window: env.bounded("STREAM_REPLAY_WINDOW", d.stream.replay_window, 0, 1_000_000)?,
            idle_wait: env.secs("STREAM_IDLE_WAIT_SECS", d.stream.idle_wait)?,
            heartbeat_interval: env.secs("STREAM_HEARTBEAT_INTERVAL_SECS", d.stream.heartbeat_interval)?,
            probe_interval: env.secs("STREAM_PROBE_INTERVAL_SECS", d.stream.probe_interval)?,
            max_outstanding_probes: d.stream.max_outstanding_probes,
            hard_timeout: env.secs("STREAM_HARD_TIMEOUT_SECS", d.stream.hard_timeout)?,
            timeout_sweep_interval: env.secs(
                "STREAM_TIMEOUT_SWEEP_INTERVAL_SECS",
                d.stream.timeout_sweep_interval,
            )?,
            health_check_interval: env.secs(
                "STREAM_HEALTH_CHECK_INTERVAL_SECS",
                d.stream.health_check_interval,
            )?,
            zombie_grace: env.secs("STREAM_ZOMBIE_GRACE_SECS", d.stream.zombie_grace)?,
            max_missed_probes: env.bounded("STREAM_MAX_MISSED_PROBES", d.stream.max_missed_probes, 0, 1_000)?,
            max_queue_full_events: env.bounded(
                "STREAM_MAX_QUEUE_FULL_EVENTS",
                d.stream.max_queue_full_events,
                0,
                1_000_000,
            )?,
            max_write_failures: env.bounded(
                "STREAM_MAX_WRITE_FAILURES",
                d.stream.max_write_failures,
                0,
                1_000,
            )?,
            max_probe_ack_wait: env.secs("STREAM_PROBE_ACK_WAIT_SECS", d.stream.max_probe_ack_wait)?,
            write_timeout: env.secs("STREAM_WRITE_TIMEOUT_SECS", d.stream.write_timeout)?,
            publish_channel_capacity: env.bounded(
                "STREAM_PUBLISH_CHANNEL_CAPACITY",
                d.stream.publish_channel_capacity,
                1,
                1_000_000,
            )?,
        };

        if stream.replay_window > stream.session_queue_capacity {
            return Err(ConfigError::Inconsistent(format!(
                "STREAM_REPLAY_WINDOW ({}) exceeds STREAM_QUEUE_CAPACITY ({})",
                stream.replay_window, stream.session_queue_capacity
            )));
        }

        if stream.replay_window > stream.replay_capacity {
            return Err(ConfigError::Inconsistent(format!(
                "STREAM_REPLAY_WINDOW ({}) exceeds STREAM_REPLAY_CAPACITY ({})",
                stream.replay_window, stream.replay_capacity
            )));
        }

        Ok(Self {
            queue,
            stream,
            database_url: get_env("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            database_max_connections: env.bounded(
                "DATABASE_MAX_CONNECTIONS",
                d.database_max_connections,
                1,
                1_000,
            )?,
            bind_addr: env.string("BIND_ADDR", d.bind_addr),
        })
    }
}

/// Upper bound for any duration setting (7 days). Larger values overflow
/// `Instant` arithmetic in the timers.
const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

struct Env<'a, F> {
    get: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: String) -> String {
        (self.get)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
    }

    fn bounded<T>(&self, key: &'static str, default: T, min: T, max: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr + PartialOrd + Copy,
    {
        let Some(raw) = (self.get)(key) else {
            return Ok(default);
        };

        match raw.trim().parse::<T>() {
            Ok(v) if v >= min && v <= max => Ok(v),
            _ => Err(ConfigError::Invalid {
                key,
                expected: "an integer within the supported range",
                value: raw,
            }),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.secs_bounded(key, default, 1, MAX_DURATION_SECS)
    }

    fn secs_bounded(
        &self,
        key: &'static str,
        default: Duration,
        min: u64,
        max: u64,
    ) -> Result<Duration, ConfigError> {
        let Some(raw) = (self.get)(key) else {
            return Ok(default);
        };

        match raw.trim().parse::<u64>() {
            Ok(v) if v >= min && v <= max => Ok(Duration::from_secs(v)),
            _ => Err(ConfigError::Invalid {
                key,
                expected: "a positive number of seconds within the supported range",
                value: raw,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_env_with(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let settings = load(&[]).unwrap();
        assert_eq!(settings.queue.queue_name, "lineage_events");
        assert_eq!(settings.queue.dead_letter_queue, "lineage_events_dlq");
        assert_eq!(settings.queue.batch_size, 10);
        assert_eq!(settings.stream.session_queue_capacity, 100);
        assert_eq!(settings.stream.replay_window, 50);
        assert!(settings.database_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let settings = load(&[
            ("QUEUE_BATCH_SIZE", "25"),
            ("QUEUE_POLL_INTERVAL_SECS", "2"),
            ("STREAM_ZOMBIE_GRACE_SECS", "15"),
            ("DATABASE_URL", "postgres://localhost/lake"),
        ])
        .unwrap();

        assert_eq!(settings.queue.batch_size, 25);
        assert_eq!(settings.queue.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.stream.zombie_grace, Duration::from_secs(15));
        assert_eq!(settings.database_url.as_deref(), Some("postgres://localhost/lake"));
    }

    #[test]
    fn out_of_range_batch_size_is_rejected() {
        let err = load(&[("QUEUE_BATCH_SIZE", "500")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "QUEUE_BATCH_SIZE", .. }));
    }

    #[test]
    fn zero_duration_is_rejected() {
        let err = load(&[("STREAM_HARD_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn durations_beyond_a_week_are_rejected() {
        let err = load(&[("STREAM_TIMEOUT_SWEEP_INTERVAL_SECS", &u64::MAX.to_string())]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "STREAM_TIMEOUT_SWEEP_INTERVAL_SECS", .. }
        ));

        let err = load(&[("QUEUE_VISIBILITY_TIMEOUT_SECS", "604801")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let settings = load(&[("QUEUE_VISIBILITY_TIMEOUT_SECS", "604800")]).unwrap();
        assert_eq!(settings.queue.visibility_window, Duration::from_secs(604_800));
    }

    #[test]
    fn replay_window_cannot_exceed_session_queue() {
        let err = load(&[("STREAM_QUEUE_CAPACITY", "20"), ("STREAM_REPLAY_WINDOW", "30")]).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));

        let settings = load(&[("STREAM_QUEUE_CAPACITY", "30"), ("STREAM_REPLAY_WINDOW", "30")]).unwrap();
        assert_eq!(settings.stream.replay_window, 30);
    }

    #[test]
    fn replay_window_cannot_exceed_capacity() {
        let err = load(&[("STREAM_REPLAY_CAPACITY", "10"), ("STREAM_REPLAY_WINDOW", "20")]).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }
}
