//! Agent configuration.
//!
//! [`AgentConfig`] is shared by both roles.  Front-ends either fill it in
//! directly (the CLI maps its typed flags onto it) or apply textual
//! key/value pairs over the defaults with [`AgentConfig::from_pairs`].

use std::time::Duration;

use thiserror::Error;

use crate::packet::MAX_PAYLOAD;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("value {value:?} for `{key}` is not a number")]
    NotNumeric { key: String, value: String },
    #[error("value for `{key}` must not be negative (got {value})")]
    Negative { key: String, value: String },
    #[error("`{key}` out of range: {reason}")]
    OutOfRange { key: &'static str, reason: String },
    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),
}

/// Tunables for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Log every packet sent and received at `info` instead of `trace`.
    pub packet_logging: bool,
    /// Percentage in `[0, 100)` of outgoing packets to corrupt.
    pub corruption_pct: f64,
    /// Percentage in `[0, 100)` of outgoing packets to drop.
    pub drop_pct: f64,
    /// Retransmission timeout used until the first RTT sample; also the
    /// handshake and teardown retry interval.
    pub initial_timeout: Duration,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub initial_cwnd: u32,
    pub ssthresh: u32,
    /// Receive buffer size in bytes.
    pub max_buffer: u32,
    /// Sleep between admission attempts while the send window is full.
    pub retry_interval: Duration,
    /// Give up a single packet after this many refused admissions.
    /// `None` retries forever.
    pub max_send_retries: Option<u32>,
    pub handshake_attempts: u32,
    pub teardown_attempts: u32,
    /// How long the sender stays in CLOSING re-acknowledging a repeated FIN.
    pub linger: Duration,
    /// Receiver gives up after this long without any inbound datagram.
    pub idle_timeout: Duration,
    /// Period of the receiver's drain task.
    pub drain_interval: Duration,
    /// Seed for the fault-injection RNG.  `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            packet_logging: false,
            corruption_pct: 0.0,
            drop_pct: 0.0,
            initial_timeout: Duration::from_millis(100),
            min_timeout: Duration::from_millis(20),
            max_timeout: Duration::from_secs(2),
            initial_cwnd: 1,
            ssthresh: 16,
            max_buffer: 32_000,
            retry_interval: Duration::from_micros(500),
            max_send_retries: None,
            handshake_attempts: 20,
            teardown_attempts: 10,
            linger: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(30),
            drain_interval: Duration::from_millis(5),
            seed: None,
        }
    }
}

impl AgentConfig {
    /// Apply `key=value` pairs over the defaults and validate the result.
    ///
    /// An empty value keeps the default for that key.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut cfg = Self::default();
        for (key, value) in pairs {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            cfg.apply(key, value)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "packet_logging" => {
                self.packet_logging = match value {
                    "true" | "on" | "yes" => true,
                    "false" | "off" | "no" => false,
                    other => number(key, other)? != 0.0,
                }
            }
            "corruption" => self.corruption_pct = number(key, value)?,
            "drop" => self.drop_pct = number(key, value)?,
            "timeout_ms" => self.initial_timeout = millis(key, value)?,
            "min_timeout_ms" => self.min_timeout = millis(key, value)?,
            "max_timeout_ms" => self.max_timeout = millis(key, value)?,
            "cwnd" => self.initial_cwnd = integer(key, value)?,
            "ssthresh" => self.ssthresh = integer(key, value)?,
            "buffer" => self.max_buffer = integer(key, value)?,
            "retry_us" => self.retry_interval = Duration::from_micros(integer(key, value)?),
            "max_retries" => self.max_send_retries = Some(integer(key, value)?),
            "handshake_attempts" => self.handshake_attempts = integer(key, value)?,
            "teardown_attempts" => self.teardown_attempts = integer(key, value)?,
            "linger_ms" => self.linger = millis(key, value)?,
            "idle_timeout_ms" => self.idle_timeout = millis(key, value)?,
            "drain_ms" => self.drain_interval = millis(key, value)?,
            "seed" => self.seed = Some(integer(key, value)?),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, pct) in [("corruption", self.corruption_pct), ("drop", self.drop_pct)] {
            if !(0.0..100.0).contains(&pct) {
                return Err(ConfigError::OutOfRange {
                    key,
                    reason: format!("{pct} is not in [0, 100)"),
                });
            }
        }
        for (key, d) in [
            ("timeout_ms", self.initial_timeout),
            ("min_timeout_ms", self.min_timeout),
            ("max_timeout_ms", self.max_timeout),
            ("drain_ms", self.drain_interval),
        ] {
            if d.is_zero() {
                return Err(ConfigError::OutOfRange {
                    key,
                    reason: "must be positive".into(),
                });
            }
        }
        if self.min_timeout > self.max_timeout {
            return Err(ConfigError::OutOfRange {
                key: "min_timeout_ms",
                reason: format!(
                    "{:?} exceeds max_timeout {:?}",
                    self.min_timeout, self.max_timeout
                ),
            });
        }
        for (key, n) in [
            ("cwnd", self.initial_cwnd),
            ("ssthresh", self.ssthresh),
            ("handshake_attempts", self.handshake_attempts),
            ("teardown_attempts", self.teardown_attempts),
        ] {
            if n == 0 {
                return Err(ConfigError::OutOfRange {
                    key,
                    reason: "must be at least 1".into(),
                });
            }
        }
        if (self.max_buffer as usize) < MAX_PAYLOAD {
            return Err(ConfigError::OutOfRange {
                key: "buffer",
                reason: format!("must hold at least one {MAX_PAYLOAD}-byte payload"),
            });
        }
        Ok(())
    }
}

fn number(key: &str, value: &str) -> Result<f64, ConfigError> {
    let n: f64 = value.parse().map_err(|_| ConfigError::NotNumeric {
        key: key.to_string(),
        value: value.to_string(),
    })?;
    if !n.is_finite() {
        return Err(ConfigError::NotNumeric {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    if n < 0.0 {
        return Err(ConfigError::Negative {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(n)
}

fn integer<T: TryFrom<u64>>(key: &str, value: &str) -> Result<T, ConfigError> {
    if value.starts_with('-') {
        // Still report garbage like "-x" as non-numeric.
        number(key, value)?;
    }
    let n: u64 = value.parse().map_err(|_| ConfigError::NotNumeric {
        key: key.to_string(),
        value: value.to_string(),
    })?;
    T::try_from(n).map_err(|_| ConfigError::NotNumeric {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    integer::<u64>(key, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_values_keep_defaults() {
        let cfg = AgentConfig::from_pairs([("drop", ""), ("timeout_ms", "  ")]).unwrap();
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn pairs_override_defaults() {
        let cfg = AgentConfig::from_pairs([
            ("packet_logging", "true"),
            ("drop", "20"),
            ("corruption", "2.5"),
            ("timeout_ms", "250"),
            ("cwnd", "4"),
            ("max_retries", "100"),
            ("seed", "7"),
        ])
        .unwrap();
        assert!(cfg.packet_logging);
        assert_eq!(cfg.drop_pct, 20.0);
        assert_eq!(cfg.corruption_pct, 2.5);
        assert_eq!(cfg.initial_timeout, Duration::from_millis(250));
        assert_eq!(cfg.initial_cwnd, 4);
        assert_eq!(cfg.max_send_retries, Some(100));
        assert_eq!(cfg.seed, Some(7));
    }

    #[test]
    fn non_numeric_value_is_rejected() {
        let err = AgentConfig::from_pairs([("drop", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::NotNumeric { ref key, .. } if key == "drop"));
    }

    #[test]
    fn negative_values_are_rejected() {
        assert!(matches!(
            AgentConfig::from_pairs([("corruption", "-1")]).unwrap_err(),
            ConfigError::Negative { .. }
        ));
        assert!(matches!(
            AgentConfig::from_pairs([("timeout_ms", "-5")]).unwrap_err(),
            ConfigError::Negative { .. }
        ));
    }

    #[test]
    fn percentages_must_stay_below_100() {
        let err = AgentConfig::from_pairs([("drop", "100")]).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "drop", .. }));
    }

    #[test]
    fn min_timeout_cannot_exceed_max() {
        let err =
            AgentConfig::from_pairs([("min_timeout_ms", "500"), ("max_timeout_ms", "100")])
                .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "min_timeout_ms", .. }));
    }

    #[test]
    fn buffer_must_fit_one_payload() {
        let err = AgentConfig::from_pairs([("buffer", "999")]).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "buffer", .. }));
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert_eq!(
            AgentConfig::from_pairs([("window", "8")]).unwrap_err(),
            ConfigError::UnknownKey("window".into())
        );
    }
}
