//! Transaction tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for a [`DatabaseTransaction`](crate::transaction::DatabaseTransaction).
///
/// Deserializable so it can live in an application's configuration file;
/// missing fields fall back to the defaults.
///
/// ```
/// use std::time::Duration;
///
/// use keystone_core::settings::TransactionSettings;
///
/// let settings = TransactionSettings::default()
///     .connect_attempts(10)
///     .connect_retry_delay(Duration::from_millis(5));
/// assert_eq!(settings.connect_attempts, 10);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    /// How many times a connection still `Connecting` is polled before it is
    /// discarded and a fresh one is requested.
    pub connect_attempts: u32,
    /// Pause between two polls of a `Connecting` connection.
    pub connect_retry_delay: Duration,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 50,
            connect_retry_delay: Duration::from_millis(20),
        }
    }
}

impl TransactionSettings {
    #[must_use]
    pub const fn connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn connect_retry_delay(mut self, delay: Duration) -> Self {
        self.connect_retry_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let settings: TransactionSettings =
            serde_json::from_str(r#"{ "connect_attempts": 3 }"#).unwrap();
        assert_eq!(settings.connect_attempts, 3);
        assert_eq!(
            settings.connect_retry_delay,
            TransactionSettings::default().connect_retry_delay
        );
    }
}
