//! Runtime configuration.

use std::env;

use crate::error::ConfigError;

/// Environment variable overriding [`Config::pool_capacity`].
pub const POOL_CAPACITY_VAR: &str = "MURMUR_POOL_CAPACITY";
/// Environment variable overriding [`Config::outbox_capacity`].
pub const OUTBOX_CAPACITY_VAR: &str = "MURMUR_OUTBOX_CAPACITY";
/// Environment variable overriding [`Config::first_msg_id`].
pub const FIRST_MSG_ID_VAR: &str = "MURMUR_FIRST_MSG_ID";

const DEFAULT_POOL_CAPACITY: usize = 128;
const DEFAULT_OUTBOX_CAPACITY: usize = 1024;
const DEFAULT_FIRST_MSG_ID: u64 = 1;

/// Tunables for a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pool_capacity: usize,
    outbox_capacity: usize,
    first_msg_id: u64,
}

impl Config {
    /// Loads the configuration from the process environment, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::from_lookup(|var| env::var(var).ok())
    }

    /// Loads the configuration using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let capacity = |var: &'static str, default: usize| -> Result<usize, ConfigError> {
            let Some(value) = lookup(var) else {
                return Ok(default);
            };
            match value.trim().parse::<usize>() {
                Ok(0) => Err(ConfigError::ZeroCapacity { var }),
                Ok(capacity) => Ok(capacity),
                Err(err) => Err(ConfigError::Invalid { var, err }),
            }
        };

        let mut config = Config::default();
        config.pool_capacity = capacity(POOL_CAPACITY_VAR, config.pool_capacity)?;
        config.outbox_capacity = capacity(OUTBOX_CAPACITY_VAR, config.outbox_capacity)?;
        if let Some(value) = lookup(FIRST_MSG_ID_VAR) {
            config.first_msg_id = value
                .trim()
                .parse()
                .map_err(|err| ConfigError::Invalid {
                    var: FIRST_MSG_ID_VAR,
                    err,
                })?;
        }

        Ok(config)
    }

    /// Sets the number of handler invocations that may run at once.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        assert_ne!(capacity, 0);
        self.pool_capacity = capacity;
        self
    }

    /// Sets how many outgoing lines may wait for the writer before senders are made to wait.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        assert_ne!(capacity, 0);
        self.outbox_capacity = capacity;
        self
    }

    /// Sets the first outgoing message id.
    ///
    /// Ids are issued upwards from here and `u64::MAX` is never issued, so a node starting at `first_msg_id` can
    /// reply to at most `u64::MAX - first_msg_id` requests. Later requests get an `Unavailable` error.
    pub fn with_first_msg_id(mut self, first_msg_id: u64) -> Self {
        self.first_msg_id = first_msg_id;
        self
    }

    /// The number of handler invocations that may run at once.
    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    /// The number of outgoing lines that may wait for the writer.
    pub fn outbox_capacity(&self) -> usize {
        self.outbox_capacity
    }

    /// The first outgoing message id.
    pub fn first_msg_id(&self) -> u64 {
        self.first_msg_id
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            first_msg_id: DEFAULT_FIRST_MSG_ID,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<_, _> = vars.iter().copied().collect();
        move |var: &str| vars.get(var).map(|value| value.to_string())
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.pool_capacity(), 128);
        assert_eq!(config.outbox_capacity(), 1024);
        assert_eq!(config.first_msg_id(), 1);
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            (POOL_CAPACITY_VAR, "16"),
            (OUTBOX_CAPACITY_VAR, "4"),
            (FIRST_MSG_ID_VAR, " 1000 "),
        ]))
        .unwrap();
        assert_eq!(config.pool_capacity(), 16);
        assert_eq!(config.outbox_capacity(), 4);
        assert_eq!(config.first_msg_id(), 1000);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = Config::from_lookup(lookup(&[(POOL_CAPACITY_VAR, "lots")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: POOL_CAPACITY_VAR,
                ..
            }
        ));

        let err = Config::from_lookup(lookup(&[(POOL_CAPACITY_VAR, "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::ZeroCapacity {
                var: POOL_CAPACITY_VAR
            }
        );

        let err = Config::from_lookup(lookup(&[(OUTBOX_CAPACITY_VAR, "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::ZeroCapacity {
                var: OUTBOX_CAPACITY_VAR
            }
        );

        let err = Config::from_lookup(lookup(&[(FIRST_MSG_ID_VAR, "-1")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: FIRST_MSG_ID_VAR,
                ..
            }
        ));
    }
}
