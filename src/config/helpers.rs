//! Shared helpers for resolving configuration values from the environment.

use crate::error::ConfigError;

/// Read an env var, treating unset and empty as absent.
pub(crate) fn optional_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

/// Parse an env var as an integer, falling back to `default` when unset.
pub(crate) fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match optional_env(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an unsigned integer, got '{raw}'"),
        }),
        None => Ok(default),
    }
}

pub(crate) fn env_u32(key: &str, default: u32) -> Result<u32, ConfigError> {
    match optional_env(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an unsigned integer, got '{raw}'"),
        }),
        None => Ok(default),
    }
}

/// Parse an env var as a positive integer (zero rejected).
pub(crate) fn env_nonzero_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = env_u64(key, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// Normalize an enum-ish config value: lowercase, trimmed, dashes to underscores.
pub(crate) fn normalize_variant(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_variant_handles_dashes_and_case() {
        assert_eq!(normalize_variant("  Remote-Replica "), "remote_replica");
    }

    #[test]
    fn env_u64_rejects_garbage() {
        // Unique key to avoid cross-test env pollution.
        let key = "PARCELFLOW_TEST_ENV_U64_GARBAGE";
        unsafe { std::env::set_var(key, "not-a-number") };
        let err = env_u64(key, 5).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        unsafe { std::env::remove_var(key) };
    }

    #[test]
    fn env_nonzero_rejects_zero() {
        let key = "PARCELFLOW_TEST_ENV_NONZERO";
        unsafe { std::env::set_var(key, "0") };
        assert!(env_nonzero_u64(key, 3).is_err());
        unsafe { std::env::remove_var(key) };
    }
}
