use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

pub fn required_env(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("missing env: {name}"))
}

/// Returns the variable when it is set to a non-blank value.
pub fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn socket_addr_from_env(name: &str, default: &str) -> Result<SocketAddr> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    SocketAddr::from_str(&value).map_err(|err| anyhow!("invalid socket addr for {name}: {err}"))
}

pub fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| anyhow!("invalid value for {name}: {err}")),
        None => Ok(default),
    }
}

pub fn bool_env(name: &str, default: bool) -> bool {
    match optional_env(name).map(|value| value.to_ascii_lowercase()) {
        Some(value) => matches!(value.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

/// Comma separated list; blank entries are dropped.
pub fn list_env(name: &str) -> Vec<String> {
    optional_env(name)
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(())).lock().expect("lock")
    }

    struct EnvGuard {
        key: &'static str,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            // SAFETY: tests serialize env access via a global mutex.
            unsafe { env::remove_var(self.key) };
        }
    }

    fn set_env(key: &'static str, value: &str) -> EnvGuard {
        // SAFETY: tests serialize env access via a global mutex.
        unsafe { env::set_var(key, value) };
        EnvGuard { key }
    }

    #[test]
    fn required_env_reads_value() {
        let _lock = env_lock();
        let _guard = set_env("CM_TEST_REQUIRED_ENV_PRESENT", "value");
        let value = required_env("CM_TEST_REQUIRED_ENV_PRESENT").unwrap();
        assert_eq!(value, "value");
    }

    #[test]
    fn required_env_missing_returns_error() {
        let _lock = env_lock();
        assert!(required_env("CM_TEST_REQUIRED_ENV_MISSING").is_err());
    }

    #[test]
    fn socket_addr_from_env_uses_default() {
        let _lock = env_lock();
        let addr = socket_addr_from_env("CM_TEST_SOCKET_DEFAULT", "127.0.0.1:1234").unwrap();
        assert_eq!(addr, "127.0.0.1:1234".parse().unwrap());
    }

    #[test]
    fn socket_addr_from_env_invalid_returns_error() {
        let _lock = env_lock();
        let _guard = set_env("CM_TEST_SOCKET_INVALID", "not-a-socket");
        assert!(socket_addr_from_env("CM_TEST_SOCKET_INVALID", "127.0.0.1:1234").is_err());
    }

    #[test]
    fn parse_env_falls_back_and_rejects_garbage() {
        let _lock = env_lock();
        assert_eq!(parse_env::<u64>("CM_TEST_PARSE_MISSING", 30).unwrap(), 30);

        let _guard = set_env("CM_TEST_PARSE_BAD", "thirty");
        assert!(parse_env::<u64>("CM_TEST_PARSE_BAD", 30).is_err());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let _lock = env_lock();
        let _guard = set_env("CM_TEST_BLANK", "   ");
        assert!(optional_env("CM_TEST_BLANK").is_none());
        assert!(bool_env("CM_TEST_BLANK", true));
    }

    #[test]
    fn list_env_splits_and_trims() {
        let _lock = env_lock();
        let _guard = set_env("CM_TEST_LIST", "https://a.example, ,https://b.example");
        assert_eq!(
            list_env("CM_TEST_LIST"),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }
}
