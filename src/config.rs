use std::path::PathBuf;
use std::time::Duration;

/// Server settings, read once at startup from `RESERVAD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites it.
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    /// Username of the manager seeded into every new tenant.
    pub admin_user: String,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "reservad".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_timeout: Duration::from_millis(5000),
            admin_user: "admin".into(),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Settings::default();
        let var = |name: &str| lookup(&format!("RESERVAD_{name}"));
        let num = |name: &str| {
            var(name).and_then(|raw| match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("ignoring RESERVAD_{name}={raw:?}: not a number");
                    None
                }
            })
        };

        Self {
            bind: var("BIND").unwrap_or(d.bind),
            port: num("PORT")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(d.port),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: var("PASSWORD").unwrap_or(d.password),
            max_connections: num("MAX_CONNECTIONS")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: num("COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            lock_timeout: num("LOCK_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(d.lock_timeout),
            admin_user: var("ADMIN_USER")
                .filter(|u| !u.trim().is_empty())
                .unwrap_or(d.admin_user),
            metrics_port: num("METRICS_PORT").and_then(|p| u16::try_from(p).ok()),
            tls_cert: var("TLS_CERT"),
            tls_key: var("TLS_KEY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(settings(&[]), Settings::default());
    }

    #[test]
    fn reads_prefixed_vars() {
        let s = settings(&[
            ("RESERVAD_PORT", "6543"),
            ("RESERVAD_DATA_DIR", "/var/lib/reservad"),
            ("RESERVAD_LOCK_TIMEOUT_MS", "250"),
            ("RESERVAD_METRICS_PORT", "9100"),
            ("RESERVAD_ADMIN_USER", "secretaria"),
        ]);
        assert_eq!(s.port, 6543);
        assert_eq!(s.data_dir, PathBuf::from("/var/lib/reservad"));
        assert_eq!(s.lock_timeout, Duration::from_millis(250));
        assert_eq!(s.metrics_port, Some(9100));
        assert_eq!(s.admin_user, "secretaria");
    }

    #[test]
    fn bad_numbers_fall_back() {
        let s = settings(&[
            ("RESERVAD_PORT", "99999"),
            ("RESERVAD_MAX_CONNECTIONS", "lots"),
            ("RESERVAD_LOCK_TIMEOUT_MS", "0"),
        ]);
        assert_eq!(s.port, 5433);
        assert_eq!(s.max_connections, 256);
        assert_eq!(s.lock_timeout, Duration::from_millis(5000));
    }
}
