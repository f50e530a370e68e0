//! Log settings, read before anything else so startup errors are logged.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogSettings {
    /// `REDRUN_LOG_LEVEL` and `REDRUN_LOG_FORMAT` (`json` or `pretty`).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            level: get("REDRUN_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            format: match get("REDRUN_LOG_FORMAT").map(|v| v.to_ascii_lowercase()).as_deref() {
                Some("pretty") | Some("text") => LogFormat::Pretty,
                _ => LogFormat::Json,
            },
        }
    }
}
