use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::EngineConfig;
use crate::site::SiteSettings;
use crate::tls::TlsSetting;

/// SMTP relay settings; mail is only logged when absent.
#[derive(Debug, Clone, PartialEq)]
pub struct SmtpConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub from: String,
}

/// Server configuration, read once from `STAYBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls: TlsSetting,
    pub smtp: Option<SmtpConfig>,
    pub site: SiteSettings,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unparsable numbers fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            get(key).and_then(|s| s.parse().ok())
        }

        let defaults = EngineConfig::default();
        let payment_window_ms = parsed::<i64>(&get, "STAYBOOK_PAYMENT_WINDOW_SECS")
            .filter(|secs| *secs > 0)
            .map_or(defaults.payment_window_ms, |secs| secs * 1000);
        let bcrypt_cost = parsed::<u32>(&get, "STAYBOOK_BCRYPT_COST")
            .filter(|cost| (4..=31).contains(cost))
            .unwrap_or(defaults.bcrypt_cost);

        let smtp = get("STAYBOOK_SMTP_HOST").map(|host| SmtpConfig {
            host,
            user: get("STAYBOOK_SMTP_USER").unwrap_or_default(),
            password: get("STAYBOOK_SMTP_PASSWORD").unwrap_or_default(),
            from: get("STAYBOOK_MAIL_FROM").unwrap_or_else(|| "staybook <noreply@localhost>".into()),
        });

        Self {
            port: parsed(&get, "STAYBOOK_PORT").unwrap_or(5433),
            bind: get("STAYBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("STAYBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("STAYBOOK_PASSWORD").unwrap_or_else(|| "staybook".into()),
            max_connections: parsed(&get, "STAYBOOK_MAX_CONNECTIONS").unwrap_or(256),
            metrics_port: parsed(&get, "STAYBOOK_METRICS_PORT"),
            tls: TlsSetting::from_pair(get("STAYBOOK_TLS_CERT"), get("STAYBOOK_TLS_KEY")),
            smtp,
            site: SiteSettings {
                engine: EngineConfig {
                    payment_window_ms,
                    bcrypt_cost,
                },
                compact_threshold: parsed(&get, "STAYBOOK_COMPACT_THRESHOLD").unwrap_or(1000),
            },
        }
    }
}
