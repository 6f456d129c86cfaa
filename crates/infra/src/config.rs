//! Configuration loading and representation.
//!
//! Everything is read from the environment (optionally seeded from a `.env`
//! file) once at start-up and then passed explicitly to the components that
//! need it.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use shopdesk_fiscal::EmissionMode;
use shopdesk_observability::LogFormat;

use crate::jobs::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: u32,
}

/// Real-provider endpoint settings. Per-issuer credentials in
/// `gateway_configs` take precedence over `api_key`.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Artificial latency of the local stub provider.
    pub stub_delay: Duration,
}

impl core::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("stub_delay", &self.stub_delay)
            .finish()
    }
}

/// Where generated documents are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local {
        dir: PathBuf,
    },
    S3 {
        bucket: String,
        region: Option<String>,
        prefix: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// How long a job may stay `processing` before the sweep reclaims it.
    pub lease: Duration,
}

impl WorkerSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.backoff_base)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5_000),
            max_attempts: 5,
            backoff_base: Duration::from_secs(60),
            lease: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database: DatabaseSettings,
    pub provider: ProviderSettings,
    pub storage: StorageConfig,
    pub worker: WorkerSettings,
    pub emission_mode: EmissionMode,
    /// Key material for the certificate cipher (`CERT_ENCRYPTION_KEY`).
    pub cipher_key: Option<String>,
    pub log_format: LogFormat,
}

impl core::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppConfig")
            .field("database_url_set", &self.database.url.is_some())
            .field("max_connections", &self.database.max_connections)
            .field("provider", &self.provider)
            .field("storage", &self.storage)
            .field("worker", &self.worker)
            .field("emission_mode", &self.emission_mode)
            .field("cipher_key_set", &self.cipher_key.is_some())
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the process environment (and `.env`, if any).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database = DatabaseSettings {
            url: get("DATABASE_URL"),
            max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 5)?,
        };

        let provider = ProviderSettings {
            base_url: get("FISCAL_PROVIDER_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            api_key: get("FISCAL_PROVIDER_API_KEY"),
            timeout: Duration::from_secs(parse_or(&get, "FISCAL_PROVIDER_TIMEOUT_SECS", 20)?),
            stub_delay: Duration::from_millis(parse_or(&get, "FISCAL_STUB_DELAY_MS", 500)?),
        };

        let storage = match get("STORAGE_BACKEND").map(|b| b.to_lowercase()).as_deref() {
            None | Some("local") => StorageConfig::Local {
                dir: get("STORAGE_LOCAL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("storage/notas_fiscais")),
            },
            Some("s3") => StorageConfig::S3 {
                bucket: get("STORAGE_S3_BUCKET").ok_or(ConfigError::Missing("STORAGE_S3_BUCKET"))?,
                region: get("STORAGE_S3_REGION"),
                prefix: get("STORAGE_S3_PREFIX").unwrap_or_else(|| "notas-fiscais/".to_string()),
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORAGE_BACKEND",
                    value: other.to_string(),
                    reason: "expected `local` or `s3`".to_string(),
                });
            }
        };

        let defaults = WorkerSettings::default();
        let worker = WorkerSettings {
            poll_interval: Duration::from_millis(parse_or(
                &get,
                "NF_WORKER_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            max_attempts: parse_or(&get, "NF_WORKER_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base: Duration::from_secs(parse_or(
                &get,
                "NF_WORKER_BACKOFF_BASE_SECS",
                defaults.backoff_base.as_secs(),
            )?),
            lease: Duration::from_secs(parse_or(&get, "NF_WORKER_LEASE_SECS", defaults.lease.as_secs())?),
        };
        if worker.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "NF_WORKER_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        // A lease shorter than one provider call lets the sweep hand a job
        // that is still in flight to a second worker.
        let longest_call = provider.timeout + provider.stub_delay;
        if worker.lease <= longest_call {
            return Err(ConfigError::Invalid {
                key: "NF_WORKER_LEASE_SECS",
                value: worker.lease.as_secs().to_string(),
                reason: format!(
                    "must exceed the provider timeout plus stub delay ({}ms)",
                    longest_call.as_millis()
                ),
            });
        }

        let emission_mode = match get("NF_EMISSION_MODE") {
            None => EmissionMode::default(),
            Some(raw) => raw.parse().map_err(|e: shopdesk_core::DomainError| ConfigError::Invalid {
                key: "NF_EMISSION_MODE",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
        };

        Ok(Self {
            database,
            provider,
            storage,
            worker,
            emission_mode,
            cipher_key: lookup("CERT_ENCRYPTION_KEY").filter(|k| !k.is_empty()),
            log_format: LogFormat::from_env_value(get("LOG_FORMAT").as_deref()),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database
            .url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

fn parse_or<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_any_settings() {
        let cfg = config(&[]).unwrap();

        assert_eq!(cfg.database.url, None);
        assert_eq!(cfg.provider.timeout, Duration::from_secs(20));
        assert_eq!(
            cfg.storage,
            StorageConfig::Local {
                dir: PathBuf::from("storage/notas_fiscais")
            }
        );
        assert_eq!(cfg.worker, WorkerSettings::default());
        assert_eq!(cfg.emission_mode, EmissionMode::Queued);
        assert_eq!(cfg.cipher_key, None);
        assert!(cfg.require_database_url().is_err());
    }

    #[test]
    fn reads_s3_and_worker_settings() {
        let cfg = config(&[
            ("STORAGE_BACKEND", "S3"),
            ("STORAGE_S3_BUCKET", "notas"),
            ("STORAGE_S3_REGION", "sa-east-1"),
            ("NF_WORKER_MAX_ATTEMPTS", "3"),
            ("NF_WORKER_BACKOFF_BASE_SECS", "10"),
            ("NF_EMISSION_MODE", "manual-summary"),
            ("FISCAL_PROVIDER_BASE_URL", "https://api.example.com/"),
        ])
        .unwrap();

        assert_eq!(
            cfg.storage,
            StorageConfig::S3 {
                bucket: "notas".to_string(),
                region: Some("sa-east-1".to_string()),
                prefix: "notas-fiscais/".to_string(),
            }
        );
        assert_eq!(cfg.worker.max_attempts, 3);
        assert_eq!(cfg.worker.retry_policy().delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(cfg.emission_mode, EmissionMode::ManualSummary);
        assert_eq!(cfg.provider.base_url.as_deref(), Some("https://api.example.com"));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            config(&[("NF_WORKER_POLL_INTERVAL_MS", "soon")]),
            Err(ConfigError::Invalid { key: "NF_WORKER_POLL_INTERVAL_MS", .. })
        ));
        assert!(matches!(
            config(&[("STORAGE_BACKEND", "ftp")]),
            Err(ConfigError::Invalid { key: "STORAGE_BACKEND", .. })
        ));
        assert_eq!(
            config(&[("STORAGE_BACKEND", "s3")]).unwrap_err(),
            ConfigError::Missing("STORAGE_S3_BUCKET")
        );
        assert!(matches!(
            config(&[("NF_WORKER_MAX_ATTEMPTS", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn lease_must_outlive_a_provider_call() {
        assert!(matches!(
            config(&[("NF_WORKER_LEASE_SECS", "0")]),
            Err(ConfigError::Invalid { key: "NF_WORKER_LEASE_SECS", .. })
        ));
        // 20s timeout + 500ms stub delay.
        assert!(matches!(
            config(&[("NF_WORKER_LEASE_SECS", "20")]),
            Err(ConfigError::Invalid { key: "NF_WORKER_LEASE_SECS", .. })
        ));
        assert!(matches!(
            config(&[
                ("NF_WORKER_LEASE_SECS", "60"),
                ("FISCAL_PROVIDER_TIMEOUT_SECS", "90"),
            ]),
            Err(ConfigError::Invalid { key: "NF_WORKER_LEASE_SECS", .. })
        ));

        let cfg = config(&[("NF_WORKER_LEASE_SECS", "21")]).unwrap();
        assert_eq!(cfg.worker.lease, Duration::from_secs(21));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = config(&[
            ("FISCAL_PROVIDER_API_KEY", "super-secret"),
            ("CERT_ENCRYPTION_KEY", "key-material"),
        ])
        .unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("key-material"));
    }
}
