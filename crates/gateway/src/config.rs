use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use robokache_auth::{DEFAULT_ISSUERS, DEFAULT_KEYS_URL, VerifierConfig};
use robokache_contracts::opaque_id::CodecConfig;

const DEFAULT_MAX_BLOB_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub db_url: String,
    pub data_dir: PathBuf,
    pub store_timeout_ms: u64,
    pub max_blob_bytes: usize,
    pub id_codec: CodecConfig,
    pub verifier: VerifierConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("ROBOKACHE_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("ROBOKACHE_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "ROBOKACHE_BIND_ADDR",
        )?;

        let data_dir = PathBuf::from(optional_nonempty(kv, "ROBOKACHE_DATA_DIR").unwrap_or("./data"));

        let db_url = match optional_nonempty(kv, "ROBOKACHE_DB_URL") {
            Some(url) => url.to_string(),
            None => format!(
                "sqlite://{}?mode=rwc",
                data_dir.join("robokache.db").display()
            ),
        };

        let store_timeout_ms = parse_u64(
            kv.get("ROBOKACHE_STORE_TIMEOUT_MS"),
            5000,
            "ROBOKACHE_STORE_TIMEOUT_MS",
        )?;
        if store_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ROBOKACHE_STORE_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let max_blob_bytes = parse_usize(
            kv.get("ROBOKACHE_MAX_BLOB_BYTES"),
            DEFAULT_MAX_BLOB_BYTES,
            "ROBOKACHE_MAX_BLOB_BYTES",
        )?;

        let salt = require_nonempty(kv, "ROBOKACHE_ID_SALT")?;
        let min_length = parse_usize(
            kv.get("ROBOKACHE_ID_MIN_LENGTH"),
            8,
            "ROBOKACHE_ID_MIN_LENGTH",
        )?;
        if min_length > 64 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ROBOKACHE_ID_MIN_LENGTH must be <= 64".to_string(),
            });
        }

        let verifier = parse_verifier_config(kv)?;

        Ok(Self {
            bind_addr,
            db_url,
            data_dir,
            store_timeout_ms,
            max_blob_bytes,
            id_codec: CodecConfig { salt, min_length },
            verifier,
        })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Database URL safe to log: connection options and any credentials are dropped.
    pub fn db_location(&self) -> String {
        let without_query = self.db_url.split('?').next().unwrap_or_default();
        match without_query.split_once("://") {
            Some((scheme, rest)) => match rest.rsplit_once('@') {
                Some((_, host)) => format!("{}://{}", scheme, host),
                None => without_query.to_string(),
            },
            None => without_query.to_string(),
        }
    }
}

fn parse_verifier_config(kv: &HashMap<String, String>) -> Result<VerifierConfig, StartupError> {
    let audience = require_nonempty(kv, "ROBOKACHE_OIDC_AUDIENCE")?;

    let mut issuers = match optional_nonempty(kv, "ROBOKACHE_OIDC_ISSUERS") {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
        None => DEFAULT_ISSUERS.iter().map(|s| s.to_string()).collect(),
    };
    issuers.sort();
    issuers.dedup();
    if issuers.is_empty() {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "ROBOKACHE_OIDC_ISSUERS must name at least one issuer".to_string(),
        });
    }

    let keys_url = optional_nonempty(kv, "ROBOKACHE_OIDC_KEYS_URL")
        .unwrap_or(DEFAULT_KEYS_URL)
        .to_string();
    if !(keys_url.starts_with("https://") || keys_url.starts_with("http://")) {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "ROBOKACHE_OIDC_KEYS_URL must be an http(s) URL".to_string(),
        });
    }

    let keys_timeout_ms = parse_u64(
        kv.get("ROBOKACHE_OIDC_KEYS_TIMEOUT_MS"),
        2000,
        "ROBOKACHE_OIDC_KEYS_TIMEOUT_MS",
    )?;
    if keys_timeout_ms == 0 {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "ROBOKACHE_OIDC_KEYS_TIMEOUT_MS must be >= 1".to_string(),
        });
    }
    let keys_cache_ttl_secs = parse_u64(
        kv.get("ROBOKACHE_OIDC_KEYS_CACHE_TTL_SECS"),
        0,
        "ROBOKACHE_OIDC_KEYS_CACHE_TTL_SECS",
    )?;
    let keys_min_refresh_secs = parse_u64(
        kv.get("ROBOKACHE_OIDC_KEYS_MIN_REFRESH_SECS"),
        30,
        "ROBOKACHE_OIDC_KEYS_MIN_REFRESH_SECS",
    )?;
    let clock_skew_secs = parse_u64(
        kv.get("ROBOKACHE_OIDC_CLOCK_SKEW_SECS"),
        60,
        "ROBOKACHE_OIDC_CLOCK_SKEW_SECS",
    )?;

    Ok(VerifierConfig {
        audience,
        issuers,
        keys_url,
        keys_timeout: Duration::from_millis(keys_timeout_ms),
        keys_cache_ttl: Duration::from_secs(keys_cache_ttl_secs),
        keys_min_refresh: Duration::from_secs(keys_min_refresh_secs),
        clock_skew: Duration::from_secs(clock_skew_secs),
    })
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn optional_nonempty<'a>(kv: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    kv.get(key).map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_nonempty(kv, key)
        .map(|s| s.to_string())
        .ok_or_else(|| StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}
