use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use cdc_auth::JwtConfig;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub db_url: String,
    pub source_a_db_url: String,
    pub source_b_db_url: String,
    pub source_max_connections: u32,
    pub source_query_timeout_ms: u64,
    pub binding_timeout_ms: u64,
    pub binding_cache_max_entries: usize,
    pub binding_cache_ttl_ms: u64,
    pub over_fetch_margin: usize,
    pub max_page_limit: usize,
    pub auth_mode: AuthMode,
    pub jwt: Option<JwtConfig>,
    pub local_auth_shared_secret: Option<String>,
    pub rate_limit_window_secs: u64,
    pub rate_limit_requests_per_window: u32,
    pub metrics_require_auth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Local,
    Jwt,
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

        if let Ok(config_path) = std::env::var("CDC_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                merged.extend(parse_env_file(config_path)?);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("CDC_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "CDC_BIND_ADDR",
        )?;

        let auth_mode = parse_auth_mode(kv.get("CDC_AUTH_MODE"))?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("CDC_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        // Local mode trusts a tenant header, so it must never face a network
        // unless explicitly opted into for containers.
        if !bind_addr.ip().is_loopback()
            && auth_mode != AuthMode::Jwt
            && !(dev_allow_nonlocal_bind && bind_addr.ip().is_unspecified())
        {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                message: "non-local bind requires CDC_AUTH_MODE=jwt; refuse startup".to_string(),
            });
        }

        let db_url = require_nonempty(kv, "CDC_DB_URL")?;
        let source_a_db_url = require_nonempty(kv, "CDC_SOURCE_A_DB_URL")?;
        let source_b_db_url = require_nonempty(kv, "CDC_SOURCE_B_DB_URL")?;

        let source_max_connections = parse_u32(
            kv.get("CDC_SOURCE_MAX_CONNECTIONS"),
            8,
            "CDC_SOURCE_MAX_CONNECTIONS",
        )?;
        if source_max_connections == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "CDC_SOURCE_MAX_CONNECTIONS must be >= 1".to_string(),
            });
        }

        let source_query_timeout_ms = parse_u64(
            kv.get("CDC_SOURCE_QUERY_TIMEOUT_MS"),
            5000,
            "CDC_SOURCE_QUERY_TIMEOUT_MS",
        )?;
        let binding_timeout_ms = parse_u64(
            kv.get("CDC_BINDING_TIMEOUT_MS"),
            2000,
            "CDC_BINDING_TIMEOUT_MS",
        )?;
        for (key, value) in [
            ("CDC_SOURCE_QUERY_TIMEOUT_MS", source_query_timeout_ms),
            ("CDC_BINDING_TIMEOUT_MS", binding_timeout_ms),
        ] {
            if value == 0 {
                return Err(StartupError {
                    code: "ERR_INVALID_CONFIG",
                    message: format!("{} must be >= 1", key),
                });
            }
        }

        let binding_cache_max_entries = parse_usize(
            kv.get("CDC_BINDING_CACHE_MAX_ENTRIES"),
            4096,
            "CDC_BINDING_CACHE_MAX_ENTRIES",
        )?;
        let binding_cache_ttl_ms = parse_u64(
            kv.get("CDC_BINDING_CACHE_TTL_MS"),
            60_000,
            "CDC_BINDING_CACHE_TTL_MS",
        )?;

        let over_fetch_margin =
            parse_usize(kv.get("CDC_OVER_FETCH_MARGIN"), 5, "CDC_OVER_FETCH_MARGIN")?;

        let max_page_limit = parse_usize(kv.get("CDC_MAX_PAGE_LIMIT"), 200, "CDC_MAX_PAGE_LIMIT")?;
        if max_page_limit == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "CDC_MAX_PAGE_LIMIT must be >= 1".to_string(),
            });
        }

        let jwt = if auth_mode == AuthMode::Jwt {
            Some(parse_jwt_config(kv)?)
        } else {
            None
        };

        let local_auth_shared_secret = optional_nonempty(kv, "CDC_LOCAL_AUTH_SHARED_SECRET");

        let rate_limit_window_secs = parse_u64(
            kv.get("CDC_RATE_LIMIT_WINDOW_SECS"),
            60,
            "CDC_RATE_LIMIT_WINDOW_SECS",
        )?;
        let rate_limit_requests_per_window = parse_u32(
            kv.get("CDC_RATE_LIMIT_REQUESTS_PER_WINDOW"),
            0,
            "CDC_RATE_LIMIT_REQUESTS_PER_WINDOW",
        )?;

        let metrics_require_auth = parse_bool(kv.get("CDC_METRICS_REQUIRE_AUTH")).unwrap_or(false);

        Ok(Self {
            bind_addr,
            db_url,
            source_a_db_url,
            source_b_db_url,
            source_max_connections,
            source_query_timeout_ms,
            binding_timeout_ms,
            binding_cache_max_entries,
            binding_cache_ttl_ms,
            over_fetch_margin,
            max_page_limit,
            auth_mode,
            jwt,
            local_auth_shared_secret,
            rate_limit_window_secs,
            rate_limit_requests_per_window,
            metrics_require_auth,
        })
    }

    pub fn source_query_timeout(&self) -> Duration {
        Duration::from_millis(self.source_query_timeout_ms)
    }

    pub fn binding_timeout(&self) -> Duration {
        Duration::from_millis(self.binding_timeout_ms)
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;
    parse_env_lines(&contents)
}

fn parse_env_lines(contents: &str) -> Result<HashMap<String, String>, StartupError> {
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

        kv.insert(key.to_string(), strip_quotes(value.trim()).to_string());
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2
            && let Some(inner) = s.strip_prefix(quote).and_then(|s| s.strip_suffix(quote))
        {
            return inner;
        }
    }
    s
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_nonempty(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn optional_nonempty(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value.map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v.parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(
    value: Option<&String>,
    default: T,
    key: &'static str,
) -> Result<T, StartupError> {
    match value.map(|v| v.trim()) {
        None => Ok(default),
        Some("") => Ok(default),
        Some(v) => v.parse::<T>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    parse_number(value, default, key)
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    parse_number(value, default, key)
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    parse_number(value, default, key)
}

fn parse_auth_mode(value: Option<&String>) -> Result<AuthMode, StartupError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("local");

    match mode {
        "local" => Ok(AuthMode::Local),
        "jwt" => Ok(AuthMode::Jwt),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "CDC_AUTH_MODE must be local or jwt".to_string(),
        }),
    }
}

fn parse_jwt_config(kv: &HashMap<String, String>) -> Result<JwtConfig, StartupError> {
    let secret = require_nonempty(kv, "CDC_JWT_SECRET")?;

    let tenant_claim =
        optional_nonempty(kv, "CDC_JWT_TENANT_CLAIM").unwrap_or_else(|| "email".to_string());
    let principal_id_claim =
        optional_nonempty(kv, "CDC_JWT_PRINCIPAL_ID_CLAIM").unwrap_or_else(|| "sub".to_string());
    let leeway_secs = parse_u64(kv.get("CDC_JWT_LEEWAY_SECS"), 60, "CDC_JWT_LEEWAY_SECS")?;

    Ok(JwtConfig {
        secret,
        issuer: optional_nonempty(kv, "CDC_JWT_ISSUER"),
        audience: optional_nonempty(kv, "CDC_JWT_AUDIENCE"),
        leeway: Duration::from_secs(leeway_secs),
        principal_id_claim,
        tenant_claim,
    })
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
