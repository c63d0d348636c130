use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use porta_auth::{MAX_STREAM_TOKEN_TTL, OidcConfig};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub dispatch_url: String,
    pub directory_url: String,
    pub dispatch_connect_timeout_ms: u64,
    pub dispatch_request_timeout_ms: u64,
    pub directory_timeout_ms: u64,
    pub stream_token_secret: String,
    pub stream_token_ttl_secs: u64,
    pub stream_keepalive_secs: u64,
    pub stream_channel_capacity: usize,
    pub rate_limit_window_secs: u64,
    pub rate_limit_tokens_per_window: u32,
    pub metrics_require_auth: bool,
    pub auth_mode: AuthMode,
    pub local_auth_shared_secret: Option<String>,
    pub oidc: Option<OidcConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Local,
    Oidc,
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

        if let Ok(config_path) = std::env::var("PORTA_CONFIG_PATH") {
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
            kv.get("PORTA_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "PORTA_BIND_ADDR",
        )?;

        let auth_mode = parse_auth_mode(kv.get("PORTA_AUTH_MODE"))?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("PORTA_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        if !bind_addr.ip().is_loopback() && auth_mode != AuthMode::Oidc {
            if dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()) {
                // Explicit dev-only escape hatch for docker compose / local containers.
            } else {
                return Err(StartupError {
                    code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                    message: "non-local bind requires production auth mode; refuse startup"
                        .to_string(),
                });
            }
        }

        let dispatch_url = require_nonempty(kv, "PORTA_DISPATCH_URL")?;
        let directory_url = require_nonempty(kv, "PORTA_DIRECTORY_URL")?;

        let dispatch_connect_timeout_ms = parse_u64(
            kv.get("PORTA_DISPATCH_CONNECT_TIMEOUT_MS"),
            2000,
            "PORTA_DISPATCH_CONNECT_TIMEOUT_MS",
        )?;
        let dispatch_request_timeout_ms = parse_u64(
            kv.get("PORTA_DISPATCH_REQUEST_TIMEOUT_MS"),
            5000,
            "PORTA_DISPATCH_REQUEST_TIMEOUT_MS",
        )?;
        let directory_timeout_ms = parse_u64(
            kv.get("PORTA_DIRECTORY_TIMEOUT_MS"),
            2000,
            "PORTA_DIRECTORY_TIMEOUT_MS",
        )?;

        let stream_token_secret = require_nonempty(kv, "PORTA_STREAM_TOKEN_SECRET")?;

        let stream_token_ttl_secs = parse_u64(
            kv.get("PORTA_STREAM_TOKEN_TTL_SECS"),
            MAX_STREAM_TOKEN_TTL.as_secs(),
            "PORTA_STREAM_TOKEN_TTL_SECS",
        )?;
        if stream_token_ttl_secs == 0 || stream_token_ttl_secs > MAX_STREAM_TOKEN_TTL.as_secs() {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!(
                    "PORTA_STREAM_TOKEN_TTL_SECS must be between 1 and {}",
                    MAX_STREAM_TOKEN_TTL.as_secs()
                ),
            });
        }

        let stream_keepalive_secs = parse_u64(
            kv.get("PORTA_STREAM_KEEPALIVE_SECS"),
            30,
            "PORTA_STREAM_KEEPALIVE_SECS",
        )?;
        if stream_keepalive_secs == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "PORTA_STREAM_KEEPALIVE_SECS must be >= 1".to_string(),
            });
        }

        let stream_channel_capacity = parse_usize(
            kv.get("PORTA_STREAM_CHANNEL_CAPACITY"),
            32,
            "PORTA_STREAM_CHANNEL_CAPACITY",
        )?;
        if !(1..=1024).contains(&stream_channel_capacity) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "PORTA_STREAM_CHANNEL_CAPACITY must be between 1 and 1024".to_string(),
            });
        }

        let rate_limit_window_secs = parse_u64(
            kv.get("PORTA_RATE_LIMIT_WINDOW_SECS"),
            60,
            "PORTA_RATE_LIMIT_WINDOW_SECS",
        )?;
        let rate_limit_tokens_per_window = parse_u32(
            kv.get("PORTA_RATE_LIMIT_TOKENS_PER_WINDOW"),
            30,
            "PORTA_RATE_LIMIT_TOKENS_PER_WINDOW",
        )?;

        let metrics_require_auth =
            parse_bool(kv.get("PORTA_METRICS_REQUIRE_AUTH")).unwrap_or(false);

        let local_auth_shared_secret = kv
            .get("PORTA_LOCAL_AUTH_SECRET")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let oidc = if auth_mode == AuthMode::Oidc {
            Some(parse_oidc_config(kv)?)
        } else {
            None
        };

        Ok(Self {
            bind_addr,
            dispatch_url,
            directory_url,
            dispatch_connect_timeout_ms,
            dispatch_request_timeout_ms,
            directory_timeout_ms,
            stream_token_secret,
            stream_token_ttl_secs,
            stream_keepalive_secs,
            stream_channel_capacity,
            rate_limit_window_secs,
            rate_limit_tokens_per_window,
            metrics_require_auth,
            auth_mode,
            local_auth_shared_secret,
            oidc,
        })
    }

    pub fn stream_keepalive(&self) -> Duration {
        Duration::from_secs(self.stream_keepalive_secs)
    }

    pub fn stream_token_ttl(&self) -> Duration {
        Duration::from_secs(self.stream_token_ttl_secs)
    }
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

        let mut value = value.trim().to_string();
        value = strip_quotes(&value);
        kv.insert(key.to_string(), value);
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    let Some(value) = kv.get(key) else {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    };

    let value = value.trim();
    if value.is_empty() {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    }

    Ok(value.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse::<SocketAddr>().map_err(|_| StartupError {
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
        Some(v) => v.parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_auth_mode(value: Option<&String>) -> Result<AuthMode, StartupError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("local");

    match mode {
        "local" => Ok(AuthMode::Local),
        "oidc" => Ok(AuthMode::Oidc),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "PORTA_AUTH_MODE must be local or oidc".to_string(),
        }),
    }
}

fn parse_oidc_config(kv: &HashMap<String, String>) -> Result<OidcConfig, StartupError> {
    let issuer = require_nonempty(kv, "PORTA_OIDC_ISSUER")?;

    let jwks_json = kv
        .get("PORTA_OIDC_JWKS_JSON")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let jwks_url = kv
        .get("PORTA_OIDC_JWKS_URL")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    if jwks_json.is_none() && jwks_url.is_none() {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "oidc requires PORTA_OIDC_JWKS_URL or PORTA_OIDC_JWKS_JSON".to_string(),
        });
    }

    let audience = kv
        .get("PORTA_OIDC_AUDIENCE")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let subject_claim = kv
        .get("PORTA_OIDC_SUBJECT_CLAIM")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("sub")
        .to_string();

    let roles_claim = kv
        .get("PORTA_OIDC_ROLES_CLAIM")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let department_claim = kv
        .get("PORTA_OIDC_DEPARTMENT_CLAIM")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let jwks_timeout_ms = parse_u64(
        kv.get("PORTA_OIDC_JWKS_TIMEOUT_MS"),
        2000,
        "PORTA_OIDC_JWKS_TIMEOUT_MS",
    )?;
    let jwks_refresh_ttl_secs = parse_u64(
        kv.get("PORTA_OIDC_JWKS_REFRESH_TTL_SECS"),
        300,
        "PORTA_OIDC_JWKS_REFRESH_TTL_SECS",
    )?;
    let clock_skew_secs = parse_u64(
        kv.get("PORTA_OIDC_CLOCK_SKEW_SECS"),
        60,
        "PORTA_OIDC_CLOCK_SKEW_SECS",
    )?;

    Ok(OidcConfig {
        issuer,
        audience,
        jwks_url,
        jwks_json,
        jwks_timeout: Duration::from_millis(jwks_timeout_ms),
        jwks_refresh_ttl: Duration::from_secs(jwks_refresh_ttl_secs),
        clock_skew: Duration::from_secs(clock_skew_secs),
        subject_claim,
        roles_claim,
        department_claim,
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

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}
