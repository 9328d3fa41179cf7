use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use taskline_policy::{Grant, parse_grants};
use taskline_routines::{DEFAULT_BUSINESS_SQLSTATE, PgBackendOptions, PgPoolSettings};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub db_url: String,
    pub db_max_connections: u32,
    pub db_connect_timeout_ms: u64,
    pub routine_timeout_ms: u64,
    pub business_error_sqlstate: String,
    pub run_migrations: bool,
    pub local_principal_id: String,
    pub local_account_id: i64,
    pub local_user_id: i64,
    pub local_grants: Vec<Grant>,
    pub local_auth_shared_secret: Option<String>,
    pub metrics_require_auth: bool,
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

        if let Ok(config_path) = std::env::var("TASKLINE_CONFIG_PATH") {
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
            kv.get("TASKLINE_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "TASKLINE_BIND_ADDR",
        )?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("TASKLINE_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        // Local credentials are a fixed stand-in; refuse to expose them.
        if !bind_addr.ip().is_loopback()
            && !(dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()))
        {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                message: "non-local bind requires a real credential source; refuse startup"
                    .to_string(),
            });
        }

        let db_url = require_nonempty(kv, "TASKLINE_DB_URL")?;

        let db_max_connections = parse_u32(
            kv.get("TASKLINE_DB_MAX_CONNECTIONS"),
            8,
            "TASKLINE_DB_MAX_CONNECTIONS",
        )?;
        if db_max_connections == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TASKLINE_DB_MAX_CONNECTIONS must be >= 1".to_string(),
            });
        }

        let db_connect_timeout_ms = parse_u64(
            kv.get("TASKLINE_DB_CONNECT_TIMEOUT_MS"),
            2000,
            "TASKLINE_DB_CONNECT_TIMEOUT_MS",
        )?;

        let routine_timeout_ms = parse_u64(
            kv.get("TASKLINE_ROUTINE_TIMEOUT_MS"),
            5000,
            "TASKLINE_ROUTINE_TIMEOUT_MS",
        )?;
        if routine_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TASKLINE_ROUTINE_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let business_error_sqlstate = kv
            .get("TASKLINE_BUSINESS_ERROR_SQLSTATE")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BUSINESS_SQLSTATE)
            .to_string();
        if !is_sqlstate(&business_error_sqlstate) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TASKLINE_BUSINESS_ERROR_SQLSTATE must be 5 characters of [0-9A-Z]"
                    .to_string(),
            });
        }

        let run_migrations = match kv.get("TASKLINE_RUN_MIGRATIONS") {
            None => true,
            Some(raw) if raw.trim().is_empty() => true,
            Some(raw) => parse_bool(Some(raw)).ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TASKLINE_RUN_MIGRATIONS must be true or false".to_string(),
            })?,
        };

        let local_principal_id = kv
            .get("TASKLINE_LOCAL_PRINCIPAL_ID")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("local")
            .to_string();

        let local_account_id = parse_positive_i64(
            kv.get("TASKLINE_LOCAL_ACCOUNT_ID"),
            1,
            "TASKLINE_LOCAL_ACCOUNT_ID",
        )?;
        let local_user_id =
            parse_positive_i64(kv.get("TASKLINE_LOCAL_USER_ID"), 1, "TASKLINE_LOCAL_USER_ID")?;

        let local_grants = parse_grants(
            kv.get("TASKLINE_LOCAL_GRANTS")
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .unwrap_or("*:*"),
        )
        .map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("TASKLINE_LOCAL_GRANTS: {}", err),
        })?;

        let local_auth_shared_secret = kv
            .get("TASKLINE_LOCAL_AUTH_SHARED_SECRET")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let metrics_require_auth =
            parse_bool(kv.get("TASKLINE_METRICS_REQUIRE_AUTH")).unwrap_or(false);

        Ok(Self {
            bind_addr,
            db_url,
            db_max_connections,
            db_connect_timeout_ms,
            routine_timeout_ms,
            business_error_sqlstate,
            run_migrations,
            local_principal_id,
            local_account_id,
            local_user_id,
            local_grants,
            local_auth_shared_secret,
            metrics_require_auth,
        })
    }

    pub fn pool_settings(&self) -> PgPoolSettings {
        PgPoolSettings {
            max_connections: self.db_max_connections,
            connect_timeout: Duration::from_millis(self.db_connect_timeout_ms),
        }
    }

    pub fn backend_options(&self) -> PgBackendOptions {
        PgBackendOptions {
            call_timeout: Duration::from_millis(self.routine_timeout_ms),
            business_sqlstate: self.business_error_sqlstate.clone(),
        }
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

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    for quote in ['"', '\''] {
        if s.len() >= 2
            && let Some(inner) = s.strip_prefix(quote).and_then(|s| s.strip_suffix(quote))
        {
            return inner.to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    kv.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
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

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_positive_i64(
    value: Option<&String>,
    default: i64,
    key: &'static str,
) -> Result<i64, StartupError> {
    let parsed = match value {
        None => return Ok(default),
        Some(v) if v.trim().is_empty() => return Ok(default),
        Some(v) => v.trim().parse::<i64>().ok(),
    };
    parsed.filter(|v| *v > 0).ok_or_else(|| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!("{} must be a positive integer", key),
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

fn is_sqlstate(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 5
        && bytes
            .iter()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}
