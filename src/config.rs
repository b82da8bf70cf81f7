use crate::error::{Result, TamperError};
use std::env;
use std::time::Duration;
use url::Url;

/// Environment variables consulted, in order, for the upstream proxy used on every
/// outbound dial.
const EGRESS_PROXY_VARS: &[&str] = &[
    "TAMPER_EGRESS_PROXY",
    "HTTPS_PROXY",
    "https_proxy",
    "HTTP_PROXY",
    "http_proxy",
];

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 8080)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Log every request through the context INFO helper
    pub verbose: bool,
    /// Forward proxy-only headers untouched (skips the sanitizer)
    pub keep_header: bool,
    /// Append origin headers to the client response instead of replacing them
    pub keep_destination_headers: bool,
    /// Transport deadline per request, `None` waits forever
    pub request_timeout: Option<Duration>,
    /// Largest proxied request body buffered before forwarding, in bytes
    pub max_request_body: usize,
    /// Require Basic proxy authentication
    pub auth_enabled: bool,
    /// Authentication username
    pub auth_username: String,
    /// Authentication password
    pub auth_password: String,
    /// Optional upstream proxy for dialing origins
    pub egress_proxy: Option<EgressProxyConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressProxyProtocol {
    Http,
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressProxyConfig {
    pub protocol: EgressProxyProtocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let timeout_secs: u64 = get_env_or("PROXY_REQUEST_TIMEOUT", "0")
            .parse()
            .map_err(|_| {
                TamperError::InvalidConfig(
                    "PROXY_REQUEST_TIMEOUT must be a number of seconds".into(),
                )
            })?;

        let max_request_body: usize = get_env_or("PROXY_MAX_REQUEST_BODY", "16777216")
            .parse()
            .map_err(|_| {
                TamperError::InvalidConfig("PROXY_MAX_REQUEST_BODY must be a number of bytes".into())
            })?;

        Ok(Config {
            proxy: ProxyServerConfig {
                port: get_env_or("PROXY_PORT", "8080").parse().map_err(|_| {
                    TamperError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                verbose: get_env_or("PROXY_VERBOSE", "false").parse().unwrap_or(false),
                keep_header: get_env_or("PROXY_KEEP_HEADER", "false")
                    .parse()
                    .unwrap_or(false),
                keep_destination_headers: get_env_or("PROXY_KEEP_DESTINATION_HEADERS", "false")
                    .parse()
                    .unwrap_or(false),
                request_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
                max_request_body,
                auth_enabled: get_env_or("PROXY_AUTH_ENABLED", "false")
                    .parse()
                    .unwrap_or(false),
                auth_username: get_env_or("PROXY_AUTH_USERNAME", ""),
                auth_password: get_env_or("PROXY_AUTH_PASSWORD", ""),
                egress_proxy: parse_egress_proxy()?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

fn parse_egress_proxy() -> Result<Option<EgressProxyConfig>> {
    let Some((var, raw)) = EGRESS_PROXY_VARS.iter().find_map(|&var| {
        env::var(var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| (var, v))
    }) else {
        return Ok(None);
    };

    let url = Url::parse(&raw).map_err(|e| {
        TamperError::InvalidConfig(format!("{} must be a valid URL: {}", var, e))
    })?;

    // Reject URLs that carry request-specific components.
    if url.fragment().is_some() || url.query().is_some() {
        return Err(TamperError::InvalidConfig(format!(
            "{} must not include query/fragment",
            var
        )));
    }
    if !(url.path().is_empty() || url.path() == "/") {
        return Err(TamperError::InvalidConfig(format!(
            "{} must not include a path",
            var
        )));
    }

    let protocol = match url.scheme().to_lowercase().as_str() {
        "http" | "https" => EgressProxyProtocol::Http,
        "socks5" | "socks5h" => EgressProxyProtocol::Socks5,
        other => {
            return Err(TamperError::InvalidConfig(format!(
                "{} has unsupported scheme: {}",
                var, other
            )))
        }
    };

    let host = url
        .host_str()
        .ok_or_else(|| TamperError::InvalidConfig(format!("{} must include a host", var)))?;

    let port = match url.port() {
        Some(p) => p,
        None => match protocol {
            EgressProxyProtocol::Http => 80,
            EgressProxyProtocol::Socks5 => 1080,
        },
    };

    let username = if url.username().is_empty() {
        None
    } else {
        Some(url.username().to_string())
    };

    let password = match (protocol, &username, url.password()) {
        (_, None, _) => None,
        (EgressProxyProtocol::Http, Some(_), None) => Some(String::new()),
        (EgressProxyProtocol::Http, Some(_), Some(p)) => Some(p.to_string()),
        (EgressProxyProtocol::Socks5, Some(_), Some(p)) if !p.is_empty() => Some(p.to_string()),
        (EgressProxyProtocol::Socks5, Some(_), _) => {
            return Err(TamperError::InvalidConfig(format!(
                "{} socks5 auth requires a non-empty password",
                var
            )))
        }
    };

    Ok(Some(EgressProxyConfig {
        protocol,
        host: host.to_string(),
        port,
        username,
        password,
    }))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
