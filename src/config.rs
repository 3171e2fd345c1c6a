use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env,
    net::SocketAddr,
};

use crate::ratelimit::LimitProfile;

pub const ANONYMOUS_TIER: &str = "anonymous";
pub const DEFAULT_API_KEY_TIER: &str = "free";

const PRO_LIMITS: LimitProfile = LimitProfile::new(100, 1_000, 10_000);
const ENTERPRISE_LIMITS: LimitProfile = LimitProfile::new(500, 5_000, 50_000);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub log_format: LogFormat,
    pub scanner: ScannerConfig,
    pub max_body_bytes: usize,
    pub admin_token: Option<String>,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub backend: RateLimitBackendConfig,
    pub key_prefix: String,
    pub store_timeout_ms: u64,
    pub burst_allowance: u64,
    pub fail_open_on_error: bool,
    pub exempt_paths: Vec<String>,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone)]
pub enum RateLimitBackendConfig {
    InMemory,
    Redis { url: String, connect_timeout_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub api_key_header: String,
    pub principal_header: Option<String>,
    pub trust_forwarded_for: bool,
    pub tiers: HashMap<String, LimitProfile>,
    pub api_key_tiers: HashMap<String, String>,
    pub route_overrides: Vec<RouteLimitConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLimitConfig {
    pub path_prefix: String,
    pub profile: LimitProfile,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        let scanner = ScannerConfig {
            base_url: env::var("SCANNER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout_ms: parse_env("SCANNER_TIMEOUT_MS", 120_000u64).max(100),
        };

        let admin_token = env::var("ADMIN_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let backend = match env::var("RATE_LIMIT_BACKEND")
            .unwrap_or_else(|_| "redis".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => RateLimitBackendConfig::InMemory,
            "redis" => RateLimitBackendConfig::Redis {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string()),
                connect_timeout_ms: parse_env("REDIS_CONNECT_TIMEOUT_MS", 5_000u64),
            },
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        let mut tiers = HashMap::from([
            (
                ANONYMOUS_TIER.to_string(),
                LimitProfile::new(
                    parse_limit("RATE_LIMIT_PER_MINUTE", 20)?,
                    parse_limit("RATE_LIMIT_PER_HOUR", 100)?,
                    parse_limit("RATE_LIMIT_PER_DAY", 1_000)?,
                ),
            ),
            (
                DEFAULT_API_KEY_TIER.to_string(),
                LimitProfile::new(
                    parse_limit("API_KEY_RATE_LIMIT_PER_MINUTE", 60)?,
                    parse_limit("API_KEY_RATE_LIMIT_PER_HOUR", 500)?,
                    parse_limit("API_KEY_RATE_LIMIT_PER_DAY", 5_000)?,
                ),
            ),
        ]);
        tiers.insert("pro".to_string(), PRO_LIMITS);
        tiers.insert("enterprise".to_string(), ENTERPRISE_LIMITS);

        let api_key_tiers =
            parse_api_key_tiers(&env::var("API_KEY_TIERS").unwrap_or_default(), &tiers)?;
        let route_overrides =
            parse_route_limits(&env::var("RATE_LIMIT_ROUTES").unwrap_or_default())?;

        let resolver = ResolverConfig {
            api_key_header: env::var("API_KEY_HEADER")
                .unwrap_or_else(|_| "x-api-key".to_string())
                .to_ascii_lowercase(),
            principal_header: env::var("PRINCIPAL_HEADER")
                .ok()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty()),
            trust_forwarded_for: parse_env("TRUST_FORWARDED_FOR", true),
            tiers,
            api_key_tiers,
            route_overrides,
        };

        let rate_limit = RateLimitConfig {
            enabled: parse_env("RATE_LIMIT_ENABLED", true),
            backend,
            key_prefix: env::var("REDIS_KEY_PREFIX").unwrap_or_else(|_| "ratelimit".to_string()),
            store_timeout_ms: parse_env("RATE_LIMIT_STORE_TIMEOUT_MS", 250u64).max(1),
            burst_allowance: parse_limit("RATE_LIMIT_BURST", 10)?,
            fail_open_on_error: parse_flag("RATE_LIMIT_FAIL_OPEN", false)?,
            exempt_paths: parse_csv(
                "RATE_LIMIT_EXEMPT_PATHS",
                "/health,/metrics,/docs,/redoc,/openapi.json",
            ),
            resolver,
        };

        Ok(Self {
            bind_addr,
            log_format,
            scanner,
            max_body_bytes: parse_env("MAX_BODY_BYTES", 5 * 1_048_576usize),
            admin_token,
            rate_limit,
        })
    }
}

/// Parses `key=tier` pairs. Every tier must already be defined.
fn parse_api_key_tiers(
    raw: &str,
    tiers: &HashMap<String, LimitProfile>,
) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (key, tier) = chunk
            .split_once('=')
            .map(|(k, t)| (k.trim(), t.trim().to_ascii_lowercase()))
            .filter(|(k, t)| !k.is_empty() && !t.is_empty())
            .ok_or_else(|| anyhow!("invalid API_KEY_TIERS entry: {chunk}"))?;

        if !tiers.contains_key(&tier) {
            bail!("API_KEY_TIERS references unknown tier `{tier}`");
        }
        out.insert(key.to_string(), tier);
    }
    Ok(out)
}

/// Parses `/prefix=minute/hour/day` route overrides.
fn parse_route_limits(raw: &str) -> Result<Vec<RouteLimitConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let mut parts = chunk.splitn(2, '=');
        let path_prefix = parts
            .next()
            .map(str::trim)
            .filter(|s| s.starts_with('/'))
            .ok_or_else(|| anyhow!("invalid route limit entry: {chunk}"))?
            .to_string();

        let limits = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| anyhow!("invalid route limit entry: {chunk}"))?
            .split('/')
            .map(|v| parse_limit_value(v.trim()).with_context(|| format!("route {path_prefix}")))
            .collect::<Result<Vec<_>>>()?;

        let &[per_minute, per_hour, per_day] = limits.as_slice() else {
            bail!("route limit for {path_prefix} needs minute/hour/day values");
        };

        out.push(RouteLimitConfig {
            path_prefix,
            profile: LimitProfile::new(per_minute, per_hour, per_day),
        });
    }
    Ok(out)
}

fn parse_limit(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => parse_limit_value(raw.trim()).with_context(|| format!("invalid {key}")),
        Err(_) => Ok(default),
    }
}

fn parse_limit_value(raw: &str) -> Result<u64> {
    let value = raw
        .parse::<i64>()
        .map_err(|_| anyhow!("limit `{raw}` is not an integer"))?;
    if value < 0 {
        bail!("limit {value} must not be negative");
    }
    Ok(value as u64)
}

/// Strict boolean: a typo in a safety switch must not silently pick a side.
fn parse_flag(key: &str, default: bool) -> Result<bool> {
    let Ok(raw) = env::var(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("invalid {key}: `{other}` is not a boolean")),
    }
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn known_tiers() -> HashMap<String, LimitProfile> {
        HashMap::from([
            ("free".to_string(), LimitProfile::new(60, 500, 5_000)),
            ("pro".to_string(), PRO_LIMITS),
        ])
    }

    #[test]
    fn limit_values_reject_negatives_and_garbage() {
        assert_eq!(parse_limit_value("0").unwrap(), 0);
        assert_eq!(parse_limit_value("42").unwrap(), 42);
        assert!(parse_limit_value("-1").is_err());
        assert!(parse_limit_value("ten").is_err());
    }

    #[test]
    fn parses_route_overrides() {
        let routes = parse_route_limits("/api/v1/scan=5/20/0, /api/v1/report=0/100/1000").unwrap();
        assert_eq!(routes, vec![
            RouteLimitConfig {
                path_prefix: "/api/v1/scan".to_string(),
                profile: LimitProfile::new(5, 20, 0),
            },
            RouteLimitConfig {
                path_prefix: "/api/v1/report".to_string(),
                profile: LimitProfile::new(0, 100, 1_000),
            },
        ]);
        assert!(parse_route_limits("").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_route_overrides() {
        assert!(parse_route_limits("api/v1/scan=5/20/0").is_err());
        assert!(parse_route_limits("/api/v1/scan=5/20").is_err());
        assert!(parse_route_limits("/api/v1/scan=5/-20/0").is_err());
        assert!(parse_route_limits("/api/v1/scan").is_err());
    }

    #[test]
    fn parses_api_key_tiers() {
        let parsed = parse_api_key_tiers("bsc_alpha=PRO, bsc_beta=free", &known_tiers()).unwrap();
        assert_eq!(parsed.get("bsc_alpha").map(String::as_str), Some("pro"));
        assert_eq!(parsed.get("bsc_beta").map(String::as_str), Some("free"));
    }

    #[test]
    fn rejects_unknown_api_key_tiers() {
        assert!(parse_api_key_tiers("bsc_alpha=platinum", &known_tiers()).is_err());
        assert!(parse_api_key_tiers("bsc_alpha", &known_tiers()).is_err());
    }
}
