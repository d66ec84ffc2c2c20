use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub jwt_secret: String,
    /// Identities that resolve to at least `admin`.
    pub admin_emails: Vec<String>,
    /// CORS origins; `*` allows any.
    pub allowed_origins: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub payment: PaymentConfig,
    pub sms: SmsConfig,
    pub document_storage_dir: PathBuf,
    pub permission_cache_ttl: Duration,
    pub dashboard_poll_interval: Duration,
    pub dashboard_page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst_size: u32,
    /// Peers whose X-Forwarded-For / X-Real-IP headers are believed.
    pub trusted_proxies: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100,
            burst_size: 50,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub webhook_secret: Option<String>,
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsConfig {
    pub api_key: Option<String>,
    pub sender: String,
    pub api_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVar(String),
    #[error("invalid listen address: {0}")]
    InvalidAddr(#[from] std::net::AddrParseError),
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str| get(key).ok_or_else(|| ConfigError::MissingVar(key.to_string()));

        let listen_addr = get("LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()?;

        let database_url = require("DATABASE_URL")?;
        let jwt_secret = require("JWT_SECRET")?;

        let admin_emails = get("ADMIN_EMAILS")
            .map(|v| split_list(&v).map(|e| e.to_lowercase()).collect())
            .unwrap_or_default();
        let allowed_origins = get("ALLOWED_ORIGINS")
            .map(|v| split_list(&v).collect())
            .unwrap_or_else(|| vec!["http://localhost:3000".to_string()]);

        let rate_limit = RateLimitConfig {
            enabled: parse_or("RATE_LIMIT_ENABLED", get("RATE_LIMIT_ENABLED"), true, parse_bool)?,
            requests_per_second: parse_or("RATE_LIMIT_RPS", get("RATE_LIMIT_RPS"), 100, |v| {
                v.parse().ok()
            })?,
            burst_size: parse_or("RATE_LIMIT_BURST", get("RATE_LIMIT_BURST"), 50, |v| {
                v.parse().ok()
            })?,
            trusted_proxies: get("TRUSTED_PROXIES")
                .map(|v| split_list(&v).collect())
                .unwrap_or_default(),
        };

        let payment = PaymentConfig {
            api_key: get("PAYMENT_API_KEY"),
            api_url: get("PAYMENT_API_URL")
                .unwrap_or_else(|| "https://api.xendit.co/v2/invoices".to_string()),
            webhook_secret: get("PAYMENT_WEBHOOK_SECRET"),
            public_base_url: get("PUBLIC_BASE_URL").map(|v| v.trim_end_matches('/').to_string()),
        };

        let sms = SmsConfig {
            api_key: get("SMS_API_KEY"),
            sender: get("SMS_SENDER").unwrap_or_else(|| "DIPOLOG".to_string()),
            api_url: get("SMS_API_URL")
                .unwrap_or_else(|| "https://semaphore.co/api/v4/messages".to_string()),
        };

        let document_storage_dir = get("DOCUMENT_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/documents"));

        let permission_cache_ttl = Duration::from_secs(parse_or(
            "PERMISSION_CACHE_TTL_SECS",
            get("PERMISSION_CACHE_TTL_SECS"),
            300,
            parse_positive,
        )?);
        let dashboard_poll_interval = Duration::from_secs(parse_or(
            "DASHBOARD_POLL_SECS",
            get("DASHBOARD_POLL_SECS"),
            30,
            parse_positive,
        )?);
        let dashboard_page_size = parse_or(
            "DASHBOARD_PAGE_SIZE",
            get("DASHBOARD_PAGE_SIZE"),
            permit_core::model::DEFAULT_PAGE_SIZE,
            |v| {
                v.parse::<u32>()
                    .ok()
                    .filter(|n| (1..=permit_core::model::MAX_PAGE_SIZE).contains(n))
            },
        )?;

        Ok(Self {
            listen_addr,
            database_url,
            jwt_secret,
            admin_emails,
            allowed_origins,
            rate_limit,
            payment,
            sms,
            document_storage_dir,
            permission_cache_ttl,
            dashboard_poll_interval,
            dashboard_page_size,
        })
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_or<T>(
    var: &'static str,
    raw: Option<String>,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => parse(&value).ok_or(ConfigError::InvalidValue { var, value }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive(raw: &str) -> Option<u64> {
    raw.parse::<u64>().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/permits"),
        ("JWT_SECRET", "secret"),
    ];

    #[test]
    fn defaults_apply() {
        let config = load(&REQUIRED).expect("config");
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.allowed_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(config.sms.sender, "DIPOLOG");
        assert_eq!(config.payment.api_url, "https://api.xendit.co/v2/invoices");
        assert!(config.payment.api_key.is_none());
        assert_eq!(config.permission_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.dashboard_poll_interval, Duration::from_secs(30));
        assert_eq!(config.dashboard_page_size, 10);
        assert!(config.admin_emails.is_empty());
    }

    #[test]
    fn required_variables_are_reported() {
        let err = load(&[("JWT_SECRET", "secret")]).expect_err("missing db");
        assert!(matches!(err, ConfigError::MissingVar(ref v) if v == "DATABASE_URL"));

        let err = load(&[("DATABASE_URL", "postgres://x"), ("JWT_SECRET", "  ")])
            .expect_err("blank secret");
        assert!(matches!(err, ConfigError::MissingVar(ref v) if v == "JWT_SECRET"));
    }

    #[test]
    fn lists_and_overrides_are_parsed() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("ADMIN_EMAILS", " Clerk@City.gov, ,boss@city.gov"),
            ("ALLOWED_ORIGINS", "https://permits.city.gov,https://admin.city.gov"),
            ("RATE_LIMIT_ENABLED", "off"),
            ("TRUSTED_PROXIES", "10.0.0.1"),
            ("PUBLIC_BASE_URL", "https://permits.city.gov/"),
            ("DASHBOARD_PAGE_SIZE", "25"),
        ]);
        let config = load(&vars).expect("config");
        assert_eq!(config.admin_emails, vec!["clerk@city.gov", "boss@city.gov"]);
        assert_eq!(config.allowed_origins.len(), 2);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.rate_limit.trusted_proxies, vec!["10.0.0.1"]);
        assert_eq!(
            config.payment.public_base_url.as_deref(),
            Some("https://permits.city.gov")
        );
        assert_eq!(config.dashboard_page_size, 25);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("DASHBOARD_POLL_SECS", "0"));
        assert!(matches!(
            load(&vars),
            Err(ConfigError::InvalidValue {
                var: "DASHBOARD_POLL_SECS",
                ..
            })
        ));

        let mut vars = REQUIRED.to_vec();
        vars.push(("LISTEN_ADDR", "not-an-addr"));
        assert!(matches!(load(&vars), Err(ConfigError::InvalidAddr(_))));
    }
}
