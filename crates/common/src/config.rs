use serde::{Deserialize, Serialize};

/// Global application configuration loaded from environment variables.
///
/// Built once at process start and passed into every component that needs it.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// HTTP port for the API server (default: 3000)
    pub api_port: u16,

    /// Queue backend used for the asynchronous dispatch path
    pub queue_backend: QueueBackend,

    /// Upper bound on the queue health check in milliseconds (default: 500)
    pub queue_health_timeout_ms: u64,

    /// Number of worker loops per worker process (default: 4)
    pub worker_concurrency: usize,

    /// Sleep between polls when the ready queue is empty (default: 1000)
    pub worker_poll_interval_ms: u64,

    /// TTL of the worker heartbeat key in seconds (default: 30)
    pub worker_heartbeat_ttl_secs: u64,

    /// Retry behaviour for failed deliveries
    pub retry: RetrySettings,

    /// Outgoing mail server
    pub smtp: SmtpConfig,

    /// Sender address; when absent every send attempt fails with a configuration error
    pub email_from: Option<String>,

    /// Branding and support details injected into every template
    pub brand: BrandConfig,
}

/// Which scheduler backs the asynchronous path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Jobs go to Redis and are executed by `mailroom-worker` processes.
    Redis,
    /// Jobs run on the API process's own tokio runtime.
    Inline,
}

impl std::str::FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(QueueBackend::Redis),
            "inline" => Ok(QueueBackend::Inline),
            other => Err(format!("unknown queue backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub backoff_multiplier: u32,
}

/// TLS mode for the SMTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    None,
    Starttls,
    Tls,
}

impl std::str::FromStr for SmtpTls {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(SmtpTls::None),
            "starttls" => Ok(SmtpTls::Starttls),
            "tls" => Ok(SmtpTls::Tls),
            other => Err(format!("unknown SMTP TLS mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: SmtpTls,
}

/// Brand, support and legal details rendered into email templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandConfig {
    pub brand_name: String,
    pub brand_logo: String,
    pub site_url: String,
    pub support_email: String,
    pub support_phone_number: String,
    pub terms_of_service: String,
    pub facebook_link: Option<String>,
    pub instagram_link: Option<String>,
    pub twitter_link: Option<String>,
    pub linkedin_link: Option<String>,
    pub tiktok_link: Option<String>,
}

impl BrandConfig {
    pub fn has_social_links(&self) -> bool {
        [
            &self.facebook_link,
            &self.instagram_link,
            &self.twitter_link,
            &self.linkedin_link,
            &self.tiktok_link,
        ]
        .iter()
        .any(|link| link.is_some())
    }
}

impl Default for BrandConfig {
    fn default() -> Self {
        Self {
            brand_name: "Mailroom".to_string(),
            brand_logo: String::new(),
            site_url: "https://example.com".to_string(),
            support_email: "support@example.com".to_string(),
            support_phone_number: String::new(),
            terms_of_service: "https://example.com/terms".to_string(),
            facebook_link: None,
            instagram_link: None,
            twitter_link: None,
            linkedin_link: None,
            tiktok_link: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let brand_defaults = BrandConfig::default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            api_port: parse_var("API_PORT", "3000")?,
            queue_backend: std::env::var("QUEUE_BACKEND")
                .unwrap_or_else(|_| "redis".to_string())
                .parse()
                .map_err(|e: String| anyhow::anyhow!("QUEUE_BACKEND: {}", e))?,
            queue_health_timeout_ms: parse_var("QUEUE_HEALTH_TIMEOUT_MS", "500")?,
            worker_concurrency: parse_var("WORKER_CONCURRENCY", "4")?,
            worker_poll_interval_ms: parse_var("WORKER_POLL_INTERVAL_MS", "1000")?,
            worker_heartbeat_ttl_secs: parse_var("WORKER_HEARTBEAT_TTL_SECS", "30")?,
            retry: RetrySettings {
                max_retries: parse_var("EMAIL_MAX_RETRIES", "3")?,
                base_delay_secs: parse_var("EMAIL_RETRY_BASE_DELAY_SECS", "60")?,
                backoff_multiplier: parse_var("EMAIL_RETRY_BACKOFF_MULTIPLIER", "2")?,
            },
            smtp: SmtpConfig {
                host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: parse_var("SMTP_PORT", "587")?,
                username: std::env::var("SMTP_USERNAME").ok(),
                password: std::env::var("SMTP_PASSWORD").ok(),
                tls: std::env::var("SMTP_TLS")
                    .unwrap_or_else(|_| "starttls".to_string())
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!("SMTP_TLS: {}", e))?,
            },
            email_from: std::env::var("EMAIL_FROM").ok(),
            brand: BrandConfig {
                brand_name: std::env::var("BRAND_NAME").unwrap_or(brand_defaults.brand_name),
                brand_logo: std::env::var("BRAND_LOGO").unwrap_or(brand_defaults.brand_logo),
                site_url: std::env::var("SITE_URL").unwrap_or(brand_defaults.site_url),
                support_email: std::env::var("SUPPORT_EMAIL")
                    .unwrap_or(brand_defaults.support_email),
                support_phone_number: std::env::var("SUPPORT_PHONE_NUMBER")
                    .unwrap_or(brand_defaults.support_phone_number),
                terms_of_service: std::env::var("TERMS_OF_SERVICE")
                    .unwrap_or(brand_defaults.terms_of_service),
                facebook_link: std::env::var("SOCIAL_FACEBOOK").ok(),
                instagram_link: std::env::var("SOCIAL_INSTAGRAM").ok(),
                twitter_link: std::env::var("SOCIAL_TWITTER").ok(),
                linkedin_link: std::env::var("SOCIAL_LINKEDIN").ok(),
                tiktok_link: std::env::var("SOCIAL_TIKTOK").ok(),
            },
        })
    }
}

impl AppConfig {
    /// Built-in defaults for a local setup, ignoring the environment.
    pub fn local() -> Self {
        Self {
            database_url: "postgres://localhost/mailroom".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            db_max_connections: 20,
            api_port: 3000,
            queue_backend: QueueBackend::Redis,
            queue_health_timeout_ms: 500,
            worker_concurrency: 4,
            worker_poll_interval_ms: 1000,
            worker_heartbeat_ttl_secs: 30,
            retry: RetrySettings {
                max_retries: 3,
                base_delay_secs: 60,
                backoff_multiplier: 2,
            },
            smtp: SmtpConfig {
                host: "localhost".to_string(),
                port: 587,
                username: None,
                password: None,
                tls: SmtpTls::Starttls,
            },
            email_from: None,
            brand: BrandConfig::default(),
        }
    }
}

/// Read an environment variable, falling back to `default`, and parse it.
fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_backend_parse() {
        assert_eq!("redis".parse::<QueueBackend>().unwrap(), QueueBackend::Redis);
        assert_eq!("INLINE".parse::<QueueBackend>().unwrap(), QueueBackend::Inline);
        assert!("kafka".parse::<QueueBackend>().is_err());
    }

    #[test]
    fn test_smtp_tls_parse() {
        assert_eq!("none".parse::<SmtpTls>().unwrap(), SmtpTls::None);
        assert_eq!("StartTLS".parse::<SmtpTls>().unwrap(), SmtpTls::Starttls);
        assert_eq!("tls".parse::<SmtpTls>().unwrap(), SmtpTls::Tls);
        assert!("ssl3".parse::<SmtpTls>().is_err());
    }

    #[test]
    fn test_social_links_detection() {
        let mut brand = BrandConfig::default();
        assert!(!brand.has_social_links());
        brand.linkedin_link = Some("https://linkedin.com/company/mailroom".to_string());
        assert!(brand.has_social_links());
    }
}
