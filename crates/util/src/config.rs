use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use super::{server_bind_address, DEFAULT_DATABASE_URL};

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Tunables for the audit fallback path, the transfer monitor and the health thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResilienceConfig {
    pub fallback_warning_threshold: usize,
    pub fallback_critical_threshold: usize,
    pub fallback_max_retries: u32,
    pub fallback_interval: Duration,
    pub audit_write_timeout: Duration,
    pub transfer_sla: Duration,
    pub transfer_monitor_interval: Duration,
    pub transfer_query_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            fallback_warning_threshold: 100,
            fallback_critical_threshold: 500,
            fallback_max_retries: 5,
            fallback_interval: Duration::from_secs(30),
            audit_write_timeout: Duration::from_millis(2_000),
            transfer_sla: Duration::from_secs(24 * 60 * 60),
            transfer_monitor_interval: Duration::from_secs(300),
            transfer_query_timeout: Duration::from_millis(5_000),
        }
    }
}

impl ResilienceConfig {
    /// Reads every override from the environment, keeping defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            fallback_warning_threshold: env_parse(
                "AUDIT_FALLBACK_WARNING_THRESHOLD",
                defaults.fallback_warning_threshold,
            )?,
            fallback_critical_threshold: env_parse(
                "AUDIT_FALLBACK_CRITICAL_THRESHOLD",
                defaults.fallback_critical_threshold,
            )?,
            fallback_max_retries: env_parse(
                "AUDIT_FALLBACK_MAX_RETRIES",
                defaults.fallback_max_retries,
            )?,
            fallback_interval: Duration::from_secs(env_parse(
                "AUDIT_FALLBACK_INTERVAL_SECS",
                defaults.fallback_interval.as_secs(),
            )?),
            audit_write_timeout: Duration::from_millis(env_parse(
                "AUDIT_WRITE_TIMEOUT_MS",
                defaults.audit_write_timeout.as_millis() as u64,
            )?),
            transfer_sla: env_hours("TRANSFER_SLA_HOURS", defaults.transfer_sla)?,
            transfer_monitor_interval: Duration::from_secs(env_parse(
                "TRANSFER_MONITOR_INTERVAL_SECS",
                defaults.transfer_monitor_interval.as_secs(),
            )?),
            transfer_query_timeout: Duration::from_millis(env_parse(
                "TRANSFER_QUERY_TIMEOUT_MS",
                defaults.transfer_query_timeout.as_millis() as u64,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fallback_warning_threshold >= self.fallback_critical_threshold {
            return Err(ConfigError::ThresholdOrder {
                warning: self.fallback_warning_threshold,
                critical: self.fallback_critical_threshold,
            });
        }
        if self.fallback_max_retries == 0 {
            return Err(ConfigError::ZeroValue("AUDIT_FALLBACK_MAX_RETRIES"));
        }
        let non_zero = [
            ("AUDIT_FALLBACK_INTERVAL_SECS", self.fallback_interval),
            ("AUDIT_WRITE_TIMEOUT_MS", self.audit_write_timeout),
            ("TRANSFER_SLA_HOURS", self.transfer_sla),
            ("TRANSFER_MONITOR_INTERVAL_SECS", self.transfer_monitor_interval),
            ("TRANSFER_QUERY_TIMEOUT_MS", self.transfer_query_timeout),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::ZeroValue(name));
            }
        }
        Ok(())
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub resilience: ResilienceConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let resilience = ResilienceConfig::from_env()?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            resilience,
        })
    }
}

fn env_parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            name,
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn env_hours(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let hours: u64 = env_parse(name, default.as_secs() / 3600)?;
    hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidNumber {
            name,
            value: hours.to_string(),
        })
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber { name: &'static str, value: String },
    ZeroValue(&'static str),
    ThresholdOrder { warning: usize, critical: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a non-negative integer (got {value})")
            }
            Self::ZeroValue(name) => write!(f, "{name} must be greater than zero"),
            Self::ThresholdOrder { warning, critical } => write!(
                f,
                "AUDIT_FALLBACK_WARNING_THRESHOLD ({warning}) must be below AUDIT_FALLBACK_CRITICAL_THRESHOLD ({critical})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
