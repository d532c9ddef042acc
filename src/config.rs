//! Configuration types, loaded from `AGENT_*` environment variables.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::retry::{BackoffPolicy, DEFAULT_JITTER_FACTOR, Retryer};

/// Prefix of the variables exposed to checks through `required_vars`.
const CHECK_VAR_PREFIX: &str = "AGENT_CHECKVAR_";

/// Variable store consulted to resolve a check's required variables.
pub type CheckVars = HashMap<String, String>;

/// Agent runtime settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum number of checks running at the same time.
    pub concurrent_jobs: usize,
    /// Timeout applied to checks that do not define their own.
    pub default_timeout: Duration,
    /// The agent stops reading after this long without queue activity.
    pub max_no_msgs_interval: Duration,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Optional file that receives the logs instead of stderr.
    pub log_file: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            concurrent_jobs: 10,
            default_timeout: Duration::from_secs(600),
            max_no_msgs_interval: Duration::from_secs(180),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Status/callback API settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
    /// Interface whose IPv4 address containers use to reach the agent.
    pub iface: String,
    /// Grace period for in-flight requests when the listener shuts down.
    pub shutdown_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            iface: "docker0".to_string(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Private registry settings. Images are pulled only when `server` is set.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub server: Option<String>,
    pub user: String,
    pub pass: SecretString,
    pub backoff_interval: Duration,
    pub backoff_max_retries: u32,
    pub backoff_jitter_factor: f64,
}

impl RegistryConfig {
    /// Retryer used for image pulls.
    pub fn pull_retryer(&self) -> Retryer {
        let policy = BackoffPolicy::exponential(self.backoff_interval, self.backoff_max_retries)
            .with_jitter(self.backoff_jitter_factor);
        Retryer::with_policy(policy, self.backoff_max_retries)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            server: None,
            user: String::new(),
            pass: SecretString::from(String::new()),
            backoff_interval: Duration::from_secs(5),
            backoff_max_retries: 5,
            backoff_jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Retry settings for calls to remote services.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub retries: u32,
    pub interval: Duration,
}

impl RetryConfig {
    pub fn retryer(&self) -> Retryer {
        Retryer::new(self.retries, self.interval)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            interval: Duration::from_secs(2),
        }
    }
}

/// Endpoints receiving check state updates and raw results.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub state_endpoint: String,
    pub results_endpoint: String,
    pub timeout: Duration,
}

/// Full agent settings.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub agent: AgentConfig,
    pub api: ApiConfig,
    pub registry: RegistryConfig,
    pub retry: RetryConfig,
    pub report: ReportConfig,
    /// Aborted checks endpoint. Abort gating is disabled when unset.
    pub aborted_checks_url: Option<String>,
    pub check_vars: CheckVars,
}

impl AgentSettings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_lookup(&vars)
    }

    /// Load settings from an arbitrary variable map.
    pub fn from_lookup(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let agent_defaults = AgentConfig::default();
        let concurrent_jobs = parse_or(vars, "AGENT_CONCURRENT_JOBS", agent_defaults.concurrent_jobs)?;
        if concurrent_jobs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_CONCURRENT_JOBS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        let agent = AgentConfig {
            concurrent_jobs,
            default_timeout: secs_or(vars, "AGENT_TIMEOUT_SECS", agent_defaults.default_timeout)?,
            max_no_msgs_interval: secs_or(
                vars,
                "AGENT_MAX_NO_MSGS_INTERVAL_SECS",
                agent_defaults.max_no_msgs_interval,
            )?,
            log_level: get("AGENT_LOG_LEVEL")
                .map(str::to_string)
                .unwrap_or(agent_defaults.log_level),
            log_file: get("AGENT_LOG_FILE").map(str::to_string),
        };

        let api_defaults = ApiConfig::default();
        let api = ApiConfig {
            port: parse_or(vars, "AGENT_API_PORT", api_defaults.port)?,
            iface: get("AGENT_API_IFACE")
                .map(str::to_string)
                .unwrap_or(api_defaults.iface),
            shutdown_timeout: secs_or(
                vars,
                "AGENT_API_SHUTDOWN_TIMEOUT_SECS",
                api_defaults.shutdown_timeout,
            )?,
        };

        let registry_defaults = RegistryConfig::default();
        let jitter: f64 = parse_or(
            vars,
            "AGENT_REGISTRY_BACKOFF_JITTER_FACTOR",
            registry_defaults.backoff_jitter_factor,
        )?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_REGISTRY_BACKOFF_JITTER_FACTOR".to_string(),
                message: format!("{jitter} is outside 0.0..=1.0"),
            });
        }
        let registry = RegistryConfig {
            server: get("AGENT_REGISTRY_SERVER").map(str::to_string),
            user: get("AGENT_REGISTRY_USER").unwrap_or_default().to_string(),
            pass: SecretString::from(get("AGENT_REGISTRY_PASS").unwrap_or_default().to_string()),
            backoff_interval: secs_or(
                vars,
                "AGENT_REGISTRY_BACKOFF_INTERVAL_SECS",
                registry_defaults.backoff_interval,
            )?,
            backoff_max_retries: parse_or(
                vars,
                "AGENT_REGISTRY_BACKOFF_MAX_RETRIES",
                registry_defaults.backoff_max_retries,
            )?,
            backoff_jitter_factor: jitter,
        };

        let retry_defaults = RetryConfig::default();
        let retry = RetryConfig {
            retries: parse_or(vars, "AGENT_RETRIES", retry_defaults.retries)?,
            interval: secs_or(vars, "AGENT_RETRY_INTERVAL_SECS", retry_defaults.interval)?,
        };

        let state_endpoint = get("AGENT_STATE_ENDPOINT")
            .ok_or_else(|| ConfigError::MissingEnvVar("AGENT_STATE_ENDPOINT".to_string()))?
            .to_string();
        let results_endpoint = get("AGENT_RESULTS_ENDPOINT")
            .ok_or_else(|| ConfigError::MissingEnvVar("AGENT_RESULTS_ENDPOINT".to_string()))?
            .to_string();
        let report = ReportConfig {
            state_endpoint,
            results_endpoint,
            timeout: secs_or(vars, "AGENT_REPORT_TIMEOUT_SECS", Duration::from_secs(30))?,
        };

        let check_vars = vars
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(CHECK_VAR_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), value.clone()))
            })
            .collect();

        Ok(Self {
            agent,
            api,
            registry,
            retry,
            report,
            aborted_checks_url: get("AGENT_ABORTED_CHECKS_URL").map(str::to_string),
            check_vars,
        })
    }
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn secs_or(
    vars: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(vars, key, default.as_secs()).map(Duration::from_secs)
}
