//! Environment configuration.
//!
//! Every setting is read once at startup. JSON documents are parsed into
//! validated structs here so that a bad document stops the process before
//! any machine is touched.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleet_events::{
    parse_allow_list, parse_queue_configs, parse_scale_down_windows, QueueConfig, RunnerType,
    ScaleDownWindow,
};
use fleet_reconcile::{EvictionPolicy, RetryBackoff};

use crate::collaborators::CapacityType;

/// Complete scaler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub scale_up: ScaleUpConfig,
    pub dispatch: DispatchConfig,
    pub scale_down: ScaleDownConfig,
    pub pool: Option<PoolConfig>,
    pub retry: RetryConfig,
    pub housekeeping: HousekeepingConfig,
    /// How long a scale-up message that failed with a retryable error stays
    /// hidden before it is delivered again.
    pub redelivery_delay: Duration,
}

/// Fleet request settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSettings {
    pub subnet_ids: Vec<String>,
    pub instance_types: Vec<String>,
    pub launch_template_name: String,
    pub capacity_type: CapacityType,
    pub allocation_strategy: String,
    pub max_spot_price: Option<String>,
    /// Provider codes that trigger one on-demand retry of a spot request.
    pub on_demand_failover_on_error: Vec<String>,
    /// Parameter holding an image id that overrides the launch template's.
    pub image_id_parameter: Option<String>,
}

/// Scale-up settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleUpConfig {
    pub environment: String,
    pub runner_type: RunnerType,
    pub ephemeral: bool,
    pub jit_config: bool,
    pub job_queued_check: bool,
    /// `None` means unlimited.
    pub maximum_runners: Option<u32>,
    pub name_prefix: String,
    pub runner_labels: Vec<String>,
    pub runner_group: String,
    pub disable_auto_update: bool,
    pub token_path: String,
    pub coordinator_url: String,
    pub fleet: FleetSettings,
}

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub queues: Vec<QueueConfig>,
    /// `owner/repo` entries; empty allows every repository.
    pub repository_allow_list: Vec<String>,
}

/// Scale-down settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDownConfig {
    pub environment: String,
    pub name_prefix: String,
    pub minimum_running_time: chrono::Duration,
    pub boot_time: chrono::Duration,
    pub windows: Vec<ScaleDownWindow>,
    pub interval: Duration,
}

/// Pool balancer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub size: u32,
    pub owner: String,
    pub interval: Duration,
}

/// Retry scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub enabled: bool,
    pub backoff: RetryBackoff,
    pub job_queue: String,
    pub retry_queue: String,
    pub metrics_enabled: bool,
}

/// Bootstrap parameter cleanup settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HousekeepingConfig {
    pub token_path: String,
    pub retention: chrono::Duration,
    pub interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let log_level = vars.string("FLEET_LOG_LEVEL", "info");
        let environment = vars.required("FLEET_ENVIRONMENT")?;
        let name_prefix = vars.string("FLEET_RUNNER_NAME_PREFIX", "");
        let token_path = vars.string("FLEET_TOKEN_PATH", "/fleet/runners/tokens");
        let ephemeral = vars.flag("FLEET_ENABLE_EPHEMERAL_RUNNERS", false)?;

        let maximum_runners = match vars.number::<i64>("FLEET_RUNNERS_MAXIMUM_COUNT", 3)? {
            -1 => None,
            n if n < 0 => {
                bail!("FLEET_RUNNERS_MAXIMUM_COUNT must be -1 or non-negative, got {}", n)
            }
            n => Some(u32::try_from(n).context("FLEET_RUNNERS_MAXIMUM_COUNT out of range")?),
        };

        let fleet = FleetSettings {
            subnet_ids: vars.list("FLEET_SUBNET_IDS"),
            instance_types: vars.list("FLEET_INSTANCE_TYPES"),
            launch_template_name: vars.required("FLEET_LAUNCH_TEMPLATE_NAME")?,
            capacity_type: vars
                .string("FLEET_INSTANCE_TARGET_CAPACITY_TYPE", "spot")
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("FLEET_INSTANCE_TARGET_CAPACITY_TYPE")?,
            allocation_strategy: vars.string("FLEET_INSTANCE_ALLOCATION_STRATEGY", "lowest-price"),
            max_spot_price: vars.optional("FLEET_INSTANCE_MAX_SPOT_PRICE"),
            on_demand_failover_on_error: vars.list("FLEET_ON_DEMAND_FAILOVER_ON_ERROR"),
            image_id_parameter: vars.optional("FLEET_AMI_ID_PARAMETER"),
        };
        if fleet.subnet_ids.is_empty() {
            bail!("FLEET_SUBNET_IDS must list at least one subnet");
        }
        if fleet.instance_types.is_empty() {
            bail!("FLEET_INSTANCE_TYPES must list at least one instance type");
        }

        let jit_config = vars.flag("FLEET_ENABLE_JIT_CONFIG", false)?;
        let scale_up = ScaleUpConfig {
            environment: environment.clone(),
            runner_type: RunnerType::from_org_level(
                vars.flag("FLEET_ENABLE_ORGANIZATION_RUNNERS", false)?,
            ),
            ephemeral,
            jit_config: ephemeral && jit_config,
            job_queued_check: vars.flag("FLEET_ENABLE_JOB_QUEUED_CHECK", !ephemeral)?,
            maximum_runners,
            name_prefix: name_prefix.clone(),
            runner_labels: vars.list("FLEET_RUNNER_LABELS"),
            runner_group: vars.string("FLEET_RUNNER_GROUP", "Default"),
            disable_auto_update: vars.flag("FLEET_DISABLE_AUTO_UPDATE", false)?,
            token_path: token_path.clone(),
            coordinator_url: vars
                .string("FLEET_COORDINATOR_URL", "https://github.com")
                .trim_end_matches('/')
                .to_string(),
            fleet,
        };

        let dispatch = DispatchConfig {
            queues: parse_queue_configs(&vars.string("FLEET_QUEUES_CONFIG", "[]"))
                .context("FLEET_QUEUES_CONFIG")?,
            repository_allow_list: parse_allow_list(
                &vars.string("FLEET_REPOSITORY_ALLOW_LIST", "[]"),
            )
            .context("FLEET_REPOSITORY_ALLOW_LIST")?,
        };

        let windows = parse_scale_down_windows(&vars.string("FLEET_SCALE_DOWN_CONFIG", "[]"))
            .context("FLEET_SCALE_DOWN_CONFIG")?;
        EvictionPolicy::compile(&windows).context("FLEET_SCALE_DOWN_CONFIG")?;

        let scale_down = ScaleDownConfig {
            environment: environment.clone(),
            name_prefix,
            minimum_running_time: vars.minutes("FLEET_MINIMUM_RUNNING_TIME_MINUTES", 5)?,
            boot_time: vars.minutes("FLEET_RUNNER_BOOT_TIME_MINUTES", 5)?,
            windows,
            interval: Duration::from_secs(vars.number("FLEET_SCALE_DOWN_INTERVAL_SECS", 300)?),
        };

        let pool = match vars.optional("FLEET_POOL_SIZE") {
            Some(size) => Some(PoolConfig {
                size: size
                    .parse()
                    .with_context(|| format!("FLEET_POOL_SIZE: invalid value '{}'", size))?,
                owner: vars.required("FLEET_POOL_OWNER")?,
                interval: Duration::from_secs(vars.number("FLEET_POOL_INTERVAL_SECS", 300)?),
            }),
            None => None,
        };

        let retry_enabled = vars.flag("FLEET_JOB_RETRY_ENABLED", false)?;
        let factor: f64 = vars.number("FLEET_JOB_RETRY_BACKOFF", 2.0)?;
        if !factor.is_finite() || factor < 1.0 {
            bail!("FLEET_JOB_RETRY_BACKOFF must be at least 1, got {}", factor);
        }
        let retry = RetryConfig {
            enabled: retry_enabled,
            backoff: RetryBackoff {
                max_attempts: vars.number("FLEET_JOB_RETRY_MAX_ATTEMPTS", 1)?,
                base_delay: Duration::from_secs(vars.number("FLEET_JOB_RETRY_DELAY_SECS", 60)?),
                factor,
            },
            job_queue: if retry_enabled {
                vars.required("FLEET_JOB_QUEUE")?
            } else {
                vars.string("FLEET_JOB_QUEUE", "")
            },
            retry_queue: if retry_enabled {
                vars.required("FLEET_JOB_RETRY_QUEUE")?
            } else {
                vars.string("FLEET_JOB_RETRY_QUEUE", "")
            },
            metrics_enabled: vars.flag("FLEET_ENABLE_METRICS", false)?,
        };

        let housekeeping = HousekeepingConfig {
            token_path,
            retention: vars.minutes("FLEET_HOUSEKEEPING_RETENTION_MINUTES", 1440)?,
            interval: Duration::from_secs(vars.number("FLEET_HOUSEKEEPING_INTERVAL_SECS", 3600)?),
        };

        Ok(Self {
            log_level,
            scale_up,
            dispatch,
            scale_down,
            pool,
            retry,
            housekeeping,
            redelivery_delay: Duration::from_secs(
                vars.number("FLEET_SCALE_UP_REDELIVERY_DELAY_SECS", 30)?,
            ),
        })
    }
}

/// Upper bound for minute-valued settings (one leap year).
const MAX_MINUTES: i64 = 366 * 24 * 60;

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .with_context(|| format!("{} is required", key))
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key) {
            None => Ok(default),
            Some(v) => match v.to_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                other => bail!("{}: invalid boolean '{}'", key, other),
            },
        }
    }

    fn number<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|e: T::Err| anyhow::anyhow!("{}: invalid value '{}': {}", key, v, e)),
        }
    }

    /// A minute count between zero and [`MAX_MINUTES`].
    fn minutes(&self, key: &str, default: i64) -> Result<chrono::Duration> {
        let minutes: i64 = self.number(key, default)?;
        if !(0..=MAX_MINUTES).contains(&minutes) {
            bail!("{} must be between 0 and {} minutes, got {}", key, MAX_MINUTES, minutes);
        }
        chrono::Duration::try_minutes(minutes)
            .with_context(|| format!("{}: {} minutes is out of range", key, minutes))
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.optional(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let mut vars: HashMap<String, String> = [
            ("FLEET_ENVIRONMENT", "ci"),
            ("FLEET_SUBNET_IDS", "subnet-a, subnet-b"),
            ("FLEET_INSTANCE_TYPES", "m5.large"),
            ("FLEET_LAUNCH_TEMPLATE_NAME", "ci-runner"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            vars.insert(k.to_string(), v.to_string());
        }
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.scale_up.runner_type, RunnerType::Repo);
        assert_eq!(config.scale_up.maximum_runners, Some(3));
        assert_eq!(config.scale_up.fleet.subnet_ids, vec!["subnet-a", "subnet-b"]);
        assert_eq!(config.scale_up.fleet.capacity_type, CapacityType::Spot);
        assert_eq!(config.scale_up.runner_group, "Default");
        assert!(config.scale_up.job_queued_check);
        assert!(!config.scale_up.jit_config);
        assert_eq!(config.scale_down.boot_time, chrono::Duration::minutes(5));
        assert_eq!(config.scale_down.interval, Duration::from_secs(300));
        assert!(config.pool.is_none());
        assert!(!config.retry.enabled);
        assert_eq!(config.retry.backoff, RetryBackoff::default());
        assert_eq!(config.housekeeping.retention, chrono::Duration::minutes(1440));
        assert_eq!(config.redelivery_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_minute_settings_are_bounded() {
        for key in [
            "FLEET_MINIMUM_RUNNING_TIME_MINUTES",
            "FLEET_RUNNER_BOOT_TIME_MINUTES",
            "FLEET_HOUSEKEEPING_RETENTION_MINUTES",
        ] {
            assert!(load(&[(key, "9223372036854775807")]).is_err(), "{}", key);
            assert!(load(&[(key, "-1")]).is_err(), "{}", key);
            assert!(load(&[(key, "527041")]).is_err(), "{}", key);
        }

        let config = load(&[("FLEET_RUNNER_BOOT_TIME_MINUTES", "527040")]).unwrap();
        assert_eq!(config.scale_down.boot_time, chrono::Duration::minutes(527_040));
    }

    #[test]
    fn test_retry_factor_below_one_rejected() {
        assert!(load(&[("FLEET_JOB_RETRY_BACKOFF", "0.5")]).is_err());
        assert!(load(&[("FLEET_JOB_RETRY_BACKOFF", "NaN")]).is_err());
        assert!(load(&[("FLEET_JOB_RETRY_BACKOFF", "1")]).is_ok());
    }

    #[test]
    fn test_ephemeral_disables_queued_check_by_default() {
        let config = load(&[
            ("FLEET_ENABLE_EPHEMERAL_RUNNERS", "true"),
            ("FLEET_ENABLE_JIT_CONFIG", "true"),
        ])
        .unwrap();
        assert!(config.scale_up.ephemeral);
        assert!(config.scale_up.jit_config);
        assert!(!config.scale_up.job_queued_check);

        let config = load(&[
            ("FLEET_ENABLE_EPHEMERAL_RUNNERS", "true"),
            ("FLEET_ENABLE_JOB_QUEUED_CHECK", "true"),
        ])
        .unwrap();
        assert!(config.scale_up.job_queued_check);
    }

    #[test]
    fn test_jit_requires_ephemeral() {
        let config = load(&[("FLEET_ENABLE_JIT_CONFIG", "true")]).unwrap();
        assert!(!config.scale_up.jit_config);
    }

    #[test]
    fn test_unlimited_runners() {
        let config = load(&[("FLEET_RUNNERS_MAXIMUM_COUNT", "-1")]).unwrap();
        assert_eq!(config.scale_up.maximum_runners, None);
        assert!(load(&[("FLEET_RUNNERS_MAXIMUM_COUNT", "-2")]).is_err());
    }

    #[test]
    fn test_missing_required_values() {
        assert!(load(&[("FLEET_SUBNET_IDS", " , ")]).is_err());
        assert!(load(&[("FLEET_INSTANCE_TYPES", "")]).is_err());
        assert!(load(&[("FLEET_JOB_RETRY_ENABLED", "true")]).is_err());
        assert!(load(&[("FLEET_POOL_SIZE", "3")]).is_err());
    }

    #[test]
    fn test_invalid_documents_are_fatal() {
        assert!(load(&[("FLEET_QUEUES_CONFIG", "{not json")]).is_err());
        assert!(load(&[(
            "FLEET_SCALE_DOWN_CONFIG",
            r#"[{"cron": "not a cron", "idleCount": 1}]"#
        )])
        .is_err());
        assert!(load(&[("FLEET_ENABLE_METRICS", "maybe")]).is_err());
    }

    #[test]
    fn test_pool_and_retry() {
        let config = load(&[
            ("FLEET_POOL_SIZE", "4"),
            ("FLEET_POOL_OWNER", "acme"),
            ("FLEET_JOB_RETRY_ENABLED", "1"),
            ("FLEET_JOB_RETRY_MAX_ATTEMPTS", "3"),
            ("FLEET_JOB_RETRY_BACKOFF", "1.5"),
            ("FLEET_JOB_QUEUE", "jobs"),
            ("FLEET_JOB_RETRY_QUEUE", "jobs-retry"),
        ])
        .unwrap();

        let pool = config.pool.unwrap();
        assert_eq!(pool.size, 4);
        assert_eq!(pool.owner, "acme");
        assert!(config.retry.enabled);
        assert_eq!(config.retry.backoff.max_attempts, 3);
        assert_eq!(config.retry.backoff.factor, 1.5);
        assert_eq!(config.retry.retry_queue, "jobs-retry");
    }
}
