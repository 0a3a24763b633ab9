use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RhythmError};
use crate::types::{JobClass, JobSpec};
use crate::window::{HourRange, WindowRule};

pub const DEFAULT_CONTROL_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TICK_MS: u64 = 1_000;
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 15 * 60;

/// Top-level config (rhythm.toml + RHYTHM_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RhythmConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub datastore: DatastoreConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub errors: ErrorsConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,
    /// Offset of the timetable's local clock from UTC, in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Pause before the single immediate retry granted to a timed-out job.
    #[serde(default = "default_timeout_retry_delay_ms")]
    pub timeout_retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_MS,
            utc_offset_minutes: 0,
            timeout_retry_delay_ms: default_timeout_retry_delay_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn timeout_retry_delay(&self) -> Duration {
        Duration::from_millis(self.timeout_retry_delay_ms)
    }
}

/// Per-class overrides. Anything left unset falls back to the class default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub command: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub priority: Option<u32>,
    pub window: Option<WindowRule>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            timeout_secs: None,
            priority: None,
            window: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub working_memory: JobConfig,
    #[serde(default)]
    pub short_term: JobConfig,
    #[serde(default)]
    pub rem: JobConfig,
    #[serde(default)]
    pub deep_consolidation: JobConfig,
    #[serde(default)]
    pub homeostasis: JobConfig,
}

impl JobsConfig {
    pub fn get(&self, class: JobClass) -> &JobConfig {
        match class {
            JobClass::WorkingMemory => &self.working_memory,
            JobClass::ShortTerm => &self.short_term,
            JobClass::Rem => &self.rem,
            JobClass::DeepConsolidation => &self.deep_consolidation,
            JobClass::Homeostasis => &self.homeostasis,
        }
    }

    pub fn get_mut(&mut self, class: JobClass) -> &mut JobConfig {
        match class {
            JobClass::WorkingMemory => &mut self.working_memory,
            JobClass::ShortTerm => &mut self.short_term,
            JobClass::Rem => &mut self.rem,
            JobClass::DeepConsolidation => &mut self.deep_consolidation,
            JobClass::Homeostasis => &mut self.homeostasis,
        }
    }
}

/// A fully-resolved class: what to run and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledClass {
    pub spec: JobSpec,
    pub window: WindowRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before a breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Backoff base used when the failure that opened the breaker was a timeout.
    #[serde(default = "default_timeout_backoff_ms")]
    pub timeout_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Exponent ceiling in `base * 2^min(failures, max_exponent)`.
    #[serde(default = "default_max_exponent")]
    pub max_exponent: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            base_backoff_ms: default_base_backoff_ms(),
            timeout_backoff_ms: default_timeout_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            max_exponent: default_max_exponent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "default_dlq_path")]
    pub path: String,
    /// Hard cap on stored rows; oldest entries are purged beyond it.
    #[serde(default = "default_dlq_max_entries")]
    pub max_entries: usize,
    /// Replay attempts before an entry is abandoned.
    #[serde(default = "default_dlq_max_retries")]
    pub max_retries: u32,
    /// SQLite busy timeout, bounding every store write.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Automatic replay of pending entries; 0 disables it.
    #[serde(default = "default_auto_replay_secs")]
    pub auto_replay_interval_secs: u64,
    #[serde(default = "default_replay_batch")]
    pub replay_batch: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            path: default_dlq_path(),
            max_entries: default_dlq_max_entries(),
            max_retries: default_dlq_max_retries(),
            busy_timeout_ms: default_busy_timeout_ms(),
            auto_replay_interval_secs: default_auto_replay_secs(),
            replay_batch: default_replay_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// A breaker open longer than this is forced half-open.
    #[serde(default = "default_stuck_open_secs")]
    pub stuck_open_secs: u64,
    /// Pending DLQ entries above this mark degrade health.
    #[serde(default = "default_dlq_high_water")]
    pub dlq_high_water: u64,
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
    /// Error events inside the window above this count degrade health.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: usize,
    #[serde(default = "bool_true")]
    pub open_breakers_on_datastore_failure: bool,
    #[serde(default = "default_datastore_cooldown_secs")]
    pub datastore_cooldown_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            probe_timeout_secs: default_probe_timeout_secs(),
            stuck_open_secs: default_stuck_open_secs(),
            dlq_high_water: default_dlq_high_water(),
            error_window_secs: default_error_window_secs(),
            error_rate_threshold: default_error_rate_threshold(),
            open_breakers_on_datastore_failure: true,
            datastore_cooldown_secs: default_datastore_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreConfig {
    #[serde(default = "default_datastore_path")]
    pub path: String,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            path: default_datastore_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Captured bytes kept per stream (the tail is retained).
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Working directory for job processes; inherits ours when unset.
    pub working_dir: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: default_max_output_bytes(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorsConfig {
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: DEFAULT_CONTROL_PORT,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}
fn default_timeout_retry_delay_ms() -> u64 {
    2_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    1_000
}
fn default_timeout_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_secs() -> u64 {
    60
}
fn default_max_exponent() -> u32 {
    16
}
fn default_dlq_max_entries() -> usize {
    10_000
}
fn default_dlq_max_retries() -> u32 {
    5
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_auto_replay_secs() -> u64 {
    30 * 60
}
fn default_replay_batch() -> usize {
    20
}
fn default_health_interval_secs() -> u64 {
    DEFAULT_HEALTH_INTERVAL_SECS
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_stuck_open_secs() -> u64 {
    60 * 60
}
fn default_dlq_high_water() -> u64 {
    100
}
fn default_error_window_secs() -> u64 {
    15 * 60
}
fn default_error_rate_threshold() -> usize {
    20
}
fn default_datastore_cooldown_secs() -> u64 {
    5 * 60
}
fn default_max_output_bytes() -> usize {
    64 * 1024
}
fn default_ring_capacity() -> usize {
    1_000
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}
fn rhythm_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.rhythm")
}
fn default_dlq_path() -> String {
    format!("{}/dlq.db", rhythm_home())
}
fn default_datastore_path() -> String {
    format!("{}/warehouse.db", rhythm_home())
}
fn default_config_path() -> String {
    format!("{}/rhythm.toml", rhythm_home())
}

/// Built-in timetable used for any class the config does not override.
fn class_defaults(class: JobClass) -> (u64, u32, WindowRule) {
    match class {
        // every 5 minutes while awake
        JobClass::WorkingMemory => (
            120,
            10,
            WindowRule::EveryMinutes {
                every: 5,
                hours: HourRange::new(6, 22),
            },
        ),
        JobClass::ShortTerm => (
            300,
            20,
            WindowRule::EveryMinutes {
                every: 15,
                hours: HourRange::ALL_DAY,
            },
        ),
        // on the hour and half hour through the night
        JobClass::Rem => (
            900,
            30,
            WindowRule::AtMinutes {
                minutes: vec![0, 30],
                hours: HourRange::new(22, 6),
            },
        ),
        JobClass::DeepConsolidation => (
            3_600,
            40,
            WindowRule::AtMinutes {
                minutes: vec![0],
                hours: HourRange::new(2, 4),
            },
        ),
        // Sunday 03:00
        JobClass::Homeostasis => (
            7_200,
            50,
            WindowRule::Weekly {
                weekday: 6,
                hour: 3,
                minute: 0,
            },
        ),
    }
}

fn default_command(class: JobClass) -> Vec<String> {
    vec![
        "dbt".to_string(),
        "run".to_string(),
        "--select".to_string(),
        format!("tag:{class}"),
    ]
}

impl RhythmConfig {
    /// Load config from a TOML file with RHYTHM_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.rhythm/rhythm.toml
    ///
    /// Nested keys use a double underscore: `RHYTHM_DLQ__MAX_ENTRIES=500`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: RhythmConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RHYTHM_").split("__"))
            .extract()
            .map_err(|e| RhythmError::ConfigInvalid(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Resolve every enabled class against its defaults.
    pub fn classes(&self) -> Vec<ScheduledClass> {
        JobClass::ALL
            .iter()
            .filter_map(|class| {
                let cfg = self.jobs.get(*class);
                if !cfg.enabled {
                    return None;
                }
                let (timeout_secs, priority, window) = class_defaults(*class);
                Some(ScheduledClass {
                    spec: JobSpec {
                        class: *class,
                        command: cfg
                            .command
                            .clone()
                            .unwrap_or_else(|| default_command(*class)),
                        timeout: Duration::from_secs(cfg.timeout_secs.unwrap_or(timeout_secs)),
                        priority: cfg.priority.unwrap_or(priority),
                    },
                    window: cfg.window.clone().unwrap_or(window),
                })
            })
            .collect()
    }

    /// Reject configurations the daemon cannot run with. This is the only
    /// fatal error path and runs before the tick loop starts.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RhythmError::ConfigInvalid(msg));

        if self.scheduler.tick_interval_ms == 0 {
            return invalid("scheduler.tick_interval_ms must be > 0".into());
        }
        if self.scheduler.utc_offset_minutes.abs() >= 24 * 60 {
            return invalid(format!(
                "scheduler.utc_offset_minutes {} out of range",
                self.scheduler.utc_offset_minutes
            ));
        }

        let classes = self.classes();
        if classes.is_empty() {
            return invalid("at least one job class must be enabled".into());
        }
        for c in &classes {
            let class = c.spec.class;
            match c.spec.command.first() {
                None => return invalid(format!("jobs.{class}.command must not be empty")),
                Some(program) if program.trim().is_empty() => {
                    return invalid(format!("jobs.{class}.command[0] must name a program"))
                }
                Some(_) => {}
            }
            if c.spec.timeout.is_zero() {
                return invalid(format!("jobs.{class}.timeout_secs must be > 0"));
            }
            if let Err(e) = c.window.validate() {
                return invalid(format!("jobs.{class}.window: {e}"));
            }
        }

        let b = &self.breaker;
        if b.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be > 0".into());
        }
        if b.base_backoff_ms == 0 || b.timeout_backoff_ms == 0 {
            return invalid("breaker backoff bases must be > 0".into());
        }
        if b.base_backoff_ms > b.max_backoff_secs.saturating_mul(1_000) {
            return invalid("breaker.base_backoff_ms exceeds breaker.max_backoff_secs".into());
        }
        if b.max_exponent > 32 {
            return invalid("breaker.max_exponent must be <= 32".into());
        }

        if self.dlq.max_entries == 0 {
            return invalid("dlq.max_entries must be > 0".into());
        }
        if self.dlq.busy_timeout_ms == 0 {
            return invalid("dlq.busy_timeout_ms must be > 0".into());
        }
        if self.health.interval_secs == 0 || self.health.probe_timeout_secs == 0 {
            return invalid("health intervals must be > 0".into());
        }
        if self.errors.ring_capacity == 0 {
            return invalid("errors.ring_capacity must be > 0".into());
        }
        if self.executor.max_output_bytes == 0 {
            return invalid("executor.max_output_bytes must be > 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = RhythmConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.classes().len(), 5);
        assert_eq!(cfg.breaker.failure_threshold, 3);
        assert_eq!(cfg.health.interval_secs, 900);
    }

    #[test]
    fn overrides_merge_with_class_defaults() {
        let mut cfg = RhythmConfig::default();
        cfg.jobs.rem.command = Some(vec!["sqlmesh".into(), "run".into()]);
        cfg.jobs.homeostasis.enabled = false;

        let classes = cfg.classes();
        assert_eq!(classes.len(), 4);
        let rem = classes.iter().find(|c| c.spec.class == JobClass::Rem).unwrap();
        assert_eq!(rem.spec.command, vec!["sqlmesh", "run"]);
        assert_eq!(rem.spec.timeout, Duration::from_secs(900));
    }

    #[test]
    fn empty_command_is_config_invalid() {
        let mut cfg = RhythmConfig::default();
        cfg.jobs.short_term.command = Some(vec![]);
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");
        assert!(err.is_fatal());
    }

    #[test]
    fn bad_window_is_config_invalid() {
        let mut cfg = RhythmConfig::default();
        cfg.jobs.rem.window = Some(WindowRule::AtMinutes {
            minutes: vec![75],
            hours: HourRange::new(22, 6),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_threshold_rejected() {
        let mut cfg = RhythmConfig::default();
        cfg.breaker.failure_threshold = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_toml_and_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "rhythm.toml",
                r#"
                [breaker]
                failure_threshold = 5

                [jobs.short_term]
                command = ["dbt", "build", "--select", "tag:stm"]
                timeout_secs = 10
                window = { kind = "every_minutes", every = 5 }
                "#,
            )?;
            jail.set_env("RHYTHM_DLQ__MAX_ENTRIES", "250");

            let cfg = RhythmConfig::load(Some("rhythm.toml")).map_err(|e| e.to_string())?;
            assert_eq!(cfg.breaker.failure_threshold, 5);
            assert_eq!(cfg.dlq.max_entries, 250);
            let stm = cfg
                .classes()
                .into_iter()
                .find(|c| c.spec.class == JobClass::ShortTerm)
                .unwrap();
            assert_eq!(stm.spec.timeout, Duration::from_secs(10));
            assert_eq!(
                stm.window,
                WindowRule::EveryMinutes {
                    every: 5,
                    hours: HourRange::ALL_DAY
                }
            );
            Ok(())
        });
    }
}
