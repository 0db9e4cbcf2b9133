//! Configuration for the Outpost subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A traffic class with its own independent rate budget.
///
/// Every outbound call is tagged with exactly one category; categories are
/// throttled and queued independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Session creation and token refresh.
    Auth,
    /// Timeline, profile, and notification fetches.
    Read,
    /// Post creation, likes, reposts, follows.
    Write,
    /// Everything else.
    General,
}

impl Category {
    /// All categories, in a fixed order.
    pub const ALL: [Category; 4] = [
        Category::Auth,
        Category::Read,
        Category::Write,
        Category::General,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Auth => "auth",
            Category::Read => "read",
            Category::Write => "write",
            Category::General => "general",
        };
        f.write_str(name)
    }
}

/// Static rate budget for one category. Fixed at startup, never mutated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CategoryLimits {
    /// Maximum requests allowed within the sliding window.
    pub max_requests: u32,
    /// Sliding window length in milliseconds.
    pub window_ms: u64,
    /// Floor spacing between requests even when capacity exists, to avoid
    /// micro-bursts.
    pub min_delay_ms: u64,
}

impl CategoryLimits {
    /// The sliding window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// The minimum inter-request spacing as a `Duration`.
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }
}

/// Per-category rate budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_auth_limits")]
    pub auth: CategoryLimits,
    #[serde(default = "default_read_limits")]
    pub read: CategoryLimits,
    #[serde(default = "default_write_limits")]
    pub write: CategoryLimits,
    #[serde(default = "default_general_limits")]
    pub general: CategoryLimits,
}

impl LimitsConfig {
    /// The budget for a given category.
    pub fn for_category(&self, category: Category) -> CategoryLimits {
        match category {
            Category::Auth => self.auth,
            Category::Read => self.read,
            Category::Write => self.write,
            Category::General => self.general,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            auth: default_auth_limits(),
            read: default_read_limits(),
            write: default_write_limits(),
            general: default_general_limits(),
        }
    }
}

fn default_auth_limits() -> CategoryLimits {
    CategoryLimits {
        max_requests: 30,
        window_ms: 60_000,
        min_delay_ms: 1_000,
    }
}

fn default_read_limits() -> CategoryLimits {
    CategoryLimits {
        max_requests: 100,
        window_ms: 60_000,
        min_delay_ms: 100,
    }
}

fn default_write_limits() -> CategoryLimits {
    CategoryLimits {
        max_requests: 30,
        window_ms: 60_000,
        min_delay_ms: 500,
    }
}

fn default_general_limits() -> CategoryLimits {
    CategoryLimits {
        max_requests: 60,
        window_ms: 60_000,
        min_delay_ms: 200,
    }
}

/// Default retry behavior for governed calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff delay ceiling in milliseconds (before jitter).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Request queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum pending entries per category before load shedding.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

fn default_max_depth() -> usize {
    1024
}

/// Scheduled dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Sweep interval in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Consecutive dispatch failures after which a job is dropped instead of
    /// retried on every sweep.
    #[serde(default = "default_max_job_failures")]
    pub max_job_failures: u32,
}

impl DispatcherConfig {
    /// The sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            max_job_failures: default_max_job_failures(),
        }
    }
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_max_job_failures() -> u32 {
    10
}

/// Top-level configuration for the subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutpostConfig {
    /// Per-category rate budgets.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Default retry behavior.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Request queue bounds.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Scheduled dispatcher timing.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl OutpostConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::OutpostError::Config(e.to_string()))
    }
}
