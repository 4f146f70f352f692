//! Configuration module
//!
//! Worker settings read once from the environment (and `.env` when present)
//! and passed by value into the components that need them.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const WORKER_CONCURRENCY: usize = 10;
const WORKER_POLL_INTERVAL_MS: u64 = 500;
const TASK_MAX_RETRY: u32 = 3;
const TASK_TIMEOUT_SECS: u64 = 60;
const WORKER_SHUTDOWN_GRACE_SECS: u64 = 30;
const QUEUE_REAP_INTERVAL_SECS: u64 = 15;
const DB_MAX_CONNECTIONS: u32 = 10;

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!("Invalid LOG_FORMAT: {}", other)),
        }
    }
}

/// Queue policy applied to every enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskQueueConfig {
    /// Retries after the first attempt; 3 means up to 4 executions.
    pub max_retry: u32,
    pub task_timeout: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_retry: TASK_MAX_RETRY,
            task_timeout: Duration::from_secs(TASK_TIMEOUT_SECS),
        }
    }
}

/// Dispatcher pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub shutdown_grace_period: Duration,
    pub reap_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: WORKER_CONCURRENCY,
            poll_interval: Duration::from_millis(WORKER_POLL_INTERVAL_MS),
            shutdown_grace_period: Duration::from_secs(WORKER_SHUTDOWN_GRACE_SECS),
            reap_interval: Duration::from_secs(QUEUE_REAP_INTERVAL_SECS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Base directory uploads and artifacts live under.
    pub storage_root: PathBuf,
    pub ffprobe_path: String,
    pub ffmpeg_path: String,
    pub queue: TaskQueueConfig,
    pub dispatcher: DispatcherConfig,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let config = Self {
            database_url,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DB_MAX_CONNECTIONS)?,
            storage_root: lookup("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./uploads")),
            ffprobe_path: lookup("FFPROBE_PATH").unwrap_or_else(|| "ffprobe".to_string()),
            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            queue: TaskQueueConfig {
                max_retry: parse_or(&lookup, "TASK_MAX_RETRY", TASK_MAX_RETRY)?,
                task_timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "TASK_TIMEOUT_SECS",
                    TASK_TIMEOUT_SECS,
                )?),
            },
            dispatcher: DispatcherConfig {
                max_workers: parse_or(&lookup, "WORKER_CONCURRENCY", WORKER_CONCURRENCY)?,
                poll_interval: Duration::from_millis(parse_or(
                    &lookup,
                    "WORKER_POLL_INTERVAL_MS",
                    WORKER_POLL_INTERVAL_MS,
                )?),
                shutdown_grace_period: Duration::from_secs(parse_or(
                    &lookup,
                    "WORKER_SHUTDOWN_GRACE_SECS",
                    WORKER_SHUTDOWN_GRACE_SECS,
                )?),
                reap_interval: Duration::from_secs(parse_or(
                    &lookup,
                    "QUEUE_REAP_INTERVAL_SECS",
                    QUEUE_REAP_INTERVAL_SECS,
                )?),
            },
            log_format: match lookup("LOG_FORMAT") {
                Some(value) => value.parse()?,
                None => LogFormat::default(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !(self.database_url.starts_with("postgres://")
            || self.database_url.starts_with("postgresql://"))
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.dispatcher.max_workers == 0 {
            return Err(anyhow::anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }

        if self.dispatcher.poll_interval.is_zero() {
            return Err(anyhow::anyhow!("WORKER_POLL_INTERVAL_MS must be positive"));
        }

        if self.dispatcher.reap_interval.is_zero() {
            return Err(anyhow::anyhow!("QUEUE_REAP_INTERVAL_SECS must be positive"));
        }

        if self.queue.task_timeout.is_zero() {
            return Err(anyhow::anyhow!("TASK_TIMEOUT_SECS must be positive"));
        }

        if self.db_max_connections == 0 {
            return Err(anyhow::anyhow!("DB_MAX_CONNECTIONS must be at least 1"));
        }

        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, anyhow::Error>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value {:?}: {}", key, raw, e)),
        None => Ok(default),
    }
}
