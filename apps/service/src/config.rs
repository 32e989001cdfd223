use std::{env, fmt, fs, path, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: std::io::Error },
    #[error("failed to write config file {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: std::io::Error },
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config path available (neither XDG_CONFIG_HOME nor HOME is set)")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub producer: ProducerConfig,
    pub evaluator: EvaluatorConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the local libsql database file shared by producer and workers
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub stream: String,
    pub group: String,
    /// Maximum number of jobs claimed per batch
    pub batch_size: usize,
    /// How long a claim waits for new jobs before returning empty
    pub block_ms: u64,
    /// Pending jobs idle for longer than this are handed to another worker
    pub redeliver_after_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub region: String,
    /// Stable consumer name; `worker-<pid>` when unset
    pub worker_id: Option<String>,
    pub probe_timeout_seconds: u64,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Ticks older than this stop counting toward the majority.
    /// Unset means a silent region keeps voting with its last tick forever.
    pub max_tick_age_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMode {
    #[default]
    Log,
    Webhook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub mode: NotificationMode,
    /// Mail relay receiving `{to, subject, text, html}` in webhook mode
    pub webhook_url: Option<String>,
    /// Linked from alert emails when set
    pub dashboard_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "tickwatch.db".into() }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: "uptime:jobs".into(),
            group: "uptime-group".into(),
            batch_size: 10,
            block_ms: 5000,
            redeliver_after_seconds: 60,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            region: "default-region".into(),
            worker_id: None,
            probe_timeout_seconds: 10,
            backoff_ms: 2000,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self { interval_seconds: 60 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { format: "compact".into() }
    }
}

impl WorkerConfig {
    /// Consumer identity inside the group, derived from the process id by default
    pub fn worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl EvaluatorConfig {
    pub fn max_tick_age(&self) -> Option<Duration> {
        self.max_tick_age_seconds.map(Duration::from_secs)
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/tickwatch/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("tickwatch/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };
        let or_unset = |value: &Option<String>| value.clone().unwrap_or_else(|| "(unset)".into());

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path)?;

        write_title_1(f, "Queue")?;
        write_1(f, "Stream", &self.queue.stream)?;
        write_1(f, "Consumer Group", &self.queue.group)?;
        write_1(f, "Batch Size", &self.queue.batch_size)?;
        write_1(f, "Block (ms)", &self.queue.block_ms)?;
        write_1(f, "Redeliver After (s)", &self.queue.redeliver_after_seconds)?;

        write_title_1(f, "Worker")?;
        write_1(f, "Region", &self.worker.region)?;
        write_1(f, "Worker ID", &self.worker.worker_id())?;
        write_1(f, "Probe Timeout (s)", &self.worker.probe_timeout_seconds)?;
        write_1(f, "Backoff (ms)", &self.worker.backoff_ms)?;

        write_title_1(f, "Producer")?;
        write_1(f, "Interval (s)", &self.producer.interval_seconds)?;

        write_title_1(f, "Evaluator")?;
        let max_age = self
            .evaluator
            .max_tick_age_seconds
            .map(|secs| secs.to_string())
            .unwrap_or_else(|| "unbounded".into());
        write_1(f, "Max Tick Age (s)", &max_age)?;

        write_title_1(f, "Notifications")?;
        write_1(f, "Mode", &format!("{:?}", self.notifications.mode).to_lowercase())?;
        write_1(f, "Webhook URL", &or_unset(&self.notifications.webhook_url))?;
        write_1(f, "Dashboard URL", &or_unset(&self.notifications.dashboard_url))?;

        write_title_1(f, "Logging")?;
        write_1(f, "Format", &self.logging.format)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/tickwatch/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```no_run
    /// let cfg = tickwatch::config::Config::from_config(None::<&std::path::Path>)?;
    /// println!("{}", cfg);
    /// # Ok::<(), tickwatch::config::Error>(())
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| Error::ReadFailed { path: config_path.clone(), source })?;
            Ok(toml::from_str(raw_string.as_str())?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| Error::WriteFailed { path: path.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| Error::WriteFailed { path: path.to_path_buf(), source })
    }
}
