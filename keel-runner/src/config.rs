//! Runner configuration
//!
//! Built once at startup and cloned into every component that needs it.

use std::path::PathBuf;
use std::time::Duration;

/// Key used when `SECRET_KEY` is not provided. Only suitable for development.
const DEV_SECRET_KEY: &str = "keel-dev-secret!";

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection string for the job queues
    pub redis_url: String,

    /// Document store base URL (e.g., "http://localhost:8080")
    pub store_url: String,

    /// Number of consumers started per job family
    pub consumers: usize,

    /// How often an idle consumer checks its queue
    pub queue_poll_interval: Duration,

    /// Maximum run time of a playbook job
    pub ansible_job_timeout: Duration,

    /// Maximum run time of a terraform job
    pub terraform_job_timeout: Duration,

    /// Maximum run time of a project update job
    pub sync_job_timeout: Duration,

    /// How often a waiting job re-reads the job it depends on
    pub dependency_poll_interval: Duration,

    /// Maximum time a job may wait for the job it depends on
    pub dependency_timeout: Duration,

    /// How often a live job re-reads its cancel flag
    pub cancel_poll_interval: Duration,

    /// Root of the project checkouts
    pub projects_home: PathBuf,

    /// Where per-job scratch directories and secret files are created
    pub tmp_path: PathBuf,

    /// Installation data (inventory plugin, callback plugins, playbooks)
    pub data_dir: PathBuf,

    /// Port of the API service, used to build the callback URL
    pub port: u16,

    /// AES key for at-rest credential fields (16, 24 or 32 bytes)
    pub secret_key: String,

    /// Wrap every tool invocation in proot
    pub proot_enabled: bool,

    /// How often the queue cleaner returns abandoned deliveries
    pub cleaner_interval: Duration,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(redis_url: String, store_url: String, secret_key: String) -> Self {
        Self {
            redis_url,
            store_url,
            secret_key,
            consumers: 1,
            queue_poll_interval: Duration::from_millis(500),
            ansible_job_timeout: Duration::from_secs(3600),
            terraform_job_timeout: Duration::from_secs(3600),
            sync_job_timeout: Duration::from_secs(3600),
            dependency_poll_interval: Duration::from_secs(2),
            dependency_timeout: Duration::from_secs(3600),
            cancel_poll_interval: Duration::from_secs(2),
            projects_home: PathBuf::from("/opt/keel/projects"),
            tmp_path: std::env::temp_dir(),
            data_dir: PathBuf::from("/var/lib/keel"),
            port: 8010,
            proot_enabled: false,
            cleaner_interval: Duration::from_secs(15),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - REDIS_URL (required)
    /// - STORE_URL (required)
    /// - SECRET_KEY (required)
    /// - CONSUMERS (optional, default: 1)
    /// - QUEUE_POLL_INTERVAL_MS (optional, milliseconds, default: 500)
    /// - ANSIBLE_JOB_TIMEOUT, TERRAFORM_JOB_TIMEOUT, SYNC_JOB_TIMEOUT (optional, seconds, default: 3600)
    /// - DEPENDENCY_POLL_INTERVAL (optional, seconds, default: 2)
    /// - DEPENDENCY_TIMEOUT (optional, seconds, default: 3600)
    /// - CANCEL_POLL_INTERVAL (optional, seconds, default: 2)
    /// - PROJECTS_HOME, TMP_PATH, DATA_DIR (optional paths)
    /// - PORT (optional, default: 8010)
    /// - PROOT_ENABLED (optional, default: false)
    /// - CLEANER_INTERVAL (optional, seconds, default: 15)
    pub fn from_env() -> anyhow::Result<Self> {
        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| anyhow::anyhow!("REDIS_URL environment variable not set"))?;

        let store_url = std::env::var("STORE_URL")
            .map_err(|_| anyhow::anyhow!("STORE_URL environment variable not set"))?;

        let secret_key = std::env::var("SECRET_KEY")
            .map_err(|_| anyhow::anyhow!("SECRET_KEY environment variable not set"))?;

        let mut config = Self::new(redis_url, store_url, secret_key);

        if let Some(consumers) = env_parse::<usize>("CONSUMERS") {
            config.consumers = consumers;
        }
        if let Some(ms) = env_parse::<u64>("QUEUE_POLL_INTERVAL_MS") {
            config.queue_poll_interval = Duration::from_millis(ms);
        }
        if let Some(timeout) = env_secs("ANSIBLE_JOB_TIMEOUT") {
            config.ansible_job_timeout = timeout;
        }
        if let Some(timeout) = env_secs("TERRAFORM_JOB_TIMEOUT") {
            config.terraform_job_timeout = timeout;
        }
        if let Some(timeout) = env_secs("SYNC_JOB_TIMEOUT") {
            config.sync_job_timeout = timeout;
        }
        if let Some(interval) = env_secs("DEPENDENCY_POLL_INTERVAL") {
            config.dependency_poll_interval = interval;
        }
        if let Some(timeout) = env_secs("DEPENDENCY_TIMEOUT") {
            config.dependency_timeout = timeout;
        }
        if let Some(interval) = env_secs("CANCEL_POLL_INTERVAL") {
            config.cancel_poll_interval = interval;
        }
        if let Ok(path) = std::env::var("PROJECTS_HOME") {
            config.projects_home = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("TMP_PATH") {
            config.tmp_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(path);
        }
        if let Some(port) = env_parse::<u16>("PORT") {
            config.port = port;
        }
        if let Some(enabled) = env_parse::<bool>("PROOT_ENABLED") {
            config.proot_enabled = enabled;
        }
        if let Some(interval) = env_secs("CLEANER_INTERVAL") {
            config.cleaner_interval = interval;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.redis_url.is_empty() {
            anyhow::bail!("redis_url cannot be empty");
        }

        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            anyhow::bail!("redis_url must start with redis:// or rediss://");
        }

        if !self.store_url.starts_with("http://") && !self.store_url.starts_with("https://") {
            anyhow::bail!("store_url must start with http:// or https://");
        }

        if !matches!(self.secret_key.len(), 16 | 24 | 32) {
            anyhow::bail!("secret_key must be 16, 24 or 32 bytes long");
        }

        if self.consumers == 0 {
            anyhow::bail!("consumers must be greater than 0");
        }

        if self.queue_poll_interval.is_zero() {
            anyhow::bail!("queue_poll_interval must be greater than 0");
        }

        if self.dependency_poll_interval.is_zero() || self.cancel_poll_interval.is_zero() {
            anyhow::bail!("poll intervals must be greater than 0");
        }

        if self.ansible_job_timeout.is_zero()
            || self.terraform_job_timeout.is_zero()
            || self.sync_job_timeout.is_zero()
        {
            anyhow::bail!("job timeouts must be greater than 0");
        }

        if self.cleaner_interval.is_zero() {
            anyhow::bail!("cleaner_interval must be greater than 0");
        }

        Ok(())
    }

    /// Base URL the invoked tools use to call back into the API
    pub fn callback_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Whether the development key is in use
    pub fn uses_dev_secret(&self) -> bool {
        self.secret_key == DEV_SECRET_KEY
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            "redis://127.0.0.1:6379".to_string(),
            "http://localhost:8080".to_string(),
            DEV_SECRET_KEY.to_string(),
        )
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}
