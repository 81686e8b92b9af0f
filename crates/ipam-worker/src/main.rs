// # ipam-worker - Background Task Worker
//
// Thin integration layer: all reconciliation and orchestration logic lives in
// ipam-core. This binary only:
//
// 1. Reads configuration from environment variables
// 2. Initializes logging and the runtime
// 3. Builds the backend and the task broker through the registry
// 4. Runs the task worker until SIGINT/SIGTERM
//
// ## Configuration
//
// ### Remote
// - `IPAM_BACKEND`: Backend type (http, memory). Default: http
// - `IPAM_URL`: Base URL of the remote (for http)
// - `IPAM_TOKEN`: API token (for http)
// - `IPAM_TIMEOUT_SECS`: Request timeout, 1-300. Default: 30
// - `IPAM_PAGE_SIZE`: List page size, 1-1000. Default: 100
// - `IPAM_DRY_RUN`: Simulate writes (true/false). Default: false
//
// ### Queue
// - `IPAM_BROKER_PATH`: Path of the broker file shared with submitters (required)
// - `IPAM_POLL_INTERVAL_MS`: Idle poll interval, 100-60000. Default: 1000
// - `IPAM_CONFIRM_WRITES`: Whether tasks may write (true/false). Default: true
// - `IPAM_TASK_RETENTION_SECS`: How long finished tasks stay queryable. Default: 86400
//
// ### Logging
// - `IPAM_LOG_LEVEL`: Level or filter directive (e.g. "info", "ipam_core=debug"). Default: info
//
// ## Example
//
// ```bash
// export IPAM_URL=https://netbox.example.com
// export IPAM_TOKEN=0123456789abcdef0123456789abcdef01234567
// export IPAM_BROKER_PATH=/var/lib/ipam/tasks.json
//
// ipam-worker
// ```

use anyhow::Result;
use ipam_core::config::{BackendConfig, BrokerConfig, ClientConfig, WorkerConfig};
use ipam_core::tasks::WorkerEvent;
use ipam_core::{BackendRegistry, Orchestrator, ProxyClient, TaskWorker};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum WorkerExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<WorkerExitCode> for ExitCode {
    fn from(code: WorkerExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
#[derive(Debug)]
struct Config {
    backend_type: String,
    url: Option<String>,
    token: Option<String>,
    timeout_secs: u64,
    page_size: usize,
    dry_run: bool,
    broker_path: Option<String>,
    poll_interval_ms: u64,
    confirm_writes: bool,
    retention_secs: u64,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through a variable lookup
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            backend_type: lookup("IPAM_BACKEND").unwrap_or_else(|| "http".to_string()),
            url: lookup("IPAM_URL"),
            token: lookup("IPAM_TOKEN"),
            timeout_secs: parse_number(&lookup, "IPAM_TIMEOUT_SECS", 30)?,
            page_size: parse_number(&lookup, "IPAM_PAGE_SIZE", 100)?,
            dry_run: parse_flag(&lookup, "IPAM_DRY_RUN", false)?,
            broker_path: lookup("IPAM_BROKER_PATH"),
            poll_interval_ms: parse_number(&lookup, "IPAM_POLL_INTERVAL_MS", 1000)?,
            confirm_writes: parse_flag(&lookup, "IPAM_CONFIRM_WRITES", true)?,
            retention_secs: parse_number(&lookup, "IPAM_TASK_RETENTION_SECS", 86_400)?,
            log_level: lookup("IPAM_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        match self.backend_type.as_str() {
            "http" => {
                if !cfg!(feature = "http") {
                    anyhow::bail!("IPAM_BACKEND=http requires the 'http' feature");
                }
                self.validate_remote()?;
            }
            "memory" => {}
            other => anyhow::bail!(
                "IPAM_BACKEND '{}' is not supported. Supported backends: http, memory",
                other
            ),
        }

        match self.broker_path.as_deref() {
            None | Some("") => anyhow::bail!(
                "IPAM_BROKER_PATH is required. \
                Set it via: export IPAM_BROKER_PATH=/var/lib/ipam/tasks.json"
            ),
            Some(path) => {
                if let Some(parent) = std::path::Path::new(path).parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                {
                    anyhow::bail!(
                        "IPAM_BROKER_PATH parent directory does not exist: {}. \
                        Create it first: sudo mkdir -p {}",
                        parent.display(),
                        parent.display()
                    );
                }
            }
        }

        if !(1..=300).contains(&self.timeout_secs) {
            anyhow::bail!(
                "IPAM_TIMEOUT_SECS must be between 1 and 300 seconds. Got: {}",
                self.timeout_secs
            );
        }
        if !(1..=1000).contains(&self.page_size) {
            anyhow::bail!("IPAM_PAGE_SIZE must be between 1 and 1000. Got: {}", self.page_size);
        }
        if !(100..=60_000).contains(&self.poll_interval_ms) {
            anyhow::bail!(
                "IPAM_POLL_INTERVAL_MS must be between 100 and 60000. Got: {}",
                self.poll_interval_ms
            );
        }

        if EnvFilter::try_new(&self.log_level).is_err() {
            anyhow::bail!(
                "IPAM_LOG_LEVEL '{}' is not valid. \
                Use a level (trace, debug, info, warn, error) or a filter directive",
                self.log_level
            );
        }

        Ok(())
    }

    fn validate_remote(&self) -> Result<()> {
        let url = self.url.as_deref().unwrap_or_default();
        if url.is_empty() {
            anyhow::bail!("IPAM_URL is required when IPAM_BACKEND=http");
        }
        if !url.starts_with("https://") && !url.starts_with("http://") {
            anyhow::bail!("IPAM_URL must use HTTP or HTTPS scheme. Got: {}", url);
        }
        if url.starts_with("http://") {
            eprintln!(
                "WARNING: IPAM_URL uses HTTP (not HTTPS). \
                The API token will be sent in clear text."
            );
        }

        let token = self.token.as_deref().unwrap_or_default();
        if token.is_empty() {
            anyhow::bail!(
                "IPAM_TOKEN is required when IPAM_BACKEND=http. \
                Set it via: export IPAM_TOKEN=your_token"
            );
        }
        let token_lower = token.to_lowercase();
        if token_lower.contains("your_token")
            || token_lower.contains("replace_me")
            || token_lower == "token"
        {
            anyhow::bail!(
                "IPAM_TOKEN appears to be a placeholder. \
                Use an actual API token from the remote system."
            );
        }
        Ok(())
    }

    fn backend_config(&self) -> BackendConfig {
        match self.backend_type.as_str() {
            "memory" => BackendConfig::Memory,
            _ => BackendConfig::Http {
                base_url: self.url.clone().unwrap_or_default(),
                api_token: self.token.clone().unwrap_or_default(),
                timeout_secs: self.timeout_secs,
                page_size: self.page_size,
            },
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.backend_config()).with_dry_run(self.dry_run)
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval_ms: self.poll_interval_ms,
            confirm_writes: self.confirm_writes,
            retention_secs: self.retention_secs,
        }
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a number. Got: {}", key, raw)),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match lookup(key).map(|raw| raw.trim().to_lowercase()) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{} must be true or false. Got: {}", key, raw),
        },
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return WorkerExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return WorkerExitCode::ConfigError.into();
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return WorkerExitCode::ConfigError.into();
    }

    info!("Starting ipam-worker");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return WorkerExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_worker(config).await {
            error!("Worker error: {:#}", e);
            WorkerExitCode::RuntimeError
        } else {
            WorkerExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Build the components and run the worker loop
async fn run_worker(config: Config) -> Result<()> {
    let registry = BackendRegistry::with_builtins();

    #[cfg(feature = "http")]
    {
        info!("Registering HTTP backend");
        ipam_backend_http::register(&registry);
    }

    let client_config = config.client_config();
    client_config.validate()?;
    let backend = registry.create_backend(&client_config.backend)?;
    info!(
        "Remote backend: {} (dry-run: {})",
        backend.backend_name(),
        config.dry_run
    );
    let client = Arc::new(ProxyClient::new(backend, &client_config)?);

    let broker_config = BrokerConfig::File {
        path: config.broker_path.clone().unwrap_or_default(),
    };
    let broker = registry.create_broker(&broker_config).await?;
    broker.ping().await?;
    info!("Task broker: {:?}", broker_config);

    let (worker, mut events) = TaskWorker::new(broker, Orchestrator::new(client), config.worker_config());

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::TaskFinished {
                    task_id,
                    state,
                    summary,
                } => info!("Task {} -> {:?} {:?}", task_id, state, summary),
                other => debug!("Worker event: {:?}", other),
            }
        }
    });

    let outcome = worker.run().await;
    drop(worker);
    let _ = event_log.await;

    outcome?;
    info!("ipam-worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("IPAM_BROKER_PATH", "tasks.json")]).unwrap();
        assert_eq!(config.backend_type, "http");
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.poll_interval_ms, 1000);
        assert!(config.confirm_writes);
        assert_eq!(config.retention_secs, 86_400);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_memory_backend_needs_only_broker_path() {
        let config = config_from(&[("IPAM_BACKEND", "memory"), ("IPAM_BROKER_PATH", "tasks.json")]).unwrap();
        config.validate().unwrap();
        assert!(matches!(config.backend_config(), BackendConfig::Memory));
    }

    #[test]
    fn test_http_backend_requires_token() {
        let config = config_from(&[
            ("IPAM_URL", "https://netbox.example.com"),
            ("IPAM_BROKER_PATH", "tasks.json"),
        ])
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("IPAM_TOKEN"));
    }

    #[test]
    fn test_placeholder_token_rejected() {
        let config = config_from(&[
            ("IPAM_URL", "https://netbox.example.com"),
            ("IPAM_TOKEN", "REPLACE_ME"),
            ("IPAM_BROKER_PATH", "tasks.json"),
        ])
        .unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("placeholder"));
    }

    #[test]
    fn test_missing_broker_path_rejected() {
        let config = config_from(&[("IPAM_BACKEND", "memory")]).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("IPAM_BROKER_PATH"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config_from(&[("IPAM_DRY_RUN", "maybe")]).is_err());
        assert!(config_from(&[("IPAM_POLL_INTERVAL_MS", "soon")]).is_err());

        let config = config_from(&[
            ("IPAM_BACKEND", "memory"),
            ("IPAM_BROKER_PATH", "tasks.json"),
            ("IPAM_POLL_INTERVAL_MS", "5"),
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flags_parse() {
        let config = config_from(&[("IPAM_DRY_RUN", "yes"), ("IPAM_CONFIRM_WRITES", "0")]).unwrap();
        assert!(config.dry_run);
        assert!(!config.confirm_writes);
        assert!(!config.worker_config().confirm_writes);
    }

    #[test]
    fn test_log_filter_directive_accepted() {
        let config = config_from(&[
            ("IPAM_BACKEND", "memory"),
            ("IPAM_BROKER_PATH", "tasks.json"),
            ("IPAM_LOG_LEVEL", "info,ipam_core=debug"),
        ])
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_http_backend_config_carries_settings() {
        let config = config_from(&[
            ("IPAM_URL", "https://netbox.example.com"),
            ("IPAM_TOKEN", "0123456789abcdef"),
            ("IPAM_BROKER_PATH", "tasks.json"),
            ("IPAM_PAGE_SIZE", "250"),
        ])
        .unwrap();
        config.validate().unwrap();
        match config.client_config().backend {
            BackendConfig::Http { page_size, .. } => assert_eq!(page_size, 250),
            other => panic!("unexpected backend {:?}", other),
        }
    }
}
