//! Configuration file handling.
//!
//! The dashboard reads a YAML file describing the GitLab instance, the
//! optional issue tracker and the tracked project groups:
//!
//! ```yaml
//! gitlab:
//!   url: https://gitlab.example.com
//!   token: glpat-xxxx
//! jira:
//!   url: https://jira.example.com
//! groups:
//!   - name: Backend
//!     projects:
//!       - id: 42
//!         name: api
//! ```
//!
//! The file is watched for changes and valid edits are applied to the running
//! service without a restart.

use crate::error::AppError;
use crate::models::{GroupSettings, JiraSettings, Settings};
use crate::services::fetch::DEFAULT_WORKERS;
use crate::services::{AggregationService, GitLabClientConfig};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "mr-dashboard.yaml";

/// Environment variable overriding `gitlab.token`.
pub const TOKEN_ENV_VAR: &str = "MR_DASHBOARD_GITLAB_TOKEN";

const APP_DIR_NAME: &str = "mr-dashboard";

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub gitlab: GitLabConfig,

    #[serde(default)]
    pub jira: JiraConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    /// Watch the file and apply valid edits while running.
    #[serde(default = "default_reload")]
    pub reload: bool,

    /// Quiet period after a file event before the file is read again.
    #[serde(default = "default_reload_debounce")]
    pub reload_debounce_ms: u64,

    #[serde(default)]
    pub groups: Vec<GroupSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitLabConfig {
    pub url: String,

    #[serde(default)]
    pub token: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JiraConfig {
    /// Issue tracker base URL, used to link `[KEY-123]` references.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Concurrent GitLab calls.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_reload() -> bool {
    true
}

fn default_reload_debounce() -> u64 {
    500
}

fn default_timeout() -> u64 {
    30
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl AppConfig {
    /// Load configuration.
    ///
    /// Search order:
    /// 1. Explicit path if provided (must exist)
    /// 2. ./mr-dashboard.yaml
    /// 3. mr-dashboard.yaml next to the executable
    /// 4. $XDG_CONFIG_HOME/mr-dashboard/mr-dashboard.yaml
    /// 5. ~/mr-dashboard.yaml
    ///
    /// Returns the config and the path it was read from.
    pub fn load(explicit_path: Option<&Path>) -> Result<(Self, PathBuf), AppError> {
        let path = match explicit_path {
            Some(p) if p.exists() => p.to_path_buf(),
            Some(p) => {
                return Err(AppError::config_at(
                    "Config file not found",
                    p.display().to_string(),
                ))
            }
            None => Self::find_config_file().ok_or_else(|| {
                AppError::config(format!(
                    "No configuration file found. Create {} in the current directory or in {}",
                    CONFIG_FILE_NAME,
                    dirs::config_dir()
                        .map(|d| d.join(APP_DIR_NAME).display().to_string())
                        .unwrap_or_else(|| "your config directory".to_string())
                ))
            })?,
        };

        let config = Self::load_from_path(&path)?;
        Ok((config, path))
    }

    /// Candidate locations, in search order.
    pub fn candidate_paths() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];

        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            candidates.push(dir.join(CONFIG_FILE_NAME));
        }
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME));
        }
        if let Some(dir) = dirs::home_dir() {
            candidates.push(dir.join(CONFIG_FILE_NAME));
        }

        candidates
    }

    fn find_config_file() -> Option<PathBuf> {
        Self::candidate_paths().into_iter().find(|p| p.exists())
    }

    /// Read, parse and validate a config file, applying the token override
    /// from the environment.
    pub fn load_from_path(path: &Path) -> Result<Self, AppError> {
        let mut config = Self::parse_file(path)?;
        config.apply_token_override(std::env::var(TOKEN_ENV_VAR).ok());
        config.validate().map_err(|e| with_path(e, path))?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self, AppError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AppError::config_at(
                format!("Failed to read config file: {}", e),
                path.display().to_string(),
            )
        })?;

        Self::parse(&contents).map_err(|e| with_path(e, path))
    }

    /// Parse YAML without validating.
    pub fn parse(contents: &str) -> Result<Self, AppError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Replace the token when an override is set and non-empty.
    pub fn apply_token_override(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            self.gitlab.token = token;
        }
    }

    /// Check required fields and group/project consistency.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.gitlab.url.trim().is_empty() {
            return Err(AppError::config("gitlab.url is required"));
        }
        if self.gitlab.token.trim().is_empty() {
            return Err(AppError::config(format!(
                "gitlab.token is required (or set {})",
                TOKEN_ENV_VAR
            )));
        }

        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(AppError::config("Group names must not be empty"));
            }
            for project in &group.projects {
                if !seen.insert(project.id) {
                    return Err(AppError::config(format!(
                        "Project {} is listed more than once",
                        project.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Settings snapshot for the aggregation service.
    pub fn to_settings(&self) -> Settings {
        Settings {
            groups: self.groups.clone(),
            jira: JiraSettings {
                url: self
                    .jira
                    .url
                    .as_deref()
                    .map(|url| url.trim().trim_end_matches('/').to_string())
                    .filter(|url| !url.is_empty()),
            },
        }
    }

    /// GitLab client settings.
    pub fn client_config(&self) -> GitLabClientConfig {
        GitLabClientConfig {
            base_url: self.gitlab.url.trim().trim_end_matches('/').to_string(),
            token: self.gitlab.token.clone(),
            timeout_secs: self.gitlab.timeout_secs,
        }
    }

    /// Address the HTTP server binds to, preferring `override_addr`.
    pub fn listen_addr(&self, override_addr: Option<&str>) -> Result<SocketAddr, AppError> {
        let raw = override_addr.unwrap_or(&self.server.listen);
        raw.parse()
            .map_err(|e| AppError::config(format!("Invalid listen address '{}': {}", raw, e)))
    }
}

fn with_path(err: AppError, path: &Path) -> AppError {
    match err {
        AppError::Config { message, path: None } => {
            AppError::config_at(message, path.display().to_string())
        }
        other => other,
    }
}

/// Reloads a config file and remembers the GitLab settings in effect.
pub struct ConfigWatcher {
    path: PathBuf,
    gitlab_url: String,
    gitlab_token: String,
}

impl ConfigWatcher {
    /// Watch `path`, taking `current` as the active configuration.
    pub fn new(path: PathBuf, current: &AppConfig) -> Self {
        Self {
            gitlab_url: current.gitlab.url.clone(),
            gitlab_token: current.gitlab.token.clone(),
            path,
        }
    }

    /// Path of the watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the file again.
    ///
    /// On error the caller keeps the previous snapshot.
    pub fn reload(&self) -> Result<AppConfig, AppError> {
        let config = AppConfig::load_from_path(&self.path)?;
        if config.gitlab.url != self.gitlab_url || config.gitlab.token != self.gitlab_token {
            log::warn!("[config] GitLab URL or token changed; restart to apply");
        }
        Ok(config)
    }

    /// Whether a file system event touches the watched file.
    ///
    /// The parent directory is watched so editors that replace the file
    /// through a rename are still seen.
    pub fn is_relevant(&self, event: &Event) -> bool {
        let changes_content = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
        );
        changes_content
            && event
                .paths
                .iter()
                .any(|p| p.file_name().is_some() && p.file_name() == self.path.file_name())
    }

    fn watch_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Watch the config file and push valid changes into `service`.
///
/// Bursts of events are coalesced over `reload_debounce_ms` before the file
/// is read. Returns `None` when reloading is disabled or the watcher could
/// not be started.
pub fn spawn_reload_task(
    path: PathBuf,
    current: &AppConfig,
    service: Arc<AggregationService>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !current.reload {
        log::info!("[config] Reloading disabled");
        return None;
    }

    let config_watcher = ConfigWatcher::new(path, current);
    let debounce = Duration::from_millis(current.reload_debounce_ms);

    let (tx, mut events) = mpsc::unbounded_channel::<Event>();
    let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = tx.send(event);
        }
        Err(e) => log::warn!("[config] Watch error: {}", e),
    });
    let mut watcher: RecommendedWatcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            log::warn!("[config] Failed to create file watcher: {}", e);
            return None;
        }
    };

    let dir = config_watcher.watch_dir();
    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        log::warn!("[config] Failed to watch {}: {}", dir.display(), e);
        return None;
    }
    log::info!("[config] Watching {}", config_watcher.path().display());

    Some(tokio::spawn(async move {
        // Dropping the watcher stops event delivery.
        let _watcher = watcher;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            if !config_watcher.is_relevant(&event) {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(debounce) => {}
            }
            while events.try_recv().is_ok() {}

            match config_watcher.reload() {
                Ok(config) => {
                    log::info!("[config] Reloaded {}", config_watcher.path().display());
                    service.update_settings(config.to_settings()).await;
                }
                Err(e) => {
                    log::warn!("[config] Ignoring invalid config: {}", e);
                }
            }
        }

        log::debug!("[config] Reload task stopped");
    }))
}
