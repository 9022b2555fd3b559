//! Model lifecycle: bring the service up, get a model into it, and confirm the
//! service actually serves it before anyone is told the model is ready.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::alias_match::{self, AliasMatch};
use crate::chat::{RuntimeResolver, ServiceApi};
use crate::cli_output::{self, RunningModel};
use crate::config::AppConfig;
use crate::error::{LifecycleError, RelayError};
use crate::logs::LogSink;
use crate::runner::{CliRunner, CommandOutput};

const STATUS: &[&str] = &["service", "status"];
const START: &[&str] = &["service", "start"];
const STOP: &[&str] = &["service", "stop"];
const LIST_AVAILABLE: &[&str] = &["model", "list"];
const LIST_CACHED: &[&str] = &["cache", "list"];
const LIST_LOADED: &[&str] = &["service", "ps"];

/// Starting the service may include a first-run bootstrap of its own.
const SERVICE_START_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    CheckingService,
    StartingService,
    CheckingCache,
    Downloading,
    Loading,
    VerifyingHealth,
    Ready,
    Failed,
    Cancelled,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::CheckingService => "checking service",
            LifecycleState::StartingService => "starting service",
            LifecycleState::CheckingCache => "checking cache",
            LifecycleState::Downloading => "downloading",
            LifecycleState::Loading => "loading",
            LifecycleState::VerifyingHealth => "verifying health",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
            LifecycleState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub label: String,
    pub percent_complete: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub state: LifecycleState,
    pub message: String,
    pub progress: Option<DownloadProgress>,
}

/// Result of one `ensure_model_ready` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    Ready {
        alias: String,
        runtime_id: Option<String>,
    },
    Failed {
        /// State the activation was in when it failed.
        state: LifecycleState,
        error: LifecycleError,
    },
    Cancelled,
}

impl ActivationOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ActivationOutcome::Ready { .. })
    }

    pub fn status_message(&self) -> String {
        match self {
            ActivationOutcome::Ready { alias, .. } => format!("Model '{}' is ready.", alias),
            ActivationOutcome::Failed { error, .. } => error.to_string(),
            ActivationOutcome::Cancelled => "Model activation cancelled.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub url: Option<String>,
    pub is_running: bool,
}

/// What the service offers right after startup, and which model to select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub endpoint: ServiceEndpoint,
    pub available: Vec<String>,
    pub loaded: Vec<String>,
    pub matched: Option<AliasMatch>,
    /// Reconciled match, else the configured default, else the first available alias.
    pub selected: Option<String>,
}

/// Carries the per-call progress callback and remembers the current state
/// so a failure can report where it happened.
struct Reporter<'a> {
    progress: &'a (dyn Fn(LifecycleEvent) + Send + Sync),
    sink: Option<&'a LogSink>,
    state: Mutex<LifecycleState>,
}

impl<'a> Reporter<'a> {
    fn enter(&self, state: LifecycleState, message: impl Into<String>) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
        self.emit(state, message.into(), None);
    }

    fn current(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, state: LifecycleState, message: String, progress: Option<DownloadProgress>) {
        if progress.is_none() {
            log::info!("[supervisor] {}: {}", state, message);
            if let Some(sink) = self.sink {
                sink.info(&format!("[supervisor] {}: {}", state, message));
            }
        }
        (self.progress)(LifecycleEvent {
            state,
            message,
            progress,
        });
    }
}

pub struct Supervisor {
    runner: Arc<dyn CliRunner>,
    api: Arc<dyn ServiceApi>,
    config: AppConfig,
    sink: Option<Arc<LogSink>>,
    endpoint: Mutex<Option<ServiceEndpoint>>,
    /// Lowercased alias -> runtime id.
    runtime_ids: Mutex<HashMap<String, String>>,
    active: Mutex<Option<String>>,
}

impl Supervisor {
    pub fn new(runner: Arc<dyn CliRunner>, api: Arc<dyn ServiceApi>, config: AppConfig) -> Self {
        Self {
            runner,
            api,
            config,
            sink: None,
            endpoint: Mutex::new(None),
            runtime_ids: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    pub fn with_sink(mut self, sink: Arc<LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn active_model(&self) -> Option<String> {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn endpoint(&self) -> Option<ServiceEndpoint> {
        self.endpoint.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Bring `alias` to a state where chat requests can be served.
    pub async fn ensure_model_ready(
        &self,
        alias: &str,
        cancel: &CancellationToken,
        progress: &(dyn Fn(LifecycleEvent) + Send + Sync),
    ) -> ActivationOutcome {
        let alias = alias.trim();
        let reporter = Reporter {
            progress,
            sink: self.sink.as_deref(),
            state: Mutex::new(LifecycleState::Idle),
        };

        match self.activate(alias, cancel, &reporter).await {
            Ok(runtime_id) => {
                reporter.enter(LifecycleState::Ready, format!("Model '{}' is ready", alias));
                ActivationOutcome::Ready {
                    alias: alias.to_string(),
                    runtime_id,
                }
            }
            Err(LifecycleError::Cancelled) => {
                reporter.enter(LifecycleState::Cancelled, format!("Activation of '{}' cancelled", alias));
                ActivationOutcome::Cancelled
            }
            Err(error) => {
                let state = reporter.current();
                self.forget_alias(alias);
                reporter.enter(LifecycleState::Failed, error.to_string());
                ActivationOutcome::Failed { state, error }
            }
        }
    }

    async fn activate(
        &self,
        alias: &str,
        cancel: &CancellationToken,
        reporter: &Reporter<'_>,
    ) -> Result<Option<String>, LifecycleError> {
        if alias.is_empty() {
            return Err(LifecycleError::LoadFailed {
                alias: String::new(),
                detail: "no model alias given".to_string(),
            });
        }
        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }

        reporter.enter(LifecycleState::CheckingService, "Checking local model service");
        let mut endpoint = self.service_status(cancel).await?;
        if !endpoint.is_running {
            reporter.enter(LifecycleState::StartingService, "Starting local model service");
            endpoint = self.start_service(cancel).await?;
        }
        let url = endpoint.url.clone().ok_or_else(|| {
            LifecycleError::ServiceUnavailable("service did not report its URL".to_string())
        })?;
        log::info!("[supervisor] service at {}", url);

        let running = self.list_running(cancel).await?;
        if let Some(model) = running.iter().find(|m| m.alias.eq_ignore_ascii_case(alias)) {
            log::info!("[supervisor] '{}' already loaded", alias);
            let runtime_id = model
                .model_id
                .clone()
                .or_else(|| self.cached_runtime_id(alias));
            self.mark_active(alias, runtime_id.as_deref());
            return Ok(runtime_id);
        }

        reporter.enter(LifecycleState::CheckingCache, format!("Checking cache for '{}'", alias));
        let cached = self.list_cached(cancel).await?;
        if !cached.iter().any(|c| c.eq_ignore_ascii_case(alias)) {
            reporter.enter(LifecycleState::Downloading, format!("Downloading '{}'", alias));
            let out = self
                .run_with_progress(&["model", "download", alias], LifecycleState::Downloading, cancel, reporter)
                .await?;
            if !out.success() {
                return Err(LifecycleError::DownloadFailed {
                    alias: alias.to_string(),
                    detail: out.error_text(),
                });
            }
        }

        reporter.enter(LifecycleState::Loading, format!("Loading '{}'", alias));
        self.forget_alias(alias);
        let out = self
            .run_with_progress(&["model", "load", alias], LifecycleState::Loading, cancel, reporter)
            .await?;
        if !out.success() {
            return Err(LifecycleError::LoadFailed {
                alias: alias.to_string(),
                detail: out.error_text(),
            });
        }

        reporter.enter(LifecycleState::VerifyingHealth, format!("Verifying '{}'", alias));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
            _ = tokio::time::sleep(self.config.settle_delay()) => {}
        }
        // One health check only; retrying the whole activation is the caller's call.
        let ids = match self.api.list_model_ids(self.config.health_timeout(), cancel).await {
            Ok(ids) => ids,
            Err(RelayError::Cancelled) => return Err(LifecycleError::Cancelled),
            Err(e) => {
                return Err(LifecycleError::HealthCheckFailed {
                    alias: alias.to_string(),
                    detail: e.to_string(),
                })
            }
        };

        let running = self.list_running(cancel).await?;
        let loaded: Vec<String> = running.iter().map(|m| m.alias.clone()).collect();
        let reported = alias_match::find_loaded(alias, &loaded, &self.config.alias_matching)
            .and_then(|name| running.iter().find(|m| m.alias == name));
        let from_listing = pick_runtime_id(alias, &ids);

        let runtime_id = match (reported, from_listing) {
            (Some(model), listed) => model.model_id.clone().or(listed),
            (None, Some(listed)) => Some(listed),
            (None, None) => return Err(LifecycleError::NotReported(alias.to_string())),
        };
        self.mark_active(alias, runtime_id.as_deref());
        Ok(runtime_id)
    }

    /// Run a download or load, turning each output line into a progress event.
    async fn run_with_progress(
        &self,
        args: &[&str],
        state: LifecycleState,
        cancel: &CancellationToken,
        reporter: &Reporter<'_>,
    ) -> Result<CommandOutput, LifecycleError> {
        let progress = reporter.progress;
        let mut last: Option<(Option<u8>, String)> = None;
        let mut on_line = |line: &str| {
            let label = cli_output::strip_ansi(line).trim().to_string();
            if label.is_empty() {
                return;
            }
            let percent = cli_output::parse_percent(&label);
            // Progress bars repeat the same frame many times per second.
            if let Some((p, l)) = &last {
                if *p == percent && (percent.is_some() || *l == label) {
                    return;
                }
            }
            last = Some((percent, label.clone()));
            progress(LifecycleEvent {
                state,
                message: label.clone(),
                progress: Some(DownloadProgress {
                    label,
                    percent_complete: percent,
                }),
            });
        };
        let out = self.runner.run_streaming(args, &mut on_line, None, cancel).await;
        if out.cancelled {
            return Err(LifecycleError::Cancelled);
        }
        Ok(out)
    }

    async fn run_cli(
        &self,
        args: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, LifecycleError> {
        let out = self.runner.run(args, Some(timeout), cancel).await;
        if out.cancelled {
            return Err(LifecycleError::Cancelled);
        }
        Ok(out)
    }

    /// Ask the service for its status. An unreachable CLI counts as "not running".
    pub async fn service_status(&self, cancel: &CancellationToken) -> Result<ServiceEndpoint, LifecycleError> {
        let out = self.run_cli(STATUS, self.config.status_timeout(), cancel).await?;
        let url = cli_output::parse_service_url(&combined_text(&out));
        let endpoint = ServiceEndpoint {
            is_running: url.is_some(),
            url,
        };
        if endpoint.is_running {
            self.set_endpoint(Some(endpoint.clone()));
        } else if !out.success() {
            log::warn!("[supervisor] service status failed: {}", out.error_text());
        }
        Ok(endpoint)
    }

    pub async fn start_service(&self, cancel: &CancellationToken) -> Result<ServiceEndpoint, LifecycleError> {
        let out = self.run_cli(START, SERVICE_START_TIMEOUT, cancel).await?;
        self.clear_runtime_ids();
        // A timed-out start had its process group killed, whatever it printed.
        if out.timed_out {
            return Err(LifecycleError::ServiceUnavailable(format!(
                "service start did not finish within {}s",
                SERVICE_START_TIMEOUT.as_secs()
            )));
        }
        let Some(url) = cli_output::parse_service_url(&combined_text(&out)) else {
            let detail = if out.success() {
                "service start did not report a URL".to_string()
            } else {
                out.error_text()
            };
            return Err(LifecycleError::ServiceUnavailable(detail));
        };
        let endpoint = ServiceEndpoint {
            url: Some(url),
            is_running: true,
        };
        self.set_endpoint(Some(endpoint.clone()));
        Ok(endpoint)
    }

    pub async fn stop_service(&self, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        let out = self.run_cli(STOP, self.config.status_timeout(), cancel).await?;
        self.clear_runtime_ids();
        *self.active.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.set_endpoint(None);
        if !out.success() {
            return Err(LifecycleError::Command(out.error_text()));
        }
        self.log_info("[supervisor] service stopped");
        Ok(())
    }

    pub async fn list_available(&self, cancel: &CancellationToken) -> Result<Vec<String>, LifecycleError> {
        let out = self.run_cli(LIST_AVAILABLE, self.config.status_timeout(), cancel).await?;
        Ok(cli_output::parse_available_aliases(&combined_text(&out)))
    }

    pub async fn list_cached(&self, cancel: &CancellationToken) -> Result<Vec<String>, LifecycleError> {
        let out = self.run_cli(LIST_CACHED, self.config.status_timeout(), cancel).await?;
        Ok(cli_output::parse_cached_aliases(&combined_text(&out)))
    }

    pub async fn list_loaded(&self, cancel: &CancellationToken) -> Result<Vec<String>, LifecycleError> {
        Ok(self
            .list_running(cancel)
            .await?
            .into_iter()
            .map(|m| m.alias)
            .collect())
    }

    async fn list_running(&self, cancel: &CancellationToken) -> Result<Vec<RunningModel>, LifecycleError> {
        let out = self.run_cli(LIST_LOADED, self.config.status_timeout(), cancel).await?;
        Ok(cli_output::parse_running_models(&combined_text(&out)))
    }

    pub async fn unload_model(&self, alias: &str, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        let alias = alias.trim();
        let out = self
            .run_cli(&["model", "unload", alias], self.config.status_timeout(), cancel)
            .await?;
        self.forget_alias(alias);
        if !out.success() {
            return Err(LifecycleError::Command(out.error_text()));
        }
        self.log_info(&format!("[supervisor] unloaded '{}'", alias));
        Ok(())
    }

    /// Startup discovery: list what is offered and loaded, and pick a model.
    pub async fn discover(&self, cancel: &CancellationToken) -> Result<Discovery, LifecycleError> {
        let endpoint = self.service_status(cancel).await?;

        let mut available = self.list_available(cancel).await?;
        for default in &self.config.default_aliases {
            if !available.iter().any(|a| a.eq_ignore_ascii_case(default)) {
                available.push(default.clone());
            }
        }

        let loaded = if endpoint.is_running {
            self.list_loaded(cancel).await?
        } else {
            Vec::new()
        };

        let matched = alias_match::reconcile(&mut available, &loaded, &self.config.alias_matching);
        if let Some(m) = &matched {
            log::info!("[supervisor] loaded model matches '{}' ({:?})", m.alias, m.rule);
        }
        let selected = matched
            .as_ref()
            .map(|m| m.alias.clone())
            .or_else(|| self.config.default_model.clone())
            .or_else(|| available.first().cloned());

        Ok(Discovery {
            endpoint,
            available,
            loaded,
            matched,
            selected,
        })
    }

    fn set_endpoint(&self, endpoint: Option<ServiceEndpoint>) {
        let url = endpoint.as_ref().and_then(|e| e.url.clone());
        self.api.set_base_url(url);
        *self.endpoint.lock().unwrap_or_else(|p| p.into_inner()) = endpoint;
    }

    fn mark_active(&self, alias: &str, runtime_id: Option<&str>) {
        if let Some(id) = runtime_id {
            self.runtime_ids
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(alias.to_ascii_lowercase(), id.to_string());
        }
        *self.active.lock().unwrap_or_else(|p| p.into_inner()) = Some(alias.to_string());
        self.log_info(&format!("[supervisor] active model '{}' ({})", alias, runtime_id.unwrap_or("no runtime id")));
    }

    /// Drop everything known about `alias` being loaded.
    fn forget_alias(&self, alias: &str) {
        self.runtime_ids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&alias.to_ascii_lowercase());
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if active.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(alias)) {
            *active = None;
        }
    }

    fn clear_runtime_ids(&self) {
        self.runtime_ids.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn cached_runtime_id(&self, alias: &str) -> Option<String> {
        self.runtime_ids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&alias.to_ascii_lowercase())
            .cloned()
    }

    fn log_info(&self, message: &str) {
        log::info!("{}", message);
        if let Some(sink) = &self.sink {
            sink.info(message);
        }
    }
}

#[async_trait]
impl RuntimeResolver for Supervisor {
    /// Cached id, else the `Model ID` column of the loaded report, else the
    /// service's own model listing.
    async fn resolve_runtime_id(&self, alias: &str, cancel: &CancellationToken) -> Option<String> {
        if let Some(id) = self.cached_runtime_id(alias) {
            return Some(id);
        }

        let running = self.list_running(cancel).await.ok()?;
        let loaded: Vec<String> = running.iter().map(|m| m.alias.clone()).collect();
        let from_report = alias_match::find_loaded(alias, &loaded, &self.config.alias_matching)
            .and_then(|name| running.iter().find(|m| m.alias == name))
            .and_then(|m| m.model_id.clone());

        let resolved = match from_report {
            Some(id) => Some(id),
            None => match self.api.list_model_ids(self.config.status_timeout(), cancel).await {
                Ok(ids) => pick_runtime_id(alias, &ids),
                Err(e) => {
                    log::debug!("[supervisor] model listing failed while resolving '{}': {}", alias, e);
                    None
                }
            },
        };

        if let Some(id) = &resolved {
            self.runtime_ids
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(alias.to_ascii_lowercase(), id.clone());
        }
        resolved
    }
}

fn combined_text(out: &CommandOutput) -> String {
    cli_output::strip_ansi(&format!("{}\n{}", out.stdout, out.stderr))
}

/// Best listed id for `alias`: equal, then prefixed by, then containing it.
pub fn pick_runtime_id(alias: &str, ids: &[String]) -> Option<String> {
    let alias = alias.to_ascii_lowercase();
    if alias.is_empty() {
        return None;
    }
    let lowered: Vec<String> = ids.iter().map(|i| i.to_ascii_lowercase()).collect();
    let pick = |pred: &dyn Fn(&str) -> bool| {
        lowered
            .iter()
            .position(|i| pred(i.as_str()))
            .map(|i| ids[i].clone())
    };
    pick(&|i: &str| i == alias)
        .or_else(|| pick(&|i: &str| i.starts_with(alias.as_str())))
        .or_else(|| pick(&|i: &str| i.contains(alias.as_str())))
}
