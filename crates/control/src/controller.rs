use std::sync::Arc;

use listener::ResponseListener;
use serde_json::{Map, Value};
use shared::{domain::CommandKind, error::ListenerError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    config::{ApparatusConfig, Settings},
    process::ProcessManager,
    registry::{ConfigSaver, Logbook, RunNumberSource},
    tree::{Apparatus, BroadcastReport, InvalidTransition, NodeStatus, UnknownPath},
};

pub const METHOD_RUNTIME_START: &str = "runtime_start";
pub const METHOD_RUNTIME_RESUME: &str = "runtime_resume";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error(transparent)]
    UnknownPath(#[from] UnknownPath),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("run number allocation failed: {0}")]
    RunNumber(String),
    #[error("configuration snapshot failed before '{command}': {reason}")]
    Snapshot {
        command: CommandKind,
        reason: String,
    },
}

/// The sole entry point for surrounding layers. Checks transition legality
/// before anything touches the network, wraps the run-lifecycle side effects
/// that happen around the tree, and keeps the last aggregate result.
pub struct Controller {
    settings: Settings,
    apparatus: Apparatus,
    listener: Option<Arc<ResponseListener>>,
    process_manager: Arc<dyn ProcessManager>,
    run_numbers: Arc<dyn RunNumberSource>,
    config_saver: Arc<dyn ConfigSaver>,
    logbook: Arc<dyn Logbook>,
    operator: String,
    run: Option<u32>,
    last_report: Option<BroadcastReport>,
}

impl Controller {
    pub fn new(
        settings: Settings,
        config: &ApparatusConfig,
        process_manager: Arc<dyn ProcessManager>,
        run_numbers: Arc<dyn RunNumberSource>,
        config_saver: Arc<dyn ConfigSaver>,
        logbook: Arc<dyn Logbook>,
    ) -> Self {
        let apparatus = Apparatus::from_config(config);
        info!(apparatus = %apparatus.apparatus_id(), "controller ready");
        Self {
            settings,
            apparatus,
            listener: None,
            process_manager,
            run_numbers,
            config_saver,
            logbook,
            operator: "anonymous".to_string(),
            run: None,
            last_report: None,
        }
    }

    pub fn apparatus_id(&self) -> &str {
        self.apparatus.apparatus_id()
    }

    pub fn run_number(&self) -> Option<u32> {
        self.run
    }

    pub fn last_report(&self) -> Option<&BroadcastReport> {
        self.last_report.as_ref()
    }

    pub fn status(&self) -> NodeStatus {
        self.apparatus.status()
    }

    pub fn set_operator(&mut self, operator: impl Into<String>) {
        self.operator = operator.into();
        info!(operator = %self.operator, "operator changed");
    }

    /// Spawns the whole apparatus through the process manager. The response
    /// listener comes up with the first boot and stays bound until
    /// `terminate`.
    pub async fn boot(&mut self) -> Result<BroadcastReport, DispatchError> {
        let selection = self.apparatus.select(None)?;
        self.apparatus.gate(&selection, CommandKind::Boot)?;
        let listener = self.ensure_listener().await?;
        let pm = self.process_manager.clone();
        let report = self
            .apparatus
            .boot(
                &selection,
                pm.as_ref(),
                &listener,
                self.settings.command_timeout,
                self.settings.answer_host.as_deref(),
                self.settings.proxy.as_deref(),
            )
            .await;
        Ok(self.remember(report))
    }

    pub async fn init(&mut self, path: Option<&str>) -> Result<BroadcastReport, DispatchError> {
        self.dispatch(path, CommandKind::Init, Map::new(), false)
            .await
    }

    pub async fn conf(&mut self, path: Option<&str>) -> Result<BroadcastReport, DispatchError> {
        self.dispatch(path, CommandKind::Conf, Map::new(), false)
            .await
    }

    /// Starts a run: allocates the run number, makes a best-effort logbook
    /// entry, persists the configuration snapshot (failure aborts before any
    /// application is touched), then broadcasts.
    pub async fn start(
        &mut self,
        run_type: &str,
        disable_data_storage: bool,
        message: &str,
    ) -> Result<BroadcastReport, DispatchError> {
        let selection = self.apparatus.select(None)?;
        self.apparatus.gate(&selection, CommandKind::Start)?;

        let run = self
            .run_numbers
            .next_run_number()
            .await
            .map_err(|e| DispatchError::RunNumber(e.to_string()))?;
        self.run = Some(run);

        if !message.is_empty() {
            if let Err(err) = self
                .logbook
                .message_on_start(message, run, run_type, &self.operator)
                .await
            {
                error!(error = %err, "logbook entry failed; record the start message manually");
            }
        }

        let mut overwrite = Map::new();
        overwrite.insert(
            "disable_data_storage".to_string(),
            Value::Bool(disable_data_storage),
        );
        overwrite.insert("run".to_string(), Value::from(run));

        let saved = self
            .config_saver
            .save_on_start(
                &self.apparatus.status(),
                run,
                run_type,
                &overwrite,
                METHOD_RUNTIME_START,
            )
            .await
            .map_err(|e| DispatchError::Snapshot {
                command: CommandKind::Start,
                reason: e.to_string(),
            })?;
        info!(run, path = %saved.display(), "run configuration saved");

        let report = self
            .apparatus
            .broadcast(
                &selection,
                CommandKind::Start,
                overwrite,
                self.settings.command_timeout,
                false,
            )
            .await;
        if report.all_ok() {
            info!(run, "started run");
        } else {
            warn!(run, "start finished with failures");
        }
        Ok(self.remember(report))
    }

    pub async fn pause(&mut self, force: bool) -> Result<BroadcastReport, DispatchError> {
        self.dispatch(None, CommandKind::Pause, Map::new(), force)
            .await
    }

    /// Resume persists a snapshot of the overridden configuration first,
    /// same fail-fast rule as start.
    pub async fn resume(
        &mut self,
        trigger_interval_ticks: Option<u64>,
    ) -> Result<BroadcastReport, DispatchError> {
        let selection = self.apparatus.select(None)?;
        self.apparatus.gate(&selection, CommandKind::Resume)?;

        let mut overwrite = Map::new();
        if let Some(ticks) = trigger_interval_ticks {
            overwrite.insert("trigger_interval_ticks".to_string(), Value::from(ticks));
        }

        self.config_saver
            .save_on_resume(&self.apparatus.status(), &overwrite, METHOD_RUNTIME_RESUME)
            .await
            .map_err(|e| DispatchError::Snapshot {
                command: CommandKind::Resume,
                reason: e.to_string(),
            })?;

        let report = self
            .apparatus
            .broadcast(
                &selection,
                CommandKind::Resume,
                overwrite,
                self.settings.command_timeout,
                false,
            )
            .await;
        Ok(self.remember(report))
    }

    /// Stop is a shutdown-style command: `force` lets the broadcast proceed
    /// past stuck applications. The stop marker is recorded only after the
    /// whole subtree stopped cleanly.
    pub async fn stop(
        &mut self,
        force: bool,
        message: &str,
    ) -> Result<BroadcastReport, DispatchError> {
        let selection = self.apparatus.select(None)?;
        self.apparatus.gate(&selection, CommandKind::Stop)?;

        if !message.is_empty() {
            if let Err(err) = self.logbook.message_on_stop(message, &self.operator).await {
                error!(error = %err, "logbook entry failed; record the stop message manually");
            }
        }

        let report = self
            .apparatus
            .broadcast(
                &selection,
                CommandKind::Stop,
                Map::new(),
                self.settings.command_timeout,
                force,
            )
            .await;

        if report.all_ok() {
            if let Some(run) = self.run.take() {
                match self.config_saver.save_on_stop(run).await {
                    Ok(path) => info!(run, path = %path.display(), "stop marker recorded"),
                    Err(err) => error!(error = %err, run, "failed to record the stop marker"),
                }
                info!(run, "stopped run");
            }
        }
        Ok(self.remember(report))
    }

    pub async fn scrap(
        &mut self,
        path: Option<&str>,
        force: bool,
    ) -> Result<BroadcastReport, DispatchError> {
        self.dispatch(path, CommandKind::Scrap, Map::new(), force)
            .await
    }

    /// Kills the applications through the process manager and tears the
    /// response listener down; the subsystem structure itself survives.
    pub async fn terminate(&mut self) -> Result<BroadcastReport, DispatchError> {
        let selection = self.apparatus.select(None)?;
        self.apparatus.gate(&selection, CommandKind::Terminate)?;
        let pm = self.process_manager.clone();
        let report = self.apparatus.terminate_apps(&selection, pm.as_ref()).await;

        if let Some(shared) = self.listener.take() {
            match Arc::try_unwrap(shared) {
                Ok(mut exclusive) => exclusive.terminate().await,
                Err(still_shared) => {
                    warn!("response listener still shared after terminate; dropping without drain");
                    drop(still_shared);
                }
            }
        }
        Ok(self.remember(report))
    }

    /// Free-form logbook append, best effort like the run-lifecycle entries.
    pub async fn message(&self, message: &str) {
        if message.is_empty() {
            return;
        }
        if let Err(err) = self.logbook.add_message(message, &self.operator).await {
            error!(error = %err, "logbook entry failed; record the message manually");
        }
    }

    async fn dispatch(
        &mut self,
        path: Option<&str>,
        command: CommandKind,
        data: Map<String, Value>,
        force: bool,
    ) -> Result<BroadcastReport, DispatchError> {
        let selection = self.apparatus.select(path)?;
        self.apparatus.gate(&selection, command)?;
        let report = self
            .apparatus
            .broadcast(
                &selection,
                command,
                data,
                self.settings.command_timeout,
                force,
            )
            .await;
        Ok(self.remember(report))
    }

    async fn ensure_listener(&mut self) -> Result<Arc<ResponseListener>, DispatchError> {
        if let Some(existing) = &self.listener {
            return Ok(existing.clone());
        }
        let bound = Arc::new(ResponseListener::bind(self.settings.listener_port).await?);
        self.listener = Some(bound.clone());
        Ok(bound)
    }

    fn remember(&mut self, report: BroadcastReport) -> BroadcastReport {
        self.last_report = Some(report.clone());
        report
    }

    #[cfg(test)]
    pub(crate) fn apparatus_mut(&mut self) -> &mut Apparatus {
        &mut self.apparatus
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
