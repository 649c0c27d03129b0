//! Drives [`SystemState`] on a timer and serves control commands.
//!
//! The supervisor is a tokio task that owns the tick schedule. Ticks run on the blocking pool
//! since every `tc` operation is a subprocess. Commands from a [`SupervisorHandle`] are served
//! between ticks, so a reload or status request never observes a half-applied tick.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Interval, MissedTickBehavior},
};

use qos_common::status::StatusFile;
use qos_tc::TrafficControl;

use crate::{
    config::QosConfig,
    status::DbaStatus,
    system::{SystemState, TickReport},
    Error,
};

/// How often the status file is refreshed when nothing changes.
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);

const COMMAND_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Where snapshots are written. `None` disables the status file.
    pub status_file: Option<StatusFile>,
    pub status_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self { status_file: None, status_interval: DEFAULT_STATUS_INTERVAL }
    }
}

impl SupervisorOptions {
    pub fn with_status_file(mut self, file: StatusFile) -> Self {
        self.status_file = Some(file);
        self
    }
}

enum Command {
    Status { response: oneshot::Sender<DbaStatus> },
    Reload { config: Box<QosConfig>, response: oneshot::Sender<Result<(), Error>> },
    RunOnce { response: oneshot::Sender<Result<TickReport, Error>> },
    Stop { response: oneshot::Sender<()> },
}

/// A running supervisor task.
#[derive(Debug)]
pub struct Supervisor {
    handle: SupervisorHandle,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Spawns the supervisor on the current runtime. The first tick happens one interval from
    /// now.
    pub fn spawn(
        state: SystemState,
        tc: Arc<dyn TrafficControl>,
        options: SupervisorOptions,
    ) -> Self {
        let (to_driver, from_handle) = mpsc::channel(COMMAND_BUFFER);

        let driver = SupervisorDriver {
            state: Arc::new(Mutex::new(state)),
            tc,
            options,
            from_handle,
            last_status: None,
        };
        let task = tokio::spawn(driver.run());

        Self { handle: SupervisorHandle { to_driver }, task }
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Waits for the supervisor to stop.
    pub async fn join(self) -> Result<(), Error> {
        self.task.await?;
        Ok(())
    }
}

/// Cheap, cloneable access to a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    to_driver: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, Error> {
        let (response, rx) = oneshot::channel();
        self.to_driver.send(command(response)).await.map_err(|_| Error::SupervisorClosed)?;
        rx.await.map_err(|_| Error::SupervisorClosed)
    }

    pub async fn status(&self) -> Result<DbaStatus, Error> {
        self.request(|response| Command::Status { response }).await
    }

    /// Applies a new configuration, keeping in-flight allocations where possible.
    pub async fn reload(&self, config: QosConfig) -> Result<(), Error> {
        self.request(|response| Command::Reload { config: Box::new(config), response }).await?
    }

    /// Runs a tick right away, outside the schedule.
    pub async fn run_once(&self) -> Result<TickReport, Error> {
        self.request(|response| Command::RunOnce { response }).await?
    }

    /// Stops the supervisor. Stopping an already stopped supervisor is not an error.
    pub async fn stop(&self) -> Result<(), Error> {
        match self.request(|response| Command::Stop { response }).await {
            Ok(()) | Err(Error::SupervisorClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct SupervisorDriver {
    state: Arc<Mutex<SystemState>>,
    tc: Arc<dyn TrafficControl>,
    options: SupervisorOptions,
    from_handle: mpsc::Receiver<Command>,
    last_status: Option<Instant>,
}

fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl SupervisorDriver {
    async fn run(mut self) {
        let mut period = self.state.lock().config().tick_interval();
        let mut interval = ticker(period);
        tracing::info!(?period, "supervisor started");
        self.write_status();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "tick failed");
                    }
                }
                command = self.from_handle.recv() => match command {
                    Some(Command::Status { response }) => {
                        let _ = response.send(self.state.lock().snapshot());
                    }
                    Some(Command::RunOnce { response }) => {
                        let _ = response.send(self.tick().await);
                    }
                    Some(Command::Reload { config, response }) => {
                        let result = self.reload(*config).await;
                        let next = self.state.lock().config().tick_interval();
                        if next != period {
                            period = next;
                            interval = ticker(period);
                        }
                        self.write_status();
                        let _ = response.send(result);
                    }
                    Some(Command::Stop { response }) => {
                        self.write_status();
                        let _ = response.send(());
                        break;
                    }
                    None => break,
                }
            }
        }

        tracing::info!("supervisor stopped");
    }

    async fn tick(&mut self) -> Result<TickReport, Error> {
        let state = Arc::clone(&self.state);
        let tc = Arc::clone(&self.tc);

        let report =
            tokio::task::spawn_blocking(move || state.lock().tick(&*tc, Instant::now())).await?;

        for adjustment in &report.adjustments {
            tracing::debug!(?adjustment, "adjustment committed");
        }

        let status_due = self
            .last_status
            .map_or(true, |at| at.elapsed() >= self.options.status_interval);
        if !report.is_empty() || status_due {
            self.write_status();
        }

        Ok(report)
    }

    async fn reload(&mut self, config: QosConfig) -> Result<(), Error> {
        let state = Arc::clone(&self.state);
        let tc = Arc::clone(&self.tc);

        tokio::task::spawn_blocking(move || state.lock().reload(&config, &*tc)).await??;
        Ok(())
    }

    fn write_status(&mut self) {
        let Some(file) = &self.options.status_file else { return };

        let snapshot = self.state.lock().snapshot();
        if let Err(e) = file.write(&snapshot) {
            tracing::warn!(path = %file.path().display(), error = %e, "failed to write status");
        }
        self.last_status = Some(Instant::now());
    }
}
