//! Command Executor
//!
//! Callers enqueue [`Command`]s without waiting; a single task drains the
//! queue and runs each command to completion before taking the next, so at
//! most one GATT operation is ever outstanding.
//!
//! A command whose precondition does not hold when it reaches the head of
//! the queue is dropped, and a command that fails is logged and forgotten.
//! Callers observe the outcome through state changes only.

use crate::domain::models::{AdapterState, Command, NotificationStream, PeripheralState};
use crate::error::Result;
use crate::infrastructure::bluetooth::connection::Central;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct CommandExecutor {
    central: Arc<Central>,
    enable_notifications: bool,
    connecting: Arc<AtomicBool>,
}

/// Handle to a running executor. Dropping it stops the loop.
pub struct ExecutorHandle {
    tx: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
    central: Arc<Central>,
    connecting: Arc<AtomicBool>,
}

impl ExecutorHandle {
    /// Append a command to the queue. Never blocks.
    pub fn enqueue(&self, command: Command) {
        if let Err(e) = self.tx.send(command) {
            debug!("Executor stopped, discarding {:?}", e.0);
        }
    }

    /// Cancel the loop and wait for it to wind down. Queued commands are
    /// discarded; a connect interrupted while scanning is canceled.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        info!("Stopping command executor");
        task.abort();
        let _ = task.await;
        self.release_scan();
    }

    /// Whether the consumer loop is still alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// The loop owned the connect attempt; an aborted one must not leave
    /// the central scanning.
    fn release_scan(&self) {
        if self.connecting.swap(false, Ordering::SeqCst) && self.central.cancel_connect() {
            debug!("Canceled the scan left by the stopped executor");
        }
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.release_scan();
        }
    }
}

impl CommandExecutor {
    /// `enable_notifications` controls whether a successful connect
    /// subscribes to every available stream.
    pub fn new(central: Arc<Central>, enable_notifications: bool) -> Self {
        Self {
            central,
            enable_notifications,
            connecting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the consumer loop.
    pub fn start(self) -> ExecutorHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let central = self.central.clone();
        let connecting = self.connecting.clone();
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if !self.accepts(&command) {
                    debug!(
                        "Dropping {:?} (adapter {:?}, peripheral {:?})",
                        command,
                        self.central.adapter_state(),
                        self.central.peripheral_state()
                    );
                    continue;
                }
                if let Err(e) = self.execute(&command).await {
                    warn!("Command {:?} failed: {}", command, e);
                }
            }
        });
        ExecutorHandle {
            tx,
            task: Some(task),
            central,
            connecting,
        }
    }

    /// Precondition checked when the command reaches the head of the queue.
    fn accepts(&self, command: &Command) -> bool {
        let adapter = self.central.adapter_state();
        let state = self.central.peripheral_state();
        match command {
            Command::Connect => adapter == AdapterState::PoweredOn && state.can_connect(),
            // Skipped rather than dropped, see `execute`.
            Command::Wait(_) => true,
            _ => state == PeripheralState::Connected,
        }
    }

    async fn execute(&self, command: &Command) -> Result<()> {
        let central = &self.central;
        match command {
            Command::Connect => {
                self.connecting.store(true, Ordering::SeqCst);
                let connected = central.connect().await;
                self.connecting.store(false, Ordering::SeqCst);
                let peripheral = connected?;
                info!("Connected to {} ({})", peripheral.name, peripheral.id);
                if self.enable_notifications {
                    self.enable_streams().await?;
                }
                Ok(())
            }
            Command::Disconnect => central.disconnect().await,
            Command::SetPeriod { sensor, period_ms } => {
                central.set_period(*sensor, *period_ms).await
            }
            Command::DisplayMatrix(rows) => central.write_led_matrix(rows).await,
            Command::DisplayText(text) => central.write_led_text(text).await,
            Command::SetScrollDelay(delay_ms) => central.write_scroll_delay(*delay_ms).await,
            Command::ConfigurePins(configuration) => central.configure_pins(configuration).await,
            Command::Output(output) => central.output(output).await,
            Command::Wait(ms) => {
                if central.peripheral_state() == PeripheralState::Connected {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                } else {
                    debug!("Skipping wait of {} ms, not connected", ms);
                }
                Ok(())
            }
        }
    }

    async fn enable_streams(&self) -> Result<()> {
        let services = self.central.available_services();
        for stream in NotificationStream::ALL {
            if services.contains(&stream.service()) {
                self.central.set_notify(stream.characteristic(), true).await?;
            }
        }
        Ok(())
    }
}
