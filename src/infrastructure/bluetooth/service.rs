//! Link Service
//!
//! Runs a [`ConnectionSupervisor`] on the tokio runtime. Transport callbacks,
//! timer wakeups, the watchdog poll and user commands all go through the
//! same `Mutex`, so framing and connection state are never observed half
//! updated.

use crate::domain::models::LinkEvent;
use crate::infrastructure::bluetooth::supervisor::{
    ConnectionSupervisor, SupervisorConfig, Timer, Wakeup,
};
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent, TransportSink};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Receiving half of the transport callback channel.
pub struct TransportInbox {
    receiver: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Create the channel a transport reports through.
pub fn channel() -> (TransportSink, TransportInbox) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (TransportSink::new(sender), TransportInbox { receiver })
}

/// Timer backed by `tokio::time::sleep`; wakeups come back on a channel.
struct TokioTimer {
    runtime: Handle,
    wakeups: mpsc::UnboundedSender<Wakeup>,
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, wakeup: Wakeup) {
        let wakeups = self.wakeups.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = wakeups.send(wakeup);
        });
    }
}

/// Running link to the gesture remote
pub struct LinkService {
    supervisor: Arc<Mutex<ConnectionSupervisor>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LinkService {
    /// Spawn the dispatcher and watchdog tasks. Must be called from inside a
    /// tokio runtime.
    pub fn start(
        config: SupervisorConfig,
        transport: Arc<dyn Transport>,
        inbox: TransportInbox,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().context("Link service needs a tokio runtime")?;
        let watchdog_poll = config.watchdog_poll;

        let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();
        let timer = Arc::new(TokioTimer {
            runtime: runtime.clone(),
            wakeups: wakeup_tx,
        });
        let supervisor = Arc::new(Mutex::new(ConnectionSupervisor::new(
            config, transport, timer, events,
        )));

        let dispatcher = runtime.spawn(dispatch(Arc::clone(&supervisor), inbox, wakeup_rx));
        let watchdog = runtime.spawn(watchdog(Arc::clone(&supervisor), watchdog_poll));

        info!(
            poll_ms = watchdog_poll.as_millis() as u64,
            "Link service started"
        );
        Ok(Self {
            supervisor,
            tasks: vec![dispatcher, watchdog],
        })
    }

    pub fn connect(&self) -> Result<()> {
        self.supervisor
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?
            .connect();
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.supervisor
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?
            .disconnect();
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor
            .lock()
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn state(&self) -> Result<crate::domain::models::ConnectionState> {
        let supervisor = self
            .supervisor
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        Ok(supervisor.state())
    }

    pub fn retry_attempts(&self) -> Result<u32> {
        let supervisor = self
            .supervisor
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        Ok(supervisor.retry_attempts())
    }

    /// Disconnect and stop the background tasks.
    pub fn shutdown(mut self) -> Result<()> {
        let result = self.disconnect();
        self.stop_tasks();
        result
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for LinkService {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

async fn dispatch(
    supervisor: Arc<Mutex<ConnectionSupervisor>>,
    mut inbox: TransportInbox,
    mut wakeups: mpsc::UnboundedReceiver<Wakeup>,
) {
    loop {
        tokio::select! {
            Some(event) = inbox.receiver.recv() => {
                let Ok(mut supervisor) = supervisor.lock() else {
                    error!("Link supervisor lock poisoned, stopping dispatcher");
                    break;
                };
                supervisor.handle_transport_event(event, Instant::now());
            }
            Some(wakeup) = wakeups.recv() => {
                let Ok(mut supervisor) = supervisor.lock() else {
                    error!("Link supervisor lock poisoned, stopping dispatcher");
                    break;
                };
                supervisor.on_wakeup(wakeup);
            }
            else => break,
        }
    }
    debug!("Link dispatcher stopped");
}

async fn watchdog(supervisor: Arc<Mutex<ConnectionSupervisor>>, poll: Duration) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Ok(mut supervisor) = supervisor.lock() else {
            error!("Link supervisor lock poisoned, stopping watchdog");
            break;
        };
        supervisor.on_watchdog_tick(Instant::now());
    }
}
