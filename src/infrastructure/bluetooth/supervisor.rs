//! Connection Supervisor
//!
//! Owns the retry policy around [`ConnectionSession`] attempts, the data
//! watchdog and the per-connection [`FramePipeline`]. It performs no I/O of
//! its own: every input (transport callback, timer wakeup, watchdog tick,
//! user command) is handed to it by [`super::service::LinkService`], which
//! serializes them behind one lock.

use crate::domain::models::{ConnectionState, LinkEvent, SessionFailure};
use crate::domain::pipeline::{FrameEvent, FramePipeline, FramingConfig};
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::session::{
    ConnectionSession, LinkHandles, SessionConfig, SessionPlan, SessionProgress,
};
use crate::infrastructure::bluetooth::transport::{
    Completion, Epoch, RadioStatus, Transport, TransportEvent,
};
use anyhow::Result;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupKind {
    /// Backoff elapsed; start the pending session.
    Retry,
    /// Scanning has run for too long.
    DiscoveryDeadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup {
    pub epoch: Epoch,
    pub kind: WakeupKind,
}

/// Deferred delivery of a [`Wakeup`] back into the supervisor.
pub trait Timer: Send + Sync {
    fn schedule(&self, delay: Duration, wakeup: Wakeup);
}

/// Outcome of one watchdog poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Not connected, nothing to watch.
    Idle,
    Healthy,
    /// Past the soft threshold.
    Stalled,
    /// Past the hard threshold; the link was recycled.
    Expired,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub session: SessionConfig,
    pub framing: FramingConfig,
    pub data_timeout_warn: Duration,
    pub data_timeout_disconnect: Duration,
    /// How often the service polls [`ConnectionSupervisor::on_watchdog_tick`].
    pub watchdog_poll: Duration,
    pub reconnect_delay: Duration,
    pub discovery_timeout: Duration,
    pub max_connection_attempts: Option<u32>,
    pub auto_reconnect: bool,
    pub forward_raw_data: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            framing: FramingConfig::default(),
            data_timeout_warn: Duration::from_millis(200),
            data_timeout_disconnect: Duration::from_millis(3000),
            watchdog_poll: Duration::from_millis(100),
            reconnect_delay: Duration::from_millis(3000),
            discovery_timeout: Duration::from_secs(300),
            max_connection_attempts: None,
            auto_reconnect: false,
            forward_raw_data: false,
        }
    }
}

impl TryFrom<&LinkSettings> for SupervisorConfig {
    type Error = anyhow::Error;

    fn try_from(link: &LinkSettings) -> Result<Self> {
        Ok(Self {
            session: SessionConfig::from_uuids(
                &link.service_uuid,
                &link.data_char_uuid,
                &link.pairing_pin,
                link.require_encrypted_pairing,
            )?,
            framing: FramingConfig {
                ring_capacity: link.ring_capacity,
                signature: link.signature(),
                hits_to_align: link.hits_to_align,
                max_align_attempts: link.max_align_attempts,
                max_backlog: link.max_backlog,
            },
            data_timeout_warn: Duration::from_millis(link.data_timeout_warn_ms),
            data_timeout_disconnect: Duration::from_millis(link.data_timeout_disconnect_ms),
            watchdog_poll: Duration::from_millis(link.watchdog_poll_ms),
            reconnect_delay: Duration::from_millis(link.reconnect_delay_ms),
            discovery_timeout: Duration::from_millis(link.discovery_timeout_ms),
            max_connection_attempts: link.max_connection_attempts,
            auto_reconnect: link.auto_reconnect,
            forward_raw_data: link.forward_raw_data,
        })
    }
}

enum Phase {
    Idle,
    Connecting(ConnectionSession),
    RetryPending(SessionPlan),
    Connected {
        link: LinkHandles,
        pipeline: FramePipeline,
        last_data: Instant,
        warned: bool,
    },
}

pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    transport: Arc<dyn Transport>,
    timer: Arc<dyn Timer>,
    events: mpsc::UnboundedSender<LinkEvent>,
    epoch: Epoch,
    phase: Phase,
    state: ConnectionState,
    retry_attempts: u32,
}

impl ConnectionSupervisor {
    pub fn new(
        config: SupervisorConfig,
        transport: Arc<dyn Transport>,
        timer: Arc<dyn Timer>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            config,
            transport,
            timer,
            events,
            epoch: Epoch::default(),
            phase: Phase::Idle,
            state: ConnectionState::Disconnected,
            retry_attempts: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected { .. })
    }

    /// Failed attempts since the last successful connection.
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    #[cfg(test)]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Start discovery. Does nothing unless idle.
    pub fn connect(&mut self) {
        if !matches!(self.phase, Phase::Idle) {
            debug!(state = ?self.state, "Connect ignored, link already active");
            return;
        }
        info!("Connecting to gesture remote");
        self.retry_attempts = 0;
        self.start_session(SessionPlan::Discover);
    }

    /// Tear everything down and stay disconnected.
    pub fn disconnect(&mut self) {
        let was_connected = match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => return,
            Phase::Connecting(mut session) => {
                session.abort(self.transport.as_ref());
                if let Some(connection) = session.connection() {
                    self.transport.close(connection);
                }
                false
            }
            Phase::RetryPending(_) => false,
            Phase::Connected { link, .. } => {
                self.transport.close(link.connection);
                true
            }
        };

        info!("Disconnecting from gesture remote");
        self.epoch = self.epoch.next();
        self.retry_attempts = 0;
        self.sync_state();
        if was_connected {
            self.emit(LinkEvent::Disconnected);
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        let epoch = match &event {
            TransportEvent::Completed { epoch, .. }
            | TransportEvent::ValueChanged { epoch, .. }
            | TransportEvent::StatusChanged { epoch, .. } => *epoch,
        };
        if epoch != self.epoch {
            debug!(%epoch, current = %self.epoch, "Dropping stale transport callback");
            // A connect that finished after its session was abandoned still
            // holds the radio link.
            if let TransportEvent::Completed {
                completion: Completion::Connected(Ok(connection)),
                ..
            } = event
            {
                self.transport.close(connection);
            }
            return;
        }

        match event {
            TransportEvent::Completed { completion, .. } => {
                let progress = match &mut self.phase {
                    Phase::Connecting(session) => {
                        session.advance(self.transport.as_ref(), completion)
                    }
                    _ => {
                        debug!(
                            completion = completion.name(),
                            "Completion arrived with no session in flight"
                        );
                        return;
                    }
                };
                match progress {
                    SessionProgress::Pending => self.sync_state(),
                    SessionProgress::Established(link) => self.on_established(link, now),
                    SessionProgress::Failed(failure) => self.on_session_failed(failure),
                }
            }
            TransportEvent::ValueChanged { bytes, .. } => self.on_value_changed(bytes, now),
            TransportEvent::StatusChanged { status, .. } => match status {
                RadioStatus::Connected => debug!("Radio reports connected"),
                RadioStatus::Disconnected => self.on_radio_lost(),
            },
        }
    }

    pub fn on_wakeup(&mut self, wakeup: Wakeup) {
        if wakeup.epoch != self.epoch {
            debug!(?wakeup, current = %self.epoch, "Dropping stale wakeup");
            return;
        }

        match wakeup.kind {
            WakeupKind::Retry => {
                if let Phase::RetryPending(plan) = self.phase {
                    info!(attempt = self.retry_attempts + 1, "Retrying connection");
                    self.start_session(plan);
                }
            }
            WakeupKind::DiscoveryDeadline => {
                let failure = match &mut self.phase {
                    Phase::Connecting(session) => {
                        session.expire_discovery(self.transport.as_ref())
                    }
                    _ => None,
                };
                if let Some(failure) = failure {
                    self.on_session_failed(failure);
                }
            }
        }
    }

    pub fn on_watchdog_tick(&mut self, now: Instant) -> WatchdogVerdict {
        let soft = self.config.data_timeout_warn;
        let hard = self.config.data_timeout_disconnect;

        let Phase::Connected {
            last_data, warned, ..
        } = &mut self.phase
        else {
            return WatchdogVerdict::Idle;
        };

        let silence = now.saturating_duration_since(*last_data);
        if silence >= hard {
            error!(
                silence_ms = silence.as_millis() as u64,
                "No data from remote, reconnecting"
            );
            self.disconnect();
            self.connect();
            WatchdogVerdict::Expired
        } else if silence >= soft {
            if !*warned {
                warn!(
                    silence_ms = silence.as_millis() as u64,
                    "Data stream stalled"
                );
                *warned = true;
            }
            WatchdogVerdict::Stalled
        } else {
            WatchdogVerdict::Healthy
        }
    }

    fn start_session(&mut self, plan: SessionPlan) {
        self.epoch = self.epoch.next();
        let mut session = ConnectionSession::new(self.epoch, plan, self.config.session.clone());
        session.start(self.transport.as_ref());
        if plan == SessionPlan::Discover {
            self.timer.schedule(
                self.config.discovery_timeout,
                Wakeup {
                    epoch: self.epoch,
                    kind: WakeupKind::DiscoveryDeadline,
                },
            );
        }
        self.phase = Phase::Connecting(session);
        self.sync_state();
    }

    fn on_established(&mut self, link: LinkHandles, now: Instant) {
        info!(device = %link.device, "Gesture remote connected");
        self.phase = Phase::Connected {
            link,
            pipeline: FramePipeline::new(&self.config.framing),
            last_data: now,
            warned: false,
        };
        self.retry_attempts = 0;
        self.sync_state();
        self.emit(LinkEvent::Connected);
    }

    fn on_session_failed(&mut self, failure: SessionFailure) {
        let (device, connection) = match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connecting(session) => (session.device(), session.connection()),
            _ => (None, None),
        };
        if let Some(connection) = connection {
            self.transport.close(connection);
        }

        self.epoch = self.epoch.next();
        self.retry_attempts += 1;

        if let Some(max) = self.config.max_connection_attempts {
            if self.retry_attempts >= max {
                error!(
                    attempts = self.retry_attempts,
                    "Giving up on gesture remote: {}", failure
                );
                self.sync_state();
                self.emit(LinkEvent::GaveUp {
                    attempts: self.retry_attempts,
                    reason: failure,
                });
                return;
            }
        }

        let plan = match device {
            Some(address) if failure.is_pairing() => SessionPlan::Reconnect(address),
            _ => SessionPlan::Discover,
        };
        info!(
            attempts = self.retry_attempts,
            ?plan,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.phase = Phase::RetryPending(plan);
        self.timer.schedule(
            self.config.reconnect_delay,
            Wakeup {
                epoch: self.epoch,
                kind: WakeupKind::Retry,
            },
        );
        self.sync_state();
    }

    fn on_radio_lost(&mut self) {
        match &mut self.phase {
            Phase::Connecting(session) => {
                let failure = session.link_lost();
                self.on_session_failed(failure);
            }
            Phase::Connected { link, .. } => {
                warn!(device = %link.device, "Gesture remote dropped the connection");
                let connection = link.connection;
                self.phase = Phase::Idle;
                self.transport.close(connection);
                self.epoch = self.epoch.next();
                self.sync_state();
                self.emit(LinkEvent::Disconnected);
                if self.config.auto_reconnect {
                    self.connect();
                }
            }
            Phase::Idle | Phase::RetryPending(_) => {}
        }
    }

    fn on_value_changed(&mut self, bytes: Vec<u8>, now: Instant) {
        let Phase::Connected {
            pipeline,
            last_data,
            warned,
            ..
        } = &mut self.phase
        else {
            debug!(len = bytes.len(), "Data arrived while not connected");
            return;
        };

        *last_data = now;
        *warned = false;
        let frames = pipeline.ingest(&bytes);

        if self.config.forward_raw_data {
            self.emit(LinkEvent::DataReceived(bytes));
        }
        for frame in frames {
            self.emit(match frame {
                FrameEvent::Aligned => LinkEvent::Aligned,
                FrameEvent::Misaligned => LinkEvent::Misaligned,
                FrameEvent::Packet(packet) => LinkEvent::PacketReady(packet),
            });
        }
    }

    fn sync_state(&mut self) {
        let state = match &self.phase {
            Phase::Idle | Phase::RetryPending(_) => ConnectionState::Disconnected,
            Phase::Connecting(session) => session.state(),
            Phase::Connected { .. } => ConnectionState::Connected,
        };
        if state != self.state {
            debug!(from = ?self.state, to = ?state, "Connection state changed");
            self.state = state;
            self.emit(LinkEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("Link event receiver dropped");
        }
    }

    /// Address of the device behind the current link or pending reconnect.
    #[cfg(test)]
    pub fn device(&self) -> Option<crate::infrastructure::bluetooth::transport::DeviceAddress> {
        match &self.phase {
            Phase::Connecting(session) => session.device(),
            Phase::RetryPending(SessionPlan::Reconnect(address)) => Some(*address),
            Phase::Connected { link, .. } => Some(link.device),
            Phase::Idle | Phase::RetryPending(SessionPlan::Discover) => None,
        }
    }
}
