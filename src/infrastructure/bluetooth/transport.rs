//! Boundary to the platform BLE stack.
//!
//! Every [`Transport`] call is fire-and-forget: it returns immediately and the
//! result arrives later through the [`TransportSink`] as a [`Completion`]
//! tagged with the [`Epoch`] the call was issued under. The supervisor drops
//! anything tagged with an epoch it has moved past, which is how abandoned
//! sessions are cancelled.

use crate::domain::models::ProtectionLevel;
use crate::infrastructure::bluetooth::protocol::NotifyConfig;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Generation counter identifying one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 48-bit Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub u64);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The stack answered with a non-success status.
    #[error("operation returned status {0}")]
    Status(String),
    /// The call itself failed (platform error, device gone, ...).
    #[error("platform error: {0}")]
    Platform(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    AlreadyPaired,
    Paired(ProtectionLevel),
}

/// Result of one outstanding transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Discovered(Result<DeviceAddress, TransportError>),
    Connected(Result<ConnectionHandle, TransportError>),
    Paired(Result<PairingOutcome, TransportError>),
    /// `Ok(None)`: query succeeded but the service is absent.
    Services(Result<Option<ServiceHandle>, TransportError>),
    Characteristics(Result<Option<CharacteristicHandle>, TransportError>),
    Descriptors(Result<(), TransportError>),
    DescriptorWritten(Result<(), TransportError>),
    DescriptorRead(Result<NotifyConfig, TransportError>),
    Subscribed(Result<(), TransportError>),
}

impl Completion {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovered(_) => "discover",
            Self::Connected(_) => "connect",
            Self::Paired(_) => "pair",
            Self::Services(_) => "get_services",
            Self::Characteristics(_) => "get_characteristics",
            Self::Descriptors(_) => "get_descriptors",
            Self::DescriptorWritten(_) => "write_notify_descriptor",
            Self::DescriptorRead(_) => "read_notify_descriptor",
            Self::Subscribed(_) => "subscribe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioStatus {
    Connected,
    Disconnected,
}

/// Callback delivered by the transport on its own execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Completed {
        epoch: Epoch,
        completion: Completion,
    },
    ValueChanged {
        epoch: Epoch,
        bytes: Vec<u8>,
    },
    StatusChanged {
        epoch: Epoch,
        status: RadioStatus,
    },
}

/// Where transports report completions and notifications.
#[derive(Debug, Clone)]
pub struct TransportSink {
    sender: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportSink {
    pub fn new(sender: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { sender }
    }

    pub fn complete(&self, epoch: Epoch, completion: Completion) {
        let _ = self
            .sender
            .send(TransportEvent::Completed { epoch, completion });
    }

    pub fn value_changed(&self, epoch: Epoch, bytes: Vec<u8>) {
        let _ = self.sender.send(TransportEvent::ValueChanged { epoch, bytes });
    }

    pub fn status_changed(&self, epoch: Epoch, status: RadioStatus) {
        let _ = self
            .sender
            .send(TransportEvent::StatusChanged { epoch, status });
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Platform BLE operations used to bring the remote link up.
///
/// Implementations must not block and must not call back into the
/// supervisor synchronously; results go through the sink.
pub trait Transport: Send + Sync {
    /// Watch advertisements until one offers `service`.
    fn discover(&self, epoch: Epoch, service: u128);
    fn stop_discovery(&self);
    fn connect(&self, epoch: Epoch, device: DeviceAddress);
    fn pair(&self, epoch: Epoch, connection: ConnectionHandle, pin: &str);
    fn get_services(&self, epoch: Epoch, connection: ConnectionHandle, service: u128);
    fn get_characteristics(&self, epoch: Epoch, service: ServiceHandle, characteristic: u128);
    fn get_descriptors(&self, epoch: Epoch, characteristic: CharacteristicHandle);
    fn write_notify_descriptor(&self, epoch: Epoch, characteristic: CharacteristicHandle);
    fn read_notify_descriptor(&self, epoch: Epoch, characteristic: CharacteristicHandle);
    /// Arm value-changed and connection-status callbacks for this epoch.
    fn subscribe(
        &self,
        epoch: Epoch,
        connection: ConnectionHandle,
        characteristic: CharacteristicHandle,
    );
    /// Drop subscriptions and release the device. Idempotent.
    fn close(&self, connection: ConnectionHandle);
}
