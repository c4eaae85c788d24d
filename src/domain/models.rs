use crate::domain::packet::Packet;
use thiserror::Error;

/// Lifecycle of the link to the remote. Advances strictly forward on success;
/// any failure goes back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Pairing,
    Negotiating,
    Connected,
}

/// Protection level negotiated by the pairing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionLevel {
    None,
    Encryption,
    EncryptionAndAuthentication,
}

/// Why a single connection attempt was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFailure {
    #[error("no matching device advertised before the discovery deadline")]
    DiscoveryTimeout,
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("pairing rejected: {0}")]
    PairingRejected(String),
    #[error("paired with protection level {0:?}, expected EncryptionAndAuthentication")]
    PairingWrongProtectionLevel(ProtectionLevel),
    #[error("remote service not found")]
    ServiceNotFound,
    #[error("data characteristic not found")]
    CharacteristicNotFound,
    #[error("characteristic descriptors unavailable")]
    DescriptorNotFound,
    #[error("failed to write notification descriptor")]
    DescriptorWriteFailed,
    #[error("notification descriptor did not read back as Notify")]
    DescriptorVerifyFailed,
    #[error("failed to subscribe to notifications")]
    SubscribeFailed,
    #[error("device dropped the radio link during setup")]
    LinkLost,
}

impl SessionFailure {
    pub fn is_pairing(&self) -> bool {
        matches!(
            self,
            Self::PairingRejected(_) | Self::PairingWrongProtectionLevel(_)
        )
    }
}

/// Events delivered to the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    StateChanged(ConnectionState),
    /// Raw notification payload, only when raw forwarding is enabled.
    DataReceived(Vec<u8>),
    PacketReady(Packet),
    Aligned,
    Misaligned,
    /// Retry ceiling exceeded; the supervisor stays disconnected.
    GaveUp {
        attempts: u32,
        reason: SessionFailure,
    },
}
