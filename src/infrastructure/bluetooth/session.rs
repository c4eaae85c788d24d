//! BLE Connection Session
//!
//! One attempt to bring the remote from nothing to a subscribed data
//! characteristic. The attempt is a fixed pipeline of transport calls; the
//! session issues one call, waits for its [`Completion`], then either issues
//! the next call or gives up with a [`SessionFailure`]. Retrying is the
//! supervisor's job.

use crate::domain::models::{ConnectionState, ProtectionLevel, SessionFailure};
use crate::infrastructure::bluetooth::protocol::{self, NotifyConfig};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, Completion, ConnectionHandle, DeviceAddress, Epoch, PairingOutcome,
    ServiceHandle, Transport,
};
use anyhow::Result;
use tracing::{error, info, warn};

/// Configuration for a connection attempt
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service UUID to look for
    pub service_uuid: u128,
    /// Data characteristic UUID
    pub data_char_uuid: u128,
    /// PIN offered when the device asks for one
    pub pairing_pin: String,
    /// Fail pairing unless it ends with EncryptionAndAuthentication
    pub require_encrypted_pairing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::uuid_from_short_id(0xffe0),
            data_char_uuid: protocol::uuid_from_short_id(0xffe1),
            pairing_pin: "605011".to_string(),
            require_encrypted_pairing: true,
        }
    }
}

impl SessionConfig {
    pub fn from_uuids(
        service_uuid: &str,
        data_char_uuid: &str,
        pairing_pin: &str,
        require_encrypted_pairing: bool,
    ) -> Result<Self> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(service_uuid)?,
            data_char_uuid: protocol::parse_uuid(data_char_uuid)?,
            pairing_pin: pairing_pin.to_string(),
            require_encrypted_pairing,
        })
    }
}

/// Where a session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPlan {
    /// Scan for an advertisement offering the service.
    Discover,
    /// Address already known; go straight to connecting.
    Reconnect(DeviceAddress),
}

/// Everything a subscribed link needs to be torn down again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHandles {
    pub device: DeviceAddress,
    pub connection: ConnectionHandle,
    pub service: ServiceHandle,
    pub characteristic: CharacteristicHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionProgress {
    /// A transport call is outstanding.
    Pending,
    Established(LinkHandles),
    Failed(SessionFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    Descriptors,
    WriteDescriptor,
    VerifyDescriptor,
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    Discovering,
    Connecting(DeviceAddress),
    Pairing(DeviceAddress, ConnectionHandle),
    Services(DeviceAddress, ConnectionHandle),
    Characteristics(DeviceAddress, ConnectionHandle, ServiceHandle),
    Negotiating(Negotiation, LinkHandles),
    Finished,
}

pub struct ConnectionSession {
    epoch: Epoch,
    plan: SessionPlan,
    config: SessionConfig,
    step: Step,
    device: Option<DeviceAddress>,
    connection: Option<ConnectionHandle>,
}

impl ConnectionSession {
    pub fn new(epoch: Epoch, plan: SessionPlan, config: SessionConfig) -> Self {
        let device = match plan {
            SessionPlan::Discover => None,
            SessionPlan::Reconnect(address) => Some(address),
        };
        Self {
            epoch,
            plan,
            config,
            step: Step::Idle,
            device,
            connection: None,
        }
    }

    /// Device address, once discovered or when reconnecting.
    pub fn device(&self) -> Option<DeviceAddress> {
        self.device
    }

    /// Radio connection opened by this session, if it got that far.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.connection
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.step == Step::Finished
    }

    pub fn state(&self) -> ConnectionState {
        match self.step {
            Step::Idle | Step::Finished => ConnectionState::Disconnected,
            Step::Discovering => ConnectionState::Scanning,
            Step::Connecting(_) => ConnectionState::Connecting,
            Step::Pairing(..) => ConnectionState::Pairing,
            Step::Services(..) | Step::Characteristics(..) | Step::Negotiating(..) => {
                ConnectionState::Negotiating
            }
        }
    }

    /// Issue the first transport call.
    pub fn start(&mut self, transport: &dyn Transport) {
        match self.plan {
            SessionPlan::Discover => {
                info!(epoch = %self.epoch, "Watching for BLE device advertisements...");
                self.step = Step::Discovering;
                transport.discover(self.epoch, self.config.service_uuid);
            }
            SessionPlan::Reconnect(device) => self.connect(transport, device),
        }
    }

    /// Feed the result of the outstanding call and issue the next one.
    pub fn advance(&mut self, transport: &dyn Transport, completion: Completion) -> SessionProgress {
        let epoch = self.epoch;

        match (self.step, completion) {
            (Step::Discovering, Completion::Discovered(result)) => match result {
                Ok(device) => {
                    info!(%device, "Found device with matching service!");
                    self.connect(transport, device);
                    SessionProgress::Pending
                }
                Err(e) => self.fail(SessionFailure::DiscoveryFailed(e.to_string())),
            },

            (Step::Connecting(device), Completion::Connected(result)) => match result {
                Ok(connection) => {
                    info!(%device, "Device connected");
                    self.connection = Some(connection);
                    self.step = Step::Pairing(device, connection);
                    transport.pair(epoch, connection, &self.config.pairing_pin);
                    SessionProgress::Pending
                }
                Err(e) => self.fail(SessionFailure::ConnectFailed(e.to_string())),
            },

            (Step::Pairing(device, connection), Completion::Paired(result)) => match result {
                Ok(PairingOutcome::AlreadyPaired) => {
                    info!("Device already paired");
                    self.fetch_services(transport, device, connection)
                }
                Ok(PairingOutcome::Paired(level)) => {
                    if level != ProtectionLevel::EncryptionAndAuthentication {
                        if self.config.require_encrypted_pairing {
                            return self.fail(SessionFailure::PairingWrongProtectionLevel(level));
                        }
                        warn!(
                            ?level,
                            "Paired with incorrect protection level. Likely unable to receive data..."
                        );
                    } else {
                        info!("Pairing successful");
                    }
                    self.fetch_services(transport, device, connection)
                }
                Err(e) => self.fail(SessionFailure::PairingRejected(e.to_string())),
            },

            (Step::Services(device, connection), Completion::Services(result)) => match result {
                Ok(Some(service)) => {
                    info!("Found remote service");
                    self.step = Step::Characteristics(device, connection, service);
                    transport.get_characteristics(epoch, service, self.config.data_char_uuid);
                    SessionProgress::Pending
                }
                Ok(None) => self.fail(SessionFailure::ServiceNotFound),
                Err(e) => {
                    error!("Unable to fetch service: {}", e);
                    self.fail(SessionFailure::ServiceNotFound)
                }
            },

            (
                Step::Characteristics(device, connection, service),
                Completion::Characteristics(result),
            ) => match result {
                Ok(Some(characteristic)) => {
                    info!("Found data characteristic");
                    let link = LinkHandles {
                        device,
                        connection,
                        service,
                        characteristic,
                    };
                    self.step = Step::Negotiating(Negotiation::Descriptors, link);
                    transport.get_descriptors(epoch, characteristic);
                    SessionProgress::Pending
                }
                Ok(None) => self.fail(SessionFailure::CharacteristicNotFound),
                Err(e) => {
                    error!("Unable to fetch characteristics: {}", e);
                    self.fail(SessionFailure::CharacteristicNotFound)
                }
            },

            (
                Step::Negotiating(Negotiation::Descriptors, link),
                Completion::Descriptors(result),
            ) => match result {
                Ok(()) => {
                    self.step = Step::Negotiating(Negotiation::WriteDescriptor, link);
                    transport.write_notify_descriptor(epoch, link.characteristic);
                    SessionProgress::Pending
                }
                Err(e) => {
                    error!("Unable to fetch descriptors: {}", e);
                    self.fail(SessionFailure::DescriptorNotFound)
                }
            },

            (
                Step::Negotiating(Negotiation::WriteDescriptor, link),
                Completion::DescriptorWritten(result),
            ) => match result {
                Ok(()) => {
                    self.step = Step::Negotiating(Negotiation::VerifyDescriptor, link);
                    transport.read_notify_descriptor(epoch, link.characteristic);
                    SessionProgress::Pending
                }
                Err(e) => {
                    error!("Write characteristic config failed: {}", e);
                    self.fail(SessionFailure::DescriptorWriteFailed)
                }
            },

            (
                Step::Negotiating(Negotiation::VerifyDescriptor, link),
                Completion::DescriptorRead(result),
            ) => match result {
                Ok(NotifyConfig::Notify) => {
                    info!("Characteristic notifications successfully enabled");
                    self.step = Step::Negotiating(Negotiation::Subscribe, link);
                    transport.subscribe(epoch, link.connection, link.characteristic);
                    SessionProgress::Pending
                }
                Ok(other) => {
                    warn!(?other, "Notification descriptor did not read back as Notify");
                    self.fail(SessionFailure::DescriptorVerifyFailed)
                }
                Err(e) => {
                    error!("Read characteristic config failed: {}", e);
                    self.fail(SessionFailure::DescriptorVerifyFailed)
                }
            },

            (
                Step::Negotiating(Negotiation::Subscribe, link),
                Completion::Subscribed(result),
            ) => match result {
                Ok(()) => {
                    self.step = Step::Finished;
                    SessionProgress::Established(link)
                }
                Err(e) => {
                    error!("Subscribing to notifications failed: {}", e);
                    self.fail(SessionFailure::SubscribeFailed)
                }
            },

            (step, completion) => {
                warn!(
                    ?step,
                    completion = completion.name(),
                    "Ignoring completion that does not match the outstanding call"
                );
                SessionProgress::Pending
            }
        }
    }

    /// Discovery deadline passed. Only meaningful while still scanning.
    pub fn expire_discovery(&mut self, transport: &dyn Transport) -> Option<SessionFailure> {
        if self.step != Step::Discovering {
            return None;
        }
        transport.stop_discovery();
        match self.fail(SessionFailure::DiscoveryTimeout) {
            SessionProgress::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// The radio link dropped before the session finished.
    pub fn link_lost(&mut self) -> SessionFailure {
        self.step = Step::Finished;
        SessionFailure::LinkLost
    }

    /// Abandon the session; stops a running scan.
    pub fn abort(&mut self, transport: &dyn Transport) {
        if self.step == Step::Discovering {
            transport.stop_discovery();
        }
        self.step = Step::Finished;
    }

    fn connect(&mut self, transport: &dyn Transport, device: DeviceAddress) {
        info!(%device, "Connecting to Bluetooth device");
        self.device = Some(device);
        self.step = Step::Connecting(device);
        transport.connect(self.epoch, device);
    }

    fn fetch_services(
        &mut self,
        transport: &dyn Transport,
        device: DeviceAddress,
        connection: ConnectionHandle,
    ) -> SessionProgress {
        self.step = Step::Services(device, connection);
        transport.get_services(self.epoch, connection, self.config.service_uuid);
        SessionProgress::Pending
    }

    fn fail(&mut self, failure: SessionFailure) -> SessionProgress {
        warn!(epoch = %self.epoch, "Connection attempt failed: {}", failure);
        self.step = Step::Finished;
        SessionProgress::Failed(failure)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::TransportError;
    use std::sync::Mutex;

    /// Transport call as seen by the fake.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Discover(Epoch),
        StopDiscovery,
        Connect(Epoch, DeviceAddress),
        Pair(Epoch, ConnectionHandle, String),
        Services(Epoch, ConnectionHandle),
        Characteristics(Epoch, ServiceHandle),
        Descriptors(Epoch, CharacteristicHandle),
        WriteDescriptor(Epoch, CharacteristicHandle),
        ReadDescriptor(Epoch, CharacteristicHandle),
        Subscribe(Epoch, ConnectionHandle, CharacteristicHandle),
        Close(ConnectionHandle),
    }

    /// Records calls; tests feed completions by hand.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingTransport {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn last(&self) -> Option<Call> {
            self.calls.lock().unwrap().last().cloned()
        }

        pub(crate) fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Transport for RecordingTransport {
        fn discover(&self, epoch: Epoch, _service: u128) {
            self.record(Call::Discover(epoch));
        }
        fn stop_discovery(&self) {
            self.record(Call::StopDiscovery);
        }
        fn connect(&self, epoch: Epoch, device: DeviceAddress) {
            self.record(Call::Connect(epoch, device));
        }
        fn pair(&self, epoch: Epoch, connection: ConnectionHandle, pin: &str) {
            self.record(Call::Pair(epoch, connection, pin.to_string()));
        }
        fn get_services(&self, epoch: Epoch, connection: ConnectionHandle, _service: u128) {
            self.record(Call::Services(epoch, connection));
        }
        fn get_characteristics(&self, epoch: Epoch, service: ServiceHandle, _uuid: u128) {
            self.record(Call::Characteristics(epoch, service));
        }
        fn get_descriptors(&self, epoch: Epoch, characteristic: CharacteristicHandle) {
            self.record(Call::Descriptors(epoch, characteristic));
        }
        fn write_notify_descriptor(&self, epoch: Epoch, characteristic: CharacteristicHandle) {
            self.record(Call::WriteDescriptor(epoch, characteristic));
        }
        fn read_notify_descriptor(&self, epoch: Epoch, characteristic: CharacteristicHandle) {
            self.record(Call::ReadDescriptor(epoch, characteristic));
        }
        fn subscribe(
            &self,
            epoch: Epoch,
            connection: ConnectionHandle,
            characteristic: CharacteristicHandle,
        ) {
            self.record(Call::Subscribe(epoch, connection, characteristic));
        }
        fn close(&self, connection: ConnectionHandle) {
            self.record(Call::Close(connection));
        }
    }

    pub(crate) const DEVICE: DeviceAddress = DeviceAddress(0xA1B2_C3D4_E5F6);
    pub(crate) const CONNECTION: ConnectionHandle = ConnectionHandle(1);
    pub(crate) const SERVICE: ServiceHandle = ServiceHandle(2);
    pub(crate) const CHARACTERISTIC: CharacteristicHandle = CharacteristicHandle(3);

    /// Successful completions in pipeline order, starting after discovery.
    pub(crate) fn happy_completions() -> Vec<Completion> {
        vec![
            Completion::Connected(Ok(CONNECTION)),
            Completion::Paired(Ok(PairingOutcome::Paired(
                ProtectionLevel::EncryptionAndAuthentication,
            ))),
            Completion::Services(Ok(Some(SERVICE))),
            Completion::Characteristics(Ok(Some(CHARACTERISTIC))),
            Completion::Descriptors(Ok(())),
            Completion::DescriptorWritten(Ok(())),
            Completion::DescriptorRead(Ok(NotifyConfig::Notify)),
            Completion::Subscribed(Ok(())),
        ]
    }

    fn started(plan: SessionPlan) -> (RecordingTransport, ConnectionSession) {
        let transport = RecordingTransport::default();
        let mut session = ConnectionSession::new(Epoch(7), plan, SessionConfig::default());
        session.start(&transport);
        (transport, session)
    }

    fn status_error() -> TransportError {
        TransportError::Status("Unreachable".to_string())
    }

    /// Drive the pipeline, replacing the completion at `fail_at` with `failure`.
    fn run_until(fail_at: usize, failure: Completion) -> (RecordingTransport, SessionProgress) {
        let (transport, mut session) = started(SessionPlan::Discover);
        session.advance(&transport, Completion::Discovered(Ok(DEVICE)));

        let mut completions = happy_completions();
        completions[fail_at] = failure;
        let mut progress = SessionProgress::Pending;
        for completion in completions.into_iter().take(fail_at + 1) {
            progress = session.advance(&transport, completion);
        }
        assert!(session.is_finished());
        (transport, progress)
    }

    #[test]
    fn test_happy_path_issues_one_call_per_step() {
        let (transport, mut session) = started(SessionPlan::Discover);
        assert_eq!(session.state(), ConnectionState::Scanning);

        let mut progress = session.advance(&transport, Completion::Discovered(Ok(DEVICE)));
        assert_eq!(session.state(), ConnectionState::Connecting);

        let states = [
            ConnectionState::Pairing,
            ConnectionState::Negotiating,
            ConnectionState::Negotiating,
            ConnectionState::Negotiating,
            ConnectionState::Negotiating,
            ConnectionState::Negotiating,
            ConnectionState::Negotiating,
            ConnectionState::Disconnected,
        ];
        for (completion, state) in happy_completions().into_iter().zip(states) {
            assert_eq!(progress, SessionProgress::Pending);
            progress = session.advance(&transport, completion);
            assert_eq!(session.state(), state);
        }

        let epoch = Epoch(7);
        assert_eq!(
            transport.calls(),
            vec![
                Call::Discover(epoch),
                Call::Connect(epoch, DEVICE),
                Call::Pair(epoch, CONNECTION, "605011".to_string()),
                Call::Services(epoch, CONNECTION),
                Call::Characteristics(epoch, SERVICE),
                Call::Descriptors(epoch, CHARACTERISTIC),
                Call::WriteDescriptor(epoch, CHARACTERISTIC),
                Call::ReadDescriptor(epoch, CHARACTERISTIC),
                Call::Subscribe(epoch, CONNECTION, CHARACTERISTIC),
            ]
        );
        assert_eq!(
            progress,
            SessionProgress::Established(LinkHandles {
                device: DEVICE,
                connection: CONNECTION,
                service: SERVICE,
                characteristic: CHARACTERISTIC,
            })
        );
    }

    #[test]
    fn test_reconnect_plan_skips_discovery() {
        let (transport, session) = started(SessionPlan::Reconnect(DEVICE));
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.device(), Some(DEVICE));
        assert_eq!(transport.calls(), vec![Call::Connect(Epoch(7), DEVICE)]);
    }

    #[test]
    fn test_already_paired_goes_to_services() {
        let (transport, mut session) = started(SessionPlan::Reconnect(DEVICE));
        session.advance(&transport, Completion::Connected(Ok(CONNECTION)));
        let progress = session.advance(
            &transport,
            Completion::Paired(Ok(PairingOutcome::AlreadyPaired)),
        );
        assert_eq!(progress, SessionProgress::Pending);
        assert_eq!(transport.last(), Some(Call::Services(Epoch(7), CONNECTION)));
    }

    #[test]
    fn test_each_step_reports_its_failure() {
        let cases = vec![
            (
                0,
                Completion::Connected(Err(status_error())),
                SessionFailure::ConnectFailed(status_error().to_string()),
            ),
            (
                1,
                Completion::Paired(Err(status_error())),
                SessionFailure::PairingRejected(status_error().to_string()),
            ),
            (
                1,
                Completion::Paired(Ok(PairingOutcome::Paired(ProtectionLevel::Encryption))),
                SessionFailure::PairingWrongProtectionLevel(ProtectionLevel::Encryption),
            ),
            (2, Completion::Services(Ok(None)), SessionFailure::ServiceNotFound),
            (
                2,
                Completion::Services(Err(status_error())),
                SessionFailure::ServiceNotFound,
            ),
            (
                3,
                Completion::Characteristics(Ok(None)),
                SessionFailure::CharacteristicNotFound,
            ),
            (
                4,
                Completion::Descriptors(Err(status_error())),
                SessionFailure::DescriptorNotFound,
            ),
            (
                5,
                Completion::DescriptorWritten(Err(status_error())),
                SessionFailure::DescriptorWriteFailed,
            ),
            (
                6,
                Completion::DescriptorRead(Ok(NotifyConfig::None)),
                SessionFailure::DescriptorVerifyFailed,
            ),
            (
                7,
                Completion::Subscribed(Err(status_error())),
                SessionFailure::SubscribeFailed,
            ),
        ];

        for (fail_at, completion, expected) in cases {
            let (_, progress) = run_until(fail_at, completion);
            assert_eq!(progress, SessionProgress::Failed(expected));
        }
    }

    #[test]
    fn test_weak_pairing_tolerated_when_not_required() {
        let transport = RecordingTransport::default();
        let config = SessionConfig {
            require_encrypted_pairing: false,
            ..Default::default()
        };
        let mut session =
            ConnectionSession::new(Epoch(1), SessionPlan::Reconnect(DEVICE), config);
        session.start(&transport);
        session.advance(&transport, Completion::Connected(Ok(CONNECTION)));
        let progress = session.advance(
            &transport,
            Completion::Paired(Ok(PairingOutcome::Paired(ProtectionLevel::None))),
        );
        assert_eq!(progress, SessionProgress::Pending);
        assert_eq!(session.state(), ConnectionState::Negotiating);
    }

    #[test]
    fn test_mismatched_completion_is_ignored() {
        let (transport, mut session) = started(SessionPlan::Discover);
        let progress = session.advance(&transport, Completion::Subscribed(Ok(())));
        assert_eq!(progress, SessionProgress::Pending);
        assert_eq!(session.state(), ConnectionState::Scanning);
        assert_eq!(transport.calls().len(), 1);
    }

    #[test]
    fn test_discovery_deadline_only_applies_while_scanning() {
        let (transport, mut session) = started(SessionPlan::Discover);
        assert_eq!(
            session.expire_discovery(&transport),
            Some(SessionFailure::DiscoveryTimeout)
        );
        assert_eq!(transport.last(), Some(Call::StopDiscovery));

        let (transport, mut session) = started(SessionPlan::Reconnect(DEVICE));
        assert_eq!(session.expire_discovery(&transport), None);
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_connection_handle_kept_after_failure() {
        let (transport, mut session) = started(SessionPlan::Reconnect(DEVICE));
        session.advance(&transport, Completion::Connected(Ok(CONNECTION)));
        session.advance(&transport, Completion::Paired(Err(status_error())));
        assert_eq!(session.connection(), Some(CONNECTION));
        assert_eq!(session.device(), Some(DEVICE));
    }
}
