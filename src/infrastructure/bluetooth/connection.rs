//! BLE Connection Module
//!
//! [`WinRtTransport`] implements [`Transport`] on the Windows Runtime BLE
//! stack. Calls are queued to a dedicated worker thread running a
//! single-threaded tokio runtime, which owns every WinRT object and answers
//! each request through the [`TransportSink`].

use crate::domain::models::ProtectionLevel;
use crate::infrastructure::bluetooth::protocol::NotifyConfig;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, Completion, ConnectionHandle, DeviceAddress, Epoch, PairingOutcome,
    RadioStatus, ServiceHandle, Transport, TransportError, TransportSink,
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use windows::core::{GUID, HSTRING};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Devices::Enumeration::{
    DeviceInformationCustomPairing, DevicePairingKinds, DevicePairingProtectionLevel,
    DevicePairingRequestedEventArgs, DevicePairingResultStatus,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::DataReader;

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::Platform(e.message().to_string())
    }
}

fn check(status: GattCommunicationStatus) -> Result<(), TransportError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(TransportError::Status(format!("{:?}", status)))
    }
}

enum Request {
    Discover {
        epoch: Epoch,
        service: u128,
    },
    StopDiscovery,
    Connect {
        epoch: Epoch,
        device: DeviceAddress,
    },
    Pair {
        epoch: Epoch,
        connection: ConnectionHandle,
        pin: String,
    },
    Services {
        epoch: Epoch,
        connection: ConnectionHandle,
        uuid: u128,
    },
    Characteristics {
        epoch: Epoch,
        service: ServiceHandle,
        uuid: u128,
    },
    Descriptors {
        epoch: Epoch,
        characteristic: CharacteristicHandle,
    },
    WriteDescriptor {
        epoch: Epoch,
        characteristic: CharacteristicHandle,
    },
    ReadDescriptor {
        epoch: Epoch,
        characteristic: CharacteristicHandle,
    },
    Subscribe {
        epoch: Epoch,
        connection: ConnectionHandle,
        characteristic: CharacteristicHandle,
    },
    Close(ConnectionHandle),
}

/// Windows Runtime BLE transport
pub struct WinRtTransport {
    requests: mpsc::UnboundedSender<Request>,
}

impl WinRtTransport {
    pub fn new(sink: TransportSink) -> Result<Self> {
        let (requests, inbox) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("ble-worker".to_string())
            .spawn(move || run_worker(sink, inbox))
            .context("Failed to spawn BLE worker thread")?;
        Ok(Self { requests })
    }

    fn submit(&self, request: Request) {
        if self.requests.send(request).is_err() {
            error!("BLE worker is gone, dropping request");
        }
    }
}

impl Transport for WinRtTransport {
    fn discover(&self, epoch: Epoch, service: u128) {
        self.submit(Request::Discover { epoch, service });
    }

    fn stop_discovery(&self) {
        self.submit(Request::StopDiscovery);
    }

    fn connect(&self, epoch: Epoch, device: DeviceAddress) {
        self.submit(Request::Connect { epoch, device });
    }

    fn pair(&self, epoch: Epoch, connection: ConnectionHandle, pin: &str) {
        self.submit(Request::Pair {
            epoch,
            connection,
            pin: pin.to_string(),
        });
    }

    fn get_services(&self, epoch: Epoch, connection: ConnectionHandle, service: u128) {
        self.submit(Request::Services {
            epoch,
            connection,
            uuid: service,
        });
    }

    fn get_characteristics(&self, epoch: Epoch, service: ServiceHandle, characteristic: u128) {
        self.submit(Request::Characteristics {
            epoch,
            service,
            uuid: characteristic,
        });
    }

    fn get_descriptors(&self, epoch: Epoch, characteristic: CharacteristicHandle) {
        self.submit(Request::Descriptors {
            epoch,
            characteristic,
        });
    }

    fn write_notify_descriptor(&self, epoch: Epoch, characteristic: CharacteristicHandle) {
        self.submit(Request::WriteDescriptor {
            epoch,
            characteristic,
        });
    }

    fn read_notify_descriptor(&self, epoch: Epoch, characteristic: CharacteristicHandle) {
        self.submit(Request::ReadDescriptor {
            epoch,
            characteristic,
        });
    }

    fn subscribe(
        &self,
        epoch: Epoch,
        connection: ConnectionHandle,
        characteristic: CharacteristicHandle,
    ) {
        self.submit(Request::Subscribe {
            epoch,
            connection,
            characteristic,
        });
    }

    fn close(&self, connection: ConnectionHandle) {
        self.submit(Request::Close(connection));
    }
}

fn run_worker(sink: TransportSink, mut requests: mpsc::UnboundedReceiver<Request>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start BLE worker runtime: {}", e);
            return;
        }
    };

    runtime.block_on(async move {
        let mut worker = Worker::new(sink);
        while let Some(request) = requests.recv().await {
            worker.handle(request).await;
        }
        worker.close_all();
        debug!("BLE worker stopped");
    });
}

struct Link {
    device: BluetoothLEDevice,
    /// Held so Windows keeps the connection up between GATT calls.
    session: Option<GattSession>,
    status_token: Option<i64>,
    value_token: Option<(CharacteristicHandle, i64)>,
}

/// Owns the WinRT objects behind the opaque handles.
struct Worker {
    sink: TransportSink,
    scanner: BleScanner,
    next_handle: u64,
    links: HashMap<ConnectionHandle, Link>,
    services: HashMap<ServiceHandle, (ConnectionHandle, GattDeviceService)>,
    characteristics: HashMap<CharacteristicHandle, (ConnectionHandle, GattCharacteristic)>,
}

impl Worker {
    fn new(sink: TransportSink) -> Self {
        Self {
            scanner: BleScanner::new(sink.clone()),
            sink,
            next_handle: 0,
            links: HashMap::new(),
            services: HashMap::new(),
            characteristics: HashMap::new(),
        }
    }

    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Discover { epoch, service } => {
                if let Err(e) = self.scanner.start(epoch, service) {
                    error!("Failed to start BLE scan: {}", e);
                    self.sink
                        .complete(epoch, Completion::Discovered(Err(e.into())));
                }
            }
            Request::StopDiscovery => self.scanner.stop(),
            Request::Connect { epoch, device } => {
                let result = self.connect(epoch, device).await;
                self.sink.complete(epoch, Completion::Connected(result));
            }
            Request::Pair {
                epoch,
                connection,
                pin,
            } => {
                let result = self.pair(connection, &pin).await;
                self.sink.complete(epoch, Completion::Paired(result));
            }
            Request::Services {
                epoch,
                connection,
                uuid,
            } => {
                let result = self.services(connection, uuid).await;
                self.sink.complete(epoch, Completion::Services(result));
            }
            Request::Characteristics {
                epoch,
                service,
                uuid,
            } => {
                let result = self.characteristics(service, uuid).await;
                self.sink.complete(epoch, Completion::Characteristics(result));
            }
            Request::Descriptors {
                epoch,
                characteristic,
            } => {
                let result = self.descriptors(characteristic).await;
                self.sink.complete(epoch, Completion::Descriptors(result));
            }
            Request::WriteDescriptor {
                epoch,
                characteristic,
            } => {
                let result = self.write_descriptor(characteristic).await;
                self.sink
                    .complete(epoch, Completion::DescriptorWritten(result));
            }
            Request::ReadDescriptor {
                epoch,
                characteristic,
            } => {
                let result = self.read_descriptor(characteristic).await;
                self.sink.complete(epoch, Completion::DescriptorRead(result));
            }
            Request::Subscribe {
                epoch,
                connection,
                characteristic,
            } => {
                let result = self.subscribe(epoch, connection, characteristic);
                self.sink.complete(epoch, Completion::Subscribed(result));
            }
            Request::Close(connection) => self.close(connection),
        }
    }

    async fn connect(
        &mut self,
        epoch: Epoch,
        address: DeviceAddress,
    ) -> Result<ConnectionHandle, TransportError> {
        info!("Connecting to Bluetooth device: {}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address.0)?.await?;

        let session = match GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await {
            Ok(session) => {
                session.SetMaintainConnection(true)?;
                Some(session)
            }
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        // Watch the radio from here on so drops during pairing and GATT setup
        // are reported too.
        let sink = self.sink.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    let status = match dev.ConnectionStatus()? {
                        BluetoothConnectionStatus::Connected => RadioStatus::Connected,
                        _ => RadioStatus::Disconnected,
                    };
                    sink.status_changed(epoch, status);
                }
                Ok(())
            });
        let status_token = device.ConnectionStatusChanged(&status_handler)?;

        let handle = ConnectionHandle(self.allocate());
        self.links.insert(
            handle,
            Link {
                device,
                session,
                status_token: Some(status_token),
                value_token: None,
            },
        );
        Ok(handle)
    }

    fn device(&self, connection: ConnectionHandle) -> Result<&BluetoothLEDevice, TransportError> {
        self.links
            .get(&connection)
            .map(|link| &link.device)
            .ok_or_else(|| TransportError::Platform("unknown connection".to_string()))
    }

    fn characteristic(
        &self,
        handle: CharacteristicHandle,
    ) -> Result<&GattCharacteristic, TransportError> {
        self.characteristics
            .get(&handle)
            .map(|(_, c)| c)
            .ok_or_else(|| TransportError::Platform("unknown characteristic".to_string()))
    }

    async fn pair(
        &self,
        connection: ConnectionHandle,
        pin: &str,
    ) -> Result<PairingOutcome, TransportError> {
        let pairing = self.device(connection)?.DeviceInformation()?.Pairing()?;
        if pairing.IsPaired()? {
            return Ok(PairingOutcome::AlreadyPaired);
        }

        info!("Pairing with device...");
        let custom = pairing.Custom()?;
        let pin = HSTRING::from(pin);
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<DeviceInformationCustomPairing>,
                  args: windows::core::Ref<DevicePairingRequestedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    args.AcceptWithPin(&pin)?;
                }
                Ok(())
            },
        );
        let token = custom.PairingRequested(&handler)?;
        let result = custom
            .PairWithProtectionLevelAsync(
                DevicePairingKinds::ProvidePin,
                DevicePairingProtectionLevel::EncryptionAndAuthentication,
            )?
            .await;
        let _ = custom.RemovePairingRequested(token);
        let result = result?;

        match result.Status()? {
            DevicePairingResultStatus::Paired => {
                let level = match result.ProtectionLevelUsed()? {
                    DevicePairingProtectionLevel::EncryptionAndAuthentication => {
                        ProtectionLevel::EncryptionAndAuthentication
                    }
                    DevicePairingProtectionLevel::Encryption => ProtectionLevel::Encryption,
                    _ => ProtectionLevel::None,
                };
                Ok(PairingOutcome::Paired(level))
            }
            DevicePairingResultStatus::AlreadyPaired => Ok(PairingOutcome::AlreadyPaired),
            status => Err(TransportError::Status(format!("{:?}", status))),
        }
    }

    async fn services(
        &mut self,
        connection: ConnectionHandle,
        uuid: u128,
    ) -> Result<Option<ServiceHandle>, TransportError> {
        let result = self
            .device(connection)?
            .GetGattServicesForUuidWithCacheModeAsync(
                GUID::from_u128(uuid),
                BluetoothCacheMode::Uncached,
            )?
            .await?;
        check(result.Status()?)?;

        let services = result.Services()?;
        if services.Size()? == 0 {
            return Ok(None);
        }
        let handle = ServiceHandle(self.allocate());
        self.services.insert(handle, (connection, services.GetAt(0)?));
        Ok(Some(handle))
    }

    async fn characteristics(
        &mut self,
        service: ServiceHandle,
        uuid: u128,
    ) -> Result<Option<CharacteristicHandle>, TransportError> {
        let (connection, gatt_service) = self
            .services
            .get(&service)
            .cloned()
            .ok_or_else(|| TransportError::Platform("unknown service".to_string()))?;

        let result = gatt_service
            .GetCharacteristicsForUuidWithCacheModeAsync(
                GUID::from_u128(uuid),
                BluetoothCacheMode::Uncached,
            )?
            .await?;
        check(result.Status()?)?;

        let characteristics = result.Characteristics()?;
        if characteristics.Size()? == 0 {
            return Ok(None);
        }
        let handle = CharacteristicHandle(self.allocate());
        self.characteristics
            .insert(handle, (connection, characteristics.GetAt(0)?));
        Ok(Some(handle))
    }

    async fn descriptors(&self, handle: CharacteristicHandle) -> Result<(), TransportError> {
        let result = self
            .characteristic(handle)?
            .GetDescriptorsWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        check(result.Status()?)
    }

    async fn write_descriptor(&self, handle: CharacteristicHandle) -> Result<(), TransportError> {
        info!("Enabling notifications...");
        let result = self
            .characteristic(handle)?
            .WriteClientCharacteristicConfigurationDescriptorWithResultAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await?;
        check(result.Status()?)
    }

    async fn read_descriptor(
        &self,
        handle: CharacteristicHandle,
    ) -> Result<NotifyConfig, TransportError> {
        let result = self
            .characteristic(handle)?
            .ReadClientCharacteristicConfigurationDescriptorAsync()?
            .await?;
        check(result.Status()?)?;

        Ok(match result.ClientCharacteristicConfigurationDescriptor()? {
            GattClientCharacteristicConfigurationDescriptorValue::Notify => NotifyConfig::Notify,
            GattClientCharacteristicConfigurationDescriptorValue::Indicate => NotifyConfig::Indicate,
            _ => NotifyConfig::None,
        })
    }

    fn subscribe(
        &mut self,
        epoch: Epoch,
        connection: ConnectionHandle,
        handle: CharacteristicHandle,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(handle)?.clone();

        let sink = self.sink.clone();
        let data_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = args.CharacteristicValue()?;
                    let mut bytes = vec![0u8; value.Length()? as usize];
                    DataReader::FromBuffer(&value)?.ReadBytes(&mut bytes)?;
                    sink.value_changed(epoch, bytes);
                }
                Ok(())
            },
        );
        let Some(link) = self.links.get_mut(&connection) else {
            return Err(TransportError::Platform("unknown connection".to_string()));
        };
        let value_token = characteristic.ValueChanged(&data_handler)?;
        link.value_token = Some((handle, value_token));
        Ok(())
    }

    fn close(&mut self, connection: ConnectionHandle) {
        let Some(link) = self.links.remove(&connection) else {
            return;
        };

        if let Some((handle, token)) = link.value_token {
            if let Some((_, characteristic)) = self.characteristics.get(&handle) {
                let _ = characteristic.RemoveValueChanged(token);
            }
        }
        if let Some(token) = link.status_token {
            let _ = link.device.RemoveConnectionStatusChanged(token);
        }

        self.characteristics.retain(|_, (owner, _)| *owner != connection);
        self.services.retain(|_, (owner, service)| {
            if *owner == connection {
                let _ = service.Close();
                false
            } else {
                true
            }
        });
        if let Some(session) = link.session {
            let _ = session.Close();
        }
        let _ = link.device.Close();
        info!("Disconnected from device");
    }

    fn close_all(&mut self) {
        self.scanner.stop();
        let connections: Vec<_> = self.links.keys().copied().collect();
        for connection in connections {
            self.close(connection);
        }
    }
}
