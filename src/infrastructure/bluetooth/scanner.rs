//! BLE Scanner Module
//!
//! Watches advertisements for the remote's service and reports the first
//! match as a discovery completion.

use crate::infrastructure::bluetooth::transport::{
    Completion, DeviceAddress, Epoch, TransportError, TransportSink,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::BluetoothError;
use windows::Foundation::TypedEventHandler;

/// Advertisement watcher for one discovery request
pub struct BleScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    sink: TransportSink,
}

impl BleScanner {
    pub fn new(sink: TransportSink) -> Self {
        Self {
            watcher: None,
            sink,
        }
    }

    /// Start watching for `service`. The result is reported exactly once
    /// under `epoch`, either the first matching address or the watcher error.
    pub fn start(&mut self, epoch: Epoch, service: u128) -> windows::core::Result<()> {
        self.stop();

        let target = GUID::from_u128(service);
        info!("Starting BLE scan for service UUID: {:?}", target);

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let reported = Arc::new(AtomicBool::new(false));

        let sink = self.sink.clone();
        let found = Arc::clone(&reported);
        let received = TypedEventHandler::new(
            move |watcher: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let service_uuids = args.Advertisement()?.ServiceUuids()?;
                    let mut matched = false;
                    for i in 0..service_uuids.Size()? {
                        if service_uuids.GetAt(i)? == target {
                            matched = true;
                            break;
                        }
                    }

                    if matched && !found.swap(true, Ordering::SeqCst) {
                        let address = args.BluetoothAddress()?;
                        if let Some(watcher) = watcher.as_ref() {
                            let _ = watcher.Stop();
                        }
                        sink.complete(epoch, Completion::Discovered(Ok(DeviceAddress(address))));
                    }
                }
                Ok(())
            },
        );

        let sink = self.sink.clone();
        let failed = Arc::clone(&reported);
        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let error = args.Error()?;
                    if error != BluetoothError::Success && !failed.swap(true, Ordering::SeqCst) {
                        warn!("Advertisement watcher stopped: {:?}", error);
                        sink.complete(
                            epoch,
                            Completion::Discovered(Err(TransportError::Status(format!(
                                "{:?}",
                                error
                            )))),
                        );
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&received)?;
        watcher.Stopped(&stopped)?;
        watcher.Start()?;
        self.watcher = Some(watcher);

        Ok(())
    }

    /// Stop scanning
    pub fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping BLE scan...");
            let _ = watcher.Stop();
        }
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.stop();
    }
}
