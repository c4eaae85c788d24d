//! Replay transport
//!
//! Plays a captured notification stream back through the normal link
//! pipeline without a radio. Every setup call succeeds at once; after
//! `subscribe` the capture is delivered in notification-sized chunks.

use crate::infrastructure::bluetooth::protocol::NotifyConfig;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, Completion, ConnectionHandle, DeviceAddress, Epoch, PairingOutcome,
    ServiceHandle, Transport, TransportSink,
};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const REPLAY_DEVICE: DeviceAddress = DeviceAddress(0x001A_7DDA_7113);

/// Bytes per notification when splitting a raw capture.
pub const DEFAULT_CHUNK_SIZE: usize = 5;

pub struct ReplayTransport {
    sink: TransportSink,
    runtime: Handle,
    chunks: Arc<Vec<Vec<u8>>>,
    interval: Duration,
    looped: bool,
    streamer: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayTransport {
    /// Must be called from inside a tokio runtime.
    pub fn new(sink: TransportSink, chunks: Vec<Vec<u8>>, interval: Duration) -> Result<Self> {
        let runtime = Handle::try_current().context("Replay transport needs a tokio runtime")?;
        Ok(Self {
            sink,
            runtime,
            chunks: Arc::new(chunks),
            interval,
            looped: false,
            streamer: Mutex::new(None),
        })
    }

    /// Load a raw byte capture and split it into `chunk_size` notifications.
    pub fn from_file(
        sink: TransportSink,
        path: &Path,
        chunk_size: usize,
        interval: Duration,
    ) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read capture {}", path.display()))?;
        info!(path = %path.display(), len = bytes.len(), "Loaded capture for replay");
        let chunks = bytes
            .chunks(chunk_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        Self::new(sink, chunks, interval)
    }

    /// Restart the capture from the top when it runs out.
    pub fn looped(mut self, looped: bool) -> Self {
        self.looped = looped;
        self
    }

    fn stop_streaming(&self) {
        if let Ok(mut streamer) = self.streamer.lock() {
            if let Some(task) = streamer.take() {
                task.abort();
            }
        }
    }
}

impl Transport for ReplayTransport {
    fn discover(&self, epoch: Epoch, _service: u128) {
        self.sink
            .complete(epoch, Completion::Discovered(Ok(REPLAY_DEVICE)));
    }

    fn stop_discovery(&self) {}

    fn connect(&self, epoch: Epoch, _device: DeviceAddress) {
        self.sink
            .complete(epoch, Completion::Connected(Ok(ConnectionHandle(1))));
    }

    fn pair(&self, epoch: Epoch, _connection: ConnectionHandle, _pin: &str) {
        self.sink
            .complete(epoch, Completion::Paired(Ok(PairingOutcome::AlreadyPaired)));
    }

    fn get_services(&self, epoch: Epoch, _connection: ConnectionHandle, _service: u128) {
        self.sink
            .complete(epoch, Completion::Services(Ok(Some(ServiceHandle(1)))));
    }

    fn get_characteristics(&self, epoch: Epoch, _service: ServiceHandle, _characteristic: u128) {
        self.sink.complete(
            epoch,
            Completion::Characteristics(Ok(Some(CharacteristicHandle(1)))),
        );
    }

    fn get_descriptors(&self, epoch: Epoch, _characteristic: CharacteristicHandle) {
        self.sink.complete(epoch, Completion::Descriptors(Ok(())));
    }

    fn write_notify_descriptor(&self, epoch: Epoch, _characteristic: CharacteristicHandle) {
        self.sink
            .complete(epoch, Completion::DescriptorWritten(Ok(())));
    }

    fn read_notify_descriptor(&self, epoch: Epoch, _characteristic: CharacteristicHandle) {
        self.sink
            .complete(epoch, Completion::DescriptorRead(Ok(NotifyConfig::Notify)));
    }

    fn subscribe(
        &self,
        epoch: Epoch,
        _connection: ConnectionHandle,
        _characteristic: CharacteristicHandle,
    ) {
        self.stop_streaming();
        self.sink.complete(epoch, Completion::Subscribed(Ok(())));

        let sink = self.sink.clone();
        let chunks = Arc::clone(&self.chunks);
        let interval = self.interval;
        let looped = self.looped;
        let task = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                for chunk in chunks.iter() {
                    ticker.tick().await;
                    if sink.is_closed() {
                        return;
                    }
                    sink.value_changed(epoch, chunk.clone());
                }
                if !looped || chunks.is_empty() {
                    break;
                }
            }
            debug!(%epoch, "Replay capture exhausted");
        });

        if let Ok(mut streamer) = self.streamer.lock() {
            *streamer = Some(task);
        }
    }

    fn close(&self, _connection: ConnectionHandle) {
        self.stop_streaming();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::TransportEvent;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_setup_calls_complete_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport =
            ReplayTransport::new(TransportSink::new(tx), Vec::new(), Duration::from_millis(1))
                .unwrap();

        transport.discover(Epoch(3), 0);
        match rx.recv().await.unwrap() {
            TransportEvent::Completed { epoch, completion } => {
                assert_eq!(epoch, Epoch(3));
                assert_eq!(completion, Completion::Discovered(Ok(REPLAY_DEVICE)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_streams_chunks_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunks = vec![vec![1, 2], vec![3], vec![4, 5, 6]];
        let transport =
            ReplayTransport::new(TransportSink::new(tx), chunks.clone(), Duration::from_millis(1))
                .unwrap();

        transport.subscribe(Epoch(9), ConnectionHandle(1), CharacteristicHandle(1));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportEvent::Completed {
                completion: Completion::Subscribed(Ok(())),
                ..
            }
        ));

        for expected in chunks {
            match rx.recv().await.unwrap() {
                TransportEvent::ValueChanged { epoch, bytes } => {
                    assert_eq!(epoch, Epoch(9));
                    assert_eq!(bytes, expected);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_close_stops_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = ReplayTransport::new(
            TransportSink::new(tx),
            vec![vec![0xAA]; 1000],
            Duration::from_millis(50),
        )
        .unwrap();

        transport.subscribe(Epoch(1), ConnectionHandle(1), CharacteristicHandle(1));
        transport.close(ConnectionHandle(1));
        // Subscribed completion only; the first tick may or may not land.
        let _ = rx.recv().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut late = 0;
        while rx.try_recv().is_ok() {
            late += 1;
        }
        assert!(late <= 1);
    }
}
