mod domain;
mod infrastructure;

use crate::domain::models::LinkEvent;
use crate::domain::packet::DEFAULT_GYRO_RANGE_DPS;
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::replay::{ReplayTransport, DEFAULT_CHUNK_SIZE};
use crate::infrastructure::bluetooth::service::{self, LinkService};
use crate::infrastructure::bluetooth::supervisor::SupervisorConfig;
use crate::infrastructure::bluetooth::transport::{Transport, TransportSink};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gesture_remote_bridge", about = "Bridge a BLE gesture remote to the host")]
struct Args {
    /// Play a raw byte capture instead of using the radio
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Restart the capture when it runs out
    #[arg(long = "loop", requires = "replay")]
    looped: bool,
}

fn build_transport(args: &Args, sink: TransportSink) -> Result<Arc<dyn Transport>> {
    if let Some(path) = &args.replay {
        let transport =
            ReplayTransport::from_file(sink, path, DEFAULT_CHUNK_SIZE, Duration::from_millis(15))?
                .looped(args.looped);
        return Ok(Arc::new(transport));
    }

    #[cfg(windows)]
    {
        let transport = infrastructure::bluetooth::connection::WinRtTransport::new(sink)?;
        Ok(Arc::new(transport))
    }

    #[cfg(not(windows))]
    {
        drop(sink);
        anyhow::bail!("No BLE backend on this platform; use --replay <capture>")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings_service = SettingsService::new()?;
    let _log_guard = infrastructure::logging::init_logger(&settings_service.get().log_settings)?;
    info!("Starting Gesture Remote Bridge");

    if !settings_service.path().exists() {
        if let Err(e) = settings_service.save() {
            warn!("Could not write default settings: {}", e);
        }
    }
    info!("Settings: {}", settings_service.path().display());

    let settings = settings_service.get();
    settings.validate()?;
    let config = SupervisorConfig::try_from(&settings.link)?;

    let (sink, inbox) = service::channel();
    let transport = build_transport(&args, sink)?;
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let link = LinkService::start(config, transport, inbox, event_tx)?;
    link.connect()?;

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => handle_event(&link, event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    if link.is_connected() {
        info!("Closing link to remote");
    }
    link.shutdown()
}

fn handle_event(link: &LinkService, event: LinkEvent) {
    match event {
        LinkEvent::Connected => info!("Remote connected"),
        LinkEvent::Disconnected => info!("Remote disconnected"),
        LinkEvent::StateChanged(state) => match link.retry_attempts() {
            Ok(retries) if retries > 0 => debug!(?state, retries, "Link state"),
            _ => debug!(?state, "Link state"),
        },
        LinkEvent::DataReceived(bytes) => debug!("Raw data: {:02X?}", bytes),
        LinkEvent::Aligned => debug!("Stream aligned"),
        LinkEvent::Misaligned => debug!("Stream misaligned"),
        LinkEvent::PacketReady(packet) => {
            let [x, y, z] = packet.gyro_dps(DEFAULT_GYRO_RANGE_DPS);
            let buttons = packet.buttons();
            debug!(
                x,
                y,
                z,
                left = buttons.left,
                right = buttons.right,
                middle = buttons.middle,
                "Packet"
            );
        }
        LinkEvent::GaveUp { attempts, reason } => {
            error!(attempts, "Gave up connecting to remote: {}", reason)
        }
    }
}
