use anyhow::{anyhow, Result};
use ble_sequencer::shared::gatt_uuid::CLIENT_CHARACTERISTIC_CONFIGURATION;
use ble_sequencer::transport::scripted::ScriptedTransport;
use ble_sequencer::{CharacteristicHandle, GattTransport, PeripheralAddress, SessionConfig, SessionEvent, SessionManager};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "usage: ble-sequencer [--bluez] <address> <service> <characteristic> <hex-payload>";

/// A single write job taken from the command line
struct WriteJob {
    address: PeripheralAddress,
    handle: CharacteristicHandle,
    payload: Bytes,
}

impl WriteJob {
    fn from_args(args: &[String]) -> Result<Self> {
        let [address, service, characteristic, payload] = args else {
            return Err(anyhow!(USAGE));
        };
        Ok(Self {
            address: PeripheralAddress::new(address),
            handle: CharacteristicHandle::parse(service, characteristic)?,
            payload: parse_hex(payload)?,
        })
    }
}

fn parse_hex(text: &str) -> Result<Bytes> {
    let text = text.trim_start_matches("0x");
    if !text.is_ascii() {
        return Err(anyhow!("hex payload must be ASCII"));
    }
    if text.len() % 2 != 0 {
        return Err(anyhow!("hex payload must have an even number of digits"));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(|e| anyhow!("bad hex payload: {}", e)))
        .collect::<Result<Vec<_>>>()
        .map(Bytes::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let use_bluez = match args.first() {
        Some(flag) if flag == "--bluez" => {
            args.remove(0);
            true
        }
        _ => false,
    };

    let job = if args.is_empty() {
        WriteJob::from_args(&[
            "C0:FF:EE:00:00:01".into(),
            "fff0".into(),
            "fff1".into(),
            "01".into(),
        ])?
    } else {
        WriteJob::from_args(&args)?
    };

    if use_bluez {
        return run_bluez(job).await;
    }

    info!("Loopback demo against a scripted peripheral");
    let transport = Arc::new(ScriptedTransport::new([job.handle]));
    let sessions = run(transport.clone(), &job).await?;

    // Push a notification up the simulated link
    transport.notify(&job.address, job.handle, Bytes::from_static(&[0x2a]));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    sessions.dispose_all();
    Ok(())
}

#[cfg(feature = "bluez")]
async fn run_bluez(job: WriteJob) -> Result<()> {
    let transport = Arc::new(ble_sequencer::transport::bluez::BluezTransport::new().await?);
    let sessions = run(transport, &job).await?;

    info!("Listening for notifications, Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;
    sessions.dispose_all();
    Ok(())
}

#[cfg(not(feature = "bluez"))]
async fn run_bluez(_job: WriteJob) -> Result<()> {
    Err(anyhow!("built without the `bluez` feature"))
}

/// Connect, write the payload, then switch notifications on
async fn run<T: GattTransport>(transport: Arc<T>, job: &WriteJob) -> Result<SessionManager<T>> {
    let sessions = SessionManager::new(transport, SessionConfig::default());
    let session = sessions.session(&job.address);

    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged { address, from, to } => {
                    info!("[MAIN] {} state changed: {} -> {}", address, from, to)
                }
                SessionEvent::BatchFailed { batch, index, reason } => {
                    warn!("[MAIN] batch {} failed at {}: {}", batch, index, reason)
                }
                _ => {}
            }
        }
    });

    let mut notifications = session.subscribe(job.handle);
    tokio::spawn(async move {
        while let Some(value) = notifications.recv().await {
            info!("[MAIN] notification: {:02x?}", &value[..]);
        }
    });

    let payload = job.payload.clone();
    session
        .request(|b| {
            b.connect()
                .write(job.handle, payload)
                .enable_notifications(job.handle, CLIENT_CHARACTERISTIC_CONFIGURATION)
        })
        .await?;

    info!("[MAIN] {} write acknowledged", job.address);
    Ok(sessions)
}
