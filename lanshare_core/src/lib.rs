use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod discovery;
pub mod error;
pub mod transfer;

pub use config::AppConfig;
pub use discovery::{PeerRecord, PeerTable};
pub use error::TransferError;

use discovery::{Beacon, DiscoveryListener};
use transfer::{Receiver, TransferOptions};

/// Beacon payload announcing this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMsg {
    pub name: String,
}

/// Metadata sent ahead of the file bytes on every transfer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    #[serde(rename = "filename")]
    pub file_name: String,
    #[serde(rename = "filesize")]
    pub file_size: u64,
    /// Local source path; never put on the wire
    #[serde(skip)]
    pub file_path: PathBuf,
}

/// Commands from the application to the backend
#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Send one file to a peer's transfer port
    SendFile { target_ip: String, file: PathBuf },
    /// Wait for one incoming file. `None` saves to the configured download path.
    ReceiveFile { save_dir: Option<PathBuf> },
    /// Report the current peer table as [`AppEvent::Peers`]
    ListPeers,
    /// Abort every transfer in flight
    CancelTransfers,
    Shutdown,
}

/// Reports from the backend to the application
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),

    PeerFound {
        ip: String,
        hostname: String,
    },

    Peers(Vec<PeerRecord>),

    TransferProgress {
        bytes_done: u64,
        total_bytes: u64,
        is_sending: bool,
    },

    TransferCompleted {
        path: PathBuf,
        bytes: u64,
        is_sending: bool,
    },

    Error(String),
}

/// Start discovery, then serve commands until the channel closes or
/// [`AppCommand::Shutdown`] arrives. Returns an error only if discovery
/// cannot be set up.
pub async fn run_backend(
    config: AppConfig,
    mut cmd_rx: mpsc::Receiver<AppCommand>,
    event_tx: mpsc::Sender<AppEvent>,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let mut transfers = shutdown.child_token();
    let receiving = Arc::new(AtomicBool::new(false));

    let _ = event_tx
        .send(AppEvent::Status(format!(
            "Name: {}, discovery port {}, transfer port {}",
            config.device_name, config.discovery_port, config.transfer_port
        )))
        .await;

    // 1. Discovery listener. Every sighting reaches the app exactly once.
    let (sighting_tx, mut sighting_rx) = mpsc::unbounded_channel::<(IpAddr, String)>();
    let relay_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some((ip, hostname)) = sighting_rx.recv().await {
            let event = AppEvent::PeerFound {
                ip: ip.to_string(),
                hostname,
            };
            if relay_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    let listener = DiscoveryListener::bind(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.discovery_port)),
        PeerTable::new(),
        move |ip, name| {
            let _ = sighting_tx.send((ip, name.to_string()));
        },
        shutdown.child_token(),
    )
    .await;
    let listener = match listener {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind discovery port {}: {}", config.discovery_port, e);
            let _ = event_tx.try_send(AppEvent::Error(format!(
                "Cant bind port {}: {}",
                config.discovery_port, e
            )));
            return Err(e).context("discovery listener");
        }
    };

    // 2. Beacon
    let beacon = match Beacon::start(
        &config.device_name,
        config.beacon_target,
        config.beacon_interval,
        shutdown.child_token(),
    )
    .await
    {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("Failed to start beacon: {}", e);
            shutdown.cancel();
            listener.shutdown().await;
            let _ = event_tx.try_send(AppEvent::Error(format!("Cant start beacon: {}", e)));
            return Err(e).context("discovery beacon");
        }
    };

    // Main loop: wait for commands from the application
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            AppCommand::SendFile { target_ip, file } => {
                tracing::info!("Initiating transfer of {} to {}", file.display(), target_ip);
                let opts = transfer_options(&config, &transfers);
                let evt = event_tx.clone();
                tokio::spawn(async move {
                    let progress = progress_reporter(evt.clone(), true);
                    match transfer::send_file(&file, &target_ip, &opts, Some(&progress)).await {
                        Ok(bytes) => {
                            let _ = evt
                                .send(AppEvent::TransferCompleted {
                                    path: file,
                                    bytes,
                                    is_sending: true,
                                })
                                .await;
                        }
                        Err(e) => {
                            let _ = evt
                                .send(AppEvent::Error(format!("File transfer failed: {}", e)))
                                .await;
                        }
                    }
                });
            }
            AppCommand::ReceiveFile { save_dir } => {
                if receiving.swap(true, Ordering::SeqCst) {
                    let _ = event_tx
                        .send(AppEvent::Error(
                            "A receive session is already waiting".to_string(),
                        ))
                        .await;
                    continue;
                }

                let save_dir = save_dir.unwrap_or_else(|| config.download_path.clone());
                let opts = transfer_options(&config, &transfers);
                let evt = event_tx.clone();
                let slot = ReceiveSlot(receiving.clone());
                let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, opts.port));

                tokio::spawn(async move {
                    let result = match Receiver::bind(bind_addr).await {
                        Ok(receiver) => {
                            let _ = evt
                                .send(AppEvent::Status(format!(
                                    "Waiting for a file on {}",
                                    receiver.local_addr()
                                )))
                                .await;
                            let progress = progress_reporter(evt.clone(), false);
                            receiver
                                .receive_file(&save_dir, &opts, Some(&progress))
                                .await
                        }
                        Err(e) => Err(e),
                    };
                    drop(slot);

                    let event = match result {
                        Ok(path) => {
                            let bytes = tokio::fs::metadata(&path)
                                .await
                                .map(|m| m.len())
                                .unwrap_or_default();
                            AppEvent::TransferCompleted {
                                path,
                                bytes,
                                is_sending: false,
                            }
                        }
                        Err(e) => AppEvent::Error(format!("File receive failed: {}", e)),
                    };
                    let _ = evt.send(event).await;
                });
            }
            AppCommand::ListPeers => {
                let _ = event_tx
                    .send(AppEvent::Peers(listener.peers().snapshot()))
                    .await;
            }
            AppCommand::CancelTransfers => {
                transfers.cancel();
                transfers = shutdown.child_token();
                let _ = event_tx
                    .send(AppEvent::Status("Transfers cancelled.".to_string()))
                    .await;
            }
            AppCommand::Shutdown => break,
        }
    }

    shutdown.cancel();
    beacon.shutdown().await;
    listener.shutdown().await;
    tracing::info!("Backend stopped");
    Ok(())
}

/// Marks the single receive session busy until dropped, on every exit path
struct ReceiveSlot(Arc<AtomicBool>);

impl Drop for ReceiveSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn transfer_options(config: &AppConfig, cancel: &CancellationToken) -> TransferOptions {
    TransferOptions {
        port: config.transfer_port,
        io_timeout: config.io_timeout,
        cancel: cancel.clone(),
    }
}

/// Progress callback forwarding to the event channel. Full channel means the
/// update is skipped.
fn progress_reporter(
    event_tx: mpsc::Sender<AppEvent>,
    is_sending: bool,
) -> impl Fn(u64, u64) + Send + Sync + 'static {
    move |bytes_done, total_bytes| {
        let _ = event_tx.try_send(AppEvent::TransferProgress {
            bytes_done,
            total_bytes,
            is_sending,
        });
    }
}
