//! Simulate command implementation.

use clap::ValueEnum;
use kvsync_engine::{
    GenericSyncer, LoopbackNetwork, MemorySyncInterface, RetryConfig, StatusMap, SyncConfig,
    SyncError, Syncer, SyncerFactory, SyncerServices,
};
use kvsync_protocol::{InterfaceType, OperationStatus, SyncMode, WaterMark};
use serde::Serialize;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const LOCAL_DEVICE: &str = "local";

/// Sync modes a caller may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliMode {
    /// Send local data
    Push,
    /// Fetch peer data
    Pull,
    /// Both directions
    PushAndPull,
}

impl From<CliMode> for SyncMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Push => SyncMode::Push,
            CliMode::Pull => SyncMode::Pull,
            CliMode::PushAndPull => SyncMode::PushAndPull,
        }
    }
}

/// Storage flavour of the simulated devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// Single-version store
    Single,
    /// Multi-version store
    Multi,
}

impl From<StoreKind> for InterfaceType {
    fn from(kind: StoreKind) -> Self {
        match kind {
            StoreKind::Single => InterfaceType::SingleVersion,
            StoreKind::Multi => InterfaceType::MultiVersion,
        }
    }
}

/// Options of one simulation run.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Number of peers.
    pub peers: usize,
    /// Requested mode.
    pub mode: CliMode,
    /// Storage flavour.
    pub store: StoreKind,
    /// Peers taken offline before the sync.
    pub offline: Vec<String>,
    /// Peers whose inbound messages are dropped.
    pub unreachable: Vec<String>,
    /// Step timeout in milliseconds.
    pub timeout_ms: u64,
    /// Retries per step.
    pub retries: u32,
}

/// Invalid simulation options.
#[derive(Debug, Error)]
pub enum SimulateError {
    /// No peers requested.
    #[error("at least one peer is required")]
    NoPeers,

    /// A fault targets a device that is not simulated.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The engine refused the sync.
    #[error("sync failed: {0}")]
    Sync(#[from] SyncError),

    /// No completion was reported in time.
    #[error("sync did not complete within {0:?}")]
    NoCompletion(Duration),
}

/// Outcome for one peer.
#[derive(Debug, Serialize)]
pub struct PeerResult {
    /// Peer device id.
    pub device: String,
    /// Final status of the peer.
    pub status: OperationStatus,
    /// Newest peer record the local device has received.
    pub peer_water_mark: WaterMark,
    /// Newest local record the peer has acknowledged.
    pub local_water_mark: WaterMark,
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulateResult {
    /// Sync id handed out for the run.
    pub sync_id: u32,
    /// Requested mode.
    pub mode: SyncMode,
    /// Storage flavour.
    pub interface_type: InterfaceType,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u128,
    /// Per-peer outcome.
    pub peers: Vec<PeerResult>,
}

impl SimulateResult {
    fn succeeded(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.status == OperationStatus::FinishedAll)
            .count()
    }
}

/// Runs the simulate command.
pub fn run(options: &SimulateOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = simulate(options)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Builds the network, runs one blocking sync from the local device, and
/// collects per-peer results.
pub fn simulate(options: &SimulateOptions) -> Result<SimulateResult, SimulateError> {
    if options.peers == 0 {
        return Err(SimulateError::NoPeers);
    }
    let peer_ids: Vec<String> = (1..=options.peers).map(|i| format!("peer-{i}")).collect();
    for device in options.offline.iter().chain(&options.unreachable) {
        if !peer_ids.contains(device) {
            return Err(SimulateError::UnknownDevice(device.clone()));
        }
    }

    let interface_type = InterfaceType::from(options.store);
    let timeout = Duration::from_millis(options.timeout_ms);
    let config = SyncConfig::new()
        .with_timeout(timeout)
        .with_retry(RetryConfig::new(options.retries))
        .with_kill_wait(Duration::from_secs(2));

    let network = LoopbackNetwork::new();
    let local = start_device(&network, LOCAL_DEVICE, interface_type, &config, 100)?;
    let mut peers = Vec::with_capacity(peer_ids.len());
    for (i, device) in peer_ids.iter().enumerate() {
        let max_timestamp = 1_000 * (i as u64 + 1);
        peers.push(start_device(&network, device, interface_type, &config, max_timestamp)?);
    }
    for device in &options.offline {
        network.set_online(device, false);
    }
    for device in &options.unreachable {
        network.drop_messages_to(device, true);
    }

    let mode = SyncMode::from(options.mode);
    let (tx, rx) = mpsc::channel::<StatusMap>();
    let started = Instant::now();
    let sync_id = local.sync(
        &peer_ids,
        mode,
        Some(Box::new(move |statuses: &StatusMap| {
            let _ = tx.send(statuses.clone());
        })),
        None,
        true,
    )?;
    let budget = timeout * (options.retries + 2);
    let statuses = rx
        .recv_timeout(budget)
        .map_err(|_| SimulateError::NoCompletion(budget))?;
    let elapsed_ms = started.elapsed().as_millis();

    let metadata = local.metadata();
    let peers_result = peer_ids
        .iter()
        .map(|device| PeerResult {
            device: device.clone(),
            status: statuses
                .get(device)
                .copied()
                .unwrap_or(OperationStatus::Failed),
            peer_water_mark: metadata
                .as_ref()
                .map(|m| m.get_peer_water_mark(device, true))
                .unwrap_or(0),
            local_water_mark: metadata
                .as_ref()
                .map(|m| m.get_local_water_mark(device))
                .unwrap_or(0),
        })
        .collect();

    local.close()?;
    for peer in &peers {
        peer.close()?;
    }

    Ok(SimulateResult {
        sync_id,
        mode,
        interface_type,
        elapsed_ms,
        peers: peers_result,
    })
}

fn start_device(
    network: &LoopbackNetwork,
    device: &str,
    interface_type: InterfaceType,
    config: &SyncConfig,
    max_timestamp: u64,
) -> Result<Arc<GenericSyncer>, SimulateError> {
    let services = SyncerServices::with_config(network.communicator(device), config.clone())?;
    let syncer = SyncerFactory::create(interface_type, services);
    let storage = Arc::new(MemorySyncInterface::new(interface_type, device));
    storage.set_max_timestamp(max_timestamp);
    syncer.initialize(storage)?;
    Ok(syncer)
}

fn print_text_output(result: &SimulateResult) {
    println!("KvSync Simulation");
    println!("=================");
    println!();
    println!("Sync id:   {}", result.sync_id);
    println!("Mode:      {:?}", result.mode);
    println!("Store:     {:?}", result.interface_type);
    println!("Elapsed:   {} ms", result.elapsed_ms);
    println!();
    println!(
        "{:<12} {:<28} {:>14} {:>14}",
        "Device", "Status", "Peer mark", "Local mark"
    );
    for peer in &result.peers {
        println!(
            "{:<12} {:<28} {:>14} {:>14}",
            peer.device,
            format!("{:?}", peer.status),
            peer.peer_water_mark,
            peer.local_water_mark
        );
    }
    println!();
    println!(
        "{} of {} peers finished",
        result.succeeded(),
        result.peers.len()
    );
}
