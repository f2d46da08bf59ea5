//! Integration tests: syncers talking over an in-process network.

use kvsync_engine::{
    Communicator, GenericSyncer, LocalChangeEvent, LoopbackCommunicator, LoopbackNetwork,
    MemorySyncInterface, Metadata, RetryConfig, StatusMap, SyncConfig, SyncError,
    SyncIdAllocator, Syncer, SyncerProxy, SyncerServices, TaskScheduler, TimeHelper, WipePolicy,
};
use kvsync_protocol::{
    AbilityAckPacket, AckErrorCode, DataAckPacket, InterfaceType, Message, MessageId,
    MessageType, OperationStatus, SecurityOption, SyncMode, MIN_VALID_SYNC_ID,
    SOFTWARE_VERSION_CURRENT,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Node {
    syncer: GenericSyncer,
    storage: Arc<MemorySyncInterface>,
}

fn test_config() -> SyncConfig {
    SyncConfig::new().with_kill_wait(Duration::from_secs(2))
}

fn node(network: &LoopbackNetwork, device: &str, kind: InterfaceType, config: SyncConfig) -> Node {
    let services = SyncerServices::with_config(network.communicator(device), config).unwrap();
    let syncer = match kind {
        InterfaceType::SingleVersion => GenericSyncer::single_version(services),
        InterfaceType::MultiVersion => GenericSyncer::multi_version(services),
    };
    let storage = Arc::new(MemorySyncInterface::new(kind, format!("{device}-db")));
    syncer.initialize(storage.clone()).unwrap();
    Node { syncer, storage }
}

fn single(network: &LoopbackNetwork, device: &str) -> Node {
    node(network, device, InterfaceType::SingleVersion, test_config())
}

/// Runs a blocking sync and returns the statuses it reported.
fn sync_and_collect(node: &Node, devices: &[&str], mode: SyncMode) -> StatusMap {
    let (tx, rx) = mpsc::channel();
    let devices: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    node.syncer
        .sync(
            &devices,
            mode,
            Some(Box::new(move |statuses: &StatusMap| {
                let _ = tx.send(statuses.clone());
            })),
            None,
            true,
        )
        .unwrap();
    rx.recv_timeout(Duration::from_secs(10)).unwrap()
}

/// Starts a sync without blocking and waits a bounded time for its statuses.
fn sync_with_deadline(node: &Node, devices: &[&str], mode: SyncMode) -> Option<StatusMap> {
    let (tx, rx) = mpsc::channel();
    let devices: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    node.syncer
        .sync(
            &devices,
            mode,
            Some(Box::new(move |statuses: &StatusMap| {
                let _ = tx.send(statuses.clone());
            })),
            None,
            false,
        )
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).ok()
}

/// How a [`ScriptedPeer`] answers.
#[derive(Clone, Copy)]
struct Script {
    /// Clock reported in time sync answers; `None` echoes the requester.
    target_time: Option<u64>,
    /// Acknowledgement for every data request.
    data_ack: DataAckPacket,
}

/// A bare endpoint with no syncer behind it: accepts ability sync, answers
/// time sync from its script, and acks data requests with a fixed packet.
struct ScriptedPeer {
    data_requests: Arc<AtomicUsize>,
    _communicator: Arc<LoopbackCommunicator>,
}

impl ScriptedPeer {
    fn data_requests(&self) -> usize {
        self.data_requests.load(Ordering::SeqCst)
    }
}

fn scripted_peer(network: &LoopbackNetwork, device: &str, script: Script) -> ScriptedPeer {
    let communicator = network.communicator(device);
    let data_requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&data_requests);
    let weak = Arc::downgrade(&communicator);
    communicator.register_message_callback(Some(Arc::new(move |from: &str, message: Message| {
        let Some(communicator) = weak.upgrade() else {
            return;
        };
        if message.message_type != MessageType::Request {
            return;
        }
        let payload = match message.message_id {
            MessageId::AbilitySync => AbilityAckPacket {
                software_version: SOFTWARE_VERSION_CURRENT,
                ..AbilityAckPacket::default()
            }
            .encode(),
            MessageId::TimeSync => {
                let mut packet = message.time_sync_packet().unwrap();
                let now = script.target_time.unwrap_or(packet.source_time_begin);
                packet.target_time_begin = now;
                packet.target_time_end = now;
                packet.encode()
            }
            MessageId::DataSync => {
                counter.fetch_add(1, Ordering::SeqCst);
                script.data_ack.encode()
            }
            MessageId::LocalDataChanged => return,
        };
        let reply = Message::new(message.message_id, MessageType::Response)
            .with_session(message.session_id, message.sequence_id)
            .with_payload(payload.unwrap());
        let _ = communicator.send(from, reply, Box::new(|_| {}));
    })));
    ScriptedPeer {
        data_requests,
        _communicator: communicator,
    }
}

fn fast_retry_config() -> SyncConfig {
    test_config()
        .with_timeout(Duration::from_millis(50))
        .with_retry(RetryConfig::new(3))
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn push_between_two_devices() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let bob = single(&network, "bob");
    alice.storage.set_max_timestamp(500);

    let statuses = sync_and_collect(&alice, &["bob"], SyncMode::Push);
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::FinishedAll));

    let alice_meta = alice.syncer.metadata().unwrap();
    assert_eq!(alice_meta.get_local_water_mark("bob"), 500);
    let bob_meta = bob.syncer.metadata().unwrap();
    assert_eq!(bob_meta.get_peer_water_mark("alice", true), 500);
    assert!(alice.syncer.engine().unwrap().context("bob").unwrap().is_time_synced());
}

#[test]
fn push_and_pull_exchanges_both_watermarks() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let bob = single(&network, "bob");
    alice.storage.set_max_timestamp(500);
    bob.storage.set_max_timestamp(900);

    let statuses = sync_and_collect(&alice, &["bob"], SyncMode::PushAndPull);
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::FinishedAll));

    let alice_meta = alice.syncer.metadata().unwrap();
    assert_eq!(alice_meta.get_peer_water_mark("bob", true), 900);
    assert_eq!(alice_meta.get_local_water_mark("bob"), 500);
    let bob_meta = bob.syncer.metadata().unwrap();
    assert_eq!(bob_meta.get_peer_water_mark("alice", true), 500);
}

#[test]
fn pull_from_peer() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let bob = single(&network, "bob");
    bob.storage.set_max_timestamp(42);

    let statuses = sync_and_collect(&alice, &["bob"], SyncMode::Pull);
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::FinishedAll));
    assert_eq!(
        alice.syncer.metadata().unwrap().get_peer_water_mark("bob", true),
        42
    );
}

#[test]
fn watermarks_survive_reinitialize() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let _bob = single(&network, "bob");
    alice.storage.set_max_timestamp(700);
    sync_and_collect(&alice, &["bob"], SyncMode::Push);
    alice.syncer.close().unwrap();

    let metadata = Metadata::new();
    metadata.initialize(alice.storage.clone()).unwrap();
    assert_eq!(metadata.get_local_water_mark("bob"), 700);
    assert!(metadata.known_devices().contains(&metadata.get_hash_device_id("bob")));
}

#[test]
fn timestamps_start_after_stored_max_and_increase() {
    let storage = Arc::new(MemorySyncInterface::single_version("db"));
    storage.set_max_timestamp(u64::MAX / 4);
    let metadata = Arc::new(Metadata::new());
    metadata.initialize(storage.clone()).unwrap();
    let clock = TimeHelper::new(storage.clone(), metadata);

    let mut last = 0;
    for _ in 0..1000 {
        let now = clock.get_time();
        assert!(now > last);
        last = now;
    }
    assert!(last > u64::MAX / 4);
}

#[test]
fn sync_ids_are_unique_across_syncers() {
    let network = LoopbackNetwork::new();
    let ids = Arc::new(SyncIdAllocator::new());
    let scheduler = Arc::new(TaskScheduler::new(2).unwrap());
    let syncers: Vec<Arc<GenericSyncer>> = ["a", "b", "c"]
        .iter()
        .map(|device| {
            let services = SyncerServices::with_config(network.communicator(*device), test_config())
                .unwrap()
                .with_id_allocator(Arc::clone(&ids))
                .with_scheduler(Arc::clone(&scheduler));
            let syncer = GenericSyncer::single_version(services);
            syncer
                .initialize(Arc::new(MemorySyncInterface::single_version(*device)))
                .unwrap();
            Arc::new(syncer)
        })
        .collect();

    let handles: Vec<_> = syncers
        .iter()
        .map(|syncer| {
            let syncer = Arc::clone(syncer);
            thread::spawn(move || {
                (0..20)
                    .map(|_| {
                        syncer
                            .sync(&["nobody".to_string()], SyncMode::Push, None, None, true)
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = std::collections::HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(id >= MIN_VALID_SYNC_ID);
            assert!(seen.insert(id));
        }
    }
    assert_eq!(seen.len(), 60);
}

#[test]
fn offline_device_reports_comm_abnormal() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let _bob = single(&network, "bob");
    network.set_online("bob", false);

    let statuses = sync_and_collect(&alice, &["bob"], SyncMode::Push);
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::CommAbnormal));
}

#[test]
fn completion_fires_once_per_operation() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let _bob = single(&network, "bob");
    let _carol = single(&network, "carol");

    let calls = Arc::new(AtomicUsize::new(0));
    let finalized = Arc::new(AtomicUsize::new(0));
    let (calls_in, finalized_in) = (Arc::clone(&calls), Arc::clone(&finalized));
    alice
        .syncer
        .sync(
            &["bob".to_string(), "carol".to_string(), "dave".to_string()],
            SyncMode::Push,
            Some(Box::new(move |statuses: &StatusMap| {
                assert_eq!(statuses.len(), 3);
                assert!(statuses.values().all(|s| s.is_final()));
                calls_in.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Box::new(move || {
                finalized_in.fetch_add(1, Ordering::SeqCst);
            })),
            true,
        )
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(wait_until(|| finalized.load(Ordering::SeqCst) == 1));
    assert_eq!(alice.syncer.live_operation_count(), 0);
}

#[test]
fn removing_a_blocking_sync_releases_the_caller() {
    let network = LoopbackNetwork::new();
    let alice = Arc::new(single(&network, "alice"));
    let _bob = single(&network, "bob");
    network.drop_messages_to("bob", true);

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let alice = Arc::clone(&alice);
        thread::spawn(move || {
            alice.syncer.sync(
                &["bob".to_string()],
                SyncMode::Push,
                Some(Box::new(move |statuses: &StatusMap| {
                    let _ = tx.send(statuses.clone());
                })),
                None,
                true,
            )
        })
    };

    let engine = alice.syncer.engine().unwrap();
    let active = || engine.context("bob").and_then(|context| context.current_sync_id());
    assert!(wait_until(|| active().is_some()));
    let sync_id = active().unwrap();
    alice.syncer.remove_sync_operation(sync_id).unwrap();
    alice.syncer.remove_sync_operation(sync_id).unwrap();

    assert_eq!(waiter.join().unwrap(), Ok(sync_id));
    let statuses = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::Failed));
}

#[test]
fn queue_limit_throttles_manual_syncs() {
    let network = LoopbackNetwork::new();
    let config = test_config()
        .with_timeout(Duration::from_millis(200))
        .with_retry(RetryConfig::new(5));
    let alice = node(&network, "alice", InterfaceType::SingleVersion, config);
    let _bob = single(&network, "bob");
    network.drop_messages_to("bob", true);
    alice.syncer.set_queued_sync_limit(2).unwrap();

    let bob = vec!["bob".to_string()];
    let (tx, rx) = mpsc::channel();
    let first = alice
        .syncer
        .sync(
            &bob,
            SyncMode::Push,
            Some(Box::new(move |statuses: &StatusMap| {
                let _ = tx.send(statuses.clone());
            })),
            None,
            false,
        )
        .unwrap();
    let second = alice.syncer.sync(&bob, SyncMode::Push, None, None, false).unwrap();
    assert_eq!(second, first + 1);
    assert_eq!(alice.syncer.get_queued_sync_size(), Ok(2));
    assert_eq!(
        alice.syncer.sync(&bob, SyncMode::Push, None, None, false),
        Err(SyncError::QueueFull { limit: 2 })
    );
    assert!(matches!(
        alice.syncer.disable_manual_sync(),
        Err(SyncError::Busy(_))
    ));

    // Auto syncs are not throttled, and the refused call took no id.
    let auto = alice.syncer.sync(&bob, SyncMode::AutoPush, None, None, false).unwrap();
    assert_eq!(auto, second + 1);

    // The first sync completes on a retry once bob answers again.
    network.drop_messages_to("bob", false);
    let statuses = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::FinishedAll));
    assert!(wait_until(
        || matches!(alice.syncer.get_queued_sync_size(), Ok(n) if n < 2)
    ));
    let next = alice.syncer.sync(&bob, SyncMode::Push, None, None, false).unwrap();
    assert_eq!(next, auto + 1);

    alice.syncer.close().unwrap();
    assert_eq!(alice.syncer.get_queued_sync_size(), Ok(0));
}

#[test]
fn unanswered_step_is_retried_then_times_out() {
    let network = LoopbackNetwork::new();
    let config = test_config()
        .with_timeout(Duration::from_millis(50))
        .with_retry(RetryConfig::new(3));
    let alice = node(&network, "alice", InterfaceType::SingleVersion, config);
    let _bob = single(&network, "bob");
    network.drop_messages_to("bob", true);

    let statuses = sync_and_collect(&alice, &["bob"], SyncMode::Push);
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::Timeout));
    assert_eq!(network.sent_count("alice", "bob"), 4);
}

#[test]
fn busy_ack_is_retried_within_budget() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice", InterfaceType::SingleVersion, fast_retry_config());
    let bob = scripted_peer(
        &network,
        "bob",
        Script {
            target_time: None,
            data_ack: DataAckPacket::failed(AckErrorCode::Busy),
        },
    );

    let statuses = sync_with_deadline(&alice, &["bob"], SyncMode::Push).unwrap();
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::BusyFailure));
    assert_eq!(bob.data_requests(), 4);
}

#[test]
fn unrecoverable_ack_errors_abort_without_retry() {
    let cases = [
        (AckErrorCode::SchemaMismatch, OperationStatus::SchemaIncompatible),
        (
            AckErrorCode::SecurityOptionCheck,
            OperationStatus::SecurityOptionCheckFailure,
        ),
        (AckErrorCode::KeyRevoked, OperationStatus::EKeyRevokedFailure),
        (
            AckErrorCode::PermissionDenied,
            OperationStatus::PermissionCheckFailed,
        ),
    ];
    for (code, expected) in cases {
        let network = LoopbackNetwork::new();
        let alice = node(&network, "alice", InterfaceType::SingleVersion, fast_retry_config());
        let bob = scripted_peer(
            &network,
            "bob",
            Script {
                target_time: None,
                data_ack: DataAckPacket::failed(code),
            },
        );

        let statuses = sync_with_deadline(&alice, &["bob"], SyncMode::Push).unwrap();
        assert_eq!(statuses.get("bob"), Some(&expected), "{code:?}");
        thread::sleep(Duration::from_millis(150));
        assert_eq!(bob.data_requests(), 1, "{code:?}");
    }
}

#[test]
fn out_of_range_clock_fails_the_device() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice", InterfaceType::SingleVersion, fast_retry_config());
    let bob = scripted_peer(
        &network,
        "bob",
        Script {
            target_time: Some(u64::MAX),
            data_ack: DataAckPacket::ok(5),
        },
    );

    let statuses = sync_with_deadline(&alice, &["bob"], SyncMode::Push).unwrap();
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::Failed));
    assert_eq!(bob.data_requests(), 0);
    let context = alice.syncer.engine().unwrap().context("bob").unwrap();
    assert!(wait_until(|| context.current_sync_id().is_none()));
    assert!(!context.is_time_synced());
}

#[test]
fn large_clock_skew_is_accepted() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice", InterfaceType::SingleVersion, fast_retry_config());
    let bob = scripted_peer(
        &network,
        "bob",
        Script {
            target_time: Some(i64::MAX as u64),
            data_ack: DataAckPacket::ok(5),
        },
    );

    let statuses = sync_with_deadline(&alice, &["bob"], SyncMode::Push).unwrap();
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::FinishedAll));
    assert_eq!(bob.data_requests(), 1);
    assert!(alice.syncer.metadata().unwrap().get_time_offset("bob") > 0);
}

#[test]
fn schema_mismatch_stops_at_ability_sync() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let bob = single(&network, "bob");
    alice.storage.set_schema("orders-v1");
    bob.storage.set_schema("orders-v2");

    let statuses = sync_with_deadline(&alice, &["bob"], SyncMode::Push).unwrap();
    assert_eq!(
        statuses.get("bob"),
        Some(&OperationStatus::SchemaIncompatible)
    );
    assert_eq!(network.sent_count("alice", "bob"), 1);
    let context = alice.syncer.engine().unwrap().context("bob").unwrap();
    assert!(!context.is_ability_synced());
}

#[test]
fn security_label_mismatch_is_refused() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let bob = single(&network, "bob");
    alice.storage.set_security_option(SecurityOption::with_label(3));
    bob.storage.set_security_option(SecurityOption::with_label(1));

    let statuses = sync_with_deadline(&alice, &["bob"], SyncMode::Pull).unwrap();
    assert_eq!(
        statuses.get("bob"),
        Some(&OperationStatus::SecurityOptionCheckFailure)
    );
    assert_eq!(network.sent_count("alice", "bob"), 1);
}

#[test]
fn peer_permission_check_refuses_push() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let bob = single(&network, "bob");
    alice.storage.set_max_timestamp(60);
    bob.syncer
        .set_permission_check(Some(Arc::new(|_device: &str, mode: SyncMode| {
            !mode.has_push()
        })))
        .unwrap();

    let statuses = sync_with_deadline(&alice, &["bob"], SyncMode::Push).unwrap();
    assert_eq!(
        statuses.get("bob"),
        Some(&OperationStatus::PermissionCheckFailed)
    );
    // Ability sync, time sync and the refused data request.
    assert_eq!(network.sent_count("alice", "bob"), 3);
    let bob_meta = bob.syncer.metadata().unwrap();
    assert_eq!(bob_meta.get_peer_water_mark("alice", true), 0);

    let statuses = sync_with_deadline(&alice, &["bob"], SyncMode::Pull).unwrap();
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::FinishedAll));
}

#[test]
fn revoked_key_on_peer_aborts() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let bob = single(&network, "bob");
    alice.storage.set_max_timestamp(60);
    bob.storage.revoke_key(true);

    let statuses = sync_with_deadline(&alice, &["bob"], SyncMode::Push).unwrap();
    assert_eq!(
        statuses.get("bob"),
        Some(&OperationStatus::EKeyRevokedFailure)
    );
    assert_eq!(network.sent_count("alice", "bob"), 3);
}

#[test]
fn duplicate_devices_are_synced_once() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let _bob = single(&network, "bob");
    alice.storage.set_max_timestamp(12);

    let statuses = sync_and_collect(&alice, &["bob", "bob"], SyncMode::Push);
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::FinishedAll));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(network.sent_count("alice", "bob"), 3);
}

#[test]
fn failed_send_is_reported_per_device() {
    let network = LoopbackNetwork::new();
    let config = test_config()
        .with_timeout(Duration::from_millis(50))
        .with_retry(RetryConfig::no_retry());
    let alice = node(&network, "alice", InterfaceType::SingleVersion, config);
    let _bob = single(&network, "bob");
    let _carol = single(&network, "carol");
    network.fail_sends_to("carol", Some(kvsync_engine::CommError::Busy));

    let statuses = sync_and_collect(&alice, &["bob", "carol"], SyncMode::Push);
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::FinishedAll));
    assert_eq!(statuses.get("carol"), Some(&OperationStatus::BusyFailure));
}

#[test]
fn permission_check_rejects_device() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let _bob = single(&network, "bob");
    let _carol = single(&network, "carol");
    alice
        .syncer
        .set_permission_check(Some(Arc::new(|device: &str, _mode: SyncMode| {
            device != "carol"
        })))
        .unwrap();

    let statuses = sync_and_collect(&alice, &["bob", "carol"], SyncMode::Push);
    assert_eq!(statuses.get("bob"), Some(&OperationStatus::FinishedAll));
    assert_eq!(
        statuses.get("carol"),
        Some(&OperationStatus::PermissionCheckFailed)
    );
}

#[test]
fn local_change_triggers_auto_push() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let bob = single(&network, "bob");
    alice.syncer.enable_auto_sync(true);
    alice.storage.set_max_timestamp(77);

    alice.syncer.local_data_changed(LocalChangeEvent::SyncMerged);
    alice.syncer.local_data_changed(LocalChangeEvent::Put);

    let bob_meta = bob.syncer.metadata().unwrap();
    assert!(wait_until(|| bob_meta.get_peer_water_mark("alice", true) == 77));
}

#[test]
fn multi_version_broadcast_triggers_pull() {
    let network = LoopbackNetwork::new();
    let alice = node(&network, "alice", InterfaceType::MultiVersion, test_config());
    let bob = node(&network, "bob", InterfaceType::MultiVersion, test_config());
    bob.syncer.enable_auto_sync(true);
    alice.storage.set_max_timestamp(300);

    alice.syncer.enable_auto_sync(true);
    alice.syncer.local_data_changed(LocalChangeEvent::Put);

    let bob_meta = bob.syncer.metadata().unwrap();
    assert!(wait_until(|| bob_meta.get_peer_water_mark("alice", true) == 300));
    assert!(matches!(
        bob.syncer.erase_device_water_mark("alice", true),
        Err(SyncError::NotSupport(_))
    ));
}

#[test]
fn wipe_policy_resets_returning_device() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let bob = single(&network, "bob");
    bob.storage.set_max_timestamp(900);
    sync_and_collect(&alice, &["bob"], SyncMode::Pull);
    let alice_meta = alice.syncer.metadata().unwrap();
    assert_eq!(alice_meta.get_peer_water_mark("bob", true), 900);

    alice
        .syncer
        .set_stale_data_wipe_policy(WipePolicy::WipeStaleData)
        .unwrap();
    network.set_online("bob", false);
    network.set_online("bob", true);
    assert!(wait_until(|| alice_meta.get_peer_water_mark("bob", true) == 0));
}

#[test]
fn erase_resets_watermarks() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let _bob = single(&network, "bob");
    alice.storage.set_max_timestamp(10);
    sync_and_collect(&alice, &["bob"], SyncMode::Push);

    alice.syncer.erase_device_water_mark("bob", true).unwrap();
    let metadata = alice.syncer.metadata().unwrap();
    assert_eq!(metadata.get_local_water_mark("bob"), 0);
    assert_eq!(metadata.get_peer_water_mark("bob", true), 0);
}

#[test]
fn proxy_delegates_after_initialize() {
    let network = LoopbackNetwork::new();
    let services = SyncerServices::with_config(network.communicator("alice"), test_config()).unwrap();
    let proxy = SyncerProxy::new(services);
    let _bob = single(&network, "bob");

    assert_eq!(proxy.get_local_identity(), Err(SyncError::NotInit));
    proxy
        .initialize(Arc::new(MemorySyncInterface::single_version("alice-db")))
        .unwrap();
    let identity = proxy.get_local_identity().unwrap();
    assert_eq!(identity, kvsync_engine::hash_device_id("alice"));

    let id = proxy
        .sync(&["bob".to_string()], SyncMode::Push, None, None, true)
        .unwrap();
    assert!(id >= 1);
    proxy.close().unwrap();
    assert!(matches!(
        proxy.sync(&["bob".to_string()], SyncMode::Push, None, None, false),
        Err(SyncError::NotInit)
    ));
}

#[test]
fn disabled_manual_sync_is_busy() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    alice.syncer.disable_manual_sync().unwrap();
    assert!(matches!(
        alice
            .syncer
            .sync(&["bob".to_string()], SyncMode::Push, None, None, false),
        Err(SyncError::Busy(_))
    ));
    alice
        .syncer
        .sync(&["bob".to_string()], SyncMode::AutoPush, None, None, true)
        .unwrap();
}

#[test]
fn non_blocking_push_reports_through_callback() {
    let network = LoopbackNetwork::new();
    let alice = single(&network, "alice");
    let _dev1 = single(&network, "dev1");
    let metadata = alice.syncer.metadata().unwrap();
    metadata.save_local_time_offset(500).unwrap();
    assert_eq!(metadata.get_local_time_offset(), 500);

    let (tx, rx) = mpsc::channel();
    let id = alice
        .syncer
        .sync(
            &["dev1".to_string()],
            SyncMode::Push,
            Some(Box::new(move |statuses: &StatusMap| {
                let _ = tx.send(statuses.clone());
            })),
            None,
            false,
        )
        .unwrap();
    assert!(id >= MIN_VALID_SYNC_ID);

    let statuses = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses.get("dev1"), Some(&OperationStatus::FinishedAll));
    assert!(wait_until(|| alice.syncer.get_queued_sync_size() == Ok(0)));
}
