//! End-to-end scenarios over the in-process coordination service: real
//! part stores on temp dirs, real TCP part exchange, several replicas per
//! test.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use crate::config::{
    ApiConfig, ColumnDef, NodeConfig, ReplicationSettings, TableSchema, WolfTableConfig,
};
use crate::coordinator::{
    AbandonableLock, Coordinator, CoordinatorService, CreateMode, Op, TablePaths,
};
use crate::error::Error;
use crate::exchange::{ExchangeHandler, ExchangeServer, PartSupplier};
use crate::part::{PartName, PartStore};
use crate::replication::LogEntry;
use crate::table::ReplicatedTable;

const TABLE_ROOT: &str = "/wolftable/hits";

fn test_config(replica: &str, dir: &Path) -> WolfTableConfig {
    WolfTableConfig {
        node: NodeConfig {
            replica_name: replica.to_string(),
            data_dir: dir.to_path_buf(),
            exchange_bind: "127.0.0.1:0".to_string(),
            host: "127.0.0.1".to_string(),
        },
        table: TableSchema {
            name: "hits".to_string(),
            coordinator_path: TABLE_ROOT.to_string(),
            date_column: "event_date".to_string(),
            sampling_expression: String::new(),
            index_granularity: 8192,
            mode: 0,
            sign_column: String::new(),
            primary_key: "(counter_id, event_date)".to_string(),
            columns: vec![
                ColumnDef {
                    name: "event_date".to_string(),
                    type_name: "Date".to_string(),
                },
                ColumnDef {
                    name: "counter_id".to_string(),
                    type_name: "UInt32".to_string(),
                },
            ],
        },
        replication: ReplicationSettings {
            max_replicated_merges_in_queue: 6,
            replicated_deduplication_window: 100,
            max_parts_per_merge: 10,
            queue_update_interval_ms: 50,
            merge_selecting_sleep_ms: 50,
            restart_poll_interval_ms: 50,
            background_pool_size: 2,
            old_parts_lifetime_secs: 0,
        },
        api: ApiConfig {
            enabled: false,
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

/// Same tunables, but the merge selector never schedules anything; used
/// where a test needs the inserted parts to stay put.
fn test_config_no_merges(replica: &str, dir: &Path) -> WolfTableConfig {
    let mut config = test_config(replica, dir);
    config.replication.max_replicated_merges_in_queue = 0;
    config
}

struct TestReplica {
    table: ReplicatedTable,
    _server: ExchangeServer,
    dir: TempDir,
}

async fn start_replica(
    service: &Arc<CoordinatorService>,
    replica: &str,
    attach: bool,
) -> TestReplica {
    let dir = tempfile::tempdir().unwrap();
    start_replica_in(service, replica, dir, attach, test_config)
        .await
        .unwrap()
}

async fn start_replica_in(
    service: &Arc<CoordinatorService>,
    replica: &str,
    dir: TempDir,
    attach: bool,
    config: fn(&str, &Path) -> WolfTableConfig,
) -> Result<TestReplica, (Error, TempDir)> {
    let exchange = ExchangeHandler::new();
    let server = ExchangeServer::bind("127.0.0.1:0", Arc::clone(&exchange))
        .await
        .unwrap();
    match ReplicatedTable::open(
        config(replica, dir.path()),
        Some(Arc::clone(service)),
        exchange,
        server.port(),
        attach,
    )
    .await
    {
        Ok(table) => Ok(TestReplica {
            table,
            _server: server,
            dir,
        }),
        Err(err) => Err((err, dir)),
    }
}

fn row(date: &str, counter_id: u64) -> serde_json::Value {
    json!({ "event_date": date, "counter_id": counter_id })
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn registered_parts(coordinator: &Coordinator, replica: &str) -> Vec<String> {
    coordinator
        .children(&TablePaths::new(TABLE_ROOT).replica(replica).parts())
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_cluster_replicates_inserts() {
    let service = CoordinatorService::new();
    let dir = tempfile::tempdir().unwrap();
    let r1 = start_replica_in(&service, "r1", dir, false, test_config_no_merges)
        .await
        .unwrap();

    r1.table.write(vec![row("2023-01-01", 1)], None).await.unwrap();
    r1.table.write(vec![row("2023-01-01", 2)], None).await.unwrap();
    assert_eq!(r1.table.part_names(), ["20230101_0_0_0", "20230101_1_1_0"]);

    let dir = tempfile::tempdir().unwrap();
    let r2 = start_replica_in(&service, "r2", dir, false, test_config_no_merges)
        .await
        .unwrap();
    wait_until("r2 fetches both parts", || {
        r2.table.part_names() == r1.table.part_names() && r2.table.queue_len() == 0
    })
    .await;

    let coordinator = service.connect();
    wait_until("registrations converge", || {
        registered_parts(&coordinator, "r1") == registered_parts(&coordinator, "r2")
    })
    .await;
    assert_eq!(r2.table.read().unwrap().len(), 2);

    r1.table.shutdown().await;
    r2.table.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_merges_across_abandoned_gap() {
    let service = CoordinatorService::new();
    let r1 = start_replica(&service, "r1", false).await;
    let r2 = start_replica(&service, "r2", false).await;
    wait_until("r1 becomes leader", || r1.table.is_leader()).await;

    let paths = TablePaths::new(TABLE_ROOT);
    let coordinator = service.connect();

    // Blocks 0 and 1 are real inserts; block 2 is reserved by an insert
    // that dies before committing; block 3 is a real insert again.
    r1.table.write(vec![row("2023-01-01", 1)], None).await.unwrap();
    r1.table.write(vec![row("2023-01-01", 2)], None).await.unwrap();
    {
        let doomed = service.connect();
        let lock = AbandonableLock::acquire(
            &doomed,
            &paths.temp(),
            &paths.block_numbers_month("202301"),
        )
        .unwrap();
        assert_eq!(lock.number(), 2);
        std::mem::forget(lock);
        service.expire_session(doomed.session_id());
    }
    r1.table.write(vec![row("2023-01-01", 3)], None).await.unwrap();

    // The leader merges 0..=3 across the abandoned gap; both replicas end
    // up with exactly the merged part, locally and in the coordinator.
    let merged_everywhere = |table: &ReplicatedTable| {
        let names = table.part_names();
        names.len() == 1 && {
            let name: PartName = names[0].parse().unwrap();
            (name.left, name.right) == (0, 3)
        }
    };
    wait_until("replicas converge on the merged part", || {
        merged_everywhere(&r1.table)
            && merged_everywhere(&r2.table)
            && r1.table.part_names() == r2.table.part_names()
    })
    .await;
    let merged_name = r1.table.part_names()[0].clone();
    wait_until("old registrations are reaped", || {
        registered_parts(&coordinator, "r1") == vec![merged_name.clone()]
            && registered_parts(&coordinator, "r2") == vec![merged_name.clone()]
    })
    .await;

    // The abandoned number in the merged gap was garbage collected; the
    // committed ones were already released by their inserts.
    wait_until("gap block number is cleaned up", || {
        coordinator
            .children(&paths.block_numbers_month("202301"))
            .unwrap()
            .is_empty()
    })
    .await;

    assert_eq!(r1.table.read().unwrap().len(), 3);
    assert_eq!(r2.table.read().unwrap().len(), 3);

    r1.table.shutdown().await;
    r2.table.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_failure_reorders_merge_inputs() {
    let service = CoordinatorService::new();
    let r2 = start_replica(&service, "r2", false).await;

    let paths = TablePaths::new(TABLE_ROOT);
    // A synthetic peer that only has the merged result, serving it over a
    // real exchange endpoint. Its session stays alive for the test.
    let peer_session = service.connect();
    let peer_dir = tempfile::tempdir().unwrap();
    let peer_store = Arc::new(PartStore::open(peer_dir.path(), Duration::ZERO).unwrap());
    let merged: PartName = "20230101_1_4_1".parse().unwrap();
    let payload = format!("{}\n", json!({ "event_date": "2023-01-01", "counter_id": 1 }));
    let temp = peer_store.write_temp(&merged, payload.as_bytes(), 4).unwrap();
    let merged_checksums = temp.meta.checksums.to_text();
    peer_store.rename_temp_and_replace(temp).unwrap();

    let peer_exchange = ExchangeHandler::new();
    let peer_server = ExchangeServer::bind("127.0.0.1:0", Arc::clone(&peer_exchange))
        .await
        .unwrap();
    let supplier: Arc<dyn PartSupplier> = Arc::clone(&peer_store) as Arc<dyn PartSupplier>;
    let r9 = paths.replica("r9");
    let _holder = peer_exchange.register(r9.root().to_string(), &supplier);

    peer_session
        .multi(vec![
            Op::create(r9.root(), "", CreateMode::Persistent),
            Op::create(
                r9.host(),
                crate::exchange::format_host_entry("127.0.0.1", peer_server.port()),
                CreateMode::Persistent,
            ),
            Op::create(r9.log(), "", CreateMode::Persistent),
            Op::create(r9.log_pointers(), "", CreateMode::Persistent),
            Op::create(r9.queue(), "", CreateMode::Persistent),
            Op::create(r9.parts(), "", CreateMode::Persistent),
            Op::create(r9.part(&merged.to_string()), "", CreateMode::Persistent),
            Op::create(
                r9.part_checksums(&merged.to_string()),
                merged_checksums,
                CreateMode::Persistent,
            ),
            Op::create(r9.is_active(), "r9", CreateMode::Ephemeral),
        ])
        .unwrap();

    // Queue work on r2 through its own log: fetches for three of the
    // merge's inputs (nobody has them), then the merge itself.
    let own = paths.replica("r2");
    for part in ["20230101_2_2_0", "20230101_3_3_0", "20230101_4_4_0"] {
        let entry = LogEntry::Get {
            source_replica: String::new(),
            new_part_name: part.to_string(),
        };
        peer_session
            .create(&own.log_prefix(), &entry.to_text(), CreateMode::PersistentSequential)
            .unwrap();
    }
    let entry = LogEntry::Merge {
        source_replica: String::new(),
        parts_to_merge: vec![
            "20230101_1_1_0".to_string(),
            "20230101_2_2_0".to_string(),
            "20230101_3_3_0".to_string(),
            "20230101_4_4_0".to_string(),
        ],
        new_part_name: merged.to_string(),
    };
    peer_session
        .create(&own.log_prefix(), &entry.to_text(), CreateMode::PersistentSequential)
        .unwrap();

    // The first input fetch fails with no-replica-has-part, which pushes
    // the remaining input fetches behind the merge; the merge degrades to
    // fetching its result from the synthetic peer, and the input fetches
    // become no-ops under the covering part.
    wait_until("r2 obtains the merged part and drains", || {
        r2.table.part_names() == vec![merged.to_string()] && r2.table.queue_len() == 0
    })
    .await;

    r2.table.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_expiry_recovers_without_losing_entries() {
    let service = CoordinatorService::new();
    let r1 = start_replica(&service, "r1", false).await;
    let r2 = start_replica(&service, "r2", false).await;

    r1.table.write(vec![row("2023-01-01", 1)], None).await.unwrap();
    r1.table.write(vec![row("2023-02-01", 2)], None).await.unwrap();
    wait_until("r2 catches up", || {
        r2.table.part_names() == r1.table.part_names()
    })
    .await;

    let old_session = r1.table.coordinator_session().unwrap();
    service.expire_session(old_session);

    wait_until("r1 reconnects on a fresh session", || {
        r1.table.coordinator_session() != Some(old_session)
    })
    .await;
    let coordinator = service.connect();
    wait_until("r1 is active again", || {
        coordinator
            .exists(&TablePaths::new(TABLE_ROOT).replica("r1").is_active())
            .unwrap()
    })
    .await;
    assert!(!r1.table.is_read_only());

    // Writes settle once the new session is wired through.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        match r1.table.write(vec![row("2023-03-01", 3)], None).await {
            Ok(_) => break,
            Err(err) => {
                assert!(Instant::now() < deadline, "write kept failing: {err}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    wait_until("both replicas hold all three parts", || {
        r1.table.part_names().len() == 3 && r2.table.part_names() == r1.table.part_names()
    })
    .await;
    assert_eq!(r2.table.read().unwrap().len(), 3);

    r1.table.shutdown().await;
    r2.table.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_attach_is_clean_after_normal_shutdown() {
    let service = CoordinatorService::new();
    let r1 = start_replica(&service, "r1", false).await;
    r1.table.write(vec![row("2023-01-01", 1)], None).await.unwrap();
    r1.table.write(vec![row("2023-01-02", 2)], None).await.unwrap();
    wait_until("queue drains", || r1.table.queue_len() == 0).await;
    r1.table.shutdown().await;
    let parts_before = r1.table.part_names();

    let dir = r1.dir;
    drop(r1.table);
    let r1 = start_replica_in(&service, "r1", dir, true, test_config)
        .await
        .unwrap();
    assert_eq!(r1.table.part_names(), parts_before);

    // Reconciliation had nothing to fix: no parts were set aside.
    let data_dir = r1.dir.path().join("hits").join("data");
    let ignored = std::fs::read_dir(&data_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("ignored_"))
        .count();
    assert_eq!(ignored, 0);

    r1.table.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_force_restore_flag_relaxes_sanity_check() {
    let service = CoordinatorService::new();
    let r1 = start_replica(&service, "r1", false).await;
    r1.table.write(vec![row("2023-01-01", 1)], None).await.unwrap();
    wait_until("queue drains", || r1.table.queue_len() == 0).await;
    r1.table.shutdown().await;
    let dir = r1.dir;
    drop(r1.table);

    // Plant local parts the coordinator has never heard of.
    {
        let store = PartStore::open(dir.path().join("hits").join("data"), Duration::ZERO).unwrap();
        for name in ["20230105_7_7_0", "20230105_8_8_0", "20230105_9_9_0"] {
            let temp = store
                .write_temp(&name.parse().unwrap(), b"{\"event_date\":\"2023-01-05\"}\n", 1)
                .unwrap();
            store.rename_temp_and_replace(temp).unwrap();
        }
    }

    let (err, dir) = match start_replica_in(&service, "r1", dir, true, test_config).await {
        Err(e) => e,
        Ok(_) => panic!("expected start_replica_in to fail"),
    };
    assert!(matches!(err, Error::TooManyUnexpectedParts(_)), "{err}");

    let coordinator = service.connect();
    let flag = TablePaths::new(TABLE_ROOT)
        .replica("r1")
        .force_restore_flag();
    coordinator.create(&flag, "", CreateMode::Persistent).unwrap();

    let r1 = start_replica_in(&service, "r1", dir, true, test_config).await.unwrap();
    assert!(!coordinator.exists(&flag).unwrap(), "flag was consumed");
    assert_eq!(r1.table.part_names(), ["20230101_0_0_0"]);

    // The unexpected parts were set aside, not deleted.
    let data_dir = r1.dir.path().join("hits").join("data");
    for name in ["20230105_7_7_0", "20230105_8_8_0", "20230105_9_9_0"] {
        assert!(data_dir.join(format!("ignored_{name}")).exists());
    }

    r1.table.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_executing_a_get_twice_is_idempotent() {
    let service = CoordinatorService::new();
    let dir = tempfile::tempdir().unwrap();
    let r1 = start_replica_in(&service, "r1", dir, false, test_config_no_merges)
        .await
        .unwrap();
    r1.table.write(vec![row("2023-01-01", 1)], None).await.unwrap();
    wait_until("queue drains", || r1.table.queue_len() == 0).await;

    let entry = LogEntry::Get {
        source_replica: String::new(),
        new_part_name: "20230101_0_0_0".to_string(),
    };
    r1.table.core.execute_log_entry(&entry).await.unwrap();
    r1.table.core.execute_log_entry(&entry).await.unwrap();

    assert_eq!(r1.table.part_names(), ["20230101_0_0_0"]);
    let coordinator = service.connect();
    assert_eq!(registered_parts(&coordinator, "r1"), ["20230101_0_0_0"]);

    r1.table.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clear_old_logs_respects_peer_pointers() {
    let service = CoordinatorService::new();
    let dir = tempfile::tempdir().unwrap();
    let r1 = start_replica_in(&service, "r1", dir, false, test_config_no_merges)
        .await
        .unwrap();

    for day in ["2023-01-01", "2023-01-02", "2023-01-03"] {
        r1.table.write(vec![row(day, 1)], None).await.unwrap();
    }
    wait_until("own log is fully pulled", || r1.table.queue_len() == 0).await;

    // A peer that has pulled only the first entry of r1's log.
    let coordinator = service.connect();
    let r9 = TablePaths::new(TABLE_ROOT).replica("r9");
    coordinator
        .multi(vec![
            Op::create(r9.root(), "", CreateMode::Persistent),
            Op::create(r9.log(), "", CreateMode::Persistent),
            Op::create(r9.log_pointers(), "", CreateMode::Persistent),
            Op::create(r9.log_pointer("r1"), "1", CreateMode::Persistent),
        ])
        .unwrap();

    let own_log = TablePaths::new(TABLE_ROOT).replica("r1").log();
    let handle = r1.table.core.coordinator().unwrap();
    r1.table.core.clear_old_logs(&handle).unwrap();

    // Only the entry below every pointer is gone; the peer still needs
    // the rest.
    assert_eq!(
        coordinator.children(&own_log).unwrap(),
        vec!["log-0000000001", "log-0000000002"]
    );

    // With a replica that has no pointer at all, trimming aborts.
    coordinator.remove(&r9.log_pointer("r1")).unwrap();
    r1.table.core.clear_old_logs(&handle).unwrap();
    assert_eq!(coordinator.children(&own_log).unwrap().len(), 2);

    r1.table.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leadership_handover_and_rejoin() {
    let service = CoordinatorService::new();
    let r1 = start_replica(&service, "r1", false).await;
    let r2 = start_replica(&service, "r2", false).await;
    wait_until("r1 becomes leader", || r1.table.is_leader()).await;
    assert!(!r2.table.is_leader());

    r1.table.shutdown().await;
    wait_until("r2 takes over leadership", || r2.table.is_leader()).await;

    // The new leader keeps scheduling merges.
    r2.table.write(vec![row("2023-01-01", 1)], None).await.unwrap();
    r2.table.write(vec![row("2023-01-02", 2)], None).await.unwrap();
    wait_until("r2 merges its inserts", || {
        let names = r2.table.part_names();
        names.len() == 1 && names[0].ends_with("_0_1_1")
    })
    .await;
    let merged = r2.table.part_names();

    // The old leader rejoins and catches up from the shared log.
    let dir = r1.dir;
    drop(r1.table);
    let r1 = start_replica_in(&service, "r1", dir, true, test_config).await.unwrap();
    wait_until("r1 catches up with the merged part", || {
        r1.table.part_names() == merged && r1.table.queue_len() == 0
    })
    .await;
    assert_eq!(r1.table.read().unwrap().len(), 2);

    r1.table.shutdown().await;
    r2.table.shutdown().await;
}
