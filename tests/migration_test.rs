//! End-to-end chunk migration tests
//!
//! Two shard runtimes live in one process, wired through loopback
//! links and sharing an in-memory metadata authority and lock service.

use crabshard::config::Config;
use crabshard::doc::Document;
use crabshard::error::MigrateError;
use crabshard::meta::{
    gen_chunk_id, ChunkRecord, CollectionRecord, MemLockService, MemMetaStore, MetaFault,
    MetaStore,
};
use crabshard::protocol::{MigrationPhase, MoveChunkRequest};
use crabshard::repl::{NoReplication, Replication, StaticReplication};
use crabshard::runtime::{LoopbackLink, ShardRuntime};
use crabshard::version::{ChunkVersion, Epoch};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const NS: &str = "db.orders";
const DONOR: &str = "shard0001";
const RECIPIENT: &str = "shard0002";

fn doc(v: serde_json::Value) -> Document {
    Document::from_value(v).unwrap()
}

fn key_pattern() -> Document {
    doc(json!({"x": 1}))
}

fn test_config() -> Config {
    let mut config = Config::default();
    // no need to wait out a connectivity blip against an in-memory store
    config.migration.commit_confirm_delay_secs = 0;
    config
}

struct Cluster {
    meta: Arc<MemMetaStore>,
    locks: Arc<MemLockService>,
    donor: Arc<ShardRuntime>,
    recipient: Arc<ShardRuntime>,
    epoch: Epoch,
}

impl Cluster {
    async fn new() -> Cluster {
        Cluster::with_configs(test_config(), test_config(), &[NS]).await
    }

    async fn with_configs(
        donor_config: Config,
        recipient_config: Config,
        namespaces: &[&str],
    ) -> Cluster {
        Cluster::with_repl(
            donor_config,
            recipient_config,
            namespaces,
            Arc::new(NoReplication),
        )
        .await
    }

    /// Seed a cluster: collection records, two chunks per namespace
    /// (the migrating `[0, 50)` at version (2,0) and `[50, 1000000)` at
    /// (1,0)), all owned by the donor.
    async fn with_repl(
        donor_config: Config,
        recipient_config: Config,
        namespaces: &[&str],
        recipient_repl: Arc<dyn Replication>,
    ) -> Cluster {
        let meta = Arc::new(MemMetaStore::new());
        let locks = Arc::new(MemLockService::new());
        let epoch = Epoch::new();

        let donor = ShardRuntime::new(
            DONOR,
            donor_config,
            meta.clone(),
            locks.clone(),
            Arc::new(NoReplication),
        );
        let recipient = ShardRuntime::new(
            RECIPIENT,
            recipient_config,
            meta.clone(),
            locks.clone(),
            recipient_repl,
        );
        donor.register_link(RECIPIENT, LoopbackLink::new(Arc::clone(&recipient)));
        recipient.register_link(DONOR, LoopbackLink::new(Arc::clone(&donor)));

        for (i, ns) in namespaces.iter().enumerate() {
            let linked = if i == 0 {
                None
            } else {
                Some(namespaces[0].to_string())
            };
            meta.put_collection(CollectionRecord {
                ns: ns.to_string(),
                key_pattern: key_pattern(),
                epoch,
                linked,
            });
            for (min, max, major) in [(0i64, 50i64, 2u32), (50, 1_000_000, 1)] {
                let min = doc(json!({"x": min}));
                meta.put_chunk(ChunkRecord {
                    id: gen_chunk_id(ns, &min),
                    ns: ns.to_string(),
                    min,
                    max: doc(json!({"x": max})),
                    shard: DONOR.to_string(),
                    lastmod: ChunkVersion::new(major, 0, epoch),
                });
            }

            donor
                .store
                .create_collection(
                    ns,
                    Default::default(),
                    crabshard::keys::ShardKeyPattern::parse(&key_pattern()).unwrap(),
                )
                .unwrap();
        }

        donor.sharding.initialize("mem-config");
        for ns in namespaces {
            donor.sharding.refresh_metadata_now(ns).await.unwrap();
        }

        Cluster {
            meta,
            locks,
            donor,
            recipient,
            epoch,
        }
    }

    fn seed_docs(&self, ns: &str, xs: &[i64]) {
        let coll = self.donor.store.collection(ns).unwrap();
        for &x in xs {
            coll.upsert(doc(json!({"_id": x, "x": x}))).unwrap();
        }
    }

    fn move_request(&self) -> MoveChunkRequest {
        MoveChunkRequest {
            ns: NS.to_string(),
            from: DONOR.to_string(),
            to: RECIPIENT.to_string(),
            min: doc(json!({"x": 0})),
            max: doc(json!({"x": 50})),
            shard_id: gen_chunk_id(NS, &doc(json!({"x": 0}))),
            max_chunk_size_bytes: 64 * 1024 * 1024,
            secondary_throttle: false,
            wait_for_delete: true,
            configdb: None,
        }
    }

    fn change_log_whats(&self) -> Vec<String> {
        self.meta
            .change_log()
            .into_iter()
            .map(|e| e.what)
            .collect()
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting until {}", what);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_path_small_chunk() {
    let cluster = Cluster::new().await;
    cluster.seed_docs(NS, &[1, 2, 3, 60]);

    cluster
        .donor
        .move_chunk(cluster.move_request())
        .await
        .unwrap();

    // every document of the range landed on the recipient
    let recipient_coll = cluster.recipient.store.collection(NS).unwrap();
    for x in [1, 2, 3] {
        assert!(recipient_coll.find_by_id(&json!(x)).is_some());
    }
    assert_eq!(recipient_coll.num_records(), 3);

    // the donor kept only the out-of-range document
    let donor_coll = cluster.donor.store.collection(NS).unwrap();
    assert_eq!(
        donor_coll.count_range(&doc(json!({"x": 0})), &doc(json!({"x": 50}))),
        0
    );
    assert!(donor_coll.find_by_id(&json!(60)).is_some());

    // recipient state machine drained: clone saw all 3 docs, then quiet
    let status = cluster.recipient.recv_chunk_status();
    assert_eq!(status.state, MigrationPhase::Done);
    assert_eq!(status.counts.cloned, 3);

    // ownership and versions advanced in the metadata authority
    let moved = cluster
        .meta
        .chunk_by_id(&gen_chunk_id(NS, &doc(json!({"x": 0}))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.shard, RECIPIENT);
    assert_eq!(moved.lastmod.major(), 3);
    assert!(moved.lastmod.epoch() == cluster.epoch);

    let bumped = cluster
        .meta
        .chunk_by_id(&gen_chunk_id(NS, &doc(json!({"x": 50}))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bumped.shard, DONOR);
    assert_eq!((bumped.lastmod.major(), bumped.lastmod.minor()), (3, 1));

    // the donor's cached version advanced monotonically
    assert_eq!(cluster.donor.sharding.get_version(NS).unwrap().major(), 3);

    // change log carries the full trail, with step timings
    let whats = cluster.change_log_whats();
    for what in ["moveChunk.start", "moveChunk.commit", "moveChunk.from", "moveChunk.to"] {
        assert!(whats.iter().any(|w| w == what), "missing {}", what);
    }
    let from_entry = cluster
        .meta
        .change_log()
        .into_iter()
        .find(|e| e.what == "moveChunk.from")
        .unwrap();
    assert!(from_entry.details.get("step 5 of 6").is_some());

    // donor capture state torn down, distributed lock released
    assert!(!cluster.donor.donor.is_active());
    assert!(cluster
        .locks
        .holder(&format!("migrate-{}", doc(json!({"x": 0}))))
        .is_none());

    // no pending-incoming marker left behind
    assert!(!cluster.recipient.sharding.has_pending(NS));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_chunk_migrates() {
    let cluster = Cluster::new().await;

    cluster
        .donor
        .move_chunk(cluster.move_request())
        .await
        .unwrap();

    let status = cluster.recipient.recv_chunk_status();
    assert_eq!(status.state, MigrationPhase::Done);
    assert_eq!(status.counts.cloned, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_insert_during_clone() {
    let mut donor_config = test_config();
    // one document per clone batch keeps the clone phase open long
    // enough to race writes against it
    donor_config.migration.clone_batch_max_bytes = 1;
    let cluster = Cluster::with_configs(donor_config, test_config(), &[NS]).await;

    let xs: Vec<i64> = (0..40).collect();
    cluster.seed_docs(NS, &xs);

    let donor = Arc::clone(&cluster.donor);
    let req = cluster.move_request();
    let mover = tokio::spawn(async move { donor.move_chunk(req).await });

    // wait for the clone to be underway, then write into the range
    let recipient = Arc::clone(&cluster.recipient);
    wait_until("clone started", || {
        recipient.recv_chunk_status().counts.cloned >= 1
    })
    .await;
    cluster
        .donor
        .store
        .collection(NS)
        .unwrap()
        .upsert(doc(json!({"_id": "live", "x": 25})))
        .unwrap();

    mover.await.unwrap().unwrap();

    // the concurrent insert was captured, transferred, and cleaned up
    let recipient_coll = cluster.recipient.store.collection(NS).unwrap();
    assert!(recipient_coll.find_by_id(&json!("live")).is_some());
    let donor_coll = cluster.donor.store.collection(NS).unwrap();
    assert!(donor_coll.find_by_id(&json!("live")).is_none());
    assert_eq!(recipient_coll.num_records(), 41);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_delete_during_clone() {
    let mut donor_config = test_config();
    donor_config.migration.clone_batch_max_bytes = 1;
    let cluster = Cluster::with_configs(donor_config, test_config(), &[NS]).await;

    let xs: Vec<i64> = (0..40).collect();
    cluster.seed_docs(NS, &xs);

    let donor = Arc::clone(&cluster.donor);
    let req = cluster.move_request();
    let mover = tokio::spawn(async move { donor.move_chunk(req).await });

    let recipient = Arc::clone(&cluster.recipient);
    wait_until("clone started", || {
        recipient.recv_chunk_status().counts.cloned >= 1
    })
    .await;
    // delete a document whose locator may still be in the clone plan
    cluster
        .donor
        .store
        .collection(NS)
        .unwrap()
        .remove_by_id(&json!(30), false);

    mover.await.unwrap().unwrap();

    // whether the doc raced ahead of the delete or not, the deletion
    // won: it is gone on both sides and nothing else was lost
    let recipient_coll = cluster.recipient.store.collection(NS).unwrap();
    assert!(recipient_coll.find_by_id(&json!(30)).is_none());
    assert_eq!(recipient_coll.num_records(), 39);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chunk_too_big_aborts_cleanly() {
    let cluster = Cluster::new().await;
    let coll = cluster.donor.store.collection(NS).unwrap();
    for x in 0..10i64 {
        coll.upsert(doc(json!({"_id": x, "x": x, "pad": "p".repeat(1024)})))
            .unwrap();
    }

    let mut req = cluster.move_request();
    req.max_chunk_size_bytes = 1024;

    match cluster.donor.move_chunk(req).await {
        Err(MigrateError::ChunkTooBig {
            estimated_bytes, ..
        }) => assert!(estimated_bytes > 5_000, "estimate {}", estimated_bytes),
        other => panic!("expected ChunkTooBig, got {:?}", other),
    }

    // no recipient was ever engaged, no lock residue, donor unwound
    assert!(!cluster.recipient.recv_chunk_status().active);
    assert!(cluster
        .locks
        .holder(&format!("migrate-{}", doc(json!({"x": 0}))))
        .is_none());
    assert!(!cluster.donor.donor.is_active());
    assert_eq!(cluster.donor.sharding.get_version(NS).unwrap().major(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recipient_id_conflict_fails_migration() {
    let cluster = Cluster::new().await;
    cluster.seed_docs(NS, &[1]);

    // a local document on the recipient shares the _id but belongs to
    // another range; overwriting it would lose data
    let recipient_coll = cluster
        .recipient
        .store
        .create_collection(
            NS,
            Default::default(),
            crabshard::keys::ShardKeyPattern::parse(&key_pattern()).unwrap(),
        )
        .unwrap();
    recipient_coll
        .upsert(doc(json!({"_id": 1, "x": 500})))
        .unwrap();

    match cluster.donor.move_chunk(cluster.move_request()).await {
        Err(MigrateError::RecipientFailed { cause }) => {
            assert!(cause.contains("_id"), "cause: {}", cause);
        }
        other => panic!("expected RecipientFailed, got {:?}", other),
    }

    // donor side rolled back completely
    assert_eq!(cluster.donor.sharding.get_version(NS).unwrap().major(), 2);
    assert!(!cluster.donor.donor.is_active());
    assert!(cluster
        .donor
        .store
        .collection(NS)
        .unwrap()
        .find_by_id(&json!(1))
        .is_some());

    // recipient cleared its pending marker and kept the foreign doc
    let recipient = Arc::clone(&cluster.recipient);
    wait_until("pending marker cleared", || {
        !recipient.sharding.has_pending(NS)
    })
    .await;
    assert!(recipient_coll.find_by_id(&json!(1)).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_unknown_outcome_confirmed_by_reread() {
    let cluster = Cluster::new().await;
    cluster.seed_docs(NS, &[1, 2]);

    // the metadata authority applies the batch but the reply is lost
    cluster.meta.fail_next_apply(MetaFault::UnknownApplied);

    cluster
        .donor
        .move_chunk(cluster.move_request())
        .await
        .unwrap();

    // the confirmation read recognized the landed commit; the process
    // lives and the migration completed normally
    let moved = cluster
        .meta
        .chunk_by_id(&gen_chunk_id(NS, &doc(json!({"x": 0}))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.shard, RECIPIENT);
    assert!(cluster
        .change_log_whats()
        .iter()
        .any(|w| w == "moveChunk.commit"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_meta_unreachable_rolls_back() {
    let cluster = Cluster::new().await;
    cluster.seed_docs(NS, &[1, 2]);

    cluster.meta.fail_next_apply(MetaFault::Unreachable);

    match cluster.donor.move_chunk(cluster.move_request()).await {
        Err(MigrateError::MetaUnreachable { .. }) => {}
        other => panic!("expected MetaUnreachable, got {:?}", other),
    }

    // version restored, chunk record untouched
    assert_eq!(cluster.donor.sharding.get_version(NS).unwrap().major(), 2);
    let chunk = cluster
        .meta
        .chunk_by_id(&gen_chunk_id(NS, &doc(json!({"x": 0}))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk.shard, DONOR);
    assert!(!cluster.donor.donor.in_critical_section());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_linked_collections_migrate_as_one_unit() {
    const AUDIT: &str = "db.orders_audit";
    let cluster = Cluster::with_configs(test_config(), test_config(), &[NS, AUDIT]).await;
    cluster.seed_docs(NS, &[1, 2, 60]);
    cluster.seed_docs(AUDIT, &[1, 3]);

    cluster
        .donor
        .move_chunk(cluster.move_request())
        .await
        .unwrap();

    // both namespaces moved their in-range documents
    let orders = cluster.recipient.store.collection(NS).unwrap();
    assert_eq!(orders.num_records(), 2);
    let audit = cluster.recipient.store.collection(AUDIT).unwrap();
    assert_eq!(audit.num_records(), 2);

    for ns in [NS, AUDIT] {
        let donor_coll = cluster.donor.store.collection(ns).unwrap();
        assert_eq!(
            donor_coll.count_range(&doc(json!({"x": 0})), &doc(json!({"x": 50}))),
            0,
            "donor still owns range docs of {}",
            ns
        );

        // the applyOps batch touched both namespaces' chunk records
        let moved = cluster
            .meta
            .chunk_by_id(&gen_chunk_id(ns, &doc(json!({"x": 0}))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.shard, RECIPIENT, "chunk of {} not moved", ns);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cannot_move_linked_collection_directly() {
    const AUDIT: &str = "db.orders_audit";
    let cluster = Cluster::with_configs(test_config(), test_config(), &[NS, AUDIT]).await;

    let mut req = cluster.move_request();
    req.ns = AUDIT.to_string();
    req.shard_id = gen_chunk_id(AUDIT, &doc(json!({"x": 0})));

    match cluster.donor.move_chunk(req).await {
        Err(MigrateError::InvalidRequest { reason }) => {
            assert!(reason.contains(NS), "reason: {}", reason);
        }
        other => panic!("expected InvalidRequest, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_bounds_rejected() {
    let cluster = Cluster::new().await;

    let mut req = cluster.move_request();
    req.min = doc(json!({"x": 5})); // a split happened meanwhile

    match cluster.donor.move_chunk(req).await {
        Err(MigrateError::InvalidRequest { .. }) => {}
        Err(MigrateError::StaleBounds { .. }) => {}
        other => panic!("expected stale rejection, got {:?}", other),
    }
    assert!(!cluster.donor.donor.is_active());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_owner_rejected() {
    let cluster = Cluster::new().await;

    let mut req = cluster.move_request();
    req.from = "shard0099".to_string();

    match cluster.donor.move_chunk(req).await {
        Err(MigrateError::StaleOwner { official, .. }) => assert_eq!(official, DONOR),
        other => panic!("expected StaleOwner, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capture_memory_cap_aborts_with_split_hint() {
    let mut donor_config = test_config();
    donor_config.migration.max_capture_bytes = 64; // tiny buffer budget

    // lagging secondaries pin the recipient before STEADY, so the
    // donor keeps polling while capture memory grows
    let lagging = Arc::new(StaticReplication::new(2, false));
    lagging.set_caught_up(false);
    let cluster = Cluster::with_repl(
        donor_config,
        test_config(),
        &[NS],
        Arc::clone(&lagging) as Arc<dyn Replication>,
    )
    .await;
    cluster.seed_docs(NS, &[1, 2, 3]);

    let donor = Arc::clone(&cluster.donor);
    let req = cluster.move_request();
    let mover = tokio::spawn(async move { donor.move_chunk(req).await });

    let donor_group = Arc::clone(&cluster.donor);
    wait_until("capture active", || donor_group.donor.is_active()).await;

    // burst of in-range writes blows the capture budget
    let coll = cluster.donor.store.collection(NS).unwrap();
    for i in 0..20 {
        coll.upsert(doc(json!({"_id": format!("burst-{}", i), "x": 10})))
            .unwrap();
    }

    match mover.await.unwrap() {
        Err(e @ MigrateError::MemoryLimit { .. }) => assert!(e.split_hint()),
        other => panic!("expected MemoryLimit, got {:?}", other),
    }

    // the donor told the recipient to abort
    let recipient = Arc::clone(&cluster.recipient);
    wait_until("recipient aborted", || {
        let state = recipient.recv_chunk_status().state;
        state == MigrationPhase::Abort || state == MigrationPhase::Fail
    })
    .await;
    assert!(!cluster.donor.donor.is_active());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupt_aborts_migration() {
    let mut donor_config = test_config();
    donor_config.migration.clone_batch_max_bytes = 1;
    let cluster = Cluster::with_configs(donor_config, test_config(), &[NS]).await;
    let xs: Vec<i64> = (0..40).collect();
    cluster.seed_docs(NS, &xs);

    cluster
        .donor
        .interrupted
        .store(true, std::sync::atomic::Ordering::SeqCst);

    match cluster.donor.move_chunk(cluster.move_request()).await {
        Err(MigrateError::Interrupted) => {}
        other => panic!("expected Interrupted, got {:?}", other),
    }
    assert!(!cluster.donor.donor.is_active());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_migration_blocked_while_active() {
    let mut donor_config = test_config();
    donor_config.migration.clone_batch_max_bytes = 1;
    let cluster = Cluster::with_configs(donor_config, test_config(), &[NS]).await;
    let xs: Vec<i64> = (0..40).collect();
    cluster.seed_docs(NS, &xs);

    let donor = Arc::clone(&cluster.donor);
    let req = cluster.move_request();
    let mover = tokio::spawn(async move { donor.move_chunk(req).await });

    let recipient = Arc::clone(&cluster.recipient);
    wait_until("clone started", || {
        recipient.recv_chunk_status().counts.cloned >= 1
    })
    .await;

    match cluster.donor.move_chunk(cluster.move_request()).await {
        Err(MigrateError::MigrationActive)
        | Err(MigrateError::LockContention { .. })
        | Err(MigrateError::StaleOwner { .. }) => {}
        other => panic!("expected busy rejection, got {:?}", other),
    }

    mover.await.unwrap().unwrap();
}
