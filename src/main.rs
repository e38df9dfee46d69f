use anyhow::Result;
use crabshard::doc::Document;
use crabshard::meta::{gen_chunk_id, ChunkRecord, CollectionRecord, MemLockService, MemMetaStore};
use crabshard::protocol::MoveChunkRequest;
use crabshard::repl::NoReplication;
use crabshard::runtime::{LoopbackLink, ShardRuntime};
use crabshard::version::{ChunkVersion, Epoch};
use crabshard::Config;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

fn doc(v: serde_json::Value) -> Document {
    Document::from_value(v).expect("object literal")
}

/// Demo: build a two-shard cluster in one process, seed a collection on
/// the donor, and move one chunk across.
#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().await?;
    crabshard::telemetry::init(&config.logging);

    info!("Starting CrabShard v{}", crabshard::VERSION);

    let meta = Arc::new(MemMetaStore::new());
    let locks = Arc::new(MemLockService::new());

    let donor = ShardRuntime::new(
        "shard0001",
        config.clone(),
        meta.clone(),
        locks.clone(),
        Arc::new(NoReplication),
    );
    let recipient = ShardRuntime::new(
        "shard0002",
        config.clone(),
        meta.clone(),
        locks.clone(),
        Arc::new(NoReplication),
    );
    donor.register_link("shard0002", LoopbackLink::new(Arc::clone(&recipient)));
    recipient.register_link("shard0001", LoopbackLink::new(Arc::clone(&donor)));

    // seed the collection and its cluster metadata
    let ns = "demo.events";
    let epoch = Epoch::new();
    let pattern = doc(json!({"x": 1}));
    let collection = donor.store.create_collection(
        ns,
        Default::default(),
        crabshard::keys::ShardKeyPattern::parse(&pattern)?,
    )?;
    for x in 0..100i64 {
        collection.upsert(doc(json!({"_id": x, "x": x, "payload": "event"})))?;
    }

    meta.put_collection(CollectionRecord {
        ns: ns.to_string(),
        key_pattern: pattern,
        epoch,
        linked: None,
    });
    let ranges = [(0i64, 50i64, 1u32), (50, 1_000_000, 2)];
    for (min, max, major) in ranges {
        let min = doc(json!({"x": min}));
        meta.put_chunk(ChunkRecord {
            id: gen_chunk_id(ns, &min),
            ns: ns.to_string(),
            min,
            max: doc(json!({"x": max})),
            shard: "shard0001".to_string(),
            lastmod: ChunkVersion::new(major, 0, epoch),
        });
    }
    donor.sharding.initialize("mem-config");
    donor.sharding.refresh_metadata_now(ns).await?;

    info!(
        docs = collection.num_records(),
        "donor seeded, moving chunk [0, 50) to shard0002"
    );

    donor
        .move_chunk(MoveChunkRequest {
            ns: ns.to_string(),
            from: "shard0001".to_string(),
            to: "shard0002".to_string(),
            min: doc(json!({"x": 0})),
            max: doc(json!({"x": 50})),
            shard_id: gen_chunk_id(ns, &doc(json!({"x": 0}))),
            max_chunk_size_bytes: config.migration.max_chunk_size_bytes,
            secondary_throttle: false,
            wait_for_delete: true,
            configdb: None,
        })
        .await?;

    let donor_left = donor.store.collection(ns).map(|c| c.num_records());
    let recipient_got = recipient.store.collection(ns).map(|c| c.num_records());
    info!(?donor_left, ?recipient_got, "migration committed");

    for entry in meta.change_log() {
        info!(what = %entry.what, ns = %entry.ns, "change log");
    }

    Ok(())
}
