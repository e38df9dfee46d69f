//! Donor-side migration coordinator
//!
//! `move_chunk` runs the whole donor protocol on the request handler:
//!
//! 1. validate and normalize the request
//! 2. take the distributed lock and check the cluster's view of the chunk
//! 3. plan the clone and prime the recipient
//! 4. poll until the recipient reports steady
//! 5. critical section: bump the local version, commit on the
//!    recipient, then conditionally update the metadata authority
//! 6. queue (or run) the range cleanup while the lock is still held
//! 7. tear down capture state and release the lock
//!
//! Every failure before the metadata update unwinds in reverse; an
//! ambiguous update outcome is confirmed by re-reading the authority
//! and, if the confirmation fails, the process exits rather than keep
//! serving a half-committed view.

use crate::cleanup::RangeDeletion;
use crate::error::{MigrateError, Result};
use crate::meta::{gen_chunk_id, ChunkRecord, MetaError, MetaUpdate, PreCondition};
use crate::migrate::MoveTiming;
use crate::protocol::{MigrationPhase, MoveChunkRequest, RecvChunkStart, RecvChunkStartOne};
use crate::routing::CollectionMetadata;
use crate::runtime::ShardRuntime;
use crate::version::MigrationId;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Donor entry point for one chunk move.
pub async fn move_chunk(rt: &Arc<ShardRuntime>, req: MoveChunkRequest) -> Result<()> {
    // 1. validate and normalize
    if req.ns.is_empty() {
        return Err(MigrateError::invalid("need to specify namespace in command"));
    }
    if req.to.is_empty() {
        return Err(MigrateError::invalid("need to specify shard to move chunk to"));
    }
    if req.from.is_empty() {
        return Err(MigrateError::invalid(
            "need to specify shard to move chunk from",
        ));
    }
    if req.min.is_empty() {
        return Err(MigrateError::invalid("need to specify a min"));
    }
    if req.max.is_empty() {
        return Err(MigrateError::invalid("need to specify a max"));
    }
    if req.shard_id.is_empty() {
        return Err(MigrateError::invalid("need shardId"));
    }
    if req.max_chunk_size_bytes == 0 {
        return Err(MigrateError::invalid("need to specify maxChunkSizeBytes"));
    }

    let mut secondary_throttle = req.secondary_throttle;
    if secondary_throttle {
        if !rt.repl.enabled() {
            warn!("secondaryThrottle selected but no replication");
            secondary_throttle = false;
        } else if rt.repl.majority() <= 1 {
            warn!(
                majority = rt.repl.majority(),
                "not enough nodes in set to use secondaryThrottle"
            );
            secondary_throttle = false;
        }
    }

    if req.wait_for_delete {
        info!("moveChunk waiting for full cleanup after move");
    }

    if !rt.sharding.enabled() {
        match req.configdb.as_deref() {
            Some(configdb) => rt.sharding.initialize(configdb),
            None => return Err(MigrateError::invalid("sharding not enabled")),
        }
    }

    info!(
        ns = %req.ns,
        from = %req.from,
        to = %req.to,
        min = %req.min,
        max = %req.max,
        "received moveChunk request"
    );

    let mut timing = MoveTiming::new("from", &req.ns, &req.min, &req.max, 6);
    let result = run_protocol(rt, &req, secondary_throttle, &mut timing).await;
    let errtext = result.as_ref().err().map(|e| e.to_string());
    timing
        .finish(&rt.meta, rt.sharding.shard_name(), errtext.as_deref())
        .await;
    result
}

async fn run_protocol(
    rt: &Arc<ShardRuntime>,
    req: &MoveChunkRequest,
    secondary_throttle: bool,
    timing: &mut MoveTiming,
) -> Result<()> {
    let config = &rt.config.migration;
    timing.done(1);

    // 2. lock and version check
    if rt.donor.is_active() {
        return Err(MigrateError::MigrationActive);
    }

    let lock_name = format!("migrate-{}", req.min);
    let dlk = rt
        .locks
        .try_lock(
            &lock_name,
            rt.sharding.shard_name(),
            Duration::from_secs(config.dist_lock_timeout_secs),
        )
        .await?;

    let chunk_info = json!({
        "min": req.min.to_value(),
        "max": req.max.to_value(),
        "from": req.from,
        "to": req.to,
    });
    log_change(rt, "moveChunk.start", &req.ns, chunk_info.clone()).await?;

    let collection_record = rt
        .meta
        .collection(&req.ns)
        .await
        .map_err(meta_unreachable)?
        .ok_or_else(|| MigrateError::NamespaceNotFound { ns: req.ns.clone() })?;

    if let Some(primary) = collection_record.linked {
        return Err(MigrateError::invalid(format!(
            "cannot migrate linked collection {} directly, move a chunk of {} instead",
            req.ns, primary
        )));
    }

    let linked_ns = req.ns.clone();
    let mut linked_cols = vec![req.ns.clone()];
    for ns in rt
        .meta
        .linked_collections(&req.ns)
        .await
        .map_err(meta_unreachable)?
    {
        info!(ns = %ns, "found linked ns");
        linked_cols.push(ns);
    }

    let max_version = rt
        .meta
        .latest_chunk(&linked_ns)
        .await
        .map_err(meta_unreachable)?
        .ok_or_else(|| MigrateError::invalid(format!("no chunks for {}", linked_ns)))?
        .lastmod;

    let curr_chunk = rt
        .meta
        .chunk_by_id(&req.shard_id)
        .await
        .map_err(meta_unreachable)?
        .ok_or_else(|| MigrateError::invalid(format!("no chunk with id {}", req.shard_id)))?;

    if curr_chunk.min != req.min || curr_chunk.max != req.max {
        warn!(
            ns = %req.ns,
            curr_min = %curr_chunk.min,
            curr_max = %curr_chunk.max,
            "aborted moveChunk because boundaries are outdated"
        );
        return Err(MigrateError::StaleBounds {
            curr_min: curr_chunk.min.to_value(),
            curr_max: curr_chunk.max.to_value(),
            requested_min: req.min.to_value(),
            requested_max: req.max.to_value(),
        });
    }

    if curr_chunk.shard != req.from {
        warn!(
            ns = %req.ns,
            official = %curr_chunk.shard,
            "aborted moveChunk because location is outdated"
        );
        return Err(MigrateError::StaleOwner {
            official: curr_chunk.shard,
            requested: req.from.clone(),
        });
    }

    if let Some(local_version) = rt.sharding.get_version(&req.ns) {
        if max_version.older_than(&local_version) {
            warn!(
                official = %max_version,
                mine = %local_version,
                "aborted moveChunk because official version less than mine"
            );
            return Err(MigrateError::StaleVersion {
                official: max_version,
                mine: local_version,
            });
        }
    }

    for ns in &linked_cols {
        let starting_version = rt.sharding.refresh_metadata_now(ns).await?;
        if starting_version.is_zero_major() {
            return Err(MigrateError::invalid(format!(
                "moveChunk cannot start migrate of chunk [{}, {}) with zero shard version",
                req.min, req.max
            )));
        }
        info!(ns = %ns, version = %starting_version, "moveChunk request accepted at version");
    }
    timing.done(2);

    // 3. plan the clone and prime the recipient
    let migration_id = MigrationId::new();
    let shard_key_pattern = rt
        .sharding
        .collection_metadata(&linked_ns)
        .ok_or_else(|| MigrateError::internal("no cached metadata after refresh"))?
        .key_pattern;
    if shard_key_pattern.pattern_doc().is_empty() {
        return Err(MigrateError::invalid("no shard key found"));
    }
    for ns in &linked_cols {
        let metadata = rt
            .sharding
            .collection_metadata(ns)
            .ok_or_else(|| MigrateError::internal("no cached metadata after refresh"))?;
        if metadata.key_pattern.pattern_doc() != shard_key_pattern.pattern_doc() {
            return Err(MigrateError::invalid(format!(
                "linked collection {} does not share the shard key pattern of {}",
                ns, linked_ns
            )));
        }
    }

    let guard = rt
        .donor
        .start(&linked_cols, &req.min, &req.max, &shard_key_pattern)?;

    // planning runs under a read lock, so every later mod is captured
    rt.donor.store_current_locs(req.max_chunk_size_bytes)?;

    let to_link = rt.link(&req.to)?;
    let started = to_link
        .recv_chunk_start(RecvChunkStart {
            ns: linked_ns.clone(),
            from: req.from.clone(),
            min: req.min.clone(),
            max: req.max.clone(),
            shard_key_pattern: shard_key_pattern.pattern_doc(),
            config_server: rt.sharding.config_server().unwrap_or_default(),
            secondary_throttle,
            migration_id,
        })
        .await?;
    if !started.started {
        return Err(MigrateError::RecipientFailed {
            cause: "moveChunk failed to engage TO-shard in the data transfer".to_string(),
        });
    }

    for ns in &linked_cols {
        let started = to_link
            .recv_chunk_start_one(RecvChunkStartOne {
                ns: ns.clone(),
                migration_id,
            })
            .await?;
        if !started.started {
            return Err(MigrateError::RecipientFailed {
                cause: format!(
                    "moveChunk failed to engage TO-shard in the data transfer of {}",
                    ns
                ),
            });
        }
    }
    timing.done(3);

    // 4. pause until the recipient catches up
    let mut reached_steady = false;
    for i in 0..config.max_status_polls {
        // exponential back-off up to 1024ms, fast for empty chunks
        sleep(Duration::from_millis(1 << std::cmp::min(i, 10))).await;

        let status = to_link.recv_chunk_status().await?;

        if status.ns != linked_ns
            || status.from != req.from
            || status.min != req.min
            || status.max != req.max
        {
            // the destination aborted and accepted another migration
            // before this thread saw the transition
            return Err(MigrateError::RecipientFailed {
                cause: format!(
                    "destination shard aborted migration, now running a new one: {}/{}",
                    status.ns, status.from
                ),
            });
        }

        info!(
            state = status.state.as_str(),
            cloned = status.counts.cloned,
            mem_used = rt.donor.bytes_used(),
            "moveChunk data transfer progress"
        );

        if status.state == MigrationPhase::Fail {
            warn!("moveChunk error transferring data caused migration abort");
            return Err(MigrateError::RecipientFailed {
                cause: status
                    .errmsg
                    .unwrap_or_else(|| "data transfer error".to_string()),
            });
        }

        if status.state == MigrationPhase::Steady {
            reached_steady = true;
            break;
        }

        let used = rt.donor.bytes_used();
        if used > config.max_capture_bytes {
            // too much memory spent buffering mods, abort and hint the
            // balancer to split
            let _ = to_link.recv_chunk_abort().await;
            error!(used, "aborting migrate because too much memory used");
            return Err(MigrateError::MemoryLimit { used_bytes: used });
        }

        if rt.interrupted.load(Ordering::SeqCst) {
            let _ = to_link.recv_chunk_abort().await;
            return Err(MigrateError::Interrupted);
        }
    }
    if !reached_steady {
        return Err(MigrateError::internal(
            "timed out waiting for recipient to reach steady state",
        ));
    }
    timing.done(4);

    // 5. critical section
    info!("about to check if it is safe to enter critical section");

    let locs_remaining = rt.donor.clone_locs_remaining();
    if locs_remaining != 0 {
        // should be unreachable once the recipient reports steady
        error!(
            locs_remaining,
            "moveChunk cannot enter critical section before all data is cloned"
        );
        debug_assert!(false, "clone locs remaining in critical section");
        return Err(MigrateError::internal(format!(
            "moveChunk cannot enter critical section, {} locs were not transferred",
            locs_remaining
        )));
    }

    if !dlk.is_held() {
        return Err(MigrateError::internal(
            "not entering migrate critical section because the distributed lock is gone",
        ));
    }

    info!("about to enter migrate critical section");
    rt.donor.set_in_critical_section(true);

    let mut my_version = max_version;
    my_version.inc_major();

    let mut snapshots: Vec<(String, CollectionMetadata)> = Vec::new();
    for ns in &linked_cols {
        match rt.sharding.donate_chunk(ns, &req.min, &req.max, my_version) {
            Ok(snapshot) => snapshots.push((ns.clone(), snapshot)),
            Err(e) => {
                undo_donations(rt, snapshots);
                rt.donor.set_in_critical_section(false);
                return Err(e);
            }
        }
    }
    info!(version = %my_version, "moveChunk setting version");

    // the collection lock is released here; the recipient drains one
    // final transfer round before acknowledging
    let commit_ok = match to_link.recv_chunk_commit().await {
        Ok(reply) => reply.ok,
        Err(e) => {
            warn!(error = %e, "moveChunk could not contact TO-shard to commit transfer");
            false
        }
    };

    if !commit_ok {
        info!(version = %max_version, "commit not accepted by TO-shard, resetting shard version");
        undo_donations(rt, snapshots);
        rt.donor.set_in_critical_section(false);
        info!("shard version successfully reset to clean up failed migration");
        return Err(MigrateError::RecipientFailed {
            cause: "_recvChunkCommit failed".to_string(),
        });
    }

    let last_version = my_version;
    info!("moveChunk migrate commit accepted by TO-shard");

    // one conditional batch updates the moved chunk and, when chunks
    // remain here, bumps one of them so stale routers still see this
    // shard's version advance
    let mut updates: Vec<ChunkRecord> = Vec::new();
    for ns in &linked_cols {
        updates.push(ChunkRecord {
            id: gen_chunk_id(ns, &req.min),
            ns: ns.clone(),
            min: req.min.clone(),
            max: req.max.clone(),
            shard: req.to.clone(),
            lastmod: last_version,
        });
    }

    let mut next_version = last_version;
    let remaining = rt
        .sharding
        .collection_metadata(&linked_ns)
        .map(|m| m.num_chunks())
        .unwrap_or(0);
    if remaining > 0 {
        let bump = rt
            .sharding
            .next_chunk(&linked_ns)
            .ok_or_else(|| MigrateError::internal("metadata reported chunks but none found"))?;
        debug_assert!(bump.min != req.min);
        next_version.inc_minor();
        for ns in &linked_cols {
            updates.push(ChunkRecord {
                id: gen_chunk_id(ns, &bump.min),
                ns: ns.clone(),
                min: bump.min.clone(),
                max: bump.max.clone(),
                shard: req.from.clone(),
                lastmod: next_version,
            });
        }
        info!(
            version = %next_version,
            bump_min = %bump.min,
            bump_max = %bump.max,
            "moveChunk updating self version"
        );
    } else {
        info!(ns = %linked_ns, "moveChunk moved last chunk out for collection");
    }

    let batch = MetaUpdate {
        updates,
        pre_condition: PreCondition {
            ns: linked_ns.clone(),
            expected_lastmod: max_version,
        },
    };

    match rt.meta.apply_updates(batch).await {
        Ok(()) => {}
        Err(MetaError::Unreachable(reason)) => {
            // the update never reached the authority, backing out is safe
            info!("about to reset shard version from failed migration");
            undo_donations(rt, snapshots);
            rt.donor.set_in_critical_section(false);
            info!("shard version successfully reset to clean up failed migration");
            return Err(MigrateError::MetaUnreachable {
                reason: format!("failed to send migrate commit to configs: {}", reason),
            });
        }
        Err(e) => {
            // possibly a connectivity blip; wait, then read back the
            // authority to learn whether the commit landed
            warn!(error = %e, "moveChunk commit outcome ongoing");
            sleep(Duration::from_secs(config.commit_confirm_delay_secs)).await;

            match rt.meta.latest_chunk(&linked_ns).await {
                Ok(Some(chunk)) if chunk.lastmod.is_equivalent_to(&next_version) => {
                    info!("moveChunk commit confirmed");
                }
                Ok(other) => {
                    error!(
                        found = %other.map(|c| c.lastmod.to_string()).unwrap_or_default(),
                        expected = %next_version,
                        "moveChunk commit failed, version mismatch"
                    );
                    fatal_divergence();
                }
                Err(e) => {
                    error!(error = %e, "moveChunk failed to get confirmation of commit");
                    fatal_divergence();
                }
            }
        }
    }

    rt.donor.set_in_critical_section(false);
    log_change(rt, "moveChunk.commit", &req.ns, chunk_info).await?;
    timing.done(5);

    // 6. cleanup while the distributed lock is still held, so no new
    // migration can overlap this range before its data is gone
    for ns in &linked_cols {
        let task = RangeDeletion {
            ns: ns.clone(),
            min: req.min.clone(),
            max: req.max.clone(),
            secondary_throttle,
        };
        if req.wait_for_delete {
            info!(ns = %ns, "doing delete inline for cleanup of chunk data");
            if let Err(e) = rt.deleter.delete_now(task).await {
                warn!(ns = %ns, error = %e, "error occurred while performing cleanup");
            }
        } else {
            info!(ns = %ns, "forking for cleanup of chunk data");
            if let Err(e) = rt.deleter.queue_delete(task) {
                warn!(ns = %ns, error = %e, "could not queue migration cleanup");
            }
        }
    }
    timing.done(6);

    // 7. tear down capture state, then let go of the distributed lock
    drop(guard);
    drop(dlk);
    Ok(())
}

fn undo_donations(rt: &Arc<ShardRuntime>, snapshots: Vec<(String, CollectionMetadata)>) {
    for (ns, snapshot) in snapshots {
        rt.sharding.undo_donate_chunk(&ns, snapshot);
    }
}

async fn log_change(
    rt: &Arc<ShardRuntime>,
    what: &str,
    ns: &str,
    details: serde_json::Value,
) -> Result<()> {
    rt.meta
        .log_change(rt.sharding.shard_name(), what, ns, details)
        .await
        .map_err(meta_unreachable)
}

fn meta_unreachable(e: MetaError) -> MigrateError {
    MigrateError::MetaUnreachable {
        reason: e.to_string(),
    }
}

fn fatal_divergence() -> ! {
    error!("TERMINATING");
    std::process::exit(crate::EXIT_SHARDING_ERROR);
}
