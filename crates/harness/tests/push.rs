use fieldsync_core::{EntityRef, Operation, SyncVersion};
use fieldsync_engine::{ClientConfig, EngineError, RetryConfig, ServerConfig, TransportError};
use fieldsync_harness::{Fault, TestNetwork, TestServer};
use fieldsync_storage::{BatchStatus, OutboxStatus, OutboxStore};
use serde_json::json;

// ============================================================================
// Outbox chaining (3 tests)
// ============================================================================

#[test]
fn successive_edits_push_as_one_chain() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let a = net.add_device()?;
    let device = net.device_mut(a);

    device.create("photo", "p1", json!({"caption": "north wall"}))?;
    device.update("photo", "p1", json!({"caption": "north wall, after"}))?;
    let last = device.update("photo", "p1", json!({"caption": "north wall, final"}))?;
    assert_eq!(last.base_version, SyncVersion::new(2));
    assert_eq!(last.target_version, SyncVersion::new(3));

    let report = device.manager.push()?;
    assert_eq!(report.sent, 3);
    assert_eq!(report.applied, 3);
    assert_eq!(device.server_version("photo", "p1")?, SyncVersion::new(3));

    let ledger = net
        .server()
        .ledger_entry(&EntityRef::new("photo", "p1"))?
        .ok_or("missing row")?;
    assert_eq!(ledger.version, SyncVersion::new(3));
    assert_eq!(
        ledger.payload.to_value::<serde_json::Value>()?,
        json!({"caption": "north wall, final"})
    );
    Ok(())
}

#[test]
fn edits_after_push_continue_from_confirmed_version() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let a = net.add_device()?;
    let device = net.device_mut(a);

    device.create("photo", "p1", json!({"n": 1}))?;
    device.manager.push()?;
    let next = device.update("photo", "p1", json!({"n": 2}))?;
    assert_eq!(next.base_version, SyncVersion::new(1));

    let deleted = device.write("photo", "p1", Operation::Delete, json!(null))?;
    assert_eq!(deleted.base_version, SyncVersion::new(2));
    assert!(device.local("photo", "p1")?.ok_or("missing local")?.deleted);

    let report = device.manager.push()?;
    assert_eq!(report.applied, 2);
    let ledger = net
        .server()
        .ledger_entry(&EntityRef::new("photo", "p1"))?
        .ok_or("missing row")?;
    assert_eq!(ledger.last_operation, Operation::Delete);
    assert_eq!(ledger.version, SyncVersion::new(3));
    Ok(())
}

#[test]
fn invalid_local_writes_never_reach_the_outbox() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let a = net.add_device()?;
    let device = net.device_mut(a);

    let err = device
        .manager
        .write_local(EntityRef::new("photo", ""), Operation::Create, fieldsync_core::DeltaPayload::null())
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let err = device
        .manager
        .write_local(
            EntityRef::new("photo", "p1"),
            Operation::Create,
            fieldsync_core::DeltaPayload::from_raw("{not json"),
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPayload(_)));

    assert_eq!(device.outbox()?.unsynced(), 0);
    assert!(device.local("photo", "p1")?.is_none());
    Ok(())
}

// ============================================================================
// Batching and rejection (4 tests)
// ============================================================================

#[test]
fn batch_size_defers_whole_entity_chains() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let a = net.add_device_with(ClientConfig::default().with_push_batch_size(2))?;
    let device = net.device_mut(a);

    device.create("photo", "p1", json!({}))?;
    device.create("photo", "p2", json!({}))?;
    device.update("photo", "p2", json!({"edited": true}))?;

    let first = device.manager.push()?;
    assert_eq!(first.sent, 1);
    assert_eq!(first.deferred, 2);

    let second = device.manager.push()?;
    assert_eq!(second.sent, 2);
    assert_eq!(second.applied, 2);
    assert_eq!(device.outbox()?.unsynced(), 0);
    Ok(())
}

#[test]
fn rejected_deltas_fail_without_blocking_the_batch() -> Result<(), Box<dyn std::error::Error>> {
    let server =
        TestServer::with_config(ServerConfig::default().with_entity_types(["installation", "photo"]))?;
    let mut net = TestNetwork::with_server(server);
    let a = net.add_device()?;
    let device = net.device_mut(a);

    device.create("photo", "p1", json!({}))?;
    let stray = device.create("measurement", "m1", json!({"mm": 1200}))?;

    let report = device.manager.push()?;
    assert_eq!(report.status, Some(BatchStatus::Applied));
    assert_eq!(report.applied, 1);
    assert_eq!(report.rejected, 1);

    let entry = device.manager.store().get(stray.id)?.ok_or("entry vanished")?;
    assert_eq!(entry.status, OutboxStatus::Failed);
    assert_eq!(entry.retry_count, 1);
    assert!(entry.last_error.ok_or("no reason")?.contains("measurement"));
    Ok(())
}

#[test]
fn rejected_edit_does_not_turn_later_edits_into_conflicts() -> Result<(), Box<dyn std::error::Error>> {
    let server = TestServer::with_config(ServerConfig::default().with_max_payload_bytes(32))?;
    let mut net = TestNetwork::with_server(server);
    let a = net.add_device()?;
    let device = net.device_mut(a);
    let p1 = EntityRef::new("photo", "p1");

    device.create("photo", "p1", json!({"n": 1}))?;
    device.manager.push()?;

    let oversized = device.update("photo", "p1", json!({"caption": "x".repeat(64)}))?;
    let good = device.update("photo", "p1", json!({"n": 2}))?;
    assert_eq!(good.base_version, SyncVersion::new(2));

    // The good edit is moved onto v1 and lands in the same push.
    let report = device.manager.push()?;
    assert_eq!(report.rejected, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(report.conflicted, 0);
    assert_eq!(report.rebased, 1);
    assert_eq!(report.blocked, 0);
    assert!(report.conflicts.is_empty());

    let ledger = net.server().ledger_entry(&p1)?.ok_or("missing row")?;
    assert_eq!(ledger.version, SyncVersion::new(2));
    assert_eq!(ledger.payload.to_value::<serde_json::Value>()?, json!({"n": 2}));

    let device = net.device_mut(a);
    let applied = device.manager.store().get(good.id)?.ok_or("entry vanished")?;
    assert_eq!(applied.status, OutboxStatus::Synced);
    assert_eq!(applied.base_version, SyncVersion::new(1));
    let refused = device.manager.store().get(oversized.id)?.ok_or("entry vanished")?;
    assert_eq!(refused.status, OutboxStatus::Failed);
    assert!(refused.rejected);
    assert!(refused.last_error.ok_or("no reason")?.contains("limit"));
    assert_eq!(device.server_version("photo", "p1")?, SyncVersion::new(2));

    // Later edits build on the accepted version; the refused entry is
    // refused again without getting in their way.
    let next = device.update("photo", "p1", json!({"n": 3}))?;
    assert_eq!(next.base_version, SyncVersion::new(2));
    let again = device.manager.push()?;
    assert_eq!(again.applied, 1);
    assert_eq!(again.rejected, 1);
    assert_eq!(net.server().ledger_version(&p1)?, SyncVersion::new(3));
    assert!(net.server().service().list_conflicts(None, None)?.is_empty());
    Ok(())
}

#[test]
fn oversized_batch_is_refused_and_entries_stay_failed() -> Result<(), Box<dyn std::error::Error>> {
    let server = TestServer::with_config(ServerConfig::default().with_max_push_batch(1))?;
    let mut net = TestNetwork::with_server(server);
    let a = net.add_device()?;
    let device = net.device_mut(a);

    device.create("photo", "p1", json!({}))?;
    device.update("photo", "p1", json!({"n": 2}))?;

    // A single chain is sent whole even though it exceeds the server limit.
    let err = device.manager.push().unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
    assert_eq!(device.outbox()?.failed, 2);
    assert_eq!(net.server().ledger_len()?, 0);
    Ok(())
}

// ============================================================================
// Transport failures (3 tests)
// ============================================================================

#[test]
fn unavailable_server_marks_entries_failed() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let a = net.add_device_with(ClientConfig::default().with_retry(RetryConfig::no_retry()))?;
    let device = net.device_mut(a);

    let entry = device.create("photo", "p1", json!({}))?;
    device.faults().push(Fault::Unavailable);

    let err = device.manager.push().unwrap_err();
    assert!(matches!(err, EngineError::Transport(TransportError::Unavailable(_))));

    let failed = device.manager.store().get(entry.id)?.ok_or("entry vanished")?;
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(device.manager.transport().delivered(), 0);

    // The next push resends the same delta and succeeds.
    let report = device.manager.push()?;
    assert_eq!(report.applied, 1);
    assert_eq!(device.outbox()?.synced, 1);
    Ok(())
}

#[test]
fn lost_response_without_retry_is_recovered_by_next_push() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let a = net.add_device_with(ClientConfig::default().with_retry(RetryConfig::no_retry()))?;
    let device = net.device_mut(a);

    device.create("installation", "E", json!({"status": "planned"}))?;
    device.faults().push(Fault::DropResponse);

    let err = device.manager.push().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(device.outbox()?.failed, 1);

    // A new batch carrying the same delta id replays the stored outcome.
    let report = device.manager.push()?;
    assert_eq!(report.status, Some(BatchStatus::Applied));
    assert_eq!(report.applied, 1);
    assert_eq!(
        net.server().ledger_version(&EntityRef::new("installation", "E"))?,
        SyncVersion::new(1)
    );
    Ok(())
}

#[test]
fn retries_give_up_after_max_attempts() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let a = net.add_device()?;
    let device = net.device_mut(a);

    device.create("photo", "p1", json!({}))?;
    device.faults().push_n(Fault::Unavailable, 3);

    let err = device.manager.push().unwrap_err();
    assert!(matches!(err, EngineError::Transport(TransportError::Unavailable(_))));
    assert_eq!(device.faults().pending(), 0);
    assert_eq!(device.outbox()?.failed, 1);
    Ok(())
}
