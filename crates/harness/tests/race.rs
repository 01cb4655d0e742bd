use std::sync::{Arc, Barrier};
use std::thread;

use fieldsync_core::{BatchId, DeltaPayload, DeviceId, EntityRef, Operation, SyncDelta, SyncVersion};
use fieldsync_engine::{DeltaStatus, PushRequest, PushResponse, SyncService};
use fieldsync_harness::{TestServer, init_tracing};
use fieldsync_storage::{BatchStatus, ConflictStatus};
use serde_json::json;

fn push_one(
    service: &mut SyncService,
    device: DeviceId,
    entity: &EntityRef,
    from: SyncVersion,
    value: serde_json::Value,
) -> Result<PushResponse, Box<dyn std::error::Error + Send + Sync>> {
    let operation = if from.is_initial() { Operation::Create } else { Operation::Update };
    let delta = SyncDelta::new(
        entity.clone(),
        operation,
        from,
        DeltaPayload::from_value(&value)?,
        0,
    )?;
    Ok(service.push_batch(PushRequest {
        batch_id: BatchId::new(),
        device_id: device,
        deltas: vec![delta],
    })?)
}

// ============================================================================
// Concurrent writers on one database file (2 tests)
// ============================================================================

#[test]
fn racing_updates_from_one_version_apply_once() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let server = TestServer::new()?;

    for round in 0..10 {
        let entity = EntityRef::new("installation", format!("inst-{round}"));
        let mut seed = server.open_service()?;
        push_one(&mut seed, DeviceId::new(), &entity, SyncVersion::INITIAL, json!({"v": 1}))
            .map_err(|e| e.to_string())?;

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|writer| -> Result<_, Box<dyn std::error::Error>> {
                let mut service = server.open_service()?;
                let barrier = Arc::clone(&barrier);
                let entity = entity.clone();
                Ok(thread::spawn(move || {
                    barrier.wait();
                    push_one(
                        &mut service,
                        DeviceId::new(),
                        &entity,
                        SyncVersion::new(1),
                        json!({"writer": writer}),
                    )
                }))
            })
            .collect::<Result<_, Box<dyn std::error::Error>>>()?;

        let mut responses = Vec::new();
        for handle in handles {
            let response = handle
                .join()
                .map_err(|_| "writer thread panicked")?
                .map_err(|e| e.to_string())?;
            responses.push(response);
        }

        let applied = responses
            .iter()
            .filter(|r| r.status == BatchStatus::Applied)
            .count();
        let conflicted: Vec<_> = responses
            .iter()
            .filter(|r| r.status == BatchStatus::Conflict)
            .collect();
        assert_eq!(applied, 1, "round {round}");
        assert_eq!(conflicted.len(), 1, "round {round}");

        let conflict = &conflicted[0].conflicts[0];
        assert_eq!(conflict.server_version, SyncVersion::new(2));
        assert_eq!(conflict.status, ConflictStatus::Unresolved);
        assert!(matches!(
            conflicted[0].results[0].status,
            DeltaStatus::Conflict { .. }
        ));
        assert_eq!(server.ledger_version(&entity)?, SyncVersion::new(2));
    }
    Ok(())
}

#[test]
fn writers_on_separate_connections_stamp_in_order() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let server = TestServer::new()?;
    let mut first = server.open_service()?;
    let mut second = server.open_service()?;

    let a = EntityRef::new("photo", "a");
    let b = EntityRef::new("photo", "b");
    push_one(&mut first, DeviceId::new(), &a, SyncVersion::INITIAL, json!({}))
        .map_err(|e| e.to_string())?;
    push_one(&mut second, DeviceId::new(), &b, SyncVersion::INITIAL, json!({}))
        .map_err(|e| e.to_string())?;
    push_one(&mut first, DeviceId::new(), &a, SyncVersion::new(1), json!({"n": 2}))
        .map_err(|e| e.to_string())?;

    // Each write sorts after every row written before it, whichever
    // connection made it.
    let a_entry = server.ledger_entry(&a)?.ok_or("missing a")?;
    let b_entry = server.ledger_entry(&b)?.ok_or("missing b")?;
    assert!(a_entry.last_modified > b_entry.last_modified);
    assert_eq!(a_entry.version, SyncVersion::new(2));
    Ok(())
}
