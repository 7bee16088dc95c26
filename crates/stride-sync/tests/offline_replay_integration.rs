//! End-to-end offline queue tests
//!
//! Drives the mutation path from terminal failure through durable parking,
//! reconnect, and replay, including restart survival over shared storage.

mod test_support;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stride_sync::{
    KeyValueStore, MemoryStore, Method, MutationOutcome, MutationStatus, Operation,
};
use test_support::{test_client, test_client_with_storage, Script};

fn log_meal_op() -> Operation {
    Operation::write(
        "records.write",
        Method::POST,
        "/rest/v1/meals",
        json!({"title": "lunch", "completed_at": "2026-08-07T12:00:00Z"}),
    )
}

#[tokio::test]
async fn failed_mutation_is_parked_and_replayed_on_reconnect() {
    let (client, transport) = test_client(vec![
        Script::ConnectError,
        Script::ConnectError,
        Script::ConnectError,
        Script::Respond(201, r#"{"id": 11}"#),
    ]);

    let outcome = client.mutate_or_queue(log_meal_op(), Some("user-1")).await;
    let queued_id = match outcome {
        MutationOutcome::Queued { id, .. } => id,
        other => panic!("expected queued outcome, got {other:?}"),
    };
    assert_eq!(client.offline_queue().len(), 1);

    let handle = client.clone().spawn_reconnect_sync();
    client.connectivity().set_online(false);
    client.connectivity().set_online(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(client.offline_queue().is_empty());
    assert_eq!(transport.sends(), 4);
    assert!(!queued_id.is_empty());
    handle.abort();
}

#[tokio::test]
async fn duplicate_mutations_collapse_to_one_entry() {
    let (client, _) = test_client(vec![
        Script::ConnectError,
        Script::ConnectError,
        Script::ConnectError,
        Script::ConnectError,
        Script::ConnectError,
        Script::ConnectError,
    ]);

    let first = client.mutate_or_queue(log_meal_op(), Some("user-1")).await;
    // Same title, near-identical completion timestamp, enqueued right after
    let duplicate = Operation::write(
        "records.write",
        Method::POST,
        "/rest/v1/meals",
        json!({"title": "lunch", "completed_at": "2026-08-07T12:00:10Z"}),
    );
    let second = client.mutate_or_queue(duplicate, Some("user-1")).await;

    let (MutationOutcome::Queued { id: first_id, .. }, MutationOutcome::Queued { id: second_id, .. }) =
        (first, second)
    else {
        panic!("expected both mutations to queue");
    };
    assert_eq!(first_id, second_id);
    assert_eq!(client.offline_queue().len(), 1);
}

#[tokio::test]
async fn entry_failing_repeatedly_is_dropped() {
    // Initial attempt (3 sends) + three failed replays (3 sends each)
    let mut script = vec![Script::ConnectError; 12];
    script.push(Script::Respond(201, "{}"));
    let (client, transport) = test_client(script);

    client.mutate_or_queue(log_meal_op(), None).await;

    for _ in 0..3 {
        let report = client.sync_offline(None).await;
        assert_eq!(report.failed, 1);
    }
    assert_eq!(transport.sends(), 12);
    assert_eq!(client.offline_queue().entries()[0].retry_count, 3);

    // At the ceiling: dropped without another attempt
    let report = client.sync_offline(None).await;
    assert_eq!(report.dropped.len(), 1);
    assert!(client.offline_queue().is_empty());
    assert_eq!(transport.sends(), 12);
}

#[tokio::test]
async fn queue_survives_process_restart() {
    let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    {
        let (client, _) = test_client_with_storage(
            vec![
                Script::ConnectError,
                Script::ConnectError,
                Script::ConnectError,
            ],
            storage.clone(),
        );
        client.mutate_or_queue(log_meal_op(), Some("user-1")).await;
        assert_eq!(client.offline_queue().len(), 1);
    }

    // A fresh client over the same storage sees the parked entry, reset to
    // queued, and replays it
    let (reopened, transport) =
        test_client_with_storage(vec![Script::Respond(201, "{}")], storage);
    assert_eq!(reopened.offline_queue().len(), 1);
    assert_eq!(
        reopened.offline_queue().entries()[0].status,
        MutationStatus::Queued
    );

    let report = reopened.sync_offline(None).await;
    assert_eq!(report.replayed, 1);
    assert!(reopened.offline_queue().is_empty());
    assert_eq!(transport.sends(), 1);
}

#[tokio::test]
async fn replay_is_scoped_to_the_owner_session() {
    let (client, _) = test_client(vec![
        Script::ConnectError,
        Script::ConnectError,
        Script::ConnectError,
        Script::ConnectError,
        Script::ConnectError,
        Script::ConnectError,
        Script::Respond(201, "{}"),
    ]);

    client.mutate_or_queue(log_meal_op(), Some("user-1")).await;
    let other = Operation::write(
        "records.write",
        Method::POST,
        "/rest/v1/meals",
        json!({"title": "dinner", "completed_at": "2026-08-07T19:00:00Z"}),
    );
    client.mutate_or_queue(other, Some("user-2")).await;

    let report = client.sync_offline(Some("user-1")).await;
    assert_eq!(report.replayed, 1);

    let remaining = client.offline_queue().entries();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].owner.as_deref(), Some("user-2"));
}

#[tokio::test]
async fn sync_while_offline_does_nothing() {
    let (client, transport) = test_client(vec![
        Script::ConnectError,
        Script::ConnectError,
        Script::ConnectError,
    ]);

    client.mutate_or_queue(log_meal_op(), None).await;
    let sends_after_park = transport.sends();

    client.connectivity().set_online(false);
    let report = client.sync_offline(None).await;
    assert_eq!(report.replayed, 0);
    assert_eq!(transport.sends(), sends_after_park);
    assert_eq!(client.offline_queue().len(), 1);
}
