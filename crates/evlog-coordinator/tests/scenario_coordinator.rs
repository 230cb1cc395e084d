//! End-to-end scenario tests driving a real `Coordinator` over
//! `evlog-testkit` fakes (S1, S2).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use evlog_coordinator::{Coordinator, CoordinatorConfig};
use evlog_lock::DistributedLock;
use evlog_objstore::ObjectStore;
use evlog_position::PositionStore;
use evlog_puller::ChronologicalPuller;
use evlog_schemas::{Attr, Event, TrackDef};
use evlog_testkit::{InMemoryObjectStore, ScriptedTransport};
use evlog_writer::BufferedWriter;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn event(epoch: i64, height: i64, tx_index: i64) -> Event {
    Event {
        epoch,
        height,
        tx_index,
        pkg_path: "gno.land/r/demo/boards".to_string(),
        event_type: "CreateBoard".to_string(),
        timestamp: 1_700_000_000,
        attrs: vec![Attr { key: "title".to_string(), value: "hello".to_string() }],
    }
}

fn events_page(events: &[Event]) -> serde_json::Value {
    json!({ "events": events.iter().map(|e| serde_json::to_value(e).unwrap()).collect::<Vec<_>>() })
}

async fn run_one_pass(
    store: Arc<dyn ObjectStore>,
    pages: Vec<serde_json::Value>,
    track_id: &str,
) -> PositionStore {
    let lock = Arc::new(DistributedLock::new(Arc::clone(&store)));
    let writer = Arc::new(BufferedWriter::new(Arc::clone(&store), track_id, 1_000_000, Utc::now()));
    let transport = Arc::new(ScriptedTransport::with_event_pages(pages));
    let puller = Arc::new(ChronologicalPuller::new(transport, "gno.land/r/demo/boards", None));

    let track = TrackDef {
        track_id: track_id.to_string(),
        realm_path: "gno.land/r/demo/boards".to_string(),
        event_type_prefix: None,
        window: 1_000_000,
    };

    let cancel = CancellationToken::new();
    let (coordinator, _state_rx) = Coordinator::new(
        track,
        lock,
        puller,
        writer,
        CoordinatorConfig {
            holder_id: "worker-a".to_string(),
            lease_ttl_secs: 30,
            poll_interval: Duration::from_millis(5),
            flush_interval: chrono::Duration::seconds(60),
            max_restart_attempts: 3,
        },
        cancel.clone(),
    );

    let mut position = PositionStore::load(Arc::clone(&store), track_id, Utc::now()).await.unwrap();

    let canceller = cancel.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        canceller.cancel();
    });

    coordinator.run(&mut position).await.unwrap();
    handle.await.unwrap();

    position
}

/// S1 — Fresh start, single page: empty state store, one page of three
/// events `(1,0), (1,1), (2,0)` at epoch 7, then empty pages. Final state
/// matches `{epoch:7, height:2, tx:0, events_recorded:3}`.
#[tokio::test]
async fn fresh_start_single_page_matches_expected_final_state() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
    let page = events_page(&[event(7, 1, 0), event(7, 1, 1), event(7, 2, 0)]);

    let position = run_one_pass(Arc::clone(&store), vec![page], "boards-created").await;

    let state = position.state();
    assert_eq!(state.epoch, 7);
    assert_eq!(state.last_processed_height, 2);
    assert_eq!(state.last_processed_tx, 0);
    assert_eq!(state.events_recorded, 3);

    let objects: Vec<String> = store.list("events/boards-created/").await.unwrap();
    assert_eq!(objects.len(), 1, "three events under one epoch/hour flush as a single object");
}

/// S2 — Resume mid-block: starting from a persisted cursor `(7,1,1)`, the
/// endpoint serves `(1,2), (2,0), (2,1)`. All three persist; state advances
/// to `(2,1)`; nothing at or before the cursor is re-emitted (the puller
/// only ever requests events strictly after the cursor it's given).
#[tokio::test]
async fn resume_mid_block_advances_past_cursor_without_reemitting() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());

    {
        let mut seed = PositionStore::load(Arc::clone(&store), "boards-created", Utc::now())
            .await
            .unwrap();
        seed.advance(7, 1, 1, Utc::now()).await.unwrap();
        seed.flush().await.unwrap();
    }

    let page = events_page(&[event(7, 1, 2), event(7, 2, 0), event(7, 2, 1)]);
    let position = run_one_pass(Arc::clone(&store), vec![page], "boards-created").await;

    let state = position.state();
    assert_eq!((state.last_processed_height, state.last_processed_tx), (2, 1));
    assert_eq!(state.events_recorded, 4, "one seeded event plus three resumed events");
}
