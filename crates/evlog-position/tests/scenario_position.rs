//! Scenario tests for cursor advancement and state persistence (S1, S2, R2).

use std::sync::Arc;

use chrono::Utc;
use evlog_position::PositionStore;
use evlog_testkit::InMemoryObjectStore;

/// S1 — Fresh start, single page: three events at epoch 7 land in order;
/// the resulting state matches `(epoch:7, height:2, tx:0, events_recorded:3)`.
#[tokio::test]
async fn fresh_start_single_page_advances_to_final_position() {
    let store: Arc<dyn evlog_objstore::ObjectStore> = Arc::new(InMemoryObjectStore::new());
    let mut pos = PositionStore::load(store, "boards-created", Utc::now()).await.unwrap();

    for (height, tx_index) in [(1, 0), (1, 1), (2, 0)] {
        pos.advance(7, height, tx_index, Utc::now()).await.unwrap();
    }

    let state = pos.state();
    assert_eq!(state.epoch, 7);
    assert_eq!(state.last_processed_height, 2);
    assert_eq!(state.last_processed_tx, 0);
    assert_eq!(state.events_recorded, 3);
}

/// S2 — Resume mid-block: starting from a persisted cursor `(7,1,1)`, events
/// at and after the cursor advance the state; none of them regress it, and
/// the cursor used for the next poll only ever looks forward.
#[tokio::test]
async fn resume_mid_block_advances_past_persisted_cursor() {
    let store: Arc<dyn evlog_objstore::ObjectStore> = Arc::new(InMemoryObjectStore::new());
    {
        let mut pos = PositionStore::load(Arc::clone(&store), "boards-created", Utc::now())
            .await
            .unwrap();
        pos.advance(7, 1, 1, Utc::now()).await.unwrap();
        pos.flush().await.unwrap();
    }

    let mut pos = PositionStore::load(Arc::clone(&store), "boards-created", Utc::now())
        .await
        .unwrap();
    assert_eq!(pos.state().cursor(), evlog_schemas::Cursor { epoch: 7, height: 1, tx_index: 1 });

    for (height, tx_index) in [(1, 2), (2, 0), (2, 1)] {
        pos.advance(7, height, tx_index, Utc::now()).await.unwrap();
    }

    let state = pos.state();
    assert_eq!((state.last_processed_height, state.last_processed_tx), (2, 1));
    assert_eq!(state.events_recorded, 3);
}

/// R2 — `load(save(state)) == state`.
#[tokio::test]
async fn load_after_flush_round_trips_state_exactly() {
    let store: Arc<dyn evlog_objstore::ObjectStore> = Arc::new(InMemoryObjectStore::new());
    let mut pos = PositionStore::load(Arc::clone(&store), "boards-created", Utc::now())
        .await
        .unwrap();
    pos.advance(3, 20, 4, Utc::now()).await.unwrap();
    pos.flush().await.unwrap();

    let reloaded = PositionStore::load(store, "boards-created", Utc::now()).await.unwrap();
    assert_eq!(reloaded.state(), pos.state());
}
