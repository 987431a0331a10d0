use std::{sync::Arc, time::Duration};

use client_core::{DropOutcome, LogSession, SessionOptions};
use shared::{
    domain::{CollaboratorId, EntryId, LogId},
    order::OrderMap,
};
use storage::{DocumentStore, Storage};

fn ids(values: &[&str]) -> Vec<EntryId> {
    values.iter().copied().map(EntryId::from).collect()
}

async fn storage() -> Arc<Storage> {
    Arc::new(Storage::new("sqlite::memory:").await.expect("db"))
}

fn options(author: &str) -> SessionOptions {
    SessionOptions {
        retry_delay: Duration::from_millis(1),
        author: Some(CollaboratorId::from(author)),
        ..SessionOptions::default()
    }
}

#[tokio::test]
async fn drag_and_drop_round_trips_through_sqlite() {
    let storage = storage().await;
    let log_id = LogId::from("friday-night");
    storage
        .set(
            &log_id,
            &OrderMap::from_ranks([("alien", 0), ("brazil", 1), ("cube", 2)], 0),
        )
        .await
        .expect("seed");

    let store: Arc<dyn DocumentStore> = storage.clone();
    let session = LogSession::open(log_id.clone(), store, options("alice"))
        .await
        .expect("open");

    session.begin_drag(&EntryId::from("alien")).expect("begin");
    session.drag_over(&EntryId::from("alien"), &EntryId::from("cube"));
    let outcome = session
        .complete_drop(&EntryId::from("alien"))
        .await
        .expect("drop");

    assert_eq!(outcome, DropOutcome::Committed { seq: 2 });
    let stored = storage.get(&log_id).await.expect("reload");
    assert_eq!(stored.sorted_ids(), ids(&["brazil", "cube", "alien"]));
    assert_eq!(stored.seq(), 2);
    assert_eq!(session.persisted(), stored);
}

#[tokio::test]
async fn sessions_on_one_database_converge() {
    let storage = storage().await;
    let log_id = LogId::from("shared");
    let store: Arc<dyn DocumentStore> = storage.clone();

    let alice = LogSession::open(log_id.clone(), Arc::clone(&store), options("alice"))
        .await
        .expect("alice");
    let bob = LogSession::open(log_id.clone(), Arc::clone(&store), options("bob"))
        .await
        .expect("bob");

    alice.add_entry(EntryId::from("heat")).await.expect("add heat");
    bob.add_entry(EntryId::from("ronin")).await.expect("add ronin");
    alice.refresh().await.expect("alice refresh");
    bob.refresh().await.expect("bob refresh");

    // Both appended at rank 0; ties fall back to the entry id.
    assert_eq!(alice.order(), ids(&["heat", "ronin"]));
    assert_eq!(alice.order(), bob.order());

    bob.remove_entry(&EntryId::from("heat"))
        .await
        .expect("remove heat");
    alice.refresh().await.expect("alice refresh");
    assert_eq!(alice.order(), ids(&["ronin"]));

    let summaries = storage.list_logs().await.expect("list");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].entry_count, 1);
    assert_eq!(summaries[0].seq, 3);
}
