//! Runs against a live database only when `TALLY_TEST_DATABASE_URL` is set.

use std::time::Duration;

use tally_core::{Contact, CounterDelta, Gender, OrgId};
use tally_storage::{CheckpointStore, CounterScope, CounterStore, LockService, PgStore, RecordStore};

async fn connect() -> Option<PgStore> {
    let url = std::env::var("TALLY_TEST_DATABASE_URL").ok()?;
    let store = PgStore::connect(&url).await.expect("connect");
    store.migrate().await.expect("migrate");
    Some(store)
}

fn test_org() -> OrgId {
    OrgId(900_000 + i64::from(std::process::id() % 10_000))
}

#[tokio::test]
async fn contacts_checkpoints_and_counters_round_trip() {
    let Some(store) = connect().await else {
        return;
    };
    let org = test_org();

    let mut contact = Contact::bare(org, "pg-contact-1");
    contact.gender = Some(Gender::Female);
    contact.state = Some("R1".into());
    let deltas = vec![CounterDelta::new("total-reporters", 1)];
    store
        .save_batch(org, std::slice::from_ref(&contact), &deltas)
        .await
        .expect("save");

    let loaded: Option<Contact> = store.load(org, "pg-contact-1").await.expect("load");
    assert_eq!(loaded, Some(contact));

    let now = chrono::Utc::now();
    store.set_checkpoint(org, "contacts", now).await.expect("checkpoint");
    let stored = store.checkpoint(org, "contacts").await.expect("read").expect("present");
    assert_eq!(stored.timestamp(), now.timestamp());

    let before = store.counts(org, Some("total-reporters")).await.expect("counts");
    store
        .squash(&CounterScope::new(org, "total-reporters"))
        .await
        .expect("squash");
    let after = store.counts(org, Some("total-reporters")).await.expect("counts");
    assert_eq!(before, after);
}

#[tokio::test]
async fn leases_exclude_second_holder() {
    let Some(store) = connect().await else {
        return;
    };
    let key = format!("test-lease:{}", test_org());
    let lease = store
        .try_acquire(&key, Duration::from_secs(60))
        .await
        .expect("acquire")
        .expect("free");
    assert!(store
        .try_acquire(&key, Duration::from_secs(60))
        .await
        .expect("acquire")
        .is_none());
    store.release(&lease).await.expect("release");
    let again = store
        .try_acquire(&key, Duration::from_secs(60))
        .await
        .expect("acquire");
    assert!(again.is_some());
    store.release(&again.expect("lease")).await.expect("release");
}
