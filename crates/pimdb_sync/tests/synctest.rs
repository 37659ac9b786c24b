//! End-to-end synchronizer scenarios against the dummy source.

use pimdb_codec::Value;
use pimdb_core::{Comparator, Query};
use pimdb_sync::{Reconciler, SyncStore, Synchronizer};
use pimdb_testkit::{props, DummySource, TestContext};
use std::collections::BTreeMap;
use std::sync::Arc;

fn remote_mail(subject: &str, uid: &str) -> BTreeMap<String, Value> {
    let mut properties = BTreeMap::new();
    properties.insert("subject".to_string(), Value::Text(subject.into()));
    properties.insert("uid".to_string(), Value::Text(uid.into()));
    properties
}

#[test]
fn initial_sync_materializes_remote_entities() {
    let context = TestContext::new(&["r1"]);
    let (source, state) = DummySource::new();
    let synchronizer = Synchronizer::attach(context.resource("r1"), source);

    for i in 0..5 {
        state
            .borrow_mut()
            .insert("mail", &format!("m{i}"), remote_mail(&format!("s{i}"), &format!("u{i}")));
    }

    synchronizer.synchronize(&Query::of_type("mail"));
    synchronizer.process_sync_queue().unwrap();

    let model = context
        .store
        .load(Query::of_type("mail").resource("r1"))
        .unwrap();
    assert_eq!(model.row_count(), 5);
}

#[test]
fn repeated_sync_is_idempotent() {
    let context = TestContext::new(&["r1"]);
    let (source, state) = DummySource::new();
    let synchronizer = Synchronizer::attach(context.resource("r1"), source);

    state
        .borrow_mut()
        .insert("mail", "m1", remote_mail("hello", "u1"));

    synchronizer.synchronize(&Query::of_type("mail"));
    synchronizer.process_sync_queue().unwrap();
    let after_first = context.resource("r1").max_revision().unwrap();

    synchronizer.synchronize(&Query::of_type("mail"));
    synchronizer.process_sync_queue().unwrap();
    let after_second = context.resource("r1").max_revision().unwrap();

    // Unchanged remote state produces no new local revisions.
    assert_eq!(after_first, after_second);
}

#[test]
fn faulty_source_fails_cleanly_then_recovers() {
    let context = TestContext::new(&["r1"]);
    let (source, state) = DummySource::new();
    let synchronizer = Synchronizer::attach(context.resource("r1"), source);

    state.borrow_mut().fail_with(401, "invalid credentials");
    synchronizer.synchronize(&Query::of_type("mail"));
    let error = synchronizer.process_sync_queue().unwrap_err();
    assert_eq!(error.code(), 401);

    // Local state is untouched.
    let model = context
        .store
        .load(Query::of_type("mail").resource("r1"))
        .unwrap();
    assert_eq!(model.row_count(), 0);

    // A subsequent valid sync succeeds.
    state.borrow_mut().recover();
    state
        .borrow_mut()
        .insert("mail", "m1", remote_mail("back", "u1"));
    synchronizer.synchronize(&Query::of_type("mail"));
    synchronizer.process_sync_queue().unwrap();

    let model = context
        .store
        .load(Query::of_type("mail").resource("r1"))
        .unwrap();
    assert_eq!(model.row_count(), 1);
}

#[test]
fn remote_removals_propagate_on_next_sync() {
    let context = TestContext::new(&["r1"]);
    let (source, state) = DummySource::new();
    let synchronizer = Synchronizer::attach(context.resource("r1"), source);

    for i in 0..5 {
        state
            .borrow_mut()
            .insert("mail", &format!("m{i}"), remote_mail(&format!("s{i}"), &format!("u{i}")));
    }
    synchronizer.synchronize(&Query::of_type("mail"));
    synchronizer.process_sync_queue().unwrap();

    // The server drops everything but the first message.
    for i in 1..5 {
        state.borrow_mut().remove("mail", &format!("m{i}"));
    }
    synchronizer.synchronize(&Query::of_type("mail"));
    synchronizer.process_sync_queue().unwrap();

    let model = context
        .store
        .load(Query::of_type("mail").resource("r1"))
        .unwrap();
    assert_eq!(model.row_count(), 1);
    assert_eq!(
        model
            .entity_at(0)
            .unwrap()
            .property("uid")
            .and_then(Value::as_text),
        Some("u0")
    );
}

#[test]
fn remote_modification_updates_local_entity() {
    let context = TestContext::new(&["r1"]);
    let (source, state) = DummySource::new();
    let synchronizer = Synchronizer::attach(context.resource("r1"), source);

    state
        .borrow_mut()
        .insert("mail", "m1", remote_mail("old subject", "u1"));
    synchronizer.synchronize(&Query::of_type("mail"));
    synchronizer.process_sync_queue().unwrap();

    state
        .borrow_mut()
        .insert("mail", "m1", remote_mail("new subject", "u1"));
    synchronizer.synchronize(&Query::of_type("mail"));
    synchronizer.process_sync_queue().unwrap();

    let model = context
        .store
        .load(Query::of_type("mail").resource("r1"))
        .unwrap();
    assert_eq!(model.row_count(), 1);
    assert_eq!(
        model
            .entity_at(0)
            .unwrap()
            .property("subject")
            .and_then(Value::as_text),
        Some("new subject")
    );
}

#[test]
fn local_writes_replay_to_the_source() {
    let context = TestContext::new(&["r1"]);
    let (source, state) = DummySource::new();
    let _synchronizer = Synchronizer::attach(context.resource("r1"), source);

    let id = context
        .store
        .create("r1", "mail", props(&[("subject", "outgoing"), ("uid", "u1")]))
        .wait()
        .into_result()
        .unwrap();
    context.store.process_events().unwrap();

    assert_eq!(state.borrow().count("mail"), 1);

    context
        .store
        .modify("r1", "mail", id, props(&[("subject", "edited")]))
        .wait()
        .into_result()
        .unwrap();
    context.store.process_events().unwrap();

    let state_ref = state.borrow();
    let (_, properties) = state_ref
        .entities
        .get("mail")
        .and_then(|mails| mails.iter().next())
        .expect("mail pushed to source");
    assert_eq!(
        properties.get("subject").and_then(Value::as_text),
        Some("edited")
    );
    drop(state_ref);

    context
        .store
        .remove("r1", "mail", id)
        .wait()
        .into_result()
        .unwrap();
    context.store.process_events().unwrap();
    assert_eq!(state.borrow().count("mail"), 0);
}

#[test]
fn synced_entities_are_not_echoed_back() {
    let context = TestContext::new(&["r1"]);
    let (source, state) = DummySource::new();
    let synchronizer = Synchronizer::attach(context.resource("r1"), source);

    state
        .borrow_mut()
        .insert("mail", "m1", remote_mail("from remote", "u1"));
    synchronizer.synchronize(&Query::of_type("mail"));
    synchronizer.process_sync_queue().unwrap();

    // The pull must not have produced a fresh push: still exactly the
    // one remote id we planted.
    let state_ref = state.borrow();
    let mails = state_ref.entities.get("mail").unwrap();
    assert_eq!(mails.len(), 1);
    assert!(mails.contains_key("m1"));
}

#[test]
fn merge_criteria_adopt_existing_local_entities() {
    let context = TestContext::new(&["r1"]);
    let resource = context.resource("r1");
    let sync_store = SyncStore::new(Arc::clone(resource.env()));

    // A locally created mail that the remote also has (e.g. placed
    // there by another client).
    let local_id = context
        .store
        .create("r1", "mail", props(&[("uid", "shared"), ("subject", "local copy")]))
        .wait()
        .into_result()
        .unwrap();
    context.store.process_events().unwrap();

    let mut criteria = BTreeMap::new();
    criteria.insert(
        "uid".to_string(),
        Comparator::Equals(Value::Text("shared".into())),
    );
    let mut reconciler = Reconciler::new(&resource, &sync_store);
    reconciler
        .create_or_modify("mail", "imap-shared", remote_mail("local copy", "shared"), &criteria)
        .unwrap();
    resource.process_events().unwrap();

    // Adopted, not duplicated.
    assert_eq!(
        sync_store.lookup_remote_id("mail", "imap-shared").unwrap(),
        Some(local_id)
    );
    let model = context
        .store
        .load(Query::of_type("mail").resource("r1"))
        .unwrap();
    assert_eq!(model.row_count(), 1);
}
