//! Event-loop interactivity: loading a large result must never hog
//! the loop. Each cooperative slice stays inside a low-millisecond
//! budget; the result still becomes complete.

use pimdb_codec::Value;
use pimdb_core::{ModelResult, Operation, Query, QueryRunner, ResultProvider};
use pimdb_testkit::pim_registry;
use pimdb_storage::AccessMode;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAIL_COUNT: usize = 1000;
const SLICE_BUDGET: Duration = Duration::from_millis(10);

#[test]
fn large_initial_load_stays_inside_slice_budget() {
    let env = pimdb_storage::Environment::open_in_memory("interactivity");
    let store = pimdb_core::EntityStore::new(pim_registry());
    let notifier = pimdb_core::Notifier::new();

    // Seed the store in bulk; the budget under test is the query
    // side, not the write path.
    {
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        for i in 0..MAIL_COUNT {
            let mut props = std::collections::BTreeMap::new();
            props.insert("uid".to_string(), Value::Text(format!("uid-{i}")));
            props.insert("subject".to_string(), Value::Text(format!("subject {i}")));
            store
                .write_entity(
                    &txn,
                    "mail",
                    pimdb_core::Identifier::generate(),
                    Operation::Creation,
                    props,
                )
                .unwrap();
        }
        txn.commit().unwrap();
    }

    let query = Query::of_type("mail").live(true);
    let mut runner =
        QueryRunner::new(Arc::clone(&env), store, query, &notifier).with_initial_batch(50);
    let mut model = ModelResult::new();

    let mut slices = 0usize;
    let mut worst = Duration::ZERO;
    loop {
        let started = Instant::now();
        let done = runner.step_initial(&mut model).unwrap();
        let elapsed = started.elapsed();
        worst = worst.max(elapsed);
        slices += 1;
        assert!(
            elapsed < SLICE_BUDGET,
            "slice {slices} took {elapsed:?}, budget is {SLICE_BUDGET:?}"
        );
        if done {
            break;
        }
    }

    assert!(model.children_fetched());
    assert_eq!(model.row_count(), MAIL_COUNT);
    assert!(slices >= MAIL_COUNT / 50, "load was not actually sliced");
    eprintln!("loaded {MAIL_COUNT} mails in {slices} slices, worst slice {worst:?}");
}
