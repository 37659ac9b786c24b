//! Domain fixtures and wiring helpers.

use pimdb_codec::Value;
use pimdb_core::{AdaptorRegistry, Resource, Store, TypeAdaptor};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use tempfile::TempDir;

/// The PIM type surface used across tests.
#[must_use]
pub fn pim_registry() -> Arc<AdaptorRegistry> {
    let mut registry = AdaptorRegistry::new();
    registry.register(TypeAdaptor::new(
        "mail",
        &["uid", "subject", "sender", "date", "folder", "unread", "important"],
        &["uid", "folder"],
        &["uid", "subject", "sender", "folder"],
    ));
    registry.register(TypeAdaptor::new(
        "folder",
        &["name", "parent", "icon", "specialpurpose"],
        &["parent", "name"],
        &["name", "parent"],
    ));
    registry.register(TypeAdaptor::new(
        "event",
        &["uid", "summary", "starts", "ends", "calendar"],
        &["uid", "calendar"],
        &["uid", "summary", "starts", "ends"],
    ));
    registry.register(TypeAdaptor::new(
        "todo",
        &["uid", "summary", "due", "done"],
        &["uid"],
        &["uid", "summary", "done"],
    ));
    registry.register(TypeAdaptor::new(
        "contact",
        &["uid", "name", "email", "addressbook"],
        &["uid", "addressbook"],
        &["uid", "name", "email"],
    ));
    Arc::new(registry)
}

/// Builds a text property map from string pairs.
#[must_use]
pub fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), Value::Text((*v).to_string())))
        .collect()
}

/// A store plus named resource instances in one temporary directory.
pub struct TestContext {
    /// Keeps the storage directory alive.
    pub dir: TempDir,
    /// The client-facing store.
    pub store: Store,
    /// The attached resources, in creation order.
    pub resources: Vec<Rc<Resource>>,
}

impl TestContext {
    /// Creates resources with the given instance ids, all attached to
    /// one store.
    #[must_use]
    pub fn new(instance_ids: &[&str]) -> TestContext {
        let dir = TempDir::new().expect("create test directory");
        let registry = pim_registry();
        let store = Store::new();
        let mut resources = Vec::new();
        for instance_id in instance_ids {
            let resource = Rc::new(
                Resource::open(dir.path(), instance_id, Arc::clone(&registry))
                    .expect("open test resource"),
            );
            store.attach_resource(Rc::clone(&resource));
            resources.push(resource);
        }
        TestContext {
            dir,
            store,
            resources,
        }
    }

    /// The resource with the given instance id.
    #[must_use]
    pub fn resource(&self, instance_id: &str) -> Rc<Resource> {
        self.store
            .resource(instance_id)
            .expect("resource attached in TestContext::new")
    }
}
