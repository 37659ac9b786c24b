//! Shell state: the resource under inspection.

use pimdb_core::{AdaptorRegistry, Resource, TypeAdaptor};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

/// State threaded through command handlers.
pub struct ShellState {
    /// The opened resource, when the shell was pointed at one.
    pub resource: Option<Rc<Resource>>,
    /// Whether an interactive command asked the shell to exit.
    pub exit_requested: bool,
}

impl ShellState {
    /// A shell with no resource (startup, or tests of pure commands).
    #[must_use]
    pub fn detached() -> Self {
        Self {
            resource: None,
            exit_requested: false,
        }
    }

    /// Opens the resource at `<storage_root>/<instance_id>`.
    pub fn open(storage_root: &Path, instance_id: &str) -> Result<Self, String> {
        let resource = Resource::open(storage_root, instance_id, default_registry())
            .map_err(|error| format!("cannot open resource: {error}"))?;
        Ok(Self {
            resource: Some(Rc::new(resource)),
            exit_requested: false,
        })
    }

    /// The opened resource, or an error for the handler to report.
    pub fn require_resource(&self) -> Result<&Rc<Resource>, String> {
        self.resource
            .as_ref()
            .ok_or_else(|| "no resource opened; use `open <root> <instance>`".to_string())
    }
}

/// The built-in PIM type surface the shell assumes.
#[must_use]
pub fn default_registry() -> Arc<AdaptorRegistry> {
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
    Arc::new(registry)
}
