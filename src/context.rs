//! Collaborators injected into the shard manager and merge processor.
//!
//! The engine never reads settings from a global: map documents come from a
//! [`DocStore`], background work runs inside a [`SecurityContext`] and checks
//! a [`TaskContext`] for cancellation between units of work.

use crate::error::{Error, Result};
use crate::settings::PlanBDoc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Scope that background operations run under.
pub trait SecurityContext: Send + Sync {
    /// Runs `f` as the internal processing user.
    fn as_processing_user(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// Runs work without any scoping.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecurity;

impl SecurityContext for NoSecurity {
    fn as_processing_user(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        f()
    }
}

/// Progress and cancellation for one running task.
pub trait TaskContext: Send + Sync {
    /// Whether the task was asked to stop.
    fn is_cancelled(&self) -> bool;

    /// Reports progress.
    fn info(&self, message: &str) {
        log::debug!("{}", message);
    }

    /// `Err(Cancelled)` once the task was asked to stop.
    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Creates task contexts for background work.
pub trait TaskContextFactory: Send + Sync {
    /// A context for a task called `name`.
    fn create(&self, name: &str) -> Arc<dyn TaskContext>;
}

/// Task context backed by a flag.
#[derive(Debug, Default)]
pub struct SimpleTaskContext {
    name: String,
    cancelled: AtomicBool,
}

impl SimpleTaskContext {
    /// A context called `name` that has not been cancelled.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), cancelled: AtomicBool::new(false) }
    }

    /// Asks the task to stop at its next check.
    pub fn cancel(&self) {
        log::info!("Cancelling task {}", self.name);
        self.cancelled.store(true, Ordering::Release);
    }
}

impl TaskContext for SimpleTaskContext {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn info(&self, message: &str) {
        log::debug!("{}: {}", self.name, message);
    }
}

/// Hands out [`SimpleTaskContext`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleTaskContextFactory;

impl TaskContextFactory for SimpleTaskContextFactory {
    fn create(&self, name: &str) -> Arc<dyn TaskContext> {
        Arc::new(SimpleTaskContext::new(name))
    }
}

/// Reference to a map document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocRef {
    /// Document uuid
    pub uuid: String,
    /// Map name
    pub name: String,
}

/// Read-only source of map documents.
pub trait DocStore: Send + Sync {
    /// Documents whose map is called `name`.
    fn find_by_name(&self, name: &str) -> Vec<DocRef>;

    /// The document behind `doc_ref`.
    fn read_document(&self, doc_ref: &DocRef) -> Option<PlanBDoc>;

    /// The document with `uuid`.
    fn get(&self, uuid: &str) -> Option<PlanBDoc> {
        self.read_document(&DocRef { uuid: uuid.to_string(), name: String::new() })
    }
}

/// In-memory [`DocStore`].
#[derive(Debug, Default)]
pub struct MemoryDocStore {
    docs: RwLock<HashMap<String, PlanBDoc>>,
}

impl MemoryDocStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces `doc`.
    pub fn insert(&self, doc: PlanBDoc) -> Result<()> {
        doc.validate()?;
        self.docs.write().insert(doc.uuid.clone(), doc);
        Ok(())
    }

    /// Removes the document with `uuid`.
    pub fn remove(&self, uuid: &str) -> Option<PlanBDoc> {
        self.docs.write().remove(uuid)
    }
}

impl DocStore for MemoryDocStore {
    fn find_by_name(&self, name: &str) -> Vec<DocRef> {
        let mut refs: Vec<DocRef> = self
            .docs
            .read()
            .values()
            .filter(|doc| doc.name == name)
            .map(|doc| DocRef { uuid: doc.uuid.clone(), name: doc.name.clone() })
            .collect();
        refs.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        refs
    }

    fn read_document(&self, doc_ref: &DocRef) -> Option<PlanBDoc> {
        self.docs.read().get(&doc_ref.uuid).cloned()
    }
}

/// Resolves a map by uuid or, failing that, by name.
pub fn resolve_doc(store: &dyn DocStore, uuid_or_name: &str) -> Result<PlanBDoc> {
    if let Some(doc) = store.get(uuid_or_name) {
        return Ok(doc);
    }
    let refs = store.find_by_name(uuid_or_name);
    match refs.as_slice() {
        [doc_ref] => store
            .read_document(doc_ref)
            .ok_or_else(|| Error::not_found(format!("map document {}", doc_ref.uuid))),
        [] => Err(Error::not_found(format!("map {:?}", uuid_or_name))),
        _ => Err(Error::invalid_argument(format!("map name {:?} is ambiguous", uuid_or_name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::StateType;

    #[test]
    fn test_resolve_by_uuid_and_name() {
        let store = MemoryDocStore::new();
        store.insert(PlanBDoc::with_defaults("u1", "alpha", StateType::State)).unwrap();
        store.insert(PlanBDoc::with_defaults("u2", "beta", StateType::Histogram)).unwrap();

        assert_eq!(resolve_doc(&store, "u2").unwrap().name, "beta");
        assert_eq!(resolve_doc(&store, "alpha").unwrap().uuid, "u1");
        assert!(matches!(resolve_doc(&store, "gamma"), Err(Error::NotFound(_))));

        store.insert(PlanBDoc::with_defaults("u3", "alpha", StateType::State)).unwrap();
        assert!(matches!(resolve_doc(&store, "alpha"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_cancellation() {
        let ctx = SimpleTaskContextFactory.create("condense");
        assert!(ctx.check().is_ok());
        let simple = SimpleTaskContext::new("merge");
        simple.cancel();
        assert!(matches!(simple.check(), Err(Error::Cancelled)));
    }
}
