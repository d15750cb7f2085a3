use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::actions::TaskHandler;

pub type HandlerMap = HashMap<String, Arc<dyn TaskHandler>>;

/// Maps (namespace, task name) to a handler.
///
/// Built once at process start and handed to whatever needs it (queue
/// adapter, worker). Reads may run concurrently; registration takes the
/// write lock.
#[derive(Default)]
pub struct TaskRegistry {
    namespaces: RwLock<HashMap<String, HandlerMap>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` under `namespace`/`name`. An existing binding is replaced.
    pub fn register(&self, namespace: &str, name: &str, handler: Arc<dyn TaskHandler>) {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(name.to_string(), handler);
        debug!(namespace, name, replaced = previous.is_some(), "registered task handler");
    }

    /// Full name -> handler mapping for `namespace`; empty when unknown.
    pub fn all_handlers(&self, namespace: &str) -> HandlerMap {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    pub fn handler(&self, namespace: &str, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .and_then(|handlers| handlers.get(name).cloned())
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.handler(namespace, name).is_some()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let namespaces = self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut map = f.debug_map();
        for (ns, handlers) in namespaces.iter() {
            let mut names: Vec<&String> = handlers.keys().collect();
            names.sort();
            map.entry(ns, &names);
        }
        map.finish()
    }
}
