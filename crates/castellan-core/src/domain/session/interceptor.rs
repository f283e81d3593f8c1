//! Session interceptors
//!
//! Interceptors observe a session's statement flow and the progress of the
//! ambient transaction it is enlisted in. They are registered under string
//! keys: the global key applies to every alias, and an alias-specific key
//! (`session.interceptor.<alias>`) takes precedence for that alias.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Registry key for the interceptor applied to every alias
pub const INTERCEPTOR_KEY: &str = "session.interceptor";

/// Registry key for the interceptor applied to a single alias
pub fn aliased_interceptor_key(alias: &str) -> String {
    format!("{INTERCEPTOR_KEY}.{alias}")
}

/// Hooks into a session's statement and transaction lifecycle
///
/// All hooks have no-op defaults; implementors override only what they
/// need. `on_prepare_statement` runs for every statement the session sends,
/// including buffered saves at flush time. The transaction hooks fire as the
/// ambient transaction the session is enlisted in moves through its phases.
pub trait Interceptor: Send + Sync {
    /// Rewrite or observe a statement before it is sent to the database
    fn on_prepare_statement(&self, sql: String) -> String {
        sql
    }

    /// The session began a native transaction for the given ambient transaction
    fn after_transaction_begin(&self, _transaction_id: Uuid) {}

    /// The ambient transaction is about to complete; fires before the flush
    fn before_transaction_completion(&self, _transaction_id: Uuid) {}

    /// The ambient transaction finished; `committed` reports the outcome
    fn after_transaction_completion(&self, _committed: bool, _transaction_id: Uuid) {}
}

/// Keyed registry of interceptors
///
/// Resolution prefers the alias-specific key over the global one.
#[derive(Default)]
pub struct InterceptorRegistry {
    interceptors: RwLock<HashMap<String, Arc<dyn Interceptor>>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interceptor under a key, replacing any previous entry
    pub fn register(&self, key: impl Into<String>, interceptor: Arc<dyn Interceptor>) {
        self.write().insert(key.into(), interceptor);
    }

    /// Look up an interceptor by exact key
    pub fn get(&self, key: &str) -> Option<Arc<dyn Interceptor>> {
        self.read().get(key).cloned()
    }

    /// Resolve the interceptor for an alias, aliased key first
    pub fn resolve_for_alias(&self, alias: &str) -> Option<Arc<dyn Interceptor>> {
        let map = self.read();
        map.get(&aliased_interceptor_key(alias))
            .or_else(|| map.get(INTERCEPTOR_KEY))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Interceptor>>> {
        match self.interceptors.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn Interceptor>>> {
        match self.interceptors.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
