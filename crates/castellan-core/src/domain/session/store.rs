//! Activity-scoped session stores
//!
//! A store keeps the alias-to-session registry for the current activity, so
//! that opening the same alias twice inside one unit of work yields the same
//! native session. Entries are pushed in open order and the most recent one
//! is the candidate for reuse.
//!
//! Two implementations differ only in where the current activity comes from:
//! [`TaskLocalSessionStore`] reads the task-local activity id and falls back
//! to a shared root scope, while [`RequestSessionStore`] requires an
//! explicit request scope and fails outside one. Store operations resolve
//! the activity at call time, so removal must run in the same scope that
//! stored the entry.

use crate::domain::activity;
use crate::domain::session::session::NativeSession;
use crate::domain::session::stateless::NativeStatelessSession;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// A stateful session held by the store
#[derive(Clone, Debug)]
pub struct StoredSession {
    pub session_id: Uuid,
    pub alias: String,
    pub opened_at: DateTime<Utc>,
    pub session: Arc<Mutex<NativeSession>>,
}

/// A stateless session held by the store
#[derive(Clone)]
pub struct StoredStatelessSession {
    pub session_id: Uuid,
    pub alias: String,
    pub opened_at: DateTime<Utc>,
    pub session: Arc<Mutex<NativeStatelessSession>>,
}

/// Alias-keyed session registry scoped to the current activity
pub trait SessionStore: Send + Sync {
    /// Most recently stored session for the alias in the current activity
    fn find_compatible_session(&self, alias: &str) -> Result<Option<StoredSession>>;

    /// Register a session under its alias in the current activity
    fn store_session(&self, entry: StoredSession) -> Result<()>;

    /// Remove a session from the current activity
    fn remove_session(&self, alias: &str, session_id: Uuid) -> Result<()>;

    /// Most recently stored stateless session for the alias
    fn find_compatible_stateless_session(
        &self,
        alias: &str,
    ) -> Result<Option<StoredStatelessSession>>;

    /// Register a stateless session under its alias
    fn store_stateless_session(&self, entry: StoredStatelessSession) -> Result<()>;

    /// Remove a stateless session from the current activity
    fn remove_stateless_session(&self, alias: &str, session_id: Uuid) -> Result<()>;

    /// Whether the current activity holds no session of either kind for the alias
    fn is_current_activity_empty_for(&self, alias: &str) -> Result<bool>;
}

#[derive(Default)]
struct ActivityEntries {
    sessions: HashMap<String, Vec<StoredSession>>,
    stateless: HashMap<String, Vec<StoredStatelessSession>>,
}

impl ActivityEntries {
    fn is_empty(&self) -> bool {
        self.sessions.values().all(Vec::is_empty)
            && self.stateless.values().all(Vec::is_empty)
    }
}

/// Shared registry engine keyed by activity id
#[derive(Default)]
struct StoreRegistry {
    activities: RwLock<HashMap<Uuid, ActivityEntries>>,
}

impl StoreRegistry {
    fn find_session(&self, activity: Uuid, alias: &str) -> Option<StoredSession> {
        self.read()
            .get(&activity)
            .and_then(|entries| entries.sessions.get(alias))
            .and_then(|stack| stack.last())
            .cloned()
    }

    fn push_session(&self, activity: Uuid, entry: StoredSession) {
        let mut activities = self.write();
        activities
            .entry(activity)
            .or_default()
            .sessions
            .entry(entry.alias.clone())
            .or_default()
            .push(entry);
    }

    fn remove_session(&self, activity: Uuid, alias: &str, session_id: Uuid) {
        let mut activities = self.write();
        let removed = activities
            .get_mut(&activity)
            .and_then(|entries| entries.sessions.get_mut(alias))
            .map(|stack| {
                let before = stack.len();
                stack.retain(|entry| entry.session_id != session_id);
                before != stack.len()
            })
            .unwrap_or(false);
        if !removed {
            debug!(%activity, alias, %session_id, "Session already absent from store");
        }
        Self::prune(&mut activities, activity);
    }

    fn find_stateless(&self, activity: Uuid, alias: &str) -> Option<StoredStatelessSession> {
        self.read()
            .get(&activity)
            .and_then(|entries| entries.stateless.get(alias))
            .and_then(|stack| stack.last())
            .cloned()
    }

    fn push_stateless(&self, activity: Uuid, entry: StoredStatelessSession) {
        let mut activities = self.write();
        activities
            .entry(activity)
            .or_default()
            .stateless
            .entry(entry.alias.clone())
            .or_default()
            .push(entry);
    }

    fn remove_stateless(&self, activity: Uuid, alias: &str, session_id: Uuid) {
        let mut activities = self.write();
        let removed = activities
            .get_mut(&activity)
            .and_then(|entries| entries.stateless.get_mut(alias))
            .map(|stack| {
                let before = stack.len();
                stack.retain(|entry| entry.session_id != session_id);
                before != stack.len()
            })
            .unwrap_or(false);
        if !removed {
            debug!(%activity, alias, %session_id, "Stateless session already absent from store");
        }
        Self::prune(&mut activities, activity);
    }

    fn is_empty_for(&self, activity: Uuid, alias: &str) -> bool {
        match self.read().get(&activity) {
            None => true,
            Some(entries) => {
                entries.sessions.get(alias).is_none_or(Vec::is_empty)
                    && entries.stateless.get(alias).is_none_or(Vec::is_empty)
            }
        }
    }

    /// Drop the activity slot once nothing is registered under it
    fn prune(activities: &mut HashMap<Uuid, ActivityEntries>, activity: Uuid) {
        if activities
            .get(&activity)
            .is_some_and(ActivityEntries::is_empty)
        {
            activities.remove(&activity);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, ActivityEntries>> {
        match self.activities.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, ActivityEntries>> {
        match self.activities.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Store scoped to the task-local activity, with a shared root fallback
///
/// Outside any activity scope, entries land in the root activity. That keeps
/// single-task callers working without ceremony; concurrent tasks that need
/// isolation open their own scope via [`activity::scope`].
#[derive(Default)]
pub struct TaskLocalSessionStore {
    registry: StoreRegistry,
}

impl TaskLocalSessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for TaskLocalSessionStore {
    fn find_compatible_session(&self, alias: &str) -> Result<Option<StoredSession>> {
        Ok(self.registry.find_session(activity::current(), alias))
    }

    fn store_session(&self, entry: StoredSession) -> Result<()> {
        self.registry.push_session(activity::current(), entry);
        Ok(())
    }

    fn remove_session(&self, alias: &str, session_id: Uuid) -> Result<()> {
        self.registry
            .remove_session(activity::current(), alias, session_id);
        Ok(())
    }

    fn find_compatible_stateless_session(
        &self,
        alias: &str,
    ) -> Result<Option<StoredStatelessSession>> {
        Ok(self.registry.find_stateless(activity::current(), alias))
    }

    fn store_stateless_session(&self, entry: StoredStatelessSession) -> Result<()> {
        self.registry.push_stateless(activity::current(), entry);
        Ok(())
    }

    fn remove_stateless_session(&self, alias: &str, session_id: Uuid) -> Result<()> {
        self.registry
            .remove_stateless(activity::current(), alias, session_id);
        Ok(())
    }

    fn is_current_activity_empty_for(&self, alias: &str) -> Result<bool> {
        Ok(self.registry.is_empty_for(activity::current(), alias))
    }
}

/// Store scoped to an explicit request
///
/// Every operation requires an active [`activity::request_scope`]; outside
/// one the store refuses to guess and returns [`Error::NoActiveRequest`].
#[derive(Default)]
pub struct RequestSessionStore {
    registry: StoreRegistry,
}

impl RequestSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_request() -> Result<Uuid> {
        activity::current_request().ok_or(Error::NoActiveRequest)
    }
}

impl SessionStore for RequestSessionStore {
    fn find_compatible_session(&self, alias: &str) -> Result<Option<StoredSession>> {
        Ok(self.registry.find_session(Self::current_request()?, alias))
    }

    fn store_session(&self, entry: StoredSession) -> Result<()> {
        self.registry.push_session(Self::current_request()?, entry);
        Ok(())
    }

    fn remove_session(&self, alias: &str, session_id: Uuid) -> Result<()> {
        self.registry
            .remove_session(Self::current_request()?, alias, session_id);
        Ok(())
    }

    fn find_compatible_stateless_session(
        &self,
        alias: &str,
    ) -> Result<Option<StoredStatelessSession>> {
        Ok(self.registry.find_stateless(Self::current_request()?, alias))
    }

    fn store_stateless_session(&self, entry: StoredStatelessSession) -> Result<()> {
        self.registry.push_stateless(Self::current_request()?, entry);
        Ok(())
    }

    fn remove_stateless_session(&self, alias: &str, session_id: Uuid) -> Result<()> {
        self.registry
            .remove_stateless(Self::current_request()?, alias, session_id);
        Ok(())
    }

    fn is_current_activity_empty_for(&self, alias: &str) -> Result<bool> {
        Ok(self.registry.is_empty_for(Self::current_request()?, alias))
    }
}
