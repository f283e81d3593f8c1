//! Session manager
//!
//! Resolves a session for an alias: a compatible stored session is shared,
//! otherwise a new one is created through the alias's factory, enlisted in
//! the ambient transaction when one is present, and registered in the store.
//! Only the delegate that created a session outside a transaction may close
//! it; sessions created inside a transaction are torn down when the
//! transaction completes.

use crate::domain::session::delegate::{Session, SessionKind, StatelessSession, StoreBinding};
use crate::domain::session::factory::SessionFactoryResolver;
use crate::domain::session::interceptor::InterceptorRegistry;
use crate::domain::session::store::{
    SessionStore, StoredSession, StoredStatelessSession,
};
use crate::domain::session::DEFAULT_ALIAS;
use crate::domain::transaction::{
    enlist_session_if_needed, enlist_stateless_session_if_needed, Transaction,
};
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Opens and shares sessions keyed by database alias
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    resolver: Arc<SessionFactoryResolver>,
    interceptors: Arc<InterceptorRegistry>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        resolver: Arc<SessionFactoryResolver>,
        interceptors: Arc<InterceptorRegistry>,
    ) -> Self {
        Self {
            store,
            resolver,
            interceptors,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<SessionFactoryResolver> {
        &self.resolver
    }

    /// Open a session for the default alias
    pub async fn open_session(&self) -> Result<Session> {
        self.open_session_for(DEFAULT_ALIAS).await
    }

    /// Open a session for an alias, sharing a compatible stored one
    pub async fn open_session_for(&self, alias: &str) -> Result<Session> {
        let transaction = Transaction::current();

        if let Some(entry) = self
            .find_reusable_session(alias, transaction.as_ref())
            .await?
        {
            if let Some(txn) = &transaction {
                enlist_session_if_needed(txn, entry.session.clone()).await?;
            }
            debug!(alias = %alias, session_id = %entry.session_id, "Reusing stored session");
            let binding =
                StoreBinding::new(&self.store, alias, entry.session_id, SessionKind::Stateful);
            return Ok(Session::new(
                entry.session_id,
                alias,
                entry.session,
                binding,
                false,
            ));
        }

        let factory = self
            .resolver
            .resolve(alias)
            .ok_or_else(|| Error::UnknownAlias(alias.to_string()))?;
        let interceptor = self.interceptors.resolve_for_alias(alias);
        let native = factory.open_session(interceptor);
        let session_id = native.id();
        let opened_at = native.opened_at();
        let inner = Arc::new(Mutex::new(native));

        // A session created inside a transaction belongs to it, not to the caller
        let can_close = transaction.is_none();
        let binding = StoreBinding::new(&self.store, alias, session_id, SessionKind::Stateful);

        if let Some(txn) = &transaction {
            enlist_session_if_needed(txn, inner.clone()).await?;
            self.unregister_on_completion(txn, binding.clone(), alias)?;
        }

        self.store.store_session(StoredSession {
            session_id,
            alias: alias.to_string(),
            opened_at,
            session: inner.clone(),
        })?;

        info!(alias = %alias, session_id = %session_id, can_close, "Session opened");
        Ok(Session::new(session_id, alias, inner, binding, can_close))
    }

    /// Open a stateless session for the default alias
    pub async fn open_stateless_session(&self) -> Result<StatelessSession> {
        self.open_stateless_session_for(DEFAULT_ALIAS).await
    }

    /// Open a stateless session for an alias, sharing a compatible stored one
    pub async fn open_stateless_session_for(&self, alias: &str) -> Result<StatelessSession> {
        let transaction = Transaction::current();

        if let Some(entry) = self
            .find_reusable_stateless_session(alias, transaction.as_ref())
            .await?
        {
            if let Some(txn) = &transaction {
                enlist_stateless_session_if_needed(txn, entry.session.clone()).await?;
            }
            debug!(alias = %alias, session_id = %entry.session_id, "Reusing stored stateless session");
            let binding =
                StoreBinding::new(&self.store, alias, entry.session_id, SessionKind::Stateless);
            return Ok(StatelessSession::new(
                entry.session_id,
                alias,
                entry.session,
                binding,
                false,
            ));
        }

        let factory = self
            .resolver
            .resolve(alias)
            .ok_or_else(|| Error::UnknownAlias(alias.to_string()))?;
        let native = factory.open_stateless_session();
        let session_id = native.id();
        let opened_at = native.opened_at();
        let inner = Arc::new(Mutex::new(native));

        let can_close = transaction.is_none();
        let binding = StoreBinding::new(&self.store, alias, session_id, SessionKind::Stateless);

        if let Some(txn) = &transaction {
            enlist_stateless_session_if_needed(txn, inner.clone()).await?;
            self.unregister_on_completion(txn, binding.clone(), alias)?;
        }

        self.store.store_stateless_session(StoredStatelessSession {
            session_id,
            alias: alias.to_string(),
            opened_at,
            session: inner.clone(),
        })?;

        info!(alias = %alias, session_id = %session_id, can_close, "Stateless session opened");
        Ok(StatelessSession::new(
            session_id,
            alias,
            inner,
            binding,
            can_close,
        ))
    }

    /// A stored session is reusable unless a transaction is present and the
    /// session's native transaction is no longer active
    async fn find_reusable_session(
        &self,
        alias: &str,
        transaction: Option<&Transaction>,
    ) -> Result<Option<StoredSession>> {
        let Some(entry) = self.store.find_compatible_session(alias)? else {
            return Ok(None);
        };
        if transaction.is_some() && !entry.session.lock().await.has_active_transaction() {
            debug!(
                alias = %alias,
                session_id = %entry.session_id,
                "Stored session has no active transaction, opening a fresh one"
            );
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn find_reusable_stateless_session(
        &self,
        alias: &str,
        transaction: Option<&Transaction>,
    ) -> Result<Option<StoredStatelessSession>> {
        let Some(entry) = self.store.find_compatible_stateless_session(alias)? else {
            return Ok(None);
        };
        if transaction.is_some() && !entry.session.lock().await.has_active_transaction() {
            debug!(
                alias = %alias,
                session_id = %entry.session_id,
                "Stored stateless session has no active transaction, opening a fresh one"
            );
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Remove the session from the store once the transaction completes;
    /// failures are logged, never raised into the completion path
    fn unregister_on_completion(
        &self,
        transaction: &Transaction,
        binding: Arc<StoreBinding>,
        alias: &str,
    ) -> Result<()> {
        let alias = alias.to_string();
        transaction.on_completed(move |_status| {
            if binding.is_unregistered() {
                return;
            }
            if let Err(e) = binding.unregister() {
                error!(alias = %alias, error = %e, "Error unregistering session after transaction");
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AliasConfig;
    use crate::domain::activity;
    use crate::domain::session::factory::{ConfigurationBuilder, DefaultConfigurationBuilder};
    use crate::domain::session::interceptor::{aliased_interceptor_key, Interceptor};
    use crate::domain::session::session::FlushMode;
    use crate::domain::session::store::TaskLocalSessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn manager_for(aliases: &[&str]) -> SessionManager {
        let resolver = Arc::new(SessionFactoryResolver::new());
        let builder = DefaultConfigurationBuilder::new();
        for alias in aliases {
            let factory = builder
                .build(&AliasConfig::in_memory(*alias), FlushMode::Auto)
                .await
                .expect("factory");
            resolver.register(factory);
        }
        SessionManager::new(
            Arc::new(TaskLocalSessionStore::new()),
            resolver,
            Arc::new(InterceptorRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_unknown_alias_is_rejected() {
        let manager = manager_for(&["db1"]).await;
        activity::scope(async {
            let err = manager
                .open_session_for("db9")
                .await
                .expect_err("unknown alias");
            assert!(matches!(err, Error::UnknownAlias(_)));

            let err = manager
                .open_stateless_session_for("db9")
                .await
                .expect_err("unknown alias stateless");
            assert!(matches!(err, Error::UnknownAlias(_)));
        })
        .await;
    }

    #[tokio::test]
    async fn test_same_alias_shares_the_native_session() {
        let manager = manager_for(&["default"]).await;
        activity::scope(async {
            let first = manager.open_session().await.expect("first open");
            let second = manager.open_session().await.expect("second open");
            let third = manager.open_session().await.expect("third open");

            assert!(first.can_close());
            assert!(!second.can_close());
            assert!(!third.can_close());
            assert!(first.shares_session_with(&second));
            assert!(second.shares_session_with(&third));

            third.close().await.expect("close third");
            second.close().await.expect("close second");
            assert!(!manager
                .store()
                .is_current_activity_empty_for("default")
                .expect("is_empty"));

            first.close().await.expect("close first");
            assert!(manager
                .store()
                .is_current_activity_empty_for("default")
                .expect("is_empty"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_distinct_aliases_never_share() {
        let manager = manager_for(&["db1", "db2"]).await;
        activity::scope(async {
            let one = manager.open_session_for("db1").await.expect("db1");
            let two = manager.open_session_for("db2").await.expect("db2");

            assert!(one.can_close());
            assert!(two.can_close());
            assert!(!one.shares_session_with(&two));

            one.close().await.expect("close db1");
            two.close().await.expect("close db2");
        })
        .await;
    }

    #[tokio::test]
    async fn test_interceptor_attaches_with_alias_precedence() {
        struct Counting {
            count: AtomicUsize,
        }
        impl Interceptor for Counting {
            fn on_prepare_statement(&self, sql: String) -> String {
                self.count.fetch_add(1, Ordering::SeqCst);
                sql
            }
        }

        let resolver = Arc::new(SessionFactoryResolver::new());
        let builder = DefaultConfigurationBuilder::new();
        resolver.register(
            builder
                .build(&AliasConfig::in_memory("db1"), FlushMode::Manual)
                .await
                .expect("factory"),
        );

        let counting = Arc::new(Counting {
            count: AtomicUsize::new(0),
        });
        let interceptors = Arc::new(InterceptorRegistry::new());
        interceptors.register(aliased_interceptor_key("db1"), counting.clone());

        let manager = SessionManager::new(
            Arc::new(TaskLocalSessionStore::new()),
            resolver,
            interceptors,
        );

        activity::scope(async {
            let session = manager.open_session_for("db1").await.expect("open");
            session
                .execute("CREATE TABLE items (id INTEGER PRIMARY KEY)", vec![])
                .await
                .expect("create");
            session
                .save("INSERT INTO items DEFAULT VALUES", vec![])
                .await
                .expect("save");
            session.flush().await.expect("flush");
            session.close().await.expect("close");
        })
        .await;

        assert_eq!(counting.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_session_opened_in_transaction_is_torn_down_on_commit() {
        let manager = manager_for(&["default"]).await;
        activity::scope(async {
            let txn = Transaction::begin();
            let session = txn
                .wrap(async {
                    let session = manager.open_session().await.expect("open");
                    assert!(!session.can_close());
                    session
                        .execute("CREATE TABLE items (id INTEGER PRIMARY KEY)", vec![])
                        .await
                        .expect("create");
                    session
                        .save("INSERT INTO items DEFAULT VALUES", vec![])
                        .await
                        .expect("save");
                    session
                })
                .await;

            assert!(!session.is_unregistered());
            txn.commit().await.expect("commit");

            // Completion closed the native session and emptied the store
            assert!(session.is_unregistered());
            assert!(manager
                .store()
                .is_current_activity_empty_for("default")
                .expect("is_empty"));
            let err = session
                .fetch_scalar("SELECT COUNT(*) FROM items", vec![])
                .await
                .expect_err("native session closed");
            assert!(matches!(err, Error::SessionClosed));
        })
        .await;
    }

    #[tokio::test]
    async fn test_reuse_inside_transaction_enlists_once() {
        let manager = manager_for(&["default"]).await;
        activity::scope(async {
            let txn = Transaction::begin();
            txn.wrap(async {
                let first = manager.open_session().await.expect("first");
                let second = manager.open_session().await.expect("second");
                assert!(first.shares_session_with(&second));
                assert!(!first.can_close());
                assert!(!second.can_close());
            })
            .await;

            assert_eq!(txn.participant_count(), 1);
            txn.rollback().await.expect("rollback");
        })
        .await;
    }

    #[tokio::test]
    async fn test_stateless_sessions_share_and_tear_down() {
        let manager = manager_for(&["default"]).await;
        activity::scope(async {
            let first = manager.open_stateless_session().await.expect("first");
            let second = manager.open_stateless_session().await.expect("second");
            assert!(first.can_close());
            assert!(!second.can_close());
            assert!(first.shares_session_with(&second));

            second.close().await.expect("close second");
            first.close().await.expect("close first");
            assert!(manager
                .store()
                .is_current_activity_empty_for("default")
                .expect("is_empty"));
        })
        .await;
    }
}
