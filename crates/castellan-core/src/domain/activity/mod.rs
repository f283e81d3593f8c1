//! Ambient activity scoping
//!
//! A logical activity is one unit of execution that owns its own slot in the
//! session store: a scoped task, an entered request, or the process-wide root
//! activity when no scope was established. The current activity travels with
//! the task through a task-local, so it survives `.await` points and spawned
//! scopes without being passed explicitly.

use uuid::Uuid;

tokio::task_local! {
    static CURRENT_ACTIVITY: Uuid;
    static CURRENT_REQUEST: Uuid;
}

/// Identifier of the root activity used when no scope is active.
///
/// Ad-hoc callers (tests, one-shot tools, `main`) share this slot, which
/// mirrors how an unscoped caller still has a calling context.
pub const ROOT_ACTIVITY: Uuid = Uuid::nil();

/// Run a future inside a fresh activity scope.
///
/// Sessions opened inside the scope are invisible to other activities and to
/// the root activity.
pub async fn scope<F>(fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_ACTIVITY.scope(Uuid::new_v4(), fut).await
}

/// Run a future inside an activity scope with a caller-chosen id.
pub async fn scope_with<F>(id: Uuid, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_ACTIVITY.scope(id, fut).await
}

/// The current activity id: the innermost scope, or [`ROOT_ACTIVITY`].
pub fn current() -> Uuid {
    CURRENT_ACTIVITY
        .try_with(|id| *id)
        .unwrap_or(ROOT_ACTIVITY)
}

/// Whether the caller is inside an explicit activity scope.
pub fn in_scope() -> bool {
    CURRENT_ACTIVITY.try_with(|_| ()).is_ok()
}

/// Run a future inside a request scope with a fresh request id.
///
/// Request scopes back the request-keyed session store; unlike activity
/// scopes there is no fallback, so store operations outside any request
/// scope fail.
pub async fn request_scope<F>(fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_REQUEST.scope(Uuid::new_v4(), fut).await
}

/// Run a future inside a request scope with a caller-chosen request id.
pub async fn request_scope_with<F>(id: Uuid, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_REQUEST.scope(id, fut).await
}

/// The current request id, if a request scope is active.
pub fn current_request() -> Option<Uuid> {
    CURRENT_REQUEST.try_with(|id| *id).ok()
}
