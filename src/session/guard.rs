//! Route guard for protected views
//!
//! A guard starts `Unknown` and settles exactly once, when the local session
//! check completes. Later completions are ignored. An unauthenticated result
//! starts a redirect login that comes back to the guarded view.

use super::{AuthState, SessionHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// What a guarded view shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardView<T> {
    /// No provider configured
    Nothing,
    /// Session check still running
    Placeholder,
    /// Login redirect started
    Redirecting,
    Content(T),
}

/// Guard around one protected view
#[derive(Debug)]
pub struct RouteGuard {
    handle: Option<Arc<SessionHandle>>,
    return_to: String,
    state: Mutex<AuthState>,
}

impl RouteGuard {
    /// `return_to` is where the login redirect comes back to
    pub fn new(handle: Option<Arc<SessionHandle>>, return_to: impl Into<String>) -> Self {
        Self {
            handle,
            return_to: return_to.into(),
            state: Mutex::new(AuthState::Unknown),
        }
    }

    pub fn state(&self) -> AuthState {
        *self.state.lock()
    }

    /// Settle the guard with the session check result.
    ///
    /// Returns `true` when this call moved the guard out of `Unknown`.
    pub fn complete(&self, result: AuthState) -> bool {
        if result == AuthState::Unknown {
            return false;
        }

        {
            let mut state = self.state.lock();
            if *state != AuthState::Unknown {
                debug!(current = ?*state, ignored = ?result, "Guard already settled");
                return false;
            }
            *state = result;
        }

        if result == AuthState::Unauthenticated {
            if let Some(handle) = &self.handle {
                handle.login(&self.return_to);
            }
        }
        true
    }

    /// Run the session check and settle the guard with its result
    pub async fn mount(&self) -> AuthState {
        if let Some(handle) = &self.handle {
            let result = handle.check_session().await;
            self.complete(result);
        }
        self.state()
    }

    /// View for the current state; `content` only runs once authenticated
    pub fn render<T, F>(&self, content: F) -> GuardView<T>
    where
        F: FnOnce() -> T,
    {
        if self.handle.is_none() {
            return GuardView::Nothing;
        }
        match self.state() {
            AuthState::Unknown => GuardView::Placeholder,
            AuthState::Unauthenticated => GuardView::Redirecting,
            AuthState::Authenticated => GuardView::Content(content()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::MemorySessionStore;
    use crate::session::{
        provide, MockLoginRedirector, MockTokenRefresher, ProviderConfig, Session, SessionStore,
    };
    use chrono::{Duration, Utc};

    fn handle(redirects: usize, store: Arc<MemorySessionStore>) -> Arc<SessionHandle> {
        let config = ProviderConfig {
            domain: Some("tenant.example.com".into()),
            client_id: Some("client".into()),
            callback_url: Some("http://localhost:3000/callback".into()),
            ..Default::default()
        };
        let mut redirector = MockLoginRedirector::new();
        redirector
            .expect_redirect()
            .withf(|url| url.starts_with("https://tenant.example.com/authorize?"))
            .times(redirects)
            .return_const(());

        Arc::new(
            provide(
                &config,
                store,
                Arc::new(redirector),
                Arc::new(MockTokenRefresher::new()),
            )
            .unwrap(),
        )
    }

    fn signed_in() -> Arc<MemorySessionStore> {
        let store = Arc::new(MemorySessionStore::new());
        store.save(Session {
            access_token: "at".into(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::hours(1),
            profile: None,
        });
        store
    }

    #[test]
    fn test_unknown_shows_placeholder() {
        let store = Arc::new(MemorySessionStore::new());
        let guard = RouteGuard::new(Some(handle(0, store)), "/profile");
        assert_eq!(guard.state(), AuthState::Unknown);
        assert_eq!(guard.render(|| "secret"), GuardView::Placeholder);
    }

    #[test]
    fn test_no_provider_renders_nothing() {
        let guard = RouteGuard::new(None, "/profile");
        assert!(guard.complete(AuthState::Authenticated));
        assert_eq!(guard.render(|| "secret"), GuardView::Nothing);
    }

    #[test]
    fn test_unauthenticated_redirects_once_with_return_to() {
        let store = Arc::new(MemorySessionStore::new());
        let guard = RouteGuard::new(Some(handle(1, store.clone())), "/external-api");

        assert!(guard.complete(AuthState::Unauthenticated));
        assert!(!guard.complete(AuthState::Unauthenticated));
        assert_eq!(guard.render(|| "secret"), GuardView::Redirecting);
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn test_settles_only_once() {
        let guard = RouteGuard::new(Some(handle(0, signed_in())), "/profile");

        assert!(!guard.complete(AuthState::Unknown));
        assert!(guard.complete(AuthState::Authenticated));
        assert!(!guard.complete(AuthState::Unauthenticated));
        assert_eq!(guard.state(), AuthState::Authenticated);
        assert_eq!(guard.render(|| "secret"), GuardView::Content("secret"));
    }

    #[tokio::test]
    async fn test_mount_with_session_renders_content() {
        let guard = RouteGuard::new(Some(handle(0, signed_in())), "/profile");
        assert_eq!(guard.mount().await, AuthState::Authenticated);
        assert_eq!(guard.render(|| 42), GuardView::Content(42));
    }

    #[tokio::test]
    async fn test_mount_without_session_redirects() {
        let store = Arc::new(MemorySessionStore::new());
        let guard = RouteGuard::new(Some(handle(1, store)), "/profile");
        assert_eq!(guard.mount().await, AuthState::Unauthenticated);
        assert_eq!(guard.render(|| 42), GuardView::Redirecting);
    }
}
