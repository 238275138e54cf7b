//! The signed-in session the engine acts for.
//!
//! Every network or storage call is a suspension point, and the active user
//! can change while one is pending. Components capture the user they started
//! for and check [`AuthContext::is_current_user`] before persisting anything
//! keyed by that user.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::info;

/// An authenticated user session.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub token: Option<String>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: Some(token.into()),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

struct ContextInner {
    session: watch::Sender<Option<Session>>,
    generation: AtomicU64,
}

/// Shared handle to the current session. Cloning shares the same state.
#[derive(Clone)]
pub struct AuthContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("session", &*self.inner.session.borrow())
            .field("generation", &self.generation())
            .finish()
    }
}

impl Default for AuthContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthContext {
    /// A context with nobody signed in.
    pub fn new() -> Self {
        let (session, _) = watch::channel(None);
        Self {
            inner: Arc::new(ContextInner {
                session,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// A context with `session` already signed in.
    pub fn signed_in(session: Session) -> Self {
        let context = Self::new();
        context.set_session(Some(session));
        context
    }

    /// Replace the session (login, logout, account switch).
    ///
    /// Every call bumps the generation, even when re-setting the same user,
    /// so cached authorization decisions are re-checked.
    pub fn set_session(&self, session: Option<Session>) {
        info!(
            "Auth context changed to {}",
            session.as_ref().map(|s| s.user_id.as_str()).unwrap_or("<none>")
        );
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.session.send_replace(session);
    }

    /// Sign out.
    pub fn clear(&self) {
        self.set_session(None);
    }

    /// Monotonic counter of session changes.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.session.borrow().clone()
    }

    pub fn current_user(&self) -> Option<String> {
        self.inner
            .session
            .borrow()
            .as_ref()
            .map(|s| s.user_id.clone())
    }

    pub fn token(&self) -> Option<String> {
        self.inner
            .session
            .borrow()
            .as_ref()
            .and_then(|s| s.token.clone())
    }

    /// Whether `user_id` is the user signed in right now.
    pub fn is_current_user(&self, user_id: &str) -> bool {
        self.inner
            .session
            .borrow()
            .as_ref()
            .is_some_and(|s| s.user_id == user_id)
    }

    /// Watch session changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.inner.session.subscribe()
    }
}
