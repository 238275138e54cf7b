//! App foreground/background state.
//!
//! The host app reports transitions with [`AppLifecycle::set`]; the scheduler
//! and the live-metrics controller observe them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Visibility state of the host app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppActivity {
    /// In the foreground and receiving input.
    Active,
    /// Transitioning, or covered by a system overlay.
    Inactive,
    /// Not visible.
    Background,
}

impl AppActivity {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, AppActivity::Active)
    }
}

/// Shared app-state signal. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct AppLifecycle {
    state: Arc<watch::Sender<AppActivity>>,
}

impl Default for AppLifecycle {
    fn default() -> Self {
        Self::new(AppActivity::Active)
    }
}

impl AppLifecycle {
    pub fn new(initial: AppActivity) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state: Arc::new(state),
        }
    }

    /// Report a new app state. Repeating the current state is ignored.
    pub fn set(&self, activity: AppActivity) {
        let changed = self.state.send_if_modified(|current| {
            if *current == activity {
                false
            } else {
                *current = activity;
                true
            }
        });
        if changed {
            debug!("App state changed to {:?}", activity);
        }
    }

    pub fn current(&self) -> AppActivity {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.current().is_active()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppActivity> {
        self.state.subscribe()
    }
}
