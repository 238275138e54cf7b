//! Health-data permission reconciliation.
//!
//! Three signals can disagree: the backend's permission record, the OS
//! permission snapshot, and a locally cached hint. The backend wins; the OS
//! can only revoke; the cache is consulted only when the backend cannot be
//! reached, and only within `offline_trust_max_age`.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, warn};

use vitals_store::KeyValueStore;
use vitals_types::{PermissionSource, PermissionStatus, Platform};

use crate::clock::Clock;
use crate::health::HealthDataSource;
use crate::remote::{PermissionRecords, PermissionUpdate, RemotePermission};

fn cache_key(user_id: &str) -> String {
    format!("health_permission_{}", user_id)
}

/// Why the resolver reached its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptReason {
    /// The backend record says not granted.
    BackendDenied,
    /// The backend says granted but the OS permission was withdrawn.
    RevokedOutOfBand,
    /// The backend grants and the OS agrees or has no opinion.
    Granted,
    /// The backend was unreachable; a recent cached grant was trusted.
    OfflineCacheTrusted,
    /// No trustworthy signal.
    Undetermined,
}

impl PromptReason {
    #[must_use]
    pub fn should_prompt(&self) -> bool {
        !matches!(self, PromptReason::Granted | PromptReason::OfflineCacheTrusted)
    }
}

/// Result of [`PermissionStateResolver::check_permission_status`].
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionCheck {
    pub should_prompt: bool,
    pub reason: PromptReason,
    /// The signal the decision rests on, when there was one.
    pub status: Option<PermissionStatus>,
}

/// Decides whether the user must be asked for health-data permission.
pub struct PermissionStateResolver {
    records: Arc<dyn PermissionRecords>,
    health: Arc<dyn HealthDataSource>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    offline_trust_max_age: Option<Duration>,
}

impl std::fmt::Debug for PermissionStateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionStateResolver")
            .field("offline_trust_max_age", &self.offline_trust_max_age)
            .finish_non_exhaustive()
    }
}

impl PermissionStateResolver {
    pub fn new(
        records: Arc<dyn PermissionRecords>,
        health: Arc<dyn HealthDataSource>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        offline_trust_max_age: Option<Duration>,
    ) -> Self {
        Self {
            records,
            health,
            store,
            clock,
            offline_trust_max_age,
        }
    }

    /// Gather all three signals concurrently and decide.
    pub async fn check_permission_status(&self, user_id: &str) -> PermissionCheck {
        let key = cache_key(user_id);
        let (remote, os, cached) = tokio::join!(
            self.records.permission_status(user_id),
            self.health.os_permission(),
            async {
                self.store
                    .get_json::<PermissionStatus>(&key)
                    .unwrap_or_else(|e| {
                        debug!("Cached permission unreadable: {}", e);
                        None
                    })
            }
        );

        let remote = match remote {
            Ok(remote) if remote.success => Some(remote),
            Ok(_) => {
                debug!("Permission record reported success: false");
                None
            }
            Err(e) => {
                debug!("Permission record unreachable: {}", e);
                None
            }
        };

        let now = self.clock.now();
        let check = decide(
            remote.as_ref(),
            os,
            cached,
            self.health.platform(),
            now,
            self.offline_trust_max_age,
        );

        if remote.is_some() {
            let hint = PermissionStatus {
                granted: !check.should_prompt,
                platform: check
                    .status
                    .as_ref()
                    .map_or(self.health.platform(), |s| s.platform),
                granted_at: check.status.as_ref().and_then(|s| s.granted_at),
                source: PermissionSource::Backend,
                checked_at: now,
            };
            if let Err(e) = self.store.set_json(&key, &hint) {
                warn!("Failed to refresh cached permission: {}", e);
            }
        }

        debug!(
            "Permission for {}: {:?} (prompt: {})",
            user_id, check.reason, check.should_prompt
        );
        check
    }

    /// Record a new permission decision remotely, then in the cache.
    ///
    /// Returns `false` if either write failed.
    pub async fn update_permission_status(&self, user_id: &str, granted: bool) -> bool {
        let platform = self.health.platform();
        let update = PermissionUpdate { granted, platform };

        if let Err(e) = self.records.update_permission(user_id, &update).await {
            warn!("Failed to update permission record: {}", e);
            return false;
        }

        let now = self.clock.now();
        let status = PermissionStatus {
            granted,
            platform,
            granted_at: granted.then_some(now),
            source: PermissionSource::Backend,
            checked_at: now,
        };
        match self.store.set_json(&cache_key(user_id), &status) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to cache permission: {}", e);
                false
            }
        }
    }
}

/// Fixed-precedence permission decision.
fn decide(
    remote: Option<&RemotePermission>,
    os: Option<bool>,
    cached: Option<PermissionStatus>,
    platform: Platform,
    now: OffsetDateTime,
    offline_trust_max_age: Option<Duration>,
) -> PermissionCheck {
    let check = |reason: PromptReason, status: Option<PermissionStatus>| PermissionCheck {
        should_prompt: reason.should_prompt(),
        reason,
        status,
    };

    if let Some(remote) = remote {
        let backend = PermissionStatus {
            granted: remote.health_permission_granted,
            platform: remote.health_permission_platform.unwrap_or(platform),
            granted_at: remote.health_permission_granted_at,
            source: PermissionSource::Backend,
            checked_at: now,
        };

        if !remote.health_permission_granted {
            return check(PromptReason::BackendDenied, Some(backend));
        }
        if os == Some(false) {
            let revoked = PermissionStatus {
                granted: false,
                platform,
                granted_at: None,
                source: PermissionSource::Os,
                checked_at: now,
            };
            return check(PromptReason::RevokedOutOfBand, Some(revoked));
        }
        return check(PromptReason::Granted, Some(backend));
    }

    match cached {
        Some(status) if status.granted && within_trust(&status, now, offline_trust_max_age) => {
            let status = PermissionStatus {
                source: PermissionSource::Cache,
                ..status
            };
            check(PromptReason::OfflineCacheTrusted, Some(status))
        }
        _ => check(PromptReason::Undetermined, None),
    }
}

fn within_trust(status: &PermissionStatus, now: OffsetDateTime, max_age: Option<Duration>) -> bool {
    let Some(max_age) = max_age else {
        return true;
    };
    let age = now - status.checked_at;
    // Hints from the future count as new.
    age.is_negative() || age <= max_age
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::{MockBackend, MockHealthSource};
    use time::macros::datetime;
    use vitals_store::MemoryStore;

    struct Fixture {
        backend: Arc<MockBackend>,
        health: Arc<MockHealthSource>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<ManualClock>,
        resolver: PermissionStateResolver,
    }

    fn fixture(max_age: Option<Duration>) -> Fixture {
        let backend = Arc::new(MockBackend::new());
        let health = Arc::new(MockHealthSource::new(Platform::Android));
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let resolver = PermissionStateResolver::new(
            backend.clone(),
            health.clone(),
            Arc::clone(&store),
            clock.clone(),
            max_age,
        );
        Fixture {
            backend,
            health,
            store,
            clock,
            resolver,
        }
    }

    fn cached(f: &Fixture, granted: bool) {
        let status = PermissionStatus {
            granted,
            platform: Platform::Android,
            granted_at: None,
            source: PermissionSource::Backend,
            checked_at: f.clock.now(),
        };
        f.store.set_json(&cache_key("42"), &status).unwrap();
    }

    #[tokio::test]
    async fn test_backend_denial_wins() {
        let f = fixture(None);
        f.backend.set_permission("42", false, Some(Platform::Android));
        f.health.set_os_permission(Some(true));
        cached(&f, true);

        let check = f.resolver.check_permission_status("42").await;
        assert!(check.should_prompt);
        assert_eq!(check.reason, PromptReason::BackendDenied);
    }

    #[tokio::test]
    async fn test_os_revocation_prompts() {
        let f = fixture(None);
        f.backend.set_permission("42", true, Some(Platform::Android));
        f.health.set_os_permission(Some(false));

        let check = f.resolver.check_permission_status("42").await;
        assert!(check.should_prompt);
        assert_eq!(check.reason, PromptReason::RevokedOutOfBand);
        assert_eq!(check.status.unwrap().source, PermissionSource::Os);
    }

    #[tokio::test]
    async fn test_granted_when_os_agrees_or_unknown() {
        let f = fixture(None);
        f.backend.set_permission("42", true, Some(Platform::Android));

        f.health.set_os_permission(Some(true));
        assert!(!f.resolver.check_permission_status("42").await.should_prompt);

        f.health.set_os_permission(None);
        let check = f.resolver.check_permission_status("42").await;
        assert_eq!(check.reason, PromptReason::Granted);

        // The reachable answer refreshed the hint.
        let hint: PermissionStatus = f.store.get_json(&cache_key("42")).unwrap().unwrap();
        assert!(hint.granted);
    }

    #[tokio::test]
    async fn test_offline_trusts_cached_grant() {
        let f = fixture(Some(Duration::from_secs(72 * 3600)));
        cached(&f, true);
        f.backend.set_permission_offline(true);

        let check = f.resolver.check_permission_status("42").await;
        assert!(!check.should_prompt);
        assert_eq!(check.reason, PromptReason::OfflineCacheTrusted);
        assert_eq!(check.status.unwrap().source, PermissionSource::Cache);
    }

    #[tokio::test]
    async fn test_offline_trust_expires() {
        let f = fixture(Some(Duration::from_secs(72 * 3600)));
        cached(&f, true);
        f.backend.set_permission_offline(true);
        f.clock.advance(Duration::from_secs(73 * 3600));

        let check = f.resolver.check_permission_status("42").await;
        assert!(check.should_prompt);
        assert_eq!(check.reason, PromptReason::Undetermined);
    }

    #[tokio::test]
    async fn test_offline_without_cache_prompts() {
        let f = fixture(None);
        f.backend.set_offline(true);
        let check = f.resolver.check_permission_status("42").await;
        assert_eq!(check.reason, PromptReason::Undetermined);
        assert!(check.status.is_none());
    }

    #[tokio::test]
    async fn test_update_writes_remote_then_cache() {
        let f = fixture(None);
        assert!(f.resolver.update_permission_status("42", true).await);

        let hint: PermissionStatus = f.store.get_json(&cache_key("42")).unwrap().unwrap();
        assert!(hint.granted);
        assert_eq!(hint.granted_at, Some(f.clock.now()));
        assert_eq!(
            f.resolver.check_permission_status("42").await.reason,
            PromptReason::Granted
        );

        f.backend.set_offline(true);
        assert!(!f.resolver.update_permission_status("42", false).await);
    }
}
