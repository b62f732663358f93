//! Ambient identity context.
//!
//! The registry stamps new jobs with the current user and organization, and
//! the dispatcher runs each job under the identity that created it. Identity
//! storage is external; the registry only needs [`SecurityService`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tracing::trace;

/// Get/set access to the identity of the current caller.
pub trait SecurityService: Send + Sync {
    fn user(&self) -> Option<String>;
    fn organization(&self) -> Option<String>;
    fn set_user(&self, user: Option<String>);
    fn set_organization(&self, organization: Option<String>);
}

#[derive(Debug, Default, Clone)]
struct Identity {
    user: Option<String>,
    organization: Option<String>,
}

/// Security service that keeps one identity per OS thread.
///
/// Dispatch of a single job never yields, so binding the identity to the
/// thread is enough for the dispatcher. Async callers that hop threads must
/// set the identity on every poll.
#[derive(Debug, Default)]
pub struct ThreadSecurityService {
    identities: Mutex<HashMap<ThreadId, Identity>>,
}

impl ThreadSecurityService {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_current<R>(&self, f: impl FnOnce(&mut Identity) -> R) -> R {
        let mut map = self.identities.lock().unwrap_or_else(PoisonError::into_inner);
        let id = thread::current().id();
        let entry = map.entry(id).or_default();
        let result = f(entry);
        if entry.user.is_none() && entry.organization.is_none() {
            map.remove(&id);
        }
        result
    }
}

impl SecurityService for ThreadSecurityService {
    fn user(&self) -> Option<String> {
        self.with_current(|i| i.user.clone())
    }

    fn organization(&self) -> Option<String> {
        self.with_current(|i| i.organization.clone())
    }

    fn set_user(&self, user: Option<String>) {
        self.with_current(|i| i.user = user);
    }

    fn set_organization(&self, organization: Option<String>) {
        self.with_current(|i| i.organization = organization);
    }
}

/// Runs a block of work under a given identity.
///
/// The identity is installed on [`enter`](Self::enter) and cleared when the
/// scope is dropped, on every exit path including early returns and panics.
#[must_use = "the identity is cleared as soon as the scope is dropped"]
pub struct IdentityScope<'a> {
    security: &'a dyn SecurityService,
}

impl<'a> IdentityScope<'a> {
    pub fn enter(
        security: &'a dyn SecurityService,
        user: Option<String>,
        organization: Option<String>,
    ) -> Self {
        trace!(?user, ?organization, "entering identity scope");
        security.set_user(user);
        security.set_organization(organization);
        Self { security }
    }
}

impl Drop for IdentityScope<'_> {
    fn drop(&mut self) {
        self.security.set_user(None);
        self.security.set_organization(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_and_get_on_same_thread() {
        let security = ThreadSecurityService::new();
        security.set_user(Some("admin".to_string()));
        security.set_organization(Some("org".to_string()));

        assert_eq!(security.user().as_deref(), Some("admin"));
        assert_eq!(security.organization().as_deref(), Some("org"));
    }

    #[test]
    fn identity_is_per_thread() {
        let security = Arc::new(ThreadSecurityService::new());
        security.set_user(Some("admin".to_string()));

        let other = security.clone();
        let seen = thread::spawn(move || other.user()).join().unwrap();
        assert_eq!(seen, None);
        assert_eq!(security.user().as_deref(), Some("admin"));
    }

    #[test]
    fn scope_clears_identity_on_drop() {
        let security = ThreadSecurityService::new();
        {
            let _scope = IdentityScope::enter(
                &security,
                Some("alice".to_string()),
                Some("org-a".to_string()),
            );
            assert_eq!(security.user().as_deref(), Some("alice"));
        }
        assert_eq!(security.user(), None);
        assert_eq!(security.organization(), None);
    }

    #[test]
    fn scope_clears_identity_on_panic() {
        let security = ThreadSecurityService::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = IdentityScope::enter(&security, Some("bob".to_string()), None);
            panic!("dispatch blew up");
        }));
        assert!(result.is_err());
        assert_eq!(security.user(), None);
    }
}
