//! Identity and write authorization boundary.
//!
//! Cryptographic identity and the role-based access-control engine are
//! external collaborators. This module holds what belongs to federation:
//! the *policy* for federation index writes — the index owner is always
//! allowed, sites on the owner's follow list are allowed, everyone else is
//! denied.

use crate::store::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The local node's identity, as provided by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Public key (or stable address) of this node.
    pub public_key: String,
}

impl Identity {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
        }
    }
}

/// Predicate deciding whether `actor` may write.
///
/// The enforcement mechanism (signature checks, capability lookups) lives
/// in the access-control collaborator; implementations of this trait adapt
/// it to a yes/no answer.
pub trait WriteAuthorizer: Send + Sync + 'static {
    fn can_write(&self, actor: &str) -> BoxFuture<'_, bool>;
}

/// The federation index write policy: owner always allowed, followed sites
/// allowed, everyone else denied.
///
/// The follow set is shared with the engine, which updates it as follow
/// edges come and go.
pub struct FollowListAuthorizer {
    owner: String,
    followed: Arc<RwLock<HashSet<String>>>,
}

impl FollowListAuthorizer {
    pub fn new(owner: impl Into<String>, followed: Arc<RwLock<HashSet<String>>>) -> Self {
        Self {
            owner: owner.into(),
            followed,
        }
    }

    /// The index owner's identity.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl WriteAuthorizer for FollowListAuthorizer {
    fn can_write(&self, actor: &str) -> BoxFuture<'_, bool> {
        let actor = actor.to_string();
        Box::pin(async move {
            if actor == self.owner {
                return true;
            }
            self.followed.read().await.contains(&actor)
        })
    }
}

/// Authorizer that accepts every writer. Testing/standalone only.
pub struct AllowAllAuthorizer;

impl WriteAuthorizer for AllowAllAuthorizer {
    fn can_write(&self, _actor: &str) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn follow_set(sites: &[&str]) -> Arc<RwLock<HashSet<String>>> {
        Arc::new(RwLock::new(
            sites.iter().map(|s| s.to_string()).collect(),
        ))
    }

    #[tokio::test]
    async fn test_owner_always_allowed() {
        let auth = FollowListAuthorizer::new("owner-key", follow_set(&[]));
        assert!(auth.can_write("owner-key").await);
    }

    #[tokio::test]
    async fn test_followed_site_allowed() {
        let auth = FollowListAuthorizer::new("owner-key", follow_set(&["site-b", "site-c"]));
        assert!(auth.can_write("site-b").await);
        assert!(auth.can_write("site-c").await);
    }

    #[tokio::test]
    async fn test_stranger_denied() {
        let auth = FollowListAuthorizer::new("owner-key", follow_set(&["site-b"]));
        assert!(!auth.can_write("site-z").await);
    }

    #[tokio::test]
    async fn test_follow_set_updates_take_effect() {
        let followed = follow_set(&[]);
        let auth = FollowListAuthorizer::new("owner-key", Arc::clone(&followed));

        assert!(!auth.can_write("site-b").await);
        followed.write().await.insert("site-b".to_string());
        assert!(auth.can_write("site-b").await);

        followed.write().await.remove("site-b");
        assert!(!auth.can_write("site-b").await);
    }

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAllAuthorizer.can_write("anyone").await);
    }
}
