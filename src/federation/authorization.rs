//! Authorization voters
//!
//! A request is granted when any registered voter grants it.

use std::sync::Arc;

use super::vocab::Follow;

/// Capabilities checked against inbound activities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    CanFollow,
}

pub trait Voter: Send + Sync {
    fn supports(&self, attribute: Attribute) -> bool;

    fn vote(&self, follow: &Follow, attribute: Attribute) -> bool;
}

/// Grants actors whose handle ends with an allow-list entry.
///
/// The handle is rebuilt from the actor IRI as `@{last path segment}@{host}`.
/// Matching is a plain suffix test, so `bob@b.example` and `@b.example`
/// are both valid entries. This is over-permissive: an entry `b.example`
/// also admits `@bob@evilb.example`.
pub struct ActivityVoter {
    allowed: Vec<String>,
}

impl ActivityVoter {
    pub fn new(allowed: Vec<String>) -> Self {
        let allowed = allowed
            .into_iter()
            .map(|entry| entry.trim().to_ascii_lowercase())
            .filter(|entry| !entry.is_empty())
            .collect();
        Self { allowed }
    }
}

/// `@name@host` handle of an actor IRI.
pub fn handle_of(actor: &str) -> Option<String> {
    let url = url::Url::parse(actor).ok()?;
    let host = url.host_str()?;
    let name = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()?;
    Some(format!("@{}@{}", name, host).to_ascii_lowercase())
}

impl Voter for ActivityVoter {
    fn supports(&self, attribute: Attribute) -> bool {
        attribute == Attribute::CanFollow
    }

    fn vote(&self, follow: &Follow, _attribute: Attribute) -> bool {
        let [actor] = follow.actors.as_slice() else {
            tracing::debug!(actors = follow.actors.len(), "follow must carry exactly one actor");
            return false;
        };
        let Some(handle) = handle_of(actor) else {
            return false;
        };
        self.allowed.iter().any(|entry| handle.ends_with(entry.as_str()))
    }
}

#[derive(Clone, Default)]
pub struct AuthorizationChecker {
    voters: Vec<Arc<dyn Voter>>,
}

impl AuthorizationChecker {
    pub fn new(voters: Vec<Arc<dyn Voter>>) -> Self {
        Self { voters }
    }

    pub fn is_granted(&self, follow: &Follow, attribute: Attribute) -> bool {
        self.voters
            .iter()
            .filter(|voter| voter.supports(attribute))
            .any(|voter| voter.vote(follow, attribute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn follow(actors: &[&str]) -> Follow {
        Follow {
            id: None,
            actors: actors.iter().map(|a| a.to_string()).collect(),
            objects: vec!["https://a.example/users/alice".to_string()],
            raw: Value::Null,
        }
    }

    fn checker(allowed: &[&str]) -> AuthorizationChecker {
        let voter = ActivityVoter::new(allowed.iter().map(|a| a.to_string()).collect());
        AuthorizationChecker::new(vec![Arc::new(voter)])
    }

    #[test]
    fn test_handle_of() {
        assert_eq!(
            handle_of("https://b.example/users/bob").as_deref(),
            Some("@bob@b.example")
        );
        assert_eq!(handle_of("https://b.example/@Bob/").as_deref(), Some("@@bob@b.example"));
        assert_eq!(handle_of("not a url"), None);
    }

    #[test]
    fn test_full_handle_and_host_entries() {
        let bob = follow(&["https://b.example/users/bob"]);
        assert!(checker(&["bob@b.example"]).is_granted(&bob, Attribute::CanFollow));
        assert!(checker(&["@b.example"]).is_granted(&bob, Attribute::CanFollow));
        assert!(!checker(&["carol@b.example"]).is_granted(&bob, Attribute::CanFollow));
        assert!(!checker(&[]).is_granted(&bob, Attribute::CanFollow));
    }

    #[test]
    fn test_suffix_match_is_over_permissive() {
        let evil = follow(&["https://evilb.example/users/bob"]);
        assert!(checker(&["b.example"]).is_granted(&evil, Attribute::CanFollow));
        assert!(!checker(&["@b.example"]).is_granted(&evil, Attribute::CanFollow));
    }

    #[test]
    fn test_requires_exactly_one_actor() {
        let checker = checker(&["@b.example"]);
        assert!(!checker.is_granted(&follow(&[]), Attribute::CanFollow));
        assert!(!checker.is_granted(
            &follow(&["https://b.example/users/bob", "https://b.example/users/eve"]),
            Attribute::CanFollow
        ));
    }

    #[test]
    fn test_any_voter_grants() {
        struct Always;
        impl Voter for Always {
            fn supports(&self, _attribute: Attribute) -> bool {
                true
            }
            fn vote(&self, _follow: &Follow, _attribute: Attribute) -> bool {
                true
            }
        }

        let checker = AuthorizationChecker::new(vec![
            Arc::new(ActivityVoter::new(Vec::new())),
            Arc::new(Always),
        ]);
        assert!(checker.is_granted(&follow(&["https://c.example/users/x"]), Attribute::CanFollow));
    }
}
