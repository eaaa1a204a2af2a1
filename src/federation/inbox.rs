//! Inbox processing
//!
//! Follow and Undo(Follow) are the only activities a bridged user accepts.
//! Follows are answered asynchronously: an Accept or Reject task is queued
//! and delivered by the workers.

use serde_json::Value;
use std::sync::Arc;

use super::authorization::{Attribute, AuthorizationChecker};
use super::keys::KeyFetcher;
use super::vocab::{self, Activity, Follow, Undo};
use crate::data::{ActorRepository, LocalUser, RemoteActor, UserRepository};
use crate::error::AppError;
use crate::metrics::INBOX_ACTIVITIES_TOTAL;
use crate::trace::TraceId;
use crate::worker::{Task, TaskQueue};

pub struct InboxService {
    /// Authority (`host[:port]`) actors are served under
    domain: String,
    users: Arc<dyn UserRepository>,
    actors: Arc<dyn ActorRepository>,
    queue: Arc<dyn TaskQueue>,
    keys: Arc<dyn KeyFetcher>,
    authorization: AuthorizationChecker,
}

impl InboxService {
    pub fn new(
        domain: &str,
        users: Arc<dyn UserRepository>,
        actors: Arc<dyn ActorRepository>,
        queue: Arc<dyn TaskQueue>,
        keys: Arc<dyn KeyFetcher>,
        authorization: AuthorizationChecker,
    ) -> Self {
        Self {
            domain: domain.trim().trim_end_matches('/').to_ascii_lowercase(),
            users,
            actors,
            queue,
            keys,
            authorization,
        }
    }

    /// Process an inbound activity.
    ///
    /// # Errors
    /// Domain errors map to 4xx responses, see [`AppError::handler_error`].
    pub async fn handle(&self, activity: &Value, trace_id: &TraceId) -> Result<(), AppError> {
        let activity = vocab::resolve(activity).map_err(|e| AppError::Validation(e.to_string()))?;
        let activity_type = activity.type_name().to_string();

        let result = match activity {
            Activity::Follow(follow) => self.follow(follow, trace_id).await,
            Activity::Undo(undo) => self.undo(undo).await,
            Activity::Other(name) => Err(AppError::UnsupportedActivity(name)),
        };

        let outcome = match &result {
            Ok(()) => "accepted",
            Err(e) => e.handler_error().kind,
        };
        INBOX_ACTIVITIES_TOTAL
            .with_label_values(&[activity_type.as_str(), outcome])
            .inc();
        result
    }

    async fn follow(&self, follow: Follow, trace_id: &TraceId) -> Result<(), AppError> {
        let object = match follow.objects.as_slice() {
            [object] => object.clone(),
            _ => {
                return Err(AppError::Validation(
                    "follow must target exactly one object".to_string(),
                ));
            }
        };
        let user = self.local_user(&object).await?;

        if !self.authorization.is_granted(&follow, Attribute::CanFollow) {
            let actor = follow.actors.join(", ");
            tracing::info!(actor = %actor, username = %user.username, "follow denied");
            self.enqueue(&Task::reject_follow(trace_id.as_str(), &user.username, follow.raw))
                .await?;
            return Err(AppError::ActorNotAllowed { actor });
        }

        // A granted follow has exactly one actor
        let actor_url = follow
            .actors
            .first()
            .ok_or_else(|| AppError::Validation("follow has no actor".to_string()))?;
        let actor = self.actor_or_create(actor_url).await?;

        self.users.follow(&user, &actor).await?;
        self.enqueue(&Task::accept_follow(trace_id.as_str(), &user.username, follow.raw))
            .await?;
        tracing::info!(actor = %actor.url, username = %user.username, "follow accepted");
        Ok(())
    }

    async fn undo(&self, undo: Undo) -> Result<(), AppError> {
        let follow = match undo.objects.as_slice() {
            [object] => vocab::resolve_follow(object).ok_or_else(|| {
                AppError::UnsupportedUndoObject("undone object is not an embedded Follow".to_string())
            })?,
            [] => return Err(AppError::UnsupportedUndoObject("no object".to_string())),
            objects => {
                return Err(AppError::UnsupportedUndoObject(format!(
                    "{} objects",
                    objects.len()
                )));
            }
        };

        let object = follow
            .objects
            .first()
            .ok_or_else(|| AppError::UnsupportedUndoObject("follow has no object".to_string()))?;
        let user = self.local_user(object).await?;

        let actor_url = match undo.actors.as_slice() {
            [actor] => actor,
            _ => {
                return Err(AppError::Validation(
                    "undo must carry exactly one actor".to_string(),
                ));
            }
        };
        let actor = self
            .actors
            .get(actor_url)
            .await?
            .ok_or_else(|| AppError::ActorNotFound(actor_url.clone()))?;

        self.users.unfollow(&user, &actor).await?;
        tracing::info!(actor = %actor.url, username = %user.username, "follow undone");
        Ok(())
    }

    /// Local user addressed by an object IRI of this domain.
    async fn local_user(&self, object: &str) -> Result<LocalUser, AppError> {
        let mismatch = || AppError::FollowMismatchDomain {
            object: object.to_string(),
        };
        let url = url::Url::parse(object).map_err(|_| mismatch())?;
        let host = url.host_str().ok_or_else(mismatch)?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        if !authority.eq_ignore_ascii_case(&self.domain) {
            return Err(mismatch());
        }

        let username = url
            .path_segments()
            .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
            .unwrap_or_default();

        self.users
            .get(username)
            .await?
            .ok_or_else(|| AppError::UserDoesNotExist(username.to_string()))
    }

    async fn actor_or_create(&self, actor_url: &str) -> Result<RemoteActor, AppError> {
        if let Some(actor) = self.actors.get(actor_url).await? {
            return Ok(actor);
        }

        let key = self.keys.fetch_key(actor_url).await?;
        let actor = self.actors.create(actor_url, &key.pem).await?;
        tracing::debug!(actor = %actor.url, "remote actor created");
        Ok(actor)
    }

    async fn enqueue(&self, task: &Task) -> Result<(), AppError> {
        let id = self.queue.enqueue(task).await?;
        tracing::debug!(task_id = %id, kind = task.kind(), "task enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Database;
    use crate::federation::authorization::ActivityVoter;
    use crate::federation::keys::{
        FetchedKey, KeyError, PublicKey, encode_private_key, format_pub_key, generate_key,
    };
    use crate::worker::QueuedTask;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingQueue {
        tasks: Mutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskQueue for RecordingQueue {
        async fn enqueue(&self, task: &Task) -> Result<String, AppError> {
            self.tasks.lock().unwrap().push(task.clone());
            Ok("task".to_string())
        }

        async fn dequeue(&self) -> Result<Option<QueuedTask>, AppError> {
            Ok(None)
        }

        async fn complete(&self, _task: &QueuedTask) -> Result<(), AppError> {
            Ok(())
        }

        async fn retry(&self, _task: &QueuedTask, _error: &str, _delay: Duration) -> Result<(), AppError> {
            Ok(())
        }

        async fn archive(&self, _task: &QueuedTask, _error: &str) -> Result<(), AppError> {
            Ok(())
        }
    }

    /// Hands out one fixed key and counts fetches.
    struct StaticKeys {
        pem: String,
        fetches: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl KeyFetcher for StaticKeys {
        async fn fetch_key(&self, key_id: &str) -> Result<Arc<FetchedKey>, KeyError> {
            self.fetches.lock().unwrap().push(key_id.to_string());
            Ok(Arc::new(FetchedKey {
                key_id: key_id.to_string(),
                owner: Some(key_id.to_string()),
                pem: self.pem.clone(),
                key: PublicKey::from_pem(&self.pem)?,
            }))
        }

        async fn invalidate(&self, _key_id: &str) {}
    }

    struct Fixture {
        inbox: InboxService,
        db: Arc<Database>,
        queue: Arc<RecordingQueue>,
        keys: Arc<StaticKeys>,
        alice: LocalUser,
        _dir: TempDir,
    }

    async fn fixture(allowed: &[&str]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&dir.path().join("test.db")).await.unwrap());
        let key = generate_key().unwrap();
        let alice = LocalUser {
            username: "alice".to_string(),
            upstream_id: 1,
            private_key_pem: encode_private_key(&key).unwrap(),
            created_at: Utc::now(),
        };
        db.create_user(&alice).await.unwrap();

        let queue = Arc::new(RecordingQueue::default());
        let keys = Arc::new(StaticKeys {
            pem: format_pub_key(&key.to_public_key()),
            fetches: Mutex::new(Vec::new()),
        });
        let voter = ActivityVoter::new(allowed.iter().map(|a| a.to_string()).collect());
        let inbox = InboxService::new(
            "a.example",
            db.clone(),
            db.clone(),
            queue.clone(),
            keys.clone(),
            AuthorizationChecker::new(vec![Arc::new(voter)]),
        );

        Fixture {
            inbox,
            db,
            queue,
            keys,
            alice,
            _dir: dir,
        }
    }

    fn follow_activity(actor: &str, object: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{actor}/follows/1"),
            "type": "Follow",
            "actor": actor,
            "object": object,
        })
    }

    fn undo_activity(actor: &str, object: Value) -> Value {
        json!({
            "id": format!("{actor}/undo/1"),
            "type": "Undo",
            "actor": actor,
            "object": object,
        })
    }

    const BOB: &str = "https://b.example/users/bob";
    const ALICE: &str = "https://a.example/users/alice";

    #[tokio::test]
    async fn test_allowed_follow_creates_edge_and_accept() {
        let fx = fixture(&["bob@b.example"]).await;
        let activity = follow_activity(BOB, ALICE);

        fx.inbox.handle(&activity, &TraceId::from("t1".to_string())).await.unwrap();

        let followers = fx.db.get_followers(&fx.alice).await.unwrap();
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].url, BOB);
        assert_eq!(*fx.keys.fetches.lock().unwrap(), vec![BOB.to_string()]);

        let tasks = fx.queue.tasks.lock().unwrap();
        assert_eq!(*tasks, vec![Task::accept_follow("t1", "alice", activity)]);
    }

    #[tokio::test]
    async fn test_denied_follow_queues_reject_without_edge() {
        let fx = fixture(&["carol@b.example"]).await;
        let activity = follow_activity(BOB, ALICE);

        let error = fx.inbox.handle(&activity, &TraceId::new()).await.unwrap_err();
        assert!(matches!(error, AppError::ActorNotAllowed { ref actor } if actor == BOB));

        assert!(fx.db.get_followers(&fx.alice).await.unwrap().is_empty());
        assert!(fx.keys.fetches.lock().unwrap().is_empty());
        let tasks = fx.queue.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(&tasks[0], Task::RejectFollow(payload) if payload.username == "alice"));
    }

    #[tokio::test]
    async fn test_foreign_object_is_rejected_before_authorization() {
        for allowed in [&["bob@b.example"][..], &[][..]] {
            let fx = fixture(allowed).await;
            let activity = follow_activity(BOB, "https://other.example/users/alice");

            let error = fx.inbox.handle(&activity, &TraceId::new()).await.unwrap_err();
            assert!(matches!(error, AppError::FollowMismatchDomain { .. }));
            assert!(fx.queue.tasks.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_unknown_local_user() {
        let fx = fixture(&["bob@b.example"]).await;
        let activity = follow_activity(BOB, "https://a.example/users/nobody");

        let error = fx.inbox.handle(&activity, &TraceId::new()).await.unwrap_err();
        assert!(matches!(error, AppError::UserDoesNotExist(ref name) if name == "nobody"));
    }

    #[tokio::test]
    async fn test_known_actor_is_not_fetched_again() {
        let fx = fixture(&["@b.example"]).await;
        ActorRepository::create(fx.db.as_ref(), BOB, &fx.keys.pem).await.unwrap();

        fx.inbox
            .handle(&follow_activity(BOB, ALICE), &TraceId::new())
            .await
            .unwrap();
        assert!(fx.keys.fetches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undo_removes_edge_and_is_idempotent() {
        let fx = fixture(&["bob@b.example"]).await;
        let follow = follow_activity(BOB, ALICE);
        fx.inbox.handle(&follow, &TraceId::new()).await.unwrap();

        let undo = undo_activity(BOB, follow);
        fx.inbox.handle(&undo, &TraceId::new()).await.unwrap();
        assert!(fx.db.get_followers(&fx.alice).await.unwrap().is_empty());

        fx.inbox.handle(&undo, &TraceId::new()).await.unwrap();
        // Only the Accept of the original follow was queued
        assert_eq!(fx.queue.tasks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undo_from_unknown_actor() {
        let fx = fixture(&["bob@b.example"]).await;
        let undo = undo_activity(BOB, follow_activity(BOB, ALICE));

        let error = fx.inbox.handle(&undo, &TraceId::new()).await.unwrap_err();
        assert!(matches!(error, AppError::ActorNotFound(_)));
    }

    #[tokio::test]
    async fn test_undo_requires_a_single_embedded_follow() {
        let fx = fixture(&["bob@b.example"]).await;
        let follow = follow_activity(BOB, ALICE);

        for object in [
            json!([]),
            json!([follow.clone(), follow.clone()]),
            json!("https://b.example/users/bob/follows/1"),
            json!({"type": "Like", "object": ALICE}),
        ] {
            let error = fx
                .inbox
                .handle(&undo_activity(BOB, object), &TraceId::new())
                .await
                .unwrap_err();
            assert!(matches!(error, AppError::UnsupportedUndoObject(_)), "{error}");
        }
    }

    #[tokio::test]
    async fn test_other_activities_are_unsupported() {
        let fx = fixture(&["bob@b.example"]).await;
        let error = fx
            .inbox
            .handle(&json!({"type": "Like", "actor": BOB}), &TraceId::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::UnsupportedActivity(ref name) if name == "Like"));
    }
}
