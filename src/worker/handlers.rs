//! Task handlers
//!
//! Turn tasks into signed deliveries. Failures are classified here:
//! anything retrying cannot fix is permanent.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use super::consumer::Handler;
use super::errors::TaskError;
use super::tasks::{FollowPayload, SendPostPayload, Task};
use crate::data::{ActorRepository, LocalUser, RemoteActor, UserRepository};
use crate::federation::vocab::{self, Urls};
use crate::federation::{ActivityPubClient, DeliveryError};
use crate::service::PostService;

pub struct TaskHandlers {
    users: Arc<dyn UserRepository>,
    actors: Arc<dyn ActorRepository>,
    posts: Arc<PostService>,
    client: Arc<dyn ActivityPubClient>,
    urls: Urls,
}

impl TaskHandlers {
    pub fn new(
        users: Arc<dyn UserRepository>,
        actors: Arc<dyn ActorRepository>,
        posts: Arc<PostService>,
        client: Arc<dyn ActivityPubClient>,
        urls: Urls,
    ) -> Self {
        Self {
            users,
            actors,
            posts,
            client,
            urls,
        }
    }

    async fn local_user(&self, username: &str) -> Result<LocalUser, TaskError> {
        self.users
            .get(username)
            .await
            .map_err(TaskError::transient)?
            .ok_or_else(|| TaskError::permanent(anyhow!("user {username} not found")))
    }

    async fn remote_actor(&self, url: &str) -> Result<Option<RemoteActor>, TaskError> {
        self.actors.get(url).await.map_err(TaskError::transient)
    }

    async fn deliver(
        &self,
        from: &LocalUser,
        to: &RemoteActor,
        activity: &serde_json::Value,
    ) -> Result<(), TaskError> {
        self.client
            .post_inbox(from, to, activity)
            .await
            .map_err(delivery_error)
    }

    async fn answer_follow(&self, payload: FollowPayload, accept: bool) -> Result<(), TaskError> {
        let follow = vocab::resolve_follow(&payload.activity)
            .ok_or_else(|| TaskError::permanent(anyhow!("stored activity is not a Follow")))?;
        let actor_url = match follow.actors.as_slice() {
            [actor] => actor.clone(),
            _ => return Err(TaskError::permanent(anyhow!("follow must carry exactly one actor"))),
        };

        let user = self.local_user(&payload.username).await?;
        let actor = match self.remote_actor(&actor_url).await? {
            Some(actor) => actor,
            // Rejected actors are never stored
            None if !accept => RemoteActor {
                id: String::new(),
                url: actor_url.clone(),
                public_key_pem: String::new(),
                created_at: Utc::now(),
            },
            None => return Err(TaskError::permanent(anyhow!("actor {actor_url} not found"))),
        };

        let activity = if accept {
            vocab::accept(&self.urls, &user.username, &payload.activity)
        } else {
            vocab::reject(&self.urls, &user.username, &payload.activity)
        };
        self.deliver(&user, &actor, &activity).await?;
        tracing::info!(actor = %actor.url, username = %user.username, accept, "follow answered");
        Ok(())
    }

    async fn send_post(&self, payload: SendPostPayload) -> Result<(), TaskError> {
        let user = self.local_user(&payload.from).await?;
        let actor = self
            .remote_actor(&payload.to)
            .await?
            .ok_or_else(|| TaskError::permanent(anyhow!("actor {} not found", payload.to)))?;

        let post = self
            .posts
            .save_post_and_references(&payload.post_id)
            .await
            .map_err(|e| {
                let retry = e.is_transient();
                TaskError::new(e, retry).context("unable to materialize post")
            })?;

        let activity = vocab::create_note(&self.urls, &user.username, &post);
        self.deliver(&user, &actor, &activity).await?;
        tracing::debug!(post_id = %post.id, to = %actor.url, "post delivered");
        Ok(())
    }
}

fn delivery_error(error: DeliveryError) -> TaskError {
    let retry = error.is_retryable();
    TaskError::new(error, retry)
}

#[async_trait]
impl Handler for TaskHandlers {
    async fn handle(&self, task: Task) -> Result<(), TaskError> {
        match task {
            Task::AcceptFollow(payload) => self.answer_follow(payload, true).await,
            Task::RejectFollow(payload) => self.answer_follow(payload, false).await,
            Task::SendPost(payload) => self.send_post(payload).await,
        }
    }
}
