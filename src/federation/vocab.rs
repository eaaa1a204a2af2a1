//! ActivityStreams vocabulary
//!
//! The small subset of the vocabulary this bridge speaks: resolving
//! inbound Follow and Undo activities, and building the documents and
//! activities it serves or sends.

use serde_json::{Value, json};
use thiserror::Error;

use crate::data::EntityId;
use crate::service::FullUser;
use crate::twitter::{Post, ReferenceKind};

pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";
pub const ACTIVITY_JSON: &str = "application/activity+json";

const UPSTREAM_WEB_URL: &str = "https://twitter.com";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VocabError {
    #[error("activity has no type")]
    MissingType,

    #[error("invalid activity: {0}")]
    Invalid(String),
}

/// Absolute URLs of everything served for a user
#[derive(Debug, Clone)]
pub struct Urls {
    base_url: String,
}

impl Urls {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn user(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url, username)
    }

    pub fn inbox(&self, username: &str) -> String {
        format!("{}/inbox", self.user(username))
    }

    pub fn outbox(&self, username: &str) -> String {
        format!("{}/outbox", self.user(username))
    }

    pub fn followers(&self, username: &str) -> String {
        format!("{}/followers", self.user(username))
    }

    pub fn following(&self, username: &str) -> String {
        format!("{}/following", self.user(username))
    }

    pub fn status(&self, username: &str, post_id: &str) -> String {
        format!("{}/statuses/{}", self.user(username), post_id)
    }

    pub fn key_id(&self, username: &str) -> String {
        format!("{}#main-key", self.user(username))
    }
}

/// A Follow activity, kept verbatim in `raw`
#[derive(Debug, Clone, PartialEq)]
pub struct Follow {
    pub id: Option<String>,
    pub actors: Vec<String>,
    pub objects: Vec<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Undo {
    pub id: Option<String>,
    pub actors: Vec<String>,
    /// Undone objects, as found in the activity (embedded or IRIs)
    pub objects: Vec<Value>,
}

/// Inbound activity, resolved by type
#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    Follow(Follow),
    Undo(Undo),
    /// Any other type, by name
    Other(String),
}

impl Activity {
    pub fn type_name(&self) -> &str {
        match self {
            Activity::Follow(_) => "Follow",
            Activity::Undo(_) => "Undo",
            Activity::Other(name) => name,
        }
    }
}

fn type_names(value: &Value) -> Vec<&str> {
    match value.get("type") {
        Some(Value::String(name)) => vec![name.as_str()],
        Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// IRIs of a property that may be an IRI, an object with an `id`, or an
/// array of either.
pub fn iris(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(iri)) => vec![iri.clone()],
        Some(Value::Object(object)) => object
            .get("id")
            .and_then(Value::as_str)
            .map(|id| vec![id.to_string()])
            .unwrap_or_default(),
        Some(Value::Array(items)) => items.iter().flat_map(|item| iris(Some(item))).collect(),
        _ => Vec::new(),
    }
}

fn as_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(item) => vec![item.clone()],
    }
}

/// Resolve a JSON activity to the types the inbox handles.
pub fn resolve(value: &Value) -> Result<Activity, VocabError> {
    if !value.is_object() {
        return Err(VocabError::Invalid("activity is not an object".to_string()));
    }
    let names = type_names(value);
    let id = value.get("id").and_then(Value::as_str).map(str::to_string);
    let actors = iris(value.get("actor"));

    if names.contains(&"Follow") {
        return Ok(Activity::Follow(Follow {
            id,
            actors,
            objects: iris(value.get("object")),
            raw: value.clone(),
        }));
    }
    if names.contains(&"Undo") {
        return Ok(Activity::Undo(Undo {
            id,
            actors,
            objects: as_list(value.get("object")),
        }));
    }

    names
        .first()
        .map(|name| Activity::Other(name.to_string()))
        .ok_or(VocabError::MissingType)
}

/// Resolve an embedded object expected to be a Follow.
pub fn resolve_follow(value: &Value) -> Option<Follow> {
    match resolve(value) {
        Ok(Activity::Follow(follow)) => Some(follow),
        _ => None,
    }
}

fn without_context(activity: &Value) -> Value {
    let mut activity = activity.clone();
    if let Some(object) = activity.as_object_mut() {
        object.remove("@context");
    }
    activity
}

fn answer(kind: &str, urls: &Urls, username: &str, follow: &Value) -> Value {
    let user = urls.user(username);
    json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "id": format!("{}#{}/follows/{}", user, kind.to_ascii_lowercase(), EntityId::new().0),
        "type": kind,
        "actor": user,
        "object": without_context(follow),
    })
}

/// Accept wrapping the Follow verbatim.
pub fn accept(urls: &Urls, username: &str, follow: &Value) -> Value {
    answer("Accept", urls, username, follow)
}

/// Reject wrapping the Follow verbatim.
pub fn reject(urls: &Urls, username: &str, follow: &Value) -> Value {
    answer("Reject", urls, username, follow)
}

/// Actor document of a bridged user.
pub fn actor(urls: &Urls, user: &FullUser) -> Value {
    let id = urls.user(&user.username);
    let mut actor = json!({
        "@context": [ACTIVITY_STREAMS_CONTEXT, SECURITY_CONTEXT],
        "id": id,
        "type": "Service",
        "preferredUsername": user.username,
        "name": user.name,
        "summary": user.description,
        "url": format!("{}/{}", UPSTREAM_WEB_URL, user.username),
        "published": user.created_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "inbox": urls.inbox(&user.username),
        "outbox": urls.outbox(&user.username),
        "followers": urls.followers(&user.username),
        "following": urls.following(&user.username),
        "manuallyApprovesFollowers": false,
        "publicKey": {
            "id": urls.key_id(&user.username),
            "owner": id,
            "publicKeyPem": user.public_key_pem,
        },
    });

    if let (Some(object), Some(icon)) = (actor.as_object_mut(), &user.profile_image_url) {
        object.insert(
            "icon".to_string(),
            json!({
                "type": "Image",
                "url": icon,
            }),
        );
    }
    actor
}

/// Collection exposing only its size.
pub fn ordered_collection(id: &str, total_items: u64) -> Value {
    json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "id": id,
        "type": "OrderedCollection",
        "totalItems": total_items,
    })
}

fn upstream_post_url(username: &str, post_id: &str) -> String {
    format!("{UPSTREAM_WEB_URL}/{username}/status/{post_id}")
}

fn paragraphs(text: &str) -> String {
    text.split("\n\n")
        .filter(|paragraph| !paragraph.trim().is_empty())
        .map(|paragraph| {
            let escaped = html_escape::encode_text(paragraph.trim());
            format!("<p>{}</p>", escaped.replace('\n', "<br>"))
        })
        .collect()
}

fn attachments(post: &Post) -> Vec<Value> {
    post.media
        .iter()
        .filter_map(|media| {
            let url = media.url.as_ref()?;
            Some(json!({
                "type": "Document",
                "mediaType": if url.ends_with(".png") { "image/png" } else { "image/jpeg" },
                "url": url,
                "width": media.width,
                "height": media.height,
            }))
        })
        .collect()
}

/// HTML content of a post.
///
/// Retweets show the retweeted text after an `RT @author:` prefix; a
/// quoted post is linked after the text.
fn content(post: &Post) -> String {
    if let Some(retweeted) = post.retweet() {
        return paragraphs(&format!(
            "RT @{}: {}",
            retweeted.author_username, retweeted.text
        ));
    }

    let mut content = paragraphs(&post.text);
    if let Some(quoted) = post
        .references
        .iter()
        .find(|reference| reference.reference_kind == Some(ReferenceKind::Quoted))
    {
        let link = upstream_post_url(&quoted.author_username, &quoted.id);
        content.push_str(&format!(
            "<p>RE: <a href=\"{}\">{}</a></p>",
            html_escape::encode_double_quoted_attribute(&link),
            html_escape::encode_text(&link)
        ));
    }
    content
}

/// Note rendering a post for a local user's followers.
pub fn note(urls: &Urls, username: &str, post: &Post) -> Value {
    let shown = post.retweet().unwrap_or(post);
    json!({
        "id": urls.status(username, &post.id),
        "type": "Note",
        "attributedTo": urls.user(username),
        "content": content(post),
        "published": post.published.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "url": upstream_post_url(&post.author_username, &post.id),
        "to": [PUBLIC_COLLECTION],
        "cc": [urls.followers(username)],
        "sensitive": post.sensitive,
        "attachment": attachments(shown),
    })
}

/// Create activity announcing a post.
pub fn create_note(urls: &Urls, username: &str, post: &Post) -> Value {
    let note = note(urls, username, post);
    json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "id": format!("{}/activity", urls.status(username, &post.id)),
        "type": "Create",
        "actor": urls.user(username),
        "published": note["published"].clone(),
        "to": note["to"].clone(),
        "cc": note["cc"].clone(),
        "object": note,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitter::Media;
    use chrono::{TimeZone, Utc};

    fn urls() -> Urls {
        Urls::new("https://bridge.example/")
    }

    fn post(id: &str, author: &str, text: &str) -> Post {
        Post {
            id: id.to_string(),
            author_id: "1".to_string(),
            author_username: author.to_string(),
            text: text.to_string(),
            published: Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap(),
            sensitive: false,
            media: Vec::new(),
            reference_kind: None,
            references: Vec::new(),
        }
    }

    #[test]
    fn test_urls() {
        let urls = urls();
        assert_eq!(urls.user("alice"), "https://bridge.example/users/alice");
        assert_eq!(urls.inbox("alice"), "https://bridge.example/users/alice/inbox");
        assert_eq!(
            urls.status("alice", "42"),
            "https://bridge.example/users/alice/statuses/42"
        );
        assert_eq!(urls.key_id("alice"), "https://bridge.example/users/alice#main-key");
    }

    #[test]
    fn test_resolve_follow_with_embedded_actor() {
        let activity = json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": {"id": "https://remote.example/users/bob", "type": "Person"},
            "object": "https://bridge.example/users/alice",
        });

        let Activity::Follow(follow) = resolve(&activity).unwrap() else {
            panic!("expected a follow");
        };
        assert_eq!(follow.actors, vec!["https://remote.example/users/bob"]);
        assert_eq!(follow.objects, vec!["https://bridge.example/users/alice"]);
        assert_eq!(follow.raw, activity);
    }

    #[test]
    fn test_resolve_undo_and_other_types() {
        let undo = json!({
            "type": "Undo",
            "actor": "https://remote.example/users/bob",
            "object": {"type": "Follow", "object": "https://bridge.example/users/alice"},
        });
        let Activity::Undo(undo) = resolve(&undo).unwrap() else {
            panic!("expected an undo");
        };
        assert_eq!(undo.objects.len(), 1);
        assert!(resolve_follow(&undo.objects[0]).is_some());

        assert_eq!(
            resolve(&json!({"type": "Like"})).unwrap(),
            Activity::Other("Like".to_string())
        );
        assert_eq!(resolve(&json!({"id": "x"})), Err(VocabError::MissingType));
        assert!(resolve(&json!("Follow")).is_err());
    }

    #[test]
    fn test_accept_embeds_follow_without_context() {
        let follow = json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": "https://remote.example/users/bob",
            "object": "https://bridge.example/users/alice",
        });

        let accept = accept(&urls(), "alice", &follow);
        assert_eq!(accept["type"], "Accept");
        assert_eq!(accept["actor"], "https://bridge.example/users/alice");
        assert!(
            accept["id"]
                .as_str()
                .unwrap()
                .starts_with("https://bridge.example/users/alice#accept/follows/")
        );
        assert_eq!(accept["object"]["id"], "https://remote.example/follows/1");
        assert!(accept["object"].get("@context").is_none());

        let reject = reject(&urls(), "alice", &follow);
        assert_eq!(reject["type"], "Reject");
        assert_ne!(reject["id"], accept["id"]);
    }

    #[test]
    fn test_note_escapes_and_formats_text() {
        let note = note(&urls(), "alice", &post("7", "alice", "a < b\nsecond line\n\nnext"));
        assert_eq!(
            note["content"],
            "<p>a &lt; b<br>second line</p><p>next</p>"
        );
        assert_eq!(note["attributedTo"], "https://bridge.example/users/alice");
        assert_eq!(note["published"], "2023-01-02T03:04:05Z");
        assert_eq!(note["cc"][0], "https://bridge.example/users/alice/followers");
    }

    #[test]
    fn test_retweets_render_original_text_and_media() {
        let mut original = post("2", "bob", "original");
        original.reference_kind = Some(ReferenceKind::Retweeted);
        original.media.push(Media {
            kind: "photo".to_string(),
            url: Some("https://pbs.example/1.jpg".to_string()),
            width: 10,
            height: 20,
        });
        let mut retweet = post("1", "alice", "RT @bob: origi…");
        retweet.references.push(original);

        let create = create_note(&urls(), "alice", &retweet);
        assert_eq!(create["type"], "Create");
        assert_eq!(
            create["id"],
            "https://bridge.example/users/alice/statuses/1/activity"
        );
        assert_eq!(create["object"]["content"], "<p>RT @bob: original</p>");
        assert_eq!(create["object"]["attachment"][0]["url"], "https://pbs.example/1.jpg");
    }

    #[test]
    fn test_quotes_link_the_quoted_post() {
        let mut quoted = post("2", "bob", "quoted");
        quoted.reference_kind = Some(ReferenceKind::Quoted);
        let mut quote = post("1", "alice", "look");
        quote.references.push(quoted);

        let note = note(&urls(), "alice", &quote);
        assert_eq!(
            note["content"],
            "<p>look</p><p>RE: <a href=\"https://twitter.com/bob/status/2\">https://twitter.com/bob/status/2</a></p>"
        );
    }

    #[test]
    fn test_collection() {
        let collection = ordered_collection("https://bridge.example/users/alice/followers", 12);
        assert_eq!(collection["type"], "OrderedCollection");
        assert_eq!(collection["totalItems"], 12);
    }
}
