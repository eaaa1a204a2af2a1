//! Database tests

use super::*;
use chrono::Utc;
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn user(username: &str, upstream_id: i64) -> LocalUser {
    LocalUser {
        username: username.to_string(),
        upstream_id,
        private_key_pem: "test_private_key".to_string(),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_user_create_and_get() {
    let (db, _temp_dir) = create_test_db().await;

    db.create_user(&user("alice", 1)).await.unwrap();

    let found = UserRepository::get(&db, "Alice").await.unwrap().unwrap();
    assert_eq!(found.username, "alice");
    assert_eq!(found.upstream_id, 1);

    let by_id = db.get_by_upstream_id(1).await.unwrap().unwrap();
    assert_eq!(by_id.username, "alice");

    assert!(UserRepository::get(&db, "bob").await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_user_keeps_first_keypair() {
    let (db, _temp_dir) = create_test_db().await;

    db.create_user(&user("alice", 1)).await.unwrap();
    let mut other = user("alice", 1);
    other.private_key_pem = "rotated".to_string();
    db.create_user(&other).await.unwrap();

    let found = UserRepository::get(&db, "alice").await.unwrap().unwrap();
    assert_eq!(found.private_key_pem, "test_private_key");
}

#[tokio::test]
async fn test_actor_create_refreshes_key() {
    let (db, _temp_dir) = create_test_db().await;

    let first = db.create("https://b.example/users/bob", "key-1").await.unwrap();
    let second = db.create("https://b.example/users/bob", "key-2").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.public_key_pem, "key-2");
    assert_eq!(second.inbox_url(), "https://b.example/users/bob/inbox");
}

#[tokio::test]
async fn test_follow_unfollow_is_idempotent() {
    let (db, _temp_dir) = create_test_db().await;

    let alice = user("alice", 1);
    db.create_user(&alice).await.unwrap();
    db.create_user(&user("carol", 2)).await.unwrap();
    let bob = db.create("https://b.example/users/bob", "key").await.unwrap();

    db.follow(&alice, &bob).await.unwrap();
    db.follow(&alice, &bob).await.unwrap();

    let followers = db.get_followers(&alice).await.unwrap();
    assert_eq!(followers.len(), 1);
    assert_eq!(followers[0].url, bob.url);

    let with_followers = db.get_with_followers().await.unwrap();
    assert_eq!(with_followers.len(), 1);
    assert_eq!(with_followers[0].username, "alice");

    db.unfollow(&alice, &bob).await.unwrap();
    db.unfollow(&alice, &bob).await.unwrap();

    assert!(db.get_followers(&alice).await.unwrap().is_empty());
    assert!(db.get_with_followers().await.unwrap().is_empty());
    // Actor rows survive unfollow
    assert!(ActorRepository::get(&db, &bob.url).await.unwrap().is_some());
}
