use banter::db::{cleanup_orphaned_messages, init_db, DbPool};
use banter::sessions::*;
use banter::types::{ChatSession, Profile};

async fn test_pool(dir: &tempfile::TempDir) -> DbPool {
    let path = dir.path().join("test.db");
    match init_db(&path).await {
        Ok(pool) => pool,
        Err(e) => panic!("init_db failed: {}", e),
    }
}

fn session(id: &str, last_updated: Option<i64>) -> ChatSession {
    ChatSession {
        id: id.to_string(),
        name: Some(format!("Session {}", id)),
        last_updated,
        session_summary: None,
    }
}

#[tokio::test]
async fn insert_and_fetch_round_trip() {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir failed: {}", e),
    };
    let pool = test_pool(&dir).await;

    let s = session("s1", Some(100));
    insert_session(&pool, &s).await.expect("insert");
    let fetched = fetch_session(&pool, "s1").await.expect("fetch");
    assert_eq!(fetched, Some(s));
    assert_eq!(fetch_session(&pool, "missing").await.expect("fetch"), None);
}

#[tokio::test]
async fn listing_orders_by_recency() {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir failed: {}", e),
    };
    let pool = test_pool(&dir).await;

    insert_session(&pool, &session("old", Some(100))).await.expect("insert");
    insert_session(&pool, &session("new", Some(300))).await.expect("insert");
    insert_session(&pool, &session("mid", Some(200))).await.expect("insert");

    let ids: Vec<String> = list_session_rows(&pool)
        .await
        .expect("list")
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec!["new", "mid", "old"]);
}

#[tokio::test]
async fn guarded_update_refuses_stale_writes() {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir failed: {}", e),
    };
    let pool = test_pool(&dir).await;

    insert_session(&pool, &session("s1", Some(100))).await.expect("insert");

    // A write carrying an older timestamp than the stored row must lose.
    let mut stale = session("s1", Some(50));
    stale.name = Some("Stale".to_string());
    assert!(!persist_reconciled(&pool, &stale).await.expect("update"));

    let mut newer = session("s1", Some(200));
    newer.name = Some("Newer".to_string());
    assert!(persist_reconciled(&pool, &newer).await.expect("update"));

    let stored = fetch_session(&pool, "s1").await.expect("fetch");
    match stored {
        Some(s) => {
            assert_eq!(s.name.as_deref(), Some("Newer"));
            assert_eq!(s.last_updated, Some(200));
        }
        None => panic!("session vanished"),
    }
}

#[tokio::test]
async fn messages_persist_in_order_and_count_assistant_turns() {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir failed: {}", e),
    };
    let pool = test_pool(&dir).await;
    insert_session(&pool, &session("s1", Some(1))).await.expect("insert");

    insert_message(&pool, "s1", "hi", true, None, false).await.expect("msg");
    insert_message(&pool, "s1", "hello!", false, None, false).await.expect("msg");
    insert_message(&pool, "s1", "and?", true, None, false).await.expect("msg");
    insert_message(&pool, "s1", "more", false, Some("https://cdn.example/a.png"), true)
        .await
        .expect("msg");

    let messages = list_messages(&pool, "s1").await.expect("list");
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].content, "hi");
    assert!(messages[0].is_user);
    assert!(messages[0].id.is_some());
    assert_eq!(
        messages[3].image_url.as_deref(),
        Some("https://cdn.example/a.png")
    );

    assert_eq!(count_assistant_turns(&pool, "s1").await.expect("count"), 2);
}

#[tokio::test]
async fn deleting_a_session_removes_its_messages() {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir failed: {}", e),
    };
    let pool = test_pool(&dir).await;
    insert_session(&pool, &session("s1", Some(1))).await.expect("insert");
    insert_message(&pool, "s1", "hi", true, None, false).await.expect("msg");

    let deleted = delete_session_row(&pool, "s1").await.expect("delete");
    assert!(deleted.is_some());
    assert!(list_messages(&pool, "s1").await.expect("list").is_empty());
    assert!(delete_session_row(&pool, "s1").await.expect("delete").is_none());
}

#[tokio::test]
async fn startup_cleanup_sweeps_orphaned_messages() {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir failed: {}", e),
    };
    let pool = test_pool(&dir).await;
    insert_session(&pool, &session("kept", Some(1))).await.expect("insert");
    insert_message(&pool, "kept", "hi", true, None, false).await.expect("msg");
    insert_message(&pool, "ghost", "orphan", true, None, false).await.expect("msg");

    let removed = cleanup_orphaned_messages(&pool).await.expect("cleanup");
    assert_eq!(removed, 1);
    assert_eq!(list_messages(&pool, "kept").await.expect("list").len(), 1);
}

#[tokio::test]
async fn profile_upsert_overwrites() {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir failed: {}", e),
    };
    let pool = test_pool(&dir).await;

    let mut profile = Profile {
        id: "u1".to_string(),
        display_name: Some("Ada".to_string()),
        avatar_url: None,
    };
    upsert_profile(&pool, &profile).await.expect("upsert");
    profile.display_name = Some("Ada L.".to_string());
    upsert_profile(&pool, &profile).await.expect("upsert");

    let fetched = fetch_profile(&pool, "u1").await.expect("fetch");
    match fetched {
        Some(p) => assert_eq!(p.display_name.as_deref(), Some("Ada L.")),
        None => panic!("profile missing"),
    }
}
