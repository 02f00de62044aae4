use tollgate::chat::ConversationStore;
use tollgate::context::ContextStore;
use tollgate::error::AccessError;
use tollgate::identity::{Identity, principal_for_ip};

async fn setup() -> (ContextStore, ConversationStore) {
    let pool = tollgate::store::connect_in_memory().await.unwrap();
    (
        ContextStore::new(pool.clone()),
        ConversationStore::new(pool),
    )
}

fn anon(token: &str) -> Identity {
    Identity::Anonymous {
        session_token: token.to_string(),
    }
}

#[tokio::test]
async fn context_items_are_identity_scoped() {
    let (store, _) = setup().await;
    let a = anon("session-a");
    let b = anon("session-b");
    let auth = Identity::Authenticated {
        principal_id: principal_for_ip("203.0.113.7"),
    };

    let item = store
        .create(&a, "style guide", None, "text", "always use oxford commas", None)
        .await
        .unwrap();

    assert_eq!(store.list(&a).await.unwrap().len(), 1);
    assert!(store.list(&b).await.unwrap().is_empty());
    assert!(store.list(&auth).await.unwrap().is_empty());

    // Someone else's item reads as not found, across sessions and tiers.
    assert!(matches!(
        store.get(&b, &item.id).await,
        Err(AccessError::NotFound(_))
    ));
    assert!(matches!(
        store.get(&auth, &item.id).await,
        Err(AccessError::NotFound(_))
    ));
    assert!(matches!(
        store.delete(&b, &item.id).await,
        Err(AccessError::NotFound(_))
    ));
    assert!(store.get(&a, &item.id).await.is_ok());
}

#[tokio::test]
async fn delete_is_soft_and_hides_the_item_everywhere() {
    let (store, conversations) = setup().await;
    let a = anon("session-a");

    let conv = conversations
        .create(&a, "203.0.113.7", "hello", "gpt-4", None)
        .await
        .unwrap();
    let item = store
        .create(&a, "notes", None, "text", "some notes", None)
        .await
        .unwrap();
    store.attach(&a, &conv.id, &item.id, 1.0).await.unwrap();

    store.delete(&a, &item.id).await.unwrap();

    assert!(matches!(
        store.get(&a, &item.id).await,
        Err(AccessError::NotFound(_))
    ));
    assert!(store.list(&a).await.unwrap().is_empty());
    // The link survives but the deactivated item no longer surfaces.
    assert!(store.conversation_context(&conv.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn attach_bumps_usage_and_is_idempotent_per_conversation() {
    let (store, conversations) = setup().await;
    let a = anon("session-a");

    let conv = conversations
        .create(&a, "203.0.113.7", "hello", "gpt-4", None)
        .await
        .unwrap();
    let item = store
        .create(&a, "spec", None, "text", "the spec text", None)
        .await
        .unwrap();
    assert_eq!(item.usage_count, 0);
    assert!(item.last_used_at.is_none());

    store.attach(&a, &conv.id, &item.id, 0.4).await.unwrap();
    let item = store.get(&a, &item.id).await.unwrap();
    assert_eq!(item.usage_count, 1);
    assert!(item.last_used_at.is_some());

    // Re-attaching updates the relevance score, not the usage count.
    store.attach(&a, &conv.id, &item.id, 0.9).await.unwrap();
    let item = store.get(&a, &item.id).await.unwrap();
    assert_eq!(item.usage_count, 1);

    let attached = store.conversation_context(&conv.id).await.unwrap();
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].relevance_score, 0.9);
}

#[tokio::test]
async fn conversation_context_orders_by_relevance() {
    let (store, conversations) = setup().await;
    let a = anon("session-a");

    let conv = conversations
        .create(&a, "203.0.113.7", "hello", "gpt-4", None)
        .await
        .unwrap();
    let low = store
        .create(&a, "background", None, "text", "low priority", None)
        .await
        .unwrap();
    let high = store
        .create(&a, "key facts", None, "text", "high priority", None)
        .await
        .unwrap();

    store.attach(&a, &conv.id, &low.id, 0.2).await.unwrap();
    store.attach(&a, &conv.id, &high.id, 0.8).await.unwrap();

    let attached = store.conversation_context(&conv.id).await.unwrap();
    assert_eq!(attached.len(), 2);
    assert_eq!(attached[0].item_id, high.id);
    assert_eq!(attached[1].item_id, low.id);
}

#[tokio::test]
async fn detach_soft_deletes_the_link() {
    let (store, conversations) = setup().await;
    let a = anon("session-a");

    let conv = conversations
        .create(&a, "203.0.113.7", "hello", "gpt-4", None)
        .await
        .unwrap();
    let item = store
        .create(&a, "notes", None, "text", "some notes", None)
        .await
        .unwrap();
    store.attach(&a, &conv.id, &item.id, 1.0).await.unwrap();

    store.detach(&conv.id, &item.id).await.unwrap();
    assert!(store.conversation_context(&conv.id).await.unwrap().is_empty());

    // The item itself is untouched; only the link went away.
    assert!(store.get(&a, &item.id).await.is_ok());
    assert!(matches!(
        store.detach(&conv.id, &item.id).await,
        Err(AccessError::NotFound(_))
    ));
}

#[tokio::test]
async fn update_reestimates_tokens_for_new_content() {
    let (store, _) = setup().await;
    let a = anon("session-a");

    let item = store
        .create(&a, "notes", None, "text", "short", None)
        .await
        .unwrap();
    let before = item.token_count;

    let updated = store
        .update(
            &a,
            &item.id,
            Some("renamed"),
            Some("now described"),
            Some("a much longer body of content with many more words in it"),
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "renamed");
    assert_eq!(updated.description.as_deref(), Some("now described"));
    assert!(updated.token_count > before);

    // Fields left out of the update are preserved.
    let fetched = store.get(&a, &item.id).await.unwrap();
    assert_eq!(fetched.name, "renamed");
    assert_eq!(fetched.content_type, "text");
}

#[tokio::test]
async fn stats_summarize_active_items_only() {
    let (store, conversations) = setup().await;
    let a = anon("session-a");

    let stats = store.stats(&a).await.unwrap();
    assert_eq!(stats.total_items, 0);
    assert!(stats.most_used.is_none());

    let kept = store
        .create(&a, "kept", None, "text", "one two three", None)
        .await
        .unwrap();
    let dropped = store
        .create(&a, "dropped", None, "text", "four five six", None)
        .await
        .unwrap();

    let conv = conversations
        .create(&a, "203.0.113.7", "hello", "gpt-4", None)
        .await
        .unwrap();
    store.attach(&a, &conv.id, &kept.id, 1.0).await.unwrap();
    store.delete(&a, &dropped.id).await.unwrap();

    let stats = store.stats(&a).await.unwrap();
    assert_eq!(stats.total_items, 1);
    assert_eq!(stats.total_tokens, kept.token_count);
    let most_used = stats.most_used.unwrap();
    assert_eq!(most_used.id, kept.id);
    assert_eq!(most_used.usage_count, 1);
}

#[tokio::test]
async fn malformed_item_id_is_rejected() {
    let (store, _) = setup().await;
    assert!(matches!(
        store.get(&anon("s"), "not-a-uuid").await,
        Err(AccessError::Validation(_))
    ));
}
