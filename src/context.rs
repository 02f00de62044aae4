use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;
use tracing::info;

use crate::chat::{owner_match, validate_id};
use crate::error::AccessError;
use crate::identity::Identity;

#[derive(FromRow)]
struct ContextItemRow {
    id: String,
    name: String,
    description: Option<String>,
    content_type: String,
    content_text: String,
    source: Option<String>,
    token_count: i64,
    usage_count: i64,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// A reusable piece of context (pasted text, extracted document, fetched
/// URL) a caller can pin to conversations.
#[derive(Debug, Clone, Serialize)]
pub struct ContextItem {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub content_type: String,
    pub content_text: String,
    pub source: Option<String>,
    pub token_count: i64,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ContextItemRow> for ContextItem {
    fn from(r: ContextItemRow) -> Self {
        Self {
            id: r.id,
            name: r.name,
            description: r.description,
            content_type: r.content_type,
            content_text: r.content_text,
            source: r.source,
            token_count: r.token_count,
            usage_count: r.usage_count,
            last_used_at: r.last_used_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(FromRow)]
struct AttachedContextRow {
    item_id: String,
    name: String,
    description: Option<String>,
    content_type: String,
    content_text: String,
    token_count: i64,
    relevance_score: f64,
    added_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
}

/// A context item as attached to one conversation.
#[derive(Debug, Clone, Serialize)]
pub struct AttachedContext {
    pub item_id: String,
    pub name: String,
    pub description: Option<String>,
    pub content_type: String,
    pub content_text: String,
    pub token_count: i64,
    pub relevance_score: f64,
    pub added_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl From<AttachedContextRow> for AttachedContext {
    fn from(r: AttachedContextRow) -> Self {
        Self {
            item_id: r.item_id,
            name: r.name,
            description: r.description,
            content_type: r.content_type,
            content_text: r.content_text,
            token_count: r.token_count,
            relevance_score: r.relevance_score,
            added_at: r.added_at,
            last_accessed_at: r.last_accessed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub total_items: i64,
    pub total_tokens: i64,
    pub most_used: Option<MostUsedItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MostUsedItem {
    pub id: String,
    pub name: String,
    pub usage_count: i64,
}

/// Context-item storage with the same strict identity scoping as
/// conversations: authenticated rows match on principal id, anonymous rows
/// on session token, and an unowned or soft-deleted item reads as not found.
#[derive(Clone)]
pub struct ContextStore {
    pool: SqlitePool,
}

const ITEM_COLUMNS: &str = "id, name, description, content_type, content_text, source, \
     token_count, usage_count, last_used_at, created_at, updated_at";

impl ContextStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        identity: &Identity,
        name: &str,
        description: Option<&str>,
        content_type: &str,
        content_text: &str,
        source: Option<&str>,
    ) -> Result<ContextItem, AccessError> {
        if name.trim().is_empty() {
            return Err(AccessError::Validation("Name is required".to_string()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let token_count = estimate_tokens(content_text);

        sqlx::query(
            "INSERT INTO context_items
             (id, name, description, content_type, content_text, source, token_count,
              usage_count, principal_id, session_token, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(description)
        .bind(content_type)
        .bind(content_text)
        .bind(source)
        .bind(token_count)
        .bind(identity.principal_id())
        .bind(identity.session_token())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!("Created context item {}", id);
        Ok(ContextItem {
            id,
            name: name.to_string(),
            description: description.map(str::to_string),
            content_type: content_type.to_string(),
            content_text: content_text.to_string(),
            source: source.map(str::to_string),
            token_count,
            usage_count: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Active items only, never-used first, then most recently used.
    pub async fn list(&self, identity: &Identity) -> Result<Vec<ContextItem>, AccessError> {
        let (column, owner) = owner_match(identity);
        let sql = format!(
            "SELECT {} FROM context_items WHERE {} = ? AND is_active = 1
             ORDER BY (last_used_at IS NOT NULL) ASC, last_used_at DESC, created_at DESC",
            ITEM_COLUMNS, column
        );
        let rows = sqlx::query_as::<_, ContextItemRow>(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ContextItem::from).collect())
    }

    pub async fn get(
        &self,
        identity: &Identity,
        item_id: &str,
    ) -> Result<ContextItem, AccessError> {
        validate_id(item_id, "context item")?;
        let (column, owner) = owner_match(identity);
        let sql = format!(
            "SELECT {} FROM context_items WHERE id = ? AND {} = ? AND is_active = 1",
            ITEM_COLUMNS, column
        );
        let row = sqlx::query_as::<_, ContextItemRow>(&sql)
            .bind(item_id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ContextItem::from)
            .ok_or_else(|| AccessError::NotFound("Context item".to_string()))
    }

    pub async fn update(
        &self,
        identity: &Identity,
        item_id: &str,
        name: Option<&str>,
        description: Option<&str>,
        content_text: Option<&str>,
    ) -> Result<ContextItem, AccessError> {
        let mut item = self.get(identity, item_id).await?;
        let now = Utc::now();

        if let Some(name) = name {
            item.name = name.to_string();
        }
        if let Some(description) = description {
            item.description = Some(description.to_string());
        }
        if let Some(content_text) = content_text {
            item.content_text = content_text.to_string();
            item.token_count = estimate_tokens(content_text);
        }

        sqlx::query(
            "UPDATE context_items
             SET name = ?, description = ?, content_text = ?, token_count = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&item.name)
        .bind(&item.description)
        .bind(&item.content_text)
        .bind(item.token_count)
        .bind(now)
        .bind(item_id)
        .execute(&self.pool)
        .await?;

        item.updated_at = now;
        Ok(item)
    }

    /// Soft delete; the row and its usage history stay behind.
    pub async fn delete(&self, identity: &Identity, item_id: &str) -> Result<(), AccessError> {
        self.get(identity, item_id).await?;
        sqlx::query("UPDATE context_items SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        info!("Deactivated context item {}", item_id);
        Ok(())
    }

    /// Attaches an owned item to a conversation. Re-attaching an already
    /// linked item updates its relevance score instead of duplicating the
    /// link. The caller is expected to have checked conversation ownership.
    pub async fn attach(
        &self,
        identity: &Identity,
        conversation_id: &str,
        item_id: &str,
        relevance_score: f64,
    ) -> Result<(), AccessError> {
        self.get(identity, item_id).await?;
        let now = Utc::now();

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM context_links
             WHERE conversation_id = ? AND context_item_id = ? AND is_active = 1",
        )
        .bind(conversation_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((link_id,)) = existing {
            sqlx::query(
                "UPDATE context_links SET relevance_score = ?, last_accessed_at = ? WHERE id = ?",
            )
            .bind(relevance_score)
            .bind(now)
            .bind(link_id)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO context_links
             (id, conversation_id, context_item_id, relevance_score, is_active, added_at, last_accessed_at)
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(conversation_id)
        .bind(item_id)
        .bind(relevance_score)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE context_items SET usage_count = usage_count + 1, last_used_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("Attached context {} to conversation {}", item_id, conversation_id);
        Ok(())
    }

    pub async fn detach(
        &self,
        conversation_id: &str,
        item_id: &str,
    ) -> Result<(), AccessError> {
        let result = sqlx::query(
            "UPDATE context_links SET is_active = 0
             WHERE conversation_id = ? AND context_item_id = ? AND is_active = 1",
        )
        .bind(conversation_id)
        .bind(item_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccessError::NotFound("Context attachment".to_string()));
        }
        Ok(())
    }

    /// Active context for a conversation, most relevant first. Items that
    /// were soft-deleted after attachment drop out.
    pub async fn conversation_context(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<AttachedContext>, AccessError> {
        let rows = sqlx::query_as::<_, AttachedContextRow>(
            "SELECT i.id AS item_id, i.name, i.description, i.content_type, i.content_text,
                    i.token_count, l.relevance_score, l.added_at, l.last_accessed_at
             FROM context_links l
             JOIN context_items i ON i.id = l.context_item_id
             WHERE l.conversation_id = ? AND l.is_active = 1 AND i.is_active = 1
             ORDER BY l.relevance_score DESC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AttachedContext::from).collect())
    }

    /// One analytics row per context item fed into a model call.
    pub async fn log_usage(
        &self,
        conversation_id: &str,
        message_id: &str,
        item_id: &str,
        usage_type: &str,
        tokens_consumed: i64,
    ) -> Result<(), AccessError> {
        sqlx::query(
            "INSERT INTO context_usage_log
             (id, conversation_id, message_id, context_item_id, usage_type, tokens_consumed, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(conversation_id)
        .bind(message_id)
        .bind(item_id)
        .bind(usage_type)
        .bind(tokens_consumed)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stats(&self, identity: &Identity) -> Result<ContextStats, AccessError> {
        let (column, owner) = owner_match(identity);

        let sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(token_count), 0)
             FROM context_items WHERE {} = ? AND is_active = 1",
            column
        );
        let (total_items, total_tokens): (i64, i64) = sqlx::query_as(&sql)
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "SELECT id, name, usage_count FROM context_items
             WHERE {} = ? AND is_active = 1 AND usage_count > 0
             ORDER BY usage_count DESC LIMIT 1",
            column
        );
        let most_used: Option<(String, String, i64)> = sqlx::query_as(&sql)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;

        Ok(ContextStats {
            total_items,
            total_tokens,
            most_used: most_used.map(|(id, name, usage_count)| MostUsedItem {
                id,
                name,
                usage_count,
            }),
        })
    }
}

/// Rough token estimate: word count times 1.3.
fn estimate_tokens(content: &str) -> i64 {
    (content.split_whitespace().count() as f64 * 1.3) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_scales_with_words() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one two three four"), 5);
        assert!(estimate_tokens("a") < estimate_tokens("a b c d e f g h"));
    }
}
