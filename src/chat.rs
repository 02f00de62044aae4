use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;
use tracing::info;

use crate::error::AccessError;
use crate::identity::Identity;

#[derive(FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    model: String,
    project_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(r: ConversationRow) -> Self {
        Self {
            id: r.id,
            title: r.title,
            model: r.model,
            project_id: r.project_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    model: String,
    token_count: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub model: String,
    pub token_count: i64,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(r: MessageRow) -> Self {
        Self {
            id: r.id,
            conversation_id: r.conversation_id,
            role: r.role,
            content: r.content,
            model: r.model,
            token_count: r.token_count,
            created_at: r.created_at,
        }
    }
}

/// Conversation storage with every read and mutation scoped to the owning
/// identity. Authenticated rows match on principal id, anonymous rows on
/// session token; there is no cross-tier visibility and no IP fallback for
/// legacy rows (an unowned row is invisible to everyone).
#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        identity: &Identity,
        client_ip: &str,
        title: &str,
        model: &str,
        project_id: Option<&str>,
    ) -> Result<Conversation, AccessError> {
        if let Some(project_id) = project_id {
            validate_id(project_id, "project")?;
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        // Exactly one ownership field is set, decided by the creating
        // identity; never transferred afterwards. client_ip is informational
        // only and plays no part in access decisions.
        sqlx::query(
            "INSERT INTO conversations
             (id, title, model, principal_id, session_token, project_id, client_ip, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(title)
        .bind(model)
        .bind(identity.principal_id())
        .bind(identity.session_token())
        .bind(project_id)
        .bind(client_ip)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!("Created conversation {}", id);
        Ok(Conversation {
            id,
            title: title.to_string(),
            model: model.to_string(),
            project_id: project_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn list(&self, identity: &Identity) -> Result<Vec<Conversation>, AccessError> {
        let (column, owner) = owner_match(identity);
        let sql = format!(
            "SELECT id, title, model, project_id, created_at, updated_at
             FROM conversations WHERE {} = ? ORDER BY updated_at DESC",
            column
        );
        let rows = sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    /// Project visibility follows conversation ownership: the caller can see
    /// a project iff it owns at least one conversation filed under it. An
    /// invisible project reads as not found.
    pub async fn check_project_access(
        &self,
        identity: &Identity,
        project_id: &str,
    ) -> Result<(), AccessError> {
        validate_id(project_id, "project")?;
        let (column, owner) = owner_match(identity);
        let sql = format!(
            "SELECT COUNT(*) FROM conversations WHERE project_id = ? AND {} = ?",
            column
        );
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(project_id)
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;

        if count == 0 {
            return Err(AccessError::NotFound("Project".to_string()));
        }
        Ok(())
    }

    pub async fn list_by_project(
        &self,
        identity: &Identity,
        project_id: &str,
    ) -> Result<Vec<Conversation>, AccessError> {
        self.check_project_access(identity, project_id).await?;
        let (column, owner) = owner_match(identity);
        let sql = format!(
            "SELECT id, title, model, project_id, created_at, updated_at
             FROM conversations WHERE project_id = ? AND {} = ? ORDER BY updated_at DESC",
            column
        );
        let rows = sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(project_id)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    /// Ownership-checked fetch. A conversation the caller does not own is
    /// indistinguishable from one that does not exist.
    pub async fn get(
        &self,
        identity: &Identity,
        conversation_id: &str,
    ) -> Result<Conversation, AccessError> {
        validate_id(conversation_id, "conversation")?;
        let (column, owner) = owner_match(identity);
        let sql = format!(
            "SELECT id, title, model, project_id, created_at, updated_at
             FROM conversations WHERE id = ? AND {} = ?",
            column
        );
        let row = sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(conversation_id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Conversation::from)
            .ok_or_else(|| AccessError::NotFound("Conversation".to_string()))
    }

    pub async fn delete(
        &self,
        identity: &Identity,
        conversation_id: &str,
    ) -> Result<(), AccessError> {
        // Scoped fetch doubles as the access check.
        self.get(identity, conversation_id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Deleted conversation {}", conversation_id);
        Ok(())
    }

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, AccessError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, conversation_id, role, content, model, token_count, created_at
             FROM messages WHERE conversation_id = ? ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        model: &str,
        token_count: i64,
    ) -> Result<Message, AccessError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, model, token_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(model)
        .bind(token_count)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            model: model.to_string(),
            token_count,
            created_at: now,
        })
    }
}

/// Owner column and value for scoping queries to the identity's tier.
pub(crate) fn owner_match(identity: &Identity) -> (&'static str, &str) {
    match identity {
        Identity::Authenticated { principal_id } => ("principal_id", principal_id.as_str()),
        Identity::Anonymous { session_token } => ("session_token", session_token.as_str()),
    }
}

pub(crate) fn validate_id(id: &str, what: &str) -> Result<(), AccessError> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| AccessError::Validation(format!("Invalid {} ID format", what)))
}
