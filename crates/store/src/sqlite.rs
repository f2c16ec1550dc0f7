//! SQLite persistence backend.
//!
//! A single database file holds every canonical table. Identifiers are
//! stored as hyphenated UUID text, timestamps as RFC 3339 text, and JSON
//! columns (diagram cells, entity payloads, webhook events) as serialized
//! strings. Single statements rely on SQLite's per-statement atomicity;
//! multi-statement mutations run inside an explicit transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use tmhub_core::access::{effective_role, AccessGrant, Group, SubjectType, ADMINISTRATORS_GROUP, EVERYONE_GROUP, WILDCARD_PROVIDER};
use tmhub_core::addon::Addon;
use tmhub_core::error::{AuthzError, Error, StoreError};
use tmhub_core::model::{Cell, Diagram, EntityKind, SubEntity, ThreatModel};
use tmhub_core::principal::{Principal, Role};
use tmhub_core::quota::QuotaRecord;
use tmhub_core::store::{Mutation, Store};
use tmhub_core::webhook::{default_deny_seed, DeliveryRecord, SubscriptionStatus, UrlDenyEntry, WebhookSubscription};

/// Canonical persistence on SQLite.
pub struct SqliteStore {
    pool: SqlitePool,
}

fn storage(e: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn migration(step: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::MigrationFailed(format!("{step}: {e}"))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Storage(format!("Bad UUID '{s}': {e}")))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Storage(format!("Bad timestamp '{s}': {e}")))
}

impl SqliteStore {
    /// Open (or create) the database at `path` and install the schema.
    ///
    /// Pass `":memory:"` for an in-process ephemeral database (useful for
    /// tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // In-memory databases are per-connection; more than one pooled
        // connection would see different (empty) schemas.
        let max_connections = if path == ":memory:" { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Install the schema and run the bootstrap data migrations.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        for (step, ddl) in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| migration(step, e))?;
        }

        // Memberships predate the uniqueness constraint in older databases;
        // duplicates must go before the index can be installed.
        sqlx::query(
            r#"
            DELETE FROM group_memberships
            WHERE rowid NOT IN (
                SELECT MIN(rowid) FROM group_memberships
                GROUP BY group_id, user_id, subject_type
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| migration("membership dedup", e))?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ux_group_memberships
            ON group_memberships (group_id, user_id, subject_type)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| migration("membership index", e))?;

        self.collapse_legacy_administrators().await?;
        self.seed_builtin_groups().await?;
        Ok(())
    }

    /// Fold a legacy `administrators` table (user rows) into memberships of
    /// the built-in Administrators group, then drop the table.
    async fn collapse_legacy_administrators(&self) -> Result<(), StoreError> {
        let legacy: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'administrators'",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| migration("legacy admin probe", e))?;

        if legacy.is_none() {
            return Ok(());
        }

        let admins = self.ensure_group(WILDCARD_PROVIDER, ADMINISTRATORS_GROUP).await?;

        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO group_memberships (group_id, user_id, subject_type)
            SELECT ?1, user_id, 'user' FROM administrators
            "#,
        )
        .bind(admins.id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| migration("legacy admin collapse", e))?;

        sqlx::query("DROP TABLE administrators")
            .execute(&mut *tx)
            .await
            .map_err(|e| migration("legacy admin drop", e))?;
        tx.commit().await.map_err(storage)?;

        info!("Collapsed legacy administrators table into group memberships");
        Ok(())
    }

    /// Install the reserved `Everyone` and `Administrators` groups.
    async fn seed_builtin_groups(&self) -> Result<(), StoreError> {
        self.ensure_group(WILDCARD_PROVIDER, EVERYONE_GROUP).await?;
        self.ensure_group(WILDCARD_PROVIDER, ADMINISTRATORS_GROUP).await?;
        Ok(())
    }

    /// Install the default SSRF deny seed. Idempotent; existing patterns
    /// are left untouched.
    pub async fn seed_deny_list(&self) -> Result<usize, StoreError> {
        let mut installed = 0;
        for entry in default_deny_seed() {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO deny_list (pattern, pattern_type, description)
                VALUES (?1, ?2, ?3)
                "#,
            )
            .bind(&entry.pattern)
            .bind(entry.pattern_type.as_str())
            .bind(&entry.description)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            installed += result.rows_affected() as usize;
        }
        debug!(installed, "Deny list seeded");
        Ok(installed)
    }

    fn row_to_threat_model(row: &sqlx::sqlite::SqliteRow) -> Result<ThreatModel, StoreError> {
        Ok(ThreatModel {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            owner: parse_uuid(&row.get::<String, _>("owner"))?,
            owner_email: row.get("owner_email"),
            name: row.get("name"),
            description: row.get("description"),
            framework: row.get("framework"),
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            modified_at: parse_ts(&row.get::<String, _>("modified_at"))?,
        })
    }

    fn row_to_diagram(row: &sqlx::sqlite::SqliteRow) -> Result<Diagram, StoreError> {
        let cells: BTreeMap<String, Cell> =
            serde_json::from_str(&row.get::<String, _>("cells"))
                .map_err(|e| StoreError::Storage(format!("Bad cell JSON: {e}")))?;
        Ok(Diagram {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            threat_model_id: parse_uuid(&row.get::<String, _>("threat_model_id"))?,
            name: row.get("name"),
            diagram_type: row.get("diagram_type"),
            cells,
            update_vector: row.get::<i64, _>("update_vector") as u64,
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            modified_at: parse_ts(&row.get::<String, _>("modified_at"))?,
        })
    }

    fn row_to_webhook(row: &sqlx::sqlite::SqliteRow) -> Result<WebhookSubscription, StoreError> {
        let events: Vec<String> = serde_json::from_str(&row.get::<String, _>("events"))
            .map_err(|e| StoreError::Storage(format!("Bad events JSON: {e}")))?;
        let status = SubscriptionStatus::parse(&row.get::<String, _>("status"))
            .ok_or_else(|| StoreError::Storage("Bad subscription status".into()))?;
        Ok(WebhookSubscription {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            owner: parse_uuid(&row.get::<String, _>("owner"))?,
            url: row.get("url"),
            events,
            secret: row.get("secret"),
            status,
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        })
    }

    fn row_to_addon(row: &sqlx::sqlite::SqliteRow) -> Result<Addon, StoreError> {
        let object_types: Vec<String> = serde_json::from_str(&row.get::<String, _>("object_types"))
            .map_err(|e| StoreError::Storage(format!("Bad object_types JSON: {e}")))?;
        let scope: Option<String> = row.get("threat_model_scope");
        Ok(Addon {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            name: row.get("name"),
            webhook_id: parse_uuid(&row.get::<String, _>("webhook_id"))?,
            description: row.get("description"),
            icon: row.get("icon"),
            object_types,
            threat_model_scope: scope.map(|s| parse_uuid(&s)).transpose()?,
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        })
    }

    fn row_to_grant(threat_model_id: Uuid, row: &sqlx::sqlite::SqliteRow) -> Result<AccessGrant, StoreError> {
        let subject_type = SubjectType::parse(&row.get::<String, _>("subject_type"))
            .ok_or_else(|| StoreError::Storage("Bad subject type".into()))?;
        let role = Role::parse(&row.get::<String, _>("role"))
            .ok_or_else(|| StoreError::Storage("Bad role".into()))?;
        let idp: String = row.get("idp");
        Ok(AccessGrant {
            threat_model_id,
            subject: row.get("subject"),
            subject_type,
            idp: if idp.is_empty() { None } else { Some(idp) },
            role,
        })
    }

    /// The authorization re-check of [`Store::mutate_checked`]: reload
    /// the threat model and its grants under the caller's transaction
    /// and evaluate the principal's effective role. A grant revoked by a
    /// concurrent request is seen here, not at some earlier dispatch
    /// check.
    async fn check_access_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        principal: &Principal,
        threat_model_id: Uuid,
        required: Role,
    ) -> Result<(), Error> {
        if principal.is_administrator {
            return Ok(());
        }

        let row = sqlx::query("SELECT * FROM threat_models WHERE id = ?1")
            .bind(threat_model_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(storage)?;
        let Some(row) = row else {
            return Err(AuthzError::NotFound.into());
        };
        let model = Self::row_to_threat_model(&row)?;

        let rows = sqlx::query("SELECT * FROM grants WHERE threat_model_id = ?1")
            .bind(threat_model_id.to_string())
            .fetch_all(&mut **tx)
            .await
            .map_err(storage)?;
        let grants = rows
            .iter()
            .map(|r| Self::row_to_grant(threat_model_id, r))
            .collect::<Result<Vec<_>, _>>()?;

        match effective_role(principal, &model, &grants) {
            Some(role) if role >= required => Ok(()),
            Some(_) => Err(AuthzError::Forbidden.into()),
            None => Err(AuthzError::NotFound.into()),
        }
    }

    /// Ownership re-check for webhook writes, run under the caller's
    /// transaction. Non-owners see the row as missing.
    async fn check_webhook_owner_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        principal: &Principal,
        id: Uuid,
    ) -> Result<(), Error> {
        let owner: Option<String> = sqlx::query_scalar("SELECT owner FROM webhooks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(storage)?;
        let Some(owner) = owner else {
            return Err(AuthzError::NotFound.into());
        };
        if !principal.is_administrator && owner != principal.internal_uuid.to_string() {
            return Err(AuthzError::NotFound.into());
        }
        Ok(())
    }

    async fn insert_entity_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        threat_model_id: Uuid,
        entity: &SubEntity,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO entities (id, threat_model_id, kind, data, created_at, modified_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(entity.id.to_string())
        .bind(threat_model_id.to_string())
        .bind(entity.kind.as_str())
        .bind(entity.data.to_string())
        .bind(entity.created_at.to_rfc3339())
        .bind(entity.modified_at.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(storage)?;
        Ok(())
    }

    /// Apply one [`Mutation`] on an open transaction. Entity and diagram
    /// statements are scoped to `threat_model_id` in SQL so a checked
    /// call can never touch another model's rows.
    async fn apply_mutation_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        threat_model_id: Uuid,
        mutation: Mutation,
    ) -> Result<(), StoreError> {
        let tm = threat_model_id.to_string();
        match mutation {
            Mutation::UpdateThreatModel(model) => {
                let result = sqlx::query(
                    r#"
                    UPDATE threat_models
                    SET name = ?2, description = ?3, framework = ?4, modified_at = ?5
                    WHERE id = ?1
                    "#,
                )
                .bind(&tm)
                .bind(&model.name)
                .bind(&model.description)
                .bind(&model.framework)
                .bind(Utc::now().to_rfc3339())
                .execute(&mut **tx)
                .await
                .map_err(storage)?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound);
                }
            }
            Mutation::DeleteThreatModel => {
                for table in ["grants", "diagrams", "entities", "metadata"] {
                    sqlx::query(&format!("DELETE FROM {table} WHERE threat_model_id = ?1"))
                        .bind(&tm)
                        .execute(&mut **tx)
                        .await
                        .map_err(storage)?;
                }
                let result = sqlx::query("DELETE FROM threat_models WHERE id = ?1")
                    .bind(&tm)
                    .execute(&mut **tx)
                    .await
                    .map_err(storage)?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound);
                }
            }
            Mutation::PutGrant(grant) => {
                sqlx::query(
                    r#"
                    INSERT INTO grants (threat_model_id, subject, subject_type, idp, role)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT (threat_model_id, subject, subject_type, idp)
                    DO UPDATE SET role = excluded.role
                    "#,
                )
                .bind(&tm)
                .bind(&grant.subject)
                .bind(grant.subject_type.as_str())
                .bind(grant.idp.as_deref().unwrap_or(""))
                .bind(grant.role.as_str())
                .execute(&mut **tx)
                .await
                .map_err(storage)?;
            }
            Mutation::DeleteGrant { subject, subject_type, idp } => {
                sqlx::query(
                    r#"
                    DELETE FROM grants
                    WHERE threat_model_id = ?1 AND subject = ?2 AND subject_type = ?3 AND idp = ?4
                    "#,
                )
                .bind(&tm)
                .bind(&subject)
                .bind(subject_type.as_str())
                .bind(idp.as_deref().unwrap_or(""))
                .execute(&mut **tx)
                .await
                .map_err(storage)?;
            }
            Mutation::CreateDiagram(diagram) => {
                sqlx::query(
                    r#"
                    INSERT INTO diagrams (id, threat_model_id, name, diagram_type, cells, update_vector, created_at, modified_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                )
                .bind(diagram.id.to_string())
                .bind(&tm)
                .bind(&diagram.name)
                .bind(&diagram.diagram_type)
                .bind(serde_json::to_string(&diagram.cells).map_err(|e| StoreError::Storage(e.to_string()))?)
                .bind(diagram.update_vector as i64)
                .bind(diagram.created_at.to_rfc3339())
                .bind(diagram.modified_at.to_rfc3339())
                .execute(&mut **tx)
                .await
                .map_err(storage)?;
            }
            Mutation::DeleteDiagram(diagram_id) => {
                let result = sqlx::query("DELETE FROM diagrams WHERE id = ?1 AND threat_model_id = ?2")
                    .bind(diagram_id.to_string())
                    .bind(&tm)
                    .execute(&mut **tx)
                    .await
                    .map_err(storage)?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound);
                }
            }
            Mutation::CreateEntities(entities) => {
                for entity in &entities {
                    Self::insert_entity_tx(tx, threat_model_id, entity).await?;
                }
            }
            Mutation::UpdateEntities(entities) => {
                for entity in &entities {
                    let result = sqlx::query(
                        r#"
                        UPDATE entities SET data = ?3, modified_at = ?4
                        WHERE id = ?1 AND threat_model_id = ?2
                        "#,
                    )
                    .bind(entity.id.to_string())
                    .bind(&tm)
                    .bind(entity.data.to_string())
                    .bind(Utc::now().to_rfc3339())
                    .execute(&mut **tx)
                    .await
                    .map_err(storage)?;
                    if result.rows_affected() == 0 {
                        return Err(StoreError::NotFound);
                    }
                }
            }
            Mutation::DeleteEntity { entity_id, kind } => {
                let result = sqlx::query(
                    "DELETE FROM entities WHERE id = ?1 AND threat_model_id = ?2 AND kind = ?3",
                )
                .bind(entity_id.to_string())
                .bind(&tm)
                .bind(kind.as_str())
                .execute(&mut **tx)
                .await
                .map_err(storage)?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound);
                }
            }
            Mutation::ReplaceEntities { kind, entities } => {
                sqlx::query("DELETE FROM entities WHERE threat_model_id = ?1 AND kind = ?2")
                    .bind(&tm)
                    .bind(kind.as_str())
                    .execute(&mut **tx)
                    .await
                    .map_err(storage)?;
                for entity in &entities {
                    Self::insert_entity_tx(tx, threat_model_id, entity).await?;
                }
            }
            Mutation::SetMetadata { key, value } => {
                sqlx::query(
                    r#"
                    INSERT INTO metadata (threat_model_id, key, value)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT (threat_model_id, key) DO UPDATE SET value = excluded.value
                    "#,
                )
                .bind(&tm)
                .bind(&key)
                .bind(&value)
                .execute(&mut **tx)
                .await
                .map_err(storage)?;
            }
            Mutation::DeleteMetadata { key } => {
                sqlx::query("DELETE FROM metadata WHERE threat_model_id = ?1 AND key = ?2")
                    .bind(&tm)
                    .bind(&key)
                    .execute(&mut **tx)
                    .await
                    .map_err(storage)?;
            }
        }
        Ok(())
    }

    fn row_to_entity(row: &sqlx::sqlite::SqliteRow) -> Result<SubEntity, StoreError> {
        let kind = EntityKind::parse(&row.get::<String, _>("kind"))
            .ok_or_else(|| StoreError::Storage("Bad entity kind".into()))?;
        Ok(SubEntity {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            threat_model_id: parse_uuid(&row.get::<String, _>("threat_model_id"))?,
            kind,
            data: serde_json::from_str(&row.get::<String, _>("data"))
                .map_err(|e| StoreError::Storage(format!("Bad entity JSON: {e}")))?,
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            modified_at: parse_ts(&row.get::<String, _>("modified_at"))?,
        })
    }
}

/// Schema DDL, applied in order with `IF NOT EXISTS` semantics.
const SCHEMA: &[(&str, &str)] = &[
    (
        "threat_models",
        r#"
        CREATE TABLE IF NOT EXISTS threat_models (
            id           TEXT PRIMARY KEY,
            owner        TEXT NOT NULL,
            owner_email  TEXT NOT NULL,
            name         TEXT NOT NULL,
            description  TEXT,
            framework    TEXT NOT NULL,
            created_at   TEXT NOT NULL,
            modified_at  TEXT NOT NULL
        )
        "#,
    ),
    (
        "grants",
        r#"
        CREATE TABLE IF NOT EXISTS grants (
            threat_model_id TEXT NOT NULL,
            subject         TEXT NOT NULL,
            subject_type    TEXT NOT NULL,
            idp             TEXT NOT NULL DEFAULT '',
            role            TEXT NOT NULL,
            UNIQUE (threat_model_id, subject, subject_type, idp)
        )
        "#,
    ),
    (
        "groups",
        r#"
        CREATE TABLE IF NOT EXISTS groups (
            id         TEXT PRIMARY KEY,
            provider   TEXT NOT NULL,
            name       TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (provider, name)
        )
        "#,
    ),
    (
        "group_memberships",
        r#"
        CREATE TABLE IF NOT EXISTS group_memberships (
            group_id     TEXT NOT NULL,
            user_id      TEXT NOT NULL,
            subject_type TEXT NOT NULL DEFAULT 'user'
        )
        "#,
    ),
    (
        "diagrams",
        r#"
        CREATE TABLE IF NOT EXISTS diagrams (
            id              TEXT PRIMARY KEY,
            threat_model_id TEXT NOT NULL,
            name            TEXT NOT NULL,
            diagram_type    TEXT NOT NULL,
            cells           TEXT NOT NULL DEFAULT '{}',
            update_vector   INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            modified_at     TEXT NOT NULL
        )
        "#,
    ),
    (
        "entities",
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id              TEXT PRIMARY KEY,
            threat_model_id TEXT NOT NULL,
            kind            TEXT NOT NULL,
            data            TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            modified_at     TEXT NOT NULL
        )
        "#,
    ),
    (
        "metadata",
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            threat_model_id TEXT NOT NULL,
            key             TEXT NOT NULL,
            value           TEXT NOT NULL,
            UNIQUE (threat_model_id, key)
        )
        "#,
    ),
    (
        "webhooks",
        r#"
        CREATE TABLE IF NOT EXISTS webhooks (
            id         TEXT PRIMARY KEY,
            owner      TEXT NOT NULL,
            url        TEXT NOT NULL,
            events     TEXT NOT NULL DEFAULT '[]',
            secret     TEXT NOT NULL,
            status     TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "deliveries",
        r#"
        CREATE TABLE IF NOT EXISTS deliveries (
            id           TEXT PRIMARY KEY,
            webhook_id   TEXT NOT NULL,
            event        TEXT NOT NULL,
            target_url   TEXT NOT NULL,
            status       TEXT NOT NULL,
            attempts     INTEGER NOT NULL,
            last_error   TEXT,
            created_at   TEXT NOT NULL,
            completed_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "addons",
        r#"
        CREATE TABLE IF NOT EXISTS addons (
            id                 TEXT PRIMARY KEY,
            name               TEXT NOT NULL,
            webhook_id         TEXT NOT NULL REFERENCES webhooks (id) ON DELETE CASCADE,
            description        TEXT,
            icon               TEXT,
            object_types       TEXT NOT NULL DEFAULT '[]',
            threat_model_scope TEXT,
            created_at         TEXT NOT NULL
        )
        "#,
    ),
    (
        "deny_list",
        r#"
        CREATE TABLE IF NOT EXISTS deny_list (
            pattern      TEXT NOT NULL UNIQUE,
            pattern_type TEXT NOT NULL,
            description  TEXT NOT NULL
        )
        "#,
    ),
    (
        "quotas",
        r#"
        CREATE TABLE IF NOT EXISTS quotas (
            user_id                     TEXT PRIMARY KEY,
            max_active_invocations      INTEGER NOT NULL,
            max_invocations_per_hour    INTEGER NOT NULL,
            max_api_requests_per_minute INTEGER NOT NULL,
            max_api_requests_per_hour   INTEGER NOT NULL
        )
        "#,
    ),
];

#[async_trait]
impl Store for SqliteStore {
    // --- Threat models ---

    async fn create_threat_model(&self, model: &ThreatModel) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO threat_models (id, owner, owner_email, name, description, framework, created_at, modified_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(model.id.to_string())
        .bind(model.owner.to_string())
        .bind(&model.owner_email)
        .bind(&model.name)
        .bind(&model.description)
        .bind(&model.framework)
        .bind(model.created_at.to_rfc3339())
        .bind(model.modified_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.is_unique_violation() => {
                StoreError::Duplicate(format!("threat model {}", model.id))
            }
            other => storage(other),
        })?;
        Ok(())
    }

    async fn get_threat_model(&self, id: Uuid) -> Result<Option<ThreatModel>, StoreError> {
        let row = sqlx::query("SELECT * FROM threat_models WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(Self::row_to_threat_model).transpose()
    }

    async fn update_threat_model(&self, model: &ThreatModel) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE threat_models
            SET name = ?2, description = ?3, framework = ?4, modified_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(model.id.to_string())
        .bind(&model.name)
        .bind(&model.description)
        .bind(&model.framework)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_threat_model(&self, id: Uuid) -> Result<(), StoreError> {
        let id = id.to_string();
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for table in ["grants", "diagrams", "entities", "metadata"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE threat_model_id = ?1"))
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }
        let result = sqlx::query("DELETE FROM threat_models WHERE id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_threat_models(&self) -> Result<Vec<ThreatModel>, StoreError> {
        let rows = sqlx::query("SELECT * FROM threat_models ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(Self::row_to_threat_model).collect()
    }

    async fn mutate_checked(
        &self,
        principal: &Principal,
        threat_model_id: Uuid,
        required: Role,
        mutation: Mutation,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        Self::check_access_tx(&mut tx, principal, threat_model_id, required).await?;
        Self::apply_mutation_tx(&mut tx, threat_model_id, mutation).await?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    // --- Access grants ---

    async fn grants_for(&self, threat_model_id: Uuid) -> Result<Vec<AccessGrant>, StoreError> {
        let rows = sqlx::query("SELECT * FROM grants WHERE threat_model_id = ?1")
            .bind(threat_model_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(|row| Self::row_to_grant(threat_model_id, row)).collect()
    }

    async fn put_grant(&self, grant: &AccessGrant) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO grants (threat_model_id, subject, subject_type, idp, role)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (threat_model_id, subject, subject_type, idp)
            DO UPDATE SET role = excluded.role
            "#,
        )
        .bind(grant.threat_model_id.to_string())
        .bind(&grant.subject)
        .bind(grant.subject_type.as_str())
        .bind(grant.idp.as_deref().unwrap_or(""))
        .bind(grant.role.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn delete_grant(
        &self,
        threat_model_id: Uuid,
        subject: &str,
        subject_type: &str,
        idp: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM grants
            WHERE threat_model_id = ?1 AND subject = ?2 AND subject_type = ?3 AND idp = ?4
            "#,
        )
        .bind(threat_model_id.to_string())
        .bind(subject)
        .bind(subject_type)
        .bind(idp.unwrap_or(""))
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    // --- Groups & memberships ---

    async fn ensure_group(&self, provider: &str, name: &str) -> Result<Group, StoreError> {
        if let Some(group) = self.find_group(provider, name).await? {
            return Ok(group);
        }
        let group = Group {
            id: Uuid::new_v4(),
            provider: provider.into(),
            name: name.into(),
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO groups (id, provider, name, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(group.id.to_string())
        .bind(&group.provider)
        .bind(&group.name)
        .bind(group.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        // A concurrent insert may have won the race; read back the row.
        self.find_group(provider, name)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn find_group(&self, provider: &str, name: &str) -> Result<Option<Group>, StoreError> {
        let row = sqlx::query("SELECT * FROM groups WHERE provider = ?1 AND name = ?2")
            .bind(provider)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.map(|row| {
            Ok(Group {
                id: parse_uuid(&row.get::<String, _>("id"))?,
                provider: row.get("provider"),
                name: row.get("name"),
                created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            })
        })
        .transpose()
    }

    async fn add_membership(&self, group_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO group_memberships (group_id, user_id, subject_type)
            VALUES (?1, ?2, 'user')
            "#,
        )
        .bind(group_id.to_string())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn remove_membership(&self, group_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM group_memberships WHERE group_id = ?1 AND user_id = ?2")
            .bind(group_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn is_administrator(&self, user_id: Uuid) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM group_memberships m
            JOIN groups g ON g.id = m.group_id
            WHERE g.name = ?1 AND m.user_id = ?2
            "#,
        )
        .bind(ADMINISTRATORS_GROUP)
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(count > 0)
    }

    // --- Diagrams ---

    async fn create_diagram(&self, diagram: &Diagram) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO diagrams (id, threat_model_id, name, diagram_type, cells, update_vector, created_at, modified_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(diagram.id.to_string())
        .bind(diagram.threat_model_id.to_string())
        .bind(&diagram.name)
        .bind(&diagram.diagram_type)
        .bind(serde_json::to_string(&diagram.cells).map_err(|e| StoreError::Storage(e.to_string()))?)
        .bind(diagram.update_vector as i64)
        .bind(diagram.created_at.to_rfc3339())
        .bind(diagram.modified_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_diagram(&self, id: Uuid) -> Result<Option<Diagram>, StoreError> {
        let row = sqlx::query("SELECT * FROM diagrams WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(Self::row_to_diagram).transpose()
    }

    async fn save_diagram_state(
        &self,
        id: Uuid,
        cells: &BTreeMap<String, Cell>,
        update_vector: u64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE diagrams SET cells = ?2, update_vector = ?3, modified_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(serde_json::to_string(cells).map_err(|e| StoreError::Storage(e.to_string()))?)
        .bind(update_vector as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_diagram(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM diagrams WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn diagrams_for(&self, threat_model_id: Uuid) -> Result<Vec<Diagram>, StoreError> {
        let rows = sqlx::query("SELECT * FROM diagrams WHERE threat_model_id = ?1 ORDER BY created_at")
            .bind(threat_model_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(Self::row_to_diagram).collect()
    }

    // --- Sub-entities ---

    async fn create_entity(&self, entity: &SubEntity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO entities (id, threat_model_id, kind, data, created_at, modified_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(entity.id.to_string())
        .bind(entity.threat_model_id.to_string())
        .bind(entity.kind.as_str())
        .bind(entity.data.to_string())
        .bind(entity.created_at.to_rfc3339())
        .bind(entity.modified_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_entity(&self, id: Uuid) -> Result<Option<SubEntity>, StoreError> {
        let row = sqlx::query("SELECT * FROM entities WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(Self::row_to_entity).transpose()
    }

    async fn update_entity(&self, entity: &SubEntity) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE entities SET data = ?2, modified_at = ?3 WHERE id = ?1
            "#,
        )
        .bind(entity.id.to_string())
        .bind(entity.data.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_entity(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM entities WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn entities_for(
        &self,
        threat_model_id: Uuid,
        kind: EntityKind,
    ) -> Result<Vec<SubEntity>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM entities WHERE threat_model_id = ?1 AND kind = ?2 ORDER BY created_at",
        )
        .bind(threat_model_id.to_string())
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(Self::row_to_entity).collect()
    }

    // --- Metadata ---

    async fn set_metadata(&self, threat_model_id: Uuid, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO metadata (threat_model_id, key, value)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (threat_model_id, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(threat_model_id.to_string())
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_metadata(&self, threat_model_id: Uuid) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM metadata WHERE threat_model_id = ?1 ORDER BY key")
            .bind(threat_model_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows.iter().map(|r| (r.get("key"), r.get("value"))).collect())
    }

    async fn delete_metadata(&self, threat_model_id: Uuid, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM metadata WHERE threat_model_id = ?1 AND key = ?2")
            .bind(threat_model_id.to_string())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    // --- Webhooks & deliveries ---

    async fn create_webhook(&self, webhook: &WebhookSubscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhooks (id, owner, url, events, secret, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(webhook.id.to_string())
        .bind(webhook.owner.to_string())
        .bind(&webhook.url)
        .bind(serde_json::to_string(&webhook.events).map_err(|e| StoreError::Storage(e.to_string()))?)
        .bind(&webhook.secret)
        .bind(webhook.status.as_str())
        .bind(webhook.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_webhook(&self, id: Uuid) -> Result<Option<WebhookSubscription>, StoreError> {
        let row = sqlx::query("SELECT * FROM webhooks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(Self::row_to_webhook).transpose()
    }

    async fn list_webhooks(&self, owner: Uuid) -> Result<Vec<WebhookSubscription>, StoreError> {
        let rows = sqlx::query("SELECT * FROM webhooks WHERE owner = ?1 ORDER BY created_at")
            .bind(owner.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(Self::row_to_webhook).collect()
    }

    async fn set_webhook_status(&self, id: Uuid, status: SubscriptionStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE webhooks SET status = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_webhook_checked(
        &self,
        principal: &Principal,
        webhook: &WebhookSubscription,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        Self::check_webhook_owner_tx(&mut tx, principal, webhook.id).await?;
        sqlx::query("UPDATE webhooks SET url = ?2, events = ?3, status = ?4 WHERE id = ?1")
            .bind(webhook.id.to_string())
            .bind(&webhook.url)
            .bind(serde_json::to_string(&webhook.events).map_err(|e| StoreError::Storage(e.to_string()))?)
            .bind(webhook.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn delete_webhook_checked(&self, principal: &Principal, id: Uuid) -> Result<(), Error> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        Self::check_webhook_owner_tx(&mut tx, principal, id).await?;
        sqlx::query("DELETE FROM webhooks WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn delete_webhook(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO deliveries (id, webhook_id, event, target_url, status, attempts, last_error, created_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.webhook_id.to_string())
        .bind(&record.event)
        .bind(&record.target_url)
        .bind(&record.status)
        .bind(record.attempts as i64)
        .bind(&record.last_error)
        .bind(record.created_at.to_rfc3339())
        .bind(record.completed_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn list_deliveries(&self, owner: Uuid) -> Result<Vec<DeliveryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT d.* FROM deliveries d
            JOIN webhooks w ON w.id = d.webhook_id
            WHERE w.owner = ?1
            ORDER BY d.created_at DESC
            "#,
        )
        .bind(owner.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| {
                Ok(DeliveryRecord {
                    id: parse_uuid(&row.get::<String, _>("id"))?,
                    webhook_id: parse_uuid(&row.get::<String, _>("webhook_id"))?,
                    event: row.get("event"),
                    target_url: row.get("target_url"),
                    status: row.get("status"),
                    attempts: row.get::<i64, _>("attempts") as u32,
                    last_error: row.get("last_error"),
                    created_at: parse_ts(&row.get::<String, _>("created_at"))?,
                    completed_at: parse_ts(&row.get::<String, _>("completed_at"))?,
                })
            })
            .collect()
    }

    // --- Add-ons ---

    async fn create_addon(&self, addon: &Addon) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO addons (id, name, webhook_id, description, icon, object_types, threat_model_scope, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(addon.id.to_string())
        .bind(&addon.name)
        .bind(addon.webhook_id.to_string())
        .bind(&addon.description)
        .bind(&addon.icon)
        .bind(serde_json::to_string(&addon.object_types).map_err(|e| StoreError::Storage(e.to_string()))?)
        .bind(addon.threat_model_scope.map(|s| s.to_string()))
        .bind(addon.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_addon(&self, id: Uuid) -> Result<Option<Addon>, StoreError> {
        let row = sqlx::query("SELECT * FROM addons WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(Self::row_to_addon).transpose()
    }

    async fn list_addons(&self) -> Result<Vec<Addon>, StoreError> {
        let rows = sqlx::query("SELECT * FROM addons ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(Self::row_to_addon).collect()
    }

    async fn delete_addon(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM addons WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // --- Deny list & quotas ---

    async fn deny_entries(&self) -> Result<Vec<UrlDenyEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM deny_list")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter()
            .map(|row| {
                let pattern_type = tmhub_core::webhook::PatternType::parse(
                    &row.get::<String, _>("pattern_type"),
                )
                .ok_or_else(|| StoreError::Storage("Bad pattern type".into()))?;
                Ok(UrlDenyEntry {
                    pattern: row.get("pattern"),
                    pattern_type,
                    description: row.get("description"),
                })
            })
            .collect()
    }

    async fn put_deny_entry(&self, entry: &UrlDenyEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO deny_list (pattern, pattern_type, description)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (pattern) DO UPDATE SET
                pattern_type = excluded.pattern_type,
                description = excluded.description
            "#,
        )
        .bind(&entry.pattern)
        .bind(entry.pattern_type.as_str())
        .bind(&entry.description)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn quota_for(&self, user_id: Uuid) -> Result<Option<QuotaRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM quotas WHERE user_id = ?1")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(|row| QuotaRecord {
            max_active_invocations: row.get::<i64, _>("max_active_invocations") as u32,
            max_invocations_per_hour: row.get::<i64, _>("max_invocations_per_hour") as u32,
            max_api_requests_per_minute: row.get::<i64, _>("max_api_requests_per_minute") as u32,
            max_api_requests_per_hour: row.get::<i64, _>("max_api_requests_per_hour") as u32,
        }))
    }

    async fn put_quota(&self, user_id: Uuid, quota: &QuotaRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO quotas (user_id, max_active_invocations, max_invocations_per_hour,
                                max_api_requests_per_minute, max_api_requests_per_hour)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (user_id) DO UPDATE SET
                max_active_invocations = excluded.max_active_invocations,
                max_invocations_per_hour = excluded.max_invocations_per_hour,
                max_api_requests_per_minute = excluded.max_api_requests_per_minute,
                max_api_requests_per_hour = excluded.max_api_requests_per_hour
            "#,
        )
        .bind(user_id.to_string())
        .bind(quota.max_active_invocations as i64)
        .bind(quota.max_invocations_per_hour as i64)
        .bind(quota.max_api_requests_per_minute as i64)
        .bind(quota.max_api_requests_per_hour as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmhub_core::access::AccessGrant;

    async fn store() -> SqliteStore {
        SqliteStore::new(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn threat_model_crud() {
        let s = store().await;
        let tm = ThreatModel::new(Uuid::new_v4(), "owner@example.com", "Payment flow", "STRIDE");
        s.create_threat_model(&tm).await.unwrap();

        let got = s.get_threat_model(tm.id).await.unwrap().unwrap();
        assert_eq!(got.name, "Payment flow");
        assert_eq!(got.owner_email, "owner@example.com");

        let mut updated = got.clone();
        updated.name = "Payments v2".into();
        s.update_threat_model(&updated).await.unwrap();
        assert_eq!(s.get_threat_model(tm.id).await.unwrap().unwrap().name, "Payments v2");

        s.delete_threat_model(tm.id).await.unwrap();
        assert!(s.get_threat_model(tm.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_threat_model_rejected() {
        let s = store().await;
        let tm = ThreatModel::new(Uuid::new_v4(), "o@example.com", "A", "STRIDE");
        s.create_threat_model(&tm).await.unwrap();
        assert!(matches!(
            s.create_threat_model(&tm).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn grant_upsert_and_idp_scoping() {
        let s = store().await;
        let tm_id = Uuid::new_v4();
        s.put_grant(&AccessGrant::group(tm_id, "security-team", "saml_okta", Role::Reader))
            .await
            .unwrap();
        s.put_grant(&AccessGrant::group(tm_id, "security-team", "saml_okta", Role::Writer))
            .await
            .unwrap();
        s.put_grant(&AccessGrant::group(tm_id, "security-team", "saml_azure", Role::Reader))
            .await
            .unwrap();

        let grants = s.grants_for(tm_id).await.unwrap();
        // Same (subject, idp) upserted; different idp is a distinct row.
        assert_eq!(grants.len(), 2);
        let okta = grants.iter().find(|g| g.idp.as_deref() == Some("saml_okta")).unwrap();
        assert_eq!(okta.role, Role::Writer);
    }

    #[tokio::test]
    async fn builtin_groups_are_seeded() {
        let s = store().await;
        assert!(s.find_group(WILDCARD_PROVIDER, EVERYONE_GROUP).await.unwrap().is_some());
        assert!(s.find_group(WILDCARD_PROVIDER, ADMINISTRATORS_GROUP).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn administrator_membership_toggles() {
        let s = store().await;
        let user = Uuid::new_v4();
        assert!(!s.is_administrator(user).await.unwrap());

        let admins = s.ensure_group(WILDCARD_PROVIDER, ADMINISTRATORS_GROUP).await.unwrap();
        s.add_membership(admins.id, user).await.unwrap();
        assert!(s.is_administrator(user).await.unwrap());

        s.remove_membership(admins.id, user).await.unwrap();
        assert!(!s.is_administrator(user).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_membership_is_idempotent() {
        let s = store().await;
        let user = Uuid::new_v4();
        let g = s.ensure_group("saml_okta", "devs").await.unwrap();
        s.add_membership(g.id, user).await.unwrap();
        s.add_membership(g.id, user).await.unwrap();
        // Second insert must be swallowed by the unique index.
        s.remove_membership(g.id, user).await.unwrap();
        assert!(!s.is_administrator(user).await.unwrap());
    }

    #[tokio::test]
    async fn legacy_administrators_table_is_collapsed() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::from_str(":memory:").unwrap().create_if_missing(true),
            )
            .await
            .unwrap();

        let user = Uuid::new_v4();
        sqlx::query("CREATE TABLE administrators (user_id TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO administrators (user_id) VALUES (?1)")
            .bind(user.to_string())
            .execute(&pool)
            .await
            .unwrap();

        let s = SqliteStore::from_pool(pool).await.unwrap();
        assert!(s.is_administrator(user).await.unwrap());
    }

    #[tokio::test]
    async fn diagram_state_roundtrip() {
        let s = store().await;
        let mut d = Diagram::new(Uuid::new_v4(), "flow", "data_flow");
        s.create_diagram(&d).await.unwrap();

        d.cells.insert(
            "c1".into(),
            Cell { id: "c1".into(), attributes: serde_json::Map::new() },
        );
        s.save_diagram_state(d.id, &d.cells, 5).await.unwrap();

        let got = s.get_diagram(d.id).await.unwrap().unwrap();
        assert_eq!(got.update_vector, 5);
        assert!(got.cells.contains_key("c1"));
    }

    #[tokio::test]
    async fn webhook_delete_cascades_to_addons() {
        let s = store().await;
        let owner = Uuid::new_v4();
        let wh = WebhookSubscription {
            id: Uuid::new_v4(),
            owner,
            url: "https://example.com/hook".into(),
            events: vec!["addon.invoked".into()],
            secret: "s".repeat(128),
            status: SubscriptionStatus::Active,
            created_at: Utc::now(),
        };
        s.create_webhook(&wh).await.unwrap();

        let addon = Addon {
            id: Uuid::new_v4(),
            name: "scanner".into(),
            webhook_id: wh.id,
            description: None,
            icon: None,
            object_types: vec![],
            threat_model_scope: None,
            created_at: Utc::now(),
        };
        s.create_addon(&addon).await.unwrap();

        s.delete_webhook(wh.id).await.unwrap();
        assert!(s.get_addon(addon.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deny_seed_installs_once() {
        let s = store().await;
        let first = s.seed_deny_list().await.unwrap();
        assert!(first > 0);
        assert_eq!(s.seed_deny_list().await.unwrap(), 0);
        let entries = s.deny_entries().await.unwrap();
        assert!(entries.iter().any(|e| e.pattern == "169.254.0.0/16"));
        assert!(entries.iter().any(|e| e.pattern == "metadata.google.internal"));
    }

    #[tokio::test]
    async fn quota_absent_until_written() {
        let s = store().await;
        let user = Uuid::new_v4();
        assert!(s.quota_for(user).await.unwrap().is_none());

        let custom = QuotaRecord { max_invocations_per_hour: 50, ..QuotaRecord::default() };
        s.put_quota(user, &custom).await.unwrap();
        assert_eq!(
            s.quota_for(user).await.unwrap().unwrap().max_invocations_per_hour,
            50
        );
    }

    #[tokio::test]
    async fn metadata_upsert() {
        let s = store().await;
        let tm = Uuid::new_v4();
        s.set_metadata(tm, "severity", "high").await.unwrap();
        s.set_metadata(tm, "severity", "low").await.unwrap();
        let meta = s.get_metadata(tm).await.unwrap();
        assert_eq!(meta, vec![("severity".to_string(), "low".to_string())]);

        s.delete_metadata(tm, "severity").await.unwrap();
        assert!(s.get_metadata(tm).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entity_and_diagram_primitives() {
        let s = store().await;
        let tm = Uuid::new_v4();

        let mut entity = SubEntity::new(tm, EntityKind::Threat, serde_json::json!({"title": "spoofing"}));
        s.create_entity(&entity).await.unwrap();
        assert_eq!(s.entities_for(tm, EntityKind::Threat).await.unwrap().len(), 1);

        entity.data = serde_json::json!({"title": "tampering"});
        s.update_entity(&entity).await.unwrap();
        assert_eq!(
            s.get_entity(entity.id).await.unwrap().unwrap().data["title"],
            "tampering"
        );

        s.delete_entity(entity.id).await.unwrap();
        assert!(s.get_entity(entity.id).await.unwrap().is_none());

        let diagram = Diagram::new(tm, "flow", "data_flow");
        s.create_diagram(&diagram).await.unwrap();
        s.delete_diagram(diagram.id).await.unwrap();
        assert!(s.get_diagram(diagram.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn grant_delete_primitive() {
        let s = store().await;
        let tm = Uuid::new_v4();
        s.put_grant(&AccessGrant::user(tm, "alice@example.com", Role::Reader)).await.unwrap();
        s.delete_grant(tm, "alice@example.com", "user", None).await.unwrap();
        assert!(s.grants_for(tm).await.unwrap().is_empty());
    }

    // --- Checked mutations ---

    fn user(email: &str) -> Principal {
        Principal {
            internal_uuid: Uuid::new_v4(),
            provider: "oidc_google".into(),
            provider_user_id: "puid".into(),
            email: email.into(),
            name: None,
            groups: vec![],
            is_administrator: false,
        }
    }

    #[tokio::test]
    async fn mutate_checked_rechecks_grants_under_the_transaction() {
        let s = store().await;
        let owner = user("owner@example.com");
        let writer = user("alice@example.com");
        let model = ThreatModel::new(owner.internal_uuid, &owner.email, "tm", "STRIDE");
        s.create_threat_model(&model).await.unwrap();
        s.put_grant(&AccessGrant::user(model.id, &writer.email, Role::Writer))
            .await
            .unwrap();

        s.mutate_checked(
            &writer,
            model.id,
            Role::Writer,
            Mutation::SetMetadata { key: "severity".into(), value: "high".into() },
        )
        .await
        .unwrap();

        // Owner revokes the grant; the very next checked write sees the
        // revocation because grants are re-read in the writing
        // transaction.
        s.mutate_checked(
            &owner,
            model.id,
            Role::Owner,
            Mutation::DeleteGrant {
                subject: writer.email.clone(),
                subject_type: SubjectType::User,
                idp: None,
            },
        )
        .await
        .unwrap();

        let err = s
            .mutate_checked(
                &writer,
                model.id,
                Role::Writer,
                Mutation::SetMetadata { key: "severity".into(), value: "low".into() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authz(AuthzError::NotFound)));
        assert_eq!(
            s.get_metadata(model.id).await.unwrap(),
            vec![("severity".to_string(), "high".to_string())]
        );
    }

    #[tokio::test]
    async fn mutate_checked_deny_surfaces() {
        let s = store().await;
        let owner = user("owner@example.com");
        let reader = user("reader@example.com");
        let stranger = user("mallory@example.com");
        let model = ThreatModel::new(owner.internal_uuid, &owner.email, "tm", "STRIDE");
        s.create_threat_model(&model).await.unwrap();
        s.put_grant(&AccessGrant::user(model.id, &reader.email, Role::Reader))
            .await
            .unwrap();

        let mutation = Mutation::SetMetadata { key: "k".into(), value: "v".into() };

        // Readable but insufficient: Forbidden.
        let err = s
            .mutate_checked(&reader, model.id, Role::Writer, mutation.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authz(AuthzError::Forbidden)));

        // Not readable: indistinguishable from missing.
        let err = s
            .mutate_checked(&stranger, model.id, Role::Writer, mutation.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authz(AuthzError::NotFound)));

        // Missing model: also NotFound.
        let err = s
            .mutate_checked(&owner, Uuid::new_v4(), Role::Writer, mutation)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authz(AuthzError::NotFound)));
    }

    #[tokio::test]
    async fn checked_threat_model_delete_cascades() {
        let s = store().await;
        let owner = user("owner@example.com");
        let model = ThreatModel::new(owner.internal_uuid, &owner.email, "tm", "STRIDE");
        s.create_threat_model(&model).await.unwrap();

        let diagram = Diagram::new(model.id, "flow", "data_flow");
        s.create_diagram(&diagram).await.unwrap();
        let entity = SubEntity::new(model.id, EntityKind::Asset, serde_json::json!({}));
        s.create_entity(&entity).await.unwrap();
        s.set_metadata(model.id, "k", "v").await.unwrap();

        s.mutate_checked(&owner, model.id, Role::Owner, Mutation::DeleteThreatModel)
            .await
            .unwrap();

        assert!(s.get_threat_model(model.id).await.unwrap().is_none());
        assert!(s.get_diagram(diagram.id).await.unwrap().is_none());
        assert!(s.get_entity(entity.id).await.unwrap().is_none());
        assert!(s.get_metadata(model.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn checked_replace_swaps_whole_collection() {
        let s = store().await;
        let owner = user("owner@example.com");
        let model = ThreatModel::new(owner.internal_uuid, &owner.email, "tm", "STRIDE");
        s.create_threat_model(&model).await.unwrap();
        for i in 0..2 {
            let entity = SubEntity::new(model.id, EntityKind::Threat, serde_json::json!({"n": i}));
            s.create_entity(&entity).await.unwrap();
        }

        let replacement = SubEntity::new(model.id, EntityKind::Threat, serde_json::json!({"n": 9}));
        s.mutate_checked(
            &owner,
            model.id,
            Role::Writer,
            Mutation::ReplaceEntities { kind: EntityKind::Threat, entities: vec![replacement.clone()] },
        )
        .await
        .unwrap();

        let remaining = s.entities_for(model.id, EntityKind::Threat).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, replacement.id);
    }

    #[tokio::test]
    async fn checked_mutations_stay_inside_their_model() {
        let s = store().await;
        let owner = user("owner@example.com");
        let model = ThreatModel::new(owner.internal_uuid, &owner.email, "mine", "STRIDE");
        s.create_threat_model(&model).await.unwrap();

        // An entity belonging to a different model cannot be deleted
        // through a check against this one.
        let foreign = SubEntity::new(Uuid::new_v4(), EntityKind::Threat, serde_json::json!({}));
        s.create_entity(&foreign).await.unwrap();
        let err = s
            .mutate_checked(
                &owner,
                model.id,
                Role::Writer,
                Mutation::DeleteEntity { entity_id: foreign.id, kind: EntityKind::Threat },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::NotFound)));
        assert!(s.get_entity(foreign.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn webhook_checked_writes_require_ownership() {
        let s = store().await;
        let owner = user("owner@example.com");
        let stranger = user("mallory@example.com");
        let mut webhook = WebhookSubscription {
            id: Uuid::new_v4(),
            owner: owner.internal_uuid,
            url: "https://example.com/hook".into(),
            events: vec![],
            secret: "s".repeat(128),
            status: SubscriptionStatus::PendingVerification,
            created_at: Utc::now(),
        };
        s.create_webhook(&webhook).await.unwrap();

        webhook.status = SubscriptionStatus::Disabled;
        let err = s.update_webhook_checked(&stranger, &webhook).await.unwrap_err();
        assert!(matches!(err, Error::Authz(AuthzError::NotFound)));
        s.update_webhook_checked(&owner, &webhook).await.unwrap();
        assert_eq!(
            s.get_webhook(webhook.id).await.unwrap().unwrap().status,
            SubscriptionStatus::Disabled
        );

        let err = s.delete_webhook_checked(&stranger, webhook.id).await.unwrap_err();
        assert!(matches!(err, Error::Authz(AuthzError::NotFound)));
        s.delete_webhook_checked(&owner, webhook.id).await.unwrap();
        assert!(s.get_webhook(webhook.id).await.unwrap().is_none());
    }
}
