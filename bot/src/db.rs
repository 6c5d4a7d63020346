use anyhow::{Context, Result};
use async_trait::async_trait;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, Pool};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;
use uuid::Uuid;

use crate::ledger::{check_amount, Ledger, LedgerError};
use crate::models::{ConversationTurn, NewConversationTurn, NewUser, Turn, UsageField, User};
use crate::schema::{conversation_turns, users};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// Embedded database migrations - compiled into the binary
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub fn create_pool(database_url: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder()
        .build(manager)
        .context("Failed to create database pool")?;

    Ok(pool)
}

/// Run pending database migrations
/// Returns the list of migrations that were applied
pub fn run_migrations(pool: &DbPool) -> Result<Vec<String>> {
    let mut conn = pool.get()?;

    let applied: Vec<String> = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?
        .iter()
        .map(|m| m.to_string())
        .collect();

    Ok(applied)
}

/// PostgreSQL-backed ledger.
///
/// Diesel is synchronous, so every call is moved to the blocking thread pool
/// with a connection checked out for exactly that call.
#[derive(Clone)]
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, LedgerError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn add_usage(
    conn: &mut PgConnection,
    user_id: Uuid,
    field: UsageField,
    amount: i64,
) -> Result<User, LedgerError> {
    let target = users::table.find(user_id);
    let updated = match field {
        UsageField::SecondBlocks => diesel::update(target)
            .set((
                users::seconds_spent_blocks.eq(users::seconds_spent_blocks + amount),
                users::updated_at.eq(diesel::dsl::now),
            ))
            .returning(User::as_returning())
            .get_result(conn)
            .optional()?,
        UsageField::CharacterBlocks => diesel::update(target)
            .set((
                users::characters_spent_blocks.eq(users::characters_spent_blocks + amount),
                users::updated_at.eq(diesel::dsl::now),
            ))
            .returning(User::as_returning())
            .get_result(conn)
            .optional()?,
        UsageField::Tokens => diesel::update(target)
            .set((
                users::tokens_spent.eq(users::tokens_spent + amount),
                users::updated_at.eq(diesel::dsl::now),
            ))
            .returning(User::as_returning())
            .get_result(conn)
            .optional()?,
    };

    updated.ok_or(LedgerError::UserNotFound(user_id))
}

fn find_by_external_id(
    conn: &mut PgConnection,
    external_id: i64,
) -> Result<Option<User>, LedgerError> {
    let user = users::table
        .filter(users::external_id.eq(external_id))
        .select(User::as_select())
        .first(conn)
        .optional()?;
    Ok(user)
}

fn insert_turns(conn: &mut PgConnection, user_id: Uuid, turns: &[Turn]) -> Result<(), LedgerError> {
    let rows: Vec<NewConversationTurn<'_>> = turns
        .iter()
        .map(|turn| NewConversationTurn {
            user_id,
            role: turn.role.as_str(),
            content: &turn.text,
        })
        .collect();

    // A multi-row insert keeps the given order in the BIGSERIAL ids.
    diesel::insert_into(conversation_turns::table)
        .values(&rows)
        .execute(conn)?;

    Ok(())
}

#[async_trait]
impl Ledger for PgLedger {
    async fn get_or_create_user(&self, external_id: i64) -> Result<User, LedgerError> {
        self.with_conn(move |conn| {
            // The unique constraint on external_id settles concurrent first contacts;
            // the loser inserts nothing and reads the winner's row.
            let inserted = diesel::insert_into(users::table)
                .values(&NewUser { external_id })
                .on_conflict(users::external_id)
                .do_nothing()
                .execute(conn)?;

            if inserted > 0 {
                info!("Registered new user for external id {}", external_id);
            }

            let user = users::table
                .filter(users::external_id.eq(external_id))
                .select(User::as_select())
                .first(conn)?;

            Ok(user)
        })
        .await
    }

    async fn admit_user(
        &self,
        external_id: i64,
        max_users: i64,
    ) -> Result<Option<User>, LedgerError> {
        self.with_conn(move |conn| {
            conn.transaction(|conn| {
                if let Some(user) = find_by_external_id(conn, external_id)? {
                    return Ok(Some(user));
                }

                // Serializes newcomers against each other until commit; plain
                // reads and counter updates are not blocked.
                diesel::sql_query("LOCK TABLE users IN SHARE ROW EXCLUSIVE MODE").execute(conn)?;

                if let Some(user) = find_by_external_id(conn, external_id)? {
                    return Ok(Some(user));
                }
                let registered: i64 = users::table.count().get_result(conn)?;
                if registered >= max_users {
                    return Ok(None);
                }

                let user = diesel::insert_into(users::table)
                    .values(&NewUser { external_id })
                    .returning(User::as_returning())
                    .get_result(conn)?;
                info!("Registered new user for external id {}", external_id);
                Ok(Some(user))
            })
        })
        .await
    }

    async fn find_user(&self, external_id: i64) -> Result<Option<User>, LedgerError> {
        self.with_conn(move |conn| find_by_external_id(conn, external_id))
            .await
    }

    async fn user(&self, user_id: Uuid) -> Result<User, LedgerError> {
        self.with_conn(move |conn| {
            users::table
                .find(user_id)
                .select(User::as_select())
                .first(conn)
                .optional()?
                .ok_or(LedgerError::UserNotFound(user_id))
        })
        .await
    }

    async fn count_users(&self) -> Result<i64, LedgerError> {
        self.with_conn(|conn| Ok(users::table.count().get_result::<i64>(conn)?))
            .await
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        field: UsageField,
        amount: i64,
    ) -> Result<User, LedgerError> {
        check_amount(field, amount)?;
        self.with_conn(move |conn| {
            conn.transaction(|conn| add_usage(conn, user_id, field, amount))
        })
        .await
    }

    async fn append_turns(&self, user_id: Uuid, turns: &[Turn]) -> Result<(), LedgerError> {
        if turns.is_empty() {
            return Ok(());
        }
        let turns = turns.to_vec();
        self.with_conn(move |conn| conn.transaction(|conn| insert_turns(conn, user_id, &turns)))
            .await
    }

    async fn list_recent_turns(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, LedgerError> {
        self.with_conn(move |conn| {
            let mut turns: Vec<ConversationTurn> = conversation_turns::table
                .filter(conversation_turns::user_id.eq(user_id))
                .order(conversation_turns::id.desc())
                .limit(limit as i64)
                .select(ConversationTurn::as_select())
                .load(conn)?;
            turns.reverse();
            Ok(turns)
        })
        .await
    }

    async fn commit_chat_round(
        &self,
        user_id: Uuid,
        tokens: i64,
        prompt: &str,
        reply: &str,
    ) -> Result<User, LedgerError> {
        check_amount(UsageField::Tokens, tokens)?;
        let turns = [Turn::user(prompt), Turn::assistant(reply)];
        self.with_conn(move |conn| {
            conn.transaction(|conn| {
                let user = add_usage(conn, user_id, UsageField::Tokens, tokens)?;
                insert_turns(conn, user_id, &turns)?;
                Ok(user)
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Runs only against a disposable database named by TEST_DATABASE_URL.
    fn test_ledger() -> Option<PgLedger> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = create_pool(&url).ok()?;
        run_migrations(&pool).ok()?;
        Some(PgLedger::new(pool))
    }

    fn unique_external_id() -> i64 {
        // Keep ids positive and unlikely to collide across runs.
        (Uuid::new_v4().as_u128() >> 66) as i64
    }

    #[tokio::test]
    async fn concurrent_first_contact_creates_one_user() {
        let Some(ledger) = test_ledger() else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return;
        };
        let ledger = Arc::new(ledger);
        let external_id = unique_external_id();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.get_or_create_user(external_id).await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(
            ledger.find_user(external_id).await.unwrap().map(|u| u.id),
            Some(ids[0])
        );
    }

    #[tokio::test]
    async fn chat_round_bills_and_stores_the_pair() {
        let Some(ledger) = test_ledger() else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return;
        };
        let user = ledger.get_or_create_user(unique_external_id()).await.unwrap();

        let updated = ledger
            .commit_chat_round(user.id, 120, "hello", "hi there")
            .await
            .unwrap();
        assert_eq!(updated.tokens_spent, 120);

        let turns = ledger.list_recent_turns(user.id, 10).await.unwrap();
        let turns: Vec<_> = turns.iter().map(|t| t.to_turn().unwrap()).collect();
        assert_eq!(turns, vec![Turn::user("hello"), Turn::assistant("hi there")]);
    }

    #[tokio::test]
    async fn appended_turns_come_back_in_order() {
        let Some(ledger) = test_ledger() else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return;
        };
        let user = ledger.get_or_create_user(unique_external_id()).await.unwrap();
        let turns = vec![Turn::user("one"), Turn::assistant("two"), Turn::user("three")];

        ledger.append_turns(user.id, &turns).await.unwrap();

        let stored = ledger.list_recent_turns(user.id, 10).await.unwrap();
        let stored: Vec<_> = stored.iter().map(|t| t.to_turn().unwrap()).collect();
        assert_eq!(stored, turns);
    }

    #[tokio::test]
    async fn admission_returns_known_users_even_when_full() {
        let Some(ledger) = test_ledger() else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return;
        };
        let user = ledger.get_or_create_user(unique_external_id()).await.unwrap();

        let admitted = ledger.admit_user(user.external_id, 0).await.unwrap();
        assert_eq!(admitted.map(|u| u.id), Some(user.id));
        assert!(ledger
            .admit_user(unique_external_id(), 0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn increment_of_missing_user_fails() {
        let Some(ledger) = test_ledger() else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return;
        };
        let missing = Uuid::new_v4();
        let err = ledger
            .increment_usage(missing, UsageField::SecondBlocks, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UserNotFound(id) if id == missing));
    }
}
