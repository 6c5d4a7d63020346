//! In-process ledger used by the validator and pipeline tests.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{check_amount, Ledger, LedgerError};
use crate::models::{ConversationTurn, Turn, UsageField, User};

#[derive(Default)]
struct State {
    users: Vec<User>,
    turns: Vec<ConversationTurn>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user with existing spend
    pub fn insert_user(&self, external_id: i64, seconds: i64, characters: i64, tokens: i64) -> User {
        let now = Utc::now().naive_utc();
        let user = User {
            id: Uuid::new_v4(),
            external_id,
            seconds_spent_blocks: seconds,
            characters_spent_blocks: characters,
            tokens_spent: tokens,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().unwrap().users.push(user.clone());
        user
    }

    /// Make every subsequent write fail as a broken transaction would
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Number of user reads served so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, user_id: Uuid) -> User {
        let state = self.state.lock().unwrap();
        state.users.iter().find(|u| u.id == user_id).unwrap().clone()
    }

    pub fn turns(&self, user_id: Uuid) -> Vec<Turn> {
        let state = self.state.lock().unwrap();
        state
            .turns
            .iter()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.to_turn().unwrap())
            .collect()
    }

    pub fn user_count(&self) -> usize {
        self.state.lock().unwrap().users.len()
    }

    fn check_writable(&self) -> Result<(), LedgerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Query(diesel::result::Error::RollbackTransaction));
        }
        Ok(())
    }
}

fn add(state: &mut State, user_id: Uuid, field: UsageField, amount: i64) -> Result<User, LedgerError> {
    let user = state
        .users
        .iter_mut()
        .find(|u| u.id == user_id)
        .ok_or(LedgerError::UserNotFound(user_id))?;
    match field {
        UsageField::SecondBlocks => user.seconds_spent_blocks += amount,
        UsageField::CharacterBlocks => user.characters_spent_blocks += amount,
        UsageField::Tokens => user.tokens_spent += amount,
    }
    user.updated_at = Utc::now().naive_utc();
    Ok(user.clone())
}

fn new_user(external_id: i64) -> User {
    let now = Utc::now().naive_utc();
    User {
        id: Uuid::new_v4(),
        external_id,
        seconds_spent_blocks: 0,
        characters_spent_blocks: 0,
        tokens_spent: 0,
        created_at: now,
        updated_at: now,
    }
}

fn push_turns(state: &mut State, user_id: Uuid, turns: &[Turn]) {
    for turn in turns {
        let id = state.turns.len() as i64 + 1;
        state.turns.push(ConversationTurn {
            id,
            user_id,
            role: turn.role.as_str().to_string(),
            content: turn.text.clone(),
            created_at: Utc::now().naive_utc(),
        });
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn get_or_create_user(&self, external_id: i64) -> Result<User, LedgerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let existing = {
            let state = self.state.lock().unwrap();
            state.users.iter().find(|u| u.external_id == external_id).cloned()
        };
        if let Some(user) = existing {
            return Ok(user);
        }

        tokio::task::yield_now().await;

        // Re-check under the lock, as the unique constraint would.
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.iter().find(|u| u.external_id == external_id) {
            return Ok(user.clone());
        }
        let user = new_user(external_id);
        state.users.push(user.clone());
        Ok(user)
    }

    async fn admit_user(
        &self,
        external_id: i64,
        max_users: i64,
    ) -> Result<Option<User>, LedgerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.iter().find(|u| u.external_id == external_id) {
            return Ok(Some(user.clone()));
        }
        if state.users.len() as i64 >= max_users {
            return Ok(None);
        }
        let user = new_user(external_id);
        state.users.push(user.clone());
        Ok(Some(user))
    }

    async fn find_user(&self, external_id: i64) -> Result<Option<User>, LedgerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Ok(state.users.iter().find(|u| u.external_id == external_id).cloned())
    }

    async fn user(&self, user_id: Uuid) -> Result<User, LedgerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        state
            .users
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
            .ok_or(LedgerError::UserNotFound(user_id))
    }

    async fn count_users(&self) -> Result<i64, LedgerError> {
        Ok(self.state.lock().unwrap().users.len() as i64)
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        field: UsageField,
        amount: i64,
    ) -> Result<User, LedgerError> {
        check_amount(field, amount)?;
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        add(&mut state, user_id, field, amount)
    }

    async fn append_turns(&self, user_id: Uuid, turns: &[Turn]) -> Result<(), LedgerError> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        push_turns(&mut state, user_id, turns);
        Ok(())
    }

    async fn list_recent_turns(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, LedgerError> {
        let state = self.state.lock().unwrap();
        let mine: Vec<_> = state
            .turns
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        let skip = mine.len().saturating_sub(limit);
        Ok(mine.into_iter().skip(skip).collect())
    }

    async fn commit_chat_round(
        &self,
        user_id: Uuid,
        tokens: i64,
        prompt: &str,
        reply: &str,
    ) -> Result<User, LedgerError> {
        check_amount(UsageField::Tokens, tokens)?;
        self.check_writable()?;
        let mut state = self.state.lock().unwrap();
        let user = add(&mut state, user_id, UsageField::Tokens, tokens)?;
        push_turns(&mut state, user_id, &[Turn::user(prompt), Turn::assistant(reply)]);
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_user() {
        let ledger = Arc::new(MemoryLedger::new());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.get_or_create_user(77).await.unwrap().id })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        assert_eq!(ledger.user_count(), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[tokio::test]
    async fn recent_turns_are_the_last_n_in_order() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user(1, 0, 0, 0);
        for i in 0..6 {
            ledger
                .commit_chat_round(user.id, 1, &format!("q{}", i), &format!("a{}", i))
                .await
                .unwrap();
        }

        let recent = ledger.list_recent_turns(user.id, 3).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(texts, vec!["a4", "q5", "a5"]);
        assert_eq!(ledger.snapshot(user.id).tokens_spent, 6);
    }

    #[tokio::test]
    async fn appended_turns_keep_their_order() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user(1, 0, 0, 0);
        let other = ledger.insert_user(2, 0, 0, 0);

        ledger
            .append_turns(user.id, &[Turn::user("first"), Turn::assistant("second")])
            .await
            .unwrap();
        ledger.append_turns(other.id, &[Turn::user("elsewhere")]).await.unwrap();
        ledger.append_turns(user.id, &[Turn::user("third")]).await.unwrap();

        assert_eq!(
            ledger.turns(user.id),
            vec![Turn::user("first"), Turn::assistant("second"), Turn::user("third")]
        );
        assert_eq!(ledger.turns(other.id), vec![Turn::user("elsewhere")]);
    }

    #[tokio::test]
    async fn failed_append_stores_nothing() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user(1, 0, 0, 0);
        ledger.fail_writes();

        assert!(ledger
            .append_turns(user.id, &[Turn::user("q"), Turn::assistant("a")])
            .await
            .is_err());
        assert!(ledger.turns(user.id).is_empty());
    }

    #[tokio::test]
    async fn concurrent_newcomers_never_overshoot_the_cap() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.insert_user(1, 0, 0, 0);

        let tasks: Vec<_> = (100..116)
            .map(|external_id| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.admit_user(external_id, 3).await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
        assert_eq!(ledger.user_count(), 3);
        assert!(ledger.admit_user(1, 3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn negative_increment_is_refused() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user(1, 5, 0, 0);
        let err = ledger
            .increment_usage(user.id, UsageField::SecondBlocks, -1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NegativeAmount { .. }));
        assert_eq!(ledger.snapshot(user.id).seconds_spent_blocks, 5);
    }
}
