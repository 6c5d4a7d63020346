use chrono::NaiveDateTime;
use diesel::prelude::*;
use shared::{Role, UnknownRole, UsageStats};
use uuid::Uuid;

use crate::config::Quotas;

/// Per-user quota ledger row
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct User {
    pub id: Uuid,
    pub external_id: i64,
    pub seconds_spent_blocks: i64,
    pub characters_spent_blocks: i64,
    pub tokens_spent: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl User {
    pub fn stats(&self, quotas: &Quotas) -> UsageStats {
        UsageStats {
            seconds_spent_blocks: self.seconds_spent_blocks,
            seconds_limit: quotas.user_second_blocks,
            characters_spent_blocks: self.characters_spent_blocks,
            characters_limit: quotas.user_character_blocks,
            tokens_spent: self.tokens_spent,
            tokens_limit: quotas.user_tokens,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::users)]
pub struct NewUser {
    pub external_id: i64,
}

/// One of the three cumulative spend counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageField {
    SecondBlocks,
    CharacterBlocks,
    Tokens,
}

impl UsageField {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageField::SecondBlocks => "seconds_spent_blocks",
            UsageField::CharacterBlocks => "characters_spent_blocks",
            UsageField::Tokens => "tokens_spent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable)]
#[diesel(table_name = crate::schema::conversation_turns)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ConversationTurn {
    pub id: i64,
    pub user_id: Uuid,
    pub role: String,
    pub content: String,
    pub created_at: NaiveDateTime,
}

impl ConversationTurn {
    pub fn to_turn(&self) -> Result<Turn, UnknownRole> {
        Ok(Turn {
            role: self.role.parse()?,
            text: self.content.clone(),
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::conversation_turns)]
pub struct NewConversationTurn<'a> {
    pub user_id: Uuid,
    pub role: &'a str,
    pub content: &'a str,
}

/// A message exchanged with the chat backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}
