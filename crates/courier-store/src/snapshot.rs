//! Snapshot persistence.
//!
//! A snapshot is written as a full replacement inside one transaction, so a
//! crash mid-save leaves the previous snapshot intact.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use courier_shared::{ChatId, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Chat, Message, MessageStatus, Peer, Snapshot, UserProfile};

const LAST_SYNC_KEY: &str = "last_sync";

impl Database {
    /// Replace the stored snapshot with `snapshot`.
    pub fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        // Seal before the transaction borrows the connection.
        let sealed_messages = snapshot
            .messages
            .iter()
            .map(|m| self.seal_text(&m.content))
            .collect::<Result<Vec<_>>>()?;
        let sealed_drafts = snapshot
            .drafts
            .iter()
            .map(|(chat_id, text)| Ok((chat_id, self.seal_text(text)?)))
            .collect::<Result<Vec<_>>>()?;

        let tx = self.conn_mut().transaction()?;
        tx.execute_batch(
            "DELETE FROM drafts;
             DELETE FROM messages;
             DELETE FROM chats;
             DELETE FROM peers;
             DELETE FROM blocked;
             DELETE FROM profile;
             DELETE FROM meta;",
        )?;

        if let Some(profile) = &snapshot.profile {
            tx.execute(
                "INSERT INTO profile (id, user_id, display_name) VALUES (1, ?1, ?2)",
                params![profile.user_id.to_hex(), profile.display_name],
            )?;
        }

        for chat in &snapshot.chats {
            let participants: Vec<String> = chat.participants.iter().map(UserId::to_hex).collect();
            tx.execute(
                "INSERT INTO chats (id, participants, last_message, last_activity, unread_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    chat.id.as_str(),
                    serde_json::to_string(&participants)?,
                    chat.last_message.as_ref().map(MessageId::as_str),
                    fmt_ts(&chat.last_activity),
                    chat.unread_count,
                    fmt_ts(&chat.created_at),
                ],
            )?;
        }

        for (message, content) in snapshot.messages.iter().zip(&sealed_messages) {
            tx.execute(
                "INSERT INTO messages (id, chat_id, sender, recipient, content, ciphertext, nonce,
                                       timestamp, status, message_type, reply_to, reactions,
                                       edited, outgoing)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    message.id.as_str(),
                    message.chat_id.as_str(),
                    message.sender.to_hex(),
                    message.recipient.to_hex(),
                    content,
                    message.ciphertext,
                    message.nonce,
                    fmt_ts(&message.timestamp),
                    message.status.as_str(),
                    enum_to_sql(&message.message_type)?,
                    message.reply_to.as_ref().map(MessageId::as_str),
                    serde_json::to_string(&message.reactions)?,
                    message.edited,
                    message.outgoing,
                ],
            )?;
        }

        for peer in &snapshot.peers {
            tx.execute(
                "INSERT INTO peers (id, display_name, nickname, presence, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    peer.id.to_hex(),
                    peer.display_name,
                    peer.nickname,
                    enum_to_sql(&peer.presence)?,
                    peer.last_seen.as_ref().map(fmt_ts),
                ],
            )?;
        }

        for (chat_id, content) in &sealed_drafts {
            tx.execute(
                "INSERT INTO drafts (chat_id, content) VALUES (?1, ?2)",
                params![chat_id.as_str(), content],
            )?;
        }

        for user in &snapshot.blocked {
            tx.execute(
                "INSERT INTO blocked (user_id) VALUES (?1)",
                params![user.to_hex()],
            )?;
        }

        if let Some(last_sync) = &snapshot.last_sync {
            tx.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)",
                params![LAST_SYNC_KEY, fmt_ts(last_sync)],
            )?;
        }

        tx.commit()?;
        tracing::debug!(
            chats = snapshot.chats.len(),
            messages = snapshot.messages.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Load the stored snapshot. An empty database yields an empty snapshot.
    pub fn load_snapshot(&self) -> Result<Snapshot> {
        let conn = self.conn();

        let profile = conn
            .query_row(
                "SELECT user_id, display_name FROM profile WHERE id = 1",
                [],
                |row| {
                    Ok(UserProfile {
                        user_id: user_col(row, 0)?,
                        display_name: row.get(1)?,
                    })
                },
            )
            .optional()?;

        let mut stmt = conn.prepare(
            "SELECT id, participants, last_message, last_activity, unread_count, created_at
             FROM chats ORDER BY id",
        )?;
        let chats = stmt
            .query_map([], row_to_chat)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, chat_id, sender, recipient, content, ciphertext, nonce, timestamp,
                    status, message_type, reply_to, reactions, edited, outgoing
             FROM messages ORDER BY chat_id, timestamp, id",
        )?;
        let rows = stmt
            .query_map([], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut messages = Vec::with_capacity(rows.len());
        for (mut message, sealed) in rows {
            message.content = self.open_text(&sealed)?;
            messages.push(message);
        }

        let mut stmt = conn.prepare(
            "SELECT id, display_name, nickname, presence, last_seen FROM peers ORDER BY id",
        )?;
        let peers = stmt
            .query_map([], |row| {
                Ok(Peer {
                    id: user_col(row, 0)?,
                    display_name: row.get(1)?,
                    nickname: row.get(2)?,
                    presence: enum_col(row, 3)?,
                    last_seen: opt_ts_col(row, 4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare("SELECT chat_id, content FROM drafts")?;
        let sealed_drafts = stmt
            .query_map([], |row| {
                Ok((ChatId(row.get::<_, String>(0)?), row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut drafts = BTreeMap::new();
        for (chat_id, sealed) in sealed_drafts {
            drafts.insert(chat_id, self.open_text(&sealed)?);
        }

        let mut stmt = conn.prepare("SELECT user_id FROM blocked ORDER BY user_id")?;
        let blocked = stmt
            .query_map([], |row| user_col(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let last_sync = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![LAST_SYNC_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|s| parse_ts(&s))
            .transpose()?;

        Ok(Snapshot {
            profile,
            chats,
            messages,
            peers,
            drafts,
            blocked,
            last_sync,
        })
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so lexical order matches time order.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn enum_to_sql<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Corrupt(format!("expected string enum, got {other}"))),
    }
}

fn conversion_err(
    idx: usize,
    ty: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn user_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<UserId> {
    let hex: String = row.get(idx)?;
    UserId::from_hex(&hex).map_err(|e| conversion_err(idx, Type::Text, e))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, Type::Text, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_err(idx, Type::Text, e)),
        None => Ok(None),
    }
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, Type::Text, e))
}

fn enum_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_value(serde_json::Value::String(s))
        .map_err(|e| conversion_err(idx, Type::Text, e))
}

fn row_to_chat(row: &Row<'_>) -> rusqlite::Result<Chat> {
    let participants: Vec<String> = json_col(row, 1)?;
    let participants = participants
        .iter()
        .map(|hex| UserId::from_hex(hex))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| conversion_err(1, Type::Text, e))?;

    Ok(Chat {
        id: ChatId(row.get(0)?),
        participants,
        last_message: row.get::<_, Option<String>>(2)?.map(MessageId),
        last_activity: ts_col(row, 3)?,
        unread_count: row.get(4)?,
        created_at: ts_col(row, 5)?,
    })
}

/// Returns the message with empty content and the sealed content blob.
fn row_to_message(row: &Row<'_>) -> rusqlite::Result<(Message, Vec<u8>)> {
    let status: String = row.get(8)?;
    let status = MessageStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            Type::Text,
            format!("unknown message status {status:?}").into(),
        )
    })?;
    let reactions: BTreeMap<String, BTreeSet<UserId>> = json_col(row, 11)?;

    let message = Message {
        id: MessageId(row.get(0)?),
        chat_id: ChatId(row.get(1)?),
        sender: user_col(row, 2)?,
        recipient: user_col(row, 3)?,
        content: String::new(),
        ciphertext: row.get(5)?,
        nonce: row.get(6)?,
        timestamp: ts_col(row, 7)?,
        status,
        message_type: enum_col(row, 9)?,
        reply_to: row.get::<_, Option<String>>(10)?.map(MessageId),
        reactions,
        edited: row.get(12)?,
        outgoing: row.get(13)?,
    };
    Ok((message, row.get(4)?))
}
