use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::*;
use crate::address::normalize_address;

/// Resolve a card given either its id or its short link.
pub(super) fn resolve_card(conn: &Connection, card: &str) -> Result<Option<CardRef>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT short_link, id FROM cards WHERE short_link = ?1 OR id = ?1 LIMIT 1",
            [card],
            |row| {
                Ok(CardRef {
                    short_link: row.get(0)?,
                    id: row.get(1)?,
                })
            },
        )
        .optional()?)
}

impl Store {
    /// Link a freshly created board card to the inbound address that spawned it.
    ///
    /// Saving the same card again only refreshes its webhook id; the linked
    /// address never changes after creation.
    pub fn save_card(
        &self,
        address: &str,
        short_link: &str,
        card_id: &str,
        webhook_id: &str,
    ) -> Result<(), StoreError> {
        if short_link.is_empty() || card_id.is_empty() || webhook_id.is_empty() {
            return Err(StoreError::Invalid(format!(
                "card {short_link:?} id {card_id:?} webhook {webhook_id:?}"
            )));
        }
        let address = normalize_address(address);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cards (short_link, id, address, webhook_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(short_link) DO UPDATE SET webhook_id = excluded.webhook_id",
                params![short_link, card_id, address, webhook_id, to_millis(Utc::now())],
            )?;
            Ok(())
        })
    }

    /// Delete a card with the mails only it contained. Mails shared with
    /// another card stay. Returns false when the card was unknown.
    pub fn remove_card(&self, card: &str) -> Result<bool, StoreError> {
        self.with_transaction(|conn| {
            let Some(card) = resolve_card(conn, card)? else {
                return Ok(false);
            };
            let mail_ids: Vec<String> = {
                let mut stmt =
                    conn.prepare("SELECT mail_id FROM card_mails WHERE card_short_link = ?1")?;
                let rows = stmt.query_map([&card.short_link], |row| row.get(0))?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(row?);
                }
                ids
            };
            conn.execute("DELETE FROM cards WHERE short_link = ?1", [&card.short_link])?;
            delete_orphan_mails(conn, &mail_ids)?;
            Ok(true)
        })
    }

    pub fn card_ref(&self, card: &str) -> Result<Option<CardRef>, StoreError> {
        self.with_conn(|conn| resolve_card(conn, card))
    }

    /// Inbound address a card is linked to.
    pub fn card_address(&self, card: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT address FROM cards WHERE short_link = ?1 OR id = ?1 LIMIT 1",
                    [card],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Override the outbound subject and recipients of a card's thread.
    pub fn set_thread_override(
        &self,
        card: &str,
        subject: &str,
        recipients: &[String],
    ) -> Result<(), StoreError> {
        let recipients: Vec<String> = recipients.iter().map(|r| normalize_address(r)).collect();
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE cards SET override_subject = ?2, override_recipients = ?3
                 WHERE short_link = ?1 OR id = ?1",
                params![card, subject.trim(), recipients.join(",")],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("card {card}")));
            }
            Ok(())
        })
    }
}
