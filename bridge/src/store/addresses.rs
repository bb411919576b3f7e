use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::*;
use crate::address::normalize_address;

const ADDRESS_COLUMNS: &str = "
    a.address, a.sends_through, a.user_id, a.list_id, l.board_short_link, a.created_at,
    d.host, a.route_id, a.billing_profile_id,
    a.reply_to, a.sender_name, a.add_replier, a.message_in_desc, a.move_to_top,
    a.signature_template
 FROM addresses a
 JOIN lists l ON l.id = a.list_id
 LEFT JOIN external_addresses e
        ON e.address = a.sends_through AND a.sends_through <> a.address
 LEFT JOIN domains d
        ON d.host = e.domain_host AND d.owner_id = a.user_id";

fn map_address_row(row: &Row<'_>) -> rusqlite::Result<Address> {
    Ok(Address {
        inbound: row.get(0)?,
        outbound: row.get(1)?,
        user_id: row.get(2)?,
        list_id: row.get(3)?,
        board_short_link: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        domain: row.get(6)?,
        route_id: row.get(7)?,
        billing_profile_id: row.get(8)?,
        settings: AddressSettings {
            reply_to: row.get(9)?,
            sender_name: row.get(10)?,
            add_replier: row.get(11)?,
            message_in_desc: row.get(12)?,
            move_to_top: row.get(13)?,
            signature_template: row.get(14)?,
        },
    })
}

pub(crate) fn upsert_user(conn: &Connection, user_id: &str) -> Result<bool, StoreError> {
    let inserted = conn.execute(
        "INSERT INTO users (id, created_at) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
        params![user_id, to_millis(Utc::now())],
    )?;
    Ok(inserted == 1)
}

impl Store {
    // =========================================================================
    // Users
    // =========================================================================

    /// Create the user if absent. Returns true when it was created.
    pub fn ensure_user(&self, user_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| upsert_user(conn, user_id))
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    /// Create an address or re-point it to another list.
    ///
    /// A new address sends through itself. Re-pointing replaces the TARGETS
    /// edge and keeps the sending configuration. An address controlled by
    /// another user is left untouched.
    pub fn set_address(
        &self,
        user_id: &str,
        board_short_link: &str,
        list_id: &str,
        address: &str,
    ) -> Result<SetAddressOutcome, StoreError> {
        let address = normalize_address(address);
        self.with_transaction(|conn| {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM addresses WHERE address = ?1",
                    [&address],
                    |row| row.get(0),
                )
                .optional()?;
            if matches!(&owner, Some(owner) if owner != user_id) {
                return Ok(SetAddressOutcome::Forbidden);
            }

            upsert_user(conn, user_id)?;
            conn.execute(
                "INSERT INTO boards (short_link) VALUES (?1) ON CONFLICT(short_link) DO NOTHING",
                [board_short_link],
            )?;
            conn.execute(
                "INSERT INTO lists (id, board_short_link) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET board_short_link = excluded.board_short_link",
                params![list_id, board_short_link],
            )?;
            conn.execute(
                "INSERT INTO board_members (board_short_link, user_id, admin) VALUES (?1, ?2, 1)
                 ON CONFLICT(board_short_link, user_id) DO UPDATE SET admin = 1",
                params![board_short_link, user_id],
            )?;

            if owner.is_none() {
                conn.execute(
                    "INSERT INTO addresses (address, created_at, user_id, list_id, sends_through)
                     VALUES (?1, ?2, ?3, ?4, ?1)",
                    params![address, to_millis(Utc::now()), user_id, list_id],
                )?;
                Ok(SetAddressOutcome::Created)
            } else {
                conn.execute(
                    "UPDATE addresses SET list_id = ?2 WHERE address = ?1",
                    params![address, list_id],
                )?;
                Ok(SetAddressOutcome::Repointed)
            }
        })
    }

    /// Fetch an address controlled by `user_id`.
    pub fn get_address(&self, user_id: &str, address: &str) -> Result<Option<Address>, StoreError> {
        let address = normalize_address(address);
        self.with_conn(|conn| {
            let sql = format!("SELECT {ADDRESS_COLUMNS} WHERE a.address = ?1 AND a.user_id = ?2");
            Ok(conn
                .query_row(&sql, params![address, user_id], map_address_row)
                .optional()?)
        })
    }

    /// All addresses a user controls, oldest first.
    pub fn list_addresses(&self, user_id: &str) -> Result<Vec<Address>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {ADDRESS_COLUMNS} WHERE a.user_id = ?1 ORDER BY a.created_at, a.address"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([user_id], map_address_row)?;
            let mut results = Vec::new();
            for row in rows {
                results.push(row?);
            }
            Ok(results)
        })
    }

    pub fn user_for_address(&self, address: &str) -> Result<Option<String>, StoreError> {
        let address = normalize_address(address);
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT user_id FROM addresses WHERE address = ?1",
                    [&address],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Destination list for new cards created from mail to `address`.
    pub fn target_list(&self, address: &str) -> Result<Option<String>, StoreError> {
        let address = normalize_address(address);
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT list_id FROM addresses WHERE address = ?1",
                    [&address],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set_address_settings(
        &self,
        address: &str,
        settings: &AddressSettings,
    ) -> Result<(), StoreError> {
        let address = normalize_address(address);
        let reply_to = settings.reply_to.as_deref().map(normalize_address);
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE addresses SET
                    reply_to = ?2,
                    sender_name = ?3,
                    add_replier = ?4,
                    message_in_desc = ?5,
                    move_to_top = ?6,
                    signature_template = ?7
                 WHERE address = ?1",
                params![
                    address,
                    reply_to,
                    settings.sender_name,
                    settings.add_replier,
                    settings.message_in_desc,
                    settings.move_to_top,
                    settings.signature_template,
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("address {address}")));
            }
            Ok(())
        })
    }

    /// Settings that shape how inbound mail lands on the board.
    pub fn receiving_settings(&self, address: &str) -> Result<Option<AddressSettings>, StoreError> {
        let address = normalize_address(address);
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT reply_to, sender_name, add_replier, message_in_desc, move_to_top,
                            signature_template
                     FROM addresses WHERE address = ?1",
                    [&address],
                    |row| {
                        Ok(AddressSettings {
                            reply_to: row.get(0)?,
                            sender_name: row.get(1)?,
                            add_replier: row.get(2)?,
                            message_in_desc: row.get(3)?,
                            move_to_top: row.get(4)?,
                            signature_template: row.get(5)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    // =========================================================================
    // Billing profile (CONTROLS edge attribute)
    // =========================================================================

    pub fn save_billing_profile(
        &self,
        user_id: &str,
        address: &str,
        profile_id: &str,
    ) -> Result<(), StoreError> {
        let address = normalize_address(address);
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE addresses SET billing_profile_id = ?3 WHERE address = ?1 AND user_id = ?2",
                params![address, user_id, profile_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("address {address}")));
            }
            Ok(())
        })
    }

    pub fn clear_billing_profile(&self, address: &str) -> Result<(), StoreError> {
        let address = normalize_address(address);
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE addresses SET billing_profile_id = NULL WHERE address = ?1",
                [&address],
            )?;
            Ok(())
        })
    }

    /// Delete an address with its cards and the mails only those cards held.
    /// Returns false when the address did not exist.
    pub fn delete_address(&self, address: &str) -> Result<bool, StoreError> {
        let address = normalize_address(address);
        self.with_transaction(|conn| {
            let mail_ids: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT cm.mail_id FROM card_mails cm
                     JOIN cards c ON c.short_link = cm.card_short_link
                     WHERE c.address = ?1",
                )?;
                let rows = stmt.query_map([&address], |row| row.get(0))?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(row?);
                }
                ids
            };
            let deleted = conn.execute("DELETE FROM addresses WHERE address = ?1", [&address])?;
            delete_orphan_mails(conn, &mail_ids)?;
            Ok(deleted == 1)
        })
    }
}
