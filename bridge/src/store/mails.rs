use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::addresses::upsert_user;
use super::cards::resolve_card;
use super::*;
use crate::address::{normalize_address, normalize_message_id};
use crate::subject;

impl Store {
    /// Latest mail matching `message_id`, or the normalized `subject` from
    /// `sender`, together with its card and that card's inbound address.
    ///
    /// Expiry and recipient checks are left to the caller.
    pub fn find_thread_candidate(
        &self,
        message_id: &str,
        raw_subject: &str,
        sender: &str,
    ) -> Result<Option<ThreadCandidate>, StoreError> {
        let message_id = normalize_message_id(message_id);
        let thread_subject = subject::normalize(raw_subject);
        let sender = normalize_address(sender);
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT c.short_link, c.id, c.address, m.date
                     FROM mails m
                     JOIN card_mails cm ON cm.mail_id = m.id
                     JOIN cards c ON c.short_link = cm.card_short_link
                     WHERE (?1 <> '' AND m.id = ?1)
                        OR (m.thread_subject = ?2 AND m.sender = ?3)
                     ORDER BY m.date DESC
                     LIMIT 1",
                    params![message_id, thread_subject, sender],
                    |row| {
                        Ok(ThreadCandidate {
                            card: CardRef {
                                short_link: row.get(0)?,
                                id: row.get(1)?,
                            },
                            address: row.get(2)?,
                            last: from_millis(row.get(3)?),
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Record a received mail on a card.
    ///
    /// A second delivery of the same message id only corrects the sender. An
    /// empty `comment_id` keeps whatever comment the mail already produced.
    #[allow(clippy::too_many_arguments)]
    pub fn record_received(
        &self,
        card_id: &str,
        card_short_link: &str,
        message_id: &str,
        raw_subject: &str,
        sender: &str,
        comment_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let message_id = normalize_message_id(message_id);
        if message_id.is_empty() {
            return Err(StoreError::Invalid("empty message id".into()));
        }
        let sender = normalize_address(sender);
        let thread_subject = subject::normalize(raw_subject);
        self.with_transaction(|conn| {
            let updated = conn.execute(
                "UPDATE cards SET id = ?2 WHERE short_link = ?1",
                params![card_short_link, card_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("card {card_short_link}")));
            }
            conn.execute(
                "INSERT INTO mails (id, subject, thread_subject, sender, date)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET sender = excluded.sender",
                params![message_id, raw_subject.trim(), thread_subject, sender, to_millis(at)],
            )?;
            conn.execute(
                "INSERT INTO card_mails (card_short_link, mail_id, comment_id)
                 VALUES (?1, ?2, NULLIF(?3, ''))
                 ON CONFLICT(card_short_link, mail_id) DO UPDATE
                 SET comment_id = COALESCE(excluded.comment_id, card_mails.comment_id)",
                params![card_short_link, message_id, comment_id],
            )?;
            Ok(())
        })
    }

    /// Record a mail sent from a card comment, authored by `author_id`.
    /// The author becomes a member of the card's board.
    pub fn record_sent(
        &self,
        card: &str,
        author_id: &str,
        message_id: &str,
        comment_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let message_id = normalize_message_id(message_id);
        if message_id.is_empty() || comment_id.is_empty() {
            return Err(StoreError::Invalid("sent mail needs message and comment ids".into()));
        }
        self.with_transaction(|conn| {
            let card = resolve_card(conn, card)?
                .ok_or_else(|| StoreError::NotFound(format!("card {card}")))?;
            let board: String = conn.query_row(
                "SELECT l.board_short_link FROM cards c
                 JOIN addresses a ON a.address = c.address
                 JOIN lists l ON l.id = a.list_id
                 WHERE c.short_link = ?1",
                [&card.short_link],
                |row| row.get(0),
            )?;

            upsert_user(conn, author_id)?;
            conn.execute(
                "INSERT INTO mails (id, date) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
                params![message_id, to_millis(at)],
            )?;
            conn.execute(
                "INSERT INTO board_members (board_short_link, user_id) VALUES (?1, ?2)
                 ON CONFLICT(board_short_link, user_id) DO NOTHING",
                params![board, author_id],
            )?;
            conn.execute(
                "INSERT INTO card_mails (card_short_link, mail_id, comment_id)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(card_short_link, mail_id) DO UPDATE SET comment_id = excluded.comment_id",
                params![card.short_link, message_id, comment_id],
            )?;
            conn.execute(
                "INSERT INTO mail_authors (user_id, mail_id) VALUES (?1, ?2)
                 ON CONFLICT(user_id, mail_id) DO NOTHING",
                params![author_id, message_id],
            )?;
            Ok(())
        })
    }

    /// Mail produced by (or producing) a board comment.
    pub fn mail_for_comment(&self, comment_id: &str) -> Result<Option<Mail>, StoreError> {
        if comment_id.is_empty() {
            return Ok(None);
        }
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT m.id, m.date, m.subject, m.sender, cm.comment_id
                     FROM card_mails cm JOIN mails m ON m.id = cm.mail_id
                     WHERE cm.comment_id = ?1
                     LIMIT 1",
                    [comment_id],
                    |row| {
                        Ok(Mail {
                            id: row.get(0)?,
                            date: from_millis(row.get(1)?),
                            subject: row.get(2)?,
                            sender: row.get(3)?,
                            comment_id: row.get(4)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn card_has_mail(&self, card: &str, message_id: &str) -> Result<bool, StoreError> {
        let message_id = normalize_message_id(message_id);
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS (
                    SELECT 1 FROM card_mails cm
                    JOIN cards c ON c.short_link = cm.card_short_link
                    WHERE (c.short_link = ?1 OR c.id = ?1) AND cm.mail_id = ?2
                 )",
                params![card, message_id],
                |row| row.get(0),
            )?)
        })
    }

    /// Parameters for answering on a card, or None when the card holds no
    /// received mail to answer.
    pub fn thread_params(&self, card: &str) -> Result<Option<ThreadParams>, StoreError> {
        self.with_conn(|conn| {
            let Some(card) = resolve_card(conn, card)? else {
                return Ok(None);
            };
            let last: Option<(String, String)> = conn
                .query_row(
                    "SELECT m.id, m.subject FROM card_mails cm JOIN mails m ON m.id = cm.mail_id
                     WHERE cm.card_short_link = ?1 AND m.subject IS NOT NULL
                     ORDER BY m.date DESC, m.rowid DESC
                     LIMIT 1",
                    [&card.short_link],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((last_mail_id, last_mail_subject)) = last else {
                return Ok(None);
            };

            let recipients: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT m.sender FROM card_mails cm JOIN mails m ON m.id = cm.mail_id
                     WHERE cm.card_short_link = ?1 AND m.sender IS NOT NULL
                     ORDER BY m.sender",
                )?;
                let rows = stmt.query_map([&card.short_link], |row| row.get(0))?;
                let mut senders = Vec::new();
                for row in rows {
                    senders.push(row?);
                }
                senders
            };

            let params = conn.query_row(
                "SELECT a.address, a.sends_through, a.reply_to, a.sender_name,
                        a.signature_template, a.add_replier,
                        c.override_subject, c.override_recipients
                 FROM cards c JOIN addresses a ON a.address = c.address
                 WHERE c.short_link = ?1",
                [&card.short_link],
                |row| {
                    let override_subject: Option<String> = row.get(6)?;
                    let override_recipients: Option<String> = row.get(7)?;
                    Ok(ThreadParams {
                        card_short_link: card.short_link.clone(),
                        card_id: card.id.clone(),
                        last_mail_id: last_mail_id.clone(),
                        last_mail_subject: override_subject
                            .filter(|s| !s.is_empty())
                            .unwrap_or_else(|| last_mail_subject.clone()),
                        inbound: row.get(0)?,
                        outbound: row.get(1)?,
                        recipients: override_recipients
                            .map(|r| {
                                r.split(',')
                                    .filter(|s| !s.is_empty())
                                    .map(str::to_string)
                                    .collect::<Vec<_>>()
                            })
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| recipients.clone()),
                        reply_to: row.get(2)?,
                        sender_name: row.get(3)?,
                        signature_template: row.get(4)?,
                        add_replier: row.get(5)?,
                    })
                },
            )?;
            Ok(Some(params))
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::super::test_utils::*;
    use super::*;

    fn store_with_card() -> Store {
        let store = store_with_address();
        store.save_card("a@x.com", "sl1", "id1", "wh1").unwrap();
        store
    }

    #[test]
    fn test_candidate_by_message_id() {
        let store = store_with_card();
        store
            .record_received("id1", "sl1", "<m1@y.com>", "Help", "c@y.com", "cm1", Utc::now())
            .unwrap();
        let found = store
            .find_thread_candidate("m1@y.com", "unrelated", "other@z.com")
            .unwrap()
            .unwrap();
        assert_eq!(found.card.short_link, "sl1");
        assert_eq!(found.address, "a@x.com");
    }

    #[test]
    fn test_candidate_by_subject_and_sender() {
        let store = store_with_card();
        store
            .record_received("id1", "sl1", "<m1@y.com>", "Help", "c@y.com", "cm1", Utc::now())
            .unwrap();
        assert!(store
            .find_thread_candidate("", "Re: FWD: help", "C@Y.com")
            .unwrap()
            .is_none());
        let found = store
            .find_thread_candidate("", "Re: FWD: Help", "C@Y.com")
            .unwrap();
        assert!(found.is_some());
        assert!(store
            .find_thread_candidate("<other@y.com>", "Re: Help", "d@y.com")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_candidate_picks_latest_mail() {
        let store = store_with_card();
        store.save_card("a@x.com", "sl2", "id2", "wh2").unwrap();
        let now = Utc::now();
        store
            .record_received("id1", "sl1", "<old>", "Help", "c@y.com", "cm1", now - Duration::days(3))
            .unwrap();
        store
            .record_received("id2", "sl2", "<new>", "Help", "c@y.com", "cm2", now)
            .unwrap();
        let found = store
            .find_thread_candidate("", "Help", "c@y.com")
            .unwrap()
            .unwrap();
        assert_eq!(found.card.short_link, "sl2");
    }

    #[test]
    fn test_duplicate_delivery_keeps_one_mail_and_updates_sender() {
        let store = store_with_card();
        let first = Utc::now() - Duration::hours(1);
        store
            .record_received("id1", "sl1", "<m1>", "Help", "c@y.com", "cm1", first)
            .unwrap();
        store
            .record_received("id1", "sl1", "m1", "Help", "alias@y.com", "", Utc::now())
            .unwrap();

        let mail = store.mail_for_comment("cm1").unwrap().unwrap();
        assert_eq!(mail.id, "m1");
        assert_eq!(mail.sender.as_deref(), Some("alias@y.com"));
        assert_eq!(mail.date.timestamp_millis(), first.timestamp_millis());

        let count: i64 = store
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM mails", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_record_received_requires_card() {
        let store = store_with_address();
        assert!(matches!(
            store.record_received("id9", "sl9", "<m>", "s", "c@y.com", "cm", Utc::now()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_sent_mail_is_found_by_comment() {
        let store = store_with_card();
        let now = Utc::now();
        assert!(store.mail_for_comment("cm9").unwrap().is_none());
        store.record_sent("id1", "u5", "<sent@relay>", "cm9", now).unwrap();
        store.record_sent("sl1", "u5", "<sent@relay>", "cm9", now).unwrap();

        let mail = store.mail_for_comment("cm9").unwrap().unwrap();
        assert_eq!(mail.id, "sent@relay");
        assert_eq!(mail.subject, None);
        assert!(store.card_has_mail("sl1", "sent@relay").unwrap());
        assert!(store.mail_for_comment("").unwrap().is_none());
    }

    #[test]
    fn test_reply_to_sent_mail_resolves_thread() {
        let store = store_with_card();
        store
            .record_sent("sl1", "u5", "<sent@relay>", "cm9", Utc::now())
            .unwrap();
        let found = store
            .find_thread_candidate("<sent@relay>", "Re: whatever", "c@y.com")
            .unwrap()
            .unwrap();
        assert_eq!(found.card.id, "id1");
    }

    #[test]
    fn test_thread_params() {
        let store = store_with_card();
        store
            .set_outbound("u1", "a@x.com", Some("help@biz.com"))
            .unwrap();
        let now = Utc::now();
        store
            .record_received("id1", "sl1", "<m1>", "Help", "c@y.com", "cm1", now - Duration::minutes(5))
            .unwrap();
        store
            .record_received("id1", "sl1", "<m2>", "Re: Help", "d@y.com", "cm2", now)
            .unwrap();
        store.record_sent("sl1", "u5", "<s1>", "cm3", now).unwrap();

        let params = store.thread_params("sl1").unwrap().unwrap();
        assert_eq!(params.card_id, "id1");
        assert_eq!(params.last_mail_id, "m2");
        assert_eq!(params.last_mail_subject, "Re: Help");
        assert_eq!(params.inbound, "a@x.com");
        assert_eq!(params.outbound, "help@biz.com");
        assert_eq!(params.recipients, vec!["c@y.com", "d@y.com"]);

        store
            .set_thread_override("id1", "New subject", &["E@Z.com".to_string()])
            .unwrap();
        let params = store.thread_params("id1").unwrap().unwrap();
        assert_eq!(params.last_mail_subject, "New subject");
        assert_eq!(params.recipients, vec!["e@z.com"]);
    }

    #[test]
    fn test_thread_params_without_received_mail() {
        let store = store_with_card();
        assert_eq!(store.thread_params("sl1").unwrap(), None);
        store.record_sent("sl1", "u5", "<s1>", "cm3", Utc::now()).unwrap();
        assert_eq!(store.thread_params("sl1").unwrap(), None);
        assert_eq!(store.thread_params("missing").unwrap(), None);
    }
}
