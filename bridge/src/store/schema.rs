use rusqlite::Connection;

use super::StoreError;

/// Relational rendering of the correspondence graph.
///
/// - `addresses` carries the CONTROLS (`user_id`), TARGETS (`list_id`) and
///   SENDS_THROUGH (`sends_through`, equal to `address` when self-sending)
///   edges as columns, so each can only ever point at one row.
/// - `domains.owner_id` is the exclusive User OWNS Domain edge.
/// - `mails.thread_subject` is the subject with reply/forward markers
///   stripped; only received mail has one.
/// - `card_mails` is Card CONTAINS Mail; one mail may sit on several cards
///   when two accounts received the same message.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS boards (
    short_link  TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS lists (
    id                TEXT PRIMARY KEY,
    board_short_link  TEXT NOT NULL REFERENCES boards(short_link)
);

CREATE TABLE IF NOT EXISTS board_members (
    board_short_link  TEXT NOT NULL REFERENCES boards(short_link),
    user_id           TEXT NOT NULL REFERENCES users(id),
    admin             INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (board_short_link, user_id)
);

CREATE TABLE IF NOT EXISTS domains (
    host      TEXT PRIMARY KEY,
    owner_id  TEXT REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS external_addresses (
    address      TEXT PRIMARY KEY,
    domain_host  TEXT NOT NULL REFERENCES domains(host) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS addresses (
    address             TEXT PRIMARY KEY,
    created_at          INTEGER NOT NULL,
    user_id             TEXT NOT NULL REFERENCES users(id),
    billing_profile_id  TEXT,
    list_id             TEXT NOT NULL REFERENCES lists(id),
    sends_through       TEXT NOT NULL,
    route_id            TEXT,
    reply_to            TEXT,
    sender_name         TEXT,
    add_replier         INTEGER NOT NULL DEFAULT 0,
    message_in_desc     INTEGER NOT NULL DEFAULT 0,
    move_to_top         INTEGER NOT NULL DEFAULT 0,
    signature_template  TEXT
);
CREATE INDEX IF NOT EXISTS addresses_user ON addresses(user_id);
CREATE INDEX IF NOT EXISTS addresses_sends_through ON addresses(sends_through);

CREATE TABLE IF NOT EXISTS cards (
    short_link           TEXT PRIMARY KEY,
    id                   TEXT NOT NULL UNIQUE,
    address              TEXT NOT NULL REFERENCES addresses(address) ON DELETE CASCADE,
    webhook_id           TEXT NOT NULL,
    created_at           INTEGER NOT NULL,
    override_subject     TEXT,
    override_recipients  TEXT
);

CREATE TABLE IF NOT EXISTS mails (
    id              TEXT PRIMARY KEY,
    subject         TEXT,
    thread_subject  TEXT,
    sender          TEXT,
    date            INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS mails_thread ON mails(thread_subject, sender);

CREATE TABLE IF NOT EXISTS card_mails (
    card_short_link  TEXT NOT NULL REFERENCES cards(short_link) ON DELETE CASCADE,
    mail_id          TEXT NOT NULL REFERENCES mails(id) ON DELETE CASCADE,
    comment_id       TEXT,
    PRIMARY KEY (card_short_link, mail_id)
);
CREATE INDEX IF NOT EXISTS card_mails_mail ON card_mails(mail_id);
CREATE INDEX IF NOT EXISTS card_mails_comment ON card_mails(comment_id);

CREATE TABLE IF NOT EXISTS mail_authors (
    user_id  TEXT NOT NULL REFERENCES users(id),
    mail_id  TEXT NOT NULL REFERENCES mails(id) ON DELETE CASCADE,
    PRIMARY KEY (user_id, mail_id)
);
";

pub(super) fn apply(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
