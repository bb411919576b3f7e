use rusqlite::{params, Connection, OptionalExtension};

use super::*;
use crate::address::{domain_of, normalize_address};

/// Current outbound binding of `address`, read inside the caller's transaction.
fn read_binding(
    conn: &Connection,
    address: &str,
    sends_through: &str,
    route_id: Option<String>,
) -> Result<Binding, StoreError> {
    if sends_through == address {
        return Ok(Binding::SelfSending);
    }
    let domain: Option<String> = conn
        .query_row(
            "SELECT domain_host FROM external_addresses WHERE address = ?1",
            [sends_through],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match domain {
        Some(domain) => Binding::Delegated {
            outbound: sends_through.to_string(),
            domain,
            route_id,
        },
        // dangling edge; treat as self-sending so it gets rewritten
        None => Binding::SelfSending,
    })
}

/// Drop an external address nobody sends through any more.
fn forget_external_if_unused(conn: &Connection, binding: &Binding) -> Result<(), StoreError> {
    if let Some(outbound) = binding.outbound() {
        conn.execute(
            "DELETE FROM external_addresses
             WHERE address = ?1
               AND NOT EXISTS (SELECT 1 FROM addresses WHERE sends_through = ?1)",
            [outbound],
        )?;
    }
    Ok(())
}

fn send_through_self(conn: &Connection, address: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE addresses SET sends_through = address, route_id = NULL WHERE address = ?1",
        [address],
    )?;
    Ok(())
}

impl Store {
    /// Re-point the outbound identity of `address`.
    ///
    /// `None` reverts to self-sending. Delegating to a domain owned by another
    /// user leaves the address self-sending and reports the owner in
    /// `denied_owner`. Callers decide beforehand whether `outbound` is
    /// acceptable at all (same domain as the inbound address, malformed).
    ///
    /// The previous binding is returned so the caller can run the release
    /// check once the old edge is gone.
    pub fn set_outbound(
        &self,
        user_id: &str,
        address: &str,
        outbound: Option<&str>,
    ) -> Result<OutboundChange, StoreError> {
        let address = normalize_address(address);
        let target = outbound
            .map(normalize_address)
            .filter(|o| !o.is_empty() && *o != address);

        self.with_transaction(|conn| {
            let row: Option<(String, String, Option<String>)> = conn
                .query_row(
                    "SELECT user_id, sends_through, route_id FROM addresses WHERE address = ?1",
                    [&address],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let (owner, sends_through, route_id) =
                row.ok_or_else(|| StoreError::NotFound(format!("address {address}")))?;
            if owner != user_id {
                return Err(StoreError::Forbidden { address });
            }
            let previous = read_binding(conn, &address, &sends_through, route_id)?;

            let Some(target) = target else {
                send_through_self(conn, &address)?;
                forget_external_if_unused(conn, &previous)?;
                return Ok(OutboundChange {
                    previous,
                    applied: Binding::SelfSending,
                    denied_owner: None,
                });
            };

            if previous.outbound() == Some(target.as_str()) {
                return Ok(OutboundChange {
                    applied: previous.clone(),
                    previous,
                    denied_owner: None,
                });
            }

            let domain = domain_of(&target)
                .ok_or_else(|| StoreError::Invalid(format!("outbound address {target}")))?;

            let domain_owner: Option<String> = conn
                .query_row(
                    "SELECT owner_id FROM domains WHERE host = ?1",
                    [&domain],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            if let Some(other) = domain_owner.filter(|o| o != user_id) {
                send_through_self(conn, &address)?;
                forget_external_if_unused(conn, &previous)?;
                return Ok(OutboundChange {
                    previous,
                    applied: Binding::SelfSending,
                    denied_owner: Some(other),
                });
            }

            conn.execute(
                "INSERT INTO domains (host, owner_id) VALUES (?1, ?2)
                 ON CONFLICT(host) DO UPDATE SET owner_id = excluded.owner_id",
                params![domain, user_id],
            )?;
            conn.execute(
                "INSERT INTO external_addresses (address, domain_host) VALUES (?1, ?2)
                 ON CONFLICT(address) DO NOTHING",
                params![target, domain],
            )?;
            conn.execute(
                "UPDATE addresses SET sends_through = ?2, route_id = NULL WHERE address = ?1",
                params![address, target],
            )?;
            forget_external_if_unused(conn, &previous)?;

            Ok(OutboundChange {
                previous,
                applied: Binding::Delegated {
                    outbound: target,
                    domain,
                    route_id: None,
                },
                denied_owner: None,
            })
        })
    }

    /// Record the relay route id on the edge from `address` to `outbound`.
    ///
    /// Each delegating address owns its own route, even when several send
    /// through the same outbound address.
    pub fn save_route_id(
        &self,
        address: &str,
        outbound: &str,
        route_id: &str,
    ) -> Result<(), StoreError> {
        let address = normalize_address(address);
        let outbound = normalize_address(outbound);
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE addresses SET route_id = ?3
                 WHERE address = ?1 AND sends_through = ?2 AND sends_through <> address",
                params![address, outbound, route_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!(
                    "{address} sending through {outbound}"
                )));
            }
            Ok(())
        })
    }

    /// External addresses of `domain` that at least one inbound address still
    /// sends through.
    pub fn addresses_on_domain(&self, domain: &str) -> Result<Vec<String>, StoreError> {
        let domain = normalize_address(domain);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT e.address FROM external_addresses e
                 JOIN addresses a ON a.sends_through = e.address
                 WHERE e.domain_host = ?1
                 ORDER BY e.address",
            )?;
            let rows = stmt.query_map([&domain], |row| row.get(0))?;
            let mut results = Vec::new();
            for row in rows {
                results.push(row?);
            }
            Ok(results)
        })
    }

    /// Clear the ownership of `domain` when nothing sends through it any more.
    ///
    /// Must run after the edge that stopped using the domain was removed.
    /// Returns true when ownership was cleared.
    pub fn release_domain_if_unreferenced(&self, domain: &str) -> Result<bool, StoreError> {
        let domain = normalize_address(domain);
        self.with_transaction(|conn| {
            let in_use: bool = conn.query_row(
                "SELECT EXISTS (
                    SELECT 1 FROM external_addresses e
                    JOIN addresses a ON a.sends_through = e.address
                    WHERE e.domain_host = ?1
                 )",
                [&domain],
                |row| row.get(0),
            )?;
            if in_use {
                return Ok(false);
            }
            conn.execute(
                "DELETE FROM external_addresses WHERE domain_host = ?1",
                [&domain],
            )?;
            let released = conn.execute(
                "UPDATE domains SET owner_id = NULL WHERE host = ?1 AND owner_id IS NOT NULL",
                [&domain],
            )?;
            Ok(released == 1)
        })
    }

    pub fn domain_owner(&self, domain: &str) -> Result<Option<String>, StoreError> {
        let domain = normalize_address(domain);
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT owner_id FROM domains WHERE host = ?1",
                    [&domain],
                    |row| row.get(0),
                )
                .optional()?
                .flatten())
        })
    }
}
