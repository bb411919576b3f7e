//! Address and message-id normalization.
//!
//! Every key that reaches the store goes through [`normalize_address`] or
//! [`normalize_message_id`] so that the casing or bracketing used by whichever
//! provider supplied the value never splits one identity into two.

use mailparse::{addrparse, MailAddr};
use tracing::warn;

/// Canonical form of an email address used as a store key.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Canonical form of a Message-Id / In-Reply-To value.
pub fn normalize_message_id(id: &str) -> String {
    id.trim()
        .trim_matches(|c| c == '<' || c == '>')
        .trim()
        .to_string()
}

/// Domain part of an address, lowercased.
pub fn domain_of(address: &str) -> Option<String> {
    let (local, domain) = address.trim().rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(domain.to_lowercase())
}

/// True for a bare `local@domain` address with a dotted domain.
pub fn is_email(address: &str) -> bool {
    let address = address.trim();
    if address.is_empty() || address.contains(char::is_whitespace) {
        return false;
    }
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Extract the first mailbox from a header value such as `"Yuti <yu.ti@x.com>, b@y.com"`.
///
/// Falls back to the trimmed input when the header cannot be parsed.
pub fn parse_address(header: &str) -> String {
    match parse_addresses(header).into_iter().next() {
        Some(address) => address,
        None => {
            if !header.trim().is_empty() {
                warn!(header = %header, "address_parse_failed");
            }
            header.trim().to_string()
        }
    }
}

/// Extract every mailbox from an address-list header, groups flattened.
pub fn parse_addresses(header: &str) -> Vec<String> {
    let list = match addrparse(header) {
        Ok(list) => list,
        Err(_) => return Vec::new(),
    };
    let mut addresses = Vec::new();
    for entry in list.iter() {
        match entry {
            MailAddr::Single(info) => addresses.push(info.addr.trim().to_string()),
            MailAddr::Group(group) => {
                addresses.extend(group.addrs.iter().map(|info| info.addr.trim().to_string()))
            }
        }
    }
    addresses.retain(|a| !a.is_empty());
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(" Help@Biz.COM "), "help@biz.com");
    }

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(normalize_message_id("<abc@mail.com>"), "abc@mail.com");
        assert_eq!(normalize_message_id(" abc@mail.com "), "abc@mail.com");
        assert_eq!(normalize_message_id(""), "");
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("help@Biz.com"), Some("biz.com".to_string()));
        assert_eq!(domain_of("nodomain"), None);
        assert_eq!(domain_of("@biz.com"), None);
        assert_eq!(domain_of("help@"), None);
    }

    #[test]
    fn test_is_email() {
        assert!(is_email("a@x.com"));
        assert!(!is_email("a@x"));
        assert!(!is_email("a b@x.com"));
        assert!(!is_email("a@@x.com"));
        assert!(!is_email(""));
    }

    #[test]
    fn test_parse_single_address() {
        assert_eq!(parse_address("yu.ti@iuoe.com"), "yu.ti@iuoe.com");
        assert_eq!(parse_address(" yu.ti@iuoe.com "), "yu.ti@iuoe.com");
        assert_eq!(parse_address("Yuti <yu.ti@iuoe.com> "), "yu.ti@iuoe.com");
        assert_eq!(
            parse_address("Yuti <yu.ti@iuoe.com> , Prili <tyu@weq.com>"),
            "yu.ti@iuoe.com"
        );
    }

    #[test]
    fn test_parse_multiple_addresses() {
        assert_eq!(parse_addresses("ope@poe.eop"), vec!["ope@poe.eop"]);
        assert_eq!(
            parse_addresses("Ope <ope@poe.eop>, ytue@ut.ey"),
            vec!["ope@poe.eop", "ytue@ut.ey"]
        );
    }
}
