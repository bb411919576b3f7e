//! Sending/receiving capability from the relay's DNS verification records.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    /// `TXT`, `MX`, `CNAME`
    pub record_type: String,
    pub name: String,
    pub value: String,
    pub priority: Option<String>,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub can_send: bool,
    pub can_receive: bool,
}

/// The records that matter for a custom domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSummary {
    /// SPF TXT record on the domain itself
    pub include: Option<DnsRecord>,
    /// DKIM TXT record under `domainkey.<domain>`
    pub domain_key: Option<DnsRecord>,
    pub receive: Vec<DnsRecord>,
}

impl DnsSummary {
    pub fn extract(domain: &str, records: &[DnsRecord]) -> Self {
        let domain = domain.to_ascii_lowercase();
        let key_suffix = format!("domainkey.{domain}");
        let mut summary = DnsSummary::default();
        for record in records {
            let name = record.name.to_ascii_lowercase();
            match record.record_type.to_ascii_uppercase().as_str() {
                "TXT" if name == domain && record.value.contains("include") => {
                    summary.include = Some(record.clone());
                }
                "TXT" if name.ends_with(&key_suffix) => {
                    summary.domain_key = Some(record.clone());
                }
                "MX" => summary.receive.push(record.clone()),
                _ => {}
            }
        }
        summary
    }

    /// Sending needs both SPF and DKIM verified; receiving needs exactly the
    /// two relay MX records, both verified.
    pub fn capabilities(&self) -> Capabilities {
        let verified = |r: &Option<DnsRecord>| r.as_ref().map(|r| r.valid).unwrap_or(false);
        Capabilities {
            can_send: verified(&self.include) && verified(&self.domain_key),
            can_receive: self.receive.len() == 2 && self.receive.iter().all(|r| r.valid),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_records(domain: &str, send_valid: bool, receive_valid: bool) -> Vec<DnsRecord> {
    let record = |record_type: &str, name: &str, value: &str, valid: bool| DnsRecord {
        record_type: record_type.to_string(),
        name: name.to_string(),
        value: value.to_string(),
        priority: (record_type == "MX").then(|| "10".to_string()),
        valid,
    };
    vec![
        record("TXT", domain, "v=spf1 include:mailgun.org ~all", send_valid),
        record("TXT", &format!("k1._domainkey.{domain}"), "k=rsa; p=MIGf", send_valid),
        record("CNAME", &format!("email.{domain}"), "mailgun.org", true),
        record("MX", "", "mxa.mailgun.org", receive_valid),
        record("MX", "", "mxb.mailgun.org", receive_valid),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_classifies_records() {
        let summary = DnsSummary::extract("biz.com", &test_records("biz.com", true, false));
        assert!(summary.include.is_some());
        assert_eq!(
            summary.domain_key.as_ref().map(|r| r.name.as_str()),
            Some("k1._domainkey.biz.com")
        );
        assert_eq!(summary.receive.len(), 2);
        assert_eq!(
            summary.capabilities(),
            Capabilities {
                can_send: true,
                can_receive: false
            }
        );
    }

    #[test]
    fn test_send_needs_domain_key() {
        let mut records = test_records("biz.com", true, true);
        records[1].valid = false;
        let caps = DnsSummary::extract("biz.com", &records).capabilities();
        assert!(!caps.can_send);
        assert!(caps.can_receive);
    }

    #[test]
    fn test_receive_needs_exactly_two_mx() {
        let mut records = test_records("biz.com", true, true);
        records.pop();
        assert!(!DnsSummary::extract("biz.com", &records).capabilities().can_receive);

        assert_eq!(
            DnsSummary::extract("biz.com", &[]).capabilities(),
            Capabilities::default()
        );
    }

    #[test]
    fn test_records_of_other_domain_are_ignored() {
        let records = test_records("other.com", true, true);
        let summary = DnsSummary::extract("biz.com", &records);
        assert!(summary.include.is_none());
        assert!(summary.domain_key.is_none());
    }
}
