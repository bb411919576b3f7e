//! Subject normalization for thread matching.
//!
//! Matching on subject is a heuristic: two genuinely distinct messages with the
//! same subject from the same sender land in the same thread. Clients already
//! rely on this behavior, so only the fixed marker set below is stripped.

const MARKERS: &[&str] = &["re:", "fw:", "fwd:", "enc:"];

/// Strip any number of leading reply/forward markers and surrounding whitespace.
///
/// `normalize(normalize(s)) == normalize(s)` for every input.
pub fn normalize(subject: &str) -> String {
    let mut rest = subject.trim();
    loop {
        let stripped = MARKERS.iter().find_map(|marker| {
            let head = rest.get(..marker.len())?;
            head.eq_ignore_ascii_case(marker)
                .then(|| rest[marker.len()..].trim_start())
        });
        match stripped {
            Some(next) => rest = next,
            None => break,
        }
    }
    rest.trim_end().to_string()
}
