//! Canonical forms for email addresses and phone numbers, plus the pure
//! decode helpers the mailbox pipeline needs.
//!
//! Everything here is deterministic and I/O-free: identical input bytes
//! always yield identical output. Malformed input returns `None` so callers
//! can skip-and-count instead of aborting a batch.

use std::sync::OnceLock;

use regex::Regex;

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Pragmatic RFC-lite grammar: local part, single @, dotted domain with a
    // 2+ letter TLD. Matches what the contact directory stores.
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9._%+'-]*@[a-z0-9][a-z0-9.-]*\.[a-z]{2,}$").unwrap()
    })
}

/// Canonicalize an email address: trim, lowercase, strip a surrounding
/// `<...>` pair, validate. Returns `None` for anything that isn't a
/// deliverable-looking address.
pub fn normalize_address(raw: &str) -> Option<String> {
    let mut s = raw.trim().to_lowercase();
    if s.starts_with('<') && s.ends_with('>') && s.len() > 1 {
        s = s[1..s.len() - 1].trim().to_string();
    }
    if address_re().is_match(&s) {
        Some(s)
    } else {
        None
    }
}

/// Parse a phone number into an E.164-style `+<digits>` form.
///
/// Regional grammar is deliberately small: the only region we ingest calls
/// from today is NANP ("US"), where a bare 10-digit number gains +1 and an
/// 11-digit number must already start with 1. Numbers with an explicit `+`
/// country code pass through if they are dialable (8–15 digits, no leading
/// zero). Anything else is `None`.
pub fn normalize_phone(raw: &str, default_region: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if has_plus {
        if (8..=15).contains(&digits.len()) && !digits.starts_with('0') {
            return Some(format!("+{digits}"));
        }
        return None;
    }

    match default_region {
        "US" | "CA" => match digits.len() {
            10 if !digits.starts_with('0') && !digits.starts_with('1') => {
                Some(format!("+1{digits}"))
            }
            11 if digits.starts_with('1') => Some(format!("+{digits}")),
            _ => None,
        },
        _ => {
            // Unknown region: only accept numbers long enough to carry their
            // own country code.
            if (11..=15).contains(&digits.len()) && !digits.starts_with('0') {
                Some(format!("+{digits}"))
            } else {
                None
            }
        }
    }
}

/// Trailing `n` digits of a raw phone string, non-digits stripped.
/// Fuzzy-match keying only — never used for dialing.
pub fn last_n_digits(raw: &str, n: usize) -> Option<String> {
    let digits: Vec<char> = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < n {
        return None;
    }
    Some(digits[digits.len() - n..].iter().collect())
}

/// Decode base64-encoded text as mailbox APIs emit it: URL-safe no-pad
/// first, standard alphabet as a fallback. `None` for undecodable input or
/// non-UTF-8 payloads.
pub fn decode_base64_text(data: &str) -> Option<String> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(data))
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Parse email addresses from a header value like
/// `"Alice" <alice@co.com>, Bob <bob@co.com>, carol@co.com`.
/// Returns `(display_name, address)` pairs; the name may be empty.
pub fn parse_address_list(header: &str) -> Vec<(String, String)> {
    let mut results = Vec::new();
    for part in header.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let (Some(lt), Some(gt)) = (trimmed.find('<'), trimmed.rfind('>')) {
            if lt < gt {
                let email = trimmed[lt + 1..gt].trim().to_string();
                let name = trimmed[..lt].trim().trim_matches('"').trim().to_string();
                results.push((name, email));
                continue;
            }
        }
        if trimmed.contains('@') {
            results.push((String::new(), trimmed.to_string()));
        }
    }
    results
}
