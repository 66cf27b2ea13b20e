//! Mail address helpers shared by the normalizer and the handlers.

use std::collections::HashSet;

/// Canonical form of the first address in a header value.
///
/// Display names, angle brackets, quotes and `mailto:` are stripped and the
/// result is lower-cased. Plus tags stay: `agent+tag@x` and `agent@x` are
/// different mailboxes as far as forwarding detection is concerned. A value
/// with no recognizable address falls back to its trimmed, lower-cased form.
pub fn clean_email_address(raw: &str) -> String {
    extract_addresses(raw)
        .into_iter()
        .next()
        .unwrap_or_else(|| raw.trim().to_ascii_lowercase())
}

/// All distinct addresses in a header value, bracketed ones first.
pub fn extract_addresses(raw: &str) -> Vec<String> {
    let mut addresses = Vec::new();
    let mut seen = HashSet::new();

    let mut remainder = raw;
    while let Some(start) = remainder.find('<') {
        let after_start = &remainder[start + 1..];
        if let Some(end) = after_start.find('>') {
            if let Some(address) = normalize_address(&after_start[..end]) {
                if seen.insert(address.clone()) {
                    addresses.push(address);
                }
            }
            remainder = &after_start[end + 1..];
        } else {
            break;
        }
    }

    for recipient in split_recipients(raw) {
        if recipient.contains('<') {
            continue;
        }
        for token in recipient.split(|ch: char| ch.is_whitespace()) {
            if let Some(address) = normalize_address(token) {
                if seen.insert(address.clone()) {
                    addresses.push(address);
                }
            }
        }
    }

    addresses
}

fn normalize_address(raw: &str) -> Option<String> {
    let mut value = raw.trim();
    if let Some(stripped) = value.strip_prefix("mailto:") {
        value = stripped.trim();
    }
    value = value.trim_matches(|ch: char| matches!(ch, '<' | '>' | '"' | '\'' | ',' | ';'));
    let (local, domain) = value.split_once('@')?;
    let local = local.trim();
    let domain = domain.trim();
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(format!(
        "{}@{}",
        local.to_ascii_lowercase(),
        domain.to_ascii_lowercase()
    ))
}

/// Splits a recipient header on `,`/`;`, honoring quoted display names.
pub fn split_recipients(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for ch in value.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' => {
                escaped = true;
                current.push(ch);
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' | ';' if !in_quotes => {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    out.push(trimmed.to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }

    out
}
