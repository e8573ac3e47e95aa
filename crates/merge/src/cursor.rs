use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use cdc_contracts::{Cursor, SourceTag};
use chrono::{DateTime, SecondsFormat, Utc};

const VERSION_TAG: &str = "v1";
const MAX_ENCODED_LEN: usize = 256;

/// Encodes a cursor as `base64url("v1|<rfc3339 ms>|<tie_break_id>[|<source>]")`.
pub fn encode(cursor: &Cursor) -> String {
    let mut raw = format!(
        "{}|{}|{}",
        VERSION_TAG,
        cursor.sort_key.to_rfc3339_opts(SecondsFormat::Millis, true),
        cursor.tie_break_id
    );
    if let Some(source) = cursor.source {
        raw.push('|');
        raw.push_str(source.as_str());
    }
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Decodes a client cursor. Any malformed input yields `None`, which callers
/// treat as the start of the stream.
///
/// Besides the current `v1` form this accepts the unversioned
/// `base64("<sort key>|<id>")` cursors issued before versioning. Cursors
/// without a source segment decode with `source: None`.
pub fn decode(raw: &str) -> Option<Cursor> {
    let raw = raw.trim();
    if raw.is_empty() || raw.len() > MAX_ENCODED_LEN {
        return None;
    }

    let bytes = decode_base64(raw)?;
    let text = String::from_utf8(bytes).ok()?;

    let mut parts = text.split('|');
    let first = parts.next()?;
    let (sort_key, tie_break_id, source) = if is_version_tag(first) {
        if first != VERSION_TAG {
            return None;
        }
        let sort_key = parts.next()?;
        let tie_break_id = parts.next()?;
        let source = match parts.next() {
            Some(raw) => Some(parse_source(raw)?),
            None => None,
        };
        (sort_key, tie_break_id, source)
    } else {
        (first, parts.next()?, None)
    };

    if parts.next().is_some() {
        return None;
    }

    Some(Cursor {
        sort_key: parse_sort_key(sort_key)?,
        tie_break_id: tie_break_id.trim().parse::<i64>().ok()?,
        source,
    })
}

fn parse_source(raw: &str) -> Option<SourceTag> {
    match raw {
        "a" => Some(SourceTag::A),
        "b" => Some(SourceTag::B),
        _ => None,
    }
}

fn decode_base64(raw: &str) -> Option<Vec<u8>> {
    let unpadded = raw.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(unpadded)
        .or_else(|_| STANDARD_NO_PAD.decode(unpadded))
        .ok()
}

fn is_version_tag(part: &str) -> bool {
    part.len() > 1
        && part.starts_with('v')
        && part[1..].bytes().all(|b| b.is_ascii_digit())
}

fn parse_sort_key(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}
