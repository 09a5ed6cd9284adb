//! Scalar string lookup in loosely structured JSON responses.
//!
//! The service answers with small flat objects (`{"uuid":..,"data":..}`,
//! `{"token":..}`, `{"error_message":..}`), sometimes wrapped in text that is
//! not JSON at all. [`extract`] only ever returns a string value and answers
//! `None` for anything it cannot find. Callers decide whether that matters.

use serde_json::{Deserializer, Value};

/// Returns the string value stored under `key`, or `None`.
///
/// The first `"<key>"` in the body wins, then the next `:`. A string value
/// there is decoded as a JSON string, so escapes come back unescaped. If it
/// does not decode, the text between the next two `"` is returned verbatim.
/// Any other value type yields `None` when the body is well-formed JSON; in
/// a malformed body the literal quote scan still applies.
pub fn extract(body: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let at = body.find(&needle)? + needle.len();
    let colon = at + body[at..].find(':')? + 1;

    let value = body[colon..].trim_start();
    if value.starts_with('"') {
        if let Some(Ok(text)) = Deserializer::from_str(value).into_iter::<String>().next() {
            return Some(text);
        }
    } else if serde_json::from_str::<Value>(body).is_ok() {
        return None;
    }
    quoted(&body[colon..]).map(str::to_owned)
}

fn quoted(rest: &str) -> Option<&str> {
    let open = rest.find('"')? + 1;
    let close = open + rest[open..].find('"')?;
    Some(&rest[open..close])
}
