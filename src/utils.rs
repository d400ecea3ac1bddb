//! Helpers for player, clan and war tags.
//!
//! Tags are typed by hand, so the same entity can show up as `2pp`, `#2PP` or
//! `#2oo`. Every tag is normalized before it is tracked or used as a key.

/// Normalizes a tag: uppercase, `O` replaced by `0`, a single leading `#`.
///
/// # Arguments
///
/// * `tag` - Tag as typed by a user or returned by the API.
///
/// # Examples
///
/// ```
/// # use clanwatch::utils::normalize_tag;
/// assert_eq!(normalize_tag("2pp"), "#2PP");
/// assert_eq!(normalize_tag("##8qoo"), "#8Q00");
/// ```
pub fn normalize_tag(tag: &str) -> String {
    let body: String = tag
        .trim()
        .trim_start_matches('#')
        .to_uppercase()
        .replace('O', "0");
    format!("#{}", body)
}

/// Normalizes then encodes a tag for use in a request path.
///
/// # Examples
///
/// ```
/// # use clanwatch::utils::encode_tag;
/// assert_eq!(encode_tag("#2pp"), "%232PP");
/// ```
pub fn encode_tag(tag: &str) -> String {
    normalize_tag(tag).replacen('#', "%23", 1)
}
