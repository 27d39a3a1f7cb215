//! WebSocket origin allow-listing

/// Check a declared `Origin` against the configured allow-list.
///
/// An empty allow-list disables the check. Otherwise the origin must be
/// present and equal one of the entries; trailing slashes and surrounding
/// whitespace are ignored, and scheme/host compare ASCII case-insensitively.
/// There is no wildcard or subdomain matching. The literal `null` origin
/// passes only when `"null"` itself is listed.
pub fn validate_origin(origin: Option<&str>, allow_list: &[String]) -> bool {
    if allow_list.is_empty() {
        return true;
    }
    let Some(origin) = origin.map(normalize).filter(|o| !o.is_empty()) else {
        return false;
    };
    allow_list
        .iter()
        .map(|entry| normalize(entry))
        .any(|entry| !entry.is_empty() && entry.eq_ignore_ascii_case(origin))
}

fn normalize(value: &str) -> &str {
    value.trim().trim_end_matches('/')
}
