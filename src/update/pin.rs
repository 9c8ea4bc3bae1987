//! Version pins encoded in attribute paths (`openssl_1_1`, `gcc9`, ...).

/// The version an attribute path is pinned to, if any.
///
/// The pin is the trailing run of digits and `_` separators, with `_` read
/// as `.`. `_x`/`_any` suffixes are ignored; `-unstable` paths are unpinned.
pub fn path_pin(attr_path: &str) -> Option<String> {
    // Only the last attribute name carries a pin.
    let name = attr_path.rsplit('.').next().unwrap_or(attr_path);
    if name.ends_with("-unstable") {
        return None;
    }

    let lower = name.to_ascii_lowercase();
    let name = if lower.ends_with("_any") {
        &name[..name.len() - 4]
    } else if lower.ends_with("_x") {
        &name[..name.len() - 2]
    } else {
        name
    };

    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit() || c == '_');
    let pin = name[stem.len()..].trim_matches('_');
    if pin.is_empty() || stem.is_empty() {
        return None;
    }
    Some(pin.replace('_', "."))
}

fn honours_pin(pin: &str, version: &str) -> bool {
    version == pin
        || version
            .strip_prefix(pin)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Whether moving from `old_version` to `new_version` keeps the path pin.
///
/// Pins the old version does not honour are taken to mean something else
/// (e.g. `python3`), and never block an update.
pub fn compatible_with_pin(attr_path: &str, old_version: &str, new_version: &str) -> bool {
    match path_pin(attr_path) {
        Some(pin) => !honours_pin(&pin, old_version) || honours_pin(&pin, new_version),
        None => true,
    }
}
