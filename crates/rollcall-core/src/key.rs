//! Dataset folder keys.
//!
//! A key is the lowercase ASCII-alphanumeric form of a name with every run
//! of other characters collapsed to a single underscore. Worker labels are
//! passed through the same function before matching.

/// Fallback key for names with no alphanumeric characters.
const EMPTY_KEY: &str = "student";

/// Sanitize a display name (or worker label) into a folder key.
pub fn folder_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    let mut pending_sep = false;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !key.is_empty() {
                key.push('_');
            }
            pending_sep = false;
            key.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    if key.is_empty() {
        EMPTY_KEY.to_string()
    } else {
        key
    }
}

/// Derive a key for `name` that `taken` does not already claim.
///
/// Collisions get a numeric suffix: `jane_doe`, `jane_doe_2`, `jane_doe_3`.
pub fn allocate_key(name: &str, taken: impl Fn(&str) -> bool) -> String {
    let base = folder_key(name);
    if !taken(&base) {
        return base;
    }
    (2u32..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_key_basic() {
        assert_eq!(folder_key("Jane Doe"), "jane_doe");
        assert_eq!(folder_key("  Liam   O'Brien-Smith "), "liam_o_brien_smith");
        assert_eq!(folder_key("ANA"), "ana");
    }

    #[test]
    fn test_folder_key_idempotent() {
        for name in ["Jane Doe", "x--y", "Émile Zola", "a_b"] {
            let once = folder_key(name);
            assert_eq!(folder_key(&once), once);
        }
    }

    #[test]
    fn test_folder_key_non_ascii_and_empty() {
        assert_eq!(folder_key("Émile Zola"), "mile_zola");
        assert_eq!(folder_key("***"), EMPTY_KEY);
        assert_eq!(folder_key(""), EMPTY_KEY);
    }

    #[test]
    fn test_allocate_key_collision() {
        let existing = ["jane_doe", "jane_doe_2"];
        let key = allocate_key("Jane Doe", |k| existing.contains(&k));
        assert_eq!(key, "jane_doe_3");
        assert_eq!(allocate_key("John", |_| false), "john");
    }
}
