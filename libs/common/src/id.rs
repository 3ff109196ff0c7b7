use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = arena_common::id::prefixed_ulid("conn");
/// assert!(id.starts_with("conn_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new().to_string())
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const USER: &str = "usr";
    pub const CONNECTION: &str = "conn";
    pub const BATTLE: &str = "btl";
    pub const PARTY: &str = "pty";
    pub const EVENT: &str = "evt";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ulid_format() {
        let id = prefixed_ulid("conn");
        assert!(id.starts_with("conn_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 5 + 26);
    }

    #[test]
    fn test_uniqueness() {
        let a = prefixed_ulid("conn");
        let b = prefixed_ulid("conn");
        assert_ne!(a, b);
    }
}
