//! VM id generation.

use uuid::Uuid;

/// Mints a fresh opaque 128-bit VM id, string-encoded as 32 lowercase hex
/// characters (a UUIDv4 with its hyphens stripped).
pub fn gen_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_32_hex_characters() {
        let id = gen_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn consecutive_ids_differ() {
        let a = gen_id();
        let b = gen_id();
        assert_ne!(a, b);
    }
}
