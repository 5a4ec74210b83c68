//! ActivityPub federation
//!
//! The inbound pipeline (signature verification, dispatch, object
//! normalization), the outbound pipeline (document construction,
//! recipient expansion, retrying delivery), and the identity/key/inbox
//! resolution layer that ties them together.

pub mod delivery;
pub mod fetch;
pub mod identity;
pub mod inbound;
pub mod limiter;
pub mod outbound;
pub mod shape;
pub mod signature;
pub mod track;

use sha2::{Digest, Sha512_256};

/// The one true AS2 content type
pub const AS2_CONTENT_TYPE: &str =
    r#"application/ld+json; profile="https://www.w3.org/ns/activitystreams""#;

/// Accept header for object fetches
pub const AS2_ACCEPT: &str = r#"application/ld+json; profile="https://www.w3.org/ns/activitystreams",application/activity+json"#;

/// Accept header for webfinger
pub const JRD_CONTENT_TYPE: &str = "application/jrd+json";

/// The AS2 context URL
pub const AS2_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// The security vocabulary context for actor documents
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// The public broadcast address
pub const THE_WHOLE_WORLD: &str = "https://www.w3.org/ns/activitystreams#Public";

/// The namespaced short form some peers use for the public address
pub const TINY_WORLD: &str = "as:Public";

/// Identity property under which chat keys are learned
pub const CHAT_KEY_PROP: &str = "chatKeyV0";

/// Does a content type speak activity?
pub fn friend_or_foe(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("application/ld+json") || ct.starts_with("application/activity+json")
}

/// Hostname of a URL, or empty when there isn't one.
///
/// Origin comparisons throughout the pipeline are by hostname.
pub fn originate(u: &str) -> String {
    url::Url::parse(u)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Is the audience world-addressable?
pub fn loud_and_proud(audience: &[String]) -> bool {
    audience.iter().any(|a| a == THE_WHOLE_WORLD)
}

/// De-duplicate while preserving order; empty strings are dropped.
pub fn one_of_a_kind(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    seen.insert(String::new());
    items.into_iter().filter(|s| seen.insert(s.clone())).collect()
}

const XID_LETTERS: &[u8; 64] = b"BCDFGHJKLMNPQRSTVWXYZbcdfghjklmnpqrstvwxyz1234567891234567891234";

fn xcelerate(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| XID_LETTERS[(b & 63) as usize] as char)
        .collect()
}

/// Short stable token for a xid: SHA-512/256 truncated to 20 bytes in a
/// 64-letter alphabet.
pub fn short_xid(xid: &str) -> String {
    let digest = Sha512_256::digest(xid.as_bytes());
    xcelerate(&digest[..20])
}

/// Random 18-byte token in the same alphabet; used for generated ids.
pub fn random_xid() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    xcelerate(&bytes)
}

/// Swap a file name's extension, e.g. `a.jpg` -> `a.avif`.
pub fn new_ending(name: &str, ending: &str) -> String {
    match name.rfind('.') {
        Some(dot) => format!("{}{}", &name[..dot], ending),
        None => format!("{}{}", name, ending),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn originate_extracts_hostname() {
        assert_eq!(originate("https://example.com/u/alice"), "example.com");
        assert_eq!(originate("https://example.com:8443/x?q=1"), "example.com");
        assert_eq!(originate("not a url"), "");
    }

    #[test]
    fn one_of_a_kind_preserves_order() {
        let deduped = one_of_a_kind(vec![
            "b".to_string(),
            "a".to_string(),
            "".to_string(),
            "b".to_string(),
            "c".to_string(),
        ]);
        assert_eq!(deduped, vec!["b", "a", "c"]);
    }

    #[test]
    fn short_xid_is_stable_and_short() {
        let a = short_xid("https://example.com/h/abc");
        let b = short_xid("https://example.com/h/abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        assert_ne!(a, short_xid("https://example.com/h/abd"));
    }

    #[test]
    fn friend_or_foe_accepts_both_as2_types() {
        assert!(friend_or_foe("application/activity+json"));
        assert!(friend_or_foe(
            "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""
        ));
        assert!(!friend_or_foe("text/html"));
    }

    #[test]
    fn new_ending_replaces_extension() {
        assert_eq!(new_ending("pic.jpg", ".avif"), "pic.avif");
        assert_eq!(new_ending("noext", ".avif"), "noext.avif");
    }
}
