//! Content digests and parameter HMACs.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Length of the short content digest in hex characters.
pub const SHORT_DIGEST_LEN: usize = 12;

/// Returns a fixed-length hex digest of `content`, used to fingerprint
/// DoD checklist content in audit reasons.
#[must_use]
pub fn short_digest(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut out = String::with_capacity(SHORT_DIGEST_LEN);
    for byte in digest.iter().take(SHORT_DIGEST_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Computes the hex HMAC-SHA256 of `message` under `secret`.
///
/// Used for ExtCall parameter hashing: the broker stores this instead of
/// raw parameter values.
#[must_use]
pub fn hmac_hex(secret: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    let bytes = mac.finalize().into_bytes();
    bytes.iter().fold(String::new(), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}
