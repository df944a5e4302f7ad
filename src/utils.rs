//! Identifier and hashing helpers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32, e.g. `tx_1...`, `dispute_1...`
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Hex sha256 digest of an already encoded record.
pub fn content_hash(bytes: &[u8]) -> String {
    sha256::digest(bytes)
}

/// True when `hash` looks like a hex sha256 digest (32 bytes).
pub fn is_sha256_hex(hash: &str) -> bool {
    matches!(hex::decode(hash), Ok(bytes) if bytes.len() == 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        let id = new_uuid_to_bech32("tx_").unwrap();
        assert!(id.starts_with("tx_1"));
        assert_ne!(id, new_uuid_to_bech32("tx_").unwrap());
    }

    #[test]
    fn recognises_sha256_hex() {
        let digest = content_hash(b"bill of lading");
        assert!(is_sha256_hex(&digest));
        assert!(!is_sha256_hex("abc"));
        assert!(!is_sha256_hex(&"zz".repeat(32)));
    }
}
