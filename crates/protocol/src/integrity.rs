//! Clicker identity checksum
//!
//! Response frames carry only three bytes of a remote's identity. The fourth
//! byte printed on the back of every remote is the XOR of those three, so the
//! full identifier can always be reconstructed from a response.

/// Compute the identity checksum byte for three raw identity bytes
#[inline]
pub fn identity_checksum(identity: [u8; 3]) -> u8 {
    identity[0] ^ identity[1] ^ identity[2]
}

/// Append the checksum byte, producing the full 4-byte identity
#[inline]
pub fn with_checksum(identity: [u8; 3]) -> [u8; 4] {
    [
        identity[0],
        identity[1],
        identity[2],
        identity_checksum(identity),
    ]
}

/// Check a full 4-byte identity against its trailing checksum byte
#[inline]
pub fn verify_identity(full: [u8; 4]) -> bool {
    identity_checksum([full[0], full[1], full[2]]) == full[3]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_checksum() {
        assert_eq!(identity_checksum([0x01, 0x02, 0x03]), 0x00);
        assert_eq!(identity_checksum([0xff, 0x00, 0x00]), 0xff);
        assert_eq!(identity_checksum([0x12, 0x34, 0x56]), 0x12 ^ 0x34 ^ 0x56);
    }

    #[test]
    fn test_with_checksum_appends_xor() {
        assert_eq!(with_checksum([0xaa, 0x0f, 0xf0]), [0xaa, 0x0f, 0xf0, 0x55]);
    }

    #[test]
    fn test_verify_identity() {
        assert!(verify_identity(with_checksum([0x3c, 0x91, 0x07])));
        assert!(!verify_identity([0x3c, 0x91, 0x07, 0x00]));
    }
}
