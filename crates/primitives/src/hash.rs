use novad_consensus::Hash256;
use scrypt::Params;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Block identity hash: scrypt over the 80-byte header with the header as
/// its own salt (N=1024, r=1, p=1).
pub fn scrypt_hash(data: &[u8]) -> Hash256 {
    let params = Params::new(10, 1, 1, 32).expect("fixed scrypt parameters");
    let mut out = [0u8; 32];
    scrypt::scrypt(data, data, &params, &mut out).expect("32-byte scrypt output");
    out
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_empty_vector() {
        assert_eq!(
            hash256_to_hex(&sha256d(b"")),
            "56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
        );
    }

    #[test]
    fn scrypt_hash_is_deterministic() {
        let header = [0x42u8; 80];
        assert_eq!(scrypt_hash(&header), scrypt_hash(&header));
        assert_ne!(scrypt_hash(&header), scrypt_hash(&[0x43u8; 80]));
    }
}
