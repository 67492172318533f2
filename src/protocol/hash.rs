//! MurmurHash2, 32-bit variant
//!
//! Fast non-cryptographic hash used for frame integrity. Words are read
//! little-endian so both endpoints agree regardless of host byte order.

const SEED: u32 = 97;
const M: u32 = 0x5bd1_e995;
const R: u32 = 24;

/// Hash `data` with the frame integrity seed
pub fn murmur_hash2(data: &[u8]) -> u32 {
    let mut hash = SEED ^ (data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        hash = hash.wrapping_mul(M);
        hash ^= k;
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, byte) in tail.iter().enumerate() {
            hash ^= u32::from(*byte) << (8 * i);
        }
        hash = hash.wrapping_mul(M);
    }

    hash ^= hash >> 13;
    hash = hash.wrapping_mul(M);
    hash ^= hash >> 15;
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let data = b"engine frame payload";
        assert_eq!(murmur_hash2(data), murmur_hash2(data));
    }

    #[test]
    fn test_single_byte_flip_changes_hash() {
        let original: Vec<u8> = (0..64u8).collect();
        let expected = murmur_hash2(&original);
        for i in 0..original.len() {
            let mut corrupted = original.clone();
            corrupted[i] ^= 0x01;
            assert_ne!(murmur_hash2(&corrupted), expected, "flip at byte {}", i);
        }
    }

    #[test]
    fn test_tail_bytes_are_mixed() {
        assert_ne!(murmur_hash2(b"abcde"), murmur_hash2(b"abcdf"));
        assert_ne!(murmur_hash2(b"abcd"), murmur_hash2(b"abcd\0"));
    }
}
