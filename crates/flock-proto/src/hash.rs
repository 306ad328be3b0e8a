/// FNV-1a hash functions.
///
/// Virtual-node placement and VDI id derivation both depend on every node
/// computing identical hash values, so the algorithm is pinned here.

use crate::constants::SD_NR_VDIS;

/// FNV-1a 64-bit initial basis.
const FNV1A_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_64_PRIME: u64 = 0x0100_0000_01b3;

/// Compute FNV-1a hash over a byte buffer.
#[inline]
pub fn fnv_64a_buf(buf: &[u8], mut hval: u64) -> u64 {
    for &byte in buf {
        hval ^= byte as u64;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Compute FNV-1a hash over a single u64 value.
#[inline]
pub fn fnv_64a_64(val: u64, mut hval: u64) -> u64 {
    for i in 0..8 {
        hval ^= (val >> (i * 8)) & 0xff;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Hash a byte buffer to a u64 (double-hash for better distribution).
#[inline]
pub fn sd_hash(buf: &[u8]) -> u64 {
    let hval = fnv_64a_buf(buf, FNV1A_64_INIT);
    fnv_64a_64(hval, hval)
}

/// Hash a u64 value (double-hash for better distribution).
#[inline]
pub fn sd_hash_64(val: u64) -> u64 {
    let hval = fnv_64a_64(val, FNV1A_64_INIT);
    fnv_64a_64(hval, hval)
}

/// Hash the next value in a chain (vnode ring point generation).
#[inline]
pub fn sd_hash_next(hval: u64) -> u64 {
    fnv_64a_64(hval, hval)
}

/// Hash an object ID to its ring position.
#[inline]
pub fn sd_hash_oid(oid: u64) -> u64 {
    sd_hash_64(oid)
}

/// Hash a VDI name into the 24-bit VDI id space.
#[inline]
pub fn sd_hash_vdi(name: &str) -> u32 {
    (sd_hash(name.as_bytes()) % SD_NR_VDIS as u64) as u32
}
