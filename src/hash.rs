/// Digest-to-location derivation.
///
/// Every operation hashes its key once and splits the 64-bit digest into
/// three disjoint pieces: the low 7 bits become the slot fingerprint, the
/// bits immediately above select the chunk, and the top 2 bits pick which
/// of the chunk's four lanes the probe enters at.
use crate::layout::{LANES, LOG_TAGS_PER_CHUNK, TAG_BITS, TAG_MASK};

/// Default hasher of the table.
pub type DefaultHashBuilder = ahash::RandomState;

/// Slot fingerprint: low 7 bits of the digest. The high bit is always
/// clear, so a fingerprint can never read as EMPTY or DELETED.
#[inline(always)]
pub(crate) fn tag_of(hash: u64) -> u8 {
    (hash & TAG_MASK) as u8
}

/// Index of the digest's home chunk at table size `1 << log_incr`.
///
/// The digest is shifted so the chunk-selection bits sit just above the
/// fingerprint bits, masked to the table size, then divided by the slots
/// per chunk. Fingerprint and chunk selection share no digest bits.
#[inline(always)]
pub(crate) fn chunk_index(hash: u64, log_incr: u32) -> usize {
    let shifted = hash >> (TAG_BITS - LOG_TAGS_PER_CHUNK);
    ((shifted & ((1u64 << log_incr) - 1)) >> LOG_TAGS_PER_CHUNK) as usize
}

/// Lane the probe starts at: top two bits of the digest.
#[inline(always)]
pub(crate) fn start_lane(hash: u64) -> usize {
    (hash >> (u64::BITS - 2)) as usize & (LANES - 1)
}

/// The address bit that becomes significant when a table of log size
/// `new_log_incr - 1` doubles. Set means the entry moves to the mirror
/// chunk; clear means it stays.
#[inline(always)]
pub(crate) fn mirror_bit(hash: u64, new_log_incr: u32) -> bool {
    let shifted = hash >> (TAG_BITS - LOG_TAGS_PER_CHUNK);
    (shifted >> (new_log_incr - 1)) & 1 != 0
}

/// Speculative read prefetch. Purely a throughput hint; correctness never
/// depends on it.
#[inline(always)]
pub(crate) fn prefetch_read<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch(ptr as *const i8, _MM_HINT_T0);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}
