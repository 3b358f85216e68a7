/// In-memory layout of the table: tag encoding, chunk geometry, and the
/// node-storage policy.
///
/// A chunk is one cache line of tag bytes followed by storage for 64
/// key/value slots. Chunks are `repr(C, align(64))` so a pointer to any
/// tag byte recovers its chunk base by masking the low six address bits.
use std::mem::MaybeUninit;
use std::ptr;

/// Slots per chunk: one tag byte per slot, one cache line of tags.
pub(crate) const TAGS_PER_CHUNK: usize = 64;

/// log2 of [`TAGS_PER_CHUNK`]; also the minimum `log_incr` of a table.
pub(crate) const LOG_TAGS_PER_CHUNK: u32 = 6;

/// Width of one SIMD lane in tag bytes.
pub(crate) const LANE_WIDTH: usize = 16;

/// Tag lanes per chunk.
pub(crate) const LANES: usize = TAGS_PER_CHUNK / LANE_WIDTH;

/// Tag byte of a slot that has never held an entry (or was reset).
/// High bit set, second-high bit clear. Terminates probes.
pub(crate) const EMPTY: u8 = 0x80;

/// Tag byte of a tombstone. High two bits set. Probes continue past it.
pub(crate) const DELETED: u8 = 0xC0;

/// Low seven bits of a digest become the occupied-slot fingerprint.
pub(crate) const TAG_BITS: u32 = 7;
pub(crate) const TAG_MASK: u64 = 0x7F;

/// Default slot capacity of `TagMap::new()`. One page worth of tags; with
/// page-backed allocators a smaller table saves nothing.
pub const DEFAULT_INIT_CAPACITY: usize = 4096;

/// Key sizes above this get their slot address prefetched during probes.
pub(crate) const PREFETCH_BOUND: usize = 8;

#[inline]
pub(crate) fn is_occupied(tag: u8) -> bool {
    tag & EMPTY == 0
}

/// Node storage of one chunk: where the 64 keys and values live.
///
/// Two policies exist. [`Combined`] interleaves `(K, V)` pairs and is the
/// default. [`Split`] stores all 64 keys contiguously before the values,
/// which keeps key scans denser in cache for small key types.
///
/// # Safety
///
/// Implementations must return stable, non-overlapping addresses within
/// `self` for each `n < 64`, valid for reads and writes of `Key`/`Val`
/// whether or not the slot is initialized.
pub unsafe trait Nodes {
    type Key;
    type Val;

    /// Address of slot `n`'s key. `this` must point into a live chunk
    /// allocation; the slot may be uninitialized.
    unsafe fn key_ptr(this: *mut Self, n: usize) -> *mut Self::Key;

    /// Address of slot `n`'s value. Same requirements as [`Nodes::key_ptr`].
    unsafe fn val_ptr(this: *mut Self, n: usize) -> *mut Self::Val;
}

/// One slot of the combined layout.
#[repr(C)]
pub(crate) struct Node<K, V> {
    key: K,
    val: V,
}

/// Interleaved `(K, V)` node storage. The default policy.
#[repr(C)]
pub struct Combined<K, V> {
    nodes: [MaybeUninit<Node<K, V>>; TAGS_PER_CHUNK],
}

unsafe impl<K, V> Nodes for Combined<K, V> {
    type Key = K;
    type Val = V;

    #[inline(always)]
    unsafe fn key_ptr(this: *mut Self, n: usize) -> *mut K {
        let node = ptr::addr_of_mut!((*this).nodes) as *mut Node<K, V>;
        ptr::addr_of_mut!((*node.add(n)).key)
    }

    #[inline(always)]
    unsafe fn val_ptr(this: *mut Self, n: usize) -> *mut V {
        let node = ptr::addr_of_mut!((*this).nodes) as *mut Node<K, V>;
        ptr::addr_of_mut!((*node.add(n)).val)
    }
}

/// Keys-then-values node storage for small key/value types.
#[repr(C)]
pub struct Split<K, V> {
    keys: [MaybeUninit<K>; TAGS_PER_CHUNK],
    vals: [MaybeUninit<V>; TAGS_PER_CHUNK],
}

unsafe impl<K, V> Nodes for Split<K, V> {
    type Key = K;
    type Val = V;

    #[inline(always)]
    unsafe fn key_ptr(this: *mut Self, n: usize) -> *mut K {
        (ptr::addr_of_mut!((*this).keys) as *mut K).add(n)
    }

    #[inline(always)]
    unsafe fn val_ptr(this: *mut Self, n: usize) -> *mut V {
        (ptr::addr_of_mut!((*this).vals) as *mut V).add(n)
    }
}

/// A chunk: the tag line at offset 0, node storage behind it.
///
/// Chunks are never constructed by value. They live in zeroed allocations
/// from a [`crate::ChunkAllocator`] and are manipulated through raw
/// pointers only; a slot's key/value storage is initialized iff its tag is
/// occupied.
#[repr(C, align(64))]
pub(crate) struct Chunk<N> {
    tags: [u8; TAGS_PER_CHUNK],
    nodes: N,
}

impl<N: Nodes> Chunk<N> {
    /// Byte distance from a chunk's last tag to the next chunk's first tag,
    /// minus one. The iterator hops this when crossing chunks.
    pub(crate) const NODE_SPAN: usize = std::mem::size_of::<Self>() - TAGS_PER_CHUNK;

    /// The chunk's tag line; also the chunk's own address (tags sit at
    /// offset 0, which is what lets a tag pointer recover its chunk).
    #[inline(always)]
    pub(crate) unsafe fn tags_ptr(this: *const Self) -> *const u8 {
        ptr::addr_of!((*this).tags) as *const u8
    }

    #[inline(always)]
    pub(crate) unsafe fn tag(this: *const Self, n: usize) -> u8 {
        *Self::tags_ptr(this).add(n)
    }

    #[inline(always)]
    pub(crate) unsafe fn set_tag(this: *mut Self, n: usize, tag: u8) {
        *(Self::tags_ptr(this) as *mut u8).add(n) = tag;
    }

    /// Pointer to the first tag byte of lane `lane`.
    #[inline(always)]
    pub(crate) unsafe fn lane_ptr(this: *const Self, lane: usize) -> *const u8 {
        Self::tags_ptr(this).add(lane * LANE_WIDTH)
    }

    #[inline(always)]
    pub(crate) unsafe fn key_ptr(this: *mut Self, n: usize) -> *mut N::Key {
        N::key_ptr(ptr::addr_of_mut!((*this).nodes), n)
    }

    #[inline(always)]
    pub(crate) unsafe fn val_ptr(this: *mut Self, n: usize) -> *mut N::Val {
        N::val_ptr(ptr::addr_of_mut!((*this).nodes), n)
    }

    /// Write `tag` and construct the key/value of slot `n` in place.
    /// Any previous occupant must already be dead.
    #[inline(always)]
    pub(crate) unsafe fn write_entry(this: *mut Self, n: usize, tag: u8, key: N::Key, val: N::Val) {
        Self::set_tag(this, n, tag);
        ptr::write(Self::key_ptr(this, n), key);
        ptr::write(Self::val_ptr(this, n), val);
    }

    /// Move slot `from` of `src` into slot `to` of `dst`, carrying the tag.
    /// `src`'s tag is left untouched; the caller decides what it becomes.
    #[inline(always)]
    pub(crate) unsafe fn move_entry(src: *mut Self, from: usize, dst: *mut Self, to: usize) {
        Self::set_tag(dst, to, Self::tag(src, from));
        ptr::write(Self::key_ptr(dst, to), ptr::read(Self::key_ptr(src, from)));
        ptr::write(Self::val_ptr(dst, to), ptr::read(Self::val_ptr(src, from)));
    }

    /// Set every tag of the chunk to [`EMPTY`].
    #[inline]
    pub(crate) unsafe fn reset_tags(this: *mut Self) {
        ptr::write_bytes(Self::tags_ptr(this) as *mut u8, EMPTY, TAGS_PER_CHUNK);
    }
}

// Compile-time layout checks, per instantiation shape: tags at offset 0,
// cache-line alignment, whole-cache-line sizes.
const _: () = assert!(std::mem::size_of::<Chunk<Combined<u64, u64>>>() == 64 + 64 * 16);
const _: () = assert!(std::mem::align_of::<Chunk<Combined<u64, u64>>>() == 64);
const _: () = assert!(std::mem::size_of::<Chunk<Split<u32, u8>>>() % 64 == 0);
const _: () = assert!(std::mem::align_of::<Chunk<Split<u32, u8>>>() == 64);
const _: () = assert!(EMPTY & 0xC0 == 0x80 && DELETED & 0xC0 == 0xC0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_classes() {
        assert!(!is_occupied(EMPTY));
        assert!(!is_occupied(DELETED));
        for tag in 0u8..=0x7F {
            assert!(is_occupied(tag));
        }
    }

    #[test]
    fn split_layout_addresses() {
        // 64 keys must precede the first value.
        let mut block: MaybeUninit<Chunk<Split<u32, u16>>> = MaybeUninit::uninit();
        let chunk = block.as_mut_ptr();
        unsafe {
            let k0 = Chunk::key_ptr(chunk, 0) as usize;
            let k63 = Chunk::key_ptr(chunk, 63) as usize;
            let v0 = Chunk::val_ptr(chunk, 0) as usize;
            assert_eq!(k63 - k0, 63 * std::mem::size_of::<u32>());
            assert!(v0 >= k0 + 64 * std::mem::size_of::<u32>());
        }
    }

    #[test]
    fn combined_layout_addresses() {
        let mut block: MaybeUninit<Chunk<Combined<u64, u64>>> = MaybeUninit::uninit();
        let chunk = block.as_mut_ptr();
        unsafe {
            let k0 = Chunk::key_ptr(chunk, 0) as usize;
            let v0 = Chunk::val_ptr(chunk, 0) as usize;
            let k1 = Chunk::key_ptr(chunk, 1) as usize;
            // key and value of one slot are adjacent, slots are contiguous
            assert_eq!(v0 - k0, std::mem::size_of::<u64>());
            assert_eq!(k1 - k0, 2 * std::mem::size_of::<u64>());
        }
    }
}
