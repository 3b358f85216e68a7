//! SIMD-probed hash map over cache-line chunks.
//!
//! `TagMap` stores entries in 64-slot chunks: one cache line of 7-bit tag
//! bytes followed by the key/value slots. A lookup hashes once, lands on a
//! home chunk, and compares 16 tags per SIMD instruction, so full key
//! comparisons are rare. Growth doubles the table when an insert exhausts
//! its chunk's probe window; with the default unix allocator the doubling
//! happens in place inside one large virtual reservation.
//!
//! ```
//! use tagmap::TagMap;
//!
//! let mut squares: TagMap<u64, u64> = TagMap::new();
//! squares.insert(12, 144);
//! assert_eq!(squares.get(&12), Some(&144));
//! assert!(squares.erase(&12));
//! assert!(squares.is_empty());
//! ```
//!
//! The table is single-threaded: nothing inside locks, and iterators do
//! not survive a rehash.

mod alloc;
mod hash;
mod iter;
mod layout;
mod map;
mod probe;

pub use alloc::{ChunkAllocator, DefaultAllocator, HeapAlloc};
#[cfg(unix)]
pub use alloc::{PageAlloc, ReserveAlloc, DEFAULT_RESERVE_BYTES};
pub use hash::DefaultHashBuilder;
pub use iter::{Cursor, Iter, IterMut};
pub use layout::{Combined, Nodes, Split, DEFAULT_INIT_CAPACITY};
pub use map::{SplitTagMap, TagMap};
