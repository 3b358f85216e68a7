/// The table: chunked storage probed 16 tags at a time.
///
/// `TagMap` hashes a key once, derives a home chunk, a 7-bit fingerprint
/// and a start lane, then scans the chunk's four tag lanes with the probe
/// engine. An EMPTY slot terminates a probe; DELETED slots are walked past
/// and reclaimed by later inserts or wholesale by a rehash. Growth is
/// triggered by probe-window exhaustion rather than a load-factor bound,
/// and takes the relocating or the in-place path depending on the
/// configured allocator.
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::mem;
use std::ops::Index;
use std::ptr::{self, NonNull};

use log::debug;

use crate::alloc::{ChunkAllocator, DefaultAllocator};
use crate::hash::{chunk_index, mirror_bit, prefetch_read, start_lane, tag_of, DefaultHashBuilder};
use crate::iter::{decompose, Cursor, Iter, IterMut};
use crate::layout::{
    is_occupied, Chunk, Combined, Nodes, Split, DEFAULT_INIT_CAPACITY, DELETED, EMPTY, LANES,
    LANE_WIDTH, LOG_TAGS_PER_CHUNK, PREFETCH_BOUND, TAGS_PER_CHUNK,
};
use crate::probe::{occupied_mask, Lane, MaskIter};

/// Hash map over cache-line chunks with SIMD tag probing.
///
/// `S` is the hasher ([`DefaultHashBuilder`] = ahash), `N` the node-storage
/// policy ([`Combined`] by default, [`Split`] for small types), `A` the
/// chunk allocator (in-place reserving on unix). The map is single
/// threaded: no operation blocks, and a rehash invalidates every
/// outstanding iterator.
pub struct TagMap<K, V, S = DefaultHashBuilder, N = Combined<K, V>, A = DefaultAllocator>
where
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator,
{
    chunks: NonNull<Chunk<N>>,
    /// log2 of the slot capacity; chunk count is `1 << (log_incr - 6)`.
    log_incr: u32,
    npairs: usize,
    hash_builder: S,
    alloc: A,
    _marker: PhantomData<(K, V)>,
}

/// `TagMap` with the keys-then-values node layout.
pub type SplitTagMap<K, V, S = DefaultHashBuilder, A = DefaultAllocator> =
    TagMap<K, V, S, Split<K, V>, A>;

/// Where an insert probe ended up.
enum Placed<M> {
    /// A fresh entry was written at this tag address.
    Inserted(*const u8),
    /// The key already lives here; the value constructor comes back unused.
    Existing(*const u8, M),
}

/// Move `slot` of `src` into the first free slot of a chunk being filled
/// front-to-back per lane, scanning lanes from `start`. `counters` tracks
/// how many entries each destination lane already took.
///
/// # Safety
/// `dst` must be a chunk whose slots below the counters are the only
/// initialized ones; `slot` of `src` must be occupied.
#[inline]
unsafe fn place_fresh<N: Nodes>(
    dst: *mut Chunk<N>,
    counters: &mut [u8; LANES],
    start: usize,
    src: *mut Chunk<N>,
    slot: usize,
) {
    for j in 0..LANES {
        let lane_idx = (start + j) & (LANES - 1);
        let inner = counters[lane_idx] as usize;
        if inner < LANE_WIDTH {
            Chunk::<N>::move_entry(src, slot, dst, lane_idx * LANE_WIDTH + inner);
            counters[lane_idx] += 1;
            return;
        }
    }
    debug_assert!(false, "destination chunk overflow during growth");
}

/// Re-home the displaced stayers of one chunk after an in-place doubling.
///
/// `occ` holds each lane's occupied slots (stayers only), `pending` the
/// absolute slot positions owed to each home lane, `good` how many of a
/// lane's occupants already belong there, `owed` which lanes have pending
/// entries. Each owed lane absorbs entries into its free slots; a lane
/// packed with its own entries overflows what it is still owed to the next
/// lane, which is sound because a packed lane never terminates a probe.
///
/// # Safety
/// The masks must describe `chunk` exactly as produced by the in-place
/// rehash partition pass.
unsafe fn repair_chunk<N: Nodes>(
    chunk: *mut Chunk<N>,
    mut occ: [u16; LANES],
    mut pending: [u64; LANES],
    mut good: [u8; LANES],
    mut owed: u32,
) {
    while owed != 0 {
        let mut progress = false;
        for j in 0..LANES {
            if owed & (1 << j) == 0 {
                continue;
            }
            while occ[j] != u16::MAX && pending[j] != 0 {
                let from = pending[j].trailing_zeros() as usize;
                pending[j] &= pending[j] - 1;
                let inner = (!occ[j]).trailing_zeros() as usize;
                Chunk::<N>::move_entry(chunk, from, chunk, j * LANE_WIDTH + inner);
                Chunk::<N>::set_tag(chunk, from, EMPTY);
                occ[j] |= 1 << inner;
                occ[from / LANE_WIDTH] &= !(1 << (from % LANE_WIDTH));
                good[j] += 1;
                progress = true;
            }
            if pending[j] == 0 {
                owed &= !(1 << j);
            } else if good[j] as usize == LANE_WIDTH {
                let next = (j + 1) & (LANES - 1);
                // owed entries already sitting in the overflow lane are
                // home now; the rest become owed to it
                let resident = ((pending[j] >> (next * LANE_WIDTH)) & 0xFFFF) as u16;
                pending[next] |= pending[j] & !(0xFFFFu64 << (next * LANE_WIDTH));
                occ[next] |= resident;
                good[next] += resident.count_ones() as u8;
                if pending[next] != 0 {
                    owed |= 1 << next;
                }
                pending[j] = 0;
                owed &= !(1 << j);
                progress = true;
            }
        }
        if !progress {
            break;
        }
    }
    if owed == 0 {
        return;
    }
    // A displacement cycle across saturated lanes cannot be untangled one
    // move at a time. Pull the remaining entries out and re-place them
    // through the normal scan: their freed slots guarantee room, and every
    // lane a placement skips is full and loses no further entries.
    let mut parked: Vec<(u8, usize, N::Key, N::Val)> = Vec::new();
    for j in 0..LANES {
        let mut slots = pending[j];
        while slots != 0 {
            let from = slots.trailing_zeros() as usize;
            slots &= slots - 1;
            parked.push((
                Chunk::<N>::tag(chunk, from),
                j,
                ptr::read(Chunk::<N>::key_ptr(chunk, from)),
                ptr::read(Chunk::<N>::val_ptr(chunk, from)),
            ));
            Chunk::<N>::set_tag(chunk, from, EMPTY);
        }
    }
    log::trace!("tagmap: re-placing {} entries from a displacement cycle", parked.len());
    for (tag, home, key, val) in parked {
        for j in 0..LANES {
            let lane_idx = (home + j) & (LANES - 1);
            let free = Lane::load(Chunk::<N>::lane_ptr(chunk, lane_idx)).empty();
            if free != 0 {
                let slot = lane_idx * LANE_WIDTH + free.trailing_zeros() as usize;
                Chunk::<N>::write_entry(chunk, slot, tag, key, val);
                break;
            }
        }
    }
}

impl<K, V, S, N, A> TagMap<K, V, S, N, A>
where
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator,
{
    /// Build a table with at least `capacity` slots, a hasher, and an
    /// allocator. Capacity rounds up to the next power of two, no smaller
    /// than one chunk.
    pub fn with_capacity_and_hasher_in(capacity: usize, hash_builder: S, mut alloc: A) -> Self {
        let slots = capacity.max(TAGS_PER_CHUNK).next_power_of_two();
        let log_incr = slots.trailing_zeros();
        let nchunks = slots >> LOG_TAGS_PER_CHUNK;
        let chunks: NonNull<Chunk<N>> =
            alloc.allocate(nchunks * mem::size_of::<Chunk<N>>()).cast();
        unsafe {
            for i in 0..nchunks {
                Chunk::<N>::reset_tags(chunks.as_ptr().add(i));
            }
        }
        TagMap {
            chunks,
            log_incr,
            npairs: 0,
            hash_builder,
            alloc,
            _marker: PhantomData,
        }
    }

    /// See [`TagMap::with_capacity_and_hasher_in`].
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self
    where
        A: Default,
    {
        Self::with_capacity_and_hasher_in(capacity, hash_builder, A::default())
    }

    /// Default-capacity table with the given hasher.
    pub fn with_hasher(hash_builder: S) -> Self
    where
        A: Default,
    {
        Self::with_capacity_and_hasher(DEFAULT_INIT_CAPACITY, hash_builder)
    }

    /// Live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.npairs
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.npairs == 0
    }

    /// Slot capacity, always a power of two.
    #[inline]
    pub fn capacity(&self) -> usize {
        1 << self.log_incr
    }

    #[inline]
    pub fn load_factor(&self) -> f64 {
        self.npairs as f64 / self.capacity() as f64
    }

    /// The table has no load-factor bound; it grows on probe exhaustion.
    #[inline]
    pub fn max_load_factor(&self) -> f64 {
        1.0
    }

    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    #[inline]
    fn chunk_count(&self) -> usize {
        1 << (self.log_incr - LOG_TAGS_PER_CHUNK)
    }

    #[inline]
    fn chunk_ptr(&self, index: usize) -> *mut Chunk<N> {
        debug_assert!(index < self.chunk_count());
        unsafe { self.chunks.as_ptr().add(index) }
    }

    #[inline]
    fn base_tag(&self) -> *const u8 {
        self.chunks.as_ptr() as *const u8
    }

    /// One chunk past the last: the end sentinel's tag address.
    #[inline]
    fn end_tag(&self) -> *const u8 {
        unsafe { self.chunks.as_ptr().add(self.chunk_count()) as *const u8 }
    }

    /// Iterator over all entries, storage order.
    pub fn iter(&self) -> Iter<'_, K, V, N> {
        unsafe { Iter::begin(self.base_tag(), self.end_tag()) }
    }

    /// Iterator with mutable values.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V, N> {
        unsafe { IterMut::begin(self.base_tag(), self.end_tag()) }
    }

    /// The end sentinel, for comparison against [`TagMap::find`] results.
    pub fn end(&self) -> Iter<'_, K, V, N> {
        Iter::at(self.end_tag(), self.end_tag())
    }

    /// Kill the entry behind `tag`: tombstone the slot, drop the payload.
    unsafe fn erase_tag(&mut self, tag: *const u8) {
        let (chunk, slot) = decompose::<N>(tag);
        Chunk::<N>::set_tag(chunk, slot, DELETED);
        ptr::drop_in_place(Chunk::<N>::key_ptr(chunk, slot));
        ptr::drop_in_place(Chunk::<N>::val_ptr(chunk, slot));
        self.npairs -= 1;
    }

    /// Erase the entry a cursor points at. Returns true, mirroring
    /// [`TagMap::erase`].
    ///
    /// # Safety
    /// `at` must come from an iterator of this table, its slot still
    /// occupied, with no rehash since it was taken.
    pub unsafe fn erase_at(&mut self, at: Cursor) -> bool {
        debug_assert!(is_occupied(*at.0.as_ptr()));
        self.erase_tag(at.0.as_ptr());
        true
    }

    /// Drop every live key/value. Tags are left as-is.
    unsafe fn drop_entries(&mut self) {
        if !mem::needs_drop::<K>() && !mem::needs_drop::<V>() {
            return;
        }
        for i in 0..self.chunk_count() {
            let chunk = self.chunk_ptr(i);
            let mut mask = occupied_mask(chunk as *const u8);
            while mask != 0 {
                let slot = mask.trailing_zeros() as usize;
                mask &= mask - 1;
                ptr::drop_in_place(Chunk::<N>::key_ptr(chunk, slot));
                ptr::drop_in_place(Chunk::<N>::val_ptr(chunk, slot));
            }
        }
    }

    /// Remove every entry. Capacity and allocation are kept.
    pub fn clear(&mut self) {
        unsafe {
            self.drop_entries();
            for i in 0..self.chunk_count() {
                Chunk::<N>::reset_tags(self.chunk_ptr(i));
            }
        }
        self.npairs = 0;
    }
}

impl<K, V, S, N, A> TagMap<K, V, S, N, A>
where
    K: Hash + Eq,
    S: BuildHasher,
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator,
{
    #[inline]
    fn hash_key(&self, key: &K) -> u64 {
        self.hash_builder.hash_one(key)
    }

    /// Probe for `key`. Returns the tag address of the matching slot.
    ///
    /// # Safety
    /// `hash` must be this table's digest of `key`.
    unsafe fn probe_find(&self, key: &K, hash: u64) -> Option<*const u8> {
        let chunk = self.chunk_ptr(chunk_index(hash, self.log_incr));
        prefetch_read(chunk);
        let tag = tag_of(hash);
        let start = start_lane(hash);
        if mem::size_of::<K>() > PREFETCH_BOUND {
            prefetch_read(Chunk::<N>::key_ptr(chunk, start * LANE_WIDTH));
        }
        for j in 0..LANES {
            let lane_idx = (start + j) & (LANES - 1);
            let lane = Lane::load(Chunk::<N>::lane_ptr(chunk, lane_idx));
            for bit in MaskIter(lane.match_tag(tag)) {
                let slot = lane_idx * LANE_WIDTH + bit;
                if *Chunk::<N>::key_ptr(chunk, slot) == *key {
                    return Some((chunk as *const u8).add(slot));
                }
            }
            // an empty slot proves no later lane can hold the key
            if lane.empty() != 0 {
                return None;
            }
        }
        None
    }

    /// The insert probe: find the key, or claim a slot for it.
    ///
    /// An EMPTY slot is claimed outright. The first tombstone seen is
    /// remembered and claimed once an EMPTY anywhere later proves the key
    /// absent; a tombstone whose own lane also holds an EMPTY is claimed
    /// immediately for the same reason. A window with neither triggers a
    /// rehash, after which placement needs no duplicate check.
    ///
    /// # Safety
    /// `hash` must be this table's digest of `key`.
    unsafe fn probe_insert<M: FnOnce() -> V>(&mut self, key: K, hash: u64, make: M) -> Placed<M> {
        let chunk = self.chunk_ptr(chunk_index(hash, self.log_incr));
        prefetch_read(chunk);
        let tag = tag_of(hash);
        let start = start_lane(hash);
        if mem::size_of::<K>() > PREFETCH_BOUND {
            prefetch_read(Chunk::<N>::key_ptr(chunk, start * LANE_WIDTH));
        }
        let mut del_slot = None;
        for j in 0..LANES {
            let lane_idx = (start + j) & (LANES - 1);
            let lane = Lane::load(Chunk::<N>::lane_ptr(chunk, lane_idx));
            for bit in MaskIter(lane.match_tag(tag)) {
                let slot = lane_idx * LANE_WIDTH + bit;
                if *Chunk::<N>::key_ptr(chunk, slot) == key {
                    return Placed::Existing((chunk as *const u8).add(slot), make);
                }
            }
            match del_slot {
                None => {
                    let free = lane.empty_or_deleted();
                    if free != 0 {
                        let slot = lane_idx * LANE_WIDTH + free.trailing_zeros() as usize;
                        if Chunk::<N>::tag(chunk, slot) == DELETED {
                            if lane.empty() != 0 {
                                Chunk::<N>::write_entry(chunk, slot, tag, key, make());
                                return Placed::Inserted((chunk as *const u8).add(slot));
                            }
                            del_slot = Some(slot);
                        } else {
                            Chunk::<N>::write_entry(chunk, slot, tag, key, make());
                            return Placed::Inserted((chunk as *const u8).add(slot));
                        }
                    }
                }
                Some(slot) => {
                    if lane.empty() != 0 {
                        Chunk::<N>::write_entry(chunk, slot, tag, key, make());
                        return Placed::Inserted((chunk as *const u8).add(slot));
                    }
                }
            }
        }
        if let Some(slot) = del_slot {
            Chunk::<N>::write_entry(chunk, slot, tag, key, make());
            return Placed::Inserted((chunk as *const u8).add(slot));
        }
        // probe window exhausted
        self.rehash();
        let chunk = self.chunk_ptr(chunk_index(hash, self.log_incr));
        for j in 0..LANES {
            let lane_idx = (start + j) & (LANES - 1);
            let lane = Lane::load(Chunk::<N>::lane_ptr(chunk, lane_idx));
            let free = lane.empty();
            if free != 0 {
                let slot = lane_idx * LANE_WIDTH + free.trailing_zeros() as usize;
                Chunk::<N>::write_entry(chunk, slot, tag, key, make());
                return Placed::Inserted((chunk as *const u8).add(slot));
            }
        }
        // a doubling leaves a full chunk's keys split over two chunks;
        // both being full again means 128 slots for at most 65 keys
        panic!("tagmap: no free slot after growth");
    }

    /// Insert `key -> val`. Returns the entry's iterator and whether the
    /// key was newly added; an existing entry keeps its value.
    pub fn insert(&mut self, key: K, val: V) -> (Iter<'_, K, V, N>, bool) {
        self.insert_with(key, move || val)
    }

    /// Insert with a deferred value: `make` runs only if the key is absent.
    pub fn insert_with<M: FnOnce() -> V>(&mut self, key: K, make: M) -> (Iter<'_, K, V, N>, bool) {
        let hash = self.hash_key(&key);
        match unsafe { self.probe_insert(key, hash, make) } {
            Placed::Inserted(tag) => {
                self.npairs += 1;
                (Iter::at(tag, self.end_tag()), true)
            }
            Placed::Existing(tag, _unused) => (Iter::at(tag, self.end_tag()), false),
        }
    }

    /// Insert, overwriting the value if the key is present. The flag is
    /// true when the key was newly added.
    pub fn insert_or_assign(&mut self, key: K, val: V) -> (Iter<'_, K, V, N>, bool) {
        let hash = self.hash_key(&key);
        match unsafe { self.probe_insert(key, hash, move || val) } {
            Placed::Inserted(tag) => {
                self.npairs += 1;
                (Iter::at(tag, self.end_tag()), true)
            }
            Placed::Existing(tag, make) => {
                let (chunk, slot) = decompose::<N>(tag);
                unsafe {
                    *Chunk::<N>::val_ptr(chunk, slot) = make();
                }
                (Iter::at(tag, self.end_tag()), false)
            }
        }
    }

    /// Iterator at the key's entry, or [`TagMap::end`].
    pub fn find(&self, key: &K) -> Iter<'_, K, V, N> {
        let hash = self.hash_key(key);
        match unsafe { self.probe_find(key, hash) } {
            Some(tag) => Iter::at(tag, self.end_tag()),
            None => self.end(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let hash = self.hash_key(key);
        unsafe {
            let tag = self.probe_find(key, hash)?;
            let (chunk, slot) = decompose::<N>(tag);
            Some(&*Chunk::<N>::val_ptr(chunk, slot))
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let hash = self.hash_key(key);
        unsafe {
            let tag = self.probe_find(key, hash)?;
            let (chunk, slot) = decompose::<N>(tag);
            Some(&mut *Chunk::<N>::val_ptr(chunk, slot))
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let hash = self.hash_key(key);
        unsafe { self.probe_find(key, hash).is_some() }
    }

    /// 1 if the key is present, else 0.
    pub fn count(&self, key: &K) -> usize {
        self.contains_key(key) as usize
    }

    /// Reference to the key's value. The key must be present.
    pub fn at(&self, key: &K) -> &V {
        match self.get(key) {
            Some(val) => val,
            None => panic!("tagmap: key not present"),
        }
    }

    /// Mutable reference to the key's value. The key must be present.
    pub fn at_mut(&mut self, key: &K) -> &mut V {
        match self.get_mut(key) {
            Some(val) => val,
            None => panic!("tagmap: key not present"),
        }
    }

    /// Remove the key's entry. True when something was erased.
    pub fn erase(&mut self, key: &K) -> bool {
        let hash = self.hash_key(key);
        match unsafe { self.probe_find(key, hash) } {
            Some(tag) => {
                unsafe { self.erase_tag(tag) };
                true
            }
            None => false,
        }
    }

    fn rehash(&mut self) {
        debug!(
            "tagmap: probe window exhausted at {}/{} entries, doubling ({})",
            self.npairs,
            self.capacity(),
            if A::IN_PLACE { "in place" } else { "relocating" },
        );
        unsafe {
            if A::IN_PLACE {
                self.rehash_in_place();
            } else {
                self.rehash_relocate();
            }
        }
    }

    /// Double into a fresh chunk array and migrate every live entry.
    ///
    /// Each source chunk feeds exactly two descendants: itself and its
    /// mirror, picked per entry by the newly significant digest bit.
    /// Entries fill destination lanes front-to-back from their start lane;
    /// the rest of each descendant's tags become EMPTY afterwards, which
    /// also retires all tombstones.
    unsafe fn rehash_relocate(&mut self) {
        let old_nchunks = self.chunk_count();
        let chunk_bytes = mem::size_of::<Chunk<N>>();
        self.log_incr += 1;
        let old_chunks = self.chunks;
        let new_chunks: NonNull<Chunk<N>> = self
            .alloc
            .allocate(2 * old_nchunks * chunk_bytes)
            .cast();
        self.chunks = new_chunks;
        for i in 0..old_nchunks {
            let src = old_chunks.as_ptr().add(i);
            let mut placed = [[0u8; LANES]; 2];
            let mut mask = occupied_mask(src as *const u8);
            while mask != 0 {
                let slot = mask.trailing_zeros() as usize;
                mask &= mask - 1;
                let hash = self.hash_builder.hash_one(&*Chunk::<N>::key_ptr(src, slot));
                let hi = mirror_bit(hash, self.log_incr) as usize;
                let dst = new_chunks.as_ptr().add(i | (hi * old_nchunks));
                place_fresh::<N>(dst, &mut placed[hi], start_lane(hash), src, slot);
            }
            for (hi, counters) in placed.iter().enumerate() {
                let dst = new_chunks.as_ptr().add(i | (hi * old_nchunks));
                for lane_idx in 0..LANES {
                    for inner in counters[lane_idx] as usize..LANE_WIDTH {
                        Chunk::<N>::set_tag(dst, lane_idx * LANE_WIDTH + inner, EMPTY);
                    }
                }
            }
        }
        self.alloc
            .deallocate(old_chunks.cast(), old_nchunks * chunk_bytes);
    }

    /// Double in place: the allocator's next region is the mirror half of
    /// the existing array, so only entries whose new digest bit is set
    /// move chunks. Stayers displaced from their start lane are re-homed
    /// by the repair pass.
    unsafe fn rehash_in_place(&mut self) {
        let old_nchunks = self.chunk_count();
        let chunk_bytes = mem::size_of::<Chunk<N>>();
        self.log_incr += 1;
        let mirror: NonNull<Chunk<N>> = self.alloc.allocate(old_nchunks * chunk_bytes).cast();
        debug_assert_eq!(
            mirror.as_ptr() as usize,
            self.chunks.as_ptr() as usize + old_nchunks * chunk_bytes,
            "in-place allocator must extend the chunk array contiguously",
        );
        for i in 0..old_nchunks {
            let src = self.chunks.as_ptr().add(i);
            let dst = mirror.as_ptr().add(i);
            let tags = src as *mut u8;
            // tombstones die first: min against EMPTY maps DELETED to
            // EMPTY and preserves everything else
            for n in 0..TAGS_PER_CHUNK {
                let t = tags.add(n);
                *t = (*t).min(EMPTY);
            }
            let mut moved = [0u8; LANES];
            let mut occ = [0u16; LANES];
            let mut pending = [0u64; LANES];
            let mut good = [0u8; LANES];
            let mut owed = 0u32;
            let mut mask = occupied_mask(tags);
            while mask != 0 {
                let slot = mask.trailing_zeros() as usize;
                mask &= mask - 1;
                let hash = self.hash_builder.hash_one(&*Chunk::<N>::key_ptr(src, slot));
                let start = start_lane(hash);
                if mirror_bit(hash, self.log_incr) {
                    place_fresh::<N>(dst, &mut moved, start, src, slot);
                    Chunk::<N>::set_tag(src, slot, EMPTY);
                } else {
                    occ[slot / LANE_WIDTH] |= 1 << (slot % LANE_WIDTH);
                    if slot / LANE_WIDTH == start {
                        good[start] += 1;
                    } else {
                        pending[start] |= 1u64 << slot;
                        owed |= 1 << start;
                    }
                }
            }
            for lane_idx in 0..LANES {
                for inner in moved[lane_idx] as usize..LANE_WIDTH {
                    Chunk::<N>::set_tag(dst, lane_idx * LANE_WIDTH + inner, EMPTY);
                }
            }
            repair_chunk::<N>(src, occ, pending, good, owed);
        }
    }
}

impl<K, V, S, N, A> TagMap<K, V, S, N, A>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator + Default,
{
    /// Table with the default capacity, hasher, and allocator.
    pub fn new() -> Self {
        Self::with_capacity_and_hasher(DEFAULT_INIT_CAPACITY, S::default())
    }

    /// Table with at least `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, S::default())
    }
}

impl<K, V, S, N, A> Default for TagMap<K, V, S, N, A>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S, N, A> Drop for TagMap<K, V, S, N, A>
where
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator,
{
    fn drop(&mut self) {
        unsafe {
            self.drop_entries();
            let bytes = self.chunk_count() * mem::size_of::<Chunk<N>>();
            self.alloc.deallocate(self.chunks.cast(), bytes);
        }
    }
}

// The table is a single-threaded value type; sending or sharing it is
// governed by what it contains, not by the raw chunk pointer.
unsafe impl<K, V, S, N, A> Send for TagMap<K, V, S, N, A>
where
    K: Send,
    V: Send,
    S: Send,
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator + Send,
{
}

unsafe impl<K, V, S, N, A> Sync for TagMap<K, V, S, N, A>
where
    K: Sync,
    V: Sync,
    S: Sync,
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator + Sync,
{
}

impl<K, V, S, N, A> fmt::Debug for TagMap<K, V, S, N, A>
where
    K: fmt::Debug,
    V: fmt::Debug,
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<'k, K, V, S, N, A> Index<&'k K> for TagMap<K, V, S, N, A>
where
    K: Hash + Eq,
    S: BuildHasher,
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator,
{
    type Output = V;

    fn index(&self, key: &'k K) -> &V {
        self.at(key)
    }
}

impl<'a, K, V, S, N, A> IntoIterator for &'a TagMap<K, V, S, N, A>
where
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, N>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, S, N, A> IntoIterator for &'a mut TagMap<K, V, S, N, A>
where
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator,
{
    type Item = (&'a K, &'a mut V);
    type IntoIter = IterMut<'a, K, V, N>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<K, V, S, N, A> Extend<(K, V)> for TagMap<K, V, S, N, A>
where
    K: Hash + Eq,
    S: BuildHasher,
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, val) in iter {
            self.insert_or_assign(key, val);
        }
    }
}

impl<K, V, S, N, A> FromIterator<(K, V)> for TagMap<K, V, S, N, A>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let (lower, _) = iter.size_hint();
        let mut map = Self::with_capacity_and_hasher(lower.max(TAGS_PER_CHUNK), S::default());
        map.extend(iter);
        map
    }
}

#[cfg(test)]
impl<K, V, S, N, A> TagMap<K, V, S, N, A>
where
    N: Nodes<Key = K, Val = V>,
    A: ChunkAllocator,
{
    /// (occupied, deleted, empty) tag totals across all chunks.
    fn tag_census(&self) -> (usize, usize, usize) {
        let mut census = (0, 0, 0);
        for i in 0..self.chunk_count() {
            let chunk = self.chunk_ptr(i);
            for n in 0..TAGS_PER_CHUNK {
                match unsafe { Chunk::<N>::tag(chunk, n) } {
                    EMPTY => census.2 += 1,
                    DELETED => census.1 += 1,
                    _ => census.0 += 1,
                }
            }
        }
        census
    }
}
