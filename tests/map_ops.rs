//! End-to-end behavior of the public table surface: the documented
//! boundary scenarios, the operation laws, and a randomized differential
//! run against a reference map.

use std::hash::{BuildHasher, Hasher};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tagmap::{DefaultHashBuilder, HeapAlloc, TagMap};

#[cfg(unix)]
use tagmap::{PageAlloc, ReserveAlloc};

type HeapMap<K, V> = TagMap<K, V, DefaultHashBuilder, tagmap::Combined<K, V>, HeapAlloc>;

fn seeded() -> DefaultHashBuilder {
    DefaultHashBuilder::with_seeds(11, 22, 33, 44)
}

#[test]
fn insert_thousand_squares_then_erase() {
    let mut map: HeapMap<u64, u64> = TagMap::with_capacity_and_hasher(4096, seeded());
    for k in 0..1000u64 {
        let (_, fresh) = map.insert(k, k * k);
        assert!(fresh);
    }
    assert_eq!(map.len(), 1000);
    assert_eq!(map.find(&500).peek(), Some((&500, &250000)));
    assert!(map.erase(&777));
    assert!(!map.erase(&777));
    assert_eq!(map.len(), 999);
}

#[test]
fn ten_thousand_random_keys_from_seed_one() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut keys = hashbrown::HashSet::new();
    while keys.len() < 10_000 {
        keys.insert(rng.random::<u64>());
    }

    let mut map: HeapMap<u64, u64> = TagMap::with_capacity_and_hasher(4096, seeded());
    assert_eq!(map.capacity(), 4096);
    for &k in &keys {
        map.insert(k, !k);
    }
    assert_eq!(map.len(), 10_000);
    for &k in &keys {
        assert_eq!(map.get(&k), Some(&!k));
    }
    assert!(map.capacity().is_power_of_two());
    // 10 000 entries cannot fit below 16384 slots
    assert!(map.capacity() >= 16384);
}

#[test]
fn duplicate_insert_vs_insert_or_assign() {
    let mut map: HeapMap<u64, u64> = TagMap::with_capacity_and_hasher(64, seeded());
    let (_, fresh) = map.insert(42, 1);
    assert!(fresh);
    let (it, fresh) = map.insert(42, 2);
    assert!(!fresh);
    assert_eq!(it.peek(), Some((&42, &1)));
    assert_eq!(map.at(&42), &1);

    let mut map: HeapMap<u64, u64> = TagMap::with_capacity_and_hasher(64, seeded());
    let (_, fresh) = map.insert_or_assign(42, 1);
    assert!(fresh);
    let (_, fresh) = map.insert_or_assign(42, 2);
    assert!(!fresh);
    assert_eq!(map.at(&42), &2);
    assert_eq!(map.len(), 1);
}

#[test]
fn erase_all_in_reverse_then_refill() {
    let mut map: HeapMap<u64, u64> = TagMap::with_capacity_and_hasher(4096, seeded());
    for k in 0..100u64 {
        map.insert(k, k);
    }
    for k in (0..100u64).rev() {
        assert!(map.erase(&k));
    }
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());

    let before = map.capacity();
    for k in 200..300u64 {
        let (_, fresh) = map.insert(k, k);
        assert!(fresh);
    }
    assert_eq!(map.len(), 100);
    // tombstones get reclaimed; they never force growth
    assert_eq!(map.capacity(), before);
    for k in 200..300u64 {
        assert_eq!(map.get(&k), Some(&k));
    }
}

/// Digest = key << 7: every key shares fingerprint 0 and, at one-chunk
/// capacity, the same home chunk, so the probe window can be exhausted on
/// demand; the bits above keep rehash splits meaningful.
#[derive(Default)]
struct CollidingHasher(u64);

impl Hasher for CollidingHasher {
    fn finish(&self) -> u64 {
        self.0 << 7
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 << 8) | b as u64;
        }
    }

    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }
}

#[derive(Clone, Default)]
struct CollidingBuild;

impl BuildHasher for CollidingBuild {
    type Hasher = CollidingHasher;

    fn build_hasher(&self) -> CollidingHasher {
        CollidingHasher::default()
    }
}

#[test]
fn forced_collisions_exhaust_window_and_double() {
    let mut map: TagMap<u64, u64, CollidingBuild, tagmap::Combined<u64, u64>, HeapAlloc> =
        TagMap::with_capacity_and_hasher(64, CollidingBuild);
    assert_eq!(map.capacity(), 64);
    for k in 0..64u64 {
        map.insert(k, k + 1);
    }
    // still one chunk: nothing could have grown yet
    assert_eq!(map.capacity(), 64);

    // the next colliding key finds no free slot and forces a doubling
    let (_, fresh) = map.insert(64, 65);
    assert!(fresh);
    assert_eq!(map.capacity(), 128);
    assert_eq!(map.len(), 65);
    for k in 0..=64u64 {
        assert_eq!(map.get(&k), Some(&(k + 1)), "key {k} lost across rehash");
    }

    // and the window is open again for further colliding keys
    let (_, fresh) = map.insert(66, 67);
    assert!(fresh);
    assert_eq!(map.get(&66), Some(&67));
}

#[test]
fn iterator_over_fresh_and_single_entry_table() {
    let mut map: HeapMap<u64, u64> = TagMap::with_capacity_and_hasher(64, seeded());
    assert!(map.iter().next().is_none());
    assert_eq!(map.find(&1), map.end());

    map.insert(5, 50);
    assert_eq!(map.iter().count(), 1);
    let begin = map.iter().next();
    assert_eq!(begin, Some((&5, &50)));
}

#[test]
fn enumeration_matches_inserted_minus_erased() {
    let mut map: HeapMap<u32, String> = TagMap::with_capacity_and_hasher(64, seeded());
    for k in 0..500u32 {
        map.insert(k, format!("v{k}"));
    }
    for k in (0..500u32).step_by(3) {
        map.erase(&k);
    }
    let mut seen: Vec<u32> = map.iter().map(|(k, _)| *k).collect();
    seen.sort_unstable();
    let expected: Vec<u32> = (0..500).filter(|k| k % 3 != 0).collect();
    assert_eq!(seen, expected);
    assert_eq!(map.len(), expected.len());
}

#[cfg(unix)]
#[test]
fn growth_preserves_entries_under_both_allocators() {
    let mut relocating: TagMap<u64, u64, _, tagmap::Combined<u64, u64>, PageAlloc> =
        TagMap::with_capacity_and_hasher(64, seeded());
    for k in 0..50_000u64 {
        relocating.insert(k, k ^ 0xAA);
    }
    assert_eq!(relocating.len(), 50_000);
    for k in 0..50_000u64 {
        assert_eq!(relocating.get(&k), Some(&(k ^ 0xAA)), "relocating lost {k}");
    }

    let mut in_place: TagMap<u64, u64, _, tagmap::Combined<u64, u64>, ReserveAlloc> =
        TagMap::with_capacity_and_hasher_in(64, seeded(), ReserveAlloc::with_reservation(1 << 28));
    for k in 0..50_000u64 {
        in_place.insert(k, k ^ 0xAA);
    }
    assert_eq!(in_place.len(), 50_000);
    for k in 0..50_000u64 {
        assert_eq!(in_place.get(&k), Some(&(k ^ 0xAA)), "in-place lost {k}");
    }
}

#[test]
fn differential_against_reference_map() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut map: HeapMap<u32, u64> = TagMap::with_capacity_and_hasher(64, seeded());
    let mut model: hashbrown::HashMap<u32, u64> = hashbrown::HashMap::new();

    for _ in 0..30_000 {
        let key = rng.random_range(0..2000u32);
        match rng.random_range(0..100u32) {
            0..=49 => {
                let val = rng.random::<u64>();
                let (_, fresh) = map.insert(key, val);
                assert_eq!(fresh, !model.contains_key(&key));
                model.entry(key).or_insert(val);
            }
            50..=69 => {
                let val = rng.random::<u64>();
                let (_, fresh) = map.insert_or_assign(key, val);
                assert_eq!(fresh, !model.contains_key(&key));
                model.insert(key, val);
            }
            70..=89 => {
                assert_eq!(map.erase(&key), model.remove(&key).is_some());
            }
            _ => {
                assert_eq!(map.get(&key), model.get(&key));
                assert_eq!(map.contains_key(&key), model.contains_key(&key));
                assert_eq!(map.count(&key), usize::from(model.contains_key(&key)));
            }
        }
        assert_eq!(map.len(), model.len());
    }

    for (k, v) in &model {
        assert_eq!(map.get(k), Some(v));
    }
    for (k, v) in map.iter() {
        assert_eq!(model.get(k), Some(v));
    }
}

#[test]
fn table_is_send_and_sync() {
    fn check<T: Send + Sync>() {}
    check::<TagMap<u64, String>>();
    check::<HeapMap<u64, String>>();
}
