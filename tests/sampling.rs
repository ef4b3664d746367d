//! Distribution checks for the random sampling primitives. These are
//! statistical: bounds are generous enough that failures indicate real bias,
//! not unlucky draws.

use std::collections::HashMap;
use std::collections::HashSet;
use std::ptr::without_provenance_mut;

use stepdict::dict::gen_hash;
use stepdict::dict::Dict;
use stepdict::dict::DictType;

struct AddrKeys;

unsafe impl DictType for AddrKeys {
    fn hash(key: *const u8) -> u64 {
        gen_hash(&(key.addr() as u64).to_le_bytes())
    }
}

fn key(n: u64) -> *mut u8 {
    without_provenance_mut(n as usize)
}

#[test]
fn random_entry_eventually_covers_small_tables() {
    let mut d = Dict::<AddrKeys>::new();
    for n in 1..=16 {
        d.add(key(n), key(n));
    }
    let mut seen = HashSet::new();
    for _ in 0..5000 {
        let e = d.random_entry().expect("non-empty table");
        seen.insert(e.key().addr() as u64);
        if seen.len() == 16 {
            break;
        }
    }
    assert_eq!(seen.len(), 16, "every key must be reachable by random picks");
}

#[test]
fn fair_random_entry_approaches_uniformity() {
    const KEYS: u64 = 64;
    const DRAWS: usize = 6400;

    let mut d = Dict::<AddrKeys>::new();
    for n in 1..=KEYS {
        d.add(key(n), key(n));
    }

    let mut counts: HashMap<u64, usize> = HashMap::new();
    for _ in 0..DRAWS {
        let e = d.fair_random_entry().expect("non-empty table");
        *counts.entry(e.key().addr() as u64).or_default() += 1;
    }

    let expected = DRAWS / KEYS as usize;
    for n in 1..=KEYS {
        let got = counts.get(&n).copied().unwrap_or(0);
        assert!(
            got >= expected / 5 && got <= expected * 5,
            "key {n} drawn {got} times, expected around {expected}"
        );
    }
}

#[test]
fn sampling_works_mid_rehash() {
    let mut d = Dict::<AddrKeys>::new();
    for n in 1..=512 {
        d.add(key(n), key(n));
    }
    d.expand(4096);

    let mut seen = HashSet::new();
    for _ in 0..2000 {
        if let Some(e) = d.random_entry() {
            seen.insert(e.key().addr() as u64);
        }
        for e in d.sample_entries(8) {
            seen.insert(e.key().addr() as u64);
        }
    }
    // Sampling is best effort, but mid-rehash it must still reach a broad
    // slice of the key space from both tables.
    assert!(seen.len() > 256, "only {} distinct keys sampled", seen.len());
    for &k in &seen {
        assert!((1..=512).contains(&k));
    }
}
