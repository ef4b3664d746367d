//! The hash seed is process-wide, so this check lives in its own test
//! binary: installing a seed must happen before any table hashes a key.

use std::ptr::without_provenance_mut;

use stepdict::dict::gen_case_hash;
use stepdict::dict::gen_hash;
use stepdict::dict::hash_seed;
use stepdict::dict::set_hash_seed;
use stepdict::dict::Dict;
use stepdict::dict::DictType;

struct AddrKeys;

unsafe impl DictType for AddrKeys {
    fn hash(key: *const u8) -> u64 {
        gen_hash(&(key.addr() as u64).to_le_bytes())
    }
}

#[test]
fn installed_seed_is_observed_and_stable() {
    let seed = *b"0123456789abcdef";
    set_hash_seed(seed);
    assert_eq!(hash_seed(), seed);

    // With a fixed seed the keyed hash is a pure function.
    let h = gen_hash(b"meridian");
    assert_eq!(h, gen_hash(b"meridian"));
    assert_ne!(h, gen_hash(b"meridiam"));
    assert_eq!(gen_case_hash(b"MERIDIAN"), gen_case_hash(b"meridian"));

    // Tables built under the installed seed behave normally.
    let key = |n: u64| without_provenance_mut::<u8>(n as usize);
    let mut d = Dict::<AddrKeys>::new();
    for n in 1..=200 {
        assert!(d.add(key(n), key(n)));
    }
    while d.rehash(100) {}
    for n in 1..=200 {
        assert_eq!(d.fetch_value(key(n)), Some(key(n)));
    }
}
