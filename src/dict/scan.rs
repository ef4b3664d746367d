//! Stateless full-table traversal.
//!
//! The scan cursor is incremented from the high-order bits down: reverse the
//! bits, add one, reverse again. Because bucket indices are the hash masked
//! by a power of two, and the smaller table's index is always a bit-prefix
//! of the larger one's, a cursor sequence driven this way never revisits the
//! expansions of an index it has already covered, no matter how often the
//! table doubles or halves between calls. That buys resize tolerance with no
//! auxiliary state at all; the price is that a bucket's whole chain must be
//! emitted in one call and that a key may be reported more than once.

use std::ptr::NonNull;

use super::*;

/// Relocation callbacks used by [`Dict::scan_defrag`]. Each hook receives a
/// live allocation and returns its new address, or null when the allocation
/// was not moved. The embedded hooks bracket entry moves so auxiliary
/// indexes pointing into the entry's key buffer can be fixed up.
pub trait Defragger {
    /// Offered the allocation behind an entry handle (never an inline key).
    fn realloc_entry(&mut self, entry: *mut u8) -> *mut u8;

    fn realloc_key(&mut self, key: *mut u8) -> *mut u8 {
        let _ = key;
        std::ptr::null_mut()
    }

    fn realloc_val(&mut self, val: *mut u8) -> *mut u8 {
        let _ = val;
        std::ptr::null_mut()
    }

    /// An embedded entry is about to be offered to
    /// [`realloc_entry`](Defragger::realloc_entry).
    fn embedded_entry_moving(&mut self, entry: &Entry) {
        let _ = entry;
    }

    /// The embedded entry move finished; `entry` is the relocated entry, or
    /// `None` when it stayed in place.
    fn embedded_entry_moved(&mut self, entry: Option<&Entry>) {
        let _ = entry;
    }
}

/// Rewrites one bucket's chain through the defragger, updating the bucket
/// head and every link to any relocated entry.
fn defrag_bucket(bucket: NonNull<EntryPtr>, defrag: &mut dyn Defragger) {
    let mut slot = bucket;
    loop {
        let de = unsafe { *slot.as_ref() };
        if de.is_null() {
            break;
        }
        let mut current = de;
        if de.is_inline_key() {
            let newkey = defrag.realloc_key(de.key());
            if !newkey.is_null() {
                current = EntryPtr::inline_key(newkey);
                unsafe { *slot.as_ptr() = current };
            }
        } else if de.is_no_value() {
            let newkey = defrag.realloc_key(de.key());
            let moved = de.defrag_move(defrag);
            if !moved.is_null() {
                current = moved;
                unsafe { *slot.as_ptr() = current };
            }
            if !newkey.is_null() {
                current.set_key(newkey);
            }
        } else if de.is_embedded() {
            defrag.embedded_entry_moving(de.as_public());
            let moved = de.defrag_move(defrag);
            if !moved.is_null() {
                current = moved;
                unsafe { *slot.as_ptr() = current };
                defrag.embedded_entry_moved(Some(current.as_public()));
            } else {
                defrag.embedded_entry_moved(None);
            }
            let newval = defrag.realloc_val(unsafe { current.value().val });
            if !newval.is_null() {
                current.set_value(Value { val: newval });
            }
        } else {
            let newkey = defrag.realloc_key(de.key());
            let newval = defrag.realloc_val(unsafe { de.value().val });
            let moved = de.defrag_move(defrag);
            if !moved.is_null() {
                current = moved;
                unsafe { *slot.as_ptr() = current };
            }
            if !newkey.is_null() {
                current.set_key(newkey);
            }
            if !newval.is_null() {
                current.set_value(Value { val: newval });
            }
        }
        match current.next_slot() {
            Some(next_slot) => slot = next_slot,
            None => break,
        }
    }
}

impl EntryPtr {
    /// Offers this entry's allocation to the defragger, preserving the
    /// variant tag. Returns the retagged handle or null when unmoved.
    fn defrag_move(self, defrag: &mut dyn Defragger) -> EntryPtr {
        debug_assert!(!self.is_inline_key());
        let tag = self.raw_tag();
        let moved = defrag.realloc_entry(self.untagged_ptr());
        if moved.is_null() {
            EntryPtr::null()
        } else {
            EntryPtr::retag(moved, tag)
        }
    }
}

impl<T: DictType> Dict<T> {
    /// One step of a stateless traversal. Start with a cursor of zero, feed
    /// each returned cursor into the next call, and stop when zero comes
    /// back: every key present for the whole traversal has been reported at
    /// least once, regardless of grows and shrinks between calls. Keys may
    /// be reported multiple times, and a bucket's entire chain is emitted
    /// per call.
    pub fn scan<F: FnMut(&Entry)>(&mut self, cursor: u64, mut f: F) -> u64 {
        self.scan_inner(cursor, &mut f, None)
    }

    /// Like [`scan`](Dict::scan), but first offers each visited bucket's
    /// allocations to `defrag` for relocation, rewriting the chain links
    /// accordingly.
    pub fn scan_defrag<F, D>(&mut self, cursor: u64, mut f: F, defrag: &mut D) -> u64
    where
        F: FnMut(&Entry),
        D: Defragger,
    {
        self.scan_inner(cursor, &mut f, Some(defrag))
    }

    fn defrag_bucket_at(&mut self, table: usize, idx: usize, defrag: &mut dyn Defragger) {
        let buckets = self.tables[table]
            .as_mut()
            .expect("bucket array must be allocated");
        defrag_bucket(NonNull::from(&mut buckets[idx]), defrag);
    }

    fn emit_bucket(&self, table: usize, idx: usize, f: &mut dyn FnMut(&Entry)) {
        let mut de = self.bucket_at(table, idx);
        while !de.is_null() {
            let next = de.next();
            f(de.as_public());
            de = next;
        }
    }

    fn scan_inner(
        &mut self,
        mut v: u64,
        f: &mut dyn FnMut(&Entry),
        mut defrag: Option<&mut dyn Defragger>,
    ) -> u64 {
        if self.size() == 0 {
            return 0;
        }

        // The callback may reach back into lookups; no bucket may migrate
        // mid-scan.
        self.pause_rehash += 1;

        if !self.is_rehashing() {
            let m0 = self.table_mask(0);
            if let Some(d) = defrag.as_mut() {
                self.defrag_bucket_at(0, (v & m0) as usize, &mut **d);
            }
            self.emit_bucket(0, (v & m0) as usize, f);

            // Force the bits above the mask so the reversed increment
            // carries straight into the index bits.
            v |= !m0;
            v = v.reverse_bits();
            v = v.wrapping_add(1);
            v = v.reverse_bits();
        } else {
            // Walk the smaller table's bucket, then every bucket of the
            // larger table that expands it.
            let (small, large) = if self.table_size(0) > self.table_size(1) {
                (1, 0)
            } else {
                (0, 1)
            };
            let m0 = self.table_mask(small);
            let m1 = self.table_mask(large);

            if let Some(d) = defrag.as_mut() {
                self.defrag_bucket_at(small, (v & m0) as usize, &mut **d);
            }
            self.emit_bucket(small, (v & m0) as usize, f);

            loop {
                if let Some(d) = defrag.as_mut() {
                    self.defrag_bucket_at(large, (v & m1) as usize, &mut **d);
                }
                self.emit_bucket(large, (v & m1) as usize, f);

                v |= !m1;
                v = v.reverse_bits();
                v = v.wrapping_add(1);
                v = v.reverse_bits();

                if v & (m0 ^ m1) == 0 {
                    break;
                }
            }
        }

        self.pause_rehash -= 1;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::ptr::without_provenance_mut;

    struct AddrKeys;

    unsafe impl DictType for AddrKeys {
        fn hash(key: *const u8) -> u64 {
            gen_hash(&(key.addr() as u64).to_le_bytes())
        }
    }

    fn key(n: u64) -> *mut u8 {
        without_provenance_mut(n as usize)
    }

    fn collect_scan(d: &mut Dict<AddrKeys>) -> HashSet<u64> {
        let mut seen = HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = d.scan(cursor, |e| {
                seen.insert(e.key().addr() as u64);
            });
            if cursor == 0 {
                break;
            }
        }
        seen
    }

    #[test]
    fn reversed_increment_permutes_every_mask() {
        // The cursor sequence must visit each index below the mask exactly
        // once before wrapping to zero.
        for exp in [2u32, 3, 6, 9] {
            let mask = (1u64 << exp) - 1;
            let mut v = 0u64;
            let mut seen = HashSet::new();
            loop {
                assert!(seen.insert(v & mask), "index revisited before wrap");
                v |= !mask;
                v = v.reverse_bits().wrapping_add(1).reverse_bits();
                if v == 0 {
                    break;
                }
            }
            assert_eq!(seen.len() as u64, mask + 1);
        }
    }

    #[test]
    fn scan_reports_all_keys_of_a_quiet_table() {
        let mut d = Dict::<AddrKeys>::new();
        for n in 1..=777 {
            d.add(key(n), key(n));
        }
        let seen = collect_scan(&mut d);
        assert_eq!(seen.len(), 777);
        for n in 1..=777 {
            assert!(seen.contains(&n));
        }
    }

    #[test]
    fn scan_mid_rehash_covers_both_tables() {
        let mut d = Dict::<AddrKeys>::new();
        for n in 1..=512 {
            d.add(key(n), key(n));
        }
        d.expand(4096);
        d.rehash(7);
        assert!(d.is_rehashing());
        let seen = collect_scan(&mut d);
        assert_eq!(seen.len(), 512);
    }

    #[test]
    fn scan_survives_concurrent_growth() {
        let mut d = Dict::<AddrKeys>::new();
        for n in 1..=1000 {
            d.add(key(n), key(n));
        }
        let mut seen = HashSet::new();
        let mut cursor = 0;
        let mut extra = 10_000u64;
        loop {
            cursor = d.scan(cursor, |e| {
                seen.insert(e.key().addr() as u64);
            });
            if cursor == 0 {
                break;
            }
            // Grow the table underneath the traversal.
            for _ in 0..10 {
                extra += 1;
                d.add(key(extra), key(extra));
            }
            d.rehash(2);
        }
        for n in 1..=1000 {
            assert!(seen.contains(&n), "key {n} missed by scan under growth");
        }
    }

    #[test]
    fn scan_survives_concurrent_shrink() {
        let mut d = Dict::<AddrKeys>::new();
        for n in 1..=64 {
            d.add(key(n), key(n));
        }
        for n in 1..=1000u64 {
            d.add(key(10_000 + n), key(n));
        }
        while d.rehash(100) {}

        // Keys 1..=64 stay put while the bulk is deleted mid-scan.
        let mut seen = HashSet::new();
        let mut cursor = 0;
        let mut doomed = 10_001u64;
        loop {
            cursor = d.scan(cursor, |e| {
                seen.insert(e.key().addr() as u64);
            });
            if cursor == 0 {
                break;
            }
            for _ in 0..20 {
                if doomed <= 11_000 {
                    d.remove(key(doomed));
                    doomed += 1;
                }
            }
            d.rehash(2);
        }
        for n in 1..=64 {
            assert!(seen.contains(&n), "persistent key {n} missed by scan under shrink");
        }
    }

    struct CountingDefrag {
        moved: usize,
    }

    impl Defragger for CountingDefrag {
        fn realloc_entry(&mut self, entry: *mut u8) -> *mut u8 {
            // Normal entries are 24 bytes; clone the allocation and release
            // the original, the way a compacting allocator would.
            unsafe {
                let layout = std::alloc::Layout::from_size_align(24, 8).expect("entry layout");
                let fresh = std::alloc::alloc(layout);
                assert!(!fresh.is_null());
                std::ptr::copy_nonoverlapping(entry, fresh, 24);
                std::alloc::dealloc(entry, layout);
                self.moved += 1;
                fresh
            }
        }
    }

    #[test]
    fn scan_defrag_relocates_entries_without_losing_keys() {
        let mut d = Dict::<AddrKeys>::new();
        for n in 1..=300 {
            d.add(key(n), key(n * 2));
        }
        let mut defrag = CountingDefrag { moved: 0 };
        let mut seen = HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = d.scan_defrag(
                cursor,
                |e| {
                    seen.insert(e.key().addr() as u64);
                },
                &mut defrag,
            );
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 300);
        assert_eq!(defrag.moved, 300);
        // Every relocated entry must still be reachable through the chains.
        for n in 1..=300 {
            assert_eq!(d.fetch_value(key(n)), Some(key(n * 2)));
        }
    }

    proptest! {
        #[test]
        fn scan_matches_key_set(keys in prop::collection::hash_set(1u64..1_000_000, 1..600)) {
            let mut d = Dict::<AddrKeys>::new();
            for &k in &keys {
                d.add(key(k), key(k));
            }
            let seen = collect_scan(&mut d);
            prop_assert_eq!(seen, keys);
        }
    }
}
