//! Incrementally rehashing chained hash table.
//!
//! A [`Dict`] maps opaque keys to opaque values, or stores keys alone. It
//! keeps two power-of-two bucket arrays: all reads and writes address the
//! first, until a resize installs a second array and migration begins. From
//! then on every mutating operation moves one bucket's chain across, so a
//! resize is paid for in small cache-friendly installments rather than one
//! stop-the-world pass. A stateless reverse-bit cursor (see [`Dict::scan`])
//! makes full traversal possible even while the table is doubling or halving
//! under the caller's feet.
//!
//! Entries are tagged words rather than uniform allocations. The low bits of
//! a handle select one of four physical layouts, which lets a keys-only
//! table with pointer-sized odd keys store a singleton bucket with no
//! allocation at all, and lets byte-string keys live inline in their entry.
//! The [`DictType`] descriptor chooses the layout and supplies hashing,
//! equality and lifecycle callbacks.

mod entry;
mod iter;
mod scan;
mod stats;

pub use entry::Entry;
pub use entry::Value;
pub use iter::Iter;
pub use iter::RawIter;
pub use scan::Defragger;
pub use stats::DictStats;
pub use stats::TableStats;

use entry::EntryPtr;

use rand::thread_rng;
use rand::Rng;
use rand::RngCore;
use siphasher::sip::SipHasher13;
use std::fmt;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Once;
use std::time::Duration;
use std::time::Instant;

/// Tables never shrink below this many buckets.
pub const INITIAL_SIZE: usize = 1 << INITIAL_EXP;
const INITIAL_EXP: i8 = 2;

/// Fill ratio past which a table grows even under [`ResizePolicy::Avoid`].
const FORCE_RESIZE_RATIO: usize = 4;

/// A table is considered sparse enough to shrink when fewer than one bucket
/// in this many is populated.
const MIN_FILL_DIVISOR: usize = 8;

const FAIR_SAMPLE_SIZE: usize = 15;

/// Signature of the embedded-key serializer. Called once with a null
/// destination to size the buffer, then again to fill `dst` (capacity `cap`)
/// from `src` and store the header length through the final pointer. Returns
/// the number of bytes required.
pub type EmbedKeyFn = fn(*mut u8, usize, *const u8, *mut u8) -> usize;

/// Process-wide resize behavior, used to limit copy-on-write traffic while a
/// snapshotting fork is alive. `Avoid` raises the grow/shrink thresholds;
/// `Forbid` stops automatic resizing and rehash progress entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResizePolicy {
    Enable = 0,
    Avoid = 1,
    Forbid = 2,
}

static RESIZE_POLICY: AtomicU8 = AtomicU8::new(ResizePolicy::Enable as u8);

pub fn set_resize_policy(policy: ResizePolicy) {
    RESIZE_POLICY.store(policy as u8, Relaxed);
}

pub fn resize_policy() -> ResizePolicy {
    match RESIZE_POLICY.load(Relaxed) {
        0 => ResizePolicy::Enable,
        1 => ResizePolicy::Avoid,
        _ => ResizePolicy::Forbid,
    }
}

static HASH_SEED: [AtomicU64; 2] = [AtomicU64::new(0), AtomicU64::new(0)];
static SEED_PRESENT: AtomicBool = AtomicBool::new(false);
static SEED_INIT: Once = Once::new();

/// Installs the 128-bit seed used by [`gen_hash`] and [`gen_case_hash`].
/// Call before the first table is populated; changing the seed afterwards
/// orphans every key hashed under the old one.
pub fn set_hash_seed(seed: [u8; 16]) {
    HASH_SEED[0].store(u64::from_le_bytes(seed[..8].try_into().expect("seed half")), Relaxed);
    HASH_SEED[1].store(u64::from_le_bytes(seed[8..].try_into().expect("seed half")), Relaxed);
    SEED_PRESENT.store(true, Relaxed);
}

/// The current process-wide hash seed, self-initialized from the thread RNG
/// on first use when no seed was installed explicitly.
pub fn hash_seed() -> [u8; 16] {
    SEED_INIT.call_once(|| {
        if !SEED_PRESENT.load(Relaxed) {
            let mut seed = [0u8; 16];
            thread_rng().fill_bytes(&mut seed);
            set_hash_seed(seed);
        }
    });
    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&HASH_SEED[0].load(Relaxed).to_le_bytes());
    seed[8..].copy_from_slice(&HASH_SEED[1].load(Relaxed).to_le_bytes());
    seed
}

/// The default keyed hash: SipHash-1-3 under the process-wide seed.
pub fn gen_hash(data: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_key(&hash_seed());
    hasher.write(data);
    hasher.finish()
}

/// Case-insensitive variant of [`gen_hash`] for ASCII keys.
pub fn gen_case_hash(data: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_key(&hash_seed());
    for &b in data {
        hasher.write(&[b.to_ascii_lowercase()]);
    }
    hasher.finish()
}

/// Per-table type descriptor. Implementations bind a hash function, optional
/// key/value lifecycle callbacks and the flags that select the physical
/// entry layout.
///
/// # Safety
///
/// The table trusts the descriptor completely: `hash` and `KEY_COMPARE`
/// must agree (equal keys hash equally), `KEYS_ARE_ODD` promises that every
/// key pointer has its least significant bit set, `EMBED_KEY` must report a
/// stable length for a given source key, and all callbacks must uphold the
/// pointer conventions documented on each member. None of the callbacks may
/// re-enter the table they are invoked from.
pub unsafe trait DictType: Sized {
    /// Entries carry no value slot.
    const NO_VALUE: bool = false;
    /// Keys are serialized into the entry allocation itself via `EMBED_KEY`.
    const EMBEDDED_ENTRY: bool = false;
    /// Every key pointer has its least significant bit set, which allows a
    /// singleton bucket of a `NO_VALUE` table to store the key with no entry
    /// allocation.
    const KEYS_ARE_ODD: bool = false;
    /// Migrate the whole table inside the resize call instead of
    /// incrementally.
    const NO_INCREMENTAL_REHASH: bool = false;
    /// Size of the caller-owned metadata region attached to each table.
    const METADATA_BYTES: usize = 0;

    fn hash(key: *const u8) -> u64;

    /// Key equality. When absent, keys are compared by pointer identity.
    const KEY_COMPARE: Option<fn(*const u8, *const u8) -> bool> = None;
    /// Clones a key on insertion; the table then owns the clone.
    const KEY_DUP: Option<fn(*const u8) -> *mut u8> = None;
    const KEY_DESTRUCTOR: Option<fn(*mut u8)> = None;
    /// Destructor for the pointer member of the value slot.
    const VAL_DESTRUCTOR: Option<fn(*mut u8)> = None;
    /// Veto hook for resizing. Receives the new bucket-array size in bytes
    /// and the current fill ratio.
    const RESIZE_ALLOWED: Option<fn(usize, f64) -> bool> = None;
    const REHASHING_STARTED: Option<fn(&Dict<Self>)> = None;
    const REHASHING_COMPLETED: Option<fn(&Dict<Self>)> = None;
    /// Serializer for `EMBEDDED_ENTRY` tables; see [`EmbedKeyFn`].
    const EMBED_KEY: Option<EmbedKeyFn> = None;
}

/// Returned by [`Dict::try_expand`] when the bucket array could not be
/// allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TryExpandError;

impl fmt::Display for TryExpandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bucket array allocation failed")
    }
}

impl std::error::Error for TryExpandError {}

/// An insertion point produced by [`Dict::find_insert_position`], consumed
/// by [`Dict::insert_at_position`]. Stale positions (any table mutation in
/// between) are rejected by assertion.
pub struct InsertPosition {
    slot: NonNull<EntryPtr>,
}

/// An entry unlinked from the table but not yet released. Must be handed
/// back to [`Dict::free_unlinked_entry`]; dropping it leaks the entry.
pub struct UnlinkedEntry {
    raw: EntryPtr,
}

impl UnlinkedEntry {
    pub fn entry(&self) -> &Entry {
        self.raw.as_public()
    }

    pub fn entry_mut(&mut self) -> &mut Entry {
        self.raw.as_public_mut()
    }
}

/// A found entry held for deletion. Rehashing stays paused while this guard
/// is alive so the located chain cannot move. [`free`](TwoPhaseUnlink::free)
/// commits the deletion; dropping the guard abandons it.
pub struct TwoPhaseUnlink<'a, T: DictType> {
    dict: Option<&'a mut Dict<T>>,
    plink: NonNull<EntryPtr>,
    entry: EntryPtr,
    table: usize,
}

impl<'a, T: DictType> TwoPhaseUnlink<'a, T> {
    pub fn entry(&self) -> &Entry {
        self.entry.as_public()
    }

    /// Splices the entry out through the recorded back link, runs the
    /// destructors and resumes rehashing.
    pub fn free(mut self) {
        let dict = self.dict.take().expect("unlink already committed");
        dict.used[self.table] -= 1;
        unsafe { *self.plink.as_ptr() = self.entry.next() };
        Dict::<T>::free_entry_with_destructors(self.entry);
        dict.shrink_if_auto_resize_allowed();
        dict.pause_rehash -= 1;
        assert!(dict.pause_rehash >= 0, "rehash pause counter underflow");
    }
}

impl<'a, T: DictType> Drop for TwoPhaseUnlink<'a, T> {
    fn drop(&mut self) {
        if let Some(dict) = self.dict.take() {
            dict.pause_rehash -= 1;
            assert!(dict.pause_rehash >= 0, "rehash pause counter underflow");
        }
    }
}

/// The hash table. See the module docs for the overall design.
pub struct Dict<T: DictType> {
    tables: [Option<Box<[EntryPtr]>>; 2],
    size_exp: [i8; 2],
    used: [usize; 2],
    /// Next bucket of the first table awaiting migration, or -1 when no
    /// rehash is in progress.
    rehash_idx: isize,
    pause_rehash: i32,
    pause_auto_resize: i32,
    metadata: Box<[u8]>,
    _type: PhantomData<T>,
}

impl<T: DictType> Dict<T> {
    /// Creates an empty table after validating the descriptor's internal
    /// consistency.
    pub fn new() -> Self {
        if T::EMBEDDED_ENTRY {
            assert!(T::EMBED_KEY.is_some(), "embedded entries require an embed function");
            assert!(
                T::KEY_DUP.is_none() && T::KEY_DESTRUCTOR.is_none(),
                "embedded entries own their key bytes and take no key callbacks"
            );
        } else {
            assert!(T::EMBED_KEY.is_none(), "embed function requires the embedded entry flag");
        }
        Dict {
            tables: [None, None],
            size_exp: [-1, -1],
            used: [0, 0],
            rehash_idx: -1,
            pause_rehash: 0,
            pause_auto_resize: 0,
            metadata: vec![0u8; T::METADATA_BYTES].into_boxed_slice(),
            _type: PhantomData,
        }
    }

    /// Number of live entries across both tables.
    pub fn size(&self) -> usize {
        self.used[0] + self.used[1]
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Total bucket count across both tables.
    pub fn buckets(&self) -> usize {
        self.table_size(0) + self.table_size(1)
    }

    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx != -1
    }

    /// The caller-owned metadata region declared by the descriptor.
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut [u8] {
        &mut self.metadata
    }

    /// Hashes a key with this table's descriptor.
    pub fn hash_key(key: *const u8) -> u64 {
        T::hash(key)
    }

    pub fn pause_rehashing(&mut self) {
        self.pause_rehash += 1;
    }

    pub fn resume_rehashing(&mut self) {
        self.pause_rehash -= 1;
    }

    /// Suspends the automatic grow/shrink evaluation. Explicit resize calls
    /// still work.
    pub fn pause_auto_resize(&mut self) {
        self.pause_auto_resize += 1;
    }

    pub fn resume_auto_resize(&mut self) {
        self.pause_auto_resize -= 1;
    }

    fn table_size(&self, table: usize) -> usize {
        if self.size_exp[table] < 0 {
            0
        } else {
            1usize << self.size_exp[table]
        }
    }

    fn table_mask(&self, table: usize) -> u64 {
        if self.size_exp[table] < 0 {
            0
        } else {
            (1u64 << self.size_exp[table]) - 1
        }
    }

    pub(crate) fn bucket_at(&self, table: usize, idx: usize) -> EntryPtr {
        self.tables[table].as_ref().expect("bucket array must be allocated")[idx]
    }

    fn set_bucket(&mut self, table: usize, idx: usize, de: EntryPtr) {
        self.tables[table].as_mut().expect("bucket array must be allocated")[idx] = de;
    }

    /// Smallest exponent whose power of two covers `size`, floored at the
    /// initial table size.
    fn next_exp(size: usize) -> i8 {
        if size <= INITIAL_SIZE {
            return INITIAL_EXP;
        }
        if size >= isize::MAX as usize {
            return (usize::BITS - 1) as i8;
        }
        (usize::BITS - (size - 1).leading_zeros()) as i8
    }

    fn alloc_buckets(size: usize) -> Box<[EntryPtr]> {
        vec![EntryPtr::null(); size].into_boxed_slice()
    }

    fn try_alloc_buckets(size: usize) -> Option<Box<[EntryPtr]>> {
        let layout = std::alloc::Layout::array::<EntryPtr>(size).ok()?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) } as *mut EntryPtr;
        if ptr.is_null() {
            return None;
        }
        // Zeroed memory is the all-empty bucket array.
        Some(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, size)) })
    }

    fn resize_internal(&mut self, size: usize, fallible: bool) -> Result<bool, TryExpandError> {
        assert!(!self.is_rehashing(), "resize during rehash");

        let new_exp = Self::next_exp(size);
        let new_size = 1usize << new_exp;
        if new_size < size {
            return Ok(false);
        }
        if new_exp == self.size_exp[0] {
            return Ok(false);
        }

        let buckets = if fallible {
            match Self::try_alloc_buckets(new_size) {
                Some(b) => b,
                None => return Err(TryExpandError),
            }
        } else {
            Self::alloc_buckets(new_size)
        };

        // Install the target table even for the first initialization so the
        // started/completed hooks fire from one place.
        self.size_exp[1] = new_exp;
        self.used[1] = 0;
        self.tables[1] = Some(buckets);
        self.rehash_idx = 0;
        if let Some(hook) = T::REHASHING_STARTED {
            hook(self);
        }

        if self.tables[0].is_none() || self.used[0] == 0 {
            if let Some(hook) = T::REHASHING_COMPLETED {
                hook(self);
            }
            self.tables[0] = self.tables[1].take();
            self.size_exp[0] = new_exp;
            self.used[0] = 0;
            self.size_exp[1] = -1;
            self.used[1] = 0;
            self.rehash_idx = -1;
            return Ok(true);
        }

        if T::NO_INCREMENTAL_REHASH && self.pause_rehash == 0 {
            while self.rehash(1000) {}
        }

        Ok(true)
    }

    /// Grows the table to hold at least `size` entries. Returns false when
    /// the request is invalid or a rehash is already running.
    pub fn expand(&mut self, size: usize) -> bool {
        if self.is_rehashing() || self.used[0] > size || self.table_size(0) >= size {
            return false;
        }
        matches!(self.resize_internal(size, false), Ok(true))
    }

    /// Like [`expand`](Dict::expand) but reports allocation failure instead
    /// of aborting. An invalid request is not an error.
    pub fn try_expand(&mut self, size: usize) -> Result<(), TryExpandError> {
        if self.is_rehashing() || self.used[0] > size || self.table_size(0) >= size {
            return Ok(());
        }
        self.resize_internal(size, true).map(|_| ())
    }

    /// Shrinks the table to hold `size` entries. Returns false when the
    /// request is invalid or a rehash is already running.
    pub fn shrink(&mut self, size: usize) -> bool {
        if self.is_rehashing() || self.used[0] > size || self.table_size(0) <= size {
            return false;
        }
        matches!(self.resize_internal(size, false), Ok(true))
    }

    /// Moves every entry of the first table's bucket `idx` into the target
    /// table.
    fn rehash_bucket_entries(&mut self, idx: usize) {
        let growing = self.size_exp[1] > self.size_exp[0];
        let mask1 = self.table_mask(1);
        let (front, back) = self.tables.split_at_mut(1);
        let t0 = front[0].as_mut().expect("bucket array must be allocated");
        let t1 = back[0].as_mut().expect("bucket array must be allocated");

        let mut de = t0[idx];
        while !de.is_null() {
            let next = de.next();
            let key = de.key();
            // When shrinking, all keys of the old bucket land in the bucket
            // the smaller mask selects, so the hash need not be recomputed.
            let dst = if growing {
                (T::hash(key) & mask1) as usize
            } else {
                (idx as u64 & mask1) as usize
            };
            let mut moved = de;
            if T::NO_VALUE {
                if T::KEYS_ARE_ODD && t1[dst].is_null() {
                    // The destination can hold the bare key again.
                    assert!(key.addr() & 1 == 1, "keys_are_odd key with even pointer");
                    if !de.is_inline_key() {
                        unsafe { de.free_allocation() };
                    }
                    moved = EntryPtr::inline_key(key);
                } else {
                    // Inline keys live only in singleton buckets; joining a
                    // chain means both residents get allocated entries.
                    if T::KEYS_ARE_ODD && t1[dst].is_inline_key() {
                        t1[dst] = EntryPtr::create_no_value(t1[dst].key(), EntryPtr::null());
                    }
                    if de.is_inline_key() {
                        moved = EntryPtr::create_no_value(key, t1[dst]);
                    } else {
                        debug_assert!(de.is_no_value());
                        de.set_next(t1[dst]);
                    }
                }
            } else {
                de.set_next(t1[dst]);
            }
            t1[dst] = moved;
            self.used[0] -= 1;
            self.used[1] += 1;
            de = next;
        }
        t0[idx] = EntryPtr::null();
    }

    /// Adopts the target table once the source is drained. Returns true when
    /// the rehash finished.
    fn check_rehash_complete(&mut self) -> bool {
        if self.used[0] != 0 {
            return false;
        }
        if let Some(hook) = T::REHASHING_COMPLETED {
            hook(self);
        }
        self.tables[0] = self.tables[1].take();
        self.used[0] = self.used[1];
        self.size_exp[0] = self.size_exp[1];
        self.used[1] = 0;
        self.size_exp[1] = -1;
        self.rehash_idx = -1;
        true
    }

    /// Performs up to `n` bucket migrations, visiting at most `10 * n` empty
    /// buckets before yielding. Returns whether rehashing is still in
    /// progress.
    pub fn rehash(&mut self, mut n: usize) -> bool {
        let mut empty_visits = n * 10;
        if self.pause_rehash > 0 {
            return self.is_rehashing();
        }
        let s0 = self.table_size(0);
        let s1 = self.table_size(1);
        let policy = resize_policy();
        if policy == ResizePolicy::Forbid || !self.is_rehashing() {
            return false;
        }
        if policy == ResizePolicy::Avoid
            && ((s1 > s0 && s1 < FORCE_RESIZE_RATIO * s0)
                || (s1 < s0 && s0 < MIN_FILL_DIVISOR * FORCE_RESIZE_RATIO * s1))
        {
            return false;
        }

        while n > 0 && self.used[0] != 0 {
            n -= 1;
            assert!(self.table_size(0) > self.rehash_idx as usize);
            while self.bucket_at(0, self.rehash_idx as usize).is_null() {
                self.rehash_idx += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }
            let idx = self.rehash_idx as usize;
            self.rehash_bucket_entries(idx);
            self.rehash_idx += 1;
        }

        !self.check_rehash_complete()
    }

    /// Rehashes in batches of 100 buckets until the wall-clock budget is
    /// spent or the migration completes. Returns the number of batch steps
    /// attempted, zero when rehashing is paused.
    pub fn rehash_for(&mut self, budget: Duration) -> usize {
        if self.pause_rehash > 0 {
            return 0;
        }
        let start = Instant::now();
        let mut rehashes = 0;
        while self.rehash(100) {
            rehashes += 100;
            if start.elapsed() >= budget {
                break;
            }
        }
        rehashes
    }

    /// Bucket counts of the source and target tables while a rehash is in
    /// progress.
    pub fn rehashing_info(&self) -> Option<(u64, u64)> {
        if !self.is_rehashing() {
            return None;
        }
        Some((self.table_size(0) as u64, self.table_size(1) as u64))
    }

    fn rehash_step(&mut self) {
        if self.pause_rehash == 0 {
            self.rehash(1);
        }
    }

    /// Migrates a single bucket, used by operations that are about to touch
    /// it anyway.
    fn bucket_rehash(&mut self, idx: usize) -> bool {
        if self.pause_rehash != 0 {
            return false;
        }
        let s0 = self.table_size(0);
        let s1 = self.table_size(1);
        let policy = resize_policy();
        if policy == ResizePolicy::Forbid || !self.is_rehashing() {
            return false;
        }
        if policy == ResizePolicy::Avoid
            && ((s1 > s0 && s1 < FORCE_RESIZE_RATIO * s0)
                || (s1 < s0 && s0 < MIN_FILL_DIVISOR * FORCE_RESIZE_RATIO * s1))
        {
            return false;
        }
        self.rehash_bucket_entries(idx);
        self.check_rehash_complete();
        true
    }

    fn type_resize_allowed(&self, size: usize) -> bool {
        let Some(allowed) = T::RESIZE_ALLOWED else {
            return true;
        };
        let bytes = (1usize << Self::next_exp(size)) * std::mem::size_of::<EntryPtr>();
        allowed(bytes, self.used[0] as f64 / self.table_size(0) as f64)
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.table_size(0) == 0 {
            self.expand(INITIAL_SIZE);
            return;
        }
        let policy = resize_policy();
        let triggered = (policy == ResizePolicy::Enable && self.used[0] >= self.table_size(0))
            || (policy != ResizePolicy::Forbid
                && self.used[0] >= FORCE_RESIZE_RATIO * self.table_size(0));
        if triggered && self.type_resize_allowed(self.used[0] + 1) {
            self.expand(self.used[0] + 1);
        }
    }

    fn shrink_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.table_size(0) <= INITIAL_SIZE {
            return;
        }
        let policy = resize_policy();
        let triggered = (policy == ResizePolicy::Enable
            && self.used[0] * MIN_FILL_DIVISOR <= self.table_size(0))
            || (policy != ResizePolicy::Forbid
                && self.used[0] * MIN_FILL_DIVISOR * FORCE_RESIZE_RATIO <= self.table_size(0));
        if triggered && self.type_resize_allowed(self.used[0]) {
            self.shrink(self.used[0]);
        }
    }

    fn expand_if_auto_resize_allowed(&mut self) {
        if self.pause_auto_resize > 0 {
            return;
        }
        self.expand_if_needed();
    }

    fn shrink_if_auto_resize_allowed(&mut self) {
        if self.pause_auto_resize > 0 {
            return;
        }
        self.shrink_if_needed();
    }

    fn keys_match(key: *const u8, held: *mut u8) -> bool {
        std::ptr::eq(key, held)
            || T::KEY_COMPARE.map_or(false, |compare| compare(key, held.cast_const()))
    }

    /// Runs the lazy migration work for an operation about to touch the
    /// bucket `idx` selects in the first table: rehash that bucket when it
    /// still awaits migration, otherwise take one ordinary step.
    fn rehash_step_for(&mut self, idx: usize) {
        if idx as isize >= self.rehash_idx && !self.bucket_at(0, idx).is_null() {
            self.bucket_rehash(idx);
        } else {
            self.rehash_step();
        }
    }

    fn find_raw(&mut self, key: *const u8) -> EntryPtr {
        if self.size() == 0 {
            return EntryPtr::null();
        }
        let h = T::hash(key);
        let idx0 = (h & self.table_mask(0)) as usize;
        if self.is_rehashing() {
            self.rehash_step_for(idx0);
        }
        for table in 0..=1 {
            if table == 0 && (idx0 as isize) < self.rehash_idx {
                continue;
            }
            let idx = (h & self.table_mask(table)) as usize;
            let mut he = self.bucket_at(table, idx);
            while !he.is_null() {
                if Self::keys_match(key, he.key()) {
                    return he;
                }
                he = he.next();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        EntryPtr::null()
    }

    pub fn find(&mut self, key: *const u8) -> Option<&Entry> {
        let he = self.find_raw(key);
        if he.is_null() {
            None
        } else {
            Some(he.as_public())
        }
    }

    pub fn find_mut(&mut self, key: *const u8) -> Option<&mut Entry> {
        let he = self.find_raw(key);
        if he.is_null() {
            None
        } else {
            Some(he.as_public_mut())
        }
    }

    /// The pointer member of the value slot for `key`, or `None` when the
    /// key is absent. Panics on keys-only tables.
    pub fn fetch_value(&mut self, key: *const u8) -> Option<*mut u8> {
        self.find(key).map(|entry| entry.val())
    }

    /// Locates the bucket where `key` should be inserted. Returns the found
    /// entry instead when the key is already present. The grow trigger is
    /// evaluated here, after the lazy migration step, so a sustained insert
    /// workload cannot outrun the force ratio.
    pub fn find_insert_position(
        &mut self,
        key: *const u8,
    ) -> Result<InsertPosition, NonNull<Entry>> {
        let h = T::hash(key);
        let mut idx = (h & self.table_mask(0)) as usize;
        if self.is_rehashing() {
            self.rehash_step_for(idx);
        }
        self.expand_if_auto_resize_allowed();
        for table in 0..=1 {
            if table == 0 && (idx as isize) < self.rehash_idx {
                continue;
            }
            idx = (h & self.table_mask(table)) as usize;
            let mut he = self.bucket_at(table, idx);
            while !he.is_null() {
                if Self::keys_match(key, he.key()) {
                    return Err(he.as_nonnull());
                }
                he = he.next();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        // While rehashing, new keys go to the target table.
        let insert_table = if self.is_rehashing() { 1 } else { 0 };
        let buckets = self.tables[insert_table]
            .as_mut()
            .expect("insertion table must be allocated");
        Ok(InsertPosition {
            slot: NonNull::from(&mut buckets[idx]),
        })
    }

    /// Links a new entry for `key` at the head of the bucket identified by
    /// `position`: recently inserted keys tend to be the recently accessed
    /// ones. The key is stored as given; clone it first if the descriptor
    /// expects ownership of a copy.
    pub fn insert_at_position(&mut self, position: InsertPosition, key: *mut u8) -> &mut Entry {
        let insert_table = if self.is_rehashing() { 1 } else { 0 };
        let buckets = self.tables[insert_table]
            .as_mut()
            .expect("insertion table must be allocated");
        let range = buckets.as_mut_ptr_range();
        let slot = position.slot.as_ptr();
        assert!(
            slot >= range.start && slot < range.end,
            "insert position does not belong to the insertion table"
        );

        let mut head = unsafe { *slot };
        let entry = if T::NO_VALUE {
            if T::KEYS_ARE_ODD && head.is_null() {
                assert!(key.addr() & 1 == 1, "keys_are_odd key with even pointer");
                EntryPtr::inline_key(key)
            } else {
                // A second resident promotes the inline key to an allocated
                // entry so bare keys only ever sit alone in a bucket.
                if T::KEYS_ARE_ODD && head.is_inline_key() {
                    head = EntryPtr::create_no_value(head.key(), EntryPtr::null());
                }
                EntryPtr::create_no_value(key, head)
            }
        } else if T::EMBEDDED_ENTRY {
            EntryPtr::create_embedded(
                key,
                head,
                T::EMBED_KEY.expect("embedded entries require an embed function"),
            )
        } else {
            EntryPtr::create_normal(key, head)
        };
        unsafe { *slot = entry };
        self.used[insert_table] += 1;
        entry.as_public_mut()
    }

    /// Inserts `key` and returns its new entry, or the existing entry as the
    /// error when the key is already present. Applies `KEY_DUP` on the
    /// insert path only.
    pub fn add_entry(&mut self, key: *mut u8) -> Result<&mut Entry, &mut Entry> {
        match self.find_insert_position(key) {
            Ok(position) => {
                let key = T::KEY_DUP.map_or(key, |dup| dup(key));
                Ok(self.insert_at_position(position, key))
            }
            Err(existing) => Err(unsafe { &mut *existing.as_ptr() }),
        }
    }

    /// Inserts a key/value pair. Returns false when the key already exists,
    /// leaving the table unchanged.
    pub fn add(&mut self, key: *mut u8, val: *mut u8) -> bool {
        match self.add_entry(key) {
            Ok(entry) => {
                if !T::NO_VALUE {
                    entry.set_val(val);
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Insert-or-overwrite. Returns true when the key was newly inserted.
    /// On overwrite the new value is stored before the old one is destroyed,
    /// so replacing a refcounted value with itself is safe.
    pub fn replace(&mut self, key: *mut u8, val: *mut u8) -> bool {
        match self.add_entry(key) {
            Ok(entry) => {
                entry.set_val(val);
                true
            }
            Err(existing) => {
                let old = existing.val();
                existing.set_val(val);
                if let Some(destroy) = T::VAL_DESTRUCTOR {
                    destroy(old);
                }
                false
            }
        }
    }

    /// Inserts `key` or returns the entry already holding it.
    pub fn add_or_find(&mut self, key: *mut u8) -> &mut Entry {
        match self.add_entry(key) {
            Ok(entry) => entry,
            Err(existing) => existing,
        }
    }

    fn free_entry_with_destructors(he: EntryPtr) {
        if let Some(destroy) = T::KEY_DESTRUCTOR {
            destroy(he.key());
        }
        if let Some(destroy) = T::VAL_DESTRUCTOR {
            destroy(unsafe { he.value().val });
        }
        unsafe { he.free_allocation() };
    }

    fn generic_delete(&mut self, key: *const u8, keep: bool) -> EntryPtr {
        if self.size() == 0 {
            return EntryPtr::null();
        }
        let h = T::hash(key);
        let idx0 = (h & self.table_mask(0)) as usize;
        if self.is_rehashing() {
            self.rehash_step_for(idx0);
        }
        for table in 0..=1 {
            if table == 0 && (idx0 as isize) < self.rehash_idx {
                continue;
            }
            let idx = (h & self.table_mask(table)) as usize;
            let mut he = self.bucket_at(table, idx);
            let mut prev = EntryPtr::null();
            while !he.is_null() {
                if Self::keys_match(key, he.key()) {
                    let next = he.next();
                    if prev.is_null() {
                        self.set_bucket(table, idx, next);
                    } else {
                        prev.set_next(next);
                    }
                    if !keep {
                        Self::free_entry_with_destructors(he);
                    }
                    self.used[table] -= 1;
                    if T::NO_VALUE && T::KEYS_ARE_ODD {
                        self.collapse_singleton_bucket(table, idx);
                    }
                    self.shrink_if_auto_resize_allowed();
                    return he;
                }
                prev = he;
                he = he.next();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        EntryPtr::null()
    }

    /// Restores the inline-key form when a deletion leaves a lone allocated
    /// entry in a bucket of a keys-only odd-keys table.
    fn collapse_singleton_bucket(&mut self, table: usize, idx: usize) {
        let head = self.bucket_at(table, idx);
        if head.is_null() || head.is_inline_key() || !head.next().is_null() {
            return;
        }
        let key = head.key();
        debug_assert!(key.addr() & 1 == 1);
        unsafe { head.free_allocation() };
        self.set_bucket(table, idx, EntryPtr::inline_key(key));
    }

    /// Removes `key`, running the key and value destructors. Returns false
    /// when the key was absent.
    pub fn remove(&mut self, key: *const u8) -> bool {
        !self.generic_delete(key, false).is_null()
    }

    /// Unlinks `key` from the table without releasing it, so the caller can
    /// inspect the entry before handing it to
    /// [`free_unlinked_entry`](Dict::free_unlinked_entry).
    pub fn unlink(&mut self, key: *const u8) -> Option<UnlinkedEntry> {
        let he = self.generic_delete(key, true);
        if he.is_null() {
            None
        } else {
            Some(UnlinkedEntry { raw: he })
        }
    }

    pub fn free_unlinked_entry(&mut self, entry: UnlinkedEntry) {
        Self::free_entry_with_destructors(entry.raw);
    }

    /// First half of a deletion that wants to observe the entry without a
    /// second lookup. Rehashing is paused until the returned guard commits
    /// or is dropped.
    pub fn begin_unlink(&mut self, key: *const u8) -> Option<TwoPhaseUnlink<'_, T>> {
        if self.size() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let h = T::hash(key);
        for table in 0..=1 {
            let idx = (h & self.table_mask(table)) as usize;
            if table == 0 && (idx as isize) < self.rehash_idx {
                continue;
            }
            let buckets = self.tables[table]
                .as_mut()
                .expect("bucket array must be allocated");
            let mut slot = NonNull::from(&mut buckets[idx]);
            loop {
                let he = unsafe { *slot.as_ref() };
                if he.is_null() {
                    break;
                }
                if Self::keys_match(key, he.key()) {
                    self.pause_rehash += 1;
                    return Some(TwoPhaseUnlink {
                        dict: Some(self),
                        plink: slot,
                        entry: he,
                        table,
                    });
                }
                match he.next_slot() {
                    Some(next_slot) => slot = next_slot,
                    None => break,
                }
            }
            if !self.is_rehashing() {
                return None;
            }
        }
        None
    }

    /// Stores `key` into an entry that already owns a key slot, applying
    /// `KEY_DUP`. The caller is responsible for the old key.
    pub fn set_key(entry: &mut Entry, key: *mut u8) {
        let key = T::KEY_DUP.map_or(key, |dup| dup(key));
        EntryPtr::from_public(entry).set_key(key);
    }

    /// Uniformly random non-empty bucket, then a uniformly random chain
    /// element of it. Keys in short chains are favored; use
    /// [`fair_random_entry`](Dict::fair_random_entry) when the distribution
    /// matters.
    pub fn random_entry(&mut self) -> Option<&Entry> {
        if self.size() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let mut rng = thread_rng();
        let mut he;
        if self.is_rehashing() {
            let s0 = self.table_size(0);
            loop {
                // Buckets before the rehash index are guaranteed empty.
                let span = (self.buckets() - self.rehash_idx as usize) as u64;
                let h = self.rehash_idx as u64 + rng.gen::<u64>() % span;
                he = if h >= s0 as u64 {
                    self.bucket_at(1, (h - s0 as u64) as usize)
                } else {
                    self.bucket_at(0, h as usize)
                };
                if !he.is_null() {
                    break;
                }
            }
        } else {
            let mask = self.table_mask(0);
            loop {
                he = self.bucket_at(0, (rng.gen::<u64>() & mask) as usize);
                if !he.is_null() {
                    break;
                }
            }
        }

        let mut chain_len = 0usize;
        let head = he;
        while !he.is_null() {
            he = he.next();
            chain_len += 1;
        }
        let mut pick = rng.gen_range(0..chain_len);
        he = head;
        while pick > 0 {
            he = he.next();
            pick -= 1;
        }
        Some(he.as_public())
    }

    fn sample_entry_ptrs(&mut self, mut count: usize) -> Vec<EntryPtr> {
        if self.size() < count {
            count = self.size();
        }
        let mut maxsteps = count * 10;

        // Pay for the sampling with a proportional amount of rehash work.
        for _ in 0..count {
            if self.is_rehashing() {
                self.rehash_step();
            } else {
                break;
            }
        }

        let tables = if self.is_rehashing() { 2 } else { 1 };
        let mut maxsizemask = self.table_mask(0);
        if tables > 1 && self.table_mask(1) > maxsizemask {
            maxsizemask = self.table_mask(1);
        }

        let mut rng = thread_rng();
        let mut i = rng.gen::<u64>() & maxsizemask;
        let mut empty_run = 0usize;
        let mut seen = 0usize;
        let mut out: Vec<EntryPtr> = Vec::with_capacity(count);
        'sampling: while out.len() < count && maxsteps > 0 {
            maxsteps -= 1;
            for table in 0..tables {
                if tables == 2 && table == 0 && (i as isize) < self.rehash_idx {
                    // Nothing lives below the rehash index in either table,
                    // so jump ahead when the second table cannot cover `i`.
                    if i >= self.table_size(1) as u64 {
                        i = self.rehash_idx as u64;
                    } else {
                        continue;
                    }
                }
                if i >= self.table_size(table) as u64 {
                    continue;
                }
                let mut he = self.bucket_at(table, i as usize);
                if he.is_null() {
                    empty_run += 1;
                    if empty_run >= 5 && empty_run > count {
                        i = rng.gen::<u64>() & maxsizemask;
                        empty_run = 0;
                    }
                } else {
                    empty_run = 0;
                    while !he.is_null() {
                        // Reservoir sampling over the chain: once the output
                        // is full, later elements displace random slots so a
                        // long chain's tail still has a chance to appear.
                        if out.len() < count {
                            out.push(he);
                        } else {
                            let r = rng.gen_range(0..seen as u64 + 1) as usize;
                            if r < count {
                                out[r] = he;
                            }
                        }
                        he = he.next();
                        seen += 1;
                    }
                    if seen >= count {
                        break 'sampling;
                    }
                }
            }
            i = (i + 1) & maxsizemask;
        }
        out
    }

    /// Collects up to `count` entries by walking from a random point,
    /// teleporting across empty regions and reservoir-sampling long chains.
    /// Best effort and possibly duplicated; meant for statistics, not
    /// fairness.
    pub fn sample_entries(&mut self, count: usize) -> Vec<&Entry> {
        self.sample_entry_ptrs(count)
            .into_iter()
            .map(|he| he.as_public())
            .collect()
    }

    /// Random entry with the chain-length bias of
    /// [`random_entry`](Dict::random_entry) smoothed out by picking from a
    /// small [`sample_entries`](Dict::sample_entries) batch.
    pub fn fair_random_entry(&mut self) -> Option<&Entry> {
        let sampled = self.sample_entry_ptrs(FAIR_SAMPLE_SIZE);
        if sampled.is_empty() {
            return self.random_entry();
        }
        let pick = thread_rng().gen_range(0..sampled.len());
        Some(sampled[pick].as_public())
    }

    /// Bytes used by the table structure itself: a nominal per-entry cost
    /// plus the bucket arrays. Key and value payloads are not included.
    pub fn mem_usage(&self) -> usize {
        self.size() * entry::NOMINAL_ENTRY_SIZE + self.buckets() * std::mem::size_of::<EntryPtr>()
    }

    fn clear_table(&mut self, table: usize) {
        if let Some(buckets) = self.tables[table].take() {
            for slot in buckets.iter() {
                let mut he = *slot;
                while !he.is_null() {
                    let next = he.next();
                    Self::free_entry_with_destructors(he);
                    self.used[table] -= 1;
                    he = next;
                }
            }
        }
        self.size_exp[table] = -1;
        self.used[table] = 0;
    }

    /// Removes every entry, releases both bucket arrays and resets the
    /// pause counters. The table remains usable.
    pub fn clear(&mut self) {
        // Anyone watching the started/completed pair deserves a completion
        // even when teardown interrupts the migration.
        if self.is_rehashing() {
            if let Some(hook) = T::REHASHING_COMPLETED {
                hook(self);
            }
        }
        self.clear_table(0);
        self.clear_table(1);
        self.rehash_idx = -1;
        self.pause_rehash = 0;
        self.pause_auto_resize = 0;
    }
}

impl<T: DictType> Default for Dict<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DictType> Drop for Dict<T> {
    fn drop(&mut self) {
        if self.is_rehashing() {
            if let Some(hook) = T::REHASHING_COMPLETED {
                hook(self);
            }
        }
        self.clear_table(0);
        self.clear_table(1);
    }
}

impl<T: DictType> fmt::Debug for Dict<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dict")
            .field("size", &self.size())
            .field("buckets", &self.buckets())
            .field("rehashing", &self.is_rehashing())
            .finish()
    }
}

/// The resize policy is process-wide, so tests that assert on automatic
/// grow/shrink behavior take this lock shared while the test that flips the
/// policy takes it exclusively.
#[cfg(test)]
pub(crate) static TEST_POLICY_GUARD: std::sync::RwLock<()> = std::sync::RwLock::new(());
