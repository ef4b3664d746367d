use std::alloc::alloc;
use std::alloc::dealloc;
use std::alloc::handle_alloc_error;
use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem;
use std::ptr::addr_of_mut;
use std::ptr::NonNull;

use super::*;

/// The value slot of an entry. Which member is live is a caller convention;
/// the table never inspects it beyond moving it around and handing the `val`
/// member to the value destructor.
#[derive(Clone, Copy)]
#[repr(C)]
pub union Value {
    pub val: *mut u8,
    pub u: u64,
    pub s: i64,
    pub d: f64,
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value").field("u", &unsafe { self.u }).finish()
    }
}

/// The three least significant bits of an entry handle select the physical
/// layout behind it. If the lowest bit is set the handle is the key pointer
/// itself and nothing is allocated.
const TAG_MASK: usize = 0b111;
const TAG_NORMAL: usize = 0b000;
const TAG_INLINE_KEY: usize = 0b001;
const TAG_NO_VALUE: usize = 0b010;
const TAG_EMBEDDED: usize = 0b100;

#[repr(C)]
struct NormalEntry {
    key: *mut u8,
    v: Value,
    next: EntryPtr,
}

#[repr(C)]
struct NoValueEntry {
    key: *mut u8,
    next: EntryPtr,
}

/// Header of the embedded layout. The serialized key bytes trail the header
/// in the same allocation; `key_len` is kept so the deallocation layout can
/// be reconstructed, and `key_header_size` is the serializer's offset of the
/// key proper within the trailing buffer.
#[repr(C)]
struct EmbeddedEntry {
    v: Value,
    next: EntryPtr,
    key_len: u32,
    key_header_size: u8,
}

pub(crate) const EMBEDDED_HEADER: usize = mem::offset_of!(EmbeddedEntry, key_header_size) + 1;

/// Nominal per-entry cost used by the table-level memory estimate.
pub(crate) const NOMINAL_ENTRY_SIZE: usize = mem::size_of::<NormalEntry>();

/// A nullable tagged entry handle. This is what bucket slots and chain links
/// actually hold; `Entry` is the borrowed public view of the same word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct EntryPtr(*mut u8);

impl EntryPtr {
    pub(crate) const fn null() -> Self {
        EntryPtr(std::ptr::null_mut())
    }

    pub(crate) fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Wraps a caller key pointer as an inline-key handle. Only legal when
    /// the descriptor guarantees odd keys, which is what keeps the handle
    /// distinguishable from an allocated entry.
    pub(crate) fn inline_key(key: *mut u8) -> Self {
        debug_assert!(key.addr() & TAG_INLINE_KEY != 0);
        EntryPtr(key)
    }

    fn tag_ptr(ptr: *mut u8, tag: usize) -> Self {
        debug_assert_eq!(ptr.addr() & TAG_MASK, 0);
        EntryPtr(ptr.map_addr(|addr| addr | tag))
    }

    fn untagged(self) -> *mut u8 {
        self.0.map_addr(|addr| addr & !TAG_MASK)
    }

    /// The variant bits of this handle.
    pub(crate) fn raw_tag(self) -> usize {
        self.0.addr() & TAG_MASK
    }

    /// The allocation behind the handle, tag stripped.
    pub(crate) fn untagged_ptr(self) -> *mut u8 {
        self.untagged()
    }

    /// Re-applies a variant tag to a relocated allocation.
    pub(crate) fn retag(ptr: *mut u8, tag: usize) -> EntryPtr {
        Self::tag_ptr(ptr, tag)
    }

    pub(crate) fn is_inline_key(self) -> bool {
        self.0.addr() & TAG_INLINE_KEY != 0
    }

    pub(crate) fn is_normal(self) -> bool {
        self.0.addr() & TAG_MASK == TAG_NORMAL
    }

    pub(crate) fn is_no_value(self) -> bool {
        self.0.addr() & TAG_MASK == TAG_NO_VALUE
    }

    pub(crate) fn is_embedded(self) -> bool {
        self.0.addr() & TAG_MASK == TAG_EMBEDDED
    }

    fn as_normal(self) -> *mut NormalEntry {
        debug_assert!(self.is_normal());
        self.untagged() as *mut NormalEntry
    }

    fn as_no_value(self) -> *mut NoValueEntry {
        debug_assert!(self.is_no_value());
        self.untagged() as *mut NoValueEntry
    }

    fn as_embedded(self) -> *mut EmbeddedEntry {
        debug_assert!(self.is_embedded());
        self.untagged() as *mut EmbeddedEntry
    }

    pub(crate) fn create_normal(key: *mut u8, next: EntryPtr) -> Self {
        unsafe {
            let layout = Layout::new::<NormalEntry>();
            let Some(ptr) = NonNull::new(alloc(layout) as *mut NormalEntry) else {
                handle_alloc_error(layout);
            };
            ptr.write(NormalEntry {
                key,
                v: Value { u: 0 },
                next,
            });
            Self::tag_ptr(ptr.as_ptr() as *mut u8, TAG_NORMAL)
        }
    }

    pub(crate) fn create_no_value(key: *mut u8, next: EntryPtr) -> Self {
        unsafe {
            let layout = Layout::new::<NoValueEntry>();
            let Some(ptr) = NonNull::new(alloc(layout) as *mut NoValueEntry) else {
                handle_alloc_error(layout);
            };
            ptr.write(NoValueEntry { key, next });
            Self::tag_ptr(ptr.as_ptr() as *mut u8, TAG_NO_VALUE)
        }
    }

    /// Allocates an embedded entry. The serializer is probed once with a null
    /// destination for the required buffer length and then invoked again to
    /// fill the trailing buffer and report the header offset.
    pub(crate) fn create_embedded(key: *const u8, next: EntryPtr, embed: EmbedKeyFn) -> Self {
        let key_len = embed(std::ptr::null_mut(), 0, key, std::ptr::null_mut());
        unsafe {
            // SAFETY: the header size is a small constant, the alignment is a
            // power of two and `key_len` is bounded by the serializer.
            let layout = Layout::from_size_align_unchecked(
                EMBEDDED_HEADER + key_len,
                mem::align_of::<EmbeddedEntry>(),
            );
            let Some(ptr) = NonNull::new(alloc(layout) as *mut EmbeddedEntry) else {
                handle_alloc_error(layout);
            };
            addr_of_mut!((*ptr.as_ptr()).v).write(Value { u: 0 });
            addr_of_mut!((*ptr.as_ptr()).next).write(next);
            addr_of_mut!((*ptr.as_ptr()).key_len).write(key_len as u32);
            let buf = (ptr.as_ptr() as *mut u8).add(EMBEDDED_HEADER);
            embed(buf, key_len, key, addr_of_mut!((*ptr.as_ptr()).key_header_size));
            Self::tag_ptr(ptr.as_ptr() as *mut u8, TAG_EMBEDDED)
        }
    }

    /// Releases the entry allocation itself. Key and value destructors are
    /// the table's business and must already have run; inline keys have no
    /// allocation to release.
    pub(crate) unsafe fn free_allocation(self) {
        if self.is_inline_key() {
            return;
        }
        unsafe {
            if self.is_normal() {
                dealloc(self.untagged(), Layout::new::<NormalEntry>());
            } else if self.is_no_value() {
                dealloc(self.untagged(), Layout::new::<NoValueEntry>());
            } else {
                debug_assert!(self.is_embedded());
                let key_len = (*self.as_embedded()).key_len as usize;
                let layout = Layout::from_size_align_unchecked(
                    EMBEDDED_HEADER + key_len,
                    mem::align_of::<EmbeddedEntry>(),
                );
                dealloc(self.untagged(), layout);
            }
        }
    }

    pub(crate) fn key(self) -> *mut u8 {
        if self.is_inline_key() {
            // The handle is the key pointer, odd bit included.
            self.0
        } else if self.is_no_value() {
            unsafe { (*self.as_no_value()).key }
        } else if self.is_embedded() {
            unsafe {
                let hdr = (*self.as_embedded()).key_header_size as usize;
                (self.untagged()).add(EMBEDDED_HEADER + hdr)
            }
        } else {
            unsafe { (*self.as_normal()).key }
        }
    }

    pub(crate) fn set_key(self, key: *mut u8) {
        if self.is_no_value() {
            unsafe { (*self.as_no_value()).key = key };
        } else if self.is_normal() {
            unsafe { (*self.as_normal()).key = key };
        } else {
            panic!("entry variant does not own a key pointer");
        }
    }

    pub(crate) fn value_ptr(self) -> *mut Value {
        if self.is_normal() {
            unsafe { addr_of_mut!((*self.as_normal()).v) }
        } else if self.is_embedded() {
            unsafe { addr_of_mut!((*self.as_embedded()).v) }
        } else {
            panic!("entry variant has no value slot");
        }
    }

    pub(crate) fn value(self) -> Value {
        unsafe { *self.value_ptr() }
    }

    pub(crate) fn set_value(self, v: Value) {
        unsafe { *self.value_ptr() = v };
    }

    pub(crate) fn next(self) -> EntryPtr {
        if self.is_inline_key() {
            EntryPtr::null()
        } else if self.is_no_value() {
            unsafe { (*self.as_no_value()).next }
        } else if self.is_embedded() {
            unsafe { (*self.as_embedded()).next }
        } else {
            unsafe { (*self.as_normal()).next }
        }
    }

    /// Address of the `next` field, or `None` for inline keys which have no
    /// chain link at all.
    pub(crate) fn next_slot(self) -> Option<NonNull<EntryPtr>> {
        if self.is_inline_key() {
            return None;
        }
        let slot = if self.is_no_value() {
            unsafe { addr_of_mut!((*self.as_no_value()).next) }
        } else if self.is_embedded() {
            unsafe { addr_of_mut!((*self.as_embedded()).next) }
        } else {
            unsafe { addr_of_mut!((*self.as_normal()).next) }
        };
        NonNull::new(slot)
    }

    pub(crate) fn set_next(self, next: EntryPtr) {
        if self.is_no_value() {
            unsafe { (*self.as_no_value()).next = next };
        } else if self.is_embedded() {
            unsafe { (*self.as_embedded()).next = next };
        } else {
            debug_assert!(self.is_normal());
            unsafe { (*self.as_normal()).next = next };
        }
    }

    pub(crate) fn mem_usage(self) -> usize {
        if self.is_inline_key() {
            0
        } else if self.is_no_value() {
            mem::size_of::<NoValueEntry>()
        } else if self.is_embedded() {
            EMBEDDED_HEADER + unsafe { (*self.as_embedded()).key_len as usize }
        } else {
            mem::size_of::<NormalEntry>()
        }
    }

    pub(crate) fn as_public<'a>(self) -> &'a Entry {
        debug_assert!(!self.is_null());
        unsafe { &*(self.0 as *const Entry) }
    }

    pub(crate) fn as_public_mut<'a>(self) -> &'a mut Entry {
        debug_assert!(!self.is_null());
        unsafe { &mut *(self.0 as *mut Entry) }
    }

    pub(crate) fn as_nonnull(self) -> NonNull<Entry> {
        debug_assert!(!self.is_null());
        unsafe { NonNull::new_unchecked(self.0 as *mut Entry) }
    }

    pub(crate) fn from_public(entry: &Entry) -> EntryPtr {
        EntryPtr(entry as *const Entry as *mut u8)
    }
}

/// A live table entry. The reference address is the tagged handle itself,
/// which keeps the borrowed view at zero cost; the type has no size and is
/// never read through directly.
#[repr(C)]
pub struct Entry {
    _opaque: [u8; 0],
    _not_send: PhantomData<*mut u8>,
}

impl Entry {
    fn raw(&self) -> EntryPtr {
        EntryPtr::from_public(self)
    }

    /// The key this entry holds. For embedded entries this points into the
    /// entry's own trailing buffer.
    pub fn key(&self) -> *mut u8 {
        self.raw().key()
    }

    /// The pointer member of the value slot.
    ///
    /// Panics if the entry variant carries no value.
    pub fn val(&self) -> *mut u8 {
        unsafe { self.raw().value().val }
    }

    pub fn set_val(&mut self, val: *mut u8) {
        self.raw().set_value(Value { val });
    }

    pub fn u64_val(&self) -> u64 {
        unsafe { self.raw().value().u }
    }

    pub fn set_u64_val(&mut self, u: u64) {
        self.raw().set_value(Value { u });
    }

    pub fn incr_u64_val(&mut self, by: u64) -> u64 {
        let v = self.u64_val().wrapping_add(by);
        self.set_u64_val(v);
        v
    }

    pub fn s64_val(&self) -> i64 {
        unsafe { self.raw().value().s }
    }

    pub fn set_s64_val(&mut self, s: i64) {
        self.raw().set_value(Value { s });
    }

    pub fn incr_s64_val(&mut self, by: i64) -> i64 {
        let v = self.s64_val().wrapping_add(by);
        self.set_s64_val(v);
        v
    }

    pub fn f64_val(&self) -> f64 {
        unsafe { self.raw().value().d }
    }

    pub fn set_f64_val(&mut self, d: f64) {
        self.raw().set_value(Value { d });
    }

    pub fn incr_f64_val(&mut self, by: f64) -> f64 {
        let v = self.f64_val() + by;
        self.set_f64_val(v);
        v
    }

    /// Mutable access to the double member of the value slot.
    pub fn f64_val_mut(&mut self) -> &mut f64 {
        unsafe { &mut (*self.raw().value_ptr()).d }
    }

    /// Bytes attributable to this entry's own allocation. Inline keys cost
    /// nothing; embedded entries report their header plus key buffer.
    pub fn mem_usage(&self) -> usize {
        self.raw().mem_usage()
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Entry").field(&self.raw().0).finish()
    }
}
