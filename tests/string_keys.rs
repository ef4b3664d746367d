//! End-to-end use with heap-owned C-string keys and boxed values, the shape
//! a string-keyed store would drive the table with.

use std::ffi::CStr;
use std::ffi::CString;
use std::os::raw::c_char;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;

use stepdict::dict::gen_hash;
use stepdict::dict::Dict;
use stepdict::dict::DictType;

static KEY_DROPS: AtomicUsize = AtomicUsize::new(0);
static VAL_DROPS: AtomicUsize = AtomicUsize::new(0);

fn c_bytes<'a>(p: *const u8) -> &'a [u8] {
    unsafe { CStr::from_ptr(p as *const c_char) }.to_bytes()
}

struct StringKeys;

unsafe impl DictType for StringKeys {
    fn hash(key: *const u8) -> u64 {
        gen_hash(c_bytes(key))
    }
    const KEY_COMPARE: Option<fn(*const u8, *const u8) -> bool> =
        Some(|a, b| c_bytes(a) == c_bytes(b));
    const KEY_DUP: Option<fn(*const u8) -> *mut u8> = Some(|k| {
        CString::new(c_bytes(k)).expect("keys have no interior nul").into_raw() as *mut u8
    });
    const KEY_DESTRUCTOR: Option<fn(*mut u8)> = Some(|k| {
        KEY_DROPS.fetch_add(1, Relaxed);
        drop(unsafe { CString::from_raw(k as *mut c_char) });
    });
    const VAL_DESTRUCTOR: Option<fn(*mut u8)> = Some(|v| {
        VAL_DROPS.fetch_add(1, Relaxed);
        drop(unsafe { Box::from_raw(v as *mut u64) });
    });
}

fn boxed(n: u64) -> *mut u8 {
    Box::into_raw(Box::new(n)) as *mut u8
}

#[test]
fn string_keyed_table_lifecycle() {
    let mut d = Dict::<StringKeys>::new();

    for n in 0..500u64 {
        let key = CString::new(format!("session:{n}")).expect("valid key");
        assert!(d.add(key.as_ptr() as *mut u8, boxed(n)));
        // The table owns a duplicate; our probe copy dies here.
    }
    assert_eq!(d.size(), 500);

    let probe = CString::new("session:123").expect("valid key");
    let val = d.fetch_value(probe.as_ptr() as *const u8).expect("key present");
    assert_eq!(unsafe { *(val as *const u64) }, 123);

    // Overwrite releases exactly the displaced value.
    let before = VAL_DROPS.load(Relaxed);
    assert!(!d.replace(probe.as_ptr() as *mut u8, boxed(10_123)));
    assert_eq!(VAL_DROPS.load(Relaxed), before + 1);
    assert_eq!(d.size(), 500);

    // Unlink lets us read the entry before releasing it.
    let unlinked = d.unlink(probe.as_ptr() as *const u8).expect("key present");
    assert_eq!(c_bytes(unlinked.entry().key()), b"session:123");
    d.free_unlinked_entry(unlinked);
    assert_eq!(d.size(), 499);
    assert!(d.find(probe.as_ptr() as *const u8).is_none());

    let removed = CString::new("session:7").expect("valid key");
    assert!(d.remove(removed.as_ptr() as *const u8));
    assert!(!d.remove(removed.as_ptr() as *const u8));
    assert_eq!(d.size(), 498);

    drop(d);
    assert_eq!(KEY_DROPS.load(Relaxed), 500);
    assert_eq!(VAL_DROPS.load(Relaxed), 501, "500 live values plus one overwrite");
}

/// Same key handling as [`StringKeys`] but without the drop counters, so
/// this descriptor can be used concurrently with the lifecycle test.
struct PlainStringKeys;

unsafe impl DictType for PlainStringKeys {
    fn hash(key: *const u8) -> u64 {
        gen_hash(c_bytes(key))
    }
    const KEY_COMPARE: Option<fn(*const u8, *const u8) -> bool> =
        Some(|a, b| c_bytes(a) == c_bytes(b));
    const KEY_DUP: Option<fn(*const u8) -> *mut u8> = Some(|k| {
        CString::new(c_bytes(k)).expect("keys have no interior nul").into_raw() as *mut u8
    });
    const KEY_DESTRUCTOR: Option<fn(*mut u8)> =
        Some(|k| drop(unsafe { CString::from_raw(k as *mut c_char) }));
    const VAL_DESTRUCTOR: Option<fn(*mut u8)> =
        Some(|v| drop(unsafe { Box::from_raw(v as *mut u64) }));
}

#[test]
fn iteration_sees_every_string_key() {
    let mut d = Dict::<PlainStringKeys>::new();
    for n in 0..100u64 {
        let key = CString::new(format!("user:{n}")).expect("valid key");
        d.add(key.as_ptr() as *mut u8, boxed(n));
    }
    let mut seen: Vec<String> = d
        .iter()
        .map(|e| String::from_utf8(c_bytes(e.key()).to_vec()).expect("utf8 key"))
        .collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 100);
    assert!(seen.contains(&"user:42".to_string()));
}
