//! Translation between opaque 64-bit kernel handles and in-process objects.
//!
//! Node ids and file handles given to the kernel are produced here. Each
//! object embeds a [`HandleSlot`] holding the check tag of its current
//! handle; decoding verifies that tag so stale or forged handles are caught.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashSet;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    #[error("unknown handle {0:#x}")]
    Unknown(u64),

    #[error("stale handle {handle:#x}: check tag {expected} does not match {found}")]
    Stale {
        handle: u64,
        expected: u32,
        found: u32,
    },
}

/// Per-object bookkeeping for the handle it was registered under.
#[derive(Debug, Default)]
pub struct HandleSlot {
    check: AtomicU32,
    handle: AtomicU64,
}

impl HandleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle this object is registered under, or 0.
    pub fn handle(&self) -> u64 {
        self.handle.load(Ordering::Acquire)
    }

    fn check(&self) -> u32 {
        self.check.load(Ordering::Acquire)
    }

    fn claim(&self, check: u32, handle: u64) {
        if self
            .check
            .compare_exchange(0, check, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!(
                "object already has handle {:#x}; double registration",
                self.handle()
            );
        }
        self.handle.store(handle, Ordering::Release);
    }

    fn release(&self) {
        self.handle.store(0, Ordering::Release);
        self.check.store(0, Ordering::Release);
    }
}

/// Objects that can be registered in a [`HandleMap`].
pub trait Handled: Send + Sync + 'static {
    fn handle_slot(&self) -> &HandleSlot;
}

/// Handle table with two interchangeable strategies.
pub enum HandleMap<T: Handled> {
    Table(TableHandleMap<T>),
    Address(AddressHandleMap<T>),
}

impl<T: Handled> HandleMap<T> {
    /// The portable table strategy.
    pub fn new() -> Self {
        HandleMap::Table(TableHandleMap::new())
    }

    /// The address-embedding strategy: handles carry the object's address,
    /// so decoding needs no table lookup.
    ///
    /// # Safety
    ///
    /// Every handle passed to `decode` or `forget` must have been returned
    /// by `register` on this map and not yet forgotten, except that its
    /// check tag may be corrupted. Decoding a forgotten handle whose object
    /// has been freed reads freed memory.
    #[cfg(target_pointer_width = "64")]
    pub unsafe fn new_address_map() -> Self {
        HandleMap::Address(AddressHandleMap::new())
    }

    /// On targets without a wide enough address space the table strategy is
    /// the only valid one.
    ///
    /// # Safety
    ///
    /// Always safe here; kept `unsafe` so callers are portable.
    #[cfg(not(target_pointer_width = "64"))]
    pub unsafe fn new_address_map() -> Self {
        HandleMap::Table(TableHandleMap::new())
    }

    /// Register `obj`, returning its new handle.
    ///
    /// Panics if `obj` already carries a handle.
    pub fn register(&self, obj: &Arc<T>) -> u64 {
        match self {
            HandleMap::Table(m) => m.register(obj),
            HandleMap::Address(m) => m.register(obj),
        }
    }

    pub fn decode(&self, handle: u64) -> Result<Arc<T>, HandleError> {
        match self {
            HandleMap::Table(m) => m.decode(handle),
            HandleMap::Address(m) => m.decode(handle),
        }
    }

    /// Invalidate `handle` and return its object.
    pub fn forget(&self, handle: u64) -> Result<Arc<T>, HandleError> {
        match self {
            HandleMap::Table(m) => m.forget(handle),
            HandleMap::Address(m) => m.forget(handle),
        }
    }

    pub fn has(&self, handle: u64) -> bool {
        match self {
            HandleMap::Table(m) => m.decode(handle).is_ok(),
            HandleMap::Address(m) => m.has(handle),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            HandleMap::Table(m) => m.count(),
            HandleMap::Address(m) => m.count(),
        }
    }
}

impl<T: Handled> Default for HandleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn next_check(counter: &mut u32, mask: u32) -> u32 {
    let check = *counter;
    *counter = counter.wrapping_add(1) & mask;
    if *counter == 0 {
        *counter = 1;
    }
    check
}

struct TableState<T> {
    slots: Vec<Option<Arc<T>>>,
    free: BTreeSet<u32>,
    next_check: u32,
    count: usize,
}

/// Slot table keyed by the lowest free index; slot 0 is never used.
pub struct TableHandleMap<T> {
    state: RwLock<TableState<T>>,
}

impl<T: Handled> TableHandleMap<T> {
    pub fn new() -> Self {
        TableHandleMap {
            state: RwLock::new(TableState {
                slots: vec![None],
                free: BTreeSet::new(),
                next_check: 1,
                count: 0,
            }),
        }
    }

    fn register(&self, obj: &Arc<T>) -> u64 {
        let mut state = self.state.write();
        let reused = state.free.first().copied();
        let index = reused.unwrap_or(state.slots.len() as u32);
        let check = next_check(&mut state.next_check, u32::MAX);
        let handle = (u64::from(check) << 32) | u64::from(index);

        // A rejected object must leave the table untouched.
        obj.handle_slot().claim(check, handle);
        match reused {
            Some(index) => {
                state.free.remove(&index);
                state.slots[index as usize] = Some(Arc::clone(obj));
            }
            None => state.slots.push(Some(Arc::clone(obj))),
        }
        state.count += 1;
        handle
    }

    fn lookup(state: &TableState<T>, handle: u64) -> Result<&Arc<T>, HandleError> {
        let index = (handle & 0xffff_ffff) as usize;
        let check = (handle >> 32) as u32;
        let obj = state
            .slots
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(HandleError::Unknown(handle))?;
        let found = obj.handle_slot().check();
        if found != check {
            return Err(HandleError::Stale {
                handle,
                expected: check,
                found,
            });
        }
        Ok(obj)
    }

    fn decode(&self, handle: u64) -> Result<Arc<T>, HandleError> {
        let state = self.state.read();
        Self::lookup(&state, handle).map(Arc::clone)
    }

    fn forget(&self, handle: u64) -> Result<Arc<T>, HandleError> {
        let mut state = self.state.write();
        Self::lookup(&state, handle)?;
        let index = (handle & 0xffff_ffff) as u32;
        let obj = state.slots[index as usize]
            .take()
            .ok_or(HandleError::Unknown(handle))?;
        state.free.insert(index);
        state.count -= 1;
        obj.handle_slot().release();
        Ok(obj)
    }

    fn count(&self) -> usize {
        self.state.read().count
    }
}

const ADDRESS_BITS: u32 = 48;
const ALIGN_SHIFT: u32 = 3;
const POINTER_BITS: u32 = ADDRESS_BITS - ALIGN_SHIFT;
const POINTER_MASK: u64 = (1 << POINTER_BITS) - 1;
const CHECK_MASK: u32 = (1 << (64 - POINTER_BITS)) - 1;

/// User-space addresses on supported 64-bit targets are below 2^48, so the
/// rebasing offset is zero for the life of the process.
const ADDRESS_BASE: u64 = 0;

struct AddressState {
    live: FxHashSet<u64>,
    next_check: u32,
}

/// Packs `(address - base) >> 3` into the low 45 bits and a 19-bit
/// generation into the high bits. The map owns one strong reference per
/// registered object.
pub struct AddressHandleMap<T: Handled> {
    state: Mutex<AddressState>,
    _marker: std::marker::PhantomData<Arc<T>>,
}

impl<T: Handled> AddressHandleMap<T> {
    fn new() -> Self {
        AddressHandleMap {
            state: Mutex::new(AddressState {
                live: FxHashSet::default(),
                next_check: 1,
            }),
            _marker: std::marker::PhantomData,
        }
    }

    fn pointer_of(handle: u64) -> *const T {
        (((handle & POINTER_MASK) << ALIGN_SHIFT) + ADDRESS_BASE) as usize as *const T
    }

    fn register(&self, obj: &Arc<T>) -> u64 {
        let address = Arc::as_ptr(obj) as usize as u64;
        if address & ((1 << ALIGN_SHIFT) - 1) != 0 {
            panic!("unaligned object address {:#x}", address);
        }
        let offset = address.wrapping_sub(ADDRESS_BASE);
        if offset >> ADDRESS_BITS != 0 {
            panic!("object address {:#x} out of handle range", address);
        }

        let mut state = self.state.lock();
        let check = next_check(&mut state.next_check, CHECK_MASK);
        let handle = (u64::from(check) << POINTER_BITS) | (offset >> ALIGN_SHIFT);
        obj.handle_slot().claim(check, handle);

        // The map keeps the object alive until `forget`.
        let _ = Arc::into_raw(Arc::clone(obj));
        state.live.insert(handle);
        handle
    }

    fn verify(handle: u64) -> Result<*const T, HandleError> {
        let ptr = Self::pointer_of(handle);
        let expected = (handle >> POINTER_BITS) as u32;
        // SAFETY: the constructor's contract guarantees the address part of
        // `handle` points at an object this map still holds a reference to.
        let found = unsafe { (*ptr).handle_slot().check() };
        if found != expected {
            return Err(HandleError::Stale {
                handle,
                expected,
                found,
            });
        }
        Ok(ptr)
    }

    fn decode(&self, handle: u64) -> Result<Arc<T>, HandleError> {
        let ptr = Self::verify(handle)?;
        // SAFETY: `ptr` came from `Arc::into_raw` in `register` and the map's
        // reference is still outstanding.
        unsafe {
            Arc::increment_strong_count(ptr);
            Ok(Arc::from_raw(ptr))
        }
    }

    fn forget(&self, handle: u64) -> Result<Arc<T>, HandleError> {
        let mut state = self.state.lock();
        let ptr = Self::verify(handle)?;
        if !state.live.remove(&handle) {
            return Err(HandleError::Unknown(handle));
        }
        // SAFETY: reclaims the reference leaked in `register`.
        let obj = unsafe { Arc::from_raw(ptr) };
        obj.handle_slot().release();
        Ok(obj)
    }

    fn has(&self, handle: u64) -> bool {
        self.state.lock().live.contains(&handle)
    }

    fn count(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl<T: Handled> Drop for AddressHandleMap<T> {
    fn drop(&mut self) {
        let live = std::mem::take(&mut self.state.get_mut().live);
        for handle in live {
            // SAFETY: every live handle owns one leaked reference.
            let obj = unsafe { Arc::from_raw(Self::pointer_of(handle)) };
            obj.handle_slot().release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[derive(Debug, Default)]
    struct Obj {
        slot: HandleSlot,
        value: u64,
    }

    impl Handled for Obj {
        fn handle_slot(&self) -> &HandleSlot {
            &self.slot
        }
    }

    fn obj(value: u64) -> Arc<Obj> {
        Arc::new(Obj {
            slot: HandleSlot::new(),
            value,
        })
    }

    fn table() -> HandleMap<Obj> {
        HandleMap::new()
    }

    fn address() -> HandleMap<Obj> {
        // SAFETY: tests only decode handles they registered.
        unsafe { HandleMap::new_address_map() }
    }

    #[rstest]
    #[case::table(table())]
    #[case::address(address())]
    fn test_register_decode(#[case] map: HandleMap<Obj>) {
        let a = obj(1);
        let b = obj(2);
        let ha = map.register(&a);
        let hb = map.register(&b);
        assert_ne!(ha, 0);
        assert_ne!(ha, hb);
        assert_eq!(a.slot.handle(), ha);

        assert_eq!(map.decode(ha).unwrap().value, 1);
        assert!(Arc::ptr_eq(&map.decode(hb).unwrap(), &b));
        assert_eq!(map.count(), 2);
        assert!(map.has(ha));
    }

    #[rstest]
    #[case::table(table())]
    #[case::address(address())]
    fn test_forget(#[case] map: HandleMap<Obj>) {
        let a = obj(1);
        let h = map.register(&a);
        let forgotten = map.forget(h).unwrap();
        assert!(Arc::ptr_eq(&forgotten, &a));
        assert!(!map.has(h));
        assert_eq!(map.count(), 0);
        assert_eq!(a.slot.handle(), 0);

        // A forgotten object can be registered again under a new tag.
        let h2 = map.register(&a);
        assert_ne!(h, h2);
        assert_eq!(map.decode(h2).unwrap().value, 1);
    }

    #[rstest]
    #[case::table(table())]
    #[case::address(address())]
    fn test_corrupted_check_tag_fails(#[case] map: HandleMap<Obj>) {
        let a = obj(7);
        let h = map.register(&a);
        let corrupted = h ^ (1 << 60);
        assert!(matches!(
            map.decode(corrupted),
            Err(HandleError::Stale { .. })
        ));
        assert_eq!(map.decode(h).unwrap().value, 7);
    }

    #[rstest]
    #[case::table(table())]
    #[case::address(address())]
    #[should_panic(expected = "double registration")]
    fn test_double_register_panics(#[case] map: HandleMap<Obj>) {
        let a = obj(1);
        map.register(&a);
        map.register(&a);
    }

    #[rstest]
    #[case::table(table())]
    #[case::address(address())]
    fn test_map_keeps_object_alive(#[case] map: HandleMap<Obj>) {
        let h = map.register(&obj(42));
        assert_eq!(map.decode(h).unwrap().value, 42);
        assert_eq!(map.forget(h).unwrap().value, 42);
    }

    #[test]
    fn test_table_reuses_lowest_free_slot() {
        let map = table();
        let objs: Vec<_> = (0..4).map(obj).collect();
        let handles: Vec<_> = objs.iter().map(|o| map.register(o)).collect();
        assert_eq!(handles[0] & 0xffff_ffff, 1);
        assert_eq!(handles[3] & 0xffff_ffff, 4);

        map.forget(handles[2]).unwrap();
        map.forget(handles[1]).unwrap();
        let again = map.register(&obj(9));
        assert_eq!(again & 0xffff_ffff, 2);
    }

    #[test]
    fn test_rejected_registration_keeps_table_intact() {
        let map = table();
        let a = obj(1);
        let ha = map.register(&a);
        let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| map.register(&a)));
        assert!(second.is_err());
        assert_eq!(a.slot.handle(), ha);
        assert_eq!(map.count(), 1);

        let b = obj(2);
        let hb = map.register(&b);
        assert_eq!(hb & 0xffff_ffff, 2);
        assert_eq!(map.decode(ha).unwrap().value, 1);
        assert_eq!(map.decode(hb).unwrap().value, 2);
    }

    #[test]
    fn test_unknown_table_handle() {
        let map = table();
        assert!(matches!(map.decode(5), Err(HandleError::Unknown(5))));
        assert!(!map.has(0));
    }
}
