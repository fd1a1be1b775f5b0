//! Shared object handles.
//!
//! Native objects cross the boundary as `Arc` raw pointers. Each has a clone
//! and a free entry point; [`HandleCell`] is the reference-counted cell the
//! foreign side wraps around such a pointer so that any number of holders
//! can share it while the free entry point runs exactly once.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Hands an `Arc` to the foreign side.
pub fn arc_into_raw<T>(value: Arc<T>) -> *const c_void {
    Arc::into_raw(value) as *const c_void
}

/// Borrows the object behind a handle, adding a strong reference.
///
/// # Safety
/// `ptr` must come from [`arc_into_raw`] with the same `T` and must not have
/// been freed.
pub unsafe fn arc_from_handle<T>(ptr: *const c_void) -> Arc<T> {
    let ptr = ptr as *const T;
    Arc::increment_strong_count(ptr);
    Arc::from_raw(ptr)
}

/// # Safety
/// Same as [`arc_from_handle`].
pub unsafe fn clone_handle<T>(ptr: *const c_void) -> *const c_void {
    Arc::increment_strong_count(ptr as *const T);
    ptr
}

/// # Safety
/// Same as [`arc_from_handle`]; `ptr` must not be used afterwards.
pub unsafe fn free_handle<T>(ptr: *const c_void) {
    drop(Arc::from_raw(ptr as *const T));
}

/// Clones the pointed-to object and returns the new pointer.
pub type CloneFn = Box<dyn Fn(usize) -> usize + Send + Sync>;
/// Releases the pointed-to object.
pub type FreeFn = Box<dyn Fn(usize) + Send + Sync>;

/// Reference-counted cell around one native pointer.
///
/// The call counter starts at 0 and counts calls in flight. Each
/// [`HandleCell::increment_pointer`] must be balanced by a
/// [`HandleCell::decrement_pointer`]. [`HandleCell::destroy`] takes one extra
/// step down, so the counter reaches -1, and the free callback runs, exactly
/// when the cell is destroyed and no call is outstanding.
pub struct HandleCell {
    pointer: usize,
    counter: AtomicI64,
    destroyed: AtomicBool,
    clone_fn: CloneFn,
    free_fn: FreeFn,
}

impl std::fmt::Debug for HandleCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleCell")
            .field("counter", &self.counter.load(Ordering::Relaxed))
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

impl HandleCell {
    /// Cell around `pointer` with nothing in flight.
    pub fn new(pointer: *const c_void, clone_fn: CloneFn, free_fn: FreeFn) -> Self {
        Self {
            pointer: pointer as usize,
            counter: AtomicI64::new(0),
            destroyed: AtomicBool::new(false),
            clone_fn,
            free_fn,
        }
    }

    /// Wraps an `Arc`-backed handle using its typed clone and free.
    pub fn for_arc<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self::new(
            arc_into_raw(value),
            Box::new(|p| unsafe { clone_handle::<T>(p as *const c_void) as usize }),
            Box::new(|p| unsafe { free_handle::<T>(p as *const c_void) }),
        )
    }

    /// Calls in flight, or -1 once freed.
    pub fn call_counter(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }

    /// True after `destroy`.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Takes a call reference and returns a freshly cloned pointer for one
    /// native call. Panics if the handle is destroyed.
    pub fn increment_pointer(&self, debug_name: &str) -> *const c_void {
        let mut current = self.counter.load(Ordering::Acquire);
        loop {
            if current <= -1 {
                panic!("{} object has already been destroyed", debug_name);
            }
            if current == i64::MAX {
                panic!("{} call counter would overflow", debug_name);
            }
            match self.counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        (self.clone_fn)(self.pointer) as *const c_void
    }

    /// Releases a call reference; frees the object on the step to -1.
    pub fn decrement_pointer(&self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 0 {
            (self.free_fn)(self.pointer);
        }
    }

    /// Drops the cell's own reference. Idempotent.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.decrement_pointer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_cell() -> (HandleCell, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let clones = Arc::new(AtomicUsize::new(0));
        let frees = Arc::new(AtomicUsize::new(0));
        let (c, f) = (clones.clone(), frees.clone());
        let cell = HandleCell::new(
            0x1000 as *const c_void,
            Box::new(move |p| {
                c.fetch_add(1, Ordering::SeqCst);
                p
            }),
            Box::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (cell, clones, frees)
    }

    #[test]
    fn test_free_once_after_destroy() {
        let (cell, clones, frees) = counting_cell();
        let p = cell.increment_pointer("Adapter");
        assert_eq!(p as usize, 0x1000);
        assert_eq!(clones.load(Ordering::SeqCst), 1);
        cell.destroy();
        assert_eq!(frees.load(Ordering::SeqCst), 0);
        cell.decrement_pointer();
        assert_eq!(frees.load(Ordering::SeqCst), 1);
        cell.destroy();
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destroy_idle_cell_frees() {
        let (cell, clones, frees) = counting_cell();
        assert_eq!(cell.call_counter(), 0);
        cell.destroy();
        assert_eq!(frees.load(Ordering::SeqCst), 1);
        assert_eq!(clones.load(Ordering::SeqCst), 0);
        assert_eq!(cell.call_counter(), -1);
        assert!(cell.is_destroyed());
        cell.destroy();
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "already been destroyed")]
    fn test_use_after_destroy_panics() {
        let (cell, _, _) = counting_cell();
        cell.destroy();
        cell.increment_pointer("Session");
    }

    #[test]
    fn test_concurrent_clone_and_destroy() {
        let (cell, _, frees) = counting_cell();
        let cell = Arc::new(cell);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _p = cell.increment_pointer("Handle");
                        cell.decrement_pointer();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        cell.destroy();
        assert_eq!(frees.load(Ordering::SeqCst), 1);
        assert_eq!(cell.call_counter(), -1);
    }

    #[test]
    fn test_arc_handles() {
        let value = Arc::new(String::from("adapter"));
        let cell = HandleCell::for_arc(value.clone());
        assert_eq!(Arc::strong_count(&value), 2);
        let p = cell.increment_pointer("String");
        assert_eq!(Arc::strong_count(&value), 3);
        let borrowed = unsafe { arc_from_handle::<String>(p) };
        assert_eq!(*borrowed, "adapter");
        drop(borrowed);
        unsafe { free_handle::<String>(p) };
        cell.decrement_pointer();
        cell.destroy();
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
