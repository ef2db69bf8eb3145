use std::{cell::RefCell, sync::OnceLock};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// Recursive lock around a store's mutable state, created on first use.
///
/// The same thread may lock again while already holding it, so a caller can group
/// several public store operations under one [`StoreGuard`].
pub(crate) struct StoreLock<T> {
    cell: OnceLock<ReentrantMutex<RefCell<T>>>,
    init: fn() -> T,
}

impl<T> StoreLock<T> {
    pub(crate) const fn new(init: fn() -> T) -> Self {
        Self {
            cell: OnceLock::new(),
            init,
        }
    }

    fn mutex(&self) -> &ReentrantMutex<RefCell<T>> {
        self.cell
            .get_or_init(|| ReentrantMutex::new(RefCell::new((self.init)())))
    }

    /// Runs `f` with exclusive access to the state.
    ///
    /// `f` must not call back into another operation of the same store.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let guard = self.mutex().lock();
        let mut state = guard.borrow_mut();
        f(&mut *state)
    }

    pub(crate) fn guard(&self) -> StoreGuard<'_> {
        let guard: ReentrantMutexGuard<'_, RefCell<T>> = self.mutex().lock();
        StoreGuard {
            _held: Box::new(guard),
        }
    }
}

trait Held {}

impl<T> Held for T {}

/// Holds a store's lock so a sequence of operations runs without interleaving.
pub struct StoreGuard<'a> {
    _held: Box<dyn Held + 'a>,
}
