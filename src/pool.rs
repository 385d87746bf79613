//! Bounded object pools with guaranteed forward progress: one for data
//! pages used by write cloning and bouncing, one capping concurrent
//! per-bio lifecycle objects.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::bio::Page;
use crate::helpers::IoBuf;
use crate::{MIN_BIO_PAGES, MIN_IOS, MIN_POOL_PAGES, PAGE_SIZE};

// Bounded wait before dipping past the reserve; keeps concurrent writers
// that each hold a partial clone from wedging each other.
const ALLOC_STALL: Duration = Duration::from_millis(100);

struct PageState {
    free: Vec<IoBuf>,
    outstanding: usize,
}

pub(crate) struct PagePoolShared {
    state: Mutex<PageState>,
    cv: Condvar,
    cap: usize,
}

impl PagePoolShared {
    pub(crate) fn release(&self, store: IoBuf) {
        let mut state = self.state.lock().unwrap();
        state.outstanding -= 1;
        if state.free.len() < self.cap {
            state.free.push(store);
        }
        drop(state);
        self.cv.notify_all();
    }
}

/// Pool of page-sized buffers. The reserve is pre-allocated and always
/// recycled, so a blocked allocator makes progress as soon as any in-flight
/// clone completes.
#[derive(Clone)]
pub struct PagePool {
    shared: Arc<PagePoolShared>,
}

impl PagePool {
    pub fn new() -> Self {
        Self::with_capacity(MIN_POOL_PAGES)
    }

    /// Pool with `cap` pages of reserve. Capacities below the blocking
    /// prefix of a clone allocation are raised to it.
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(MIN_BIO_PAGES);
        let free = (0..cap).map(|_| IoBuf::new(PAGE_SIZE)).collect();
        PagePool {
            shared: Arc::new(PagePoolShared {
                state: Mutex::new(PageState {
                    free,
                    outstanding: 0,
                }),
                cv: Condvar::new(),
                cap,
            }),
        }
    }

    fn take(&self, state: &mut PageState) -> Arc<Page> {
        let store = state.free.pop().unwrap_or_else(|| IoBuf::new(PAGE_SIZE));
        state.outstanding += 1;
        Arc::new(Page::pooled(store, Arc::downgrade(&self.shared)))
    }

    /// Allocate a page, waiting for the pool when the reserve is in use.
    /// After a bounded stall the pool allocates past its reserve instead of
    /// wedging; the overshoot decays as pages are released.
    pub fn alloc(&self) -> Arc<Page> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if !state.free.is_empty() || state.outstanding < self.shared.cap {
                return self.take(&mut state);
            }
            let (s, timeout) = self.shared.cv.wait_timeout(state, ALLOC_STALL).unwrap();
            state = s;
            if timeout.timed_out() {
                log::warn!("page pool exhausted, allocating past the reserve");
                return self.take(&mut state);
            }
        }
    }

    /// Non-blocking allocation; `None` when the reserve is fully in use.
    pub fn try_alloc(&self) -> Option<Arc<Page>> {
        let mut state = self.shared.state.lock().unwrap();
        if state.free.is_empty() && state.outstanding >= self.shared.cap {
            return None;
        }
        Some(self.take(&mut state))
    }

    pub fn in_use(&self) -> usize {
        self.shared.state.lock().unwrap().outstanding
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

struct IoPoolShared {
    count: Mutex<usize>,
    cv: Condvar,
    cap: usize,
}

/// Caps the number of in-flight lifecycle objects per target. Reservation
/// blocks when the cap is reached and is released when the object is
/// destroyed, so the upper layer is backpressured instead of failed.
#[derive(Clone)]
pub struct IoPool {
    shared: Arc<IoPoolShared>,
}

pub struct IoPermit {
    shared: Arc<IoPoolShared>,
}

impl IoPool {
    pub fn new() -> Self {
        Self::with_capacity(MIN_IOS)
    }

    pub fn with_capacity(cap: usize) -> Self {
        IoPool {
            shared: Arc::new(IoPoolShared {
                count: Mutex::new(0),
                cv: Condvar::new(),
                cap,
            }),
        }
    }

    pub fn reserve(&self) -> IoPermit {
        let mut count = self.shared.count.lock().unwrap();
        while *count >= self.shared.cap {
            count = self.shared.cv.wait(count).unwrap();
        }
        *count += 1;
        IoPermit {
            shared: self.shared.clone(),
        }
    }

    pub fn in_use(&self) -> usize {
        *self.shared.count.lock().unwrap()
    }
}

impl Default for IoPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IoPermit {
    fn drop(&mut self) {
        let mut count = self.shared.count.lock().unwrap();
        *count -= 1;
        drop(count);
        self.shared.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_pool_recycles_reserve() {
        let pool = PagePool::with_capacity(8);
        let pages: Vec<_> = (0..8).map(|_| pool.alloc()).collect();
        assert_eq!(pool.in_use(), 8);
        assert!(pool.try_alloc().is_none());

        drop(pages);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.try_alloc().is_some());
    }

    #[test]
    fn test_page_pool_blocked_alloc_wakes_on_release() {
        let pool = PagePool::with_capacity(8);
        let held: Vec<_> = (0..8).map(|_| pool.alloc()).collect();

        let p2 = pool.clone();
        let waiter = std::thread::spawn(move || p2.alloc());
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        let page = waiter.join().unwrap();
        assert_eq!(page.len(), PAGE_SIZE);
    }

    #[test]
    fn test_io_pool_backpressure() {
        let pool = IoPool::with_capacity(2);
        let a = pool.reserve();
        let _b = pool.reserve();
        assert_eq!(pool.in_use(), 2);

        let p2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            let _c = p2.reserve();
        });
        std::thread::sleep(Duration::from_millis(20));
        drop(a);
        waiter.join().unwrap();
        assert_eq!(pool.in_use(), 1);
    }
}
