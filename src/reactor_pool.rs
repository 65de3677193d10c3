use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::reactor::Reactor;
use crate::reactor_thread::ReactorThread;

/// Owns `N` worker reactors and hands them out round-robin. With zero
/// worker threads every connection is handled on `base` itself — a
/// single-threaded server is just a pool with `thread_count == 0` (§4.8).
pub struct ReactorThreadPool {
    base: Arc<Reactor>,
    thread_count: usize,
    started: std::sync::atomic::AtomicBool,
    threads: std::sync::Mutex<Vec<ReactorThread>>,
    reactors: std::sync::Mutex<Vec<Arc<Reactor>>>,
    next: AtomicUsize,
}

impl ReactorThreadPool {
    pub fn new(base: Arc<Reactor>) -> ReactorThreadPool {
        ReactorThreadPool {
            base,
            thread_count: 0,
            started: std::sync::atomic::AtomicBool::new(false),
            threads: std::sync::Mutex::new(Vec::new()),
            reactors: std::sync::Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn set_thread_count(&mut self, count: usize) {
        assert!(
            !self.started.load(Ordering::SeqCst),
            "set_thread_count called after start()"
        );
        self.thread_count = count;
    }

    pub fn start(&self) {
        self.base.assert_owner_thread();
        assert!(!self.started.swap(true, Ordering::SeqCst), "start() called twice");

        let mut threads = Vec::with_capacity(self.thread_count);
        let mut reactors = Vec::with_capacity(self.thread_count);
        for _ in 0..self.thread_count {
            let mut t = ReactorThread::new();
            reactors.push(t.start_loop());
            threads.push(t);
        }
        *self.threads.lock().unwrap() = threads;
        *self.reactors.lock().unwrap() = reactors;
    }

    /// Must be called from `base`'s owning thread.
    pub fn next(&self) -> Arc<Reactor> {
        self.base.assert_owner_thread();
        let reactors = self.reactors.lock().unwrap();
        if reactors.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst) % reactors.len();
        reactors[i].clone()
    }

    pub fn all_reactors(&self) -> Vec<Arc<Reactor>> {
        let reactors = self.reactors.lock().unwrap();
        if reactors.is_empty() {
            vec![self.base.clone()]
        } else {
            reactors.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threads_always_returns_base() {
        let base = Reactor::new().unwrap();
        let pool = ReactorThreadPool::new(base.clone());
        pool.start();
        assert!(Arc::ptr_eq(&pool.next(), &base));
        assert!(Arc::ptr_eq(&pool.next(), &base));
    }

    #[test]
    fn round_robins_across_worker_reactors() {
        let base = Reactor::new().unwrap();
        let mut pool = ReactorThreadPool::new(base.clone());
        pool.set_thread_count(3);
        pool.start();

        let a = pool.next();
        let b = pool.next();
        let c = pool.next();
        let d = pool.next();
        assert!(Arc::ptr_eq(&a, &d));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&b, &c));
    }

    #[test]
    #[should_panic]
    fn set_thread_count_after_start_panics() {
        let base = Reactor::new().unwrap();
        let mut pool = ReactorThreadPool::new(base);
        pool.start();
        pool.set_thread_count(2);
    }
}
