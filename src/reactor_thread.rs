use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::reactor::Reactor;

/// Runs a single `Reactor` on a dedicated thread. The constructing thread
/// blocks in `start()` until the worker has actually built its reactor and
/// published the `Arc` handle, via the mutex/condvar handshake the original
/// thread pool used around a raw `EventLoop*` (§4.8, §10 ambient stack).
pub struct ReactorThread {
    published: Arc<(Mutex<Option<Arc<Reactor>>>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl ReactorThread {
    pub fn new() -> ReactorThread {
        ReactorThread {
            published: Arc::new((Mutex::new(None), Condvar::new())),
            handle: None,
        }
    }

    /// Spawns the worker thread and waits for its reactor to be constructed
    /// and published, returning a handle any other thread can queue work on.
    pub fn start_loop(&mut self) -> Arc<Reactor> {
        assert!(self.handle.is_none(), "ReactorThread::start_loop called twice");
        let published = self.published.clone();

        let join = std::thread::spawn(move || {
            let reactor = match Reactor::new() {
                Ok(r) => r,
                Err(e) => {
                    log::error!("reactor thread: failed to construct reactor: {e}");
                    return;
                }
            };
            {
                let (lock, cvar) = &*published;
                let mut slot = lock.lock().unwrap();
                *slot = Some(reactor.clone());
                cvar.notify_one();
            }
            reactor.run();
        });
        self.handle = Some(join);

        let (lock, cvar) = &*self.published;
        let mut slot = lock.lock().unwrap();
        while slot.is_none() {
            slot = cvar.wait(slot).unwrap();
        }
        slot.clone().expect("reactor published")
    }

    fn reactor(&self) -> Option<Arc<Reactor>> {
        self.published.0.lock().unwrap().clone()
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        if let Some(reactor) = self.reactor() {
            reactor.quit();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_loop_returns_a_running_reactor_on_its_own_thread() {
        let mut rt = ReactorThread::new();
        let reactor = rt.start_loop();
        let r2 = reactor.clone();
        reactor.run_after(0.05, move || r2.quit());
        for _ in 0..200 {
            if !reactor.is_running() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        // reactor.run() happens on the worker thread; is_running reflects
        // its state once it actually starts looping.
        drop(rt);
    }
}
