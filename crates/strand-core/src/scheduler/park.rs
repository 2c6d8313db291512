//! Blocking bridge for OS threads outside the worker pool

use super::context;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Drive `future` to completion on the calling thread, parking between polls.
///
/// # Panics
///
/// Panics on a worker thread: parking a worker would stall every task
/// queued behind it.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    if context::in_worker() {
        panic!("blocking call made from a runtime worker thread; use `.await` instead");
    }

    let mut future = pin!(future);
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);

    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        // An unpark between poll and park leaves the token set
        thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on_ready() {
        assert_eq!(block_on(async { 42 }), 42);
    }

    #[test]
    fn test_block_on_woken_from_other_thread() {
        let slot = Arc::new(parking_lot::Mutex::new((false, None::<Waker>)));
        let setter = slot.clone();

        let waiter = std::future::poll_fn(|cx| {
            let mut s = slot.lock();
            if s.0 {
                Poll::Ready("woken")
            } else {
                s.1 = Some(cx.waker().clone());
                Poll::Pending
            }
        });

        let t = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            let waker = {
                let mut s = setter.lock();
                s.0 = true;
                s.1.take()
            };
            if let Some(w) = waker {
                w.wake();
            }
        });

        assert_eq!(block_on(waiter), "woken");
        t.join().unwrap();
    }
}
