/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The channel's concurrency backbone.
//!
//! A [`SynchronizationContext`] serializes every mutation of shared channel
//! state onto one drain task that exclusively owns that state.  Load
//! balancers, subchannel watchers, and resolver listeners never take locks;
//! they enqueue closures that receive `&mut S` and run strictly in FIFO
//! order.  Enqueueing from within a running task is allowed and places the
//! closure behind everything already queued, so reentrancy cannot corrupt
//! state.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::rt::{Runtime, TaskHandle};

type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// A serialized executor for tasks operating on a guarded state `S`.
///
/// Cloning produces another handle to the same queue.  The drain task exits
/// when every handle has been dropped and the queue has emptied.
pub(crate) struct SynchronizationContext<S> {
    tx: mpsc::UnboundedSender<Task<S>>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Task<S>>>>>,
    runtime: Arc<dyn Runtime>,
}

impl<S> Clone for SynchronizationContext<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<S: Send + 'static> SynchronizationContext<S> {
    pub(crate) fn new(runtime: Arc<dyn Runtime>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            runtime,
        }
    }

    /// Takes ownership of the guarded state and spawns the drain task.
    /// Must be called exactly once.
    pub(crate) fn run(&self, mut state: S) {
        let mut rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("SynchronizationContext::run called twice");
        self.runtime.spawn(Box::pin(async move {
            while let Some(task) = rx.recv().await {
                task(&mut state);
            }
        }));
    }

    /// Enqueues a task.  Tasks run in the order they were enqueued.  Safe to
    /// call from within a running task; the new task runs after the current
    /// one returns and the earlier queue entries drain.
    pub(crate) fn execute(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        // Fails only after shutdown, when dropping the task is correct.
        let _ = self.tx.send(Box::new(task));
    }

    /// Enqueues a task after the given delay.  The returned handle cancels
    /// the task if it has not yet been enqueued; cancelling after it fires
    /// is a no-op, as is cancelling twice.
    pub(crate) fn schedule(
        &self,
        delay: Duration,
        task: impl FnOnce(&mut S) + Send + 'static,
    ) -> ScheduledHandle {
        let fired_or_cancelled = Arc::new(AtomicBool::new(false));
        let flag = fired_or_cancelled.clone();
        let tx = self.tx.clone();
        let sleep = self.runtime.sleep(delay);
        let timer = self.runtime.spawn(Box::pin(async move {
            sleep.await;
            if !flag.swap(true, Ordering::SeqCst) {
                let _ = tx.send(Box::new(task));
            }
        }));
        ScheduledHandle {
            fired_or_cancelled,
            timer,
        }
    }
}

/// A cancellation handle for a task scheduled via
/// [`SynchronizationContext::schedule`].
pub(crate) struct ScheduledHandle {
    fired_or_cancelled: Arc<AtomicBool>,
    timer: Box<dyn TaskHandle>,
}

impl ScheduledHandle {
    pub(crate) fn cancel(&self) {
        if !self.fired_or_cancelled.swap(true, Ordering::SeqCst) {
            self.timer.abort();
        }
    }
}

impl Drop for ScheduledHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
