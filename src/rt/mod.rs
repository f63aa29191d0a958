/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//! An abstraction over the asynchronous runtime used by the channel.
//!
//! All background work performed by the channel — the synchronization
//! context's drain task, subchannel connection attempts, backoff timers —
//! is spawned through this trait, which keeps the runtime pluggable and the
//! timing behavior controllable in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

mod tokio_rt;

pub use tokio_rt::TokioRuntime;

/// The core functionality required from an async runtime: spawning
/// abortable background tasks and sleeping.
pub trait Runtime: Send + Sync {
    /// Spawns the given task to run in the background, returning a handle
    /// that may be used to abort it.
    fn spawn(
        &self,
        task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn TaskHandle>;

    /// Returns a future that completes after the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// A future that resolves after a specified duration.
pub trait Sleep: Send + Future<Output = ()> {}

/// A handle to a spawned task.
pub trait TaskHandle: Send + Sync {
    /// Aborts the associated task.  Aborting a completed task is a no-op.
    fn abort(&self);
}

/// Returns the runtime used by channels that are not configured with one.
pub(crate) fn default_runtime() -> Arc<dyn Runtime> {
    Arc::new(TokioRuntime)
}
