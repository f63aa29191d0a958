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

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use super::ResolverBuilder;

/// A registry to store and retrieve name resolvers.  Resolvers are indexed
/// by the URI scheme they are intended to handle.
pub struct ResolverRegistry {
    m: Arc<Mutex<HashMap<String, Arc<dyn ResolverBuilder>>>>,
}

impl ResolverRegistry {
    /// Constructs an empty name resolver registry.
    pub fn new() -> Self {
        Self { m: Arc::default() }
    }

    /// Adds a name resolver into the registry.
    pub fn add_builder(&self, builder: impl ResolverBuilder + 'static) {
        self.m
            .lock()
            .unwrap()
            .insert(builder.scheme().to_string(), Arc::new(builder));
    }

    /// Retrieves a name resolver from the registry, or None if not found.
    pub fn get_scheme(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.m.lock().unwrap().get(scheme).cloned()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_RESOLVER_REGISTRY: LazyLock<ResolverRegistry> = LazyLock::new(ResolverRegistry::new);

/// Returns the registry used if a local registry is not provided to a
/// channel.  Resolver registration is expected to happen at process start,
/// before the first channel is created.
pub fn global_registry() -> &'static ResolverRegistry {
    &GLOBAL_RESOLVER_REGISTRY
}
