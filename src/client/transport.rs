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

//! The seam between the channel and the wire.
//!
//! The channel runtime does not implement any transport.  Subchannels ask a
//! [`Transport`] to establish a connection, receive back a [`Service`] for
//! issuing RPCs on it, and learn about its demise through a disconnection
//! listener.  Transports are indexed by the network type of the address
//! they handle.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, LazyLock, Mutex};

use tokio::sync::oneshot;
use tonic::async_trait;

use crate::rt::Runtime;
use crate::service::Service;

/// An established connection, as handed to a subchannel.
pub struct ConnectedTransport {
    /// Issues RPCs on the connection.
    pub service: Arc<dyn Service>,

    /// Resolves when the connection terminates.  The payload describes why,
    /// for logging; the connection is equally gone either way.
    pub disconnection_listener: oneshot::Receiver<Result<(), String>>,
}

/// Establishes connections to addresses of one network type.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to the given address.  The future resolves once the
    /// connection is usable or has definitively failed.
    async fn connect(
        &self,
        address: String,
        runtime: Arc<dyn Runtime>,
    ) -> Result<ConnectedTransport, String>;
}

/// A registry to store and retrieve transports.  Transports are indexed by
/// the network type of the addresses they are intended to handle.
#[derive(Default, Clone)]
pub struct TransportRegistry {
    m: Arc<Mutex<HashMap<String, Arc<dyn Transport>>>>,
}

impl Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.m.lock().unwrap();
        f.debug_set().entries(m.keys()).finish()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transport to the registry.
    pub fn add_transport(&self, network_type: &str, transport: impl Transport + 'static) {
        self.m
            .lock()
            .unwrap()
            .insert(network_type.to_string(), Arc::new(transport));
    }

    /// Retrieves the transport for a network type, or an error if none is
    /// registered for it.
    pub fn get_transport(&self, network_type: &str) -> Result<Arc<dyn Transport>, String> {
        self.m
            .lock()
            .unwrap()
            .get(network_type)
            .cloned()
            .ok_or_else(|| format!("no transport found for network type {network_type}"))
    }
}

/// The registry consulted by channels that are not configured with a
/// transport override.
pub static GLOBAL_TRANSPORT_REGISTRY: LazyLock<TransportRegistry> =
    LazyLock::new(TransportRegistry::new);
