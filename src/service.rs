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

//! The data-plane seam between the channel and its transports.
//!
//! The channel does not encode or decode messages; requests and responses
//! carry opaque byte frames, and the codec layers above this crate are
//! responsible for their contents.

use std::pin::Pin;

use bytes::Bytes;
use tokio_stream::Stream;
use tonic::{Status, async_trait, metadata::MetadataMap};

use crate::client::CallOptions;

/// The stream of outgoing message frames for a request.
pub type RequestStream = Pin<Box<dyn Stream<Item = Bytes> + Send + Sync>>;

/// The stream of incoming message frames for a response.  The stream ends
/// with an error item if the call terminates with a non-OK status.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// A single RPC as seen by the channel: the full method name, the outgoing
/// metadata, per-call options, and the outgoing message frames.
pub struct Request {
    /// The full method name, e.g. "/pkg.Service/Method".
    pub method: String,

    /// Metadata to send with the request.
    pub headers: MetadataMap,

    /// Settings for this call.
    pub options: CallOptions,

    /// Outgoing message frames.
    pub messages: RequestStream,
}

impl Request {
    /// Creates a request with no metadata, default options, and no outgoing
    /// messages.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            headers: MetadataMap::new(),
            options: CallOptions::default(),
            messages: Box::pin(tokio_stream::empty()),
        }
    }
}

/// The server's answer to a [`Request`].
pub struct Response {
    /// Initial metadata returned by the server.
    pub headers: MetadataMap,

    /// Incoming message frames.
    pub messages: ResponseStream,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("headers", &self.headers)
            .field("messages", &"<stream>")
            .finish()
    }
}

/// A type capable of performing RPCs.  Implemented by connected transports;
/// the channel itself routes each call to one of them.
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, request: Request) -> Result<Response, Status>;
}
