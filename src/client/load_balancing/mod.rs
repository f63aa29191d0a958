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

//! Load balancing for gRPC channels.
//!
//! An LB policy consumes resolved addresses, manages the subchannels that
//! connect to them, and produces immutable [`Picker`] snapshots that route
//! each RPC to a connection.  Policies are registered by name and selected
//! through the service config.

pub mod cluster_impl;
pub mod cluster_resolver;
pub mod pick_first;
pub mod priority;
pub mod registry;
pub mod ring_hash;
pub mod round_robin;
pub mod weighted_target;

pub(crate) mod graceful_switch;

#[cfg(test)]
pub(crate) mod test_utils;

use std::any::Any;
use std::error::Error;
use std::fmt::Display;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tonic::{Status, metadata::MetadataMap};

use crate::client::ConnectivityState;
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::rt::Runtime;
use crate::service::Request;

pub use crate::client::subchannel::Subchannel;
pub use registry::{GLOBAL_LB_REGISTRY, LbPolicyRegistry};

/// A collection of data configured on the channel that is constructing
/// this LbPolicy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations outside a call from the
    /// channel.
    pub work_scheduler: Arc<dyn WorkScheduler>,

    /// The runtime which provides utilities to do async work.
    pub runtime: Arc<dyn Runtime>,
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    /// Schedules a call into the LbPolicy's work method.  If there is
    /// already a pending work call that has not yet started, this may not
    /// schedule another call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the
/// channel to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is
    /// delivered via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.  Names are globally unique; a
    /// registry holds at most one builder per name.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal
    /// representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.  All methods are invoked serially by the channel's synchronization
/// context, so implementations hold no locks of their own.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.  Returning an error
    /// signals the channel to re-resolve with backoff.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel in response to a call from the LB policy to
    /// the WorkScheduler's schedule_work method.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called by the channel to leave the Idle state, typically because an
    /// RPC was attempted.
    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {}
}

/// Controls channel behaviors on behalf of an LB policy.
pub trait ChannelController: Send {
    /// Creates a new subchannel in Idle state for the given ordered address
    /// list.  The policy that created a subchannel exclusively owns it and
    /// must shut it down when it is no longer needed.
    fn new_subchannel(&mut self, addresses: &[Address]) -> Subchannel;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.
    /// Typically used when connections fail, indicating a possible change
    /// in the overall network configuration.
    fn request_resolution(&mut self);
}

/// Represents the current state of a Subchannel.
#[derive(Clone)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See Subchannel for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,

    /// Set if connectivity state is TransientFailure to describe the most
    /// recent connection error.  None for any other state.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl SubchannelState {
    pub fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            last_connection_error: None,
        }
    }
}

impl Default for SubchannelState {
    fn default() -> Self {
        Self::new(ConnectivityState::Idle)
    }
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last_connection_error {
            Some(error) => write!(f, "{} ({})", self.connectivity_state, error),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

/// An opaque, parsed LB policy configuration.  Produced by an
/// LbPolicyBuilder's parse_config and handed back to instances of the same
/// policy.  Cloning shares the underlying configuration.
#[derive(Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Creates a new LbConfig wrapper containing the provided config.
    pub fn new<T: Send + Sync + 'static>(config: T) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Borrows the wrapped configuration as the type used by the LbPolicy.
    pub fn convert_to<T: 'static>(&self) -> Result<&T, Box<dyn Error + Send + Sync>> {
        self.config
            .downcast_ref::<T>()
            .ok_or_else(|| "LB config holds an unexpected type".into())
    }
}

/// The JSON form of one LB policy's configuration, as found in the service
/// config's loadBalancingConfig list.
#[derive(Clone, Debug)]
pub struct ParsedJsonLbConfig {
    pub value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Deserializes the JSON into the policy's config type.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, Box<dyn Error + Send + Sync>> {
        serde_json::from_value(self.value.clone()).map_err(|err| err.to_string().into())
    }
}

/// A Picker is responsible for deciding what Subchannel to use for any
/// given request.  A Picker is used at most once per RPC attempt.  If
/// pick() returns Queue, the channel holds the RPC until a new Picker is
/// produced by the LbPolicy, and calls pick() on the new Picker for the
/// request.
///
/// Pickers are immutable snapshots: the LbPolicy replaces the channel's
/// picker rather than mutating it, so readers on any thread observe either
/// the old picker or the new one, never a mixture.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function must not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue,
    /// and the pick will be repeated when a new Picker is produced.
    fn pick(&self, request: &Request) -> PickResult;
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),

    /// Indicates the LbPolicy is attempting to connect to a server to use
    /// for the request.  The channel queues the RPC until a new picker is
    /// available, bounded by the RPC's deadline.
    Queue,

    /// Indicates that the request should fail with the included error
    /// status (with the code converted to UNAVAILABLE).  If the RPC is
    /// wait-for-ready, it is not terminated, but instead attempted on a new
    /// picker if one is produced before it is cancelled.
    Fail(Status),

    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.  A drop is a policy
    /// decision, not a connectivity failure, and bypasses the retry path.
    Drop(Status),
}

impl PickResult {
    /// A Fail result carrying an UNAVAILABLE status with the given message.
    pub fn fail_unavailable(message: impl Into<String>) -> Self {
        PickResult::Fail(Status::unavailable(message.into()))
    }
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Subchannel,

    /// Metadata to be added to the existing outgoing metadata.
    pub metadata: MetadataMap,

    /// If set, the channel invokes the tracer around the life of the stream
    /// created for this pick.
    pub stream_tracer: Option<Arc<dyn ClientStreamTracer>>,
}

impl std::fmt::Debug for Pick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pick")
            .field("subchannel", &self.subchannel)
            .field("metadata", &self.metadata)
            .field(
                "stream_tracer",
                &self.stream_tracer.as_ref().map(|_| "<tracer>"),
            )
            .finish()
    }
}

impl Pick {
    pub fn new(subchannel: Subchannel) -> Self {
        Self {
            subchannel,
            metadata: MetadataMap::new(),
            stream_tracer: None,
        }
    }
}

/// Observes the lifecycle of a stream created for a pick.  Invoked from
/// call-path threads; implementations must be lock-free or nearly so.
pub trait ClientStreamTracer: Send + Sync {
    /// The stream was created.
    fn stream_started(&self) {}

    /// The stream terminated with the given status.  Called exactly once
    /// per started stream.
    fn stream_closed(&self, _status: &Status) {}
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting with a picker
    /// that queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with the wrapped error.  Used when the policy has no
/// usable connections.
pub struct Failing {
    pub error: String,
}

impl Picker for Failing {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::fail_unavailable(self.error.clone())
    }
}

/// A ChannelController decorator used by policies that wrap other policies.
/// It intercepts picker updates and records created subchannels so the
/// wrapping policy can post-process its child's behavior; everything else
/// forwards to the wrapped controller.
pub(crate) struct WrappedController<'a> {
    pub(crate) inner: &'a mut dyn ChannelController,
    pub(crate) picker_update: Option<LbState>,
    pub(crate) created_subchannels: Vec<Subchannel>,
}

impl<'a> WrappedController<'a> {
    pub(crate) fn new(inner: &'a mut dyn ChannelController) -> Self {
        Self {
            inner,
            picker_update: None,
            created_subchannels: vec![],
        }
    }

    /// Releases the wrapped controller and returns what the child did
    /// through it.
    pub(crate) fn into_parts(self) -> (Option<LbState>, Vec<Subchannel>) {
        (self.picker_update, self.created_subchannels)
    }
}

impl ChannelController for WrappedController<'_> {
    fn new_subchannel(&mut self, addresses: &[Address]) -> Subchannel {
        let subchannel = self.inner.new_subchannel(addresses);
        self.created_subchannels.push(subchannel.clone());
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker_update = Some(update);
    }

    fn request_resolution(&mut self) {
        self.inner.request_resolution();
    }
}

/// Flattens the ordered endpoint list into an ordered, deduplicated address
/// list, preserving first-occurrence order.
pub(crate) fn flatten_addresses(
    endpoints: &[crate::client::name_resolution::Endpoint],
) -> Vec<Address> {
    let mut seen = std::collections::HashSet::new();
    endpoints
        .iter()
        .flat_map(|endpoint| endpoint.addresses.iter().cloned())
        .filter(|address| seen.insert(address.clone()))
        .collect()
}
