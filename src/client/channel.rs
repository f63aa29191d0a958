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

//! The channel: the composition of a name resolver, a load-balancing
//! policy, and the per-call pick path.
//!
//! All channel state lives behind a [`SynchronizationContext`]; resolver
//! listeners and subchannel watchers re-enter the channel only by
//! enqueueing closures on it.  The call path touches none of that state:
//! it reads an immutable picker snapshot from an atomic slot, and either
//! dispatches, fails, or parks on a notification that a new snapshot was
//! published.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio_stream::Stream;
use tonic::metadata::KeyAndValueRef;
use tonic::{Status, metadata::MetadataMap};
use tracing::{debug, warn};

use crate::client::ConnectivityState;
use crate::client::backoff::{
    DEFAULT_EXPONENTIAL_CONFIG, ExponentialBackoff, MIN_CONNECT_TIMEOUT,
};
use crate::client::load_balancing::graceful_switch::GracefulSwitchPolicy;
use crate::client::load_balancing::{
    ChannelController, ClientStreamTracer, Failing, GLOBAL_LB_REGISTRY, LbState, PickResult,
    Subchannel, SubchannelState, WorkScheduler, pick_first, round_robin,
};
use crate::client::name_resolution::{
    Address, Resolver, ResolverListener, ResolverOptions, ResolverUpdate, Target, global_registry,
};
use crate::client::service_config::LbPolicySelection;
use crate::client::subchannel::{
    InternalSubchannel, SubchannelKey, SubchannelPool, SubchannelStateWatcher,
};
use crate::client::sync_context::{ScheduledHandle, SynchronizationContext};
use crate::client::transport::{GLOBAL_TRANSPORT_REGISTRY, Transport};
use crate::rt::{Runtime, default_runtime};
use crate::service::{Request, Response, ResponseStream};

/// Configuration for a channel, beyond its target.
#[derive(Default, Clone)]
#[non_exhaustive]
pub struct ChannelOptions {
    /// The transport used for every address, overriding the global
    /// transport registry.  Mainly useful for tests and custom stacks.
    pub transport: Option<Arc<dyn Transport>>,

    /// The runtime on which all channel background work runs.  Defaults to
    /// tokio.
    pub runtime: Option<Arc<dyn Runtime>>,
}

/// A virtual, persistent connection to a service.
///
/// Channel creation cannot fail: if the target string is invalid or names
/// an unknown resolver scheme, the returned channel fails all RPCs with an
/// appropriate status instead.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<PersistentChannel>,
}

impl Channel {
    pub fn new(target: &str, options: ChannelOptions) -> Self {
        Self {
            inner: Arc::new(PersistentChannel {
                target: target.parse::<Target>().map_err(|err| {
                    format!("could not parse target {target}: {err}")
                }),
                options,
                active: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Performs an RPC on the channel.
    ///
    /// While the channel has no usable connection the call buffers, bounded
    /// by its deadline; a pick that fails outright terminates the call
    /// immediately unless the wait-for-ready call option is set.
    pub async fn call(&self, mut request: Request) -> Result<Response, Status> {
        let active = self.inner.active_channel();
        let deadline = request.options.deadline;
        let wait_for_ready = request.options.wait_for_ready;
        loop {
            // Register for picker replacement before reading the current
            // snapshot, so a concurrent publish cannot be missed.
            let mut notified = std::pin::pin!(active.picker_changed.notified());
            notified.as_mut().enable();
            let lb_state = active.picker.load_full();
            if lb_state.connectivity_state == ConnectivityState::Shutdown {
                return Err(Status::unavailable("channel is shut down"));
            }
            match lb_state.picker.pick(&request) {
                PickResult::Pick(pick) => {
                    let Some(service) = pick.subchannel.connected_service() else {
                        // The connection went away after this picker was
                        // snapshotted.  Wait for the next picker.
                        debug!("picked a disconnected subchannel; re-picking");
                        wait_for_picker(notified, &active, deadline).await?;
                        continue;
                    };
                    merge_metadata(&mut request.headers, &pick.metadata);
                    if let Some(tracer) = &pick.stream_tracer {
                        tracer.stream_started();
                    }
                    return match service.call(request).await {
                        Ok(response) => Ok(trace_response(response, pick.stream_tracer)),
                        Err(status) => {
                            if let Some(tracer) = &pick.stream_tracer {
                                tracer.stream_closed(&status);
                            }
                            Err(status)
                        }
                    };
                }
                PickResult::Queue => {
                    if lb_state.connectivity_state == ConnectivityState::Idle {
                        active.ctx.execute(|state| state.exit_idle());
                    }
                    wait_for_picker(notified, &active, deadline).await?;
                }
                PickResult::Fail(status) => {
                    if wait_for_ready {
                        wait_for_picker(notified, &active, deadline).await?;
                    } else {
                        // Fail picks surface as UNAVAILABLE per the
                        // control-plane status code restrictions.
                        return Err(Status::unavailable(status.message()));
                    }
                }
                // A drop is a policy decision and ignores wait-for-ready.
                PickResult::Drop(status) => return Err(status),
            }
        }
    }

    /// Returns the current state of the channel.  If connect is set, an
    /// idle channel will begin connecting.
    pub fn state(&self, connect: bool) -> ConnectivityState {
        if self.inner.active.lock().unwrap().is_none() {
            if self.inner.shut_down.load(Ordering::SeqCst) {
                return ConnectivityState::Shutdown;
            }
            if !connect {
                return ConnectivityState::Idle;
            }
        }
        let active = self.inner.active_channel();
        let state = active.picker.load().connectivity_state;
        if connect && state == ConnectivityState::Idle {
            active.ctx.execute(|state| state.exit_idle());
        }
        state
    }

    /// Shuts the channel down: the resolver stops, every subchannel
    /// disconnects, and all pending and future calls fail.  Irreversible.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        if let Some(active) = &*self.inner.active.lock().unwrap() {
            active.ctx.execute(|state| state.shutdown());
        }
    }
}

/// Parks until a new picker is published, respecting the call deadline.
async fn wait_for_picker(
    notified: Pin<&mut tokio::sync::futures::Notified<'_>>,
    active: &ActiveChannel,
    deadline: Option<Instant>,
) -> Result<(), Status> {
    match deadline {
        None => {
            notified.await;
            Ok(())
        }
        Some(deadline) => {
            let now = Instant::now();
            if deadline <= now {
                return Err(Status::deadline_exceeded("deadline exceeded while queued"));
            }
            let mut sleep = active.runtime.sleep(deadline - now);
            tokio::select! {
                _ = notified => Ok(()),
                _ = &mut sleep => Err(Status::deadline_exceeded("deadline exceeded while queued")),
            }
        }
    }
}

fn merge_metadata(headers: &mut MetadataMap, extra: &MetadataMap) {
    for entry in extra.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                headers.append(key.clone(), value.clone());
            }
            KeyAndValueRef::Binary(key, value) => {
                headers.append_bin(key.clone(), value.clone());
            }
        }
    }
}

/// Wraps the response stream so the pick's tracer observes the stream's
/// termination exactly once, including abandonment.
fn trace_response(response: Response, tracer: Option<Arc<dyn ClientStreamTracer>>) -> Response {
    let Some(tracer) = tracer else {
        return response;
    };
    Response {
        headers: response.headers,
        messages: Box::pin(TracedResponseStream {
            inner: response.messages,
            tracer,
            closed: false,
        }),
    }
}

struct TracedResponseStream {
    inner: ResponseStream,
    tracer: Arc<dyn ClientStreamTracer>,
    closed: bool,
}

impl TracedResponseStream {
    fn close(&mut self, status: &Status) {
        if !self.closed {
            self.closed = true;
            self.tracer.stream_closed(status);
        }
    }
}

impl Stream for TracedResponseStream {
    type Item = Result<bytes::Bytes, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(None) => this.close(&Status::ok("")),
            Poll::Ready(Some(Err(status))) => {
                let status = status.clone();
                this.close(&status);
            }
            _ => {}
        }
        polled
    }
}

impl Drop for TracedResponseStream {
    fn drop(&mut self) {
        self.close(&Status::cancelled("response stream dropped"));
    }
}

/// The static configuration of a channel plus an optional ActiveChannel.
/// An ActiveChannel exists whenever the channel is not idle; every channel
/// is idle at creation.
struct PersistentChannel {
    target: Result<Target, String>,
    options: ChannelOptions,
    active: Mutex<Option<Arc<ActiveChannel>>>,
    shut_down: AtomicBool,
}

impl PersistentChannel {
    fn active_channel(&self) -> Arc<ActiveChannel> {
        let mut active = self.active.lock().unwrap();
        if let Some(existing) = &*active {
            return existing.clone();
        }
        let created = Arc::new(ActiveChannel::new(&self.target, &self.options));
        if self.shut_down.load(Ordering::SeqCst) {
            // Shut down while idle: the activation exists only to fail
            // calls.
            created.ctx.execute(|state| state.shutdown());
        }
        *active = Some(created.clone());
        created
    }
}

/// A channel that has left the idle state: a running resolver, an LB
/// policy tree, and the picker slot the call path reads.
struct ActiveChannel {
    picker: Arc<ArcSwap<LbState>>,
    picker_changed: Arc<Notify>,
    ctx: SynchronizationContext<ChannelState>,
    runtime: Arc<dyn Runtime>,
}

impl ActiveChannel {
    fn new(target: &Result<Target, String>, options: &ChannelOptions) -> Self {
        // The built-in policies referenced by default configs.
        pick_first::reg();
        round_robin::reg();

        let runtime = options.runtime.clone().unwrap_or_else(default_runtime);
        let picker = Arc::new(ArcSwap::from_pointee(LbState::initial()));
        let picker_changed = Arc::new(Notify::new());
        let ctx: SynchronizationContext<ChannelState> =
            SynchronizationContext::new(runtime.clone());

        let work_scheduler = Arc::new(ChannelWorkScheduler {
            ctx: ctx.clone(),
            pending: Arc::new(AtomicBool::new(false)),
        });
        let controller = InternalChannelController {
            picker: picker.clone(),
            picker_changed: picker_changed.clone(),
            pool: Arc::new(SubchannelPool::new()),
            transport_override: options.transport.clone(),
            runtime: runtime.clone(),
            ctx: Some(ctx.clone()),
            resolver: None,
            resolver_backoff: ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG)
                .expect("default backoff config is valid"),
            resolver_retry: None,
            current_selection: None,
            shutdown: false,
        };
        ctx.run(ChannelState {
            lb: GracefulSwitchPolicy::new(work_scheduler, runtime.clone()),
            controller,
        });

        match Self::build_resolver(target, &ctx) {
            Ok(resolver) => {
                ctx.execute(move |state| state.controller.resolver = Some(resolver));
            }
            Err(error) => {
                warn!("channel cannot resolve its target: {error}");
                ctx.execute(move |state| {
                    state.controller.update_picker(LbState {
                        connectivity_state: ConnectivityState::TransientFailure,
                        picker: Arc::new(Failing { error }),
                    });
                });
            }
        }

        Self {
            picker,
            picker_changed,
            ctx,
            runtime,
        }
    }

    fn build_resolver(
        target: &Result<Target, String>,
        ctx: &SynchronizationContext<ChannelState>,
    ) -> Result<Box<dyn Resolver>, String> {
        let target = target.as_ref().map_err(Clone::clone)?;
        let builder = global_registry()
            .get_scheme(target.scheme())
            .ok_or_else(|| format!("no name resolver for scheme {}", target.scheme()))?;
        if !builder.is_valid_uri(target) {
            return Err(format!("target {target} is not valid for its resolver"));
        }
        let listener = Arc::new(ChannelResolverListener { ctx: ctx.clone() });
        let options = ResolverOptions {
            authority: builder.default_authority(target),
        };
        Ok(builder.build(target, listener, options))
    }
}

impl Drop for ActiveChannel {
    fn drop(&mut self) {
        self.ctx.execute(|state| state.shutdown());
    }
}

/// Everything guarded by the channel's synchronization context.
struct ChannelState {
    lb: GracefulSwitchPolicy,
    controller: InternalChannelController,
}

impl ChannelState {
    fn handle_resolver_update(&mut self, update: ResolverUpdate) {
        if self.controller.shutdown {
            return;
        }
        let had_error = update.endpoints.is_err();
        let selection = match self.select_policy(&update) {
            Ok(selection) => selection,
            Err(terminal) => {
                // A config error is a bug upstream, not a transient
                // condition; fail picks without scheduling a retry.
                self.controller.update_picker(LbState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    picker: Arc::new(Failing { error: terminal }),
                });
                return;
            }
        };
        let result = self
            .lb
            .resolver_update(update, &selection, &mut self.controller);
        if result.is_ok() && !had_error {
            self.controller.current_selection = Some(selection);
            self.controller.resolver_backoff.reset();
            self.controller.resolver_retry = None;
        } else {
            self.controller.schedule_resolver_retry();
        }
    }

    /// Chooses the LB policy for this update: the service config's choice
    /// when it names one, otherwise the last good choice, otherwise
    /// pick_first.
    fn select_policy(&mut self, update: &ResolverUpdate) -> Result<LbPolicySelection, String> {
        match &update.service_config {
            Err(error) => match &self.controller.current_selection {
                Some(selection) => Ok(selection.clone()),
                None => Err(format!("invalid service config: {error}")),
            },
            Ok(Some(config)) => match &config.lb_policy {
                Some(selection) => Ok(selection.clone()),
                None => Ok(self
                    .controller
                    .current_selection
                    .clone()
                    .unwrap_or_else(default_policy_selection)),
            },
            Ok(None) => Ok(self
                .controller
                .current_selection
                .clone()
                .unwrap_or_else(default_policy_selection)),
        }
    }

    fn handle_subchannel_update(&mut self, subchannel: Subchannel, state: SubchannelState) {
        if self.controller.shutdown {
            return;
        }
        self.lb
            .subchannel_update(&subchannel, &state, &mut self.controller);
    }

    fn lb_work(&mut self) {
        if self.controller.shutdown {
            return;
        }
        self.lb.work(&mut self.controller);
    }

    fn exit_idle(&mut self) {
        if self.controller.shutdown {
            return;
        }
        self.lb.exit_idle(&mut self.controller);
    }

    fn shutdown(&mut self) {
        if self.controller.shutdown {
            return;
        }
        debug!("channel shutting down");
        self.controller.shutdown = true;
        self.controller.resolver = None;
        self.controller.resolver_retry = None;
        // Replacing the policy tree drops every subchannel it owns.  The
        // replacement gets a no-op work scheduler: the old one holds a
        // sender for this very context, and keeping it would pin the drain
        // task (and this state) alive forever.
        self.lb = GracefulSwitchPolicy::new(
            Arc::new(NopWorkScheduler {}),
            self.controller.runtime.clone(),
        );
        self.controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Shutdown,
            picker: Arc::new(Failing {
                error: "channel is shut down".to_string(),
            }),
        });
        self.controller.ctx = None;
    }
}

struct NopWorkScheduler {}

impl WorkScheduler for NopWorkScheduler {
    fn schedule_work(&self) {}
}

struct ChannelWorkScheduler {
    ctx: SynchronizationContext<ChannelState>,
    /// Collapses repeated schedule_work calls into one pending work pass.
    pending: Arc<AtomicBool>,
}

impl WorkScheduler for ChannelWorkScheduler {
    fn schedule_work(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = self.pending.clone();
        self.ctx.execute(move |state| {
            pending.store(false, Ordering::Release);
            state.lb_work();
        });
    }
}

struct ChannelResolverListener {
    ctx: SynchronizationContext<ChannelState>,
}

impl ResolverListener for ChannelResolverListener {
    fn on_update(&self, update: ResolverUpdate) -> Result<(), String> {
        // Updates are serialized by the context, which also gives the
        // required in-order delivery.
        self.ctx
            .execute(move |state| state.handle_resolver_update(update));
        Ok(())
    }
}

/// The ChannelController handed to the LB policy tree, plus the resolver
/// bookkeeping that lives on the synchronized side of the channel.
struct InternalChannelController {
    picker: Arc<ArcSwap<LbState>>,
    picker_changed: Arc<Notify>,
    pool: Arc<SubchannelPool>,
    transport_override: Option<Arc<dyn Transport>>,
    runtime: Arc<dyn Runtime>,
    ctx: Option<SynchronizationContext<ChannelState>>,
    resolver: Option<Box<dyn Resolver>>,
    resolver_backoff: ExponentialBackoff,
    resolver_retry: Option<ScheduledHandle>,
    current_selection: Option<LbPolicySelection>,
    shutdown: bool,
}

impl InternalChannelController {
    fn transport_for(&self, address: &Address) -> Arc<dyn Transport> {
        if let Some(transport) = &self.transport_override {
            return transport.clone();
        }
        match GLOBAL_TRANSPORT_REGISTRY.get_transport(address.network_type) {
            Ok(transport) => transport,
            Err(error) => Arc::new(UnsupportedTransport { error }),
        }
    }

    /// Schedules a backoff-delayed re-resolution, unless one is already
    /// pending.
    fn schedule_resolver_retry(&mut self) {
        if self.resolver_retry.is_some() || self.shutdown {
            return;
        }
        let Some(ctx) = &self.ctx else {
            return;
        };
        let delay = self.resolver_backoff.backoff_duration();
        debug!("scheduling re-resolution in {delay:?}");
        self.resolver_retry = Some(ctx.schedule(delay, |state| {
            state.controller.resolver_retry = None;
            if let Some(resolver) = state.controller.resolver.as_mut() {
                resolver.resolve_now();
            }
        }));
    }
}

impl ChannelController for InternalChannelController {
    fn new_subchannel(&mut self, addresses: &[Address]) -> Subchannel {
        let Some(ctx) = self.ctx.clone() else {
            // Shutting down: hand out an inert subchannel.
            return Subchannel::detached(addresses.to_vec());
        };
        if addresses.is_empty() {
            debug!("refusing to create a subchannel with no addresses");
            return Subchannel::detached(vec![]);
        }
        let key = SubchannelKey::new(addresses.to_vec());
        let internal = match self.pool.lookup(&key) {
            Some(existing) => existing,
            None => {
                let transport = self.transport_for(&addresses[0]);
                let pool = self.pool.clone();
                let internal = InternalSubchannel::new(
                    key.clone(),
                    transport,
                    self.runtime.clone(),
                    DEFAULT_EXPONENTIAL_CONFIG,
                    MIN_CONNECT_TIMEOUT,
                    Box::new(move |key| pool.unregister(key)),
                );
                self.pool.register(&key, &internal);
                internal
            }
        };
        let subchannel = Subchannel::new(addresses.to_vec(), internal.clone());
        let watcher = Arc::new(SubchannelStateWatcher::new(
            &subchannel,
            move |subchannel, state| {
                ctx.execute(move |channel_state| {
                    channel_state.handle_subchannel_update(subchannel, state)
                });
            },
        ));
        subchannel.set_watcher(watcher.clone());
        internal.register_watcher(watcher);
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker.store(Arc::new(update));
        self.picker_changed.notify_waiters();
    }

    fn request_resolution(&mut self) {
        if let Some(resolver) = self.resolver.as_mut() {
            resolver.resolve_now();
        }
    }
}

fn default_policy_selection() -> LbPolicySelection {
    pick_first::reg();
    LbPolicySelection {
        builder: GLOBAL_LB_REGISTRY
            .get_policy(pick_first::POLICY_NAME)
            .expect("pick_first is always registered"),
        config: None,
    }
}

/// Stands in for a transport when an address's network type has none
/// registered; every connection attempt fails with the lookup error.
struct UnsupportedTransport {
    error: String,
}

#[tonic::async_trait]
impl Transport for UnsupportedTransport {
    async fn connect(
        &self,
        _address: String,
        _runtime: Arc<dyn Runtime>,
    ) -> Result<crate::client::transport::ConnectedTransport, String> {
        Err(self.error.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::CallOptions;
    use crate::client::name_resolution::{
        Endpoint, ResolverBuilder, TCP_IP_NETWORK_TYPE,
    };
    use crate::client::service_config::ServiceConfig;
    use crate::client::transport::ConnectedTransport;
    use crate::service::Service;
    use std::collections::HashMap;
    use std::sync::LazyLock;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_stream::StreamExt;
    use tonic::async_trait;

    // ---- A resolver whose updates the test scripts by hand. ----

    struct FakeResolverEntry {
        listener: Option<Arc<dyn ResolverListener>>,
        resolve_now_count: usize,
    }

    static FAKE_RESOLVERS: LazyLock<Mutex<HashMap<String, FakeResolverEntry>>> =
        LazyLock::new(|| Mutex::new(HashMap::new()));

    struct FakeResolverBuilder;

    impl ResolverBuilder for FakeResolverBuilder {
        fn build(
            &self,
            target: &Target,
            listener: Arc<dyn ResolverListener>,
            _options: ResolverOptions,
        ) -> Box<dyn Resolver> {
            let path = target.path().to_string();
            FAKE_RESOLVERS.lock().unwrap().insert(
                path.clone(),
                FakeResolverEntry {
                    listener: Some(listener),
                    resolve_now_count: 0,
                },
            );
            Box::new(FakeResolver { path })
        }

        fn scheme(&self) -> &'static str {
            "fake"
        }

        fn is_valid_uri(&self, _target: &Target) -> bool {
            true
        }
    }

    struct FakeResolver {
        path: String,
    }

    impl Resolver for FakeResolver {
        fn resolve_now(&mut self) {
            if let Some(entry) = FAKE_RESOLVERS.lock().unwrap().get_mut(&self.path) {
                entry.resolve_now_count += 1;
            }
        }
    }

    impl Drop for FakeResolver {
        fn drop(&mut self) {
            FAKE_RESOLVERS.lock().unwrap().remove(&self.path);
        }
    }

    fn reg_fake_resolver() {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| global_registry().add_builder(FakeResolverBuilder));
    }

    fn deliver(path: &str, update: ResolverUpdate) {
        let listener = FAKE_RESOLVERS
            .lock()
            .unwrap()
            .get_mut(path)
            .expect("resolver not built yet")
            .listener
            .clone();
        listener.unwrap().on_update(update).unwrap();
    }

    fn resolve_now_count(path: &str) -> usize {
        FAKE_RESOLVERS
            .lock()
            .unwrap()
            .get(path)
            .map(|entry| entry.resolve_now_count)
            .unwrap_or(0)
    }

    // ---- A transport whose backends echo their own address. ----

    struct EchoTransport {
        /// Addresses that refuse connections.
        refused: Vec<String>,
    }

    struct EchoService {
        address: String,
    }

    #[async_trait]
    impl Service for EchoService {
        async fn call(&self, _request: Request) -> Result<Response, Status> {
            let mut headers = MetadataMap::new();
            headers.insert("backend", self.address.parse().unwrap());
            Ok(Response {
                headers,
                messages: Box::pin(tokio_stream::once(Ok(bytes::Bytes::from_static(b"ok")))),
            })
        }
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn connect(
            &self,
            address: String,
            _runtime: Arc<dyn Runtime>,
        ) -> Result<ConnectedTransport, String> {
            if self.refused.contains(&address) {
                return Err(format!("{address} refused the connection"));
            }
            let (_tx, rx) = oneshot::channel();
            // The sender leaks into the service so the connection stays up
            // for the duration of the test.
            let service = Arc::new(EchoServiceWithHandle {
                inner: EchoService {
                    address: address.clone(),
                },
                _keepalive: _tx,
            });
            Ok(ConnectedTransport {
                service,
                disconnection_listener: rx,
            })
        }
    }

    struct EchoServiceWithHandle {
        inner: EchoService,
        _keepalive: oneshot::Sender<Result<(), String>>,
    }

    #[async_trait]
    impl Service for EchoServiceWithHandle {
        async fn call(&self, request: Request) -> Result<Response, Status> {
            self.inner.call(request).await
        }
    }

    fn options_with_transport(refused: &[&str]) -> ChannelOptions {
        let mut options = ChannelOptions::default();
        options.transport = Some(Arc::new(EchoTransport {
            refused: refused.iter().map(|s| s.to_string()).collect(),
        }));
        options
    }

    fn endpoints(addresses: &[&str]) -> Vec<Endpoint> {
        addresses
            .iter()
            .map(|a| {
                Endpoint::new(vec![Address {
                    network_type: TCP_IP_NETWORK_TYPE,
                    address: a.to_string(),
                    ..Default::default()
                }])
            })
            .collect()
    }

    fn backend_of(response: &Response) -> String {
        response
            .headers
            .get("backend")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    async fn call_with_deadline(
        channel: &Channel,
        deadline: Option<Duration>,
    ) -> Result<Response, Status> {
        let mut request = Request::new("/echo.Echo/Call");
        request.options = CallOptions {
            deadline: deadline.map(|d| Instant::now() + d),
            ..Default::default()
        };
        channel.call(request).await
    }

    #[tokio::test]
    async fn call_flows_end_to_end_with_default_policy() {
        reg_fake_resolver();
        let channel = Channel::new("fake:///e2e", options_with_transport(&[]));
        // Activate so the resolver is built, then feed it addresses.
        assert_eq!(channel.state(true), ConnectivityState::Connecting);
        deliver(
            "/e2e",
            ResolverUpdate {
                endpoints: Ok(endpoints(&["a:443"])),
                ..Default::default()
            },
        );

        let response = call_with_deadline(&channel, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(backend_of(&response), "a:443");
        let body: Vec<_> = response.messages.collect().await;
        assert_eq!(body.len(), 1);
        assert_eq!(channel.state(false), ConnectivityState::Ready);
        channel.shutdown();
    }

    #[tokio::test]
    async fn buffered_call_completes_after_late_resolution() {
        reg_fake_resolver();
        let channel = Channel::new("fake:///late", options_with_transport(&[]));
        assert_eq!(channel.state(true), ConnectivityState::Connecting);

        let pending = {
            let channel = channel.clone();
            tokio::spawn(
                async move { call_with_deadline(&channel, Some(Duration::from_secs(5))).await },
            )
        };
        // Give the call time to park on the queueing picker.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        deliver(
            "/late",
            ResolverUpdate {
                endpoints: Ok(endpoints(&["a:443"])),
                ..Default::default()
            },
        );
        let response = pending.await.unwrap().unwrap();
        assert_eq!(backend_of(&response), "a:443");
        channel.shutdown();
    }

    #[tokio::test]
    async fn queued_call_fails_at_its_deadline() {
        reg_fake_resolver();
        let channel = Channel::new("fake:///deadline", options_with_transport(&[]));
        assert_eq!(channel.state(true), ConnectivityState::Connecting);

        // No resolution ever arrives; the call must die on its own clock.
        let status = call_with_deadline(&channel, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
        channel.shutdown();
    }

    #[tokio::test]
    async fn round_robin_config_spreads_calls_across_backends() {
        reg_fake_resolver();
        let channel = Channel::new("fake:///rr", options_with_transport(&[]));
        assert_eq!(channel.state(true), ConnectivityState::Connecting);

        let service_config =
            ServiceConfig::parse(r#"{"loadBalancingConfig": [{"round_robin": {}}]}"#).unwrap();
        deliver(
            "/rr",
            ResolverUpdate {
                endpoints: Ok(endpoints(&["a:443", "b:443"])),
                service_config: Ok(Some(service_config)),
                ..Default::default()
            },
        );

        let mut backends = std::collections::HashSet::new();
        for _ in 0..10 {
            let response = call_with_deadline(&channel, Some(Duration::from_secs(5)))
                .await
                .unwrap();
            backends.insert(backend_of(&response));
        }
        assert_eq!(backends.len(), 2, "calls must reach both backends");
        channel.shutdown();
    }

    #[tokio::test]
    async fn resolver_error_fails_calls_and_triggers_reresolution() {
        reg_fake_resolver();
        let channel = Channel::new("fake:///err", options_with_transport(&[]));
        assert_eq!(channel.state(true), ConnectivityState::Connecting);

        deliver(
            "/err",
            ResolverUpdate {
                endpoints: Err("dns exploded".to_string()),
                ..Default::default()
            },
        );

        let status = call_with_deadline(&channel, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("dns exploded"));
        channel.shutdown();
    }

    #[tokio::test]
    async fn empty_address_list_requests_reresolution() {
        reg_fake_resolver();
        let channel = Channel::new("fake:///empty", options_with_transport(&[]));
        assert_eq!(channel.state(true), ConnectivityState::Connecting);

        deliver(
            "/empty",
            ResolverUpdate {
                endpoints: Ok(vec![]),
                ..Default::default()
            },
        );
        // The policy rejects the empty list and asks for a fresh
        // resolution immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(resolve_now_count("/empty") >= 1);
        channel.shutdown();
    }

    #[tokio::test]
    async fn failed_backend_is_avoided_under_round_robin() {
        reg_fake_resolver();
        let channel = Channel::new("fake:///partial", options_with_transport(&["b:443"]));
        assert_eq!(channel.state(true), ConnectivityState::Connecting);

        let service_config =
            ServiceConfig::parse(r#"{"loadBalancingConfig": [{"round_robin": {}}]}"#).unwrap();
        deliver(
            "/partial",
            ResolverUpdate {
                endpoints: Ok(endpoints(&["a:443", "b:443"])),
                service_config: Ok(Some(service_config)),
                ..Default::default()
            },
        );

        // b never connects; every call lands on a.
        for _ in 0..5 {
            let response = call_with_deadline(&channel, Some(Duration::from_secs(5)))
                .await
                .unwrap();
            assert_eq!(backend_of(&response), "a:443");
        }
        channel.shutdown();
    }

    #[tokio::test]
    async fn shutdown_fails_pending_and_future_calls() {
        reg_fake_resolver();
        let channel = Channel::new("fake:///bye", options_with_transport(&[]));
        assert_eq!(channel.state(true), ConnectivityState::Connecting);

        let pending = {
            let channel = channel.clone();
            tokio::spawn(
                async move { call_with_deadline(&channel, Some(Duration::from_secs(5))).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.shutdown();

        let status = pending.await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        let status = call_with_deadline(&channel, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn wait_for_ready_outlives_failing_pickers() {
        reg_fake_resolver();
        let channel = Channel::new("fake:///wfr", options_with_transport(&[]));
        assert_eq!(channel.state(true), ConnectivityState::Connecting);

        // Leave the channel with a failing picker.
        deliver(
            "/wfr",
            ResolverUpdate {
                endpoints: Err("nothing yet".to_string()),
                ..Default::default()
            },
        );

        // A wait-for-ready call rides out the failure instead of
        // terminating on it, and only its deadline can end it.
        let mut request = Request::new("/echo.Echo/Call");
        request.options = CallOptions {
            deadline: Some(Instant::now() + Duration::from_millis(200)),
            wait_for_ready: true,
            ..Default::default()
        };
        let status = channel.call(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        // Whereas a recovered channel completes such a call.
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut request = Request::new("/echo.Echo/Call");
                request.options = CallOptions {
                    deadline: Some(Instant::now() + Duration::from_secs(5)),
                    wait_for_ready: true,
                    ..Default::default()
                };
                channel.call(request).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        deliver(
            "/wfr",
            ResolverUpdate {
                endpoints: Ok(endpoints(&["a:443"])),
                ..Default::default()
            },
        );
        let response = pending.await.unwrap().unwrap();
        assert_eq!(backend_of(&response), "a:443");
        channel.shutdown();
    }

    #[tokio::test]
    async fn unknown_scheme_fails_calls() {
        let channel = Channel::new("bogus:///nope", ChannelOptions::default());
        let status = call_with_deadline(&channel, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("no name resolver"));
    }
}
