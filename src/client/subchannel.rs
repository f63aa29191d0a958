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

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::client::ConnectivityState;
use crate::client::backoff::{BackoffConfig, ExponentialBackoff};
use crate::client::load_balancing::SubchannelState;
use crate::client::name_resolution::Address;
use crate::client::transport::Transport;
use crate::rt::{Runtime, TaskHandle};
use crate::service::Service;

static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A Subchannel represents a method of communicating with a server which
/// may be connected or disconnected many times across its lifetime.
///
/// - Subchannels start Idle.
///
/// - Idle transitions to Connecting when connect() is called.
///
/// - Connecting transitions to Ready on success or TransientFailure once
///   every address in the subchannel's list has failed.
///
/// - Ready transitions to Idle when the connection is lost.
///
/// - TransientFailure transitions to Idle once the reconnect backoff timer
///   expires.  The backoff scales exponentially and is reset when the
///   subchannel becomes Ready.
///
/// Subchannels are owned by the LB policy that created them.  Calling
/// `shutdown`, or dropping every clone of the handle, disconnects the
/// subchannel; the owner receives one final Shutdown notification and
/// nothing further.
pub struct Subchannel {
    pub(crate) inner: Arc<ExternalSubchannel>,
}

impl Clone for Subchannel {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Hash for Subchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl PartialEq for Subchannel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Subchannel {}

impl Debug for Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl Display for Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addresses = self.inner.addresses.lock().unwrap();
        write!(f, "subchannel {} {:?}", self.inner.id, *addresses)
    }
}

impl Subchannel {
    pub(crate) fn new(addresses: Vec<Address>, internal: Arc<InternalSubchannel>) -> Self {
        Self {
            inner: Arc::new(ExternalSubchannel {
                id: NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                addresses: Mutex::new(addresses),
                internal: Mutex::new(Some(internal)),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Creates a handle with no underlying connection machinery.  Connect
    /// requests are ignored and calls fail.  Used where a handle must be
    /// produced but no connection may ever exist (a shut-down channel),
    /// and by LB policy tests, where state transitions are driven by hand.
    pub(crate) fn detached(addresses: Vec<Address>) -> Self {
        Self {
            inner: Arc::new(ExternalSubchannel {
                id: NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                addresses: Mutex::new(addresses),
                internal: Mutex::new(None),
                watcher: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Begins connecting asynchronously.  A no-op unless the subchannel is
    /// currently Idle.
    pub fn connect(&self) {
        if let Some(internal) = self.inner.internal.lock().unwrap().as_ref() {
            internal.connect();
        }
    }

    /// The current target address list.
    pub fn addresses(&self) -> Vec<Address> {
        self.inner.addresses.lock().unwrap().clone()
    }

    /// Replaces the target address list without changing the subchannel's
    /// identity.  Permitted in any state.  If the subchannel is connected
    /// to an address no longer present, it disconnects and reconnects.
    pub fn update_addresses(&self, addresses: Vec<Address>) {
        *self.inner.addresses.lock().unwrap() = addresses.clone();
        if let Some(internal) = self.inner.internal.lock().unwrap().as_ref() {
            internal.update_addresses(addresses);
        }
    }

    /// Disconnects and permanently decommissions this handle.  Idempotent;
    /// the owner's watcher receives one final Shutdown notification.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// The service of the currently connected transport, if any.  None
    /// means the connection was lost since the picker snapshot was taken
    /// and the call should be re-picked.
    pub(crate) fn connected_service(&self) -> Option<Arc<dyn Service>> {
        self.inner
            .internal
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|internal| internal.connected_service())
    }

    pub(crate) fn set_watcher(&self, watcher: Arc<SubchannelStateWatcher>) {
        *self.inner.watcher.lock().unwrap() = Some(watcher);
    }
}

pub(crate) struct ExternalSubchannel {
    id: u64,
    addresses: Mutex<Vec<Address>>,
    internal: Mutex<Option<Arc<InternalSubchannel>>>,
    watcher: Mutex<Option<Arc<SubchannelStateWatcher>>>,
}

impl ExternalSubchannel {
    fn shutdown(&self) {
        let watcher = self.watcher.lock().unwrap().take();
        let internal = self.internal.lock().unwrap().take();
        if let (Some(watcher), Some(internal)) = (&watcher, &internal) {
            internal.unregister_watcher(watcher);
        }
        if let Some(watcher) = watcher {
            watcher.on_state_change(SubchannelState {
                connectivity_state: ConnectivityState::Shutdown,
                last_connection_error: None,
            });
        }
    }
}

impl Drop for ExternalSubchannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Relays state changes of an internal subchannel to the LB policy that
/// owns the corresponding external handle.  Holds the handle weakly so that
/// notifications for an already-released handle are dropped on the floor.
pub(crate) struct SubchannelStateWatcher {
    subchannel: Weak<ExternalSubchannel>,
    on_change: Box<dyn Fn(Subchannel, SubchannelState) + Send + Sync>,
}

impl SubchannelStateWatcher {
    pub(crate) fn new(
        subchannel: &Subchannel,
        on_change: impl Fn(Subchannel, SubchannelState) + Send + Sync + 'static,
    ) -> Self {
        Self {
            subchannel: Arc::downgrade(&subchannel.inner),
            on_change: Box::new(on_change),
        }
    }

    pub(crate) fn on_state_change(&self, state: SubchannelState) {
        if let Some(inner) = self.subchannel.upgrade() {
            (self.on_change)(Subchannel { inner }, state);
        }
    }
}

enum MachineState {
    Idle,
    Connecting {
        attempt_task: Option<Box<dyn TaskHandle>>,
    },
    Ready {
        monitor_task: Option<Box<dyn TaskHandle>>,
        service: Arc<dyn Service>,
        address: Address,
    },
    TransientFailure {
        backoff_task: Option<Box<dyn TaskHandle>>,
        error: String,
    },
}

impl MachineState {
    fn to_subchannel_state(&self) -> SubchannelState {
        match self {
            Self::Idle => SubchannelState::new(ConnectivityState::Idle),
            Self::Connecting { .. } => SubchannelState::new(ConnectivityState::Connecting),
            Self::Ready { .. } => SubchannelState::new(ConnectivityState::Ready),
            Self::TransientFailure { error, .. } => {
                let arc_err: Arc<dyn Error + Send + Sync> = Arc::from(Box::from(error.clone()));
                SubchannelState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    last_connection_error: Some(arc_err),
                }
            }
        }
    }
}

impl Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting { .. } => write!(f, "Connecting"),
            Self::Ready { .. } => write!(f, "Ready"),
            Self::TransientFailure { .. } => write!(f, "TransientFailure"),
        }
    }
}

impl Drop for MachineState {
    fn drop(&mut self) {
        let task = match self {
            Self::Idle => None,
            Self::Connecting { attempt_task } => attempt_task.take(),
            Self::Ready { monitor_task, .. } => monitor_task.take(),
            Self::TransientFailure { backoff_task, .. } => backoff_task.take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

enum SubchannelEvent {
    ConnectRequested,
    ConnectSucceeded(Arc<dyn Service>, oneshot::Receiver<Result<(), String>>),
    ConnectFailed(String),
    ConnectTimedOut,
    ConnectionClosed,
    BackoffExpired,
    AddressesUpdated(Vec<Address>),
}

impl Debug for SubchannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectRequested => write!(f, "ConnectRequested"),
            Self::ConnectSucceeded(_, _) => write!(f, "ConnectSucceeded"),
            Self::ConnectFailed(err) => write!(f, "ConnectFailed({err})"),
            Self::ConnectTimedOut => write!(f, "ConnectTimedOut"),
            Self::ConnectionClosed => write!(f, "ConnectionClosed"),
            Self::BackoffExpired => write!(f, "BackoffExpired"),
            Self::AddressesUpdated(addrs) => write!(f, "AddressesUpdated({addrs:?})"),
        }
    }
}

/// The connection state machine for one logical endpoint.  All events —
/// connect requests, transport outcomes, timer expirations — funnel
/// through one mpsc queue processed by a single task, so no two
/// transitions are ever handled concurrently.
pub(crate) struct InternalSubchannel {
    key: SubchannelKey,
    transport: Arc<dyn Transport>,
    runtime: Arc<dyn Runtime>,
    connect_timeout: Duration,
    event_tx: mpsc::UnboundedSender<SubchannelEvent>,
    unregister_fn: Mutex<Option<Box<dyn FnOnce(&SubchannelKey) + Send>>>,
    inner: Mutex<InnerSubchannel>,
}

struct InnerSubchannel {
    state: MachineState,
    addresses: Vec<Address>,
    /// Index of the address currently being attempted while Connecting.
    attempt: usize,
    backoff: ExponentialBackoff,
    watchers: Vec<Arc<SubchannelStateWatcher>>,
}

impl InternalSubchannel {
    pub(crate) fn new(
        key: SubchannelKey,
        transport: Arc<dyn Transport>,
        runtime: Arc<dyn Runtime>,
        backoff_config: BackoffConfig,
        connect_timeout: Duration,
        unregister_fn: Box<dyn FnOnce(&SubchannelKey) + Send>,
    ) -> Arc<Self> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let backoff =
            ExponentialBackoff::new(backoff_config).expect("backoff configuration is validated");
        let addresses = key.addresses.clone();
        let isc = Arc::new(Self {
            key,
            transport,
            runtime: runtime.clone(),
            connect_timeout,
            event_tx,
            unregister_fn: Mutex::new(Some(unregister_fn)),
            inner: Mutex::new(InnerSubchannel {
                state: MachineState::Idle,
                addresses,
                attempt: 0,
                backoff,
                watchers: vec![],
            }),
        });

        // The state machine task.  It holds only a weak reference: once
        // every strong reference is released the subchannel is defunct and
        // the task exits, aborting any in-flight attempt via the state's
        // Drop.
        let weak = Arc::downgrade(&isc);
        runtime.spawn(Box::pin(async move {
            while let Some(event) = event_rx.recv().await {
                let Some(sc) = weak.upgrade() else { break };
                trace!("subchannel {:?} handling event {:?}", sc.key, event);
                sc.handle_event(event);
            }
        }));
        isc
    }

    fn handle_event(&self, event: SubchannelEvent) {
        match event {
            SubchannelEvent::ConnectRequested => {
                if matches!(self.inner.lock().unwrap().state, MachineState::Idle) {
                    self.move_to_connecting();
                }
            }
            SubchannelEvent::ConnectSucceeded(service, closed_rx) => {
                if matches!(
                    self.inner.lock().unwrap().state,
                    MachineState::Connecting { .. }
                ) {
                    self.move_to_ready(service, closed_rx);
                }
            }
            SubchannelEvent::ConnectFailed(error) => self.handle_connect_failure(error),
            SubchannelEvent::ConnectTimedOut => {
                self.handle_connect_failure("connection attempt timed out".to_string())
            }
            SubchannelEvent::ConnectionClosed => {
                if matches!(self.inner.lock().unwrap().state, MachineState::Ready { .. }) {
                    self.move_to_idle();
                }
            }
            SubchannelEvent::BackoffExpired => {
                if matches!(
                    self.inner.lock().unwrap().state,
                    MachineState::TransientFailure { .. }
                ) {
                    self.move_to_idle();
                }
            }
            SubchannelEvent::AddressesUpdated(addresses) => {
                self.handle_addresses_updated(addresses)
            }
        }
    }

    /// Begins connecting asynchronously.  Only effective from Idle.
    pub(crate) fn connect(&self) {
        if matches!(self.inner.lock().unwrap().state, MachineState::Idle) {
            let _ = self.event_tx.send(SubchannelEvent::ConnectRequested);
        }
    }

    pub(crate) fn update_addresses(&self, addresses: Vec<Address>) {
        let _ = self
            .event_tx
            .send(SubchannelEvent::AddressesUpdated(addresses));
    }

    pub(crate) fn connected_service(&self) -> Option<Arc<dyn Service>> {
        match &self.inner.lock().unwrap().state {
            MachineState::Ready { service, .. } => Some(service.clone()),
            _ => None,
        }
    }

    pub(crate) fn register_watcher(&self, watcher: Arc<SubchannelStateWatcher>) {
        let state = {
            let mut inner = self.inner.lock().unwrap();
            inner.watchers.push(watcher.clone());
            inner.state.to_subchannel_state()
        };
        watcher.on_state_change(state);
    }

    pub(crate) fn unregister_watcher(&self, watcher: &Arc<SubchannelStateWatcher>) {
        self.inner
            .lock()
            .unwrap()
            .watchers
            .retain(|w| !Arc::ptr_eq(w, watcher));
    }

    fn notify_watchers(&self, state: SubchannelState) {
        let watchers = self.inner.lock().unwrap().watchers.clone();
        for watcher in watchers {
            watcher.on_state_change(state.clone());
        }
    }

    fn move_to_idle(&self) {
        self.inner.lock().unwrap().state = MachineState::Idle;
        self.notify_watchers(SubchannelState::new(ConnectivityState::Idle));
    }

    fn move_to_connecting(&self) {
        let address = {
            let mut inner = self.inner.lock().unwrap();
            inner.attempt = 0;
            let Some(address) = inner.addresses.first().cloned() else {
                drop(inner);
                self.move_to_transient_failure("subchannel has no addresses".to_string());
                return;
            };
            inner.state = MachineState::Connecting { attempt_task: None };
            address
        };
        self.notify_watchers(SubchannelState::new(ConnectivityState::Connecting));
        self.spawn_attempt(address);
    }

    fn spawn_attempt(&self, address: Address) {
        debug!("subchannel {:?} connecting to {}", self.key, address);
        let transport = self.transport.clone();
        let runtime = self.runtime.clone();
        let event_tx = self.event_tx.clone();
        let timeout = self.runtime.sleep(self.connect_timeout);
        let task = self.runtime.spawn(Box::pin(async move {
            tokio::select! {
                _ = timeout => {
                    let _ = event_tx.send(SubchannelEvent::ConnectTimedOut);
                }
                result = transport.connect(address.address.clone(), runtime) => {
                    match result {
                        Ok(connected) => {
                            let _ = event_tx.send(SubchannelEvent::ConnectSucceeded(
                                connected.service,
                                connected.disconnection_listener,
                            ));
                        }
                        Err(error) => {
                            let _ = event_tx.send(SubchannelEvent::ConnectFailed(error));
                        }
                    }
                }
            }
        }));
        let mut inner = self.inner.lock().unwrap();
        if let MachineState::Connecting { attempt_task } = &mut inner.state {
            *attempt_task = Some(task);
        } else {
            task.abort();
        }
    }

    fn handle_connect_failure(&self, error: String) {
        let next_address = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.state, MachineState::Connecting { .. }) {
                return;
            }
            inner.attempt += 1;
            inner.addresses.get(inner.attempt).cloned()
        };
        match next_address {
            // Walk to the next address in the list without leaving
            // Connecting.
            Some(address) => self.spawn_attempt(address),
            None => self.move_to_transient_failure(error),
        }
    }

    fn move_to_transient_failure(&self, error: String) {
        debug!("subchannel {:?} failed: {}", self.key, error);
        let backoff_duration = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = MachineState::TransientFailure {
                backoff_task: None,
                error: error.clone(),
            };
            inner.backoff.backoff_duration()
        };
        let arc_err: Arc<dyn Error + Send + Sync> = Arc::from(Box::from(error.clone()));
        self.notify_watchers(SubchannelState {
            connectivity_state: ConnectivityState::TransientFailure,
            last_connection_error: Some(arc_err),
        });

        let event_tx = self.event_tx.clone();
        let sleep = self.runtime.sleep(backoff_duration);
        let task = self.runtime.spawn(Box::pin(async move {
            sleep.await;
            let _ = event_tx.send(SubchannelEvent::BackoffExpired);
        }));
        let mut inner = self.inner.lock().unwrap();
        if let MachineState::TransientFailure { backoff_task, .. } = &mut inner.state {
            *backoff_task = Some(task);
        } else {
            task.abort();
        }
    }

    fn move_to_ready(
        &self,
        service: Arc<dyn Service>,
        closed_rx: oneshot::Receiver<Result<(), String>>,
    ) {
        let address = {
            let mut inner = self.inner.lock().unwrap();
            let address = inner
                .addresses
                .get(inner.attempt)
                .cloned()
                .unwrap_or_default();
            inner.backoff.reset();
            inner.state = MachineState::Ready {
                monitor_task: None,
                service: service.clone(),
                address: address.clone(),
            };
            address
        };
        debug!("subchannel {:?} ready on {}", self.key, address);
        self.notify_watchers(SubchannelState::new(ConnectivityState::Ready));

        let event_tx = self.event_tx.clone();
        let task = self.runtime.spawn(Box::pin(async move {
            if let Ok(Err(error)) = closed_rx.await {
                debug!("transport closed with error: {error}");
            }
            let _ = event_tx.send(SubchannelEvent::ConnectionClosed);
        }));
        let mut inner = self.inner.lock().unwrap();
        if let MachineState::Ready { monitor_task, .. } = &mut inner.state {
            *monitor_task = Some(task);
        } else {
            task.abort();
        }
    }

    fn handle_addresses_updated(&self, addresses: Vec<Address>) {
        let reconnect = {
            let mut inner = self.inner.lock().unwrap();
            inner.addresses = addresses;
            match &inner.state {
                MachineState::Ready { address, .. } => !inner.addresses.contains(address),
                _ => false,
            }
        };
        if reconnect {
            // Connected to a delisted address: drop the connection and dial
            // the new list.
            self.move_to_idle();
            let _ = self.event_tx.send(SubchannelEvent::ConnectRequested);
        }
    }
}

impl Drop for InternalSubchannel {
    fn drop(&mut self) {
        trace!("dropping internal subchannel {:?}", self.key);
        // Aborts any in-flight attempt or timer via MachineState's Drop.
        self.inner.lock().unwrap().state = MachineState::Idle;
        if let Some(unregister_fn) = self.unregister_fn.lock().unwrap().take() {
            unregister_fn(&self.key);
        }
    }
}

/// Uniquely identifies a subchannel in the pool by its ordered address
/// list.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SubchannelKey {
    addresses: Vec<Address>,
}

impl SubchannelKey {
    pub(crate) fn new(addresses: Vec<Address>) -> Self {
        Self { addresses }
    }
}

impl Debug for SubchannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addresses: Vec<String> = self.addresses.iter().map(|a| a.to_string()).collect();
        write!(f, "[{}]", addresses.join(", "))
    }
}

/// A channel-wide pool sharing connection machinery between subchannel
/// handles created for the same address list, e.g. by the outgoing and
/// incoming policies during a graceful switch.
pub(crate) struct SubchannelPool {
    subchannels: Mutex<BTreeMap<SubchannelKey, Weak<InternalSubchannel>>>,
}

impl SubchannelPool {
    pub(crate) fn new() -> Self {
        Self {
            subchannels: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn lookup(&self, key: &SubchannelKey) -> Option<Arc<InternalSubchannel>> {
        self.subchannels
            .lock()
            .unwrap()
            .get(key)
            .and_then(Weak::upgrade)
    }

    pub(crate) fn register(&self, key: &SubchannelKey, isc: &Arc<InternalSubchannel>) {
        self.subchannels
            .lock()
            .unwrap()
            .insert(key.clone(), Arc::downgrade(isc));
    }

    pub(crate) fn unregister(&self, key: &SubchannelKey) {
        let mut subchannels = self.subchannels.lock().unwrap();
        if let Some(weak) = subchannels.get(key) {
            // A new registration may have replaced the dying one.
            if weak.upgrade().is_none() {
                subchannels.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::ConnectedTransport;
    use crate::rt::TokioRuntime;
    use crate::service::{Request, Response};
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use tonic::{Status, async_trait};

    struct EchoService;

    #[async_trait]
    impl Service for EchoService {
        async fn call(&self, _request: Request) -> Result<Response, Status> {
            Err(Status::unimplemented("test service"))
        }
    }

    enum Outcome {
        Succeed,
        Fail(&'static str),
    }

    /// A transport whose per-address connect outcomes are scripted up
    /// front.  Successful connections hand back a disconnect trigger.
    struct ScriptedTransport {
        outcomes: Mutex<HashMap<String, VecDeque<Outcome>>>,
        disconnects: Mutex<Vec<(String, oneshot::Sender<Result<(), String>>)>>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                outcomes: Mutex::new(HashMap::new()),
                disconnects: Mutex::new(vec![]),
            }
        }

        fn script(&self, address: &str, outcome: Outcome) {
            self.outcomes
                .lock()
                .unwrap()
                .entry(address.to_string())
                .or_default()
                .push_back(outcome);
        }

        fn kill_connection(&self, address: &str) {
            let mut disconnects = self.disconnects.lock().unwrap();
            let i = disconnects
                .iter()
                .position(|(a, _)| a == address)
                .expect("no live connection to kill");
            let (_, tx) = disconnects.remove(i);
            let _ = tx.send(Ok(()));
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(
            &self,
            address: String,
            _runtime: Arc<dyn Runtime>,
        ) -> Result<ConnectedTransport, String> {
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .get_mut(&address)
                .and_then(VecDeque::pop_front);
            match outcome {
                Some(Outcome::Succeed) => {
                    let (tx, rx) = oneshot::channel();
                    self.disconnects.lock().unwrap().push((address, tx));
                    Ok(ConnectedTransport {
                        service: Arc::new(EchoService),
                        disconnection_listener: rx,
                    })
                }
                Some(Outcome::Fail(error)) => Err(error.to_string()),
                None => Err(format!("unscripted connect to {address}")),
            }
        }
    }

    fn addr(s: &str) -> Address {
        Address {
            network_type: crate::client::name_resolution::TCP_IP_NETWORK_TYPE,
            address: s.to_string(),
            ..Default::default()
        }
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(5),
            multiplier: 1.0,
            jitter: 0.0,
            max_delay: Duration::from_millis(5),
        }
    }

    struct Fixture {
        subchannel: Subchannel,
        states: mpsc::UnboundedReceiver<SubchannelState>,
        _internal: Arc<InternalSubchannel>,
    }

    fn start(transport: Arc<ScriptedTransport>, addresses: Vec<Address>) -> Fixture {
        let internal = InternalSubchannel::new(
            SubchannelKey::new(addresses.clone()),
            transport,
            Arc::new(TokioRuntime),
            fast_backoff(),
            Duration::from_secs(5),
            Box::new(|_| {}),
        );
        let subchannel = Subchannel::new(addresses, internal.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(SubchannelStateWatcher::new(&subchannel, move |_, state| {
            let _ = tx.send(state);
        }));
        subchannel.set_watcher(watcher.clone());
        internal.register_watcher(watcher);
        Fixture {
            subchannel,
            states: rx,
            _internal: internal,
        }
    }

    async fn next_state(fixture: &mut Fixture) -> ConnectivityState {
        tokio::time::timeout(Duration::from_secs(5), fixture.states.recv())
            .await
            .expect("timed out waiting for a state change")
            .expect("watcher channel closed")
            .connectivity_state
    }

    #[tokio::test]
    async fn connects_and_reports_ready() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a:443", Outcome::Succeed);
        let mut fixture = start(transport, vec![addr("a:443")]);

        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Idle);
        fixture.subchannel.connect();
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Connecting);
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn connect_is_noop_unless_idle() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a:443", Outcome::Succeed);
        let mut fixture = start(transport, vec![addr("a:443")]);

        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Idle);
        fixture.subchannel.connect();
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Connecting);
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Ready);
        // Redundant requests while Ready produce no transitions.
        fixture.subchannel.connect();
        fixture.subchannel.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fixture.states.try_recv().is_err());
    }

    #[tokio::test]
    async fn walks_address_list_before_failing() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a:443", Outcome::Fail("refused"));
        transport.script("b:443", Outcome::Succeed);
        let mut fixture = start(transport, vec![addr("a:443"), addr("b:443")]);

        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Idle);
        fixture.subchannel.connect();
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Connecting);
        // The walk from a to b happens without an intermediate state.
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn exhausted_list_fails_then_backs_off_to_idle() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a:443", Outcome::Fail("refused a"));
        transport.script("b:443", Outcome::Fail("refused b"));
        let mut fixture = start(transport, vec![addr("a:443"), addr("b:443")]);

        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Idle);
        fixture.subchannel.connect();
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Connecting);

        let failure = tokio::time::timeout(Duration::from_secs(5), fixture.states.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            failure.connectivity_state,
            ConnectivityState::TransientFailure
        );
        // The last error in the walk is surfaced.
        assert!(
            failure
                .last_connection_error
                .as_ref()
                .unwrap()
                .to_string()
                .contains("refused b")
        );
        // Once the backoff elapses the subchannel returns to Idle and can
        // be connected again.
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn lost_connection_returns_to_idle() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a:443", Outcome::Succeed);
        let mut fixture = start(transport.clone(), vec![addr("a:443")]);

        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Idle);
        fixture.subchannel.connect();
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Connecting);
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Ready);

        transport.kill_connection("a:443");
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn delisted_connected_address_triggers_reconnect() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("a:443", Outcome::Succeed);
        transport.script("b:443", Outcome::Succeed);
        let mut fixture = start(transport, vec![addr("a:443")]);

        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Idle);
        fixture.subchannel.connect();
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Connecting);
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Ready);

        fixture.subchannel.update_addresses(vec![addr("b:443")]);
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Idle);
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Connecting);
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn shutdown_notifies_once_and_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut fixture = start(transport, vec![addr("a:443")]);

        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Idle);
        fixture.subchannel.shutdown();
        assert_eq!(next_state(&mut fixture).await, ConnectivityState::Shutdown);
        fixture.subchannel.shutdown();
        // Connect requests after shutdown are ignored.
        fixture.subchannel.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fixture.states.try_recv().is_err());
    }
}
