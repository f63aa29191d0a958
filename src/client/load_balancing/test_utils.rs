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

//! Utilities for testing LB policies without a channel: a fake
//! ChannelController that records everything the policy does, and helpers
//! for fabricating resolver updates and exercising pickers.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, LbPolicyOptions, LbState, Pick, PickResult, Subchannel, SubchannelState,
    WorkScheduler,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate, TCP_IP_NETWORK_TYPE};
use crate::rt::TokioRuntime;
use crate::service::Request;

/// An action taken by the LB policy under test.
pub(crate) enum TestEvent {
    NewSubchannel(Subchannel),
    UpdatePicker(LbState),
    RequestResolution,
    WorkScheduled,
}

impl std::fmt::Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({sc})"),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::WorkScheduled => write!(f, "WorkScheduled"),
        }
    }
}

/// A ChannelController that emits an event for every action and hands out
/// detached subchannels whose states the test drives by hand.
pub(crate) struct TestChannelController {
    pub(crate) tx: mpsc::UnboundedSender<TestEvent>,
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, addresses: &[Address]) -> Subchannel {
        let subchannel = Subchannel::detached(addresses.to_vec());
        let _ = self.tx.send(TestEvent::NewSubchannel(subchannel.clone()));
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        let _ = self.tx.send(TestEvent::UpdatePicker(update));
    }

    fn request_resolution(&mut self) {
        let _ = self.tx.send(TestEvent::RequestResolution);
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.tx.send(TestEvent::WorkScheduled);
    }
}

/// Creates the standard test environment: an event receiver, a controller
/// for the policy's callbacks, and builder options wired to the same event
/// stream.
pub(crate) fn setup() -> (
    mpsc::UnboundedReceiver<TestEvent>,
    TestChannelController,
    LbPolicyOptions,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let controller = TestChannelController { tx: tx.clone() };
    let options = LbPolicyOptions {
        work_scheduler: Arc::new(TestWorkScheduler { tx }),
        runtime: Arc::new(TokioRuntime),
    };
    (rx, controller, options)
}

pub(crate) fn addr(address: &str) -> Address {
    Address {
        network_type: TCP_IP_NETWORK_TYPE,
        address: address.to_string(),
        ..Default::default()
    }
}

pub(crate) fn endpoint(addresses: &[&str]) -> Endpoint {
    Endpoint::new(addresses.iter().map(|a| addr(a)).collect())
}

pub(crate) fn update_with_endpoints(endpoints: Vec<Endpoint>) -> ResolverUpdate {
    ResolverUpdate {
        endpoints: Ok(endpoints),
        ..Default::default()
    }
}

pub(crate) fn update_with_error(error: &str) -> ResolverUpdate {
    ResolverUpdate {
        endpoints: Err(error.to_string()),
        ..Default::default()
    }
}

/// Returns the next recorded event, panicking if the policy took no
/// further action.
pub(crate) fn next_event(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> TestEvent {
    rx.try_recv().expect("expected another LB policy action")
}

/// Returns the next event, requiring it to be a subchannel creation.
pub(crate) fn next_subchannel(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> Subchannel {
    match next_event(rx) {
        TestEvent::NewSubchannel(subchannel) => subchannel,
        other => panic!("expected NewSubchannel, got {other:?}"),
    }
}

/// Returns the next event, requiring it to be a picker update.
pub(crate) fn next_picker(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> LbState {
    match next_event(rx) {
        TestEvent::UpdatePicker(state) => state,
        other => panic!("expected UpdatePicker, got {other:?}"),
    }
}

/// Drains events until a picker update is found, returning the last picker
/// seen if several were published back to back.
pub(crate) fn last_picker(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> LbState {
    let mut found = None;
    while let Ok(event) = rx.try_recv() {
        if let TestEvent::UpdatePicker(state) = event {
            found = Some(state);
        }
    }
    found.expect("expected at least one picker update")
}

pub(crate) fn assert_no_events(rx: &mut mpsc::UnboundedReceiver<TestEvent>) {
    if let Ok(event) = rx.try_recv() {
        panic!("expected no further LB policy actions, got {event:?}");
    }
}

/// Picks with a default request and requires a subchannel result.
pub(crate) fn pick_subchannel(state: &LbState) -> Subchannel {
    assert_eq!(state.connectivity_state, ConnectivityState::Ready);
    match state.picker.pick(&Request::new("/test.Service/Method")) {
        PickResult::Pick(Pick { subchannel, .. }) => subchannel,
        PickResult::Queue => panic!("expected a pick, got Queue"),
        PickResult::Fail(status) => panic!("expected a pick, got Fail({status})"),
        PickResult::Drop(status) => panic!("expected a pick, got Drop({status})"),
    }
}

/// Requires a queueing pick result.
pub(crate) fn assert_queues(state: &LbState) {
    assert!(matches!(
        state.picker.pick(&Request::new("/test.Service/Method")),
        PickResult::Queue
    ));
}

/// Requires a failing pick result and returns its status.
pub(crate) fn assert_fails(state: &LbState) -> tonic::Status {
    match state.picker.pick(&Request::new("/test.Service/Method")) {
        PickResult::Fail(status) => status,
        PickResult::Pick(_) => panic!("expected Fail, got a pick"),
        PickResult::Queue => panic!("expected Fail, got Queue"),
        PickResult::Drop(status) => panic!("expected Fail, got Drop({status})"),
    }
}

/// Shorthand for a transient-failure subchannel state carrying an error.
pub(crate) fn failure_state(error: &str) -> SubchannelState {
    let arc_err: Arc<dyn std::error::Error + Send + Sync> =
        Arc::from(Box::from(error.to_string()));
    SubchannelState {
        connectivity_state: ConnectivityState::TransientFailure,
        last_connection_error: Some(arc_err),
    }
}
