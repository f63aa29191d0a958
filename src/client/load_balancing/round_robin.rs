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

//! The round_robin LB policy.
//!
//! Maintains one subchannel per resolved address and cycles picks across
//! the Ready ones with a shared, monotonically advancing index.

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, Pick, PickResult, Picker, QueuingPicker, Subchannel, SubchannelState,
    flatten_addresses,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::service::Request;

pub static POLICY_NAME: &str = "round_robin";

/// Registers round_robin with the global LB policy registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            subchannels: vec![],
            last_resolver_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct SubchannelEntry {
    address: Address,
    subchannel: Subchannel,
    state: SubchannelState,
}

struct RoundRobinPolicy {
    /// One entry per resolved address, in resolver order.
    subchannels: Vec<SubchannelEntry>,
    last_resolver_error: Option<String>,
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match update.endpoints {
            Ok(endpoints) => {
                let addresses = flatten_addresses(&endpoints);
                if addresses.is_empty() {
                    self.shutdown_all();
                    channel_controller.update_picker(LbState {
                        connectivity_state: ConnectivityState::TransientFailure,
                        picker: Arc::new(Failing {
                            error: "received empty address list from the name resolver"
                                .to_string(),
                        }),
                    });
                    channel_controller.request_resolution();
                    return Err("received empty address list from the name resolver".into());
                }
                self.apply_addresses(addresses, channel_controller);
                self.send_aggregate_picker(channel_controller);
                Ok(())
            }
            Err(error) => {
                debug!("round_robin received resolver error: {error}");
                self.last_resolver_error = Some(error.clone());
                if self.subchannels.is_empty() {
                    // Nothing usable yet; surface the failure.
                    channel_controller.update_picker(LbState {
                        connectivity_state: ConnectivityState::TransientFailure,
                        picker: Arc::new(Failing { error: error.clone() }),
                    });
                    return Err(error.into());
                }
                // Keep serving with the previous good address list.
                Ok(())
            }
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(entry) = self
            .subchannels
            .iter_mut()
            .find(|entry| entry.subchannel == *subchannel)
        else {
            return;
        };
        if state.connectivity_state == ConnectivityState::Shutdown {
            return;
        }
        entry.state = state.clone();
        // Disconnected subchannels dial again immediately; round_robin
        // wants every address connected.
        if state.connectivity_state == ConnectivityState::Idle {
            entry.subchannel.connect();
        }
        if state.connectivity_state == ConnectivityState::TransientFailure {
            channel_controller.request_resolution();
        }
        self.send_aggregate_picker(channel_controller);
    }

    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {
        for entry in &self.subchannels {
            if entry.state.connectivity_state == ConnectivityState::Idle {
                entry.subchannel.connect();
            }
        }
    }
}

impl RoundRobinPolicy {
    /// Diffs the new address list against the current subchannel set,
    /// creating subchannels for new addresses and shutting down delisted
    /// ones.  Unchanged addresses keep their subchannel untouched.
    fn apply_addresses(
        &mut self,
        addresses: Vec<Address>,
        channel_controller: &mut dyn ChannelController,
    ) {
        let old = std::mem::take(&mut self.subchannels);
        let mut old: Vec<Option<SubchannelEntry>> = old.into_iter().map(Some).collect();
        for address in addresses {
            let existing = old
                .iter_mut()
                .find(|slot| {
                    slot.as_ref()
                        .is_some_and(|entry| entry.address == address)
                })
                .and_then(Option::take);
            match existing {
                Some(entry) => self.subchannels.push(entry),
                None => {
                    let subchannel =
                        channel_controller.new_subchannel(std::slice::from_ref(&address));
                    subchannel.connect();
                    self.subchannels.push(SubchannelEntry {
                        address,
                        subchannel,
                        state: SubchannelState::default(),
                    });
                }
            }
        }
        for entry in old.into_iter().flatten() {
            entry.subchannel.shutdown();
        }
    }

    fn shutdown_all(&mut self) {
        for entry in self.subchannels.drain(..) {
            entry.subchannel.shutdown();
        }
    }

    /// Publishes a picker reflecting the aggregate connectivity state:
    /// Ready if any subchannel is Ready, else Connecting if any is
    /// Connecting, else TransientFailure if any has failed, else Idle.
    fn send_aggregate_picker(&mut self, channel_controller: &mut dyn ChannelController) {
        let ready: Vec<Subchannel> = self
            .subchannels
            .iter()
            .filter(|entry| entry.state.connectivity_state == ConnectivityState::Ready)
            .map(|entry| entry.subchannel.clone())
            .collect();
        let update = if !ready.is_empty() {
            LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(RoundRobinPicker::new(ready)),
            }
        } else if self
            .subchannels
            .iter()
            .any(|e| e.state.connectivity_state == ConnectivityState::Connecting)
        {
            LbState {
                connectivity_state: ConnectivityState::Connecting,
                picker: Arc::new(QueuingPicker {}),
            }
        } else if let Some(failed) = self
            .subchannels
            .iter()
            .find(|e| e.state.connectivity_state == ConnectivityState::TransientFailure)
        {
            let error = failed
                .state
                .last_connection_error
                .as_ref()
                .map(|e| e.to_string())
                .or_else(|| self.last_resolver_error.clone())
                .unwrap_or_else(|| "all connections failed".to_string());
            LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(Failing { error }),
            }
        } else {
            LbState {
                connectivity_state: ConnectivityState::Idle,
                picker: Arc::new(QueuingPicker {}),
            }
        };
        channel_controller.update_picker(update);
    }
}

struct RoundRobinPicker {
    subchannels: Vec<Subchannel>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<Subchannel>) -> Self {
        // Start at a random offset so that a fleet of channels does not
        // converge on the same first backend.
        let start = rand::random_range(..subchannels.len());
        Self {
            subchannels,
            next: AtomicUsize::new(start),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Pick(Pick::new(self.subchannels[index].clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::load_balancing::test_utils::{
        assert_fails, assert_queues, endpoint, failure_state, last_picker, next_subchannel,
        pick_subchannel, setup, update_with_endpoints, update_with_error,
    };
    use std::collections::HashMap;

    fn new_policy() -> Box<dyn LbPolicy> {
        reg();
        let (_rx, _controller, options) = setup();
        GLOBAL_LB_REGISTRY
            .get_policy(POLICY_NAME)
            .unwrap()
            .build(options)
    }

    #[tokio::test]
    async fn one_subchannel_per_address() {
        let (mut rx, mut controller, _) = setup();
        let mut policy = new_policy();

        policy
            .resolver_update(
                update_with_endpoints(vec![endpoint(&["a:443"]), endpoint(&["b:443"])]),
                None,
                &mut controller,
            )
            .unwrap();
        let sc_a = next_subchannel(&mut rx);
        let sc_b = next_subchannel(&mut rx);
        assert_eq!(sc_a.addresses()[0].address, "a:443");
        assert_eq!(sc_b.addresses()[0].address, "b:443");
        // Nothing ready yet: the aggregate picker queues.
        let picker = last_picker(&mut rx);
        assert_eq!(picker.connectivity_state, ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn picks_cycle_fairly_across_ready_subchannels() {
        let (mut rx, mut controller, _) = setup();
        let mut policy = new_policy();

        policy
            .resolver_update(
                update_with_endpoints(vec![
                    endpoint(&["a:443"]),
                    endpoint(&["b:443"]),
                    endpoint(&["c:443"]),
                ]),
                None,
                &mut controller,
            )
            .unwrap();
        let sc_a = next_subchannel(&mut rx);
        let sc_b = next_subchannel(&mut rx);
        let _sc_c = next_subchannel(&mut rx);

        let ready = SubchannelState::new(ConnectivityState::Ready);
        policy.subchannel_update(&sc_a, &ready, &mut controller);
        policy.subchannel_update(&sc_b, &ready, &mut controller);
        let picker = last_picker(&mut rx);

        // Two ready subchannels, 10 picks: exactly 5 each, c never.
        let mut counts: HashMap<Subchannel, usize> = HashMap::new();
        for _ in 0..10 {
            *counts.entry(pick_subchannel(&picker)).or_default() += 1;
        }
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[&sc_a], 5);
        assert_eq!(counts[&sc_b], 5);
    }

    #[tokio::test]
    async fn subchannel_set_tracks_latest_resolver_update() {
        let (mut rx, mut controller, _) = setup();
        let mut policy = new_policy();

        policy
            .resolver_update(
                update_with_endpoints(vec![endpoint(&["a:443"]), endpoint(&["b:443"])]),
                None,
                &mut controller,
            )
            .unwrap();
        let _sc_a = next_subchannel(&mut rx);
        let sc_b = next_subchannel(&mut rx);
        let _ = last_picker(&mut rx);

        // [a, b] -> [b, c]: only c is created; a is shut down; b survives.
        policy
            .resolver_update(
                update_with_endpoints(vec![endpoint(&["b:443"]), endpoint(&["c:443"])]),
                None,
                &mut controller,
            )
            .unwrap();
        let sc_c = next_subchannel(&mut rx);
        assert_eq!(sc_c.addresses()[0].address, "c:443");

        let ready = SubchannelState::new(ConnectivityState::Ready);
        policy.subchannel_update(&sc_b, &ready, &mut controller);
        policy.subchannel_update(&sc_c, &ready, &mut controller);
        let picker = last_picker(&mut rx);
        for _ in 0..4 {
            let picked = pick_subchannel(&picker);
            assert!(picked == sc_b || picked == sc_c);
        }
    }

    #[tokio::test]
    async fn unhealthy_member_is_skipped_and_recovery_works() {
        let (mut rx, mut controller, _) = setup();
        let mut policy = new_policy();

        policy
            .resolver_update(
                update_with_endpoints(vec![endpoint(&["a:443"]), endpoint(&["b:443"])]),
                None,
                &mut controller,
            )
            .unwrap();
        let sc_a = next_subchannel(&mut rx);
        let sc_b = next_subchannel(&mut rx);

        // A connects, B keeps failing: all picks go to A.
        policy.subchannel_update(
            &sc_a,
            &SubchannelState::new(ConnectivityState::Ready),
            &mut controller,
        );
        policy.subchannel_update(&sc_b, &failure_state("b is down"), &mut controller);
        let picker = last_picker(&mut rx);
        assert_eq!(picker.connectivity_state, ConnectivityState::Ready);
        for _ in 0..4 {
            assert_eq!(pick_subchannel(&picker), sc_a);
        }

        // A fails too: aggregate becomes TransientFailure.
        policy.subchannel_update(&sc_a, &failure_state("a is down"), &mut controller);
        let picker = last_picker(&mut rx);
        assert_eq!(
            picker.connectivity_state,
            ConnectivityState::TransientFailure
        );
        assert!(assert_fails(&picker).message().contains("down"));

        // B recovers: aggregate returns to Ready and picks route to B.
        policy.subchannel_update(
            &sc_b,
            &SubchannelState::new(ConnectivityState::Ready),
            &mut controller,
        );
        let picker = last_picker(&mut rx);
        assert_eq!(picker.connectivity_state, ConnectivityState::Ready);
        assert_eq!(pick_subchannel(&picker), sc_b);
    }

    #[tokio::test]
    async fn connecting_beats_failure_in_aggregation() {
        let (mut rx, mut controller, _) = setup();
        let mut policy = new_policy();

        policy
            .resolver_update(
                update_with_endpoints(vec![endpoint(&["a:443"]), endpoint(&["b:443"])]),
                None,
                &mut controller,
            )
            .unwrap();
        let sc_a = next_subchannel(&mut rx);
        let sc_b = next_subchannel(&mut rx);

        policy.subchannel_update(&sc_a, &failure_state("down"), &mut controller);
        policy.subchannel_update(
            &sc_b,
            &SubchannelState::new(ConnectivityState::Connecting),
            &mut controller,
        );
        let picker = last_picker(&mut rx);
        assert_eq!(picker.connectivity_state, ConnectivityState::Connecting);
        assert_queues(&picker);
    }

    #[tokio::test]
    async fn empty_address_list_reports_unavailable() {
        let (mut rx, mut controller, _) = setup();
        let mut policy = new_policy();

        let result = policy.resolver_update(update_with_endpoints(vec![]), None, &mut controller);
        assert!(result.is_err());
        let picker = last_picker(&mut rx);
        assert_eq!(
            picker.connectivity_state,
            ConnectivityState::TransientFailure
        );
        let status = assert_fails(&picker);
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("empty address list"));
    }

    #[tokio::test]
    async fn resolver_error_with_live_subchannels_keeps_serving() {
        let (mut rx, mut controller, _) = setup();
        let mut policy = new_policy();

        policy
            .resolver_update(
                update_with_endpoints(vec![endpoint(&["a:443"])]),
                None,
                &mut controller,
            )
            .unwrap();
        let sc_a = next_subchannel(&mut rx);
        policy.subchannel_update(
            &sc_a,
            &SubchannelState::new(ConnectivityState::Ready),
            &mut controller,
        );
        let picker = last_picker(&mut rx);
        assert_eq!(picker.connectivity_state, ConnectivityState::Ready);

        policy
            .resolver_update(update_with_error("resolver blew up"), None, &mut controller)
            .unwrap();
        // No picker replacement: the Ready picker keeps serving.
        crate::client::load_balancing::test_utils::assert_no_events(&mut rx);
    }
}
