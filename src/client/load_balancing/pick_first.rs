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

//! The pick_first LB policy.
//!
//! Maintains a single subchannel covering every resolved address in
//! original order.  The subchannel walks the list when connecting; a Ready
//! connection sticks until it fails.

use std::error::Error;
use std::sync::{Arc, Once};

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, ParsedJsonLbConfig, Pick, PickResult, Picker, QueuingPicker,
    Subchannel, SubchannelState, flatten_addresses,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::service::Request;

pub static POLICY_NAME: &str = "pick_first";

/// Registers pick_first with the global LB policy registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            subchannel: None,
            addresses: vec![],
            connectivity_state: ConnectivityState::Connecting,
            sent_connecting_state: false,
            last_resolver_error: None,
            last_connection_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = config.convert_to()?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct PickFirstConfig {
    shuffle_address_list: Option<bool>,
}

struct PickFirstPolicy {
    subchannel: Option<Subchannel>,
    /// The most recent flattened address list from the name resolver.
    addresses: Vec<Address>,
    connectivity_state: ConnectivityState,
    sent_connecting_state: bool,
    last_resolver_error: Option<String>,
    last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match update.endpoints {
            Ok(mut endpoints) => {
                // Optional shuffling per the LB config.  Only the endpoint
                // order is shuffled; the address order within each endpoint
                // is preserved.
                if self.should_shuffle(config)? {
                    endpoints.shuffle(&mut rand::rng());
                }
                let new_addresses = flatten_addresses(&endpoints);
                if new_addresses.is_empty() {
                    self.handle_empty_endpoints(channel_controller, update.resolution_note);
                    return Err("received empty address list from the name resolver".into());
                }
                match &self.subchannel {
                    // The existing subchannel keeps its identity and
                    // reconnects on its own if its current connection was
                    // delisted.
                    Some(subchannel) => subchannel.update_addresses(new_addresses.clone()),
                    None => self.start_subchannel(&new_addresses, channel_controller),
                }
                self.addresses = new_addresses;
                Ok(())
            }
            Err(error) => {
                debug!("pick_first received resolver error: {error}");
                self.last_resolver_error = Some(error.clone());
                // Fail picks only if there is no good previous update to
                // keep serving from, or if we are already failing.
                if self.addresses.is_empty()
                    || self.connectivity_state == ConnectivityState::TransientFailure
                {
                    self.move_to_transient_failure(channel_controller);
                }
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
        if self.subchannel.as_ref() != Some(subchannel) {
            // A notification for a subchannel that has since been replaced.
            return;
        }
        match state.connectivity_state {
            ConnectivityState::Ready => self.move_to_ready(channel_controller),
            ConnectivityState::Connecting => {
                if !self.sent_connecting_state
                    && self.connectivity_state != ConnectivityState::TransientFailure
                {
                    self.move_to_connecting(channel_controller);
                }
            }
            ConnectivityState::Idle => {
                // Either the initial notification or a lost connection.
                // Reconnect immediately; pick_first has nothing to serve
                // without its one subchannel.
                if self.connectivity_state == ConnectivityState::Ready {
                    self.connectivity_state = ConnectivityState::Connecting;
                    self.sent_connecting_state = false;
                    channel_controller.update_picker(LbState {
                        connectivity_state: ConnectivityState::Connecting,
                        picker: Arc::new(QueuingPicker {}),
                    });
                    channel_controller.request_resolution();
                }
                subchannel.connect();
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state.last_connection_error.clone();
                self.move_to_transient_failure(channel_controller);
            }
            ConnectivityState::Shutdown => {}
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.subchannel.is_none() && !self.addresses.is_empty() {
            let addresses = self.addresses.clone();
            self.start_subchannel(&addresses, channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        match &self.subchannel {
            Some(subchannel) => subchannel.connect(),
            None => self.work(channel_controller),
        }
    }
}

impl PickFirstPolicy {
    fn should_shuffle(
        &self,
        config: Option<&LbConfig>,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let Some(config) = config else {
            return Ok(false);
        };
        let cfg: &PickFirstConfig = config.convert_to()?;
        Ok(cfg.shuffle_address_list.unwrap_or(false))
    }

    fn start_subchannel(
        &mut self,
        addresses: &[Address],
        channel_controller: &mut dyn ChannelController,
    ) {
        let subchannel = channel_controller.new_subchannel(addresses);
        subchannel.connect();
        self.subchannel = Some(subchannel);
        self.move_to_connecting(channel_controller);
    }

    fn handle_empty_endpoints(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        resolution_note: Option<String>,
    ) {
        if let Some(subchannel) = self.subchannel.take() {
            subchannel.shutdown();
        }
        self.addresses = vec![];
        self.last_resolver_error = Some(match resolution_note {
            Some(note) => format!("received empty address list from the name resolver ({note})"),
            None => "received empty address list from the name resolver".to_string(),
        });
        self.move_to_transient_failure(channel_controller);
        channel_controller.request_resolution();
    }

    fn move_to_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Connecting;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
        self.sent_connecting_state = true;
    }

    fn move_to_ready(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Ready;
        self.sent_connecting_state = false;
        let subchannel = self.subchannel.as_ref().unwrap().clone();
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(OneSubchannelPicker { subchannel }),
        });
    }

    fn move_to_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        self.sent_connecting_state = false;
        let error = format!(
            "last seen resolver error: {:?}, last seen connection error: {:?}",
            self.last_resolver_error,
            self.last_connection_error.as_ref().map(|e| e.to_string()),
        );
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
        channel_controller.request_resolution();
    }
}

struct OneSubchannelPicker {
    subchannel: Subchannel,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Pick(Pick::new(self.subchannel.clone()))
    }
}
