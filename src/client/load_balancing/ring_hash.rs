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

//! The ring_hash LB policy.
//!
//! Endpoints are mapped onto a sorted hash ring with a number of entries
//! proportional to their weight.  Each RPC carries a request hash; the pick
//! walks the ring clockwise from the first entry at or after that hash
//! until it finds a usable subchannel.  Connections are established lazily,
//! driven by picks.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::hash::Hasher;
use std::sync::{Arc, Once};

use serde::Deserialize;
use tonic::Status;
use tracing::debug;
use twox_hash::XxHash64;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, ParsedJsonLbConfig, Pick, PickResult, Picker, Subchannel,
    SubchannelState,
};
use crate::client::name_resolution::{Endpoint, ResolverUpdate};
use crate::service::Request;

pub static POLICY_NAME: &str = "ring_hash";

const DEFAULT_MIN_RING_SIZE: u64 = 1024;
const DEFAULT_MAX_RING_SIZE: u64 = 4096;
const MAX_RING_SIZE_CAP: u64 = 8 * 1024 * 1024;

/// The relative weight of an endpoint on the ring.  Set as an endpoint
/// attribute; endpoints without one weigh 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointWeight(pub u32);

/// Registers ring_hash with the global LB policy registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RingHashPolicy {
            entries: BTreeMap::new(),
            ring: Arc::new(vec![]),
            last_resolver_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let json: RingHashConfigJson = config.convert_to()?;
        let min = json.min_ring_size.unwrap_or(DEFAULT_MIN_RING_SIZE);
        let max = json.max_ring_size.unwrap_or(DEFAULT_MAX_RING_SIZE);
        if min == 0 {
            return Err("minRingSize must be greater than 0".into());
        }
        if min > max {
            return Err("minRingSize must not exceed maxRingSize".into());
        }
        if max > MAX_RING_SIZE_CAP {
            return Err(format!("maxRingSize must not exceed {MAX_RING_SIZE_CAP}").into());
        }
        Ok(Some(LbConfig::new(RingHashConfig {
            min_ring_size: min,
            max_ring_size: max,
        })))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RingHashConfigJson {
    min_ring_size: Option<u64>,
    max_ring_size: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RingHashConfig {
    pub(crate) min_ring_size: u64,
    pub(crate) max_ring_size: u64,
}

struct EndpointEntry {
    subchannel: Subchannel,
    weight: u64,
    state: SubchannelState,
}

struct RingHashPolicy {
    /// One entry per ring key (the endpoint's formatted address list).
    entries: BTreeMap<String, EndpointEntry>,
    ring: Arc<Vec<RingEntry>>,
    last_resolver_error: Option<String>,
}

impl LbPolicy for RingHashPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let config: RingHashConfig = match config {
            Some(config) => *config.convert_to::<RingHashConfig>()?,
            None => RingHashConfig {
                min_ring_size: DEFAULT_MIN_RING_SIZE,
                max_ring_size: DEFAULT_MAX_RING_SIZE,
            },
        };
        match &update.endpoints {
            Ok(endpoints) => {
                let weights = endpoint_weights(endpoints);
                if weights.is_empty() {
                    self.entries.clear();
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

                // Diff against the current endpoint set.
                self.entries.retain(|key, _| weights.contains_key(key));
                for (key, (endpoint, weight)) in &weights {
                    match self.entries.get_mut(key) {
                        Some(entry) => {
                            entry.weight = *weight;
                            entry.subchannel.update_addresses(endpoint.addresses.clone());
                        }
                        None => {
                            // Created idle; ring_hash connects on demand
                            // from the picker.
                            let subchannel =
                                channel_controller.new_subchannel(&endpoint.addresses);
                            self.entries.insert(
                                key.clone(),
                                EndpointEntry {
                                    subchannel,
                                    weight: *weight,
                                    state: SubchannelState::default(),
                                },
                            );
                        }
                    }
                }

                let ring_weights: BTreeMap<String, u64> = weights
                    .iter()
                    .map(|(key, (_, weight))| (key.clone(), *weight))
                    .collect();
                self.ring = Arc::new(build_ring(
                    &ring_weights,
                    config.min_ring_size,
                    config.max_ring_size,
                ));
                debug!("ring_hash: built ring with {} entries", self.ring.len());
                self.update_balancing_state(channel_controller);
                Ok(())
            }
            Err(error) => {
                self.last_resolver_error = Some(error.clone());
                if self.entries.is_empty() {
                    channel_controller.update_picker(LbState {
                        connectivity_state: ConnectivityState::TransientFailure,
                        picker: Arc::new(Failing { error: error.clone() }),
                    });
                    return Err(error.clone().into());
                }
                // Keep serving from the existing ring.
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
            .entries
            .values_mut()
            .find(|entry| entry.subchannel == *subchannel)
        else {
            return;
        };
        match state.connectivity_state {
            ConnectivityState::Shutdown => return,
            // Failures and disconnections hint that the host set may have
            // changed.
            ConnectivityState::TransientFailure | ConnectivityState::Idle => {
                channel_controller.request_resolution();
            }
            _ => {}
        }
        // A failed endpoint stays failed until it actually reconnects;
        // flapping through Connecting/Idle must not make it look healthy.
        if entry.state.connectivity_state == ConnectivityState::TransientFailure
            && matches!(
                state.connectivity_state,
                ConnectivityState::Connecting | ConnectivityState::Idle
            )
        {
            return;
        }
        entry.state = state.clone();
        self.update_balancing_state(channel_controller);
    }

    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}
}

impl RingHashPolicy {
    /// Aggregation, in order of dominance: any Ready wins; two or more
    /// failures beat everything else; then Connecting, then Idle.  While
    /// reporting TransientFailure the policy keeps one connection attempt
    /// in flight on its own, since picks may stop arriving.
    fn update_balancing_state(&mut self, channel_controller: &mut dyn ChannelController) {
        let mut failures = 0;
        let mut has_connecting = false;
        let mut idle_entry = None;
        let mut overall = None;
        for entry in self.entries.values() {
            match entry.state.connectivity_state {
                ConnectivityState::Ready => {
                    overall = Some(ConnectivityState::Ready);
                    break;
                }
                ConnectivityState::TransientFailure => failures += 1,
                ConnectivityState::Connecting => has_connecting = true,
                ConnectivityState::Idle => {
                    idle_entry.get_or_insert(&entry.subchannel);
                }
                ConnectivityState::Shutdown => {}
            }
        }
        let overall = overall.unwrap_or_else(|| {
            if failures >= 2 {
                if !has_connecting {
                    if let Some(subchannel) = idle_entry {
                        subchannel.connect();
                    }
                }
                ConnectivityState::TransientFailure
            } else if has_connecting {
                ConnectivityState::Connecting
            } else if idle_entry.is_some() {
                ConnectivityState::Idle
            } else {
                ConnectivityState::TransientFailure
            }
        });

        let views: HashMap<String, SubchannelView> = self
            .entries
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    SubchannelView {
                        subchannel: entry.subchannel.clone(),
                        state: entry.state.connectivity_state,
                        error: entry
                            .state
                            .last_connection_error
                            .as_ref()
                            .map(|e| e.to_string()),
                    },
                )
            })
            .collect();
        channel_controller.update_picker(LbState {
            connectivity_state: overall,
            picker: Arc::new(RingHashPicker {
                ring: self.ring.clone(),
                subchannels: views,
            }),
        });
    }
}

fn format_endpoint_key(endpoint: &Endpoint) -> String {
    let addresses: Vec<String> = endpoint
        .addresses
        .iter()
        .map(|a| a.address.clone())
        .collect();
    addresses.join(",")
}

/// Collapses endpoints into (ring key -> (endpoint, weight)), accumulating
/// the weight of duplicate keys.
fn endpoint_weights(endpoints: &[Endpoint]) -> BTreeMap<String, (Endpoint, u64)> {
    let mut weights: BTreeMap<String, (Endpoint, u64)> = BTreeMap::new();
    for endpoint in endpoints {
        if endpoint.addresses.is_empty() {
            continue;
        }
        let weight = endpoint
            .attributes
            .get::<EndpointWeight>()
            .map(|w| u64::from(w.0))
            .unwrap_or(1);
        let key = format_endpoint_key(endpoint);
        weights
            .entry(key)
            .and_modify(|(_, w)| *w += weight)
            .or_insert((endpoint.clone(), weight));
    }
    weights
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct RingEntry {
    hash: u64,
    key: String,
}

fn hash_key(key: &str, sequence: u64) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(format!("{key}_{sequence}").as_bytes());
    hasher.finish()
}

/// Builds the ring.  The entry count per endpoint is proportional to its
/// weight, scaled so the least-weighted endpoint receives a whole number of
/// entries while the total stays within [min_ring_size, max_ring_size].
fn build_ring(weights: &BTreeMap<String, u64>, min_ring_size: u64, max_ring_size: u64) -> Vec<RingEntry> {
    let total_weight: u64 = weights.values().sum();
    let min_weight = *weights.values().min().expect("weights must be non-empty");
    let normalized_min = min_weight as f64 / total_weight as f64;
    let scale = ((normalized_min * min_ring_size as f64).ceil() / normalized_min)
        .min(max_ring_size as f64);

    let mut ring = Vec::new();
    let mut current_hashes = 0.0;
    let mut target_hashes = 0.0;
    for (key, weight) in weights {
        let normalized_weight = *weight as f64 / total_weight as f64;
        target_hashes += scale * normalized_weight;
        let mut sequence = 0;
        while current_hashes < target_hashes {
            ring.push(RingEntry {
                hash: hash_key(key, sequence),
                key: key.clone(),
            });
            sequence += 1;
            current_hashes += 1.0;
        }
    }
    // Ties broken by key so rebuilding from the same input always yields
    // the same sequence.
    ring.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.key.cmp(&b.key)));
    ring
}

struct SubchannelView {
    subchannel: Subchannel,
    state: ConnectivityState,
    error: Option<String>,
}

struct RingHashPicker {
    ring: Arc<Vec<RingEntry>>,
    subchannels: HashMap<String, SubchannelView>,
}

impl Picker for RingHashPicker {
    fn pick(&self, request: &Request) -> PickResult {
        let Some(request_hash) = request.options.request_hash else {
            return PickResult::Fail(Status::internal(
                "ring_hash requires a request hash in the call options",
            ));
        };
        if self.ring.is_empty() {
            return PickResult::fail_unavailable("ring is empty");
        }
        // The first ring entry at or after the request hash, wrapping
        // around zero.
        let start = self
            .ring
            .partition_point(|entry| entry.hash < request_hash)
            % self.ring.len();

        // Walk clockwise for a Ready subchannel.  RPCs may buffer while one
        // of the first two distinct subchannels is still pending; beyond
        // that they fail unless a Ready connection exists.  The first Idle
        // subchannel on the walk gets a connection attempt so that picks
        // drive connectivity.
        let mut has_pending = false;
        let mut can_buffer = true;
        let mut first: Option<&Subchannel> = None;
        let mut second: Option<&Subchannel> = None;
        for i in 0..self.ring.len() {
            let entry = &self.ring[(start + i) % self.ring.len()];
            let view = &self.subchannels[&entry.key];
            if view.state == ConnectivityState::Ready {
                return PickResult::Pick(Pick::new(view.subchannel.clone()));
            }
            match first {
                None => first = Some(&view.subchannel),
                Some(f) if *f != view.subchannel => match second {
                    None => second = Some(&view.subchannel),
                    Some(s) if *s != view.subchannel => can_buffer = false,
                    _ => {}
                },
                _ => {}
            }
            if view.state == ConnectivityState::TransientFailure {
                continue;
            }
            if !has_pending {
                if view.state == ConnectivityState::Idle {
                    view.subchannel.connect();
                }
                if can_buffer {
                    return PickResult::Queue;
                }
                has_pending = true;
            }
        }
        // Nothing usable: fail with the error of the entry the hash
        // originally landed on.
        let original = &self.subchannels[&self.ring[start].key];
        PickResult::fail_unavailable(
            original
                .error
                .clone()
                .unwrap_or_else(|| "all ring entries have failed".to_string()),
        )
    }
}
