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

//! The weighted_target LB policy.
//!
//! Delegates to named child policies, one per target (typically a
//! locality), and picks among the Ready children by weighted random
//! selection.  Children with nothing Ready are excluded from selection
//! until they recover.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::sync::{Arc, Once};

use serde::Deserialize;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, ParsedJsonLbConfig, PickResult, Picker, QueuingPicker, Subchannel,
    SubchannelState, WorkScheduler, WrappedController,
};
use crate::client::name_resolution::{Endpoint, ResolverUpdate};
use crate::client::service_config::ChildPolicyConfig;
use crate::rt::Runtime;
use crate::service::Request;

pub static POLICY_NAME: &str = "weighted_target";

/// Names the target (locality) an endpoint belongs to.  Set as an endpoint
/// attribute by whoever produced the endpoint list, typically the
/// cluster_resolver policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalityName(pub String);

/// Registers weighted_target with the global LB policy registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(WeightedTargetPolicy {
            children: BTreeMap::new(),
            subchannel_to_child: HashMap::new(),
            work_scheduler: options.work_scheduler,
            runtime: options.runtime,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let json: WeightedTargetConfigJson = config.convert_to()?;
        if json.targets.is_empty() {
            return Err("weighted_target config contains no targets".into());
        }
        let mut targets = BTreeMap::new();
        for (name, target) in json.targets {
            if target.weight == 0 {
                return Err(format!("weighted_target target {name} has zero weight").into());
            }
            let child_policy = ChildPolicyConfig::parse(&target.child_policy)?;
            targets.insert(
                name,
                TargetConfig {
                    weight: target.weight,
                    child_policy,
                },
            );
        }
        Ok(Some(LbConfig::new(WeightedTargetConfig { targets })))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeightedTargetConfigJson {
    targets: HashMap<String, TargetConfigJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetConfigJson {
    weight: u32,
    child_policy: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct WeightedTargetConfig {
    pub(crate) targets: BTreeMap<String, TargetConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TargetConfig {
    pub(crate) weight: u32,
    pub(crate) child_policy: ChildPolicyConfig,
}

struct ChildState {
    weight: u32,
    child_policy: ChildPolicyConfig,
    policy: Box<dyn LbPolicy>,
    state: LbState,
}

struct WeightedTargetPolicy {
    children: BTreeMap<String, ChildState>,
    subchannel_to_child: HashMap<Subchannel, String>,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
}

impl LbPolicy for WeightedTargetPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let config: &WeightedTargetConfig = config
            .ok_or("weighted_target requires a configuration")?
            .convert_to()?;

        // Remove children for delisted targets.  Dropping a child drops
        // its subchannels.
        let targets = &config.targets;
        let removed: Vec<String> = self
            .children
            .keys()
            .filter(|name| !targets.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            debug!("weighted_target: removing target {name}");
            self.children.remove(&name);
            self.subchannel_to_child.retain(|_, child| *child != name);
        }

        let sharded = shard_endpoints_by_locality(&update);
        let mut result = Ok(());
        for (name, target) in targets {
            // An unchanged child policy config is applied in place; a
            // changed one rebuilds the child from scratch.
            let needs_rebuild = match self.children.get(name) {
                Some(child) => child.child_policy != target.child_policy,
                None => true,
            };
            if needs_rebuild {
                debug!("weighted_target: (re)building target {name}");
                self.subchannel_to_child.retain(|_, child| *child != *name);
                let policy = target.child_policy.selection.builder.build(LbPolicyOptions {
                    work_scheduler: self.work_scheduler.clone(),
                    runtime: self.runtime.clone(),
                });
                self.children.insert(
                    name.clone(),
                    ChildState {
                        weight: target.weight,
                        child_policy: target.child_policy.clone(),
                        policy,
                        state: LbState::initial(),
                    },
                );
            }
            let child = self.children.get_mut(name).unwrap();
            child.weight = target.weight;

            let child_update = ResolverUpdate {
                attributes: update.attributes.clone(),
                endpoints: match &update.endpoints {
                    Ok(_) => Ok(sharded.get(name).cloned().unwrap_or_default()),
                    Err(error) => Err(error.clone()),
                },
                service_config: Ok(None),
                resolution_note: update.resolution_note.clone(),
            };
            let mut wrapped = WrappedController::new(channel_controller);
            if let Err(err) = child.policy.resolver_update(
                child_update,
                target.child_policy.selection.config.as_ref(),
                &mut wrapped,
            ) {
                // A child with no usable endpoints stays in the map and
                // reports failure through its picker; other targets keep
                // serving.
                debug!("weighted_target: target {name} rejected update: {err}");
                result = Err(err);
            }
            self.absorb_child_updates(name.clone(), wrapped);
        }
        self.send_aggregate_picker(channel_controller);
        // Partial failure is not a policy failure as long as some target
        // accepted the update.
        if self
            .children
            .values()
            .any(|c| c.state.connectivity_state != ConnectivityState::TransientFailure)
        {
            return Ok(());
        }
        result
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(name) = self.subchannel_to_child.get(subchannel).cloned() else {
            return;
        };
        let Some(child) = self.children.get_mut(&name) else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        child
            .policy
            .subchannel_update(subchannel, state, &mut wrapped);
        self.absorb_child_updates(name, wrapped);
        self.send_aggregate_picker(channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let names: Vec<String> = self.children.keys().cloned().collect();
        for name in names {
            let mut wrapped = WrappedController::new(channel_controller);
            self.children
                .get_mut(&name)
                .unwrap()
                .policy
                .work(&mut wrapped);
            self.absorb_child_updates(name, wrapped);
        }
        self.send_aggregate_picker(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let names: Vec<String> = self.children.keys().cloned().collect();
        for name in names {
            let mut wrapped = WrappedController::new(channel_controller);
            self.children
                .get_mut(&name)
                .unwrap()
                .policy
                .exit_idle(&mut wrapped);
            self.absorb_child_updates(name, wrapped);
        }
        self.send_aggregate_picker(channel_controller);
    }
}

impl WeightedTargetPolicy {
    fn absorb_child_updates(&mut self, name: String, wrapped: WrappedController) {
        let WrappedController {
            picker_update,
            created_subchannels,
            ..
        } = wrapped;
        for subchannel in created_subchannels {
            self.subchannel_to_child.insert(subchannel, name.clone());
        }
        if let Some(update) = picker_update {
            if let Some(child) = self.children.get_mut(&name) {
                child.state = update;
            }
        }
    }

    /// Ready if any child is Ready, with a weighted-random picker over the
    /// Ready children; else Connecting if any child is Connecting; else
    /// TransientFailure.
    fn send_aggregate_picker(&mut self, channel_controller: &mut dyn ChannelController) {
        let mut entries = vec![];
        let mut total: u64 = 0;
        for child in self.children.values() {
            if child.state.connectivity_state == ConnectivityState::Ready {
                total += u64::from(child.weight);
                entries.push((total, child.state.picker.clone()));
            }
        }
        let update = if !entries.is_empty() {
            LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(WeightedTargetPicker { entries, total }),
            }
        } else if self.children.values().any(|c| {
            matches!(
                c.state.connectivity_state,
                ConnectivityState::Connecting | ConnectivityState::Idle
            )
        }) {
            LbState {
                connectivity_state: ConnectivityState::Connecting,
                picker: Arc::new(QueuingPicker {}),
            }
        } else {
            LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(Failing {
                    error: "all weighted_target targets have failed".to_string(),
                }),
            }
        };
        channel_controller.update_picker(update);
    }
}

/// Splits the update's endpoints by their LocalityName attribute.
/// Endpoints without a locality cannot be attributed to a target and are
/// dropped.
fn shard_endpoints_by_locality(update: &ResolverUpdate) -> HashMap<String, Vec<Endpoint>> {
    let mut sharded: HashMap<String, Vec<Endpoint>> = HashMap::new();
    if let Ok(endpoints) = &update.endpoints {
        for endpoint in endpoints {
            match endpoint.attributes.get::<LocalityName>() {
                Some(LocalityName(name)) => {
                    sharded.entry(name.clone()).or_default().push(endpoint.clone());
                }
                None => debug!("weighted_target: dropping endpoint without a locality"),
            }
        }
    }
    sharded
}

struct WeightedTargetPicker {
    /// (cumulative weight, picker) for each Ready child, ascending.
    entries: Vec<(u64, Arc<dyn Picker>)>,
    total: u64,
}

impl Picker for WeightedTargetPicker {
    fn pick(&self, request: &Request) -> PickResult {
        let roll = rand::random_range(0..self.total);
        let index = self
            .entries
            .partition_point(|(cumulative, _)| *cumulative <= roll);
        self.entries[index].1.pick(request)
    }
}
