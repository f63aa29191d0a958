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

//! The cluster_resolver LB policy.
//!
//! Resolves a cluster's endpoints through one or more discovery mechanisms
//! (EDS-style watches or logical-DNS lookups) behind the
//! [`EndpointDiscovery`] interface.  Results are merged only once every
//! mechanism has reported at least once, then compiled into a priority
//! policy tree: one priority per (mechanism, priority) pair, each wrapping
//! a cluster_impl admission layer over a weighted_target split across
//! localities.  A mechanism that fails after having produced data keeps
//! serving its last good result; only when every mechanism comes up empty
//! does the policy fail picks.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, Once};

use serde::Deserialize;
use tonic::Status;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::load_balancing::cluster_impl::DropCategory;
use crate::client::load_balancing::priority::PriorityName;
use crate::client::load_balancing::ring_hash::EndpointWeight;
use crate::client::load_balancing::weighted_target::LocalityName;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, ParsedJsonLbConfig, Subchannel, SubchannelState, WorkScheduler,
    cluster_impl, priority, weighted_target,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::service_config::LbPolicySelection;
use crate::rt::Runtime;

pub static POLICY_NAME: &str = "cluster_resolver";

/// Registers cluster_resolver, along with the policies it composes, with
/// the global LB policy registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        priority::reg();
        weighted_target::reg();
        cluster_impl::reg();
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

/// A source of endpoints for discovery mechanisms.  Implemented outside
/// this crate (by the xDS client or a DNS wrapper) and injected through the
/// resolver update's attributes as a [`DiscoveryInjection`].
pub trait EndpointDiscovery: Send + Sync {
    /// Starts watching the mechanism.  Results are delivered to the
    /// listener until cancel is called for the same mechanism.
    fn watch(&self, mechanism: &DiscoveryMechanism, listener: Arc<dyn DiscoveryListener>);

    /// Stops a watch started for the mechanism.
    fn cancel(&self, mechanism: &DiscoveryMechanism);
}

/// Receives the results of one discovery mechanism's watch.
pub trait DiscoveryListener: Send + Sync {
    fn on_result(&self, result: Result<Vec<LocalityAssignment>, Status>);
}

/// The endpoints a discovery mechanism found for one locality.
#[derive(Clone, Debug)]
pub struct LocalityAssignment {
    pub locality: String,
    /// Failover rank; 0 is the most preferred.
    pub priority: u32,
    /// The locality's weight relative to other localities of the same
    /// priority.
    pub weight: u32,
    pub endpoints: Vec<WeightedEndpoint>,
}

#[derive(Clone, Debug)]
pub struct WeightedEndpoint {
    pub addresses: Vec<Address>,
    pub weight: u32,
}

/// Wraps an [`EndpointDiscovery`] so it can travel in an attribute bag.
/// Compared by identity.
#[derive(Clone)]
pub struct DiscoveryInjection(pub Arc<dyn EndpointDiscovery>);

impl Debug for DiscoveryInjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DiscoveryInjection")
    }
}

impl PartialEq for DiscoveryInjection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for DiscoveryInjection {}

impl PartialOrd for DiscoveryInjection {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DiscoveryInjection {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (Arc::as_ptr(&self.0) as *const () as usize)
            .cmp(&(Arc::as_ptr(&other.0) as *const () as usize))
    }
}

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(ClusterResolverPolicy {
            mechanisms: vec![],
            lb_policy: vec![],
            child: None,
            discovery: None,
            pending_results: Arc::new(Mutex::new(vec![])),
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
        let json: ClusterResolverConfigJson = config.convert_to()?;
        if json.discovery_mechanisms.is_empty() {
            return Err("cluster_resolver config lists no discovery mechanisms".into());
        }
        if json.lb_policy.is_empty() {
            return Err("cluster_resolver config lists no endpoint-picking policy".into());
        }
        Ok(Some(LbConfig::new(ClusterResolverConfig {
            discovery_mechanisms: json.discovery_mechanisms,
            lb_policy: json.lb_policy,
        })))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterResolverConfigJson {
    #[serde(default)]
    discovery_mechanisms: Vec<DiscoveryMechanism>,
    #[serde(default)]
    lb_policy: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ClusterResolverConfig {
    pub(crate) discovery_mechanisms: Vec<DiscoveryMechanism>,
    pub(crate) lb_policy: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// One way of discovering a cluster's endpoints.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(tag = "type")]
pub enum DiscoveryMechanism {
    #[serde(rename = "EDS", rename_all = "camelCase")]
    Eds {
        cluster: String,
        #[serde(default)]
        eds_service_name: Option<String>,
        #[serde(default)]
        max_concurrent_requests: Option<u64>,
        #[serde(default)]
        drop_categories: Vec<DropCategory>,
    },
    #[serde(rename = "LOGICAL_DNS", rename_all = "camelCase")]
    LogicalDns {
        cluster: String,
        hostname: String,
        #[serde(default)]
        max_concurrent_requests: Option<u64>,
        #[serde(default)]
        drop_categories: Vec<DropCategory>,
    },
}

impl DiscoveryMechanism {
    /// A stable identifier for watch bookkeeping.
    pub fn key(&self) -> String {
        match self {
            Self::Eds {
                cluster,
                eds_service_name,
                ..
            } => match eds_service_name {
                Some(name) => format!("eds:{cluster}/{name}"),
                None => format!("eds:{cluster}"),
            },
            Self::LogicalDns { hostname, .. } => format!("dns:{hostname}"),
        }
    }

    pub fn cluster(&self) -> &str {
        match self {
            Self::Eds { cluster, .. } | Self::LogicalDns { cluster, .. } => cluster,
        }
    }

    fn eds_service_name(&self) -> Option<&str> {
        match self {
            Self::Eds {
                eds_service_name, ..
            } => eds_service_name.as_deref(),
            Self::LogicalDns { .. } => None,
        }
    }

    fn max_concurrent_requests(&self) -> Option<u64> {
        match self {
            Self::Eds {
                max_concurrent_requests,
                ..
            }
            | Self::LogicalDns {
                max_concurrent_requests,
                ..
            } => *max_concurrent_requests,
        }
    }

    fn drop_categories(&self) -> &[DropCategory] {
        match self {
            Self::Eds {
                drop_categories, ..
            }
            | Self::LogicalDns {
                drop_categories, ..
            } => drop_categories,
        }
    }
}

struct MechanismState {
    mechanism: DiscoveryMechanism,
    reported: bool,
    last_good: Option<Vec<LocalityAssignment>>,
    last_error: Option<Status>,
}

struct ClusterResolverPolicy {
    mechanisms: Vec<MechanismState>,
    lb_policy: Vec<serde_json::Map<String, serde_json::Value>>,
    /// The compiled priority policy, built once all mechanisms reported.
    child: Option<ChildPolicy>,
    discovery: Option<Arc<dyn EndpointDiscovery>>,
    /// Results delivered by discovery listeners, drained in work().
    pending_results: Arc<Mutex<Vec<(String, Result<Vec<LocalityAssignment>, Status>)>>>,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
}

struct ChildPolicy {
    policy: Box<dyn LbPolicy>,
}

struct MechanismListener {
    key: String,
    results: Arc<Mutex<Vec<(String, Result<Vec<LocalityAssignment>, Status>)>>>,
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl DiscoveryListener for MechanismListener {
    fn on_result(&self, result: Result<Vec<LocalityAssignment>, Status>) {
        self.results.lock().unwrap().push((self.key.clone(), result));
        self.work_scheduler.schedule_work();
    }
}

impl LbPolicy for ClusterResolverPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let config: &ClusterResolverConfig = config
            .ok_or("cluster_resolver requires a configuration")?
            .convert_to()?;
        let discovery = update
            .attributes
            .get::<DiscoveryInjection>()
            .ok_or("cluster_resolver requires an endpoint discovery implementation")?
            .0
            .clone();
        self.lb_policy = config.lb_policy.clone();

        // Diff the mechanism set: cancel watches that disappeared, start
        // watches that are new, keep the rest untouched.
        let wanted: HashSet<String> = config
            .discovery_mechanisms
            .iter()
            .map(DiscoveryMechanism::key)
            .collect();
        for state in &self.mechanisms {
            if !wanted.contains(&state.mechanism.key()) {
                debug!(
                    "cluster_resolver: cancelling watch {}",
                    state.mechanism.key()
                );
                discovery.cancel(&state.mechanism);
            }
        }
        let mut old: HashMap<String, MechanismState> = self
            .mechanisms
            .drain(..)
            .map(|state| (state.mechanism.key(), state))
            .collect();
        for mechanism in &config.discovery_mechanisms {
            let key = mechanism.key();
            match old.remove(&key) {
                Some(state) => self.mechanisms.push(state),
                None => {
                    debug!("cluster_resolver: starting watch {key}");
                    discovery.watch(
                        mechanism,
                        Arc::new(MechanismListener {
                            key,
                            results: self.pending_results.clone(),
                            work_scheduler: self.work_scheduler.clone(),
                        }),
                    );
                    self.mechanisms.push(MechanismState {
                        mechanism: mechanism.clone(),
                        reported: false,
                        last_good: None,
                        last_error: None,
                    });
                }
            }
        }
        self.discovery = Some(discovery);
        self.compile_and_forward(channel_controller);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if let Some(child) = self.child.as_mut() {
            child
                .policy
                .subchannel_update(subchannel, state, channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let results: Vec<_> = self.pending_results.lock().unwrap().drain(..).collect();
        let had_results = !results.is_empty();
        for (key, result) in results {
            let Some(state) = self
                .mechanisms
                .iter_mut()
                .find(|state| state.mechanism.key() == key)
            else {
                continue;
            };
            state.reported = true;
            match result {
                Ok(assignments) => {
                    state.last_good = Some(assignments);
                    state.last_error = None;
                }
                Err(status) => {
                    debug!("cluster_resolver: mechanism {key} failed: {status}");
                    // A failure after good data keeps the last good result.
                    state.last_error = Some(status);
                }
            }
        }
        if had_results {
            self.compile_and_forward(channel_controller);
        }
        if let Some(child) = self.child.as_mut() {
            child.policy.work(channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(child) = self.child.as_mut() {
            child.policy.exit_idle(channel_controller);
        }
    }
}

impl Drop for ClusterResolverPolicy {
    fn drop(&mut self) {
        if let Some(discovery) = &self.discovery {
            for state in &self.mechanisms {
                discovery.cancel(&state.mechanism);
            }
        }
    }
}

impl ClusterResolverPolicy {
    /// Merges mechanism results into a priority config and endpoint list
    /// and forwards them to the child, once every mechanism has reported.
    fn compile_and_forward(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.mechanisms.is_empty() || self.mechanisms.iter().any(|state| !state.reported) {
            return;
        }

        let mut priorities: Vec<String> = vec![];
        let mut children = serde_json::Map::new();
        let mut endpoints: Vec<Endpoint> = vec![];
        for (index, state) in self.mechanisms.iter().enumerate() {
            let Some(assignments) = &state.last_good else {
                continue;
            };
            let mechanism = &state.mechanism;
            let mut priority_numbers: Vec<u32> =
                assignments.iter().map(|a| a.priority).collect();
            priority_numbers.sort_unstable();
            priority_numbers.dedup();
            for number in priority_numbers {
                let priority_name = format!("{}[{index}]_p{number}", mechanism.cluster());
                let mut targets = serde_json::Map::new();
                for assignment in assignments.iter().filter(|a| a.priority == number) {
                    targets.insert(
                        assignment.locality.clone(),
                        serde_json::json!({
                            "weight": assignment.weight,
                            "childPolicy": self.lb_policy,
                        }),
                    );
                    for endpoint in &assignment.endpoints {
                        let mut addresses = endpoint.addresses.clone();
                        for address in &mut addresses {
                            address.attributes = address
                                .attributes
                                .add(LocalityName(assignment.locality.clone()));
                        }
                        let mut ep = Endpoint::new(addresses);
                        ep.attributes = ep
                            .attributes
                            .add(LocalityName(assignment.locality.clone()))
                            .add(PriorityName(priority_name.clone()))
                            .add(EndpointWeight(
                                endpoint.weight.saturating_mul(assignment.weight),
                            ));
                        endpoints.push(ep);
                    }
                }
                let mut cluster_impl_config = serde_json::Map::new();
                cluster_impl_config
                    .insert("cluster".into(), mechanism.cluster().into());
                if let Some(name) = mechanism.eds_service_name() {
                    cluster_impl_config.insert("edsServiceName".into(), name.into());
                }
                if let Some(max) = mechanism.max_concurrent_requests() {
                    cluster_impl_config.insert("maxConcurrentRequests".into(), max.into());
                }
                cluster_impl_config.insert(
                    "dropCategories".into(),
                    serde_json::to_value(mechanism.drop_categories())
                        .expect("drop categories serialize"),
                );
                cluster_impl_config.insert(
                    "childPolicy".into(),
                    serde_json::json!([{"weighted_target": {"targets": targets}}]),
                );
                children.insert(
                    priority_name.clone(),
                    serde_json::json!({"config": [{"cluster_impl": cluster_impl_config}]}),
                );
                priorities.push(priority_name);
            }
        }

        if endpoints.is_empty() {
            let causes: Vec<String> = self
                .mechanisms
                .iter()
                .filter_map(|state| state.last_error.as_ref().map(|s| s.message().to_string()))
                .collect();
            let error = if causes.is_empty() {
                "no usable endpoints from any discovery mechanism".to_string()
            } else {
                format!("endpoint discovery failed: {}", causes.join("; "))
            };
            debug!("cluster_resolver: {error}");
            self.child = None;
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(Failing { error }),
            });
            channel_controller.request_resolution();
            return;
        }

        let priority_selection = match self.parse_priority_config(priorities, children) {
            Ok(selection) => selection,
            Err(error) => {
                debug!("cluster_resolver: failed to compile child config: {error}");
                channel_controller.update_picker(LbState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    picker: Arc::new(Failing { error }),
                });
                return;
            }
        };

        if self.child.is_none() {
            let policy = priority_selection.builder.build(LbPolicyOptions {
                work_scheduler: self.work_scheduler.clone(),
                runtime: self.runtime.clone(),
            });
            self.child = Some(ChildPolicy { policy });
        }
        let child_update = ResolverUpdate {
            endpoints: Ok(endpoints),
            ..Default::default()
        };
        if let Err(error) = self.child.as_mut().unwrap().policy.resolver_update(
            child_update,
            priority_selection.config.as_ref(),
            channel_controller,
        ) {
            debug!("cluster_resolver: child rejected update: {error}");
        }
    }

    fn parse_priority_config(
        &self,
        priorities: Vec<String>,
        children: serde_json::Map<String, serde_json::Value>,
    ) -> Result<LbPolicySelection, String> {
        let builder = GLOBAL_LB_REGISTRY
            .get_policy(priority::POLICY_NAME)
            .ok_or("priority policy is not registered")?;
        let config = builder
            .parse_config(&ParsedJsonLbConfig::new(serde_json::json!({
                "priorities": priorities,
                "children": children,
            })))
            .map_err(|err| err.to_string())?;
        Ok(LbPolicySelection { builder, config })
    }
}
