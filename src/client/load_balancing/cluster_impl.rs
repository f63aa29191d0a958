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

//! The cluster_impl LB policy.
//!
//! Wraps a child policy with cluster-level admission control: configured
//! drop categories are evaluated first (a probabilistic per-mille drop),
//! then a circuit breaker rejects picks while the cluster's in-flight
//! request count is at its configured maximum.  Calls that do go through
//! are counted, per locality, via a stream tracer.
//!
//! The in-flight counter is deliberately mutated from call-path threads
//! with atomics instead of going through the synchronization context:
//! admission control sits on the hot path and must not wait for the
//! channel's serialized executor.

use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Once, Weak};

use serde::Deserialize;
use tonic::Status;
use tracing::{debug, trace};

use crate::client::load_balancing::weighted_target::LocalityName;
use crate::client::load_balancing::{
    ChannelController, ClientStreamTracer, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy,
    LbPolicyBuilder, LbPolicyOptions, LbState, ParsedJsonLbConfig, Pick, PickResult, Picker,
    Subchannel, SubchannelState, WorkScheduler, WrappedController,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::ChildPolicyConfig;
use crate::rt::Runtime;
use crate::service::Request;

pub static POLICY_NAME: &str = "cluster_impl";

const DEFAULT_MAX_CONCURRENT_REQUESTS: u64 = 1024;

/// Registers cluster_impl with the global LB policy registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(ClusterImplPolicy::new(options))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let json: ClusterImplConfigJson = config.convert_to()?;
        for category in &json.drop_categories {
            if category.requests_per_mille > 1000 {
                return Err(format!(
                    "drop category {} exceeds 1000 per mille",
                    category.category
                )
                .into());
            }
        }
        Ok(Some(LbConfig::new(ClusterImplConfig {
            cluster: json.cluster,
            eds_service_name: json.eds_service_name,
            max_concurrent_requests: json
                .max_concurrent_requests
                .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS),
            drop_categories: json.drop_categories,
            child_policy: ChildPolicyConfig::parse(&json.child_policy)?,
        })))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterImplConfigJson {
    cluster: String,
    eds_service_name: Option<String>,
    max_concurrent_requests: Option<u64>,
    #[serde(default)]
    drop_categories: Vec<DropCategory>,
    child_policy: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// A probabilistic drop rule: the named category of requests is dropped
/// with probability requests_per_mille / 1000.
#[derive(Deserialize, serde::Serialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct DropCategory {
    pub category: String,
    pub requests_per_mille: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ClusterImplConfig {
    pub(crate) cluster: String,
    pub(crate) eds_service_name: Option<String>,
    pub(crate) max_concurrent_requests: u64,
    pub(crate) drop_categories: Vec<DropCategory>,
    pub(crate) child_policy: ChildPolicyConfig,
}

/// Cluster-wide in-flight counters, shared between every channel talking
/// to the same cluster in this process.
static CALL_COUNTERS: LazyLock<Mutex<HashMap<(String, Option<String>), Weak<AtomicU64>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn call_counter(cluster: &str, eds_service_name: &Option<String>) -> Arc<AtomicU64> {
    let key = (cluster.to_string(), eds_service_name.clone());
    let mut counters = CALL_COUNTERS.lock().unwrap();
    if let Some(existing) = counters.get(&key).and_then(Weak::upgrade) {
        return existing;
    }
    let counter = Arc::new(AtomicU64::new(0));
    counters.insert(key, Arc::downgrade(&counter));
    counter
}

/// Per-locality call counts, recorded by the stream tracer.
#[derive(Default, Debug)]
pub(crate) struct LocalityStats {
    calls_started: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
}

impl LocalityStats {
    pub(crate) fn calls_started(&self) -> u64 {
        self.calls_started.load(Ordering::Relaxed)
    }

    pub(crate) fn calls_succeeded(&self) -> u64 {
        self.calls_succeeded.load(Ordering::Relaxed)
    }

    pub(crate) fn calls_failed(&self) -> u64 {
        self.calls_failed.load(Ordering::Relaxed)
    }
}

struct ClusterImplPolicy {
    child: Option<Child>,
    in_flight: Option<Arc<AtomicU64>>,
    /// Stats handle per locality name, shared with tracers in circulation.
    locality_stats: HashMap<String, Arc<LocalityStats>>,
    /// Which locality each child-created subchannel belongs to.
    subchannel_stats: HashMap<Subchannel, Arc<LocalityStats>>,
    last_child_state: Option<LbState>,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
}

struct Child {
    config: ClusterImplConfig,
    policy: Box<dyn LbPolicy>,
}

impl ClusterImplPolicy {
    fn new(options: LbPolicyOptions) -> Self {
        Self {
            child: None,
            in_flight: None,
            locality_stats: HashMap::new(),
            subchannel_stats: HashMap::new(),
            last_child_state: None,
            work_scheduler: options.work_scheduler,
            runtime: options.runtime,
        }
    }
}

impl LbPolicy for ClusterImplPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let config: &ClusterImplConfig = config
            .ok_or("cluster_impl requires a configuration")?
            .convert_to()?;

        let rebuild_child = match &self.child {
            Some(child) => child.config.child_policy != config.child_policy,
            None => true,
        };
        if rebuild_child {
            debug!(
                "cluster_impl: building child policy for cluster {}",
                config.cluster
            );
            self.subchannel_stats.clear();
            let policy = config.child_policy.selection.builder.build(LbPolicyOptions {
                work_scheduler: self.work_scheduler.clone(),
                runtime: self.runtime.clone(),
            });
            self.child = Some(Child {
                config: config.clone(),
                policy,
            });
        } else {
            self.child.as_mut().unwrap().config = config.clone();
        }
        self.in_flight = Some(call_counter(&config.cluster, &config.eds_service_name));

        let child_config = config.child_policy.selection.config.clone();
        let mut wrapped = WrappedController::new(channel_controller);
        let result = self.child.as_mut().unwrap().policy.resolver_update(
            update,
            child_config.as_ref(),
            &mut wrapped,
        );
        self.absorb_child_updates(wrapped);
        // Even with no picker change from the child, the admission-control
        // parameters may have changed; republish.
        self.publish(channel_controller);
        result
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        child
            .policy
            .subchannel_update(subchannel, state, &mut wrapped);
        let published = wrapped.picker_update.is_some();
        self.absorb_child_updates(wrapped);
        if published {
            self.publish(channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        child.policy.work(&mut wrapped);
        let published = wrapped.picker_update.is_some();
        self.absorb_child_updates(wrapped);
        if published {
            self.publish(channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        child.policy.exit_idle(&mut wrapped);
        let published = wrapped.picker_update.is_some();
        self.absorb_child_updates(wrapped);
        if published {
            self.publish(channel_controller);
        }
    }
}

impl ClusterImplPolicy {
    fn absorb_child_updates(&mut self, wrapped: WrappedController) {
        let WrappedController {
            picker_update,
            created_subchannels,
            ..
        } = wrapped;
        for subchannel in created_subchannels {
            let locality = subchannel
                .addresses()
                .first()
                .and_then(|address| address.attributes.get::<LocalityName>().cloned())
                .map(|LocalityName(name)| name)
                .unwrap_or_default();
            let stats = self
                .locality_stats
                .entry(locality)
                .or_default()
                .clone();
            self.subchannel_stats.insert(subchannel, stats);
        }
        if let Some(update) = picker_update {
            self.last_child_state = Some(update);
        }
    }

    fn publish(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(child_state) = &self.last_child_state else {
            return;
        };
        let Some(child) = &self.child else {
            return;
        };
        let picker = RequestLimitingPicker {
            delegate: child_state.picker.clone(),
            drop_categories: child.config.drop_categories.clone(),
            max_concurrent_requests: child.config.max_concurrent_requests,
            in_flight: self
                .in_flight
                .clone()
                .expect("in_flight exists whenever a child does"),
            stats_by_subchannel: self.subchannel_stats.clone(),
        };
        channel_controller.update_picker(LbState {
            connectivity_state: child_state.connectivity_state,
            picker: Arc::new(picker),
        });
    }
}

struct RequestLimitingPicker {
    delegate: Arc<dyn Picker>,
    drop_categories: Vec<DropCategory>,
    max_concurrent_requests: u64,
    in_flight: Arc<AtomicU64>,
    stats_by_subchannel: HashMap<Subchannel, Arc<LocalityStats>>,
}

impl Picker for RequestLimitingPicker {
    fn pick(&self, request: &Request) -> PickResult {
        for category in &self.drop_categories {
            if rand::random_range(0..1000u32) < category.requests_per_mille {
                trace!("cluster_impl: dropping request: {}", category.category);
                return PickResult::Drop(Status::unavailable(format!(
                    "dropped: {}",
                    category.category
                )));
            }
        }
        match self.delegate.pick(request) {
            PickResult::Pick(pick) => {
                if self.in_flight.load(Ordering::Acquire) >= self.max_concurrent_requests {
                    return PickResult::Drop(Status::unavailable(
                        "cluster max concurrent requests limit exceeded",
                    ));
                }
                let stats = self.stats_by_subchannel.get(&pick.subchannel).cloned();
                let tracer = Arc::new(CountingStreamTracer {
                    in_flight: self.in_flight.clone(),
                    stats,
                    inner: pick.stream_tracer.clone(),
                });
                PickResult::Pick(Pick {
                    stream_tracer: Some(tracer),
                    ..pick
                })
            }
            other => other,
        }
    }
}

/// Counts stream starts and finishes against the cluster's in-flight
/// counter and the picked subchannel's locality stats.
struct CountingStreamTracer {
    in_flight: Arc<AtomicU64>,
    stats: Option<Arc<LocalityStats>>,
    inner: Option<Arc<dyn ClientStreamTracer>>,
}

impl ClientStreamTracer for CountingStreamTracer {
    fn stream_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Some(stats) = &self.stats {
            stats.calls_started.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(inner) = &self.inner {
            inner.stream_started();
        }
    }

    fn stream_closed(&self, status: &Status) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Some(stats) = &self.stats {
            if status.code() == tonic::Code::Ok {
                stats.calls_succeeded.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.calls_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(inner) = &self.inner {
            inner.stream_closed(status);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::ConnectivityState;
    use crate::client::load_balancing::pick_first;
    use crate::client::load_balancing::test_utils::{
        addr, last_picker, next_subchannel, setup, update_with_endpoints,
    };
    use crate::client::name_resolution::Endpoint;

    fn config_json(cluster: &str, max_concurrent: u64, drops: &[(&str, u32)]) -> ParsedJsonLbConfig {
        let drops: Vec<serde_json::Value> = drops
            .iter()
            .map(|(category, per_mille)| {
                serde_json::json!({"category": category, "requestsPerMille": per_mille})
            })
            .collect();
        ParsedJsonLbConfig::new(serde_json::json!({
            "cluster": cluster,
            "maxConcurrentRequests": max_concurrent,
            "dropCategories": drops,
            "childPolicy": [{"pick_first": {}}],
        }))
    }

    fn parse(config: &ParsedJsonLbConfig) -> LbConfig {
        pick_first::reg();
        reg();
        GLOBAL_LB_REGISTRY
            .get_policy(POLICY_NAME)
            .unwrap()
            .parse_config(config)
            .unwrap()
            .unwrap()
    }

    fn locality_endpoint(address: &str, locality: &str) -> Endpoint {
        let mut address = addr(address);
        address.attributes = address
            .attributes
            .add(LocalityName(locality.to_string()));
        Endpoint::new(vec![address])
    }

    fn ready_picker(
        config: &LbConfig,
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<
            crate::client::load_balancing::test_utils::TestEvent,
        >,
        controller: &mut crate::client::load_balancing::test_utils::TestChannelController,
        policy: &mut ClusterImplPolicy,
    ) -> LbState {
        policy
            .resolver_update(
                update_with_endpoints(vec![locality_endpoint("a:443", "east")]),
                Some(config),
                controller,
            )
            .unwrap();
        let subchannel = next_subchannel(rx);
        policy.subchannel_update(
            &subchannel,
            &SubchannelState::new(ConnectivityState::Ready),
            controller,
        );
        let picker = last_picker(rx);
        assert_eq!(picker.connectivity_state, ConnectivityState::Ready);
        picker
    }

    fn pick(picker: &LbState) -> Result<Pick, Status> {
        match picker
            .picker
            .pick(&Request::new("/test.Service/Method"))
        {
            PickResult::Pick(pick) => Ok(pick),
            PickResult::Drop(status) | PickResult::Fail(status) => Err(status),
            PickResult::Queue => panic!("unexpected Queue"),
        }
    }

    #[tokio::test]
    async fn circuit_breaker_caps_concurrent_requests() {
        let (mut rx, mut controller, options) = setup();
        let mut policy = ClusterImplPolicy::new(options);
        let config = parse(&config_json("cb-cluster", 3, &[]));
        let picker = ready_picker(&config, &mut rx, &mut controller, &mut policy);

        // Start three streams; the counter sits at the maximum.
        let mut tracers = vec![];
        for _ in 0..3 {
            let p = pick(&picker).expect("pick under the limit succeeds");
            let tracer = p.stream_tracer.expect("cluster_impl attaches a tracer");
            tracer.stream_started();
            tracers.push(tracer);
        }

        // The fourth concurrent pick is rejected.
        let status = pick(&picker).expect_err("pick over the limit is dropped");
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("max concurrent requests"));

        // Any stream finishing makes room for the next pick.
        tracers.pop().unwrap().stream_closed(&Status::ok(""));
        let p = pick(&picker).expect("pick after a completion succeeds");
        p.stream_tracer.unwrap();

        // Cleanup so the shared counter does not leak into other tests.
        for tracer in tracers {
            tracer.stream_closed(&Status::ok(""));
        }
    }

    #[tokio::test]
    async fn full_per_mille_drop_rejects_everything() {
        let (mut rx, mut controller, options) = setup();
        let mut policy = ClusterImplPolicy::new(options);
        let config = parse(&config_json("drop-cluster", 1024, &[("throttle-all", 1000)]));
        let picker = ready_picker(&config, &mut rx, &mut controller, &mut policy);

        for _ in 0..20 {
            let status = pick(&picker).expect_err("every pick must be dropped");
            assert!(status.message().contains("throttle-all"));
        }
    }

    #[tokio::test]
    async fn zero_per_mille_drop_never_fires() {
        let (mut rx, mut controller, options) = setup();
        let mut policy = ClusterImplPolicy::new(options);
        let config = parse(&config_json("no-drop-cluster", 1024, &[("never", 0)]));
        let picker = ready_picker(&config, &mut rx, &mut controller, &mut policy);

        for _ in 0..20 {
            pick(&picker).expect("no pick may be dropped");
        }
    }

    #[tokio::test]
    async fn locality_stats_count_stream_lifecycles() {
        let (mut rx, mut controller, options) = setup();
        let mut policy = ClusterImplPolicy::new(options);
        let config = parse(&config_json("stats-cluster", 1024, &[]));
        let picker = ready_picker(&config, &mut rx, &mut controller, &mut policy);

        let p = pick(&picker).unwrap();
        let tracer = p.stream_tracer.unwrap();
        tracer.stream_started();
        tracer.stream_closed(&Status::ok(""));

        let p = pick(&picker).unwrap();
        let tracer = p.stream_tracer.unwrap();
        tracer.stream_started();
        tracer.stream_closed(&Status::unavailable("gone"));

        let stats = policy.locality_stats.get("east").unwrap();
        assert_eq!(stats.calls_started(), 2);
        assert_eq!(stats.calls_succeeded(), 1);
        assert_eq!(stats.calls_failed(), 1);
    }

    #[test]
    fn parse_config_rejects_excessive_drop_rate() {
        pick_first::reg();
        reg();
        let builder = GLOBAL_LB_REGISTRY.get_policy(POLICY_NAME).unwrap();
        assert!(
            builder
                .parse_config(&ParsedJsonLbConfig::new(serde_json::json!({
                    "cluster": "c",
                    "dropCategories": [{"category": "x", "requestsPerMille": 1001}],
                    "childPolicy": [{"pick_first": {}}],
                })))
                .is_err()
        );
    }
}
