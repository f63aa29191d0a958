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

//! The priority LB policy.
//!
//! Serves from the highest-priority child that is usable, activating lower
//! priorities only when the ones above them fail.  A failover timer bounds
//! how long a priority may sit in Connecting before the next one is tried;
//! a priority that reports TransientFailure is skipped immediately.  When a
//! higher priority recovers, traffic reverts to it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, ParsedJsonLbConfig, Subchannel, SubchannelState, WorkScheduler,
    WrappedController,
};
use crate::client::name_resolution::{Endpoint, ResolverUpdate};
use crate::client::service_config::ChildPolicyConfig;
use crate::rt::{Runtime, TaskHandle};

pub static POLICY_NAME: &str = "priority";

/// The default bound on how long a priority may stay in Connecting before
/// the next priority is tried.
const DEFAULT_FAILOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Names the priority an endpoint belongs to.  Set as an endpoint attribute
/// by whoever produced the endpoint list, typically the cluster_resolver
/// policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriorityName(pub String);

/// Registers priority with the global LB policy registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PriorityPolicy {
            priorities: vec![],
            failover_timeout: DEFAULT_FAILOVER_TIMEOUT,
            children: BTreeMap::new(),
            child_configs: BTreeMap::new(),
            latest_updates: HashMap::new(),
            shared_attributes: Default::default(),
            subchannel_to_child: HashMap::new(),
            expired_failovers: Arc::new(Mutex::new(HashSet::new())),
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
        let json: PriorityConfigJson = config.convert_to()?;
        if json.priorities.is_empty() {
            return Err("priority config lists no priorities".into());
        }
        let mut children = BTreeMap::new();
        for name in &json.priorities {
            let Some(child) = json.children.get(name) else {
                return Err(format!("priority {name} has no child config").into());
            };
            children.insert(name.clone(), ChildPolicyConfig::parse(&child.config)?);
        }
        Ok(Some(LbConfig::new(PriorityConfig {
            priorities: json.priorities,
            children,
            failover_timeout: Duration::from_secs_f64(json.failover_timeout_seconds),
        })))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriorityConfigJson {
    priorities: Vec<String>,
    children: HashMap<String, PriorityChildJson>,
    #[serde(default = "default_failover_timeout_seconds")]
    failover_timeout_seconds: f64,
}

fn default_failover_timeout_seconds() -> f64 {
    DEFAULT_FAILOVER_TIMEOUT.as_secs_f64()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriorityChildJson {
    config: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PriorityConfig {
    pub(crate) priorities: Vec<String>,
    pub(crate) children: BTreeMap<String, ChildPolicyConfig>,
    pub(crate) failover_timeout: Duration,
}

struct ChildState {
    child_policy: ChildPolicyConfig,
    policy: Box<dyn LbPolicy>,
    state: LbState,
    failover_timer: Option<Box<dyn TaskHandle>>,
    /// True once this priority's failover timer expired or it reported
    /// TransientFailure; cleared when it becomes Ready.
    failed_over: bool,
}

impl ChildState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.failover_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ChildState {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

struct PriorityPolicy {
    priorities: Vec<String>,
    failover_timeout: Duration,
    /// Activated priorities only; lower priorities are built on demand.
    children: BTreeMap<String, ChildState>,
    /// The child policy configured for each priority.
    child_configs: BTreeMap<String, ChildPolicyConfig>,
    /// The per-priority slice of the most recent resolver update.
    latest_updates: HashMap<String, Vec<Endpoint>>,
    shared_attributes: crate::attributes::Attributes,
    subchannel_to_child: HashMap<Subchannel, String>,
    /// Failover timers that fired; drained in work().
    expired_failovers: Arc<Mutex<HashSet<String>>>,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
}

impl LbPolicy for PriorityPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let config: &PriorityConfig = config
            .ok_or("priority requires a configuration")?
            .convert_to()?;

        match &update.endpoints {
            Ok(endpoints) => {
                self.latest_updates = shard_endpoints_by_priority(endpoints);
                self.shared_attributes = update.attributes.clone();
            }
            Err(error) => {
                // Forward the error to the activated children and let them
                // decide what survives.
                let error = error.clone();
                let names: Vec<String> = self.children.keys().cloned().collect();
                for name in names {
                    let child_update = ResolverUpdate {
                        endpoints: Err(error.clone()),
                        ..Default::default()
                    };
                    self.forward_to_child(&name, child_update, channel_controller);
                }
                self.settle(channel_controller);
                return Ok(());
            }
        }

        self.priorities = config.priorities.clone();
        self.failover_timeout = config.failover_timeout;

        // Drop children for delisted priorities and rebuild those whose
        // child policy changed.
        let configs = config.children.clone();
        let stale: Vec<String> = self
            .children
            .iter()
            .filter(|(name, child)| {
                configs.get(*name) != Some(&child.child_policy)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            debug!("priority: discarding child {name}");
            self.children.remove(&name);
            self.subchannel_to_child.retain(|_, child| *child != name);
        }

        // Refresh already-activated children with their endpoint slice.
        let names: Vec<String> = self.children.keys().cloned().collect();
        for name in names {
            let child_update = self.child_update_for(&name);
            self.forward_to_child(&name, child_update, channel_controller);
        }
        self.child_configs = configs;
        self.settle(channel_controller);
        Ok(())
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
        if let Some(child) = self.children.get_mut(&name) {
            let mut wrapped = WrappedController::new(channel_controller);
            child
                .policy
                .subchannel_update(subchannel, state, &mut wrapped);
            self.absorb_child_updates(&name, wrapped);
        }
        self.settle(channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let expired: Vec<String> = self.expired_failovers.lock().unwrap().drain().collect();
        for name in expired {
            if let Some(child) = self.children.get_mut(&name) {
                debug!("priority: failover timer expired for {name}");
                child.failed_over = true;
                child.cancel_timer();
            }
        }
        let names: Vec<String> = self.children.keys().cloned().collect();
        for name in names {
            let mut wrapped = WrappedController::new(channel_controller);
            self.children
                .get_mut(&name)
                .unwrap()
                .policy
                .work(&mut wrapped);
            self.absorb_child_updates(&name, wrapped);
        }
        self.settle(channel_controller);
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
            self.absorb_child_updates(&name, wrapped);
        }
        self.settle(channel_controller);
    }
}

impl PriorityPolicy {
    fn child_update_for(&self, name: &str) -> ResolverUpdate {
        ResolverUpdate {
            attributes: self.shared_attributes.clone(),
            endpoints: Ok(self.latest_updates.get(name).cloned().unwrap_or_default()),
            service_config: Ok(None),
            resolution_note: None,
        }
    }

    /// Builds the child for a priority and delivers its current endpoint
    /// slice.
    fn activate_child(&mut self, name: &str, channel_controller: &mut dyn ChannelController) {
        let Some(child_policy) = self.child_configs.get(name).cloned() else {
            return;
        };
        debug!("priority: activating child {name}");
        let policy = child_policy.selection.builder.build(LbPolicyOptions {
            work_scheduler: self.work_scheduler.clone(),
            runtime: self.runtime.clone(),
        });
        self.children.insert(
            name.to_string(),
            ChildState {
                child_policy,
                policy,
                state: LbState::initial(),
                failover_timer: None,
                failed_over: false,
            },
        );
        let child_update = self.child_update_for(name);
        self.forward_to_child(name, child_update, channel_controller);
    }

    fn forward_to_child(
        &mut self,
        name: &str,
        update: ResolverUpdate,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(child) = self.children.get_mut(name) else {
            return;
        };
        let config = child.child_policy.selection.config.clone();
        let mut wrapped = WrappedController::new(channel_controller);
        if let Err(err) = child
            .policy
            .resolver_update(update, config.as_ref(), &mut wrapped)
        {
            debug!("priority: child {name} rejected update: {err}");
        }
        self.absorb_child_updates(name, wrapped);
    }

    fn absorb_child_updates(&mut self, name: &str, wrapped: WrappedController) {
        let WrappedController {
            picker_update,
            created_subchannels,
            ..
        } = wrapped;
        for subchannel in created_subchannels {
            self.subchannel_to_child
                .insert(subchannel, name.to_string());
        }
        if let Some(update) = picker_update {
            if let Some(child) = self.children.get_mut(name) {
                match update.connectivity_state {
                    ConnectivityState::Ready | ConnectivityState::Idle => {
                        child.failed_over = false;
                        child.cancel_timer();
                    }
                    ConnectivityState::TransientFailure => {
                        child.failed_over = true;
                        child.cancel_timer();
                    }
                    _ => {}
                }
                child.state = update;
            }
        }
    }

    /// Walks the priority list, activating children as needed, and
    /// publishes the picker of the first usable priority.  A priority in
    /// Connecting is given its failover window before the walk proceeds
    /// past it.
    fn settle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.priorities.is_empty() {
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(Failing {
                    error: "priority policy has no priorities configured".to_string(),
                }),
            });
            return;
        }
        let priorities = self.priorities.clone();
        for name in &priorities {
            if !self.children.contains_key(name) {
                self.activate_child(name, channel_controller);
            }
            let Some(child) = self.children.get_mut(name) else {
                continue;
            };
            match child.state.connectivity_state {
                ConnectivityState::Ready => {
                    child.cancel_timer();
                    channel_controller.update_picker(child.state.clone());
                    return;
                }
                ConnectivityState::Connecting | ConnectivityState::Idle if !child.failed_over => {
                    self.ensure_failover_timer(name);
                    let state = self.children.get(name).unwrap().state.clone();
                    channel_controller.update_picker(state);
                    return;
                }
                // Failed or timed out: fall through to the next priority.
                _ => {}
            }
        }
        // Every priority failed.  Serve the last one's picker so its error
        // detail reaches callers, and let re-resolution recover us.
        let last = priorities.last().unwrap();
        if let Some(child) = self.children.get(last) {
            channel_controller.update_picker(child.state.clone());
        }
        channel_controller.request_resolution();
    }

    fn ensure_failover_timer(&mut self, name: &str) {
        let timeout = self.failover_timeout;
        let Some(child) = self.children.get_mut(name) else {
            return;
        };
        if child.failover_timer.is_some() {
            return;
        }
        let expired = self.expired_failovers.clone();
        let scheduler = self.work_scheduler.clone();
        let child_name = name.to_string();
        let sleep = self.runtime.sleep(timeout);
        let timer = self.runtime.spawn(Box::pin(async move {
            sleep.await;
            expired.lock().unwrap().insert(child_name);
            scheduler.schedule_work();
        }));
        child.failover_timer = Some(timer);
    }
}

/// Splits endpoints by their PriorityName attribute.  Endpoints without a
/// priority cannot be attributed to a child and are dropped.
fn shard_endpoints_by_priority(endpoints: &[Endpoint]) -> HashMap<String, Vec<Endpoint>> {
    let mut sharded: HashMap<String, Vec<Endpoint>> = HashMap::new();
    for endpoint in endpoints {
        match endpoint.attributes.get::<PriorityName>() {
            Some(PriorityName(name)) => {
                sharded.entry(name.clone()).or_default().push(endpoint.clone());
            }
            None => debug!("priority: dropping endpoint without a priority"),
        }
    }
    sharded
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::load_balancing::test_utils::{
        addr, failure_state, last_picker, next_subchannel, pick_subchannel, setup,
        update_with_endpoints, TestEvent,
    };
    use crate::client::load_balancing::pick_first;
    use std::time::Duration;

    fn config_json(priorities: &[&str], failover_seconds: f64) -> ParsedJsonLbConfig {
        let children: serde_json::Map<String, serde_json::Value> = priorities
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    serde_json::json!({"config": [{"pick_first": {}}]}),
                )
            })
            .collect();
        ParsedJsonLbConfig::new(serde_json::json!({
            "priorities": priorities,
            "children": children,
            "failoverTimeoutSeconds": failover_seconds,
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

    fn priority_endpoint(address: &str, priority: &str) -> Endpoint {
        let mut endpoint = Endpoint::new(vec![addr(address)]);
        endpoint.attributes = endpoint
            .attributes
            .add(PriorityName(priority.to_string()));
        endpoint
    }

    fn new_policy(options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        reg();
        GLOBAL_LB_REGISTRY
            .get_policy(POLICY_NAME)
            .unwrap()
            .build(options)
    }

    #[test]
    fn parse_config_requires_children_for_all_priorities() {
        pick_first::reg();
        reg();
        let builder = GLOBAL_LB_REGISTRY.get_policy(POLICY_NAME).unwrap();
        assert!(
            builder
                .parse_config(&ParsedJsonLbConfig::new(serde_json::json!({
                    "priorities": ["p0"],
                    "children": {},
                })))
                .is_err()
        );
        assert!(
            builder
                .parse_config(&ParsedJsonLbConfig::new(serde_json::json!({
                    "priorities": [],
                    "children": {},
                })))
                .is_err()
        );
    }

    #[tokio::test]
    async fn only_highest_priority_is_activated_initially() {
        let (mut rx, mut controller, options) = setup();
        let mut policy = new_policy(options);
        let config = parse(&config_json(&["p0", "p1"], 10.0));

        policy
            .resolver_update(
                update_with_endpoints(vec![
                    priority_endpoint("a:443", "p0"),
                    priority_endpoint("b:443", "p1"),
                ]),
                Some(&config),
                &mut controller,
            )
            .unwrap();
        let sc_p0 = next_subchannel(&mut rx);
        assert_eq!(sc_p0.addresses()[0].address, "a:443");
        // p1 must not have been touched.
        let picker = last_picker(&mut rx);
        assert_eq!(picker.connectivity_state, ConnectivityState::Connecting);
    }

    #[tokio::test]
    async fn failure_of_p0_activates_and_serves_p1_then_reverts() {
        let (mut rx, mut controller, options) = setup();
        let mut policy = new_policy(options);
        let config = parse(&config_json(&["p0", "p1"], 10.0));

        policy
            .resolver_update(
                update_with_endpoints(vec![
                    priority_endpoint("a:443", "p0"),
                    priority_endpoint("b:443", "p1"),
                ]),
                Some(&config),
                &mut controller,
            )
            .unwrap();
        let sc_p0 = next_subchannel(&mut rx);
        let _ = last_picker(&mut rx);

        // p0 fails: p1 is activated within the same settling pass.
        policy.subchannel_update(&sc_p0, &failure_state("p0 down"), &mut controller);
        let sc_p1 = next_subchannel(&mut rx);
        assert_eq!(sc_p1.addresses()[0].address, "b:443");
        policy.subchannel_update(
            &sc_p1,
            &SubchannelState::new(ConnectivityState::Ready),
            &mut controller,
        );
        let picker = last_picker(&mut rx);
        assert_eq!(picker.connectivity_state, ConnectivityState::Ready);
        assert_eq!(pick_subchannel(&picker), sc_p1);

        // p0 recovers: traffic reverts to it.
        policy.subchannel_update(
            &sc_p0,
            &SubchannelState::new(ConnectivityState::Ready),
            &mut controller,
        );
        let picker = last_picker(&mut rx);
        assert_eq!(picker.connectivity_state, ConnectivityState::Ready);
        assert_eq!(pick_subchannel(&picker), sc_p0);
    }

    #[tokio::test]
    async fn failover_timer_bounds_connecting_priority() {
        let (mut rx, mut controller, options) = setup();
        let mut policy = new_policy(options);
        // Effectively immediate failover.
        let config = parse(&config_json(&["p0", "p1"], 0.001));

        policy
            .resolver_update(
                update_with_endpoints(vec![
                    priority_endpoint("a:443", "p0"),
                    priority_endpoint("b:443", "p1"),
                ]),
                Some(&config),
                &mut controller,
            )
            .unwrap();
        let sc_p0 = next_subchannel(&mut rx);
        // p0 sits in Connecting without resolving.
        policy.subchannel_update(
            &sc_p0,
            &SubchannelState::new(ConnectivityState::Connecting),
            &mut controller,
        );

        // The timer fires and requests work.
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for the failover timer")
                .unwrap();
            if matches!(event, TestEvent::WorkScheduled) {
                break;
            }
        }
        policy.work(&mut controller);
        // p1 gets activated by the post-expiry settling pass.
        let sc_p1 = loop {
            match rx.try_recv() {
                Ok(TestEvent::NewSubchannel(sc)) => break sc,
                Ok(_) => continue,
                Err(_) => panic!("expected p1 to be activated"),
            }
        };
        assert_eq!(sc_p1.addresses()[0].address, "b:443");
    }
}
