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

//! Graceful switch-over between LB policies.
//!
//! When the channel's configured policy changes, the new policy is built
//! and fed updates while the old policy's picker keeps serving RPCs.  Only
//! once the new policy produces its first non-Connecting state — or the old
//! one stops being Ready — does the channel cut over, so a policy change
//! never opens a window in which picks fail needlessly.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyOptions, LbState, Subchannel, SubchannelState,
    WorkScheduler, WrappedController,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::LbPolicySelection;
use crate::rt::Runtime;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ChildKind {
    Current,
    Pending,
}

struct ChildPolicy {
    name: &'static str,
    policy: Box<dyn LbPolicy>,
    state: ConnectivityState,
    /// The pending child's most recent picker, withheld from the channel
    /// until the swap.
    cached_picker: Option<LbState>,
}

impl ChildPolicy {
    fn new(name: &'static str, policy: Box<dyn LbPolicy>) -> Self {
        Self {
            name,
            policy,
            state: ConnectivityState::Connecting,
            cached_picker: None,
        }
    }
}

/// The channel's top-level LB policy: delegates to the configured policy
/// and handles transitions between policies.
pub(crate) struct GracefulSwitchPolicy {
    current: Option<ChildPolicy>,
    pending: Option<ChildPolicy>,
    subchannel_to_child: HashMap<Subchannel, ChildKind>,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
}

impl GracefulSwitchPolicy {
    pub(crate) fn new(work_scheduler: Arc<dyn WorkScheduler>, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            current: None,
            pending: None,
            subchannel_to_child: HashMap::new(),
            work_scheduler,
            runtime,
        }
    }

    /// Forwards a resolver update to the policy selected by the service
    /// config, creating it first if the selected policy changed.
    pub(crate) fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        selection: &LbPolicySelection,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let target = self.prepare_child(selection);
        let mut wrapped = WrappedController::new(channel_controller);
        let result = self
            .child_mut(target)
            .expect("prepare_child always yields a child")
            .policy
            .resolver_update(update, selection.config.as_ref(), &mut wrapped);
        let (picker_update, created) = wrapped.into_parts();
        self.resolve_child_updates(picker_update, created, target, channel_controller);
        result
    }

    pub(crate) fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        // Notifications for subchannels of an already-discarded child are
        // stale and ignored.
        let Some(kind) = self.subchannel_to_child.get(subchannel).copied() else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        if let Some(child) = self.child_mut(kind) {
            child
                .policy
                .subchannel_update(subchannel, state, &mut wrapped);
        }
        let (picker_update, created) = wrapped.into_parts();
        self.resolve_child_updates(picker_update, created, kind, channel_controller);
    }

    pub(crate) fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        for kind in [ChildKind::Pending, ChildKind::Current] {
            let mut wrapped = WrappedController::new(channel_controller);
            match self.child_mut(kind) {
                Some(child) => child.policy.work(&mut wrapped),
                None => continue,
            }
            let (picker_update, created) = wrapped.into_parts();
            self.resolve_child_updates(picker_update, created, kind, channel_controller);
        }
    }

    pub(crate) fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        for kind in [ChildKind::Pending, ChildKind::Current] {
            let mut wrapped = WrappedController::new(channel_controller);
            match self.child_mut(kind) {
                Some(child) => child.policy.exit_idle(&mut wrapped),
                None => continue,
            }
            let (picker_update, created) = wrapped.into_parts();
            self.resolve_child_updates(picker_update, created, kind, channel_controller);
        }
    }

    fn child_mut(&mut self, kind: ChildKind) -> Option<&mut ChildPolicy> {
        match kind {
            ChildKind::Current => self.current.as_mut(),
            ChildKind::Pending => self.pending.as_mut(),
        }
    }

    /// Ensures a child exists for the selected policy and returns which
    /// slot updates should be routed to.
    fn prepare_child(&mut self, selection: &LbPolicySelection) -> ChildKind {
        let name = selection.builder.name();
        // The newest child is the routing target: the pending one if a
        // switch is in progress, otherwise the current one.
        if let Some(pending) = &self.pending {
            if pending.name == name {
                return ChildKind::Pending;
            }
            // Switching back to the policy that is still serving: discard
            // the half-switched pending policy.
            if self.current.as_ref().is_some_and(|c| c.name == name) {
                self.pending = None;
                self.subchannel_to_child
                    .retain(|_, kind| *kind == ChildKind::Current);
                return ChildKind::Current;
            }
        } else if let Some(current) = &self.current {
            if current.name == name {
                return ChildKind::Current;
            }
        }

        debug!("graceful switch: building LB policy {name}");
        let policy = selection.builder.build(LbPolicyOptions {
            work_scheduler: self.work_scheduler.clone(),
            runtime: self.runtime.clone(),
        });
        let child = ChildPolicy::new(name, policy);
        if self.current.is_none() {
            self.current = Some(child);
            ChildKind::Current
        } else {
            // Replacing an in-flight pending policy discards it, along
            // with any subchannels it created.
            if self.pending.take().is_some() {
                self.subchannel_to_child
                    .retain(|_, kind| *kind == ChildKind::Current);
            }
            self.pending = Some(child);
            ChildKind::Pending
        }
    }

    /// Applies whatever the child did through its wrapped controller:
    /// claims created subchannels, records its state, publishes or caches
    /// its picker, and performs the swap once its conditions hold.
    fn resolve_child_updates(
        &mut self,
        picker_update: Option<LbState>,
        created_subchannels: Vec<Subchannel>,
        kind: ChildKind,
        channel_controller: &mut dyn ChannelController,
    ) {
        for subchannel in created_subchannels {
            self.subchannel_to_child.insert(subchannel, kind);
        }
        if let Some(update) = picker_update {
            match kind {
                ChildKind::Current => {
                    let current = self.current.as_mut().unwrap();
                    current.state = update.connectivity_state;
                    channel_controller.update_picker(update);
                }
                ChildKind::Pending => {
                    let pending = self.pending.as_mut().unwrap();
                    pending.state = update.connectivity_state;
                    pending.cached_picker = Some(update);
                }
            }
        }
        if self.should_swap() {
            self.swap(channel_controller);
        }
    }

    /// The pending policy takes over once it has left Connecting (it has
    /// something real to report) or the current policy is no longer Ready
    /// (there is nothing worth protecting).
    fn should_swap(&self) -> bool {
        match (&self.current, &self.pending) {
            (Some(current), Some(pending)) => {
                current.state != ConnectivityState::Ready
                    || pending.state != ConnectivityState::Connecting
            }
            _ => false,
        }
    }

    fn swap(&mut self, channel_controller: &mut dyn ChannelController) {
        let mut promoted = self.pending.take().unwrap();
        debug!(
            "graceful switch: swapping from {:?} to {}",
            self.current.as_ref().map(|c| c.name),
            promoted.name
        );
        // Dropping the old policy drops its subchannel handles, which
        // shuts the subchannels down.
        self.current = None;
        self.subchannel_to_child
            .retain(|_, kind| *kind == ChildKind::Pending);
        for kind in self.subchannel_to_child.values_mut() {
            *kind = ChildKind::Current;
        }
        if let Some(picker) = promoted.cached_picker.take() {
            channel_controller.update_picker(picker);
        }
        self.current = Some(promoted);
    }
}
