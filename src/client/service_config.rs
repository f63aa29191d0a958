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

//! Service config handling.
//!
//! A service config is a JSON document, typically delivered by the name
//! resolver, that configures the channel's behavior for a service.  The
//! part relevant to this crate is the `loadBalancingConfig` list, which
//! selects and configures the channel's LB policy.

use std::fmt::Debug;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::client::load_balancing::{
    GLOBAL_LB_REGISTRY, LbConfig, LbPolicyBuilder, ParsedJsonLbConfig,
};

/// One registered, successfully parsed LB policy choice.
#[derive(Clone)]
pub struct LbPolicySelection {
    pub builder: Arc<dyn LbPolicyBuilder>,
    pub config: Option<LbConfig>,
}

impl Debug for LbPolicySelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LbPolicySelection({})", self.builder.name())
    }
}

/// The parsed form of a service config.
#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    /// The LB policy selected from the config's loadBalancingConfig list,
    /// if the config contained one.
    pub(crate) lb_policy: Option<LbPolicySelection>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceConfigJson {
    #[serde(default)]
    load_balancing_config: Vec<serde_json::Map<String, Value>>,
}

impl ServiceConfig {
    /// Parses a service config JSON document.
    ///
    /// If a `loadBalancingConfig` list is present, the first entry whose
    /// policy name is registered and whose configuration parses wins.  An
    /// entry that is registered but fails to parse falls through to the
    /// next entry.  A non-empty list in which no entry is usable is a
    /// config error.
    pub fn parse(config_json: &str) -> Result<ServiceConfig, String> {
        let parsed: ServiceConfigJson = serde_json::from_str(config_json)
            .map_err(|err| format!("invalid service config JSON: {err}"))?;
        if parsed.load_balancing_config.is_empty() {
            return Ok(ServiceConfig { lb_policy: None });
        }
        let lb_policy = select_lb_policy(&parsed.load_balancing_config)?;
        Ok(ServiceConfig {
            lb_policy: Some(lb_policy),
        })
    }
}

/// Selects an LB policy from a loadBalancingConfig-style list: each entry
/// is a single-element object mapping a policy name to its configuration.
/// Also used for the `childPolicy` fields of the policies that delegate to
/// other policies.
pub(crate) fn select_lb_policy(
    entries: &[serde_json::Map<String, Value>],
) -> Result<LbPolicySelection, String> {
    for entry in entries {
        if entry.len() != 1 {
            return Err(format!(
                "load balancing config entries must contain exactly one policy, found {}",
                entry.len()
            ));
        }
        let (name, value) = entry.iter().next().unwrap();
        let Some(builder) = GLOBAL_LB_REGISTRY.get_policy(name) else {
            continue;
        };
        match builder.parse_config(&ParsedJsonLbConfig::new(value.clone())) {
            Ok(config) => {
                return Ok(LbPolicySelection { builder, config });
            }
            Err(err) => {
                // A registered policy with an unusable config falls through
                // to the next candidate.
                debug!("failed to parse config for LB policy {name}: {err}");
            }
        }
    }
    Err("no registered and parseable entry in load balancing config".to_string())
}

/// Convenience for policies whose configs embed a child policy list.
pub(crate) fn select_child_policy(
    entries: &[serde_json::Map<String, Value>],
) -> Result<LbPolicySelection, String> {
    if entries.is_empty() {
        return Err("child policy list is empty".to_string());
    }
    select_lb_policy(entries)
}

/// Wraps a parsed child policy selection so that configs holding one can be
/// compared structurally: two selections are equal if they name the same
/// policy and were parsed from identical JSON.
#[derive(Clone)]
pub(crate) struct ChildPolicyConfig {
    pub(crate) selection: LbPolicySelection,
    pub(crate) raw: Vec<serde_json::Map<String, Value>>,
}

impl ChildPolicyConfig {
    pub(crate) fn parse(raw: &[serde_json::Map<String, Value>]) -> Result<Self, String> {
        Ok(Self {
            selection: select_child_policy(raw)?,
            raw: raw.to_vec(),
        })
    }
}

impl Debug for ChildPolicyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChildPolicyConfig({})", self.selection.builder.name())
    }
}

impl PartialEq for ChildPolicyConfig {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ChildPolicyConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::load_balancing::{pick_first, round_robin};

    #[test]
    fn absent_lb_config_selects_nothing() {
        let sc = ServiceConfig::parse("{}").unwrap();
        assert!(sc.lb_policy.is_none());
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(ServiceConfig::parse("not json").is_err());
    }

    #[test]
    fn first_registered_policy_wins() {
        pick_first::reg();
        round_robin::reg();
        let sc = ServiceConfig::parse(
            r#"{"loadBalancingConfig": [
                {"no_such_policy": {}},
                {"round_robin": {}},
                {"pick_first": {}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(sc.lb_policy.unwrap().builder.name(), "round_robin");
    }

    #[test]
    fn unparseable_entry_falls_through() {
        pick_first::reg();
        // shuffleAddressList must be a bool; the bad entry is skipped in
        // favor of the later valid one.
        let sc = ServiceConfig::parse(
            r#"{"loadBalancingConfig": [
                {"pick_first": {"shuffleAddressList": "yes"}},
                {"pick_first": {"shuffleAddressList": true}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(sc.lb_policy.unwrap().builder.name(), "pick_first");
    }

    #[test]
    fn nothing_usable_is_an_error() {
        let result = ServiceConfig::parse(r#"{"loadBalancingConfig": [{"no_such_policy": {}}]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn multi_key_entry_is_an_error() {
        pick_first::reg();
        let result = ServiceConfig::parse(
            r#"{"loadBalancingConfig": [{"pick_first": {}, "round_robin": {}}]}"#,
        );
        assert!(result.is_err());
    }
}
