//! Config generator: pure transformation from the domain model to the
//! data plane's config document.
//!
//! No I/O happens here; the caller reads the optional base template and
//! hands it in, and the apply engine owns all writes.

mod inbounds;
mod routing;

pub use inbounds::Emitted;
pub use routing::API_TAG;

use crate::config::{
    BalancerConfig, Config, DataPlaneConfig, ObservatoryConfig, RoutingConfig, WarpConfig,
};
use crate::store::{effective_user_inbounds, DomainSnapshot};
use crate::types::{User, UserStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from config generation.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything generation depends on, gathered by the caller.
pub struct GeneratorInputs<'a> {
    pub snapshot: &'a DomainSnapshot,
    pub data_plane: &'a DataPlaneConfig,
    pub routing: &'a RoutingConfig,
    pub observatory: &'a ObservatoryConfig,
    pub balancer: &'a BalancerConfig,
    pub warp: &'a WarpConfig,
    /// Parsed base template; contributes `log` defaults, `dns`, and extra
    /// base routing rules.
    pub base_template: Option<&'a Value>,
    /// Generation timestamp used for status derivation. Injected so that
    /// generation is a pure function of its inputs.
    pub now: DateTime<Utc>,
}

impl<'a> GeneratorInputs<'a> {
    pub fn from_config(
        snapshot: &'a DomainSnapshot,
        config: &'a Config,
        base_template: Option<&'a Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            snapshot,
            data_plane: &config.data_plane,
            routing: &config.routing,
            observatory: &config.observatory,
            balancer: &config.balancer,
            warp: &config.warp,
            base_template,
            now,
        }
    }
}

/// The canonical document. Field order here is the section order in the
/// rendered file.
#[derive(Debug, Clone, Serialize)]
pub struct DataPlaneDocument {
    pub log: Value,
    pub api: Value,
    pub stats: Value,
    pub policy: Value,
    pub inbounds: Vec<Value>,
    pub outbounds: Vec<Value>,
    pub routing: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observatory: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
}

/// A generated config plus its fragment decomposition.
#[derive(Debug, Clone)]
pub struct GeneratedConfig {
    pub document: DataPlaneDocument,
}

impl GeneratedConfig {
    /// Render the whole document: stable key order, 2-space indentation,
    /// trailing newline. Generating twice from unchanged state yields
    /// byte-identical output.
    pub fn render(&self) -> Result<String, GenerateError> {
        let mut rendered = serde_json::to_string_pretty(&self.document)?;
        rendered.push('\n');
        Ok(rendered)
    }

    /// Fragmented layout: the same payload split per section, named so the
    /// data plane's multi-file loader concatenates them in order.
    pub fn fragments(&self) -> Result<Vec<(String, String)>, GenerateError> {
        let mut files = vec![
            (
                "one-ui-00-log.json".to_string(),
                render_fragment(json!({ "log": self.document.log }))?,
            ),
            (
                "one-ui-10-api-policy.json".to_string(),
                render_fragment(json!({
                    "api": self.document.api,
                    "stats": self.document.stats,
                    "policy": self.document.policy,
                }))?,
            ),
            (
                "one-ui-20-inbounds.json".to_string(),
                render_fragment(json!({ "inbounds": self.document.inbounds }))?,
            ),
            (
                "one-ui-30-outbounds.json".to_string(),
                render_fragment(json!({ "outbounds": self.document.outbounds }))?,
            ),
            (
                "one-ui-40-routing.json".to_string(),
                render_fragment(json!({ "routing": self.document.routing }))?,
            ),
        ];
        if let Some(observatory) = &self.document.observatory {
            files.push((
                "one-ui-50-observatory.json".to_string(),
                render_fragment(json!({ "observatory": observatory }))?,
            ));
        }
        Ok(files)
    }
}

fn render_fragment(value: Value) -> Result<String, GenerateError> {
    let mut rendered = serde_json::to_string_pretty(&value)?;
    rendered.push('\n');
    Ok(rendered)
}

/// Effective user set per inbound id: ACTIVE users whose (possibly
/// group-derived) assignment is enabled, deduplicated by user id, in id
/// order.
fn users_by_inbound<'a>(
    snapshot: &'a DomainSnapshot,
    now: DateTime<Utc>,
) -> BTreeMap<i64, Vec<&'a User>> {
    let per_user = effective_user_inbounds(snapshot);
    let user_by_id: BTreeMap<i64, &User> = snapshot.users.iter().map(|u| (u.id, u)).collect();

    let mut result: BTreeMap<i64, Vec<&User>> = BTreeMap::new();
    for (user_id, assignments) in &per_user {
        let Some(user) = user_by_id.get(user_id) else {
            continue;
        };
        if user.effective_status(now) != UserStatus::Active {
            continue;
        }
        for assignment in assignments.iter().filter(|a| a.enabled) {
            result.entry(assignment.inbound_id).or_default().push(user);
        }
    }
    result
}

/// Generate the canonical document.
pub fn generate(inputs: &GeneratorInputs<'_>) -> Result<GeneratedConfig, GenerateError> {
    let dp = inputs.data_plane;
    let template = inputs.base_template;
    let assigned = users_by_inbound(inputs.snapshot, inputs.now);

    // Inbounds: the internal api dokodemo-door first, then the domain
    // inbounds in id order.
    let mut inbound_values = vec![json!({
        "tag": API_TAG,
        "listen": dp.api_listen.ip().to_string(),
        "port": dp.api_listen.port(),
        "protocol": "dokodemo-door",
        "settings": { "address": "127.0.0.1" },
    })];
    let mut wg_outbounds = Vec::new();
    let mut wg_rules = Vec::new();

    let mut domain_inbounds: Vec<_> = inputs.snapshot.inbounds.iter().collect();
    domain_inbounds.sort_by_key(|i| i.id);
    for inbound in domain_inbounds.into_iter().filter(|i| i.enabled) {
        let users = assigned.get(&inbound.id).cloned().unwrap_or_default();
        if let Some(emitted) = inbounds::emit(inbound, &users, dp) {
            inbound_values.push(emitted.inbound);
            if let Some(outbound) = emitted.outbound {
                wg_outbounds.push(outbound);
            }
            if let Some(rule) = emitted.routing_rule {
                wg_rules.push(rule);
            }
        }
    }

    // Outbounds: fixed head, then WireGuard pairs, then WARP.
    let mut outbounds = routing::base_outbounds();
    outbounds.extend(wg_outbounds);
    if let Some(warp) = routing::warp_outbound(inputs.warp) {
        outbounds.push(warp);
    }

    // Routing: the api rule is unconditionally first, then WireGuard
    // bindings, then profile rules, then base-template rules, then the
    // balancer catch-all.
    let mut rules = vec![routing::api_rule()];
    rules.extend(wg_rules);
    rules.extend(routing::profile_rules(inputs.routing));
    if let Some(base_rules) = template
        .and_then(|t| t.get("routing"))
        .and_then(|r| r.get("rules"))
        .and_then(|r| r.as_array())
    {
        rules.extend(base_rules.iter().cloned());
    }
    if let Some(rule) = routing::balancer_rule(inputs.balancer) {
        rules.push(rule);
    }
    let rules = routing::dedup_rules(rules);

    let mut routing_section = json!({
        "domainStrategy": "AsIs",
        "rules": rules,
    });
    if let Some(balancers) = routing::balancers(inputs.balancer) {
        routing_section["balancers"] = json!(balancers);
    }

    // Log: template defaults, data-plane level filled when absent.
    let mut log = template
        .and_then(|t| t.get("log"))
        .filter(|l| l.is_object())
        .cloned()
        .unwrap_or_else(|| json!({ "access": "none" }));
    if log.get("loglevel").is_none() {
        log["loglevel"] = json!(dp.log_level);
    }

    // Api services: StatsService plus configured extras, deduplicated.
    let mut services = vec!["StatsService".to_string()];
    for extra in &dp.api_services {
        if !services.contains(extra) {
            services.push(extra.clone());
        }
    }

    let observatory = if inputs.observatory.enabled {
        let selector = if inputs.balancer.selector.is_empty() {
            vec!["direct".to_string()]
        } else {
            inputs.balancer.selector.clone()
        };
        Some(json!({
            "subjectSelector": selector,
            "probeUrl": inputs.observatory.probe_url,
            "probeInterval": inputs.observatory.probe_interval,
        }))
    } else {
        None
    };

    let document = DataPlaneDocument {
        log,
        api: json!({
            "tag": API_TAG,
            "services": services,
        }),
        stats: json!({}),
        policy: json!({
            "levels": {
                "0": {
                    "statsUserUplink": true,
                    "statsUserDownlink": true,
                }
            },
            "system": {
                "statsInboundUplink": true,
                "statsInboundDownlink": true,
                "statsOutboundUplink": true,
                "statsOutboundDownlink": true,
            },
        }),
        inbounds: inbound_values,
        outbounds,
        routing: routing_section,
        observatory,
        dns: template.and_then(|t| t.get("dns")).cloned(),
    };

    Ok(GeneratedConfig { document })
}
