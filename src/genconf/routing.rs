//! Outbound and routing-rule construction for the generated document.

use crate::config::{BalancerConfig, RoutingConfig, RoutingMode, WarpConfig};
use serde_json::{json, Value};
use std::collections::HashSet;

/// Tag of the internal management inbound/outbound pair.
pub const API_TAG: &str = "api";

/// The fixed head of the outbound list: direct, blocked, and the api
/// freedom outbound the management rule targets.
pub fn base_outbounds() -> Vec<Value> {
    vec![
        json!({
            "tag": "direct",
            "protocol": "freedom",
            "settings": {},
        }),
        json!({
            "tag": "blocked",
            "protocol": "blackhole",
            "settings": {},
        }),
        json!({
            "tag": API_TAG,
            "protocol": "freedom",
            "settings": {},
        }),
    ]
}

/// WARP outbound, when configured with a private key.
pub fn warp_outbound(warp: &WarpConfig) -> Option<Value> {
    if !warp.enabled || warp.private_key.is_empty() {
        return None;
    }
    Some(json!({
        "tag": "warp",
        "protocol": "wireguard",
        "settings": {
            "secretKey": warp.private_key,
            "address": ["172.16.0.2/32"],
            "peers": [{
                "publicKey": "bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=",
                "endpoint": warp.endpoint,
            }],
        },
    }))
}

/// The unconditional management rule. Always first.
pub fn api_rule() -> Value {
    json!({
        "type": "field",
        "inboundTag": [API_TAG],
        "outboundTag": API_TAG,
    })
}

/// Routing-profile rules derived from the smart-routing mode.
///
/// open emits nothing; filtered blocks private ranges and BitTorrent;
/// smart adds the domestic bypass on top; strict further blackholes ad
/// domains.
pub fn profile_rules(routing: &RoutingConfig) -> Vec<Value> {
    let mut rules = Vec::new();
    if routing.mode == RoutingMode::Open {
        return rules;
    }

    rules.push(json!({
        "type": "field",
        "ip": ["geoip:private"],
        "outboundTag": "blocked",
    }));
    rules.push(json!({
        "type": "field",
        "protocol": ["bittorrent"],
        "outboundTag": "blocked",
    }));

    if matches!(routing.mode, RoutingMode::Smart | RoutingMode::Strict) {
        if !routing.domestic_ips.is_empty() {
            let cidrs: Vec<String> = routing.domestic_ips.iter().map(|n| n.to_string()).collect();
            rules.push(json!({
                "type": "field",
                "ip": cidrs,
                "outboundTag": "direct",
            }));
        }
        if !routing.domestic_domains.is_empty() {
            rules.push(json!({
                "type": "field",
                "domain": routing.domestic_domains,
                "outboundTag": "direct",
            }));
        }
    }

    if routing.mode == RoutingMode::Strict {
        rules.push(json!({
            "type": "field",
            "domain": ["geosite:category-ads-all"],
            "outboundTag": "blocked",
        }));
    }

    rules
}

/// Catch-all rule steering unmatched traffic through the balancer.
pub fn balancer_rule(balancer: &BalancerConfig) -> Option<Value> {
    if !balancer.enabled {
        return None;
    }
    Some(json!({
        "type": "field",
        "network": "tcp,udp",
        "balancerTag": balancer.tag,
    }))
}

/// Balancer declarations placed inside the routing section.
pub fn balancers(balancer: &BalancerConfig) -> Option<Vec<Value>> {
    if !balancer.enabled {
        return None;
    }
    Some(vec![json!({
        "tag": balancer.tag,
        "selector": balancer.selector,
        "strategy": { "type": balancer.strategy },
    })])
}

/// Deduplicate rules by full-value fingerprint, preserving first-wins order.
pub fn dedup_rules(rules: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        let fingerprint = rule.to_string();
        if seen.insert(fingerprint) {
            out.push(rule);
        }
    }
    out
}
