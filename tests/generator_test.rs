//! Config generator invariants over realistic domain snapshots.

mod common;

use common::{test_inbound, test_user};
use oneui::config::Config;
use oneui::genconf::{generate, GeneratorInputs};
use oneui::store::DomainSnapshot;
use oneui::types::{
    Group, GroupInbound, Inbound, Network, Protocol, Security, UserGroup, UserInbound,
};

fn snapshot() -> DomainSnapshot {
    DomainSnapshot {
        users: vec![test_user(1, "a@x.com"), test_user(2, "b@x.com")],
        inbounds: vec![
            test_inbound(10, "vless-in", Protocol::Vless),
            test_inbound(11, "trojan-in", Protocol::Trojan),
            test_inbound(12, "socks-in", Protocol::Socks),
        ],
        user_inbounds: vec![
            UserInbound {
                user_id: 1,
                inbound_id: 10,
                enabled: true,
                priority: 1,
            },
            UserInbound {
                user_id: 2,
                inbound_id: 10,
                enabled: true,
                priority: 2,
            },
        ],
        ..Default::default()
    }
}

fn generate_doc(snapshot: &DomainSnapshot, config: &Config) -> serde_json::Value {
    let generated = generate(&GeneratorInputs::from_config(
        snapshot,
        config,
        None,
        chrono::Utc::now(),
    ))
    .unwrap();
    serde_json::from_str(&generated.render().unwrap()).unwrap()
}

#[test]
fn test_document_sections_present() {
    let doc = generate_doc(&snapshot(), &Config::default());
    for key in ["log", "api", "stats", "policy", "inbounds", "outbounds", "routing"] {
        assert!(doc.get(key).is_some(), "missing section {key}");
    }
    assert_eq!(doc["api"]["tag"], "api");
    assert_eq!(doc["api"]["services"][0], "StatsService");
    assert_eq!(doc["policy"]["levels"]["0"]["statsUserUplink"], true);
    assert_eq!(doc["policy"]["system"]["statsInboundDownlink"], true);
}

#[test]
fn test_exactly_one_api_outbound_and_leading_api_rule() {
    let mut config = Config::default();
    config.balancer.enabled = true;
    config.balancer.selector = vec!["direct".into()];
    let doc = generate_doc(&snapshot(), &config);

    let api_outbounds = doc["outbounds"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|o| o["tag"] == "api")
        .count();
    assert_eq!(api_outbounds, 1);

    let rules = doc["routing"]["rules"].as_array().unwrap();
    let api_rules: Vec<usize> = rules
        .iter()
        .enumerate()
        .filter(|(_, r)| r["outboundTag"] == "api")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(api_rules, vec![0], "single api rule, first");

    // The api rule precedes every balancer rule.
    let balancer_positions: Vec<usize> = rules
        .iter()
        .enumerate()
        .filter(|(_, r)| !r["balancerTag"].is_null())
        .map(|(i, _)| i)
        .collect();
    assert!(!balancer_positions.is_empty());
    assert!(balancer_positions.iter().all(|i| *i > 0));
}

#[test]
fn test_credential_inbounds_with_users_have_clients() {
    let doc = generate_doc(&snapshot(), &Config::default());
    let inbounds = doc["inbounds"].as_array().unwrap();

    // vless-in has two assigned users; trojan-in has none and is omitted;
    // socks-in needs no clients and survives.
    let tags: Vec<&str> = inbounds.iter().filter_map(|i| i["tag"].as_str()).collect();
    assert!(tags.contains(&"api"));
    assert!(tags.contains(&"vless-in"));
    assert!(tags.contains(&"socks-in"));
    assert!(!tags.contains(&"trojan-in"));

    let vless = inbounds.iter().find(|i| i["tag"] == "vless-in").unwrap();
    assert!(!vless["settings"]["clients"].as_array().unwrap().is_empty());
}

#[test]
fn test_group_expansion_fills_gaps_direct_wins() {
    let mut snapshot = snapshot();
    snapshot.groups.push(Group {
        id: 100,
        name: "premium".into(),
        enabled: true,
    });
    // Group grants trojan-in to both members; user 1 also has a direct,
    // disabled trojan-in link that must win.
    snapshot.group_inbounds.push(GroupInbound {
        group_id: 100,
        inbound_id: 11,
        enabled: true,
        priority: 3,
    });
    snapshot.user_groups.push(UserGroup {
        user_id: 1,
        group_id: 100,
    });
    snapshot.user_groups.push(UserGroup {
        user_id: 2,
        group_id: 100,
    });
    snapshot.user_inbounds.push(UserInbound {
        user_id: 1,
        inbound_id: 11,
        enabled: false,
        priority: 1,
    });

    let doc = generate_doc(&snapshot, &Config::default());
    let trojan = doc["inbounds"]
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["tag"] == "trojan-in")
        .expect("group expansion must emit trojan-in");

    // Only user 2 remains: user 1's direct disabled link overrides the group.
    let clients = trojan["settings"]["clients"].as_array().unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0]["email"], "b@x.com");
}

#[test]
fn test_round_trip_idempotence() {
    let snapshot = snapshot();
    let config = Config::default();
    let now = chrono::Utc::now();

    let first = generate(&GeneratorInputs::from_config(&snapshot, &config, None, now))
        .unwrap()
        .render()
        .unwrap();
    let second = generate(&GeneratorInputs::from_config(&snapshot, &config, None, now))
        .unwrap()
        .render()
        .unwrap();
    assert_eq!(first, second, "unchanged state generates identical bytes");

    // And the output parses back to an equivalent document.
    let parsed: serde_json::Value = serde_json::from_str(&first).unwrap();
    let reserialized = serde_json::to_string_pretty(&parsed).unwrap() + "\n";
    assert_eq!(first, reserialized);
}

#[test]
fn test_warp_and_wireguard_outbound_order() {
    let mut snapshot = snapshot();
    let mut wg = Inbound::new(
        13,
        "wg-in",
        Protocol::Wireguard,
        Network::Tcp,
        Security::None,
        2080,
    );
    wg.wg_private_key = Some("sk".into());
    wg.wg_peer_public_key = Some("pk".into());
    snapshot.inbounds.push(wg);

    let mut config = Config::default();
    config.warp.enabled = true;
    config.warp.private_key = "warp-sk".into();

    let doc = generate_doc(&snapshot, &config);
    let tags: Vec<&str> = doc["outbounds"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|o| o["tag"].as_str())
        .collect();
    // Fixed head, then the WireGuard pair, then WARP.
    assert_eq!(tags, vec!["direct", "blocked", "api", "wg-out-wg-in", "warp"]);
}

#[test]
fn test_smart_routing_rules_emitted_in_order() {
    let mut config = Config::default();
    config.routing.domestic_ips = vec!["10.10.0.0/16".parse().unwrap()];
    config.routing.domestic_domains = vec!["example.ir".into()];

    let doc = generate_doc(&snapshot(), &config);
    let rules = doc["routing"]["rules"].as_array().unwrap();

    let idx_private = rules
        .iter()
        .position(|r| r["ip"].as_array().map(|a| a[0] == "geoip:private").unwrap_or(false))
        .unwrap();
    let idx_bt = rules
        .iter()
        .position(|r| r["protocol"].as_array().map(|a| a[0] == "bittorrent").unwrap_or(false))
        .unwrap();
    let idx_bypass = rules
        .iter()
        .position(|r| r["ip"].as_array().map(|a| a[0] == "10.10.0.0/16").unwrap_or(false))
        .unwrap();
    assert!(idx_private < idx_bt);
    assert!(idx_bt < idx_bypass);
}
