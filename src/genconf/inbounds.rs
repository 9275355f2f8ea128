//! Per-protocol inbound emitters.
//!
//! One small registry keyed by protocol; each emitter turns a domain
//! [`Inbound`] plus its effective user set into the data plane's inbound
//! object. Emitters return `None` to skip the inbound entirely (credential
//! protocols with no users, WireGuard without key material, protocols the
//! generator does not shape).

use crate::config::DataPlaneConfig;
use crate::types::{is_ss2022_cipher, Inbound, Network, Protocol, Security, User};
use serde_json::{json, Value};
use tracing::debug;

/// Default SNI set for REALITY when none is configured.
const REALITY_DEFAULT_SERVER_NAMES: &[&str] = &["www.microsoft.com"];

/// VLESS flow variant forced under REALITY.
const VISION_FLOW: &str = "xtls-rprx-vision";

/// What one inbound contributes to the document.
pub struct Emitted {
    pub inbound: Value,
    /// WireGuard pairs the listener with an outbound of its own.
    pub outbound: Option<Value>,
    /// And a rule binding the listener to that outbound.
    pub routing_rule: Option<Value>,
}

impl Emitted {
    fn inbound_only(inbound: Value) -> Self {
        Self {
            inbound,
            outbound: None,
            routing_rule: None,
        }
    }
}

/// Emit the data-plane object for one enabled inbound, or `None` to skip.
pub fn emit(inbound: &Inbound, users: &[&User], dp: &DataPlaneConfig) -> Option<Emitted> {
    if inbound.protocol.requires_clients() && users.is_empty() {
        debug!(tag = %inbound.tag, "skipping inbound with no assigned users");
        return None;
    }
    // REALITY is a security variant of VLESS only.
    if inbound.security == Security::Reality && inbound.protocol != Protocol::Vless {
        debug!(tag = %inbound.tag, "skipping REALITY inbound on a non-VLESS protocol");
        return None;
    }

    match inbound.protocol {
        Protocol::Vless => Some(emit_vless(inbound, users, dp)),
        Protocol::Vmess => Some(emit_vmess(inbound, users, dp)),
        Protocol::Trojan => Some(emit_trojan(inbound, users, dp)),
        Protocol::Shadowsocks => Some(emit_shadowsocks(inbound, users, dp)),
        Protocol::Socks => Some(emit_socks(inbound, users)),
        Protocol::Http => Some(emit_http(inbound, users)),
        Protocol::DokodemoDoor => Some(emit_dokodemo(inbound)),
        Protocol::Wireguard => emit_wireguard(inbound),
        // No emitter for this protocol; the data plane is not handed a
        // half-shaped listener.
        other => {
            debug!(tag = %inbound.tag, protocol = other.wire_name(), "no emitter for protocol");
            None
        }
    }
}

fn base_inbound(inbound: &Inbound, protocol: &str, settings: Value, dp: &DataPlaneConfig) -> Value {
    let mut obj = json!({
        "tag": inbound.tag,
        "listen": "0.0.0.0",
        "port": inbound.port,
        "protocol": protocol,
        "settings": settings,
        "sniffing": {
            "enabled": true,
            "destOverride": ["http", "tls", "quic"],
        },
    });
    if let Some(stream) = stream_settings(inbound, dp) {
        obj["streamSettings"] = stream;
    }
    obj
}

/// Transport and security layers shared by the stream-based protocols.
fn stream_settings(inbound: &Inbound, dp: &DataPlaneConfig) -> Option<Value> {
    let mut stream = json!({
        "network": inbound.network.wire_name(),
    });

    match inbound.network {
        Network::Ws => {
            let mut ws = json!({
                "path": inbound.ws_path.clone().unwrap_or_else(|| "/".to_string()),
            });
            if let Some(host) = &inbound.ws_host {
                ws["headers"] = json!({ "Host": host });
            }
            stream["wsSettings"] = ws;
        }
        Network::Grpc => {
            stream["grpcSettings"] = json!({
                "serviceName": inbound.grpc_service_name.clone().unwrap_or_default(),
            });
        }
        Network::Httpupgrade => {
            stream["httpupgradeSettings"] = json!({
                "path": inbound.ws_path.clone().unwrap_or_else(|| "/".to_string()),
                "host": inbound.ws_host.clone().unwrap_or_default(),
            });
        }
        Network::Xhttp => {
            stream["xhttpSettings"] = json!({
                "mode": inbound.xhttp_mode.clone().unwrap_or_else(|| "auto".to_string()),
                "path": inbound.ws_path.clone().unwrap_or_else(|| "/".to_string()),
            });
        }
        Network::Tcp | Network::Http => {}
    }

    match inbound.security {
        Security::Tls => {
            let mut tls = json!({});
            if let Some(name) = &inbound.tls_server_name {
                tls["serverName"] = json!(name);
            }
            if let (Some(cert), Some(key)) = (&dp.tls_cert_file, &dp.tls_key_file) {
                tls["certificates"] = json!([{
                    "certificateFile": cert,
                    "keyFile": key,
                }]);
            }
            stream["security"] = json!("tls");
            stream["tlsSettings"] = tls;
        }
        Security::Reality => {
            let server_names = if inbound.reality_server_names.is_empty() {
                REALITY_DEFAULT_SERVER_NAMES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            } else {
                inbound.reality_server_names.clone()
            };
            // The data plane refuses a REALITY block with zero short-IDs.
            let short_ids = if inbound.reality_short_ids.is_empty() {
                vec![String::new()]
            } else {
                inbound.reality_short_ids.clone()
            };
            stream["security"] = json!("reality");
            stream["realitySettings"] = json!({
                "show": false,
                "dest": inbound
                    .reality_dest
                    .clone()
                    .unwrap_or_else(|| format!("{}:443", server_names[0])),
                "serverNames": server_names,
                "privateKey": inbound.reality_private_key.clone().unwrap_or_default(),
                "shortIds": short_ids,
            });
        }
        Security::None => {}
    }

    Some(stream)
}

fn emit_vless(inbound: &Inbound, users: &[&User], dp: &DataPlaneConfig) -> Emitted {
    // REALITY is a security variant of VLESS; the vision flow is forced.
    let flow = if inbound.security == Security::Reality {
        VISION_FLOW
    } else {
        ""
    };
    let clients: Vec<Value> = users
        .iter()
        .map(|u| {
            json!({
                "id": u.uuid,
                "email": u.email,
                "flow": flow,
            })
        })
        .collect();
    let settings = json!({
        "clients": clients,
        "decryption": "none",
        "fallbacks": inbound.fallbacks,
    });
    Emitted::inbound_only(base_inbound(inbound, "vless", settings, dp))
}

fn emit_vmess(inbound: &Inbound, users: &[&User], dp: &DataPlaneConfig) -> Emitted {
    let clients: Vec<Value> = users
        .iter()
        .map(|u| {
            json!({
                "id": u.uuid,
                "email": u.email,
            })
        })
        .collect();
    let settings = json!({ "clients": clients });
    Emitted::inbound_only(base_inbound(inbound, "vmess", settings, dp))
}

fn emit_trojan(inbound: &Inbound, users: &[&User], dp: &DataPlaneConfig) -> Emitted {
    let clients: Vec<Value> = users
        .iter()
        .map(|u| {
            json!({
                "password": u.password,
                "email": u.email,
            })
        })
        .collect();
    let settings = json!({
        "clients": clients,
        "fallbacks": inbound.fallbacks,
    });
    Emitted::inbound_only(base_inbound(inbound, "trojan", settings, dp))
}

fn emit_shadowsocks(inbound: &Inbound, users: &[&User], dp: &DataPlaneConfig) -> Emitted {
    let method = inbound
        .ss_method
        .clone()
        .unwrap_or_else(|| "aes-256-gcm".to_string());

    let settings = if is_ss2022_cipher(&method) {
        // SS2022 needs a server-level PSK; the first user's password serves.
        // Clients carry no per-client method in this family.
        let clients: Vec<Value> = users
            .iter()
            .map(|u| {
                json!({
                    "email": u.email,
                    "password": u.password,
                })
            })
            .collect();
        json!({
            "method": method,
            "password": users[0].password,
            "clients": clients,
            "network": "tcp,udp",
        })
    } else {
        let clients: Vec<Value> = users
            .iter()
            .map(|u| {
                json!({
                    "email": u.email,
                    "password": u.password,
                    "method": method,
                })
            })
            .collect();
        json!({
            "clients": clients,
            "network": "tcp,udp",
        })
    };
    Emitted::inbound_only(base_inbound(inbound, "shadowsocks", settings, dp))
}

fn emit_socks(inbound: &Inbound, users: &[&User]) -> Emitted {
    let settings = if users.is_empty() {
        json!({ "auth": "noauth", "udp": true })
    } else {
        let accounts: Vec<Value> = users
            .iter()
            .map(|u| json!({ "user": u.email, "pass": u.password }))
            .collect();
        json!({ "auth": "password", "accounts": accounts, "udp": true })
    };
    Emitted::inbound_only(json!({
        "tag": inbound.tag,
        "listen": "0.0.0.0",
        "port": inbound.port,
        "protocol": "socks",
        "settings": settings,
    }))
}

fn emit_http(inbound: &Inbound, users: &[&User]) -> Emitted {
    let mut settings = json!({});
    if !users.is_empty() {
        let accounts: Vec<Value> = users
            .iter()
            .map(|u| json!({ "user": u.email, "pass": u.password }))
            .collect();
        settings["accounts"] = json!(accounts);
    }
    Emitted::inbound_only(json!({
        "tag": inbound.tag,
        "listen": "0.0.0.0",
        "port": inbound.port,
        "protocol": "http",
        "settings": settings,
    }))
}

fn emit_dokodemo(inbound: &Inbound) -> Emitted {
    Emitted::inbound_only(json!({
        "tag": inbound.tag,
        "listen": "0.0.0.0",
        "port": inbound.port,
        "protocol": "dokodemo-door",
        "settings": {
            "address": inbound.dokodemo_target.clone().unwrap_or_default(),
            "port": inbound.dokodemo_port.unwrap_or(0),
            "network": "tcp,udp",
        },
    }))
}

/// WireGuard: a local SOCKS listener paired with a WireGuard outbound and
/// a routing rule binding them. Skipped wholesale when keys are missing.
fn emit_wireguard(inbound: &Inbound) -> Option<Emitted> {
    let private_key = inbound.wg_private_key.as_deref()?;
    let peer_public_key = inbound.wg_peer_public_key.as_deref()?;
    if private_key.is_empty() || peer_public_key.is_empty() {
        debug!(tag = %inbound.tag, "skipping wireguard inbound without key material");
        return None;
    }

    let out_tag = format!("wg-out-{}", inbound.tag);
    let listener = json!({
        "tag": inbound.tag,
        "listen": "127.0.0.1",
        "port": inbound.port,
        "protocol": "socks",
        "settings": { "auth": "noauth", "udp": true },
    });
    let outbound = json!({
        "tag": out_tag,
        "protocol": "wireguard",
        "settings": {
            "secretKey": private_key,
            "address": inbound.wg_addresses,
            "peers": [{
                "publicKey": peer_public_key,
                "endpoint": inbound.wg_endpoint.clone().unwrap_or_default(),
            }],
            "mtu": inbound.wg_mtu.unwrap_or(1420),
        },
    });
    let rule = json!({
        "type": "field",
        "inboundTag": [inbound.tag],
        "outboundTag": out_tag,
    });

    Some(Emitted {
        inbound: listener,
        outbound: Some(outbound),
        routing_rule: Some(rule),
    })
}
