//! Share links: protocol URIs end users import into their clients.
//!
//! Links are rendered from the inbound's transport settings, including the
//! panel-only parts (`realitySettings.settings`, `tlsSettings.settings`,
//! `externalProxy`) that the assembler strips from the Xray config.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::Serialize;
use serde_json::{Value, json};
use url::Url;

use super::client::{Client, InboundSettings};
use super::inbound::{Inbound, Protocol};
use crate::error::PanelError;

/// A rendered share link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct ShareLink {
    /// Protocol name (`vless`, `vmess`, ...).
    pub link_type: String,
    /// Display name embedded in the link.
    pub remark: String,
    /// The URI.
    pub link: String,
}

/// Where a link points: the inbound itself or one external proxy.
#[derive(Debug, Clone)]
struct Endpoint {
    address: String,
    port: u16,
    remark: String,
    /// `same`, `tls` or `none`.
    force_tls: String,
}

/// Transport parameters shared by every link format.
#[derive(Debug, Clone, Default)]
struct Transport {
    network: String,
    security: String,
    header_type: String,
    path: String,
    host: String,
    service_name: String,
    mode: String,
    sni: String,
    alpn: String,
    fingerprint: String,
    public_key: String,
    short_id: String,
    spider_x: String,
}

/// Renders every share link for `client` on `inbound`.
///
/// `address` is used when the inbound listens on all interfaces. One link is
/// produced per external proxy, or a single link when none is configured.
///
/// # Errors
///
/// Returns [`PanelError::InvalidInbound`] for protocols without share links
/// and [`PanelError::InvalidSettings`] for malformed blobs.
pub fn build_links(
    inbound: &Inbound,
    client: &Client,
    address: &str,
) -> Result<Vec<ShareLink>, PanelError> {
    let protocol = inbound.protocol()?;
    let stream = parse_stream(&inbound.stream_settings)?;
    let settings = inbound.parsed_settings()?;
    let transport = Transport::from_stream(&stream);

    let remark = if inbound.remark.is_empty() {
        client.email.clone()
    } else {
        format!("{}-{}", inbound.remark, client.email)
    };
    let address = if super::inbound::is_wildcard(&inbound.listen) {
        address.to_string()
    } else {
        inbound.listen.clone()
    };

    let endpoints = external_endpoints(&stream, &remark).unwrap_or_else(|| {
        vec![Endpoint {
            address,
            port: inbound.port,
            remark,
            force_tls: "same".to_string(),
        }]
    });

    endpoints
        .iter()
        .map(|ep| {
            let transport = transport.for_endpoint(ep);
            let link = match protocol {
                Protocol::Vless => vless_link(client, ep, &transport)?,
                Protocol::Trojan => trojan_link(client, ep, &transport)?,
                Protocol::Vmess => vmess_link(client, ep, &transport),
                Protocol::Shadowsocks => shadowsocks_link(client, &settings, ep, &transport)?,
                other => {
                    return Err(PanelError::InvalidInbound(format!(
                        "{other} inbounds have no share links"
                    )));
                }
            };
            Ok(ShareLink {
                link_type: protocol.as_str().to_string(),
                remark: ep.remark.clone(),
                link,
            })
        })
        .collect()
}

fn parse_stream(blob: &str) -> Result<Value, PanelError> {
    if blob.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(blob).map_err(|e| PanelError::InvalidSettings(e.to_string()))
}

fn external_endpoints(stream: &Value, remark: &str) -> Option<Vec<Endpoint>> {
    let proxies = stream.get("externalProxy")?.as_array()?;
    let endpoints: Vec<Endpoint> = proxies
        .iter()
        .filter_map(|p| {
            let dest = p.get("dest")?.as_str()?.to_string();
            let port = u16::try_from(p.get("port")?.as_u64()?).ok()?;
            let extra = p.get("remark").and_then(Value::as_str).unwrap_or_default();
            Some(Endpoint {
                address: dest,
                port,
                remark: if extra.is_empty() {
                    remark.to_string()
                } else {
                    format!("{remark}-{extra}")
                },
                force_tls: str_at(p, &["forceTls"]).unwrap_or("same").to_string(),
            })
        })
        .collect();
    if endpoints.is_empty() {
        None
    } else {
        Some(endpoints)
    }
}

/// Walks `path` through nested objects and returns the string at the end.
fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(Value::as_str)
}

/// First element of a string array, or the string itself.
fn first_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let node = path.iter().try_fold(value, |v, key| v.get(*key))?;
    match node {
        Value::String(s) => Some(s),
        Value::Array(items) => items.first().and_then(Value::as_str),
        _ => None,
    }
}

impl Transport {
    fn from_stream(stream: &Value) -> Self {
        let network = str_at(stream, &["network"]).unwrap_or("tcp").to_string();
        let security = str_at(stream, &["security"]).unwrap_or("none").to_string();
        let mut t = Self {
            network,
            security,
            ..Self::default()
        };

        match t.network.as_str() {
            "tcp" | "raw" => {
                let key = if stream.get("rawSettings").is_some() {
                    "rawSettings"
                } else {
                    "tcpSettings"
                };
                if str_at(stream, &[key, "header", "type"]) == Some("http") {
                    t.header_type = "http".to_string();
                    t.path = first_str(stream, &[key, "header", "request", "path"])
                        .unwrap_or("/")
                        .to_string();
                    t.host = first_str(stream, &[key, "header", "request", "headers", "Host"])
                        .unwrap_or_default()
                        .to_string();
                }
            }
            "ws" => {
                t.path = str_at(stream, &["wsSettings", "path"]).unwrap_or("/").to_string();
                t.host = str_at(stream, &["wsSettings", "host"])
                    .or_else(|| str_at(stream, &["wsSettings", "headers", "Host"]))
                    .unwrap_or_default()
                    .to_string();
            }
            "grpc" => {
                t.service_name = str_at(stream, &["grpcSettings", "serviceName"])
                    .unwrap_or_default()
                    .to_string();
                t.host = str_at(stream, &["grpcSettings", "authority"])
                    .unwrap_or_default()
                    .to_string();
                if stream
                    .pointer("/grpcSettings/multiMode")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    t.mode = "multi".to_string();
                }
            }
            "httpupgrade" => {
                t.path = str_at(stream, &["httpupgradeSettings", "path"])
                    .unwrap_or("/")
                    .to_string();
                t.host = str_at(stream, &["httpupgradeSettings", "host"])
                    .unwrap_or_default()
                    .to_string();
            }
            "xhttp" | "splithttp" => {
                t.path = str_at(stream, &["xhttpSettings", "path"])
                    .unwrap_or("/")
                    .to_string();
                t.host = str_at(stream, &["xhttpSettings", "host"])
                    .unwrap_or_default()
                    .to_string();
                t.mode = str_at(stream, &["xhttpSettings", "mode"])
                    .unwrap_or("auto")
                    .to_string();
            }
            "kcp" => {
                t.header_type = str_at(stream, &["kcpSettings", "header", "type"])
                    .unwrap_or("none")
                    .to_string();
                t.path = str_at(stream, &["kcpSettings", "seed"])
                    .unwrap_or_default()
                    .to_string();
            }
            _ => {}
        }

        match t.security.as_str() {
            "tls" => {
                t.sni = str_at(stream, &["tlsSettings", "serverName"])
                    .unwrap_or_default()
                    .to_string();
                t.alpn = stream
                    .pointer("/tlsSettings/alpn")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .join(",")
                    })
                    .unwrap_or_default();
                t.fingerprint = str_at(stream, &["tlsSettings", "settings", "fingerprint"])
                    .unwrap_or_default()
                    .to_string();
            }
            "reality" => {
                t.sni = first_str(stream, &["realitySettings", "serverNames"])
                    .unwrap_or_default()
                    .to_string();
                t.short_id = first_str(stream, &["realitySettings", "shortIds"])
                    .unwrap_or_default()
                    .to_string();
                t.public_key = str_at(stream, &["realitySettings", "settings", "publicKey"])
                    .unwrap_or_default()
                    .to_string();
                t.fingerprint = str_at(stream, &["realitySettings", "settings", "fingerprint"])
                    .unwrap_or("chrome")
                    .to_string();
                t.spider_x = str_at(stream, &["realitySettings", "settings", "spiderX"])
                    .unwrap_or_default()
                    .to_string();
            }
            _ => {}
        }
        t
    }

    /// Applies an external proxy's `forceTls` override.
    fn for_endpoint(&self, ep: &Endpoint) -> Self {
        let mut t = self.clone();
        match ep.force_tls.as_str() {
            "none" => {
                t.security = "none".to_string();
                t.sni.clear();
                t.alpn.clear();
                t.fingerprint.clear();
                t.public_key.clear();
                t.short_id.clear();
                t.spider_x.clear();
            }
            "tls" if t.security != "tls" => {
                t.security = "tls".to_string();
                t.public_key.clear();
                t.short_id.clear();
                t.spider_x.clear();
            }
            _ => {}
        }
        t
    }

    /// Query pairs for the URI based formats.
    fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs: Vec<(&'static str, &str)> = vec![("type", self.network.as_str())];
        let optional: [(&'static str, &str); 11] = [
            ("headerType", self.header_type.as_str()),
            ("path", self.path.as_str()),
            ("host", self.host.as_str()),
            ("serviceName", self.service_name.as_str()),
            ("mode", self.mode.as_str()),
            ("security", self.security.as_str()),
            ("sni", self.sni.as_str()),
            ("alpn", self.alpn.as_str()),
            ("fp", self.fingerprint.as_str()),
            ("pbk", self.public_key.as_str()),
            ("sid", self.short_id.as_str()),
        ];
        pairs.extend(optional.into_iter().filter(|(_, v)| !v.is_empty()));
        if !self.spider_x.is_empty() {
            pairs.push(("spx", self.spider_x.as_str()));
        }
        pairs
    }
}

fn format_host(address: &str) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]")
    } else {
        address.to_string()
    }
}

fn uri(
    scheme: &str,
    userinfo: &str,
    ep: &Endpoint,
    pairs: &[(&str, &str)],
) -> Result<String, PanelError> {
    let mut url = Url::parse(&format!(
        "{scheme}://{userinfo}@{}:{}",
        format_host(&ep.address),
        ep.port
    ))
    .map_err(|e| PanelError::InvalidRequest(format!("cannot build {scheme} link: {e}")))?;
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs.iter().copied());
    }
    url.set_fragment(Some(&ep.remark));
    Ok(url.into())
}

fn vless_link(client: &Client, ep: &Endpoint, t: &Transport) -> Result<String, PanelError> {
    let mut pairs = t.query_pairs();
    pairs.insert(1, ("encryption", "none"));
    let flow = client.normalized_flow();
    let vision_capable = matches!(t.security.as_str(), "tls" | "reality")
        && matches!(t.network.as_str(), "tcp" | "raw");
    if vision_capable && !flow.is_empty() {
        pairs.push(("flow", flow));
    }
    uri("vless", &client.id, ep, &pairs)
}

fn trojan_link(client: &Client, ep: &Endpoint, t: &Transport) -> Result<String, PanelError> {
    let pairs = t.query_pairs();
    uri("trojan", &client.password, ep, &pairs)
}

fn vmess_link(client: &Client, ep: &Endpoint, t: &Transport) -> String {
    let security = if client.security.is_empty() {
        "auto"
    } else {
        client.security.as_str()
    };
    let tls = if t.security == "none" { "" } else { t.security.as_str() };
    let header_type = if t.header_type.is_empty() {
        "none"
    } else {
        t.header_type.as_str()
    };
    let path = if t.network == "grpc" {
        t.service_name.as_str()
    } else {
        t.path.as_str()
    };
    let doc = json!({
        "v": "2",
        "ps": ep.remark,
        "add": ep.address,
        "port": ep.port,
        "id": client.id,
        "scy": security,
        "net": t.network,
        "type": header_type,
        "host": t.host,
        "path": path,
        "tls": tls,
        "sni": t.sni,
        "alpn": t.alpn,
        "fp": t.fingerprint,
    });
    format!("vmess://{}", STANDARD.encode(doc.to_string()))
}

fn shadowsocks_link(
    client: &Client,
    settings: &InboundSettings,
    ep: &Endpoint,
    t: &Transport,
) -> Result<String, PanelError> {
    let method = if client.method.is_empty() {
        settings.rest_str("method").unwrap_or("aes-256-gcm")
    } else {
        client.method.as_str()
    };
    let server_password = settings.rest_str("password").unwrap_or_default();
    let userinfo = if method.starts_with("2022") && !client.password.is_empty() {
        format!("{method}:{server_password}:{}", client.password)
    } else if client.password.is_empty() {
        format!("{method}:{server_password}")
    } else {
        format!("{method}:{}", client.password)
    };
    let pairs: Vec<(&str, &str)> = if t.network == "tcp" && t.security == "none" {
        Vec::new()
    } else {
        t.query_pairs()
    };
    uri("ss", &URL_SAFE_NO_PAD.encode(userinfo), ep, &pairs)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn inbound(protocol: &str, settings: &str, stream: &str) -> Inbound {
        Inbound {
            id: 1,
            user_id: 1,
            up: 0,
            down: 0,
            total: 0,
            remark: "edge".to_string(),
            enable: true,
            expiry_time: 0,
            listen: String::new(),
            port: 443,
            protocol: protocol.to_string(),
            settings: settings.to_string(),
            stream_settings: stream.to_string(),
            tag: String::new(),
            sniffing: String::new(),
            client_stats: Vec::new(),
        }
    }

    #[test]
    fn vless_reality_link_carries_public_key_and_flow() {
        let stream = r#"{"network":"tcp","security":"reality","realitySettings":{"serverNames":["www.example.com"],"shortIds":["ab12"],"privateKey":"priv","settings":{"publicKey":"PUB","fingerprint":"chrome"}}}"#;
        let ib = inbound("vless", r#"{"clients":[]}"#, stream);
        let mut client = Client::new("11111111-2222-3333-4444-555555555555", "alice");
        client.flow = "xtls-rprx-vision-udp443".to_string();

        let Ok(links) = build_links(&ib, &client, "vpn.example.org") else {
            panic!("links build");
        };
        let Some(link) = links.first() else {
            panic!("one link");
        };
        assert!(link.link.starts_with(
            "vless://11111111-2222-3333-4444-555555555555@vpn.example.org:443?type=tcp&encryption=none"
        ));
        assert!(link.link.contains("pbk=PUB"));
        assert!(link.link.contains("sid=ab12"));
        assert!(link.link.contains("flow=xtls-rprx-vision&") || link.link.contains("flow=xtls-rprx-vision#"));
        assert!(link.link.ends_with("#edge-alice"));
    }

    #[test]
    fn vmess_link_is_base64_json() {
        let stream = r#"{"network":"ws","security":"none","wsSettings":{"path":"/ws","host":"cdn.example.com"}}"#;
        let ib = inbound("vmess", r#"{"clients":[]}"#, stream);
        let client = Client::new("uuid-1", "bob");
        let Ok(links) = build_links(&ib, &client, "1.2.3.4") else {
            panic!("links build");
        };
        let Some(encoded) = links.first().and_then(|l| l.link.strip_prefix("vmess://")) else {
            panic!("vmess scheme");
        };
        let Ok(bytes) = STANDARD.decode(encoded) else {
            panic!("base64");
        };
        let Ok(doc) = serde_json::from_slice::<Value>(&bytes) else {
            panic!("json");
        };
        assert_eq!(doc["add"], "1.2.3.4");
        assert_eq!(doc["net"], "ws");
        assert_eq!(doc["path"], "/ws");
        assert_eq!(doc["ps"], "edge-bob");
    }

    #[test]
    fn external_proxies_yield_one_link_each() {
        let stream = r#"{"network":"tcp","security":"tls","tlsSettings":{"serverName":"a.com"},"externalProxy":[{"forceTls":"same","dest":"cdn1.com","port":8443,"remark":"cdn1"},{"forceTls":"none","dest":"cdn2.com","port":80,"remark":""}]}"#;
        let ib = inbound("trojan", r#"{"clients":[]}"#, stream);
        let client = Client::with_password("pw", "carol");
        let Ok(links) = build_links(&ib, &client, "ignored") else {
            panic!("links build");
        };
        assert_eq!(links.len(), 2);
        let (Some(first), Some(second)) = (links.first(), links.get(1)) else {
            panic!("two links");
        };
        assert!(first.link.starts_with("trojan://pw@cdn1.com:8443?"));
        assert!(first.link.contains("security=tls"));
        assert!(second.link.contains("security=none"));
        assert!(!second.link.contains("sni="));
    }

    #[test]
    fn shadowsocks_2022_uses_server_and_user_password() {
        let ib = inbound(
            "shadowsocks",
            r#"{"method":"2022-blake3-aes-128-gcm","password":"SERVER","clients":[]}"#,
            r#"{"network":"tcp","security":"none"}"#,
        );
        let client = Client::with_password("USER", "dave");
        let Ok(links) = build_links(&ib, &client, "h.com") else {
            panic!("links build");
        };
        let expected = URL_SAFE_NO_PAD.encode("2022-blake3-aes-128-gcm:SERVER:USER");
        assert_eq!(
            links.first().map(|l| l.link.as_str()),
            Some(format!("ss://{expected}@h.com:443#edge-dave").as_str())
        );
    }

    #[test]
    fn socks_has_no_links() {
        let ib = inbound("socks", "{}", "");
        let client = Client::new("", "x");
        assert!(matches!(
            build_links(&ib, &client, "h"),
            Err(PanelError::InvalidInbound(_))
        ));
    }
}
