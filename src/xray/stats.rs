//! Client for Xray's `StatsService` gRPC API.
//!
//! Only the two unary calls the panel needs are modelled, so the messages
//! are declared by hand instead of generated from Xray's `.proto` files.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

use super::config::API_TAG;
use super::process::XrayControl;
use crate::domain::{ClientDelta, TagTraffic, TrafficSample};
use crate::error::PanelError;

const QUERY_STATS: &str = "/xray.app.stats.command.StatsService/QueryStats";
const GET_ALL_ONLINE_USERS: &str = "/xray.app.stats.command.StatsService/GetAllOnlineUsers";

const SEPARATOR: &str = ">>>";

mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct QueryStatsRequest {
        #[prost(string, tag = "1")]
        pub pattern: String,
        #[prost(bool, tag = "2")]
        pub reset: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Stat {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(int64, tag = "2")]
        pub value: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct QueryStatsResponse {
        #[prost(message, repeated, tag = "1")]
        pub stat: Vec<Stat>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetAllOnlineUsersRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetAllOnlineUsersResponse {
        #[prost(string, repeated, tag = "1")]
        pub users: Vec<String>,
    }
}

/// Source of per-tick traffic samples.
#[async_trait]
pub trait TrafficSource: Send + Sync + Debug {
    /// Reads traffic since the last call when `reset` is set.
    ///
    /// # Errors
    ///
    /// [`PanelError::Unavailable`] when Xray is not running or unreachable,
    /// [`PanelError::Timeout`] when the call misses its deadline.
    async fn get_traffic(&self, reset: bool) -> Result<TrafficSample, PanelError>;
}

/// gRPC stats client bound to the supervised Xray.
#[derive(Debug)]
pub struct StatsClient {
    xray: Arc<dyn XrayControl>,
    timeout: Duration,
}

impl StatsClient {
    /// Creates a client that asks `xray` for its API port on every call.
    #[must_use]
    pub fn new(xray: Arc<dyn XrayControl>, timeout: Duration) -> Self {
        Self { xray, timeout }
    }

    async fn connect(&self) -> Result<Channel, PanelError> {
        if !self.xray.is_running() {
            return Err(PanelError::Unavailable("xray is not running".to_string()));
        }
        let port = self
            .xray
            .api_port()
            .ok_or_else(|| PanelError::Unavailable("xray api port unknown".to_string()))?;
        Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
            .map_err(|e| PanelError::Internal(e.to_string()))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect()
            .await
            .map_err(|e| PanelError::Unavailable(format!("dial xray api: {e}")))
    }

    async fn sample(&self, reset: bool) -> Result<TrafficSample, PanelError> {
        let channel = self.connect().await?;
        let stats: proto::QueryStatsResponse = unary(
            channel.clone(),
            QUERY_STATS,
            proto::QueryStatsRequest {
                pattern: String::new(),
                reset,
            },
        )
        .await?;
        let mut sample = fold_stats(&stats.stat);

        match unary::<_, proto::GetAllOnlineUsersResponse>(
            channel,
            GET_ALL_ONLINE_USERS,
            proto::GetAllOnlineUsersRequest {},
        )
        .await
        {
            Ok(online) => sample.online = online_emails(&online.users),
            Err(e) => tracing::debug!(error = %e, "online users unavailable"),
        }
        Ok(sample)
    }
}

#[async_trait]
impl TrafficSource for StatsClient {
    async fn get_traffic(&self, reset: bool) -> Result<TrafficSample, PanelError> {
        let sample = tokio::time::timeout(self.timeout, self.sample(reset))
            .await
            .map_err(|_| {
                PanelError::Timeout(format!("stats call exceeded {}s", self.timeout.as_secs()))
            })??;
        self.xray.set_online_clients(sample.online.clone());
        Ok(sample)
    }
}

async fn unary<Req, Resp>(channel: Channel, path: &'static str, request: Req) -> Result<Resp, PanelError>
where
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| PanelError::Unavailable(format!("xray api not ready: {e}")))?;
    let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
    grpc.unary(
        tonic::Request::new(request),
        PathAndQuery::from_static(path),
        codec,
    )
    .await
    .map(tonic::Response::into_inner)
    .map_err(|status| PanelError::Unavailable(format!("{path}: {}", status.message())))
}

/// Groups raw counters into per-tag and per-email deltas.
///
/// Counter names look like `inbound>>>tag>>>traffic>>>uplink` and
/// `user>>>email>>>traffic>>>downlink`. The API inbound is skipped.
fn fold_stats(stats: &[proto::Stat]) -> TrafficSample {
    let mut inbounds: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
    let mut outbounds: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
    let mut clients: BTreeMap<&str, (i64, i64)> = BTreeMap::new();

    for stat in stats {
        let parts: Vec<&str> = stat.name.split(SEPARATOR).collect();
        let [kind, key, "traffic", direction] = parts.as_slice() else {
            continue;
        };
        let bucket = match *kind {
            "inbound" if *key != API_TAG => &mut inbounds,
            "outbound" if *key != API_TAG => &mut outbounds,
            "user" => &mut clients,
            _ => continue,
        };
        let entry = bucket.entry(*key).or_default();
        let value = stat.value.max(0);
        match *direction {
            "uplink" => entry.0 = entry.0.saturating_add(value),
            "downlink" => entry.1 = entry.1.saturating_add(value),
            _ => {}
        }
    }

    let tags = |m: BTreeMap<&str, (i64, i64)>| -> Vec<TagTraffic> {
        m.into_iter()
            .map(|(tag, (up, down))| TagTraffic {
                tag: tag.to_string(),
                up,
                down,
            })
            .collect()
    };
    TrafficSample {
        inbounds: tags(inbounds),
        outbounds: tags(outbounds),
        clients: clients
            .into_iter()
            .map(|(email, (up, down))| ClientDelta {
                email: email.to_string(),
                up,
                down,
            })
            .collect(),
        online: Vec::new(),
    }
}

/// `user>>>email>>>online` entries to emails, sorted and deduplicated.
fn online_emails(users: &[String]) -> Vec<String> {
    let mut emails: Vec<String> = users
        .iter()
        .filter_map(|u| {
            let rest = u.strip_prefix("user>>>").unwrap_or(u);
            let email = rest.strip_suffix(">>>online").unwrap_or(rest);
            (!email.is_empty()).then(|| email.to_string())
        })
        .collect();
    emails.sort_unstable();
    emails.dedup();
    emails
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::xray::process::XraySupervisor;

    fn stat(name: &str, value: i64) -> proto::Stat {
        proto::Stat {
            name: name.to_string(),
            value,
        }
    }

    #[test]
    fn counters_are_grouped_by_kind() {
        let sample = fold_stats(&[
            stat("inbound>>>api>>>traffic>>>uplink", 99),
            stat("inbound>>>inbound-443>>>traffic>>>uplink", 10),
            stat("inbound>>>inbound-443>>>traffic>>>downlink", 20),
            stat("outbound>>>direct>>>traffic>>>downlink", 7),
            stat("user>>>a@x>>>traffic>>>uplink", 3),
            stat("user>>>a@x>>>traffic>>>downlink", 4),
            stat("user>>>b@x>>>traffic>>>downlink", 0),
            stat("malformed", 1),
        ]);
        assert_eq!(
            sample.inbounds,
            vec![TagTraffic {
                tag: "inbound-443".to_string(),
                up: 10,
                down: 20
            }]
        );
        assert_eq!(sample.outbounds.len(), 1);
        assert_eq!(sample.clients.len(), 2);
        assert_eq!(
            sample.clients.first().map(|c| (c.email.as_str(), c.up, c.down)),
            Some(("a@x", 3, 4))
        );
    }

    #[test]
    fn negative_counters_are_clamped() {
        let sample = fold_stats(&[stat("user>>>a>>>traffic>>>uplink", -5)]);
        assert_eq!(sample.clients.first().map(|c| c.up), Some(0));
    }

    #[test]
    fn online_names_are_stripped() {
        let users = vec![
            "user>>>b@x>>>online".to_string(),
            "user>>>a@x>>>online".to_string(),
            "user>>>a@x>>>online".to_string(),
        ];
        assert_eq!(online_emails(&users), vec!["a@x", "b@x"]);
    }

    #[tokio::test]
    async fn stopped_xray_is_unavailable() {
        let xray: Arc<dyn XrayControl> = Arc::new(XraySupervisor::with_paths(
            "/nonexistent".into(),
            "/nonexistent/config.json".into(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        let client = StatsClient::new(xray, Duration::from_secs(1));
        assert!(matches!(
            client.get_traffic(true).await,
            Err(PanelError::Unavailable(_))
        ));
    }
}
