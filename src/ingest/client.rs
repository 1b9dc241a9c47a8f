/// Outbound XRPC client for PDS hosts
use crate::db::models::Pds;
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Hook applied to every outbound request, set once at construction.
pub type ApplyPdsClientSettings =
    Arc<dyn Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync>;

/// Response to server.describeServer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeServerResponse {
    #[serde(default)]
    pub available_user_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
}

/// Minimal XRPC surface the relay calls on a PDS.
#[async_trait]
pub trait PdsClient: Send + Sync {
    /// sync.getRepo: CAR-encoded diff from `since` to head, buffered fully.
    async fn get_repo(&self, pds: &Pds, did: &str, since: &str) -> RelayResult<Vec<u8>>;

    /// server.describeServer: liveness probe before subscribing to a host.
    async fn describe_server(&self, host: &str, ssl: bool)
        -> RelayResult<DescribeServerResponse>;
}

/// reqwest-backed XRPC client
pub struct HttpPdsClient {
    http: reqwest::Client,
    apply_settings: ApplyPdsClientSettings,
}

impl HttpPdsClient {
    pub fn new(apply_settings: Option<ApplyPdsClientSettings>) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("borealis/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| RelayError::Internal(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http,
            apply_settings: apply_settings.unwrap_or_else(|| Arc::new(|rb| rb)),
        })
    }

    fn base_url(host: &str, ssl: bool) -> String {
        if ssl {
            format!("https://{}", host)
        } else {
            format!("http://{}", host)
        }
    }
}

#[async_trait]
impl PdsClient for HttpPdsClient {
    async fn get_repo(&self, pds: &Pds, did: &str, since: &str) -> RelayResult<Vec<u8>> {
        let url = format!(
            "{}/xrpc/com.atproto.sync.getRepo",
            Self::base_url(&pds.host, pds.ssl)
        );

        let mut req = self.http.get(&url).query(&[("did", did)]);
        if !since.is_empty() {
            req = req.query(&[("since", since)]);
        }
        req = (self.apply_settings)(req);

        let resp = req
            .send()
            .await
            .map_err(|e| RelayError::Upstream(format!("getRepo {}: {}", pds.host, e)))?;

        if !resp.status().is_success() {
            return Err(RelayError::Upstream(format!(
                "getRepo {} returned {}",
                pds.host,
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RelayError::Upstream(format!("getRepo {} body: {}", pds.host, e)))?;

        Ok(bytes.to_vec())
    }

    async fn describe_server(
        &self,
        host: &str,
        ssl: bool,
    ) -> RelayResult<DescribeServerResponse> {
        let url = format!(
            "{}/xrpc/com.atproto.server.describeServer",
            Self::base_url(host, ssl)
        );

        let req = (self.apply_settings)(self.http.get(&url));
        let resp = req
            .send()
            .await
            .map_err(|e| RelayError::Upstream(format!("describeServer {}: {}", host, e)))?;

        if !resp.status().is_success() {
            return Err(RelayError::Upstream(format!(
                "describeServer {} returned {}",
                host,
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| RelayError::Upstream(format!("describeServer {} body: {}", host, e)))
    }
}
