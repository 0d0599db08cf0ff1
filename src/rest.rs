//! Gateway metadata (`GET /gateway/bot`)
//!
//! The pool only needs one thing from the REST layer: where to connect, how
//! many shards are recommended and how many sessions may still be started.
//! [`GatewayInfoSource`] is the seam; [`TwilightRest`] is the production
//! implementation backed by twilight-http.

use crate::error::GatewayError;
use async_trait::async_trait;
use url::Url;

/// Session start budget advertised by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until the budget resets
    pub reset_after: u64,
    pub max_concurrency: u32,
}

/// Gateway connection metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

impl GatewayInfo {
    /// Reject metadata no spawn plan can be built from.
    ///
    /// An empty URL is tolerated when a custom socket URL overrides it.
    pub fn validate(&self, has_custom_url: bool) -> Result<(), GatewayError> {
        if self.shards == 0 {
            return Err(GatewayError::InvalidGatewayInfo(
                "recommended shard count is 0".to_string(),
            ));
        }
        if self.session_start_limit.max_concurrency == 0 {
            return Err(GatewayError::InvalidGatewayInfo(
                "max_concurrency is 0".to_string(),
            ));
        }
        if self.url.trim().is_empty() && !has_custom_url {
            return Err(GatewayError::InvalidGatewayInfo(
                "gateway url is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Source of gateway metadata
#[async_trait]
pub trait GatewayInfoSource: Send + Sync {
    async fn gateway_info(&self) -> Result<GatewayInfo, GatewayError>;
}

/// twilight-http backed metadata source
pub struct TwilightRest {
    client: twilight_http::Client,
}

impl TwilightRest {
    pub fn new(token: String) -> Self {
        Self {
            client: twilight_http::Client::new(token),
        }
    }
}

#[async_trait]
impl GatewayInfoSource for TwilightRest {
    async fn gateway_info(&self) -> Result<GatewayInfo, GatewayError> {
        let info = self
            .client
            .gateway()
            .authed()
            .await
            .map_err(GatewayError::rest)?
            .model()
            .await
            .map_err(GatewayError::rest)?;

        let limit = info.session_start_limit;
        Ok(GatewayInfo {
            url: info.url,
            shards: narrow("shards", info.shards)?,
            session_start_limit: SessionStartLimit {
                total: narrow("session_start_limit.total", limit.total)?,
                remaining: narrow("session_start_limit.remaining", limit.remaining)?,
                reset_after: u64::try_from(limit.reset_after).map_err(|_| {
                    GatewayError::InvalidGatewayInfo(
                        "session_start_limit.reset_after out of range".to_string(),
                    )
                })?,
                max_concurrency: narrow(
                    "session_start_limit.max_concurrency",
                    limit.max_concurrency,
                )?,
            },
        })
    }
}

fn narrow<T: TryInto<u32>>(field: &str, value: T) -> Result<u32, GatewayError> {
    value
        .try_into()
        .map_err(|_| GatewayError::InvalidGatewayInfo(format!("{field} out of range")))
}

/// Build the socket URL for a gateway base URL.
///
/// Appends `v=<version>&encoding=json` to whatever query the base carries.
pub fn socket_url(base: &str, version: u8) -> Result<String, GatewayError> {
    let mut url = Url::parse(base)
        .map_err(|e| GatewayError::InvalidGatewayInfo(format!("invalid gateway url {base:?}: {e}")))?;

    url.query_pairs_mut()
        .append_pair("v", &version.to_string())
        .append_pair("encoding", "json");

    Ok(url.into())
}
