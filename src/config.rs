//! Client configuration and fluent builder.
//!
//! The builder validates the configuration eagerly on
//! [`connect`](ClientBuilder::connect), before any socket is opened.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use resql::Client;
//!
//! let client = Client::builder("my-cluster")
//!     .client_name("worker-1")
//!     .timeout(Duration::from_secs(10))
//!     .url("tcp://127.0.0.1:7600")
//!     .url("tcp://127.0.0.1:7601")
//!     .connect()
//!     .await?;
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::client::Client;
use crate::error::{Error, Result};

/// Minimum accepted call deadline.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default call deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// One `host:port` candidate from the configured URL list or from a
/// handshake's node list. The `tcp://` scheme is transport-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse a `tcp://host:port` URI.
    pub fn parse(s: &str) -> Result<Self> {
        let url =
            Url::parse(s).map_err(|e| Error::InvalidUrl(format!("{}: {}", s, e)))?;

        if url.scheme() != "tcp" {
            return Err(Error::InvalidUrl(format!(
                "{}: unsupported scheme '{}'",
                s,
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("{}: missing host", s)))?;
        let port = url
            .port()
            .ok_or_else(|| Error::InvalidUrl(format!("{}: missing port", s)))?;

        Ok(Endpoint {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// Validated configuration handed to the client.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub client_name: String,
    pub cluster_name: String,
    pub timeout: Duration,
    pub endpoints: Vec<Endpoint>,
    pub local_addr: Option<SocketAddr>,
}

/// Builder for configuring and connecting a [`Client`].
///
/// `cluster_name` is required and taken by the constructor; everything
/// else has a sensible default except the endpoint list, which must name
/// at least one URL.
pub struct ClientBuilder {
    cluster_name: String,
    client_name: Option<String>,
    timeout: Duration,
    urls: Vec<String>,
    outgoing_addr: Option<IpAddr>,
    outgoing_port: Option<u16>,
}

impl ClientBuilder {
    /// Create a builder for the named cluster.
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            client_name: None,
            timeout: DEFAULT_TIMEOUT,
            urls: Vec::new(),
            outgoing_addr: None,
            outgoing_port: None,
        }
    }

    /// Set the client identity. The session survives reconnects under
    /// this name. Default: a random UUID.
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Set the overall per-call deadline. Must be at least
    /// [`MIN_TIMEOUT`]. Default: 5 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add one candidate server URL (`tcp://host:port`).
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    /// Add several candidate server URLs.
    pub fn urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls.extend(urls.into_iter().map(Into::into));
        self
    }

    /// Bind outgoing connections to this local address.
    pub fn outgoing_addr(mut self, addr: IpAddr) -> Self {
        self.outgoing_addr = Some(addr);
        self
    }

    /// Bind outgoing connections to this local port.
    pub fn outgoing_port(mut self, port: u16) -> Self {
        self.outgoing_port = Some(port);
        self
    }

    /// Validate the configuration and connect, retrying through the
    /// endpoint list until connected or the deadline expires.
    pub async fn connect(self) -> Result<Client> {
        Client::connect(self.validate()?).await
    }

    pub(crate) fn validate(self) -> Result<Config> {
        if self.cluster_name.is_empty() {
            return Err(Error::Misuse("cluster name cannot be empty".into()));
        }

        if self.timeout < MIN_TIMEOUT {
            return Err(Error::Misuse(format!(
                "timeout must be at least {} ms",
                MIN_TIMEOUT.as_millis()
            )));
        }

        if self.urls.is_empty() {
            return Err(Error::Misuse("at least one url must be specified".into()));
        }

        let endpoints = self
            .urls
            .iter()
            .map(|u| Endpoint::parse(u))
            .collect::<Result<Vec<_>>>()?;

        let local_addr = match (self.outgoing_addr, self.outgoing_port) {
            (None, None) => None,
            (addr, port) => Some(SocketAddr::new(
                addr.unwrap_or_else(|| IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                port.unwrap_or(0),
            )),
        };

        Ok(Config {
            client_name: self
                .client_name
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            cluster_name: self.cluster_name,
            timeout: self.timeout,
            endpoints,
            local_addr,
        })
    }
}
