use secrecy::{ExposeSecret as _, SecretString};
use url::Url;

use crate::Result;
use crate::error::Error;

/// Path of the telemetry plugin on the server.
pub const TELEMETRY_PATH: &str = "/api/ws/plugins/telemetry";

/// Where the telemetry server lives.
///
/// The URL is rebuilt on every connection attempt because the token in its query
/// string may have been refreshed in between.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    /// Defaults to 443 when `secure`, 80 otherwise
    pub port: Option<u16>,
    /// `wss` when true, `ws` otherwise
    pub secure: bool,
}

impl Endpoint {
    #[must_use]
    pub fn new<S: Into<String>>(host: S, port: Option<u16>, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    /// Derive the endpoint from the origin of the hosting application, e.g.
    /// `https://demo.example.com` or `http://localhost:8080`. The WebSocket is secure
    /// exactly when the origin is.
    pub fn from_origin(origin: &str) -> Result<Self> {
        let url = Url::parse(origin)?;
        let secure = match url.scheme() {
            "https" | "wss" => true,
            "http" | "ws" => false,
            other => return Err(Error::validation(format!("unsupported scheme `{other}`"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::validation(format!("origin `{origin}` has no host")))?;

        Ok(Self::new(host, url.port(), secure))
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.secure { 443 } else { 80 })
    }

    /// `<ws|wss>://<host>:<port>/api/ws/plugins/telemetry?token=<token>`
    pub fn telemetry_url(&self, token: &SecretString) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!(
            "{scheme}://{}:{}{TELEMETRY_PATH}",
            self.host,
            self.port()
        ))?;
        url.query_pairs_mut()
            .append_pair("token", token.expose_secret());
        Ok(url)
    }
}
