//! Upstream transport for one proxy stage. HTTP vs HTTPS follows the upstream URL scheme.

use std::fmt;
use std::io;
use std::time::Duration;

use reqwest::blocking::{Body, Client, Response};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use url::Url;

#[derive(Debug)]
pub enum ForwardError {
    Timeout(String),
    Connect(String),
    Other(String),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::Timeout(s) => write!(f, "upstream timed out: {s}"),
            ForwardError::Connect(s) => write!(f, "upstream connection failed: {s}"),
            ForwardError::Other(s) => write!(f, "upstream request failed: {s}"),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<reqwest::Error> for ForwardError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForwardError::Timeout(e.to_string())
        } else if e.is_connect() {
            ForwardError::Connect(e.to_string())
        } else {
            ForwardError::Other(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client,
    base: Url,
}

impl Forwarder {
    /// `timeout` bounds the whole exchange, independent of whatever the caller uses.
    pub fn new(upstream: &str, timeout: Duration) -> io::Result<Self> {
        let base = Url::parse(upstream).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid upstream URL '{upstream}': {e}"),
            )
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported upstream scheme '{}'", base.scheme()),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .no_proxy()
            .no_gzip()
            .http1_title_case_headers()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(io::Error::other)?;
        Ok(Forwarder { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Join the upstream base path with the (already prefix-stripped) request target.
    pub fn target_url(&self, target: &str) -> String {
        let origin = self.base.as_str().trim_end_matches('/');
        let origin = match origin.find('?') {
            Some(i) => &origin[..i],
            None => origin,
        };
        if target.starts_with('/') {
            format!("{origin}{target}")
        } else {
            format!("{origin}/{target}")
        }
    }

    pub fn send(
        &self,
        method: &str,
        target: &str,
        headers: &[(String, String)],
        body: Option<Body>,
    ) -> Result<Response, ForwardError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ForwardError::Other(format!("bad method {method}: {e}")))?;
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => tracing::debug!(header = %k, "dropping unrepresentable header"),
            }
        }
        let url = self.target_url(target);
        let mut req = self.client.request(method, &url).headers(map);
        if let Some(b) = body {
            req = req.body(b);
        }
        Ok(req.send()?)
    }
}
