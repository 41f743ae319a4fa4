use crate::{ClientConfig, TransferError, FILES_API, HEADER_NEXT_OFFSET};
use std::fmt;
use std::io::Read;
use ureq::tls::{PemItem, RootCerts, TlsConfig};
use ureq::{Agent, SendBody};

/// Upper bound on the response body quoted in status errors.
pub const ERROR_BODY_LIMIT: u64 = 1000;

/// A response whose body has not been read yet.
pub struct HttpResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
    body: Box<dyn Read>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Read + 'static) -> Self {
        Self {
            status,
            headers,
            body: Box::new(body),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn into_body(self) -> Box<dyn Read> {
        self.body
    }

    /// Read at most [`ERROR_BODY_LIMIT`] bytes of the body for diagnostics.
    pub fn error_body(self) -> String {
        let mut buf = Vec::new();
        let _ = self.body.take(ERROR_BODY_LIMIT).read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).trim().to_owned()
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// The data-plane HTTP operations the transfer engines need.
///
/// Non-2xx answers come back as responses; `Err` is reserved for transport
/// failures (DNS, TLS, connection reset, timeouts).
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpResponse, TransferError>;

    fn head(&self, url: &str) -> Result<HttpResponse, TransferError>;

    /// PUT exactly `len` bytes read from `body`.
    fn put(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &mut dyn Read,
        len: u64,
    ) -> Result<HttpResponse, TransferError>;
}

/// [`HttpClient`] backed by a blocking `ureq` agent.
pub struct UreqClient {
    agent: Agent,
}

impl UreqClient {
    pub fn new(config: &ClientConfig) -> Result<Self, TransferError> {
        let mut tls = TlsConfig::builder().disable_verification(config.insecure_skip_tls_verify);
        if let Some(ref pem) = config.ca_pem {
            let certs = ureq::tls::parse_pem(pem)
                .filter_map(|item| match item {
                    Ok(PemItem::Certificate(cert)) => Some(Ok(cert)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| TransferError::Config(format!("invalid CA bundle: {e}")))?;
            if certs.is_empty() {
                return Err(TransferError::Config(
                    "CA bundle contains no certificates".to_owned(),
                ));
            }
            tls = tls.root_certs(RootCerts::new_with_certs(&certs));
        }

        let agent_config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(config.timeout)
            .tls_config(tls.build())
            .build();
        Ok(Self {
            agent: Agent::new_with_config(agent_config),
        })
    }

    fn convert(resp: ureq::http::Response<ureq::Body>) -> HttpResponse {
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_owned(),
                    v.to_str().unwrap_or_default().to_owned(),
                )
            })
            .collect();
        HttpResponse::new(status, headers, resp.into_body().into_reader())
    }
}

impl HttpClient for UreqClient {
    fn get(&self, url: &str) -> Result<HttpResponse, TransferError> {
        tracing::debug!("GET {url}");
        self.agent
            .get(url)
            .call()
            .map(Self::convert)
            .map_err(|e| TransferError::Http(format!("GET {url}: {e}")))
    }

    fn head(&self, url: &str) -> Result<HttpResponse, TransferError> {
        tracing::debug!("HEAD {url}");
        self.agent
            .head(url)
            .call()
            .map(Self::convert)
            .map_err(|e| TransferError::Http(format!("HEAD {url}: {e}")))
    }

    fn put(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &mut dyn Read,
        len: u64,
    ) -> Result<HttpResponse, TransferError> {
        tracing::debug!("PUT {url} ({len} bytes)");
        let mut req = self
            .agent
            .put(url)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", &len.to_string());
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        let mut limited = body.take(len);
        req.send(SendBody::from_reader(&mut limited))
            .map(Self::convert)
            .map_err(|e| TransferError::Http(format!("PUT {url}: {e}")))
    }
}

/// Percent-encode a slash-separated path, keeping the slashes.
pub fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for b in path.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'/' | b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Build `{base}/api/v1/files{path}`; `path` gets a leading slash if missing.
pub fn files_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{FILES_API}{}", encode_path(path))
    } else {
        format!("{base}{FILES_API}/{}", encode_path(path))
    }
}

/// Parse an `X-Next-Offset` value. Negative or non-numeric values are
/// protocol violations.
pub fn parse_offset(value: &str) -> Result<u64, TransferError> {
    let parsed: i64 = value.trim().parse().map_err(|_| {
        TransferError::Protocol(format!("invalid {HEADER_NEXT_OFFSET} value '{value}'"))
    })?;
    u64::try_from(parsed).map_err(|_| {
        TransferError::Protocol(format!("negative {HEADER_NEXT_OFFSET} value {parsed}"))
    })
}

/// Ask the data plane how many bytes of `url` it already holds.
///
/// `404` means nothing was uploaded yet; `200` carries the offset in
/// `X-Next-Offset` (absent means zero).
pub fn check_progress(client: &dyn HttpClient, url: &str) -> Result<u64, TransferError> {
    let resp = client.head(url)?;
    match resp.status {
        404 => Ok(0),
        200 => match resp.header(HEADER_NEXT_OFFSET) {
            Some(value) => parse_offset(value),
            None => {
                tracing::warn!("HEAD {url}: no {HEADER_NEXT_OFFSET} header, starting from 0");
                Ok(0)
            }
        },
        status => Err(TransferError::Status {
            context: format!("progress check {url}"),
            status,
            body: String::new(),
        }),
    }
}
