use crate::config::UpstreamConfig;
use crate::error::GatewayError;
use crate::proxy::context::BoxBody;
use http::uri::Uri;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Only wired in when `upstream.tls_verify = false`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Transport failures on the forward path. Both surface to clients as 502;
/// the admission decision already happened and is a separate concern.
#[derive(Debug)]
pub enum ForwardError {
    Connect(String),
    Timeout,
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::Connect(msg) => write!(f, "upstream connect error: {}", msg),
            ForwardError::Timeout => write!(f, "upstream timeout"),
        }
    }
}

impl std::error::Error for ForwardError {}

/// Parse and shape-check an upstream base URL without building a client.
/// Used by config validation so a bad target fails at startup.
pub fn validate_base_url(url: &str) -> Result<(), GatewayError> {
    parse_base_url(url).map(|_| ())
}

fn parse_base_url(url: &str) -> Result<(String, String, String), GatewayError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| GatewayError::Config(format!("malformed upstream url {url:?}: {e}")))?;

    let scheme = match uri.scheme_str() {
        Some("http") => "http".to_string(),
        Some("https") => "https".to_string(),
        other => {
            return Err(GatewayError::Config(format!(
                "upstream url must be http or https, got {:?}",
                other.unwrap_or("none")
            )))
        }
    };
    let authority = uri
        .authority()
        .ok_or_else(|| GatewayError::Config(format!("upstream url {url:?} has no host")))?
        .to_string();

    // Base path with any trailing slash dropped so suffix appending cannot
    // produce "//".
    let base_path = uri.path().trim_end_matches('/').to_string();

    Ok((scheme, authority, base_path))
}

/// The single configured upstream: base URL plus a pooled client. The
/// incoming path suffix is appended to the base path; request and response
/// bodies are streamed through without buffering.
pub struct Upstream {
    scheme: String,
    authority: String,
    base_path: String,
    /// Wraps an `HttpsConnector` so both `http://` and `https://` upstreams
    /// work; HTTP/2 is negotiated via ALPN.
    client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    request_timeout: Duration,
}

impl Upstream {
    pub fn new(cfg: &UpstreamConfig, request_timeout: Duration) -> Result<Self, GatewayError> {
        let (scheme, authority, base_path) = parse_base_url(&cfg.url)?;

        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_keepalive(Some(cfg.idle_timeout));
        http.set_connect_timeout(Some(cfg.connect_timeout));
        http.enforce_http(false);

        let https = if cfg.tls_verify {
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(http)
        } else {
            let tls_config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth();

            hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(http)
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(cfg.idle_timeout)
            .pool_max_idle_per_host(cfg.pool_size)
            .build(https);

        Ok(Self {
            scheme,
            authority,
            base_path,
            client,
            request_timeout,
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Target URI for an incoming `path_and_query` suffix.
    fn target_uri(&self, path_and_query: &str) -> String {
        let mut uri = String::with_capacity(
            self.scheme.len() + 3 + self.authority.len() + self.base_path.len()
                + path_and_query.len(),
        );
        uri.push_str(&self.scheme);
        uri.push_str("://");
        uri.push_str(&self.authority);
        uri.push_str(&self.base_path);
        uri.push_str(path_and_query);
        uri
    }

    /// Send one exchange upstream. `headers` must already carry the
    /// forwarded-header set; hop-by-hop headers are stripped here. Returns
    /// the streaming response and the exchange duration.
    pub async fn forward(
        &self,
        method: http::Method,
        path_and_query: &str,
        mut headers: http::HeaderMap,
        body: BoxBody,
    ) -> Result<(Response<Incoming>, Duration), ForwardError> {
        remove_hop_headers(&mut headers);
        headers.insert(
            http::header::HOST,
            http::HeaderValue::from_str(&self.authority)
                .unwrap_or_else(|_| http::HeaderValue::from_static("")),
        );

        let mut builder = Request::builder()
            .method(method)
            .uri(self.target_uri(path_and_query));
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let req = builder
            .body(body)
            .map_err(|e| ForwardError::Connect(e.to_string()))?;

        let start = Instant::now();
        match tokio::time::timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(resp)) => Ok((resp, start.elapsed())),
            Ok(Err(e)) => Err(ForwardError::Connect(e.to_string())),
            Err(_) => Err(ForwardError::Timeout),
        }
    }
}

/// Strip hop-by-hop headers. Applied to the request before it goes upstream
/// and to the upstream response before it goes back downstream; forwarding
/// either direction's `Connection`/`Transfer-Encoding` verbatim corrupts
/// framing on the other hop.
pub(crate) fn remove_hop_headers(headers: &mut http::HeaderMap) {
    use http::header::{CONNECTION, TRANSFER_ENCODING};
    use http::HeaderName;

    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}
