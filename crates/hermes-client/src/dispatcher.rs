use std::net::IpAddr;

use hermes_core::error::AppError;
use hermes_core::request::{HttpDispatcher, HttpResponse, PreparedRequest};
use reqwest::Client;
use url::Url;

/// Bytes of response body retained for the error log.
const SNIPPET_MAX_BYTES: usize = 512;

/// HTTP dispatcher using reqwest.
///
/// Timeouts are per-request, taken from the job. By default, SSRF
/// protection is **enabled** — requests to private/reserved IP ranges
/// are blocked unless the IP appears on the request's explicit
/// allowlist. Use [`allow_private_urls`](Self::allow_private_urls) to
/// disable this for deployments that call services on their own network.
#[derive(Clone)]
pub struct ReqwestDispatcher {
    client: Client,
    ssrf_protection: bool,
}

impl ReqwestDispatcher {
    pub fn new() -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent("Hermes/0.1 (Job Engine)")
            .build()
            .map_err(|e| AppError::Network(e.to_string()))?;

        Ok(Self {
            client,
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl HttpDispatcher for ReqwestDispatcher {
    async fn execute(&self, request: &PreparedRequest) -> Result<HttpResponse, AppError> {
        validate_target(&request.url, &request.ip_allowlist, self.ssrf_protection).await?;

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| AppError::Configuration(format!("invalid method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(request.timeout.as_secs())
            } else if e.is_connect() {
                AppError::Network(format!("Connection failed: {e}"))
            } else {
                AppError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(url = %request.url, status, "Dispatched request");

        Ok(HttpResponse {
            status,
            body_snippet: snippet(&body),
        })
    }
}

/// Leading bytes of a response body, truncated on a char boundary.
fn snippet(body: &str) -> String {
    if body.len() <= SNIPPET_MAX_BYTES {
        return body.to_string();
    }
    let mut end = SNIPPET_MAX_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

// ---------------------------------------------------------------------------
// Target validation: allowlist pinning and SSRF protection
// ---------------------------------------------------------------------------

/// Validate a dispatch target before any bytes leave the process.
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. With a non-empty allowlist, every resolved IP must be on it.
/// 4. Otherwise, when protection is on, reject private/reserved IPs.
async fn validate_target(
    url: &str,
    allowlist: &[IpAddr],
    ssrf_protection: bool,
) -> Result<(), AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::Configuration(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Configuration(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Configuration("URL has no host".to_string()))?;

    let ips: Vec<IpAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
        vec![ip]
    } else {
        let port = parsed.port().unwrap_or(match parsed.scheme() {
            "https" => 443,
            _ => 80,
        });
        let addr = format!("{host}:{port}");
        let resolved: Vec<IpAddr> = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| AppError::Network(format!("DNS resolution failed for {host}: {e}")))?
            .map(|s| s.ip())
            .collect();
        if resolved.is_empty() {
            return Err(AppError::Network(format!(
                "DNS resolution returned no addresses for {host}"
            )));
        }
        resolved
    };

    check_ips(host, &ips, allowlist, ssrf_protection)
}

fn check_ips(
    host: &str,
    ips: &[IpAddr],
    allowlist: &[IpAddr],
    ssrf_protection: bool,
) -> Result<(), AppError> {
    if !allowlist.is_empty() {
        for ip in ips {
            if !allowlist.contains(ip) {
                return Err(AppError::Network(format!(
                    "Blocked: {host} resolves to {ip}, not on the group's IP allowlist"
                )));
            }
        }
        return Ok(());
    }

    if ssrf_protection {
        for ip in ips {
            if is_private_ip(*ip) {
                return Err(AppError::Network(format!(
                    "SSRF blocked: {host} resolves to private/reserved IP {ip}"
                )));
            }
        }
    }
    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()           // 127.0.0.0/8
                || v4.is_private()     // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()  // 169.254.0.0/16 (cloud metadata!)
                || v4.is_unspecified() // 0.0.0.0
                || v4.is_broadcast()   // 255.255.255.255
                || v4.is_documentation() // 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()       // ::1
                || v6.is_unspecified() // ::
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // IPv4-mapped IPv6 (::ffff:x.x.x.x) — check the embedded v4
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}
