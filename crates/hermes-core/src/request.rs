//! Dispatch-time request assembly.
//!
//! Merges job and URL-group configuration into a [`PreparedRequest`] and
//! defines the [`HttpDispatcher`] boundary the execution backend
//! implements (reqwest in `hermes-client`, mocks in tests).

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use url::Url;

use crate::config::UrlGroup;
use crate::error::AppError;
use crate::job::Job;
use crate::signing::{SIGNATURE_HEADER, compute_signature};

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// A fully-resolved HTTP request, ready for the dispatcher.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    /// Merged headers in insertion order: group defaults first, then job
    /// headers, then the signature.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
    /// From the URL group; dispatchers must refuse hosts resolving
    /// outside this list when it is non-empty.
    pub ip_allowlist: Vec<IpAddr>,
}

/// The response surface the core classifies on.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Leading bytes of the response body, for the error log.
    pub body_snippet: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes a prepared request within its timeout.
///
/// Implementations map transport failures onto [`AppError::Timeout`] and
/// [`AppError::Network`]; non-2xx statuses come back as an `Ok` response
/// for the processor to classify.
pub trait HttpDispatcher: Send + Sync + Clone {
    fn execute(
        &self,
        request: &PreparedRequest,
    ) -> impl Future<Output = Result<HttpResponse, AppError>> + Send;
}

/// Resolve the job URL against the group's base URL when relative.
fn resolve_url(job: &Job, group: Option<&UrlGroup>) -> Result<String, AppError> {
    match Url::parse(&job.url) {
        Ok(url) => Ok(url.to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = group
                .and_then(|g| g.base_url.as_deref())
                .ok_or_else(|| {
                    AppError::Configuration(format!(
                        "relative URL '{}' with no base_url to join against",
                        job.url
                    ))
                })?;
            let base = Url::parse(base)
                .map_err(|e| AppError::Configuration(format!("invalid base_url '{base}': {e}")))?;
            let joined = base
                .join(&job.url)
                .map_err(|e| AppError::Configuration(format!("cannot join '{}': {e}", job.url)))?;
            Ok(joined.to_string())
        }
        Err(e) => Err(AppError::Configuration(format!(
            "invalid URL '{}': {e}",
            job.url
        ))),
    }
}

/// Build the request for one attempt: resolve the URL, merge headers
/// (job wins over group defaults), and attach the HMAC signature when the
/// group carries auth config.
pub fn build_request(job: &Job, group: Option<&UrlGroup>) -> Result<PreparedRequest, AppError> {
    let method = job.method.to_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(AppError::Configuration(format!(
            "unsupported HTTP method '{}'",
            job.method
        )));
    }

    let url = resolve_url(job, group)?;

    let mut headers: Vec<(String, String)> = Vec::new();
    if let Some(group) = group {
        for (name, value) in &group.default_headers {
            if !job.headers.contains_key(name) {
                headers.push((name.clone(), value.clone()));
            }
        }
    }
    for (name, value) in &job.headers {
        headers.push((name.clone(), value.clone()));
    }

    if let Some(auth) = group.and_then(|g| g.auth.as_ref()) {
        let signature =
            compute_signature(&auth.signing_key, &method, &url, job.body.as_deref())?;
        headers.push((SIGNATURE_HEADER.to_string(), signature));
    }

    Ok(PreparedRequest {
        method,
        url,
        headers,
        body: job.body.clone(),
        timeout: job.timeout(),
        ip_allowlist: group.map(|g| g.ip_allowlist.clone()).unwrap_or_default(),
    })
}
