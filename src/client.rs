//! HTTP collaborator used by API steps.

use crate::model::HttpMethod;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method as ReqMethod};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

/// A fully resolved request, ready to send.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub params: Vec<(String, String)>,
    pub cookies: BTreeMap<String, String>,
    pub body: Option<RequestBody>,
    pub timeout: Option<Duration>,
    /// Verify TLS certificates.
    pub verify: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Form(BTreeMap<String, String>),
    Text(String),
}

impl RequestBody {
    /// Body as it is logged and recorded in the step trace.
    pub fn render(&self) -> String {
        match self {
            RequestBody::Json(value) => value.to_string(),
            RequestBody::Form(fields) => {
                url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(fields)
                    .finish()
            }
            RequestBody::Text(text) => text.clone(),
        }
    }
}

/// Response as seen by extractors and validators.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub body: String,
    pub elapsed_ms: u64,
    /// Final URL after redirects.
    pub url: String,
}

/// Sends HTTP requests on behalf of a run.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// `reqwest`-backed client with a persistent cookie store.
///
/// Two clients are built lazily: one verifying TLS certificates and
/// one accepting any certificate.
#[derive(Debug, Default)]
pub struct ReqwestClient {
    verified: OnceCell<Client>,
    insecure: OnceCell<Client>,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, verify: bool) -> Result<&Client> {
        let cell = if verify { &self.verified } else { &self.insecure };
        cell.get_or_try_init(|| async move {
            Client::builder()
                .cookie_store(true)
                .danger_accept_invalid_certs(!verify)
                .build()
                .context("Failed to build HTTP client")
        })
        .await
    }

    fn convert_method(method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    #[instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    async fn request(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let client = self.client(request.verify).await?;
        let mut req_builder = client
            .request(Self::convert_method(request.method), &request.url);

        for (name, value) in &request.headers {
            req_builder = req_builder.header(name, value);
        }
        if !request.cookies.is_empty() {
            let cookie = request
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            req_builder = req_builder.header(reqwest::header::COOKIE, cookie);
        }
        if !request.params.is_empty() {
            req_builder = req_builder.query(&request.params);
        }
        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }
        req_builder = match &request.body {
            Some(RequestBody::Json(value)) => req_builder.json(value),
            Some(RequestBody::Form(fields)) => req_builder.form(fields),
            Some(RequestBody::Text(text)) => req_builder.body(text.clone()),
            None => req_builder,
        };

        debug!("Sending request to {}", request.url);
        let started = Instant::now();
        let response =
            req_builder.send().await.context("Failed to send request")?;
        debug!("Received response with status: {}", response.status());

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let cookies = response
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        Ok(HttpResponse {
            status,
            headers,
            cookies,
            body,
            elapsed_ms: started.elapsed().as_millis() as u64,
            url,
        })
    }
}
