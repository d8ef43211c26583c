//! The `http` built-in, independent of any script engine.
//!
//! Options are validated into an [`HttpRequest`] before anything touches the
//! network. [`HttpClient::send`] then performs exactly one blocking request,
//! timing it from send to full body read, and returns the response together
//! with a [`ResultHandle`] the script uses to classify the call.
use std::{collections::BTreeMap, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use itertools::Itertools;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::{
    error::HttpError,
    record::{TIMEOUT, TRANSPORT_ERROR},
    recorder::{Recorder, ResultHandle},
};

/// Record type of http calls.
pub const RECORD_TYPE: &str = "http";

/// Options accepted by `http(options)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct HttpOptions {
    pub method:  String,
    pub url:     String,
    pub body:    String,
    pub headers: BTreeMap<String, serde_json::Value>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self { method: Method::GET.to_string(), url: String::new(), body: String::new(), headers: BTreeMap::new() }
    }
}

impl HttpOptions {
    /// Reads options from their JSON form.
    pub fn from_json(json: &str) -> Result<Self, HttpError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validates the options.
    pub fn into_request(self) -> Result<HttpRequest, HttpError> {
        if self.url.trim().is_empty() {
            return Err(HttpError::EmptyUrl);
        }
        let url = Url::parse(&self.url)
            .map_err(|e| HttpError::InvalidUrl { url: self.url.clone(), reason: e.to_string() })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HttpError::UnsupportedScheme(url.scheme().to_owned()));
        }

        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| HttpError::InvalidMethod(self.method.clone()))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers {
            let invalid = |reason: String| HttpError::InvalidHeader { name: name.clone(), reason };
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
            let header_value = HeaderValue::from_str(&value).map_err(|e| invalid(e.to_string()))?;
            headers.insert(header_name, header_value);
        }

        Ok(HttpRequest { method, url, body: self.body, headers })
    }
}

/// A validated request.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct HttpRequest {
    pub method:  Method,
    pub url:     Url,
    pub body:    String,
    pub headers: HeaderMap,
}

/// The response handed back to the script.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct HttpResponse {
    /// Status code, `0` when no response was received.
    pub status_code:    u16,
    /// Status line, e.g. `200 OK`.
    pub status:         String,
    pub content_length: Option<u64>,
    pub body:           String,
    /// Response headers; repeated headers are joined with `;`.
    pub headers:        BTreeMap<String, String>,
    /// Transport error message when no response was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error:          Option<String>,
}

/// A finished call: the response and the handle to classify it with.
#[derive(Debug)]
#[allow(missing_docs)]
pub struct Exchange {
    pub response: HttpResponse,
    pub result:   ResultHandle,
}

/// Blocking http client shared by every virtual user.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client:  reqwest::Client,
    handle:  Handle,
    verbose: bool,
}

impl HttpClient {
    /// Drives `future` to completion on the client's runtime.
    ///
    /// Must not be called from an async context.
    pub(crate) fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Builds a client whose requests are driven on `handle`.
    pub fn new(handle: Handle, timeout: Option<Duration>, verbose: bool) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(HttpError::Client)?;
        Ok(Self { client, handle, verbose })
    }

    /// Performs one request and times it.
    ///
    /// Blocks the calling thread; must not be called from async code.
    /// Transport failures do not return an error: the response carries the
    /// message and the record is provisionally failed as `timeout` or `error`.
    pub fn send(&self, recorder: &Recorder, request: HttpRequest) -> Exchange {
        let mut record = recorder.new_record(RECORD_TYPE);
        record.set("method", request.method.as_str());
        record.set("url", request.url.as_str());

        let req = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body);

        record.start();
        let result = self.handle.block_on(async {
            let resp = req.send().await?;
            let status = resp.status();
            let headers = join_headers(resp.headers());
            let content_length = resp.content_length();
            let body = resp.text().await?;
            Ok::<_, reqwest::Error>(HttpResponse {
                status_code: status.as_u16(),
                status: status.to_string(),
                content_length,
                body,
                headers,
                error: None,
            })
        });
        record.end();

        let response = match result {
            Ok(response) => {
                record.set("status", response.status_code);
                if self.verbose {
                    tracing::info!(status = response.status_code, body = %response.body, "response");
                }
                response
            }
            Err(e) => {
                let reason = if e.is_timeout() { TIMEOUT } else { TRANSPORT_ERROR };
                tracing::debug!(error = %e, reason, "request failed");
                record.failed(reason);
                HttpResponse { error: Some(e.to_string()), ..Default::default() }
            }
        };

        Exchange { response, result: ResultHandle::new(record, recorder.clone()) }
    }
}

fn join_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .keys()
        .map(|name| {
            let values = headers.get_all(name).iter().filter_map(|v| v.to_str().ok()).join(";");
            (name.to_string(), values)
        })
        .collect()
}
