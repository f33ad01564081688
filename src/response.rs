//! Result contexts exposed to extractors and validators.

use crate::client::{HttpRequest, HttpResponse, RequestBody};
use crate::error::{Result, RunnerError};
use serde_json::{json, Map, Value};

/// Join `path` onto `base_url` unless `path` is already absolute.
///
/// The join is textual: `http://h/api` + `/users` gives
/// `http://h/api/users`.
pub fn build_url(base_url: &str, path: &str) -> Result<String> {
    let url = if path.contains("://") || base_url.is_empty() {
        path.to_string()
    } else if path.is_empty() {
        base_url.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    };

    url::Url::parse(&url).map_err(|e| RunnerError::InvalidUrl {
        url: url.clone(),
        reason: e.to_string(),
    })?;
    Ok(url)
}

/// The `request` object bound before setup hooks run.
pub fn request_context(request: &HttpRequest) -> Value {
    let body = request.body.as_ref().map(|body| match body {
        RequestBody::Json(value) => value.clone(),
        RequestBody::Form(fields) => json!(fields),
        RequestBody::Text(text) => Value::String(text.clone()),
    });
    json!({
        "method": request.method.to_string(),
        "url": request.url,
        "headers": request.headers,
        "params": request
            .params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<String, Value>>(),
        "cookies": request.cookies,
        "body": body,
    })
}

/// The `response` object of an API step.
///
/// `body` is the parsed JSON document when the payload is JSON and the
/// raw text otherwise.
pub fn response_context(response: &HttpResponse) -> Value {
    let body = serde_json::from_str::<Value>(&response.body)
        .unwrap_or_else(|_| Value::String(response.body.clone()));
    let headers: Map<String, Value> = response
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let cookies: Map<String, Value> = response
        .cookies
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    json!({
        "status_code": response.status,
        "headers": headers,
        "cookies": cookies,
        "body": body,
        "text": response.body,
        "elapsed": response.elapsed_ms,
        "url": response.url,
    })
}

/// Context of a SQL step.
pub fn rows_context(rows: &[Map<String, Value>]) -> Value {
    json!({
        "rows": rows,
        "row_count": rows.len(),
    })
}
