//! Prometheus-style instant query backend.
//!
//! Issues `GET {endpoint}/api/v1/query?query=...` over plain HTTP/1 and
//! reads the first sample out of a vector or scalar result. The window
//! is a staleness bound: a sample older than the window is as good as
//! no sample.

use std::time::Duration;

use http_body_util::BodyExt;
use tracing::debug;

use surge_state::{MetricSample, MetricValue};

use crate::source::{BoxFuture, MetricSource, epoch_secs};

/// Queries a Prometheus-compatible HTTP API.
pub struct PromSource {
    /// Base URL, e.g. "http://127.0.0.1:9090".
    endpoint: String,
    /// Bound on the whole query round trip.
    timeout: Duration,
    /// Samples older than this are unavailable.
    window_secs: u64,
}

impl PromSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, window: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            window_secs: window.as_secs(),
        }
    }
}

impl MetricSource for PromSource {
    fn query(&self, expression: &str) -> BoxFuture {
        let endpoint = self.endpoint.clone();
        let expression = expression.to_string();
        let timeout = self.timeout;
        let window_secs = self.window_secs;
        Box::pin(async move {
            let observed_at = epoch_secs();
            let value = instant_query(&endpoint, &expression, timeout, window_secs).await;
            MetricSample {
                value,
                observed_at,
                query: expression,
            }
        })
    }
}

/// Run one instant query against the backend.
///
/// Every failure mode resolves to `Unavailable`; the distinction only
/// shows up in the debug logs.
async fn instant_query(
    endpoint: &str,
    expression: &str,
    timeout: Duration,
    window_secs: u64,
) -> MetricValue {
    let (address, base_path) = split_endpoint(endpoint);
    let uri = format!(
        "http://{address}{base_path}/api/v1/query?query={}",
        percent_encode(expression)
    );

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "metric query connection failed");
                return MetricValue::Unavailable;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "metric query handshake failed");
                return MetricValue::Unavailable;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("accept", "application/json")
            .header("user-agent", "surge-metrics/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, %uri, "metric query request invalid");
                return MetricValue::Unavailable;
            }
        };

        let resp = match sender.send_request(req).await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, %uri, "metric query request failed");
                return MetricValue::Unavailable;
            }
        };

        if !resp.status().is_success() {
            debug!(status = %resp.status(), %uri, "metric query non-2xx");
            return MetricValue::Unavailable;
        }

        let body = match resp.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, %uri, "metric query body read failed");
                return MetricValue::Unavailable;
            }
        };

        match parse_instant_query(&body) {
            Some((value, sample_ts)) => classify(value, sample_ts, epoch_secs(), window_secs),
            None => {
                debug!(%uri, "metric query body malformed or empty");
                MetricValue::Unavailable
            }
        }
    })
    .await;

    match result {
        Ok(value) => value,
        Err(_) => {
            debug!(%uri, "metric query timed out");
            MetricValue::Unavailable
        }
    }
}

/// Split a base URL into connect address and path prefix.
fn split_endpoint(endpoint: &str) -> (&str, &str) {
    let rest = endpoint.strip_prefix("http://").unwrap_or(endpoint);
    match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].trim_end_matches('/')),
        None => (rest, ""),
    }
}

/// Percent-encode a query expression for a URL query string.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Extract `(value, sample timestamp)` from an instant query response.
///
/// Accepts `vector` (first series wins) and `scalar` result types.
/// Error statuses, empty results, and malformed bodies all yield `None`.
fn parse_instant_query(body: &[u8]) -> Option<(f64, f64)> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    if json.get("status")?.as_str()? != "success" {
        return None;
    }
    let data = json.get("data")?;
    let pair = match data.get("resultType")?.as_str()? {
        "vector" => data.get("result")?.as_array()?.first()?.get("value")?.clone(),
        "scalar" => data.get("result")?.clone(),
        _ => return None,
    };
    let parts = pair.as_array()?;
    let sample_ts = parts.first()?.as_f64()?;
    let value = match parts.get(1)? {
        serde_json::Value::String(s) => s.parse::<f64>().ok()?,
        serde_json::Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    Some((value, sample_ts))
}

/// Apply finiteness and staleness checks to a parsed sample.
fn classify(value: f64, sample_ts: f64, now: u64, window_secs: u64) -> MetricValue {
    if !value.is_finite() {
        debug!(value, "non-finite metric value treated as unavailable");
        return MetricValue::Unavailable;
    }
    let age = now as f64 - sample_ts;
    if age > window_secs as f64 {
        debug!(age, window_secs, "stale metric sample treated as unavailable");
        return MetricValue::Unavailable;
    }
    MetricValue::Scalar(value)
}
