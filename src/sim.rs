//! In-process stand-in for a rate-limited API, used by the simulator binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bucket_dispatch::{HeaderNames, Response, TransportFailure};
use http::{HeaderName, HeaderValue, StatusCode};
use tokio::time::Instant;

struct Window {
    started: Instant,
    used: u32,
}

pub struct SimulatedApi {
    quota: u32,
    window: Duration,
    latency: Duration,
    /// Every n-th request answers with a global 429; 0 disables
    global_every: u64,
    served: AtomicU64,
    windows: Mutex<HashMap<String, Window>>,
    remaining_header: HeaderName,
    reset_header: HeaderName,
    global_header: HeaderName,
    via_header: HeaderName,
}

impl SimulatedApi {
    pub fn new(
        quota: u32,
        window: Duration,
        latency: Duration,
        global_every: u64,
        headers: &HeaderNames,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            quota,
            window,
            latency,
            global_every,
            served: AtomicU64::new(0),
            windows: Mutex::new(HashMap::new()),
            remaining_header: HeaderName::from_bytes(headers.remaining.as_bytes())?,
            reset_header: HeaderName::from_bytes(headers.reset.as_bytes())?,
            global_header: HeaderName::from_bytes(headers.global.as_bytes())?,
            via_header: HeaderName::from_bytes(headers.via.as_bytes())?,
        })
    }

    pub async fn handle(&self, bucket: &str) -> Result<Response, TransportFailure> {
        tokio::time::sleep(self.latency).await;

        let count = self.served.fetch_add(1, Ordering::Relaxed) + 1;
        if self.global_every > 0 && count % self.global_every == 0 {
            return Ok(self.throttled(true, Duration::from_millis(250)));
        }

        let now = Instant::now();
        let (remaining, reset) = {
            let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
            let window = windows.entry(bucket.to_string()).or_insert(Window {
                started: now,
                used: 0,
            });
            if now.duration_since(window.started) >= self.window {
                *window = Window {
                    started: now,
                    used: 0,
                };
            }

            let reset = self
                .window
                .saturating_sub(now.duration_since(window.started));
            if window.used >= self.quota {
                return Ok(self.throttled(false, reset));
            }
            window.used += 1;
            (self.quota - window.used, reset)
        };

        let reset = HeaderValue::from_str(&format!("{:.3}", reset.as_secs_f64()))
            .map_err(TransportFailure::from_error)?;
        Ok(Response::new(StatusCode::OK)
            .with_header(self.remaining_header.clone(), HeaderValue::from(remaining))
            .with_header(self.reset_header.clone(), reset)
            .with_header(self.via_header.clone(), HeaderValue::from_static("1.1 simulated-proxy")))
    }

    fn throttled(&self, global: bool, retry_after: Duration) -> Response {
        let body = serde_json::json!({
            "retry_after": retry_after.as_secs_f64(),
            "global": global,
        });
        let mut response = Response::new(StatusCode::TOO_MANY_REQUESTS)
            .with_header(self.via_header.clone(), HeaderValue::from_static("1.1 simulated-proxy"))
            .with_body(body.to_string());
        if global {
            response = response.with_header(self.global_header.clone(), HeaderValue::from_static("true"));
        }
        response
    }
}
