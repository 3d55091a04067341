use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, AuthContext>>,
    limiter: Arc<TokenBuckets>,
}

/// Identity attached to the request once the key checks out. Handlers log
/// the org id; jobs carry it so a batch can be traced back to its submitter.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub org_id: String,
    pub api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        Self {
            keys: Arc::new(load_keys_from_env()),
            limiter: Arc::new(TokenBuckets::from_env()),
        }
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-OfferMart-Key or Bearer token",
        ));
    };

    let Some(context) = state.keys.get(&presented).cloned() else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    let outcome = state.limiter.consume(&context.org_id).await;
    if outcome.allowed {
        request.extensions_mut().insert(context);
        let mut response = next.run(request).await;
        outcome.apply_headers(response.headers_mut());
        Ok(response)
    } else {
        let mut response = error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Too many requests",
        );
        outcome.apply_headers(response.headers_mut());
        Ok(response)
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-OfferMart-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// `OFFERMART_API_KEYS` holds comma-separated `org:secret` pairs. Falls back
/// to demo credentials so local runs work without configuration.
fn load_keys_from_env() -> HashMap<String, AuthContext> {
    let raw = env::var("OFFERMART_API_KEYS").unwrap_or_else(|_| "demo-org:demo-key".to_string());
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.split_once(':') {
            Some((org, secret)) if !org.trim().is_empty() && !secret.trim().is_empty() => {
                entries.insert(
                    secret.trim().to_string(),
                    AuthContext {
                        org_id: org.trim().to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "offermart.api",
                "ignored malformed OFFERMART_API_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "offermart.api",
            "OFFERMART_API_KEYS produced no keys; falling back to demo credentials"
        );
        entries.insert(
            "demo-key".to_string(),
            AuthContext {
                org_id: "demo-org".to_string(),
                api_key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(
            target = "offermart.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }

    entries
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, BucketState>>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBuckets {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, key: &str) -> RateOutcome {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        let allowed = state.tokens >= 1.0;
        let retry_after = if allowed {
            state.tokens -= 1.0;
            None
        } else {
            Some(((1.0 - state.tokens) / self.rate_per_sec).max(0.0))
        };

        RateOutcome {
            allowed,
            retry_after,
            tokens: state.tokens,
            capacity: self.capacity,
            rate: self.rate_per_sec,
        }
    }
}

struct RateOutcome {
    allowed: bool,
    retry_after: Option<f64>,
    tokens: f64,
    capacity: f64,
    rate: f64,
}

impl RateOutcome {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert(
            "X-RateLimit-Limit",
            numeric_header(self.capacity as u64),
        );
        headers.insert("X-RateLimit-Remaining", numeric_header(remaining));
        headers.insert("X-RateLimit-Reset", numeric_header(reset));
        if let Some(retry_after) = self.retry_after {
            headers.insert(
                http::header::RETRY_AFTER,
                numeric_header(retry_after.ceil().max(0.0) as u64),
            );
        }
    }
}

fn numeric_header(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}
