//! Detectors that call a hosted analyzer over HTTP (OCR, semantic tagging).

use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bon::Builder;
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};
use tracing::{debug, warn};

use super::{DetectTarget, Detector, DetectorError};
use crate::constants::USER_AGENT;

type DetectorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const BODY_SNIPPET_CHARS: usize = 256;

/// What the remote analyzer returns and how to read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RemoteKind {
    /// `{"text": "..."}` or `{"lines": ["..."]}`; words become labels.
    Ocr,
    /// `{"labels": ["..." | {"label": "...", "score": 0.9}]}`.
    Semantic,
}

#[derive(Debug, Clone, Builder)]
pub struct RemoteDetectorOptions {
    #[builder(into)]
    pub name: String,
    pub kind: RemoteKind,
    #[builder(into)]
    pub endpoint: String,
    #[builder(into)]
    pub api_token: Option<String>,
    #[builder(default = Duration::from_secs(20))]
    pub request_timeout: Duration,
    #[builder(default = NonZeroU32::new(10).expect("non-zero quota"))]
    pub requests_per_second: NonZeroU32,
    #[builder(default = 2)]
    pub max_retries: usize,
    /// OCR words shorter than this many characters are ignored.
    #[builder(default = 3)]
    pub min_token_chars: usize,
    /// Semantic labels scoring below this are ignored.
    #[builder(default = 0.0)]
    pub min_score: f32,
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    image_url: &'a str,
}

#[derive(Debug)]
struct AttemptError {
    error: DetectorError,
    retryable: bool,
}

impl AttemptError {
    fn fatal(error: DetectorError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }

    fn transient(error: DetectorError) -> Self {
        Self {
            error,
            retryable: true,
        }
    }
}

pub struct RemoteDetector {
    options: RemoteDetectorOptions,
    http: Client,
    limiter: Arc<DetectorRateLimiter>,
    backoff: ExponentialBuilder,
}

impl RemoteDetector {
    pub fn new(options: RemoteDetectorOptions) -> Result<Self, DetectorError> {
        let http = Client::builder()
            .timeout(options.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| DetectorError::Unavailable(format!("http client: {err}")))?;
        let quota = Quota::per_second(options.requests_per_second);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(options.max_retries)
            .with_jitter();

        Ok(Self {
            http,
            limiter: Arc::new(RateLimiter::direct(quota)),
            backoff,
            options,
        })
    }

    pub fn kind(&self) -> RemoteKind {
        self.options.kind
    }

    /// Hosted URL when available, otherwise the staged bytes inlined as a data URL.
    async fn image_url(&self, target: &DetectTarget) -> Result<String, DetectorError> {
        if let Some(url) = target.remote_url.as_deref() {
            return Ok(url.to_string());
        }
        let data = tokio::fs::read(&target.path).await.map_err(|err| {
            DetectorError::Unavailable(format!("read staged image {}: {err}", target.path.display()))
        })?;
        Ok(format!(
            "data:{};base64,{}",
            target.content_type,
            BASE64_STANDARD.encode(&data)
        ))
    }

    async fn invoke(&self, image_url: &str) -> Result<Value, AttemptError> {
        self.limiter.until_ready().await;

        let mut request = self
            .http
            .post(&self.options.endpoint)
            .json(&AnalyzeRequest { image_url });
        if let Some(token) = &self.options.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| {
            AttemptError::transient(DetectorError::Unavailable(format!("request failed: {err}")))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = DetectorError::Unavailable(format!(
                "analyzer returned {status}: {}",
                snippet(&body)
            ));
            return Err(if is_retryable_status(status) {
                AttemptError::transient(error)
            } else {
                AttemptError::fatal(error)
            });
        }

        response.json::<Value>().await.map_err(|err| {
            AttemptError::fatal(DetectorError::MalformedOutput(format!(
                "response is not JSON: {err}"
            )))
        })
    }

    fn decode(&self, body: &Value) -> Result<Vec<String>, DetectorError> {
        match self.options.kind {
            RemoteKind::Ocr => decode_ocr(body, self.options.min_token_chars),
            RemoteKind::Semantic => decode_semantic(body, self.options.min_score),
        }
    }
}

#[async_trait]
impl Detector for RemoteDetector {
    fn name(&self) -> &str {
        &self.options.name
    }

    async fn detect(&self, target: &DetectTarget) -> Result<Vec<String>, DetectorError> {
        let image_url = self.image_url(target).await?;
        let attempt = || async { self.invoke(&image_url).await };
        let body = attempt
            .retry(self.backoff.clone())
            .when(|err: &AttemptError| err.retryable)
            .notify(|err: &AttemptError, delay: Duration| {
                warn!(
                    detector = %self.options.name,
                    item = %target.item,
                    error = %err.error,
                    delay_ms = delay.as_millis() as u64,
                    "retrying analyzer request"
                );
            })
            .await
            .map_err(|err| err.error)?;

        let labels = self.decode(&body)?;
        debug!(
            detector = %self.options.name,
            kind = self.options.kind.as_ref(),
            labels = labels.len(),
            "remote analyzer answered"
        );
        Ok(labels)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn word_pattern() -> &'static Regex {
    static WORDS: OnceLock<Regex> = OnceLock::new();
    WORDS.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid word regex"))
}

/// Split recognised text into word labels.
pub fn decode_ocr(body: &Value, min_token_chars: usize) -> Result<Vec<String>, DetectorError> {
    let text = match (body.get("text"), body.get("lines")) {
        (Some(Value::String(text)), _) => text.clone(),
        (_, Some(Value::Array(lines))) => lines
            .iter()
            .map(|line| {
                line.as_str().map(str::to_string).ok_or_else(|| {
                    DetectorError::MalformedOutput("`lines` must hold strings".into())
                })
            })
            .collect::<Result<Vec<_>, _>>()?
            .join("\n"),
        _ => {
            return Err(DetectorError::MalformedOutput(format!(
                "expected `text` or `lines`, got {}",
                snippet(&body.to_string())
            )));
        }
    };

    Ok(word_pattern()
        .find_iter(&text)
        .map(|word| word.as_str())
        .filter(|word| word.chars().count() >= min_token_chars)
        .map(str::to_string)
        .collect())
}

/// Read `labels`, accepting bare strings or `{label|name, score}` objects.
pub fn decode_semantic(body: &Value, min_score: f32) -> Result<Vec<String>, DetectorError> {
    let Some(Value::Array(entries)) = body.get("labels") else {
        return Err(DetectorError::MalformedOutput(format!(
            "expected `labels` array, got {}",
            snippet(&body.to_string())
        )));
    };

    let mut labels = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::String(label) => labels.push(label.clone()),
            Value::Object(map) => {
                let label = map
                    .get("label")
                    .or_else(|| map.get("name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        DetectorError::MalformedOutput("label object without `label`".into())
                    })?;
                let score = map.get("score").and_then(Value::as_f64).unwrap_or(1.0) as f32;
                if score >= min_score {
                    labels.push(label.to_string());
                }
            }
            other => {
                return Err(DetectorError::MalformedOutput(format!(
                    "unexpected label entry {other}"
                )));
            }
        }
    }
    Ok(labels)
}

fn snippet(text: &str) -> String {
    text.chars().take(BODY_SNIPPET_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ocr_text_is_split_into_words() {
        let labels = decode_ocr(&json!({"text": "STOP! Main St. 42 café"}), 3).expect("words");
        assert_eq!(labels, ["STOP", "Main", "café"]);
    }

    #[test]
    fn ocr_lines_are_accepted() {
        let labels = decode_ocr(&json!({"lines": ["Exit only", "no"]}), 2).expect("words");
        assert_eq!(labels, ["Exit", "only", "no"]);
    }

    #[test]
    fn ocr_requires_known_shape() {
        let err = decode_ocr(&json!({"words": []}), 3).expect_err("malformed");
        assert!(matches!(err, DetectorError::MalformedOutput(_)));
        let err = decode_ocr(&json!({"lines": [1, 2]}), 3).expect_err("malformed");
        assert!(matches!(err, DetectorError::MalformedOutput(_)));
    }

    #[test]
    fn semantic_filters_by_score() {
        let body = json!({
            "labels": [
                "outdoor",
                {"label": "beach", "score": 0.91},
                {"name": "sunset", "score": 0.4},
                {"label": "noise", "score": 0.05}
            ]
        });
        let labels = decode_semantic(&body, 0.3).expect("labels");
        assert_eq!(labels, ["outdoor", "beach", "sunset"]);
    }

    #[test]
    fn semantic_rejects_missing_labels() {
        assert!(decode_semantic(&json!({"tags": []}), 0.0).is_err());
        assert!(decode_semantic(&json!({"labels": [true]}), 0.0).is_err());
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn data_url_inlines_staged_bytes() {
        let temp = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(temp.path(), b"img").expect("write");
        let detector = RemoteDetector::new(
            RemoteDetectorOptions::builder()
                .name("ocr")
                .kind(RemoteKind::Ocr)
                .endpoint("http://127.0.0.1:9/ocr")
                .build(),
        )
        .expect("detector");

        let mut target = DetectTarget {
            item: "a.png".into(),
            path: temp.path().to_path_buf(),
            content_type: "image/png".into(),
            remote_url: None,
        };
        assert_eq!(
            detector.image_url(&target).await.expect("url"),
            format!("data:image/png;base64,{}", BASE64_STANDARD.encode(b"img"))
        );

        target.remote_url = Some("https://cdn.example/a.png".into());
        assert_eq!(
            detector.image_url(&target).await.expect("url"),
            "https://cdn.example/a.png"
        );
    }
}
