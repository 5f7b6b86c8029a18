use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use inference_common::inference::{FailureKind, InferenceOutcome, InferenceRequest};

/// Anything that can take an inference request to a terminal outcome for a
/// single attempt. The worker only knows this trait; tests drive it with a
/// scripted in-memory provider.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Never returns an error: timeouts, refused connections and bad
    /// responses all come back as `Failure` outcomes, keeping the caller's
    /// control flow uniform.
    async fn infer(&self, request: &InferenceRequest) -> InferenceOutcome;
}

#[derive(Error, Debug)]
pub enum InferenceClientError {
    #[error("error parsing inference endpoint url")]
    ParseUrlError(#[from] url::ParseError),
    #[error("failed to construct http client: {0}")]
    BuildClientError(reqwest::Error),
    #[error("inference endpoint health check failed: {0}")]
    HealthcheckError(reqwest::Error),
}

/// HTTP client for an OpenAI-compatible completions endpoint. Owns its
/// connection pool; requests acquire connections per attempt and release
/// them on every exit path, including timeouts.
pub struct InferenceClient {
    client: reqwest::Client,
    completions_url: Url,
    health_url: Url,
}

impl InferenceClient {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, InferenceClientError> {
        let base: Url = endpoint.parse()?;
        let completions_url = base.join("v1/completions")?;
        let health_url = base.join("health")?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Document Inference Worker")
            .timeout(request_timeout)
            .build()
            .map_err(InferenceClientError::BuildClientError)?;

        Ok(Self {
            client,
            completions_url,
            health_url,
        })
    }

    /// Probe the endpoint once; run at startup, where failure is fatal.
    pub async fn healthcheck(&self) -> Result<(), InferenceClientError> {
        self.client
            .get(self.health_url.clone())
            .send()
            .await
            .map_err(InferenceClientError::HealthcheckError)?
            .error_for_status()
            .map_err(InferenceClientError::HealthcheckError)?;

        Ok(())
    }
}

#[async_trait]
impl InferenceProvider for InferenceClient {
    async fn infer(&self, request: &InferenceRequest) -> InferenceOutcome {
        let started = Instant::now();

        let response = match self
            .client
            .post(self.completions_url.clone())
            .json(request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return failure_from_request_error(&error),
        };

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after_header(response.headers());
            return InferenceOutcome::Failure {
                kind: FailureKind::RateLimited { retry_after },
                message: format!("endpoint rate limited the request ({})", status),
            };
        }

        if status.is_server_error() {
            return InferenceOutcome::Failure {
                kind: FailureKind::Unavailable,
                message: format!("endpoint returned {}", status),
            };
        }

        if !status.is_success() {
            return InferenceOutcome::Failure {
                kind: FailureKind::InvalidResponse,
                message: format!("endpoint returned {}", status),
            };
        }

        let completion = match response.json::<CompletionResponse>().await {
            Ok(completion) => completion,
            Err(error) if error.is_timeout() => {
                return InferenceOutcome::Failure {
                    kind: FailureKind::Timeout,
                    message: format!("timed out reading completion response: {}", error),
                }
            }
            Err(error) => {
                return InferenceOutcome::Failure {
                    kind: FailureKind::InvalidResponse,
                    message: format!("failed to decode completion response: {}", error),
                }
            }
        };

        completion.into_outcome(started.elapsed())
    }
}

fn failure_from_request_error(error: &reqwest::Error) -> InferenceOutcome {
    if error.is_timeout() {
        InferenceOutcome::Failure {
            kind: FailureKind::Timeout,
            message: format!("request timed out: {}", error),
        }
    } else {
        // Refused or reset connections, DNS failures: the endpoint is
        // unreachable, not answering badly.
        InferenceOutcome::Failure {
            kind: FailureKind::Unavailable,
            message: format!("failed to reach endpoint: {}", error),
        }
    }
}

/// Completions response as served by vLLM-compatible endpoints. Only the
/// fields the worker consumes are modelled.
#[derive(Deserialize, Debug)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    text: String,
}

#[derive(Deserialize, Debug)]
struct CompletionUsage {
    completion_tokens: u64,
}

impl CompletionResponse {
    fn into_outcome(self, latency: Duration) -> InferenceOutcome {
        let token_count = self
            .usage
            .map(|usage| usage.completion_tokens)
            .unwrap_or_default();

        match self.choices.into_iter().next() {
            Some(choice) => InferenceOutcome::Success {
                text: choice.text,
                token_count,
                latency,
            },
            None => InferenceOutcome::Failure {
                kind: FailureKind::InvalidResponse,
                message: "completion response contained no choices".to_owned(),
            },
        }
    }
}

/// Attempt to parse a Duration from a Retry-After header, returning None if
/// not possible. The header can carry a number of seconds or an RFC 2822
/// date; we try to parse both. A date in the past yields None.
fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(seconds) = retry_after.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let until = chrono::DateTime::<chrono::offset::Utc>::from(date) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return until.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn request() -> InferenceRequest {
        InferenceRequest {
            model: "mock-llm".to_owned(),
            prompt: "Extract the key financial information from the following earnings-report document:\n\nApple reported Q4 revenue of $89.5B".to_owned(),
            max_tokens: 100,
            temperature: 0.7,
        }
    }

    fn client_for(server: &MockServer) -> InferenceClient {
        InferenceClient::new(&server.base_url(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_infer_success() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"id":"mock-1","object":"text_completion","model":"mock-llm","choices":[{"text":"Revenue: $89.5B | Change: 1%","index":0,"finish_reason":"length"}],"usage":{"prompt_tokens":12,"completion_tokens":5,"total_tokens":17}}"#);
        });

        let outcome = client_for(&server).infer(&request()).await;

        match outcome {
            InferenceOutcome::Success {
                text, token_count, ..
            } => {
                assert_eq!(text, "Revenue: $89.5B | Change: 1%");
                assert_eq!(token_count, 5);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_infer_rate_limited_with_retry_after() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/completions");
            then.status(429).header("Retry-After", "120");
        });

        let outcome = client_for(&server).infer(&request()).await;

        match outcome {
            InferenceOutcome::Failure {
                kind: FailureKind::RateLimited { retry_after },
                ..
            } => assert_eq!(retry_after, Some(Duration::from_secs(120))),
            other => panic!("expected rate limited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_infer_server_error_is_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/completions");
            then.status(503);
        });

        let outcome = client_for(&server).infer(&request()).await;

        assert!(matches!(
            outcome,
            InferenceOutcome::Failure {
                kind: FailureKind::Unavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_infer_client_error_is_invalid_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/completions");
            then.status(404);
        });

        let outcome = client_for(&server).infer(&request()).await;

        assert!(matches!(
            outcome,
            InferenceOutcome::Failure {
                kind: FailureKind::InvalidResponse,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_infer_undecodable_body_is_invalid_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/completions");
            then.status(200).body("not json");
        });

        let outcome = client_for(&server).infer(&request()).await;

        assert!(matches!(
            outcome,
            InferenceOutcome::Failure {
                kind: FailureKind::InvalidResponse,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_infer_empty_choices_is_invalid_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":0,"total_tokens":1}}"#);
        });

        let outcome = client_for(&server).infer(&request()).await;

        assert!(matches!(
            outcome,
            InferenceOutcome::Failure {
                kind: FailureKind::InvalidResponse,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_infer_timeout() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/completions");
            then.status(200)
                .body(r#"{"choices":[{"text":"late"}]}"#)
                .delay(Duration::from_millis(500));
        });

        let client = InferenceClient::new(&server.base_url(), Duration::from_millis(100)).unwrap();
        let outcome = client.infer(&request()).await;

        assert!(matches!(
            outcome,
            InferenceOutcome::Failure {
                kind: FailureKind::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_infer_unreachable_endpoint_is_unavailable() {
        // Nothing listens on port 1.
        let client = InferenceClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let outcome = client.infer(&request()).await;

        assert!(matches!(
            outcome,
            InferenceOutcome::Failure {
                kind: FailureKind::Unavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200).body(r#"{"status": "healthy"}"#);
        });

        client_for(&server).healthcheck().await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_healthcheck_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(500);
        });

        assert!(client_for(&server).healthcheck().await.is_err());
    }

    #[test]
    fn test_parse_retry_after_header() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, "120".parse().unwrap());

        let duration = parse_retry_after_header(&headers).unwrap();
        assert_eq!(duration, Duration::from_secs(120));

        headers.remove(header::RETRY_AFTER);

        let duration = parse_retry_after_header(&headers);
        assert_eq!(duration, None);

        // A date in the past cannot produce a sensible delay.
        headers.insert(
            header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );

        let duration = parse_retry_after_header(&headers);
        assert_eq!(duration, None);
    }
}
