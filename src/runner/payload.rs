//! Stage request/result types and executor-response interpretation.
//!
//! The executor's stdout may be a JSON envelope (`{"status": …,
//! "is_error": …, "result": "…"}`) or bare text. Interpretation is pure:
//! [`classify_response`] turns exit status plus raw streams into one of
//! success-with-payload, error, or rate-limited, and the runner composes
//! retry/backoff around it.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::RunnerError;
use crate::runner::rate_limit;
use crate::tier::Tier;
use crate::util;

/// Outcome class of one executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Success,
    Error,
    RateLimit,
}

/// What one stage asks of the executor.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// Log/display identifier, e.g. `plan` or `implement-task-3`
    pub stage_id: String,
    pub prompt: String,
    /// JSON schema text for the expected structured result; embedded in
    /// the prompt so the executor knows the contract
    pub schema: String,
    pub tier: Tier,
}

impl StageRequest {
    pub fn new(
        stage_id: impl Into<String>,
        prompt: impl Into<String>,
        schema: impl Into<String>,
        tier: Tier,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            prompt: prompt.into(),
            schema: schema.into(),
            tier,
        }
    }
}

/// Ephemeral result of one stage invocation. Lives in memory and in the
/// invocation log, never in the status document.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub status: ResultStatus,
    pub payload: Value,
    pub error_message: Option<String>,
}

impl StageResult {
    pub fn success(payload: Value) -> Self {
        Self {
            status: ResultStatus::Success,
            payload,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            payload: Value::Null,
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Deserialize the payload into the stage's expected shape. A payload
    /// that does not fit the shape is the same failure as a missing one:
    /// downstream stages cannot proceed on it.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, RunnerError> {
        if self.payload.is_null() {
            return Err(RunnerError::MissingPayload);
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| RunnerError::InvalidPayload(e.to_string()))
    }
}

/// Envelope some executors wrap their response in. All fields optional;
/// bare-text responses simply fail the envelope parse.
#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default, alias = "subtype")]
    status: Option<String>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    result: Option<String>,
}

/// Classification of one raw invocation, before any retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Structured payload extracted and parseable as JSON.
    Success(Value),
    /// Executor failed, or succeeded without a structured payload.
    Error(String),
    /// Rate limited; the body drives wait extraction.
    RateLimit { body: String },
}

/// Interpret exit status and raw output streams.
///
/// Rate-limit detection runs before error mapping and is two-tier: the
/// envelope's structured status decides when present; otherwise phrase
/// matching applies only to error-flagged responses.
pub fn classify_response(exit_ok: bool, stdout: &str, stderr: &str) -> Classified {
    let envelope: Option<ResponseEnvelope> = serde_json::from_str(stdout.trim()).ok();
    let (status, envelope_error, body) = match &envelope {
        Some(env) => (
            env.status.as_deref(),
            env.is_error.unwrap_or(false) || matches!(env.status.as_deref(), Some("error")),
            env.result.clone().unwrap_or_default(),
        ),
        None => (None, false, stdout.to_string()),
    };
    let is_error = !exit_ok || envelope_error;
    let sniff_text = format!("{body}\n{stderr}");

    if rate_limit::is_rate_limited(status, is_error, &sniff_text) {
        return Classified::RateLimit { body: sniff_text };
    }
    if is_error {
        let detail = last_nonempty_line(stderr)
            .or_else(|| last_nonempty_line(&body))
            .unwrap_or_else(|| "executor reported failure".to_string());
        return Classified::Error(detail);
    }
    match util::extract_last_json_object(&body) {
        Some(json) => match serde_json::from_str::<Value>(&json) {
            Ok(value) => Classified::Success(value),
            Err(e) => Classified::Error(format!("structured output is not valid JSON: {e}")),
        },
        None => Classified::Error("no structured output".to_string()),
    }
}

fn last_nonempty_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_with_enveloped_payload() {
        let stdout = r#"{"status": "success", "is_error": false,
            "result": "All done.\n{\"verdict\": \"approve\"}"}"#;
        match classify_response(true, stdout, "") {
            Classified::Success(value) => {
                assert_eq!(value, json!({"verdict": "approve"}));
            }
            other => panic!("Expected Success, got {other:?}"),
        }
    }

    #[test]
    fn test_success_with_bare_text_payload() {
        let stdout = r#"notes first, then {"tasks": [{"id": 1}]}"#;
        match classify_response(true, stdout, "") {
            Classified::Success(value) => {
                assert_eq!(value["tasks"][0]["id"], 1);
            }
            other => panic!("Expected Success, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_prefers_last_json_object() {
        let stdout = r#"example: {"draft": 1} final: {"draft": 2}"#;
        match classify_response(true, stdout, "") {
            Classified::Success(value) => assert_eq!(value["draft"], 2),
            other => panic!("Expected Success, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_payload_is_an_error() {
        match classify_response(true, "finished, nothing structured", "") {
            Classified::Error(msg) => assert_eq!(msg, "no structured output"),
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_envelope_error_flag_maps_to_error() {
        let stdout = r#"{"is_error": true, "result": "could not apply the change"}"#;
        match classify_response(true, stdout, "") {
            Classified::Error(msg) => assert!(msg.contains("could not apply")),
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_nonzero_exit_maps_to_error_with_stderr_detail() {
        match classify_response(false, "", "fatal: executor crashed\n") {
            Classified::Error(msg) => assert!(msg.contains("executor crashed")),
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_structured_rate_limit_status_wins() {
        let stdout = r#"{"status": "rate_limited", "result": "retry after 45"}"#;
        match classify_response(true, stdout, "") {
            Classified::RateLimit { body } => assert!(body.contains("retry after 45")),
            other => panic!("Expected RateLimit, got {other:?}"),
        }
    }

    #[test]
    fn test_text_rate_limit_requires_error_flag() {
        // successful response that merely discusses rate limits
        let ok = r#"{"is_error": false, "result": "documented the rate limit {\"done\": true}"}"#;
        assert!(matches!(classify_response(true, ok, ""), Classified::Success(_)));

        // failing response with the same words is a limit
        let failing = r#"{"is_error": true, "result": "rate limit exceeded"}"#;
        assert!(matches!(
            classify_response(true, failing, ""),
            Classified::RateLimit { .. }
        ));
    }

    #[test]
    fn test_exit_failure_with_limit_phrase_in_stderr() {
        match classify_response(false, "", "error: too many requests") {
            Classified::RateLimit { body } => assert!(body.contains("too many requests")),
            other => panic!("Expected RateLimit, got {other:?}"),
        }
    }

    #[test]
    fn test_stage_result_parse_typed() {
        #[derive(Deserialize)]
        struct Verdict {
            verdict: String,
        }
        let result = StageResult::success(json!({"verdict": "approve"}));
        let parsed: Verdict = result.parse().unwrap();
        assert_eq!(parsed.verdict, "approve");

        let wrong: Result<Verdict, _> = StageResult::success(json!({"other": 1})).parse();
        assert!(matches!(wrong, Err(RunnerError::InvalidPayload(_))));

        let missing: Result<Verdict, _> = StageResult::error("boom").parse();
        assert!(matches!(missing, Err(RunnerError::MissingPayload)));
    }
}
