use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use atelier_contracts::config::{RetryPolicy, ServiceConfig};
use atelier_contracts::errors::{CallFailure, ErrorKind, PipelineResult};
use atelier_contracts::events::{EventLog, RequestLog};
use atelier_contracts::functions::{
    default_instruction, optimize_instruction, ChatInstruction, FunctionCatalog,
};
use reqwest::blocking::Client as HttpClient;
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Transport-level failure: the call produced no HTTP response at all.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFailure {
    TimedOut(String),
    TlsFailed(String),
    ConnectFailed(String),
}

impl TransportFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportFailure::TimedOut(_) => ErrorKind::TimedOut,
            TransportFailure::TlsFailed(_) => ErrorKind::TlsFailed,
            TransportFailure::ConnectFailed(_) => ErrorKind::ConnectFailed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TransportFailure::TimedOut(message)
            | TransportFailure::TlsFailed(message)
            | TransportFailure::ConnectFailed(message) => message,
        }
    }
}

/// What one outbound attempt produced. Received responses are data even
/// when the status is 4xx/5xx; classification belongs to the retry engine.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpOutcome {
    Response { status: u16, body: String },
    Transport(TransportFailure),
}

pub struct HttpClientAdapter {
    http: HttpClient,
}

impl HttpClientAdapter {
    /// Builds the shared client. `verify_tls=false` maps to
    /// `danger_accept_invalid_certs`; callers are expected to have made
    /// that choice explicitly in configuration.
    pub fn new(verify_tls: bool) -> Result<Self> {
        let http = HttpClient::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }

    pub fn post_json(
        &self,
        url: &str,
        payload: &Value,
        headers: &[(&str, String)],
        timeout: Duration,
    ) -> HttpOutcome {
        let mut request = self.http.post(url).timeout(timeout).json(payload);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let response = match request.send() {
            Ok(response) => response,
            Err(err) => return HttpOutcome::Transport(classify_transport(&err)),
        };
        let status = response.status().as_u16();
        match response.text() {
            Ok(body) => HttpOutcome::Response { status, body },
            Err(err) => HttpOutcome::Transport(classify_transport(&err)),
        }
    }
}

fn classify_transport(err: &reqwest::Error) -> TransportFailure {
    let text = error_chain_text(err);
    if err.is_timeout() {
        return TransportFailure::TimedOut(text);
    }
    let lowered = text.to_ascii_lowercase();
    if lowered.contains("tls")
        || lowered.contains("ssl")
        || lowered.contains("certificate")
        || lowered.contains("handshake")
    {
        return TransportFailure::TlsFailed(text);
    }
    TransportFailure::ConnectFailed(text)
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty()
            && parts
                .last()
                .map(|existing| existing.as_str() != trimmed)
                .unwrap_or(true)
        {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    parts.join(" | caused by: ")
}

/// How the retry engine reacts to one classified attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    Retry(ErrorKind),
    Fail(ErrorKind),
}

/// Classifies one attempt outcome. The decision depends only on the
/// outcome and the retryable set, never on the attempt number:
/// - 2xx is success
/// - 401 is terminal (credentials are not time-variant)
/// - statuses in the retryable set and all transport failures retry
/// - every other status is terminal; 400/403/404 are not transient
pub fn classify(outcome: &HttpOutcome, retryable_statuses: &BTreeSet<u16>) -> Disposition {
    match outcome {
        HttpOutcome::Response { status, .. } => {
            let status = *status;
            if (200..300).contains(&status) {
                Disposition::Success
            } else if status == 401 {
                Disposition::Fail(ErrorKind::AuthError)
            } else if retryable_statuses.contains(&status) {
                Disposition::Retry(ErrorKind::UpstreamServerError)
            } else {
                Disposition::Fail(ErrorKind::UpstreamServerError)
            }
        }
        HttpOutcome::Transport(failure) => Disposition::Retry(failure.kind()),
    }
}

/// Runs `op` up to `policy.max_attempts` times with a fixed backoff sleep
/// between attempts. Reusable for any outbound call: `op` receives the
/// 1-based attempt number and returns the attempt's `HttpOutcome`.
pub fn run_with_retries<F>(
    policy: &RetryPolicy,
    log: &RequestLog,
    call: &str,
    mut op: F,
) -> std::result::Result<String, CallFailure>
where
    F: FnMut(u32) -> Result<HttpOutcome>,
{
    let max_attempts = policy.max_attempts.max(1);
    let backoff = Duration::from_secs_f64(policy.backoff_seconds.max(0.0));
    let mut last_kind = ErrorKind::UpstreamServerError;
    let mut last_detail = String::new();

    for attempt in 1..=max_attempts {
        let outcome = match op(attempt) {
            Ok(outcome) => outcome,
            Err(err) => {
                return Err(CallFailure::new(
                    ErrorKind::UnknownError,
                    format!("{call} failed before reaching the upstream: {err:#}"),
                ));
            }
        };

        match classify(&outcome, &policy.retryable_statuses) {
            Disposition::Success => {
                note(
                    log,
                    "call_succeeded",
                    map_object(json!({ "call": call, "attempt": attempt })),
                );
                let HttpOutcome::Response { body, .. } = outcome else {
                    unreachable!("transport outcomes never classify as success");
                };
                return Ok(body);
            }
            Disposition::Fail(kind) => {
                let detail = outcome_detail(&outcome);
                note(
                    log,
                    "call_failed",
                    map_object(json!({
                        "call": call,
                        "attempt": attempt,
                        "kind": kind.as_str(),
                        "detail": detail,
                    })),
                );
                return Err(terminal_failure(kind, call, &detail));
            }
            Disposition::Retry(kind) => {
                last_kind = kind;
                last_detail = outcome_detail(&outcome);
                note(
                    log,
                    "call_retry",
                    map_object(json!({
                        "call": call,
                        "attempt": attempt,
                        "max_attempts": max_attempts,
                        "kind": kind.as_str(),
                        "detail": last_detail,
                    })),
                );
                if attempt < max_attempts {
                    thread::sleep(backoff);
                }
            }
        }
    }

    let message = format!("{call} failed after {max_attempts} attempts; last error: {last_detail}");
    note(
        log,
        "call_failed",
        map_object(json!({
            "call": call,
            "attempt": max_attempts,
            "kind": last_kind.as_str(),
            "detail": last_detail,
        })),
    );
    Err(CallFailure::new(last_kind, message))
}

fn terminal_failure(kind: ErrorKind, call: &str, detail: &str) -> CallFailure {
    match kind {
        ErrorKind::AuthError => CallFailure::new(
            kind,
            format!("{call} authentication failed (status 401), contact the administrator"),
        ),
        _ => CallFailure::new(kind, format!("{call} failed: {detail}")),
    }
}

fn outcome_detail(outcome: &HttpOutcome) -> String {
    match outcome {
        HttpOutcome::Response { status, body } => {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("status {status}")
            } else {
                format!("status {status}: {}", truncate_text(trimmed, 256))
            }
        }
        HttpOutcome::Transport(failure) => failure.message().to_string(),
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

fn chat_messages(instruction: &ChatInstruction) -> Vec<ChatMessage<'_>> {
    vec![
        ChatMessage {
            role: "system",
            content: &instruction.system,
        },
        ChatMessage {
            role: "user",
            content: &instruction.user,
        },
    ]
}

fn extract_chat_reply(body: &str) -> std::result::Result<String, CallFailure> {
    let parsed: Value = serde_json::from_str(body).map_err(|_| {
        CallFailure::new(
            ErrorKind::MalformedUpstreamResponse,
            "chat response is not valid JSON",
        )
    })?;
    parsed
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| {
            CallFailure::new(
                ErrorKind::MalformedUpstreamResponse,
                "chat response has no message content",
            )
        })
}

/// Facade over the whole outbound pipeline. Every public entry point
/// returns a `PipelineResult`; no failure or panic crosses this boundary
/// in any other shape. Calls block, so run them on worker threads when
/// serving concurrent requests.
pub struct BrokerEngine {
    config: ServiceConfig,
    http: HttpClientAdapter,
    events: EventLog,
    functions: FunctionCatalog,
}

impl BrokerEngine {
    pub fn new(config: ServiceConfig, events: EventLog) -> Result<Self> {
        let http = HttpClientAdapter::new(config.verify_tls)?;
        if !config.verify_tls {
            let _ = events.record(
                "tls_verification_disabled",
                map_object(json!({
                    "detail": "certificate verification disabled by configuration",
                })),
            );
        }
        Ok(Self {
            config,
            http,
            events,
            functions: FunctionCatalog::new(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn functions(&self) -> &FunctionCatalog {
        &self.functions
    }

    pub fn event_log(&self) -> EventLog {
        self.events.clone()
    }

    /// Prompt optimization then image generation for one request.
    /// Optimization is best-effort: when it fails the raw text is used as
    /// the prompt and the degradation is only visible in the event log.
    pub fn generate_image(&self, raw_text: &str) -> PipelineResult {
        let log = self.events.request(Uuid::new_v4().to_string());
        note(
            &log,
            "generation_requested",
            map_object(json!({ "chars": raw_text.chars().count() })),
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.generate_image_inner(raw_text, &log)
        }));
        self.normalize(outcome, &log, "generation")
    }

    pub fn chat_reply(
        &self,
        message: &str,
        function_tag: Option<&str>,
        function_value: Option<&str>,
    ) -> PipelineResult {
        let log = self.events.request(Uuid::new_v4().to_string());
        note(
            &log,
            "chat_requested",
            map_object(json!({
                "function": function_tag,
                "chars": message.chars().count(),
            })),
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.chat_reply_inner(message, function_tag, function_value, &log)
        }));
        self.normalize(outcome, &log, "chat")
    }

    /// One non-retried image-API call for connectivity diagnosis.
    pub fn probe_image_endpoint(&self) -> Value {
        let log = self.events.request(Uuid::new_v4().to_string());
        let endpoint = &self.config.image;
        let report = match endpoint.api_key.as_deref() {
            None => json!({
                "ok": false,
                "kind": ErrorKind::AuthError.as_str(),
                "message": "image API credential is not configured",
            }),
            Some(api_key) => {
                let payload = json!({
                    "model": endpoint.model,
                    "action": "generate",
                    "size": endpoint.size,
                    "prompt": "connection probe",
                });
                let headers = [
                    ("authorization", api_key.to_string()),
                    ("accept", "application/json".to_string()),
                ];
                let timeout = Duration::from_secs_f64(self.config.chat_timeout_seconds);
                match self
                    .http
                    .post_json(&endpoint.api_url, &payload, &headers, timeout)
                {
                    HttpOutcome::Response { status, body } => json!({
                        "ok": (200..300).contains(&status),
                        "status": status,
                        "detail": truncate_text(body.trim(), 256),
                    }),
                    HttpOutcome::Transport(failure) => json!({
                        "ok": false,
                        "kind": failure.kind().as_str(),
                        "message": failure.message(),
                    }),
                }
            }
        };
        note(&log, "probe_completed", map_object(report.clone()));
        report
    }

    fn generate_image_inner(
        &self,
        raw_text: &str,
        log: &RequestLog,
    ) -> std::result::Result<String, CallFailure> {
        let prompt = match self.optimize_prompt(raw_text, log) {
            Ok(prompt) => {
                note(
                    log,
                    "prompt_optimized",
                    map_object(json!({ "chars": prompt.chars().count() })),
                );
                prompt
            }
            Err(failure) => {
                note(
                    log,
                    "optimization_degraded",
                    map_object(json!({
                        "kind": failure.kind.as_str(),
                        "detail": failure.message,
                        "fallback": "raw_text",
                    })),
                );
                raw_text.to_string()
            }
        };
        self.request_image(&prompt, log)
    }

    fn chat_reply_inner(
        &self,
        message: &str,
        function_tag: Option<&str>,
        function_value: Option<&str>,
        log: &RequestLog,
    ) -> std::result::Result<String, CallFailure> {
        if message.trim().is_empty() {
            return Err(CallFailure::new(
                ErrorKind::InvalidRequest,
                "message must not be empty",
            ));
        }
        let instruction = match function_tag.map(str::trim).filter(|tag| !tag.is_empty()) {
            Some(tag) => self
                .functions
                .parse(tag)?
                .instruction(message, function_value),
            None => default_instruction(message),
        };
        self.chat_completion(&instruction, log, "chat_reply")
    }

    fn optimize_prompt(
        &self,
        raw_text: &str,
        log: &RequestLog,
    ) -> std::result::Result<String, CallFailure> {
        self.chat_completion(&optimize_instruction(raw_text), log, "prompt_optimization")
    }

    fn chat_completion(
        &self,
        instruction: &ChatInstruction,
        log: &RequestLog,
        call: &str,
    ) -> std::result::Result<String, CallFailure> {
        let endpoint = &self.config.chat;
        let Some(api_key) = endpoint.api_key.as_deref() else {
            return Err(CallFailure::new(
                ErrorKind::AuthError,
                format!("{call} failed: chat API credential is not configured"),
            ));
        };
        let payload = json!({
            "model": endpoint.model,
            "temperature": endpoint.temperature,
            "messages": chat_messages(instruction),
        });
        let headers = [
            ("authorization", format!("Bearer {api_key}")),
            ("accept", "application/json".to_string()),
        ];
        let timeout = Duration::from_secs_f64(self.config.chat_timeout_seconds);
        let body = run_with_retries(&self.config.retry, log, call, |_attempt| {
            Ok(self
                .http
                .post_json(&endpoint.api_url, &payload, &headers, timeout))
        })?;
        extract_chat_reply(&body)
    }

    fn request_image(
        &self,
        prompt: &str,
        log: &RequestLog,
    ) -> std::result::Result<String, CallFailure> {
        let endpoint = &self.config.image;
        let Some(api_key) = endpoint.api_key.as_deref() else {
            return Err(CallFailure::new(
                ErrorKind::AuthError,
                "image generation failed: image API credential is not configured",
            ));
        };
        let payload = json!({
            "model": endpoint.model,
            "action": "generate",
            "size": endpoint.size,
            "prompt": prompt,
        });
        let headers = [
            ("authorization", api_key.to_string()),
            ("accept", "application/json".to_string()),
        ];
        let timeout = Duration::from_secs_f64(self.config.image_timeout_seconds);
        let body = run_with_retries(&self.config.retry, log, "image_generation", |_attempt| {
            Ok(self
                .http
                .post_json(&endpoint.api_url, &payload, &headers, timeout))
        })?;
        serde_json::from_str::<Value>(&body).map_err(|_| {
            CallFailure::new(
                ErrorKind::MalformedUpstreamResponse,
                "image response is not valid JSON",
            )
        })?;
        Ok(body)
    }

    fn normalize(
        &self,
        outcome: thread::Result<std::result::Result<String, CallFailure>>,
        log: &RequestLog,
        operation: &str,
    ) -> PipelineResult {
        match outcome {
            Ok(Ok(data)) => {
                note(
                    log,
                    &format!("{operation}_succeeded"),
                    map_object(json!({ "chars": data.chars().count() })),
                );
                PipelineResult::Ok(data)
            }
            Ok(Err(failure)) => {
                note(
                    log,
                    &format!("{operation}_failed"),
                    map_object(json!({
                        "kind": failure.kind.as_str(),
                        "detail": failure.message,
                    })),
                );
                PipelineResult::Err(failure)
            }
            Err(payload) => {
                let message = format!("{operation} aborted unexpectedly: {}", panic_text(payload));
                note(
                    log,
                    &format!("{operation}_failed"),
                    map_object(json!({
                        "kind": ErrorKind::UnknownError.as_str(),
                        "detail": message,
                    })),
                );
                PipelineResult::Err(CallFailure::new(ErrorKind::UnknownError, message))
            }
        }
    }
}

fn note(log: &RequestLog, event: &str, payload: Map<String, Value>) {
    let _ = log.record(event, payload);
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "panic with non-text payload".to_string()
}
