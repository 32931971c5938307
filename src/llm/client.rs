use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::{GenerateRequest, GenerateResponse, ModelError, Provider};
use crate::pipeline::prompts::{Facet, PromptSpec};
use crate::retry::RetryPolicy;
use crate::telemetry::metrics::{
    GEN_AI_ERROR_COUNT, GEN_AI_FALLBACK_COUNT, GEN_AI_OPERATION_DURATION, GEN_AI_RETRY_COUNT,
    GEN_AI_TOKEN_USAGE,
};

/// Raw model output for one facet, handed to the validator and then dropped.
#[derive(Debug, Clone)]
pub struct RawModelResponse {
    pub facet: Facet,
    pub content: String,
    pub model: String,
    pub provider: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub attempts: u32,
}

/// A model call that failed after the retry policy gave up.
#[derive(Debug, Clone)]
pub struct ModelFailure {
    pub error: ModelError,
    pub attempts: u32,
}

impl fmt::Display for ModelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} attempt(s)", self.error, self.attempts)
    }
}

struct Fallback {
    provider: Arc<dyn Provider>,
    model: String,
}

pub struct LlmClient {
    primary: Arc<dyn Provider>,
    fallback: Option<Fallback>,
    model: String,
    temperature: f32,
    retry: RetryPolicy,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(primary: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            primary,
            fallback: None,
            model: model.into(),
            temperature: 0.3,
            retry: RetryPolicy::model_default(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_fallback(mut self, provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        self.fallback = Some(Fallback {
            provider,
            model: model.into(),
        });
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sends one facet prompt through the primary provider, then the fallback.
    pub async fn invoke(&self, spec: &PromptSpec) -> Result<RawModelResponse, ModelFailure> {
        let req = GenerateRequest {
            model: self.model.clone(),
            system: spec.system.clone(),
            prompt: spec.prompt.clone(),
            temperature: self.temperature,
            max_tokens: spec.max_tokens,
            facet: spec.facet.as_str().to_string(),
            json_output: true,
        };

        let (resp, attempts) = self.generate(&req).await?;

        Ok(RawModelResponse {
            facet: spec.facet,
            content: resp.content,
            model: resp.model,
            provider: resp.provider,
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
            attempts,
        })
    }

    pub async fn generate_once(
        &self,
        provider: &dyn Provider,
        req: &GenerateRequest,
    ) -> Result<GenerateResponse, ModelError> {
        let provider_name = provider.name().to_string();
        let span_display_name = format!("gen_ai.chat {}", req.model);
        let start = Instant::now();

        let span = tracing::info_span!(
            "gen_ai.chat",
            otel.name = %span_display_name,
            gen_ai.operation.name = "chat",
            gen_ai.provider.name = %provider_name,
            gen_ai.request.model = %req.model,
            server.address = %provider.server_address(),
            gen_ai.request.temperature = req.temperature,
            gen_ai.request.max_tokens = req.max_tokens as i64,
            gen_ai.response.model = tracing::field::Empty,
            gen_ai.usage.input_tokens = tracing::field::Empty,
            gen_ai.usage.output_tokens = tracing::field::Empty,
            gen_ai.response.finish_reasons = tracing::field::Empty,
            analysis.facet = %req.facet,
            otel.status_code = tracing::field::Empty,
            error.type = tracing::field::Empty,
        );

        {
            let mut user_event_attrs =
                vec![KeyValue::new("gen_ai.prompt", truncate(&req.prompt, 1000))];
            if !req.system.is_empty() {
                user_event_attrs.push(KeyValue::new(
                    "gen_ai.system_instructions",
                    truncate(&req.system, 500),
                ));
            }
            span.add_event("gen_ai.user.message", user_event_attrs);
        }

        let result = match tokio::time::timeout(self.timeout, provider.generate(req))
            .instrument(span.clone())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout(format!(
                "no response within {}s",
                self.timeout.as_secs_f64()
            ))),
        };

        let duration = start.elapsed().as_secs_f64();

        match result {
            Ok(mut resp) => {
                resp.provider = provider_name.clone();

                span.record("gen_ai.response.model", resp.model.as_str());
                span.record("gen_ai.usage.input_tokens", resp.input_tokens as i64);
                span.record("gen_ai.usage.output_tokens", resp.output_tokens as i64);
                if !resp.finish_reason.is_empty() {
                    span.record(
                        "gen_ai.response.finish_reasons",
                        resp.finish_reason.as_str(),
                    );
                }

                span.add_event(
                    "gen_ai.assistant.message",
                    vec![KeyValue::new(
                        "gen_ai.completion",
                        truncate(&resp.content, 2000),
                    )],
                );

                let op_kv = KeyValue::new("gen_ai.operation.name", "chat");
                let provider_kv = KeyValue::new("gen_ai.provider.name", provider_name);
                let model_kv = KeyValue::new("gen_ai.request.model", resp.model.clone());

                GEN_AI_TOKEN_USAGE.record(
                    f64::from(resp.input_tokens),
                    &[
                        KeyValue::new("gen_ai.token.type", "input"),
                        op_kv.clone(),
                        provider_kv.clone(),
                        model_kv.clone(),
                    ],
                );
                GEN_AI_TOKEN_USAGE.record(
                    f64::from(resp.output_tokens),
                    &[
                        KeyValue::new("gen_ai.token.type", "output"),
                        op_kv.clone(),
                        provider_kv.clone(),
                        model_kv.clone(),
                    ],
                );
                GEN_AI_OPERATION_DURATION.record(duration, &[op_kv, provider_kv, model_kv]);

                Ok(resp)
            }
            Err(err) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.type", err.code());

                GEN_AI_ERROR_COUNT.add(
                    1,
                    &[
                        KeyValue::new("gen_ai.provider.name", provider_name),
                        KeyValue::new("gen_ai.request.model", req.model.clone()),
                        KeyValue::new("error.type", err.code()),
                    ],
                );

                Err(err)
            }
        }
    }

    pub async fn generate_with_retry(
        &self,
        provider: &dyn Provider,
        req: &GenerateRequest,
    ) -> Result<(GenerateResponse, u32), ModelFailure> {
        let outcome = self
            .retry
            .run(|| self.generate_once(provider, req))
            .await;

        if outcome.attempts > 1 {
            GEN_AI_RETRY_COUNT.add(
                u64::from(outcome.attempts - 1),
                &[
                    KeyValue::new("gen_ai.provider.name", provider.name().to_string()),
                    KeyValue::new("gen_ai.request.model", req.model.clone()),
                ],
            );
        }

        match outcome.result {
            Ok(resp) => Ok((resp, outcome.attempts)),
            Err(error) => Err(ModelFailure {
                error,
                attempts: outcome.attempts,
            }),
        }
    }

    pub async fn generate(
        &self,
        req: &GenerateRequest,
    ) -> Result<(GenerateResponse, u32), ModelFailure> {
        let primary_failure = match self.generate_with_retry(self.primary.as_ref(), req).await {
            Ok(done) => return Ok(done),
            Err(failure) => failure,
        };

        let Some(fallback) = &self.fallback else {
            return Err(primary_failure);
        };

        tracing::warn!(
            primary_provider = %self.primary.name(),
            fallback_provider = %fallback.provider.name(),
            facet = %req.facet,
            error = %primary_failure.error,
            "Primary provider failed, falling back"
        );

        GEN_AI_FALLBACK_COUNT.add(1, &[]);

        let fallback_req = GenerateRequest {
            model: fallback.model.clone(),
            ..req.clone()
        };

        match self
            .generate_with_retry(fallback.provider.as_ref(), &fallback_req)
            .await
        {
            Ok((resp, attempts)) => Ok((resp, primary_failure.attempts + attempts)),
            Err(failure) => Err(ModelFailure {
                error: failure.error,
                attempts: primary_failure.attempts + failure.attempts,
            }),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.char_indices()
            .take_while(|&(i, _)| i < max)
            .map(|(_, c)| c)
            .collect()
    }
}
