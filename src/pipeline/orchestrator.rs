use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::delivery::sendgrid::SendGridProvider;
use crate::delivery::{DeliveryOutcome, Dispatcher};
use crate::error::{AppError, ErrorRecord, Stage};
use crate::llm::{self, LlmClient, ModelFailure, RawModelResponse};
use crate::retry::RetryPolicy;
use crate::telemetry::metrics::{
    FACET_FAILURES, PIPELINE_DURATION, PIPELINE_RUNS, REPORT_SECTIONS, VALIDATION_WARNINGS,
};

use super::analysis::{self, AnalysisResult, FacetOutput};
use super::prompts::{self, Facet, PromptSpec};
use super::render::{self, Report};
use super::request::AnalysisRequest;
use super::validate::{self, ValidationWarning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Pending,
    Generating,
    Validating,
    Rendering,
    Delivering,
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Pending => "pending",
            RunStage::Generating => "generating",
            RunStage::Validating => "validating",
            RunStage::Rendering => "rendering",
            RunStage::Delivering => "delivering",
            RunStage::Done => "done",
        };
        f.write_str(name)
    }
}

struct RunState {
    run_id: Uuid,
    stage: RunStage,
}

impl RunState {
    fn advance(&mut self, next: RunStage) {
        tracing::debug!(run_id = %self.run_id, from = %self.stage, to = %next, "Pipeline stage transition");
        self.stage = next;
    }
}

/// Everything one run produced. Always returned, whatever failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub analysis: Option<AnalysisResult>,
    pub report: Option<Report>,
    pub delivery: Option<DeliveryOutcome>,
    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<ValidationWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
}

impl PipelineResult {
    fn failed(run_id: Uuid, error: ErrorRecord) -> Self {
        Self {
            run_id,
            status: RunStatus::Failed,
            analysis: None,
            report: None,
            delivery: None,
            errors: vec![error],
            warnings: Vec::new(),
            archive_path: None,
        }
    }

    /// Facets that failed, for retrying just those.
    pub fn failed_facets(&self) -> Vec<Facet> {
        let mut facets: Vec<Facet> = self.errors.iter().filter_map(|e| e.facet).collect();
        facets.sort();
        facets.dedup();
        facets
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    /// Recipient used by [`MarketAnalyzer::run_complete_analysis`]. `None`
    /// makes runs render-only.
    pub default_recipient: Option<String>,
    /// Where a copy of every rendered report is written, if anywhere.
    pub archive_dir: Option<PathBuf>,
}

pub struct MarketAnalyzer {
    llm: LlmClient,
    dispatcher: Option<Dispatcher>,
    settings: PipelineSettings,
}

impl MarketAnalyzer {
    pub fn new(llm: LlmClient, settings: PipelineSettings) -> Self {
        Self {
            llm,
            dispatcher: None,
            settings,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Wires providers, retry policies and delivery from configuration.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let primary = llm::build_provider(&config.llm_provider, config)?;
        let mut client = LlmClient::new(primary, &config.llm_model)
            .with_temperature(config.default_temperature)
            .with_timeout(Duration::from_secs(config.model_timeout_secs))
            .with_retry(RetryPolicy::new(
                config.model_max_attempts,
                Duration::from_millis(config.model_base_delay_ms),
            ));

        if let Some(name) = &config.fallback_provider {
            let fallback = llm::build_provider(name, config)?;
            client = client.with_fallback(fallback, &config.fallback_model);
        }

        tracing::info!(
            primary_provider = %config.llm_provider,
            model = %config.llm_model,
            fallback_provider = config.fallback_provider.as_deref().unwrap_or("none"),
            "LLM client initialized"
        );

        let settings = PipelineSettings {
            default_recipient: config.to_email.clone(),
            archive_dir: config.report_archive_dir.clone(),
        };
        let mut analyzer = Self::new(client, settings);

        if let (Some(api_key), Some(from)) = (&config.sendgrid_api_key, &config.from_email) {
            let mut provider = SendGridProvider::new(api_key);
            if let Some(base_url) = &config.sendgrid_base_url {
                provider = provider.with_base_url(base_url);
            }
            let dispatcher = Dispatcher::new(Arc::new(provider), from)
                .with_timeout(Duration::from_secs(config.delivery_timeout_secs))
                .with_retry(RetryPolicy::new(
                    config.delivery_max_attempts,
                    Duration::from_millis(config.delivery_base_delay_ms),
                ));
            analyzer = analyzer.with_dispatcher(dispatcher);
            tracing::info!(sender = %from, "Email delivery enabled");
        }

        Ok(analyzer)
    }

    pub fn can_deliver(&self) -> bool {
        self.dispatcher.is_some()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Full run, delivering to the configured default recipient if there is one.
    pub async fn run_complete_analysis(&self, request: &AnalysisRequest) -> PipelineResult {
        let recipient = self.settings.default_recipient.clone();
        self.run_with_recipient(request, recipient.as_deref()).await
    }

    #[tracing::instrument(
        name = "pipeline analysis",
        skip(self, request, recipient),
        fields(
            run.id,
            run.status,
            run.facets_ok,
            run.duration_ms,
            run.deliver = recipient.is_some(),
        )
    )]
    pub async fn run_with_recipient(
        &self,
        request: &AnalysisRequest,
        recipient: Option<&str>,
    ) -> PipelineResult {
        let start = Instant::now();
        let span = tracing::Span::current();
        let mut state = RunState {
            run_id: Uuid::new_v4(),
            stage: RunStage::Pending,
        };
        span.record("run.id", state.run_id.to_string());

        let result = self.execute(&mut state, request, recipient).await;

        let duration = start.elapsed();
        span.record("run.status", result.status.as_str());
        span.record("run.duration_ms", duration.as_millis() as u64);
        if let Some(analysis) = &result.analysis {
            span.record("run.facets_ok", analysis.coverage.len());
        }

        PIPELINE_RUNS.add(1, &[KeyValue::new("run.status", result.status.as_str())]);
        PIPELINE_DURATION.record(
            duration.as_secs_f64(),
            &[KeyValue::new("run.status", result.status.as_str())],
        );

        tracing::info!(
            run_id = %result.run_id,
            status = result.status.as_str(),
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "Analysis run finished"
        );

        result
    }

    async fn execute(
        &self,
        state: &mut RunState,
        request: &AnalysisRequest,
        recipient: Option<&str>,
    ) -> PipelineResult {
        let run_id = state.run_id;

        if let Err(e) = request.validate() {
            return PipelineResult::failed(run_id, ErrorRecord::invalid_request(e.to_string()));
        }
        if recipient.is_some() && self.dispatcher.is_none() {
            return PipelineResult::failed(
                run_id,
                ErrorRecord::configuration(
                    "delivery requested but no email provider is configured \
                     (set SENDGRID_API_KEY and FROM_EMAIL)",
                ),
            );
        }

        state.advance(RunStage::Generating);
        let specs = prompts::build_prompts(request);
        let responses = self.generate(&specs).await;

        state.advance(RunStage::Validating);
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let outputs = normalize_all(&specs, responses, &mut errors, &mut warnings);
        let assembly = analysis::assemble(request, outputs, Utc::now(), &mut warnings);
        VALIDATION_WARNINGS.add(warnings.len() as u64, &[]);
        for e in &assembly.rejected {
            tracing::warn!(
                facet = %e.facet(),
                code = e.code(),
                error = %e,
                "Facet emptied during assembly"
            );
            FACET_FAILURES.add(
                1,
                &[
                    KeyValue::new("analysis.facet", e.facet().as_str()),
                    KeyValue::new("stage", "validation"),
                ],
            );
            errors.push(ErrorRecord::validation(e.facet(), e));
        }

        let Some(analysis) = assembly.analysis else {
            tracing::error!(run_id = %run_id, "Every facet failed; no analysis to report");
            state.advance(RunStage::Done);
            return PipelineResult {
                run_id,
                status: RunStatus::Failed,
                analysis: None,
                report: None,
                delivery: None,
                errors,
                warnings,
                archive_path: None,
            };
        };
        debug_assert!(
            analysis.check_invariants(request).is_ok(),
            "assembled analysis breaks an invariant: {:?}",
            analysis.check_invariants(request)
        );

        state.advance(RunStage::Rendering);
        let report = self.render_report(&analysis);
        let archive_path = match &self.settings.archive_dir {
            Some(dir) => archive_report(dir, run_id, &analysis, &report).await,
            None => None,
        };

        let delivery = match (recipient, &self.dispatcher) {
            (Some(to), Some(dispatcher)) => {
                state.advance(RunStage::Delivering);
                let (outcome, error) = dispatcher.dispatch(&report, to).await;
                if let Some(error) = error {
                    errors.push(ErrorRecord::delivery(&error, outcome.attempts));
                }
                Some(outcome)
            }
            _ => None,
        };
        state.advance(RunStage::Done);

        let facets_ok = !errors
            .iter()
            .any(|e| matches!(e.stage, Stage::Generation | Stage::Validation));
        let delivery_ok = delivery.as_ref().is_none_or(|d| d.succeeded);
        let status = if facets_ok && delivery_ok {
            RunStatus::Success
        } else {
            RunStatus::Partial
        };

        PipelineResult {
            run_id,
            status,
            analysis: Some(analysis),
            report: Some(report),
            delivery,
            errors,
            warnings,
            archive_path,
        }
    }

    /// Runs every facet concurrently; results come back in facet order.
    #[tracing::instrument(
        name = "pipeline_stage generate",
        skip(self, specs),
        fields(pipeline.stage = "generate", generate.facets = specs.len())
    )]
    async fn generate(&self, specs: &[PromptSpec]) -> Vec<Result<RawModelResponse, ModelFailure>> {
        join_all(specs.iter().map(|spec| self.llm.invoke(spec))).await
    }

    /// Quick market overview: only the summary facet, nothing rendered or sent.
    #[tracing::instrument(name = "pipeline summary", skip(self, request))]
    pub async fn run_summary_only(
        &self,
        request: &AnalysisRequest,
    ) -> Result<AnalysisResult, ErrorRecord> {
        request
            .validate()
            .map_err(|e| ErrorRecord::invalid_request(e.to_string()))?;

        let spec = prompts::build_prompt(request, Facet::Summary);
        let raw = self
            .llm
            .invoke(&spec)
            .await
            .map_err(|f| ErrorRecord::model(spec.facet, &f.error, f.attempts))?;
        let normalized = validate::normalize(&raw, spec.shape)
            .map_err(|e| ErrorRecord::validation(spec.facet, &e))?;

        let mut warnings = normalized.warnings;
        let assembly =
            analysis::assemble(request, vec![normalized.output], Utc::now(), &mut warnings);
        let analysis = assembly.analysis.ok_or_else(|| {
            let missing = validate::ValidationError::MissingPrimary {
                facet: spec.facet,
                field: "overview",
            };
            let error = assembly.rejected.first().unwrap_or(&missing);
            ErrorRecord::validation(spec.facet, error)
        })?;
        debug_assert!(analysis.check_invariants(request).is_ok());
        for warning in &warnings {
            tracing::warn!(facet = %warning.facet, field = %warning.field, "{}", warning.message);
        }
        Ok(analysis)
    }

    pub fn render_report(&self, analysis: &AnalysisResult) -> Report {
        let report = render::render(analysis);
        REPORT_SECTIONS.record(report.sections.len() as f64, &[]);
        report
    }

    /// Sends an already rendered report. Without a configured email provider
    /// nothing is attempted.
    pub async fn deliver_report(&self, report: &Report, recipient: &str) -> DeliveryOutcome {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.deliver(report, recipient).await,
            None => {
                tracing::warn!("Delivery requested but no email provider is configured");
                DeliveryOutcome {
                    attempted: false,
                    succeeded: false,
                    provider_message_id: None,
                    failure_reason: Some("missing-configuration".to_string()),
                    attempts: 0,
                }
            }
        }
    }
}

#[tracing::instrument(
    name = "pipeline_stage validate",
    skip_all,
    fields(pipeline.stage = "validate", validate.ok, validate.warnings)
)]
fn normalize_all(
    specs: &[PromptSpec],
    responses: Vec<Result<RawModelResponse, ModelFailure>>,
    errors: &mut Vec<ErrorRecord>,
    warnings: &mut Vec<ValidationWarning>,
) -> Vec<FacetOutput> {
    let mut outputs = Vec::with_capacity(specs.len());

    for (spec, response) in specs.iter().zip(responses) {
        let facet_kv = KeyValue::new("analysis.facet", spec.facet.as_str());
        match response {
            Err(failure) => {
                tracing::warn!(
                    facet = %spec.facet,
                    code = failure.error.code(),
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Facet generation failed"
                );
                FACET_FAILURES.add(1, &[facet_kv, KeyValue::new("stage", "generation")]);
                errors.push(ErrorRecord::model(spec.facet, &failure.error, failure.attempts));
            }
            Ok(raw) => match validate::normalize(&raw, spec.shape) {
                Ok(normalized) => {
                    warnings.extend(normalized.warnings);
                    outputs.push(normalized.output);
                }
                Err(e) => {
                    tracing::warn!(facet = %spec.facet, code = e.code(), error = %e, "Facet output rejected");
                    FACET_FAILURES.add(1, &[facet_kv, KeyValue::new("stage", "validation")]);
                    errors.push(ErrorRecord::validation(spec.facet, &e));
                }
            },
        }
    }

    let span = tracing::Span::current();
    span.record("validate.ok", outputs.len());
    span.record("validate.warnings", warnings.len());
    outputs
}

pub fn archive_file_name(run_id: Uuid, analysis: &AnalysisResult) -> String {
    let short_id: String = run_id.simple().to_string().chars().take(8).collect();
    format!(
        "market_report_{}_{short_id}.html",
        analysis.generated_at.format("%Y%m%d_%H%M%S")
    )
}

/// Best effort: a failed write is logged and leaves the run untouched.
async fn archive_report(
    dir: &Path,
    run_id: Uuid,
    analysis: &AnalysisResult,
    report: &Report,
) -> Option<PathBuf> {
    let path = dir.join(archive_file_name(run_id, analysis));
    let write = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, report.html_body.as_bytes()).await
    };
    match write.await {
        Ok(()) => {
            tracing::info!(path = %path.display(), "Report archived");
            Some(path)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to archive report");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::delivery::{DeliveryError, EmailMessage, EmailProvider};
    use crate::llm::{GenerateRequest, GenerateResponse, ModelError, Provider};

    const SUMMARY: &str = r#"{"overview": "Template marketplaces keep growing.", "highlights": ["Bundles sell"]}"#;
    const PRICING: &str = r#"{"pricing_trends": [{"category": "Notion Templates", "direction": "up", "magnitude_percent": 8}]}"#;
    const CATEGORIES: &str = r#"{"hot_categories": [{"name": "Notion Templates", "confidence": 0.9}, {"name": "AI Prompt Packs", "confidence": 1.4}]}"#;
    const PREDICTIONS: &str = r#"{"technology_trends": ["AI personalization"], "strategy_suggestions": ["Ship bundles"]}"#;

    /// Answers by facet; facets without an entry succeed with canned JSON.
    struct FacetProvider {
        overrides: HashMap<&'static str, Result<String, ModelError>>,
        calls: AtomicU32,
    }

    impl FacetProvider {
        fn healthy() -> Arc<Self> {
            Self::with(HashMap::new())
        }

        fn with(overrides: HashMap<&'static str, Result<String, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                overrides,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Provider for FacetProvider {
        async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let content = match self.overrides.get(req.facet.as_str()) {
                Some(answer) => answer.clone()?,
                None => match req.facet.as_str() {
                    "summary" => SUMMARY.to_string(),
                    "pricing" => PRICING.to_string(),
                    "categories" => CATEGORIES.to_string(),
                    _ => PREDICTIONS.to_string(),
                },
            };
            Ok(GenerateResponse {
                content,
                model: req.model.clone(),
                input_tokens: 100,
                output_tokens: 200,
                finish_reason: "stop".to_string(),
                provider: String::new(),
            })
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    struct FakeMailer {
        result: Result<Option<String>, DeliveryError>,
        sent: Mutex<Vec<EmailMessage>>,
    }

    impl FakeMailer {
        fn new(result: Result<Option<String>, DeliveryError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl EmailProvider for FakeMailer {
        async fn send(&self, message: &EmailMessage) -> Result<Option<String>, DeliveryError> {
            self.sent.lock().unwrap().push(message.clone());
            self.result.clone()
        }

        fn name(&self) -> &str {
            "fake-mailer"
        }
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new(
            ["Etsy", "Gumroad"],
            ["Notion Templates", "Stock Photos"],
            crate::pipeline::request::Depth::Summary,
            6,
        )
    }

    fn analyzer(provider: Arc<dyn Provider>, settings: PipelineSettings) -> MarketAnalyzer {
        let client = LlmClient::new(provider, "fake-model")
            .with_retry(RetryPolicy::new(2, Duration::from_millis(10)));
        MarketAnalyzer::new(client, settings)
    }

    fn with_mailer(analyzer: MarketAnalyzer, mailer: Arc<FakeMailer>) -> MarketAnalyzer {
        analyzer.with_dispatcher(
            Dispatcher::new(mailer, "reports@example.com")
                .with_retry(RetryPolicy::new(3, Duration::from_millis(10))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_success_render_only() {
        let analyzer = analyzer(FacetProvider::healthy(), PipelineSettings::default());

        let result = analyzer.run_complete_analysis(&request()).await;

        assert_eq!(result.status, RunStatus::Success);
        assert!(result.errors.is_empty());
        assert!(result.delivery.is_none());
        let analysis = result.analysis.unwrap();
        assert!(analysis.is_complete());
        assert_eq!(analysis.hot_categories[0].confidence, 1.0);
        assert!(analysis.check_invariants(&request()).is_ok());
        // 1.4 clamped
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.report.unwrap().sections.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_facets_failing_is_failed() {
        let overrides = Facet::ALL
            .iter()
            .map(|f| (f.as_str(), Err(ModelError::Auth("expired token".into()))))
            .collect();
        let mailer = FakeMailer::new(Ok(None));
        let analyzer = with_mailer(
            analyzer(FacetProvider::with(overrides), PipelineSettings::default()),
            mailer.clone(),
        );

        let result = analyzer
            .run_with_recipient(&request(), Some("team@example.com"))
            .await;

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.analysis.is_none());
        assert!(result.report.is_none());
        assert!(result.delivery.is_none());
        assert_eq!(result.errors.len(), 4);
        assert_eq!(result.failed_facets(), Facet::ALL.to_vec());
        assert_eq!(mailer.sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_facet_failing_is_partial() {
        let mut overrides = HashMap::new();
        overrides.insert("pricing", Ok("not json at all".to_string()));
        let provider = FacetProvider::with(overrides);
        let analyzer = analyzer(provider, PipelineSettings::default());

        let result = analyzer.run_complete_analysis(&request()).await;

        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(result.failed_facets(), vec![Facet::Pricing]);
        assert_eq!(result.errors[0].code, "unparseable-output");
        let report = result.report.unwrap();
        assert!(!report.sections.iter().any(|s| s == render::PRICING_TRENDS));
        assert!(report.html_body.contains("Partial analysis"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pricing_with_only_unknown_categories_is_partial() {
        let mut overrides = HashMap::new();
        let orphan_only = r#"{"pricing_trends": [
            {"category": "Crypto Courses", "direction": "up", "magnitude_percent": 20}
        ]}"#;
        overrides.insert("pricing", Ok(orphan_only.to_string()));
        let analyzer = analyzer(FacetProvider::with(overrides), PipelineSettings::default());

        let result = analyzer.run_complete_analysis(&request()).await;

        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(result.failed_facets(), vec![Facet::Pricing]);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].stage, Stage::Validation);
        assert_eq!(result.errors[0].code, "missing-primary-content");
        assert!(
            result
                .warnings
                .iter()
                .any(|w| w.field == "pricing_trends.Crypto Courses")
        );

        let analysis = result.analysis.unwrap();
        assert!(!analysis.coverage.contains(&Facet::Pricing));
        assert!(analysis.pricing_trends.is_empty());
        let report = result.report.unwrap();
        assert!(!report.sections.iter().any(|s| s == render::PRICING_TRENDS));
        assert!(report.html_body.contains("Coverage: 3 of 4"));
        assert!(report.html_body.contains("Partial analysis"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seller_patterns_and_platform_outlook_reach_report() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "summary",
            Ok(r#"{"overview": "Template marketplaces keep growing.",
                   "platform_outlook": [
                       {"platform": "gumroad", "growth": "up", "focus": "Creator courses"},
                       {"platform": "Shopify", "growth": "flat"}
                   ]}"#
                .to_string()),
        );
        overrides.insert(
            "predictions",
            Ok(r#"{"technology_trends": ["AI personalization"],
                   "strategy_suggestions": ["Ship bundles"],
                   "market_opportunities": ["Localized planners"],
                   "seller_success_factors": ["Consistent branding"]}"#
                .to_string()),
        );
        let analyzer = analyzer(FacetProvider::with(overrides), PipelineSettings::default());

        let result = analyzer.run_complete_analysis(&request()).await;

        assert_eq!(result.status, RunStatus::Success);
        let analysis = result.analysis.unwrap();
        let outlook = &analysis.executive_summary.unwrap().platform_outlook;
        assert_eq!(outlook.len(), 1);
        assert_eq!(outlook[0].platform, "Gumroad");
        assert_eq!(analysis.market_opportunities, vec!["Localized planners"]);
        assert_eq!(analysis.seller_success_factors, vec!["Consistent branding"]);
        let html = result.report.unwrap().html_body;
        assert!(html.contains("<h3>Market Opportunities</h3>"));
        assert!(html.contains("<li>Consistent branding</li>"));
        assert!(html.contains("<td>Creator courses</td>"));
        assert!(!html.contains("Shopify"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_facet_failure_recorded_with_attempts() {
        let mut overrides = HashMap::new();
        overrides.insert("predictions", Err(ModelError::Server("503".into())));
        let analyzer = analyzer(FacetProvider::with(overrides), PipelineSettings::default());

        let result = analyzer.run_complete_analysis(&request()).await;

        assert_eq!(result.status, RunStatus::Partial);
        let record = &result.errors[0];
        assert_eq!(record.facet, Some(Facet::Predictions));
        assert_eq!(record.kind, crate::error::ErrorKind::TransientModel);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_success() {
        let mailer = FakeMailer::new(Ok(Some("sg-123".to_string())));
        let analyzer = with_mailer(
            analyzer(FacetProvider::healthy(), PipelineSettings::default()),
            mailer.clone(),
        );

        let result = analyzer
            .run_with_recipient(&request(), Some("team@example.com"))
            .await;

        assert_eq!(result.status, RunStatus::Success);
        let delivery = result.delivery.unwrap();
        assert!(delivery.succeeded);
        assert_eq!(delivery.provider_message_id.as_deref(), Some("sg-123"));
        assert_eq!(mailer.sent(), 1);
        let sent = mailer.sent.lock().unwrap()[0].clone();
        assert_eq!(sent.subject, result.report.unwrap().subject);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_delivery_failure_is_partial() {
        let mailer = FakeMailer::new(Err(DeliveryError::InvalidRecipient("bounced".into())));
        let analyzer = with_mailer(
            analyzer(FacetProvider::healthy(), PipelineSettings::default()),
            mailer.clone(),
        );

        let result = analyzer
            .run_with_recipient(&request(), Some("ghost@example.com"))
            .await;

        assert_eq!(result.status, RunStatus::Partial);
        assert!(result.report.is_some());
        let delivery = result.delivery.unwrap();
        assert!(!delivery.succeeded);
        assert_eq!(delivery.failure_reason.as_deref(), Some("invalid-recipient"));
        assert_eq!(mailer.sent(), 1);
        assert_eq!(result.errors[0].stage, Stage::Delivery);
        assert_eq!(result.errors[0].kind, crate::error::ErrorKind::FatalDelivery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recipient_without_dispatcher_fails_before_generation() {
        let provider = FacetProvider::healthy();
        let analyzer = analyzer(provider.clone(), PipelineSettings::default());

        let result = analyzer
            .run_with_recipient(&request(), Some("team@example.com"))
            .await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.errors[0].code, "missing-configuration");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_fails_without_calls() {
        let provider = FacetProvider::healthy();
        let analyzer = analyzer(provider.clone(), PipelineSettings::default());
        let mut bad = request();
        bad.horizon_months = 0;

        let result = analyzer.run_complete_analysis(&bad).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.errors[0].code, "invalid-request");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_archived_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PipelineSettings {
            default_recipient: None,
            archive_dir: Some(dir.path().join("reports")),
        };
        let analyzer = analyzer(FacetProvider::healthy(), settings);

        let result = analyzer.run_complete_analysis(&request()).await;

        let path = result.archive_path.unwrap();
        assert!(path.starts_with(dir.path()));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, result.report.unwrap().html_body);
    }

    #[tokio::test(start_paused = true)]
    async fn test_archive_failure_does_not_change_status() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let settings = PipelineSettings {
            default_recipient: None,
            // a regular file cannot hold a directory
            archive_dir: Some(file.path().join("reports")),
        };
        let analyzer = analyzer(FacetProvider::healthy(), settings);

        let result = analyzer.run_complete_analysis(&request()).await;

        assert_eq!(result.status, RunStatus::Success);
        assert!(result.archive_path.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_only_calls_one_facet() {
        let provider = FacetProvider::healthy();
        let analyzer = analyzer(provider.clone(), PipelineSettings::default());

        let analysis = analyzer.run_summary_only(&request()).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(analysis.coverage, vec![Facet::Summary]);
        assert!(analysis.executive_summary.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_only_surfaces_model_error() {
        let mut overrides = HashMap::new();
        overrides.insert("summary", Err(ModelError::MalformedRequest("bad model".into())));
        let analyzer = analyzer(FacetProvider::with(overrides), PipelineSettings::default());

        let err = analyzer.run_summary_only(&request()).await.unwrap_err();

        assert_eq!(err.code, "malformed-request");
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn test_deliver_report_without_dispatcher() {
        let analyzer = analyzer(FacetProvider::healthy(), PipelineSettings::default());
        let report = Report {
            html_body: String::new(),
            subject: "s".to_string(),
            sections: vec![],
        };

        let outcome = analyzer.deliver_report(&report, "team@example.com").await;

        assert!(!outcome.attempted);
        assert_eq!(outcome.failure_reason.as_deref(), Some("missing-configuration"));
    }

    #[test]
    fn test_archive_file_name_format() {
        use chrono::TimeZone;
        let analysis = AnalysisResult {
            executive_summary: None,
            hot_categories: vec![],
            pricing_trends: Default::default(),
            technology_trends: vec![],
            strategy_suggestions: vec![],
            market_opportunities: vec![],
            seller_success_factors: vec![],
            depth: Default::default(),
            horizon_months: 6,
            coverage: vec![],
            generated_at: Utc.with_ymd_and_hms(2026, 3, 4, 9, 30, 5).unwrap(),
        };
        let run_id = Uuid::parse_str("1a2b3c4d-0000-4000-8000-000000000000").unwrap();
        assert_eq!(
            archive_file_name(run_id, &analysis),
            "market_report_20260304_093005_1a2b3c4d.html"
        );
    }
}
