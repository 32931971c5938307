use axum::{Json, extract::State};
use serde::Deserialize;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::pipeline::{AnalysisRequest, AnalysisResult, PipelineResult, Report};

#[derive(Debug, Default, Deserialize)]
pub struct RunAnalysisBody {
    /// Falls back to the built-in marketplace request when omitted.
    #[serde(default)]
    pub request: Option<AnalysisRequest>,
    /// Explicit recipient; implies delivery.
    #[serde(default)]
    pub recipient: Option<String>,
    /// Deliver to the configured default recipient.
    #[serde(default)]
    pub deliver: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SummaryBody {
    #[serde(default)]
    pub request: Option<AnalysisRequest>,
}

impl RunAnalysisBody {
    fn recipient<'a>(&'a self, default: Option<&'a str>) -> AppResult<Option<&'a str>> {
        match (&self.recipient, self.deliver) {
            (Some(to), _) => Ok(Some(to.as_str())),
            (None, true) => default.map(Some).ok_or_else(|| {
                AppError::Validation(
                    "deliver requested but no recipient given and TO_EMAIL is not set".into(),
                )
            }),
            (None, false) => Ok(None),
        }
    }
}

pub async fn run_analysis(
    State(state): State<AppState>,
    Json(body): Json<RunAnalysisBody>,
) -> AppResult<Json<PipelineResult>> {
    let request = body.request.clone().unwrap_or_default();
    request.validate()?;

    let analyzer = &state.analyzer;
    let recipient = body.recipient(analyzer.settings().default_recipient.as_deref())?;
    if recipient.is_some() && !analyzer.can_deliver() {
        return Err(AppError::Configuration(
            "delivery requested but SENDGRID_API_KEY / FROM_EMAIL are not configured".into(),
        ));
    }

    let result = analyzer.run_with_recipient(&request, recipient).await;

    Ok(Json(result))
}

pub async fn run_summary(
    State(state): State<AppState>,
    Json(body): Json<SummaryBody>,
) -> AppResult<Json<AnalysisResult>> {
    let request = body.request.unwrap_or_default();
    let analysis = state.analyzer.run_summary_only(&request).await?;
    Ok(Json(analysis))
}

pub async fn render_report(
    State(state): State<AppState>,
    Json(analysis): Json<AnalysisResult>,
) -> Json<Report> {
    Json(state.analyzer.render_report(&analysis))
}
