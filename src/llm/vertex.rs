//! Gemini models served from Vertex AI.
//!
//! Authenticates with a caller-supplied OAuth access token; obtaining and
//! refreshing that token belongs to the deployment, not to this crate.

use serde::{Deserialize, Serialize};

use super::{GenerateRequest, GenerateResponse, ModelError, Provider};

pub struct VertexProvider {
    client: reqwest::Client,
    project_id: String,
    location: String,
    access_token: String,
    base_url: String,
    server_address: String,
}

impl VertexProvider {
    pub fn new(project_id: &str, location: &str, access_token: &str) -> Self {
        let server_address = format!("{location}-aiplatform.googleapis.com");
        Self {
            client: reqwest::Client::new(),
            project_id: project_id.to_string(),
            location: location.to_string(),
            access_token: access_token.to_string(),
            base_url: format!("https://{server_address}"),
            server_address,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
            self.base_url, self.project_id, self.location, model
        )
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Deserialize)]
struct GoogleError {
    error: GoogleErrorDetail,
}

#[derive(Deserialize)]
struct GoogleErrorDetail {
    message: String,
    status: Option<String>,
}

fn map_error_status(status: u16, body: &str) -> ModelError {
    match serde_json::from_str::<GoogleError>(body) {
        Ok(err) => match err.error.status.as_deref() {
            Some("RESOURCE_EXHAUSTED") => ModelError::RateLimited(err.error.message),
            Some("DEADLINE_EXCEEDED") => ModelError::Timeout(err.error.message),
            Some("UNAUTHENTICATED" | "PERMISSION_DENIED") => ModelError::Auth(err.error.message),
            Some("UNAVAILABLE" | "INTERNAL") => ModelError::Server(err.error.message),
            _ => ModelError::from_status(status, err.error.message),
        },
        Err(_) => ModelError::from_status(status, body.to_string()),
    }
}

#[async_trait::async_trait]
impl Provider for VertexProvider {
    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, ModelError> {
        let body = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(req.prompt.clone()),
                }],
            }],
            system_instruction: (!req.system.is_empty()).then(|| Content {
                role: None,
                parts: vec![Part {
                    text: Some(req.system.clone()),
                }],
            }),
            generation_config: GenerationConfig {
                temperature: req.temperature,
                max_output_tokens: req.max_tokens,
                response_mime_type: req.json_output.then_some("application/json"),
            },
        };

        let response = self
            .client
            .post(self.endpoint(&req.model))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(map_error_status(status.as_u16(), &error_body));
        }

        let resp: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ModelError::from_reqwest(&e))?;

        let candidate = resp.candidates.into_iter().next();
        let finish_reason = candidate
            .as_ref()
            .and_then(|c| c.finish_reason.clone())
            .unwrap_or_default()
            .to_lowercase();
        let content = candidate
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let (input_tokens, output_tokens) = resp
            .usage_metadata
            .map(|u| (u.prompt_token_count, u.candidates_token_count))
            .unwrap_or((0, 0));

        Ok(GenerateResponse {
            content,
            model: resp.model_version.unwrap_or_else(|| req.model.clone()),
            input_tokens,
            output_tokens,
            finish_reason,
            provider: String::new(),
        })
    }

    fn name(&self) -> &str {
        "vertex"
    }

    fn server_address(&self) -> &str {
        &self.server_address
    }
}
