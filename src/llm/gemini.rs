use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::llm::media::GeneratedImage;
use crate::studio::error::{GenerationError, GenerationErrorKind};
use crate::studio::generator::{GenerationRequest, ImageGenerator, QualityMode};
use crate::utils::http::get_http_client;
use crate::utils::timing::log_generation_timing;

const IMAGE_SYSTEM_INSTRUCTION: &str =
    "Edit the portrait based on the prompt. Keep the person's identity. CRITICAL: respond with an image, NOT TEXT.";

const SAFETY_FINISH_REASONS: [&str; 6] = [
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "IMAGE_PROHIBITED_CONTENT",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiImageConfig {
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
}

/// Backend parameters for both quality modes.
#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub base_url: String,
    pub api_key: String,
    pub personal_api_key: String,
    pub standard_model: String,
    pub hq_model: String,
    pub hq_image_size: String,
    pub aspect_ratio: String,
    pub safety_profile: String,
}

impl GeminiSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.gemini_api_base_url.trim_end_matches('/').to_string(),
            api_key: config.gemini_api_key.clone(),
            personal_api_key: config.gemini_personal_api_key.clone(),
            standard_model: config.gemini_image_model.clone(),
            hq_model: config.gemini_hq_image_model.clone(),
            hq_image_size: config.gemini_hq_image_size.clone(),
            aspect_ratio: config.gemini_aspect_ratio.clone(),
            safety_profile: config.gemini_safety_settings.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
    block_reason_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
    Text {
        text: String,
    },
    Other(Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn redact_api_keys(text: &str, keys: &[&str]) -> String {
    keys.iter()
        .map(|key| key.trim())
        .filter(|key| !key.is_empty())
        .fold(text.to_string(), |acc, key| acc.replace(key, "[redacted]"))
}

fn build_safety_settings(profile: &str) -> Vec<Value> {
    let threshold = match profile {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        "permissive" => "OFF",
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}', using permissive defaults.",
                profile
            );
            "OFF"
        }
    };

    vec![
        json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": threshold }),
    ]
}

fn build_image_config(config: &GeminiImageConfig) -> Option<Value> {
    let mut map = Map::new();

    if let Some(aspect_ratio) = config.aspect_ratio.as_deref() {
        let trimmed = aspect_ratio.trim();
        if !trimmed.is_empty() {
            map.insert("aspectRatio".to_string(), json!(trimmed));
        }
    }

    if let Some(image_size) = config.image_size.as_deref() {
        let trimmed = image_size.trim();
        if !trimmed.is_empty() {
            map.insert("imageSize".to_string(), json!(trimmed));
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

fn summarize_payload(payload: &Value) -> Value {
    let parts = payload
        .pointer("/contents/0/parts")
        .and_then(|value| value.as_array())
        .map(|parts| {
            parts
                .iter()
                .map(|part| {
                    if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
                        json!({ "text": truncate_for_log(text, 120) })
                    } else if let Some(inline_data) = part.get("inlineData") {
                        let mime_type = inline_data
                            .get("mimeType")
                            .and_then(|value| value.as_str())
                            .unwrap_or("unknown");
                        let data_len = inline_data
                            .get("data")
                            .and_then(|value| value.as_str())
                            .map(|value| value.len())
                            .unwrap_or(0);
                        json!({ "inlineData": { "mimeType": mime_type, "dataLen": data_len } })
                    } else {
                        json!({ "unknownPart": true })
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    json!({
        "parts": parts,
        "generationConfig": payload.get("generationConfig").cloned().unwrap_or(Value::Null),
        "safetySettingsCount": payload
            .get("safetySettings")
            .and_then(|value| value.as_array())
            .map(|value| value.len())
            .unwrap_or(0),
    })
}

fn summarize_error_body(body: &str) -> (Option<String>, Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        let api_status = value
            .pointer("/error/status")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string());
        return (message, api_status, truncate_for_log(&value.to_string(), 2000));
    }

    (None, None, truncate_for_log(trimmed, 2000))
}

/// Maps a non-2xx answer onto the failure taxonomy.
pub(crate) fn classify_http_failure(status: StatusCode, body: &str) -> GenerationError {
    let (message, api_status, body_summary) = summarize_error_body(body);
    let haystack = message
        .as_deref()
        .unwrap_or(body_summary.as_str())
        .to_lowercase();
    let api_status = api_status.unwrap_or_default();

    let kind = if status == StatusCode::TOO_MANY_REQUESTS
        || api_status == "RESOURCE_EXHAUSTED"
        || haystack.contains("quota")
        || haystack.contains("rate limit")
        || haystack.contains("resource has been exhausted")
    {
        GenerationErrorKind::QuotaExhausted
    } else if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || api_status == "PERMISSION_DENIED"
        || api_status == "UNAUTHENTICATED"
        || haystack.contains("api key not valid")
        || haystack.contains("api_key_invalid")
    {
        GenerationErrorKind::PermissionDenied
    } else {
        GenerationErrorKind::TransportError
    };

    let detail = message.unwrap_or(body_summary);
    GenerationError::new(kind, format!("status {}: {}", status, detail))
}

/// Pulls the first image out of a successful answer.
pub(crate) fn extract_generated_image(
    response: GeminiResponse,
) -> Result<GeneratedImage, GenerationError> {
    if let Some(feedback) = &response.prompt_feedback {
        if let Some(reason) = feedback.block_reason.as_deref() {
            let detail = match feedback.block_reason_message.as_deref() {
                Some(message) => format!("prompt blocked ({reason}): {message}"),
                None => format!("prompt blocked ({reason})"),
            };
            return Err(GenerationError::new(
                GenerationErrorKind::ContentSafetyBlocked,
                detail,
            ));
        }
    }

    let mut finish_reasons = Vec::new();
    let mut text_preview = None;
    for candidate in response.candidates.unwrap_or_default() {
        if let Some(reason) = candidate.finish_reason {
            finish_reasons.push(reason);
        }
        let parts = candidate
            .content
            .and_then(|content| content.parts)
            .unwrap_or_default();
        for part in parts {
            match part {
                GeminiPart::InlineData { inline_data } => {
                    if !inline_data.mime_type.starts_with("image/") {
                        continue;
                    }
                    let bytes = general_purpose::STANDARD
                        .decode(inline_data.data.trim())
                        .map_err(|err| {
                            GenerationError::new(
                                GenerationErrorKind::TransportError,
                                format!("image payload is not valid base64: {err}"),
                            )
                        })?;
                    if bytes.is_empty() {
                        continue;
                    }
                    return Ok(GeneratedImage::new(bytes, inline_data.mime_type));
                }
                GeminiPart::Text { text } => {
                    if text_preview.is_none() && !text.trim().is_empty() {
                        text_preview = Some(truncate_for_log(&text, 200));
                    }
                }
                GeminiPart::Other(_) => {}
            }
        }
    }

    if let Some(reason) = finish_reasons
        .iter()
        .find(|reason| SAFETY_FINISH_REASONS.contains(&reason.as_str()))
    {
        return Err(GenerationError::new(
            GenerationErrorKind::ContentSafetyBlocked,
            format!("generation stopped ({reason})"),
        ));
    }

    let detail = match text_preview {
        Some(text) => format!("no image in response; model said: {text}"),
        None => format!(
            "no image in response (finish reasons: {})",
            if finish_reasons.is_empty() {
                "none".to_string()
            } else {
                finish_reasons.join(", ")
            }
        ),
    };
    Err(GenerationError::new(GenerationErrorKind::EmptyResponse, detail))
}

/// Gemini `generateContent` image editing, one theme per call.
pub struct GeminiImageClient {
    http: Client,
    settings: GeminiSettings,
    personal_key: RwLock<Option<String>>,
}

impl GeminiImageClient {
    pub fn new(settings: GeminiSettings) -> Self {
        let personal_key = Some(settings.personal_api_key.trim().to_string())
            .filter(|key| !key.is_empty());
        Self {
            http: get_http_client().clone(),
            settings,
            personal_key: RwLock::new(personal_key),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(GeminiSettings::from_config(config))
    }

    /// Installs the user's own key for high-quality mode. Blank keys are ignored.
    pub fn select_personal_key(&self, key: &str) -> bool {
        let key = key.trim();
        if key.is_empty() {
            return false;
        }
        *self.personal_key.write() = Some(key.to_string());
        info!("Personal API key selected for high-quality mode");
        true
    }

    pub fn has_personal_key(&self) -> bool {
        self.personal_key.read().is_some()
    }

    pub fn model_for(&self, quality: QualityMode) -> &str {
        match quality {
            QualityMode::Standard => &self.settings.standard_model,
            QualityMode::HighQuality => &self.settings.hq_model,
        }
    }

    fn image_config_for(&self, quality: QualityMode) -> GeminiImageConfig {
        let aspect_ratio = Some(self.settings.aspect_ratio.clone());
        match quality {
            QualityMode::Standard => GeminiImageConfig {
                aspect_ratio,
                image_size: None,
            },
            QualityMode::HighQuality => GeminiImageConfig {
                aspect_ratio,
                image_size: Some(self.settings.hq_image_size.clone()),
            },
        }
    }

    fn credential_for(&self, quality: QualityMode) -> Result<String, GenerationError> {
        let key = match quality {
            QualityMode::Standard => Some(self.settings.api_key.trim().to_string()),
            QualityMode::HighQuality => self.personal_key.read().clone(),
        };
        key.filter(|key| !key.is_empty()).ok_or_else(|| {
            GenerationError::new(
                GenerationErrorKind::CredentialMissing,
                format!("no API key configured for {} mode", quality),
            )
        })
    }

    pub(crate) fn build_payload(&self, request: &GenerationRequest) -> Value {
        let mut generation_config = json!({
            "responseModalities": ["TEXT", "IMAGE"]
        });
        if let Some(image_config) = build_image_config(&self.image_config_for(request.quality)) {
            if let Some(config_object) = generation_config.as_object_mut() {
                config_object.insert("imageConfig".to_string(), image_config);
            }
        }

        json!({
            "systemInstruction": { "parts": [{ "text": IMAGE_SYSTEM_INSTRUCTION }] },
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": request.source.mime_type(),
                            "data": request.source.base64(),
                        }
                    },
                    { "text": request.prompt },
                ]
            }],
            "generationConfig": generation_config,
            "safetySettings": build_safety_settings(&self.settings.safety_profile),
        })
    }

    async fn call_generate_content(
        &self,
        model: &str,
        api_key: &str,
        payload: Value,
    ) -> Result<GeneratedImage, GenerationError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.settings.base_url, model
        );

        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(target: "llm.gemini", model = model, payload = %summarize_payload(&payload));
        }

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                let err_text = redact_api_keys(&err.to_string(), &[api_key]);
                warn!(
                    "Gemini request failed to send: {} (timeout={}, connect={})",
                    err_text,
                    err.is_timeout(),
                    err.is_connect()
                );
                GenerationError::new(
                    GenerationErrorKind::TransportError,
                    format!("request failed: {err_text}"),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify_http_failure(status, &redact_api_keys(&body, &[api_key]));
            warn!(
                "Gemini API error: status={}, kind={}, detail={}",
                status, err.kind, err.detail
            );
            return Err(err);
        }

        let parsed = response.json::<GeminiResponse>().await.map_err(|err| {
            GenerationError::new(
                GenerationErrorKind::TransportError,
                format!("unreadable response body: {err}"),
            )
        })?;
        extract_generated_image(parsed)
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedImage, GenerationError> {
        let api_key = self.credential_for(request.quality)?;
        let model = self.model_for(request.quality).to_string();
        let payload = self.build_payload(&request);
        let operation = format!("portrait_{}", request.theme.slug());

        log_generation_timing("gemini", &model, &operation, || async {
            self.call_generate_content(&model, &api_key, payload).await
        })
        .await
    }
}
