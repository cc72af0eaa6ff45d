use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use tracing::warn;

use crate::studio::orchestrator::{DispatchPolicy, StudioSettings};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub gemini_api_key: String,
    pub gemini_personal_api_key: String,
    pub gemini_api_base_url: String,
    pub gemini_image_model: String,
    pub gemini_hq_image_model: String,
    pub gemini_hq_image_size: String,
    pub gemini_aspect_ratio: String,
    pub gemini_safety_settings: String,
    pub studio_dispatch_policy: DispatchPolicy,
    pub studio_pacing_ms: u64,
    pub studio_request_timeout_seconds: u64,
    pub studio_export_stagger_ms: u64,
    pub studio_output_dir: PathBuf,
    pub studio_prompts_path: Option<PathBuf>,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

pub(crate) fn normalize_gemini_safety_settings(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "permissive".to_string();
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to permissive.",
                value
            );
            "permissive".to_string()
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let dispatch_raw = env_string("STUDIO_DISPATCH_POLICY", "serial");
        let studio_dispatch_policy = dispatch_raw
            .parse::<DispatchPolicy>()
            .map_err(|_| anyhow!("Invalid STUDIO_DISPATCH_POLICY value: {dispatch_raw}"))?;

        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            gemini_personal_api_key: env_string("GEMINI_PERSONAL_API_KEY", ""),
            gemini_api_base_url: env_string(
                "GEMINI_API_BASE_URL",
                "https://generativelanguage.googleapis.com",
            ),
            gemini_image_model: env_string("GEMINI_IMAGE_MODEL", "gemini-2.5-flash-image"),
            gemini_hq_image_model: env_string(
                "GEMINI_HQ_IMAGE_MODEL",
                "gemini-3-pro-image-preview",
            ),
            gemini_hq_image_size: env_string("GEMINI_HQ_IMAGE_SIZE", "2K"),
            gemini_aspect_ratio: env_string("GEMINI_ASPECT_RATIO", "1:1"),
            gemini_safety_settings: normalize_gemini_safety_settings(env_string(
                "GEMINI_SAFETY_SETTINGS",
                "permissive",
            )),
            studio_dispatch_policy,
            studio_pacing_ms: env_u64("STUDIO_PACING_MS", 4500),
            studio_request_timeout_seconds: env_u64("STUDIO_REQUEST_TIMEOUT_SECONDS", 120).max(1),
            studio_export_stagger_ms: env_u64("STUDIO_EXPORT_STAGGER_MS", 300),
            studio_output_dir: env_path("STUDIO_OUTPUT_DIR")
                .unwrap_or_else(|| PathBuf::from("studio_output")),
            studio_prompts_path: env_path("STUDIO_PROMPTS_PATH"),
        })
    }

    pub fn studio_settings(&self) -> StudioSettings {
        StudioSettings {
            dispatch: self.studio_dispatch_policy,
            pacing: Duration::from_millis(self.studio_pacing_ms),
            request_timeout: Duration::from_secs(self.studio_request_timeout_seconds),
        }
    }

    pub fn export_stagger(&self) -> Duration {
        Duration::from_millis(self.studio_export_stagger_ms)
    }
}

pub const PORTRAIT_INSTRUCTION_TEMPLATE: &str = "请基于这张人物原图，完全复刻人物的面部特征，生成一张如下风格的写真照：{style}。保持人物面部的一致性是非常关键的，输出必须是一张高清图像。";
