use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::PORTRAIT_INSTRUCTION_TEMPLATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Professional,
    Fashion,
    Gallery,
    BlackWhite,
    Magazine,
    Cinematic,
}

impl Theme {
    /// Fixed batch order; slot `i` always renders `Theme::ALL[i]`.
    pub const ALL: [Theme; 6] = [
        Theme::Professional,
        Theme::Fashion,
        Theme::Gallery,
        Theme::BlackWhite,
        Theme::Magazine,
        Theme::Cinematic,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Theme::Professional => "职业肖像照",
            Theme::Fashion => "时尚写真",
            Theme::Gallery => "美术馆迷失的她",
            Theme::BlackWhite => "黑白艺术照",
            Theme::Magazine => "美式杂志封面",
            Theme::Cinematic => "电影肖像",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Theme::Professional => "professional",
            Theme::Fashion => "fashion",
            Theme::Gallery => "gallery",
            Theme::BlackWhite => "black_white",
            Theme::Magazine => "magazine",
            Theme::Cinematic => "cinematic",
        }
    }

    #[cfg(test)]
    pub fn index(self) -> usize {
        match self {
            Theme::Professional => 0,
            Theme::Fashion => 1,
            Theme::Gallery => 2,
            Theme::BlackWhite => 3,
            Theme::Magazine => 4,
            Theme::Cinematic => 5,
        }
    }

    fn builtin_prompt(self) -> &'static str {
        match self {
            Theme::Professional => "一张极其高级的职业肖像照。人物身着剪裁精良的商务西装，背景是高级的深灰色影棚背景。光效采用伦勃朗布光法，展现出稳重、专业且具有深度的职场精英气质。高清晰度，细节完美。",
            Theme::Fashion => "高级时装艺术大片。人物穿着充满设计感的先锋时尚服装，在对比强烈的霓虹光影下。构图充满张力，色彩高级且富有冲击力，展现出超模般的时尚表现力。视觉效果震撼，充满未来感。",
            Theme::Gallery => "极简主义美术馆场景中的艺术剪影。人物身处空旷、纯净的艺术空间，正对一面巨大的白色画作或极简装置。柔和的漫反射光线，人物表情空灵、深邃，呈现出一种在艺术空间中游离与沉思的氛围。",
            Theme::BlackWhite => "极具戏剧张力的黑白电影感艺术照。利用强烈的光影对比（Chiaroscuro）来刻画人物面部轮廓。细腻的银盐胶片质感，高对比度，情绪深沉而有力。一张能讲故事的艺术作品。",
            Theme::Magazine => "经典的《时代周刊》(TIME Magazine) 封面风格。画面必须带有标志性的红色粗边框，顶部有醒目的白色‘TIME’艺术字体标题。人物神情坚毅且具有影响力，采用纪实摄影的高级质感，光效严谨，呈现出极具时代感的封面人物视觉效果。",
            Theme::Cinematic => "电影质感的经典剧照肖像。采用2.35:1的宽银幕构图，背景带有电影感的虚化（Bokeh）。冷暖色调的巧妙融合，人物眼神充满叙事感，仿佛是电影中转瞬即逝的动人瞬间。极具大片氛围。",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Theme → style description, fixed for the lifetime of an orchestrator.
#[derive(Debug, Clone)]
pub struct PromptTable {
    styles: HashMap<Theme, String>,
    template: String,
}

impl Default for PromptTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PromptTable {
    pub fn builtin() -> Self {
        let styles = Theme::ALL
            .iter()
            .map(|theme| (*theme, theme.builtin_prompt().to_string()))
            .collect();
        Self {
            styles,
            template: PORTRAIT_INSTRUCTION_TEMPLATE.to_string(),
        }
    }

    pub fn with_style(mut self, theme: Theme, style: impl Into<String>) -> Self {
        let style = style.into();
        if !style.trim().is_empty() {
            self.styles.insert(theme, style.trim().to_string());
        }
        self
    }

    /// Applies per-theme overrides from a JSON object keyed by theme slug.
    /// A missing or broken file leaves the table unchanged.
    pub fn with_overrides_from_path(mut self, path: &Path) -> Self {
        if !path.exists() {
            info!("Prompt override file not found at {}", path.display());
            return self;
        }

        let raw = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(
                    "Failed to read prompt override file at {}: {}",
                    path.display(),
                    err
                );
                return self;
            }
        };

        let parsed: HashMap<Theme, String> = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    "Failed to parse prompt override file at {}: {}",
                    path.display(),
                    err
                );
                return self;
            }
        };

        let count = parsed.len();
        for (theme, style) in parsed {
            self = self.with_style(theme, style);
        }
        info!(
            "Loaded {} prompt override(s) from {}",
            count,
            path.display()
        );
        self
    }

    pub fn style(&self, theme: Theme) -> &str {
        self.styles
            .get(&theme)
            .map(String::as_str)
            .unwrap_or_else(|| theme.builtin_prompt())
    }

    /// Full request text sent with the source image.
    pub fn render(&self, theme: Theme) -> String {
        self.template.replace("{style}", self.style(theme))
    }
}
