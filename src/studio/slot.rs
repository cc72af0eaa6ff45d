use std::fmt;

use uuid::Uuid;

use crate::llm::media::GeneratedImage;
use crate::studio::error::GenerationError;
use crate::studio::theme::Theme;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(Uuid);

impl SlotId {
    pub fn new() -> Self {
        SlotId(Uuid::new_v4())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Pending,
    Done,
    Failed,
}

impl SlotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Pending => "pending",
            SlotStatus::Done => "done",
            SlotStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Done(GeneratedImage),
    Failed(GenerationError),
}

/// One theme's rendering within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeSlot {
    id: SlotId,
    theme: Theme,
    state: SlotState,
}

impl ThemeSlot {
    pub fn pending(theme: Theme) -> Self {
        Self {
            id: SlotId::new(),
            theme,
            state: SlotState::Pending,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    pub fn status(&self) -> SlotStatus {
        match self.state {
            SlotState::Pending => SlotStatus::Pending,
            SlotState::Done(_) => SlotStatus::Done,
            SlotState::Failed(_) => SlotStatus::Failed,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, SlotState::Pending)
    }

    pub fn image(&self) -> Option<&GeneratedImage> {
        match &self.state {
            SlotState::Done(image) => Some(image),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&GenerationError> {
        match &self.state {
            SlotState::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Settles a pending slot. Returns false if it was already terminal.
    pub(crate) fn settle(&mut self, outcome: Result<GeneratedImage, GenerationError>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state = match outcome {
            Ok(image) => SlotState::Done(image),
            Err(err) => SlotState::Failed(err),
        };
        true
    }
}
