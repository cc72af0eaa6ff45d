use std::fmt;

use crate::llm::media::GeneratedImage;
use crate::studio::error::GenerationError;
use crate::studio::slot::{SlotId, ThemeSlot};
use crate::studio::theme::Theme;

/// Epoch of a batch. Only completions carrying the current token may touch the slot list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BatchToken(u64);

impl BatchToken {
    pub fn value(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        BatchToken(self.0.wrapping_add(1))
    }
}

impl fmt::Display for BatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A finished remote call, as reported by its task.
#[derive(Debug, Clone)]
pub struct SlotUpdate {
    pub token: BatchToken,
    pub slot_id: SlotId,
    pub index: usize,
    pub outcome: Result<GeneratedImage, GenerationError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Issued under an older epoch.
    StaleEpoch,
    /// Same epoch, but the slot it targeted has since been replaced or settled.
    StaleSlot,
}

/// The slot list and its epoch. All mutation goes through here.
#[derive(Debug, Default)]
pub struct BatchState {
    token: BatchToken,
    slots: Vec<ThemeSlot>,
}

impl BatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> BatchToken {
        self.token
    }

    pub fn slots(&self) -> &[ThemeSlot] {
        &self.slots
    }

    pub fn pending_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_pending()).count()
    }

    /// Advances the epoch and lays out one pending slot per theme, in order.
    pub fn begin(&mut self, themes: &[Theme]) -> BatchToken {
        self.token = self.token.next();
        self.slots = themes.iter().map(|theme| ThemeSlot::pending(*theme)).collect();
        self.token
    }

    /// Advances the epoch and drops every slot.
    pub fn clear(&mut self) -> BatchToken {
        self.token = self.token.next();
        self.slots.clear();
        self.token
    }

    pub fn position(&self, slot_id: SlotId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id() == slot_id)
    }

    /// Swaps a terminal slot for a fresh pending one with a new id. The epoch is unchanged.
    pub fn renew(&mut self, index: usize) -> Option<&ThemeSlot> {
        let slot = self.slots.get_mut(index)?;
        if slot.is_pending() {
            return None;
        }
        *slot = ThemeSlot::pending(slot.theme());
        Some(&*slot)
    }

    pub fn apply(&mut self, update: SlotUpdate) -> ApplyOutcome {
        if update.token != self.token {
            return ApplyOutcome::StaleEpoch;
        }
        let Some(slot) = self.slots.get_mut(update.index) else {
            return ApplyOutcome::StaleSlot;
        };
        if slot.id() != update.slot_id {
            return ApplyOutcome::StaleSlot;
        }
        if slot.settle(update.outcome) {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::StaleSlot
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::studio::error::GenerationErrorKind;
    use crate::studio::slot::SlotStatus;

    fn done(state: &BatchState, index: usize, byte: u8) -> SlotUpdate {
        SlotUpdate {
            token: state.token(),
            slot_id: state.slots()[index].id(),
            index,
            outcome: Ok(GeneratedImage::new(vec![byte], "image/png")),
        }
    }

    #[test]
    fn begin_lays_out_slots_in_theme_order() {
        let mut state = BatchState::new();
        let first = state.begin(&Theme::ALL);
        let second = state.begin(&Theme::ALL);
        assert!(second > first);
        assert_eq!(state.slots().len(), 6);
        for (slot, theme) in state.slots().iter().zip(Theme::ALL) {
            assert_eq!(slot.theme(), theme);
            assert_eq!(slot.status(), SlotStatus::Pending);
        }
    }

    #[test]
    fn updates_from_an_old_epoch_are_rejected() {
        let mut state = BatchState::new();
        state.begin(&Theme::ALL);
        let update = done(&state, 0, 1);
        state.clear();

        assert_eq!(state.apply(update), ApplyOutcome::StaleEpoch);
        assert!(state.slots().is_empty());
    }

    #[test]
    fn clearing_an_empty_state_only_moves_the_epoch() {
        let mut state = BatchState::new();
        let before = state.token();
        let after = state.clear();
        assert_eq!(after.value(), before.value() + 1);
        assert!(state.slots().is_empty());
    }

    #[test]
    fn renewed_slot_ignores_result_meant_for_its_predecessor() {
        let mut state = BatchState::new();
        state.begin(&Theme::ALL);
        let failed = SlotUpdate {
            token: state.token(),
            slot_id: state.slots()[2].id(),
            index: 2,
            outcome: Err(GenerationError::new(GenerationErrorKind::EmptyResponse, "none")),
        };
        let old_id = failed.slot_id;
        assert_eq!(state.apply(failed.clone()), ApplyOutcome::Applied);

        assert!(state.renew(2).is_some());
        assert_ne!(state.slots()[2].id(), old_id);
        assert_eq!(state.apply(failed), ApplyOutcome::StaleSlot);
        assert_eq!(state.slots()[2].status(), SlotStatus::Pending);
    }

    #[test]
    fn pending_slots_cannot_be_renewed() {
        let mut state = BatchState::new();
        state.begin(&Theme::ALL);
        assert!(state.renew(0).is_none());
        assert!(state.renew(42).is_none());
    }

    #[test]
    fn duplicate_completion_does_not_overwrite() {
        let mut state = BatchState::new();
        state.begin(&Theme::ALL);
        let first = done(&state, 4, 1);
        let mut second = first.clone();
        second.outcome = Ok(GeneratedImage::new(vec![2], "image/png"));

        assert_eq!(state.apply(first), ApplyOutcome::Applied);
        assert_eq!(state.apply(second), ApplyOutcome::StaleSlot);
        assert_eq!(state.slots()[4].image().map(|img| img.bytes()), Some(&[1u8][..]));
    }
}
