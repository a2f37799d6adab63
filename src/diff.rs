//! UI-relevant consequences of a cache update.

use crate::cache::DeltaOutcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListEffects {
    pub count_changed: bool,
    pub became_empty: bool,
    pub became_non_empty: bool,
    /// Which empty indicator to show when the list just emptied.
    pub empty_notice: Option<EmptyNotice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyNotice {
    /// Nothing cached at all.
    NoTorrents,
    /// Torrents exist but the active filter hides all of them.
    FilteredEmpty,
}

impl EmptyNotice {
    pub fn message(self) -> &'static str {
        match self {
            EmptyNotice::NoTorrents => "No torrents",
            EmptyNotice::FilteredEmpty => "No torrents match the current filter",
        }
    }

    /// Picks the indicator for a list showing `visible` of `cached` torrents.
    pub fn for_counts(visible: usize, cached: usize) -> Option<Self> {
        match (visible, cached) {
            (0, 0) => Some(EmptyNotice::NoTorrents),
            (0, _) => Some(EmptyNotice::FilteredEmpty),
            _ => None,
        }
    }
}

pub fn compute_effects(
    previous_count: usize,
    new_count: usize,
    added_count: usize,
    removed_count: usize,
    filter_active: bool,
) -> ListEffects {
    let count_changed = previous_count != new_count || added_count > 0 || removed_count > 0;
    let became_empty = previous_count > 0 && new_count == 0;
    let became_non_empty = previous_count == 0 && new_count > 0;
    let empty_notice = if became_empty {
        Some(if filter_active {
            EmptyNotice::FilteredEmpty
        } else {
            EmptyNotice::NoTorrents
        })
    } else {
        None
    };
    ListEffects {
        count_changed,
        became_empty,
        became_non_empty,
        empty_notice,
    }
}

/// Effects of a delta; `first_snapshot` reports an initial empty list even
/// though nothing changed.
pub fn effects_for_delta(
    outcome: &DeltaOutcome,
    filter_active: bool,
    first_snapshot: bool,
) -> ListEffects {
    let mut effects = compute_effects(
        outcome.previous_count,
        outcome.count,
        outcome.added,
        outcome.removed,
        filter_active,
    );
    if first_snapshot && outcome.count == 0 {
        effects.empty_notice = Some(EmptyNotice::NoTorrents);
    }
    effects
}
