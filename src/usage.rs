//! Usage Aggregator: folds per-turn token usage into session counters.
//!
//! Claude Code writes one log line per content block, and every line of a turn
//! repeats the turn's usage. Lines sharing a message id are therefore folded as
//! one turn: only the growth of each field over the turn's running maximum is
//! added, so repeated usage never double counts.

use serde::Serialize;

use crate::session::{ConversationEntry, Role, TokenUsage};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    /// Sum of input tokens across turns.
    pub input_tokens: u64,
    /// Output of the latest turn.
    pub output_tokens: u64,
    pub total_output_tokens: u64,
    /// Tokens occupying the context window as of the latest turn.
    pub context_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

/// Incremental fold state. Folding the same entries in any chunking gives
/// the same totals.
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    totals: UsageTotals,
    turn_id: Option<String>,
    turn_max: TokenUsage,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> &UsageTotals {
        &self.totals
    }

    pub fn apply(&mut self, entry: &ConversationEntry) {
        if entry.role != Role::Assistant {
            return;
        }
        let Some(usage) = entry.usage else {
            return;
        };

        let same_turn = entry.message_id.is_some() && entry.message_id == self.turn_id;
        let delta = if same_turn {
            let delta = TokenUsage {
                input_tokens: usage.input_tokens.saturating_sub(self.turn_max.input_tokens),
                output_tokens: usage.output_tokens.saturating_sub(self.turn_max.output_tokens),
                cache_creation_tokens: usage
                    .cache_creation_tokens
                    .saturating_sub(self.turn_max.cache_creation_tokens),
                cache_read_tokens: usage
                    .cache_read_tokens
                    .saturating_sub(self.turn_max.cache_read_tokens),
            };
            self.turn_max = TokenUsage {
                input_tokens: self.turn_max.input_tokens.max(usage.input_tokens),
                output_tokens: self.turn_max.output_tokens.max(usage.output_tokens),
                cache_creation_tokens: self
                    .turn_max
                    .cache_creation_tokens
                    .max(usage.cache_creation_tokens),
                cache_read_tokens: self.turn_max.cache_read_tokens.max(usage.cache_read_tokens),
            };
            delta
        } else {
            self.turn_id = entry.message_id.clone();
            self.turn_max = usage;
            usage
        };

        let totals = &mut self.totals;
        totals.input_tokens = totals.input_tokens.saturating_add(delta.input_tokens);
        totals.total_output_tokens = totals.total_output_tokens.saturating_add(delta.output_tokens);
        totals.cache_creation_tokens = totals
            .cache_creation_tokens
            .saturating_add(delta.cache_creation_tokens);
        totals.cache_read_tokens = totals.cache_read_tokens.saturating_add(delta.cache_read_tokens);

        let turn = self.turn_max;
        totals.output_tokens = turn.output_tokens;
        let context = turn
            .input_tokens
            .saturating_add(turn.cache_creation_tokens)
            .saturating_add(turn.cache_read_tokens);
        totals.context_tokens = if context > 0 {
            context
        } else {
            turn.input_tokens
        };
    }
}

/// Fold a full entry history from scratch.
pub fn fold_usage<'a>(entries: impl IntoIterator<Item = &'a ConversationEntry>) -> UsageTotals {
    let mut acc = UsageAccumulator::new();
    for entry in entries {
        acc.apply(entry);
    }
    acc.totals
}
