//! One-hop rename segmentation.
//!
//! Splits a request on a current symbol into at most two storage sub-ranges.
//! The `UNIQUE(new_symbol)` constraint on the rename table makes the lookup
//! deterministic; exactly one hop is ever resolved.

use chrono::{Days, NaiveDate};

use crate::model::SymbolChange;

/// One storage sub-range covering part of a requested window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub storage_symbol: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Split `[from, to]` across the rename boundary, if any. The returned
/// segments are ordered, non-overlapping, and union exactly to `[from, to]`.
pub fn resolve_segments(
    symbol: &str,
    from: NaiveDate,
    to: NaiveDate,
    rename: Option<&SymbolChange>,
) -> Vec<Segment> {
    debug_assert!(from <= to);

    let Some(change) = rename else {
        return vec![Segment {
            storage_symbol: symbol.to_string(),
            from,
            to,
        }];
    };
    debug_assert_eq!(change.new_symbol, symbol);

    let mut segments = Vec::with_capacity(2);
    if from < change.change_date {
        // checked_sub on change_date > from always succeeds
        let old_to = change
            .change_date
            .checked_sub_days(Days::new(1))
            .unwrap_or(change.change_date)
            .min(to);
        segments.push(Segment {
            storage_symbol: change.old_symbol.clone(),
            from,
            to: old_to,
        });
    }
    if to >= change.change_date {
        segments.push(Segment {
            storage_symbol: symbol.to_string(),
            from: from.max(change.change_date),
            to,
        });
    }
    segments
}
