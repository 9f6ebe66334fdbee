//! # Admission decision.
//!
//! [`evaluate`] folds a loader's filters into one [`FilterState`].
//!
//! ## Algorithm
//! ```text
//! sort by order, descending (stable)
//! for each filter:
//!   no match        → remember as last unmatched, skip
//!   Disabled        → remember "some disabled", skip
//!   Session         → remember as session filter
//!   Retry(d)        → keep the smallest d
//!   remember as last responder
//!
//! no responder      → Pass if some filter was disabled, else Fail
//! include responder → its answer
//! exclude responder → Pass↔Fail swapped, Session/Retry unchanged
//! smallest retry    → overrides Pass (or no responder)
//! Session, or Pass with a session filter:
//!   exclude session filter → Fail
//!   otherwise              → Session, starter invoked once
//! dedupe and Pass with a session-capable last unmatched filter
//!                   → Fail, send a deduplicated signal
//! ```
//!
//! An empty filter list always yields `Pass`.
//!
//! Exclude filters only swap `Pass` and `Fail`: a `Session` or `Retry` answer
//! from an exclude filter reaches the decision unchanged.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::filter::{Filter, Polarity};
use super::state::FilterState;

/// Outcome of [`evaluate`].
#[derive(Debug, Clone)]
pub struct Decision {
    /// The admission decision.
    pub state: FilterState,
    /// Filter holding the session when `state` is `Session`.
    pub session_filter: Option<Arc<Filter>>,
    /// A deduplicated signal should be sent instead of running.
    pub send_dedupe: bool,
}

impl Decision {
    fn new(state: FilterState) -> Self {
        Self {
            state,
            session_filter: None,
            send_dedupe: false,
        }
    }
}

/// Evaluates `filters` for the loader named `loader`.
///
/// `dedupe` marks loaders that take part in deduplicated accounting.
pub fn evaluate(filters: &[Arc<Filter>], loader: &str, dedupe: bool) -> Decision {
    if filters.is_empty() {
        return Decision::new(FilterState::Pass);
    }

    let mut ordered: Vec<&Arc<Filter>> = filters.iter().collect();
    ordered.sort_by(|a, b| b.order().cmp(&a.order()));

    let mut any_disabled = false;
    let mut session: Option<&Arc<Filter>> = None;
    let mut responder: Option<(&Arc<Filter>, FilterState)> = None;
    let mut last_unmatched: Option<&Arc<Filter>> = None;
    let mut min_retry: Option<Duration> = None;

    for filter in ordered {
        if !filter.matches(loader) {
            last_unmatched = Some(filter);
            continue;
        }
        let answer = filter.state(loader);
        match answer {
            FilterState::Disabled => {
                any_disabled = true;
                continue;
            }
            FilterState::Session => session = Some(filter),
            FilterState::Retry(d) => min_retry = Some(min_retry.map_or(d, |m| m.min(d))),
            FilterState::Pass | FilterState::Fail => {}
        }
        responder = Some((filter, answer));
    }

    let mut state = match responder {
        None if any_disabled => FilterState::Pass,
        None => FilterState::Fail,
        Some((filter, answer)) => match (filter.polarity(), answer) {
            (Polarity::Include, answer) => answer,
            (Polarity::Exclude, FilterState::Pass) => FilterState::Fail,
            (Polarity::Exclude, FilterState::Fail) => FilterState::Pass,
            (Polarity::Exclude, answer) => answer,
        },
    };

    if let Some(retry) = min_retry {
        if state == FilterState::Pass || responder.is_none() {
            state = FilterState::Retry(retry);
        }
    }

    let mut decision = Decision::new(state);

    if let Some(filter) = session {
        if matches!(state, FilterState::Session | FilterState::Pass) {
            if filter.polarity() == Polarity::Exclude {
                decision.state = FilterState::Fail;
            } else {
                decision.state = FilterState::Session;
                filter.start_session();
                decision.session_filter = Some(Arc::clone(filter));
            }
        }
    }

    if dedupe
        && decision.state == FilterState::Pass
        && last_unmatched.is_some_and(|f| f.is_session_capable())
    {
        decision.state = FilterState::Fail;
        decision.send_dedupe = true;
    }

    debug!(loader, decision = %decision.state, dedupe = decision.send_dedupe, "filters evaluated");
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn arc(f: Filter) -> Arc<Filter> {
        Arc::new(f)
    }

    #[test]
    fn test_no_filters_pass() {
        assert_eq!(evaluate(&[], "tag", false).state, FilterState::Pass);
        assert_eq!(evaluate(&[], "tag", true).state, FilterState::Pass);
    }

    #[test]
    fn test_include_pass_and_exclude_fail() {
        let include = [arc(Filter::constant("f", FilterState::Pass).with_order(1))];
        assert_eq!(evaluate(&include, "tag", false).state, FilterState::Pass);

        let exclude = [arc(
            Filter::constant("f", FilterState::Pass).with_order(1).exclude(),
        )];
        assert_eq!(evaluate(&exclude, "tag", false).state, FilterState::Fail);
    }

    #[test]
    fn test_exclude_passes_retry_and_session_through() {
        // Exclude only swaps Pass and Fail.
        let retry = [arc(Filter::constant("f", FilterState::retry_ms(40)).exclude())];
        assert_eq!(evaluate(&retry, "tag", false).state, FilterState::retry_ms(40));

        let fail = [arc(Filter::constant("f", FilterState::Fail).exclude())];
        assert_eq!(evaluate(&fail, "tag", false).state, FilterState::Pass);

        // An exclude session filter ends up failing in the session step.
        let session = [arc(Filter::constant("f", FilterState::Session).exclude())];
        assert_eq!(evaluate(&session, "tag", false).state, FilterState::Fail);
    }

    #[test]
    fn test_nothing_matched_fails() {
        let filters = [arc(
            Filter::constant("f", FilterState::Pass).matching(|name| name == "other"),
        )];
        assert_eq!(evaluate(&filters, "tag", false).state, FilterState::Fail);
    }

    #[test]
    fn test_disabled_filters_are_transparent() {
        let only_disabled = [arc(Filter::constant("f", FilterState::Fail).disabled())];
        assert_eq!(evaluate(&only_disabled, "tag", false).state, FilterState::Pass);

        let mixed = [
            arc(Filter::constant("d", FilterState::Pass).disabled().with_order(5)),
            arc(Filter::constant("f", FilterState::Fail)),
        ];
        assert_eq!(evaluate(&mixed, "tag", false).state, FilterState::Fail);
    }

    #[test]
    fn test_lowest_order_responder_decides() {
        let filters = [
            arc(Filter::constant("low", FilterState::Fail).with_order(1)),
            arc(Filter::constant("high", FilterState::Pass).with_order(9)),
        ];
        assert_eq!(evaluate(&filters, "tag", false).state, FilterState::Fail);

        let ties = [
            arc(Filter::constant("first", FilterState::Fail)),
            arc(Filter::constant("second", FilterState::Pass)),
        ];
        assert_eq!(evaluate(&ties, "tag", false).state, FilterState::Pass);
    }

    #[test]
    fn test_soonest_retry_overrides_pass() {
        let filters = [
            arc(Filter::constant("slow", FilterState::retry_ms(500)).with_order(3)),
            arc(Filter::constant("fast", FilterState::retry_ms(50)).with_order(2)),
            arc(Filter::constant("ok", FilterState::Pass).with_order(1)),
        ];
        assert_eq!(evaluate(&filters, "tag", false).state, FilterState::retry_ms(50));

        let failing = [
            arc(Filter::constant("r", FilterState::retry_ms(50)).with_order(2)),
            arc(Filter::constant("no", FilterState::Fail).with_order(1)),
        ];
        assert_eq!(evaluate(&failing, "tag", false).state, FilterState::Fail);
    }

    #[test]
    fn test_session_starter_invoked_once() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let filters = [arc(
            Filter::constant("consent", FilterState::Session)
                .with_order(1)
                .with_session_starter(move |_trigger| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        )];

        for _ in 0..3 {
            let decision = evaluate(&filters, "tag", false);
            assert_eq!(decision.state, FilterState::Session);
            assert!(decision.session_filter.is_some());
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pass_with_matching_session_filter_defers() {
        let filters = [
            arc(Filter::constant("consent", FilterState::Session).with_order(5).session()),
            arc(Filter::constant("ok", FilterState::Pass).with_order(1)),
        ];
        let decision = evaluate(&filters, "tag", false);
        assert_eq!(decision.state, FilterState::Session);
        assert_eq!(decision.session_filter.map(|f| f.name().to_string()).as_deref(), Some("consent"));
    }

    #[test]
    fn test_dedupe_replaces_run_after_unmatched_session_filter() {
        let filters = [
            arc(Filter::constant("ok", FilterState::Pass).with_order(5)),
            arc(
                Filter::constant("consent", FilterState::Session)
                    .with_order(1)
                    .session()
                    .matching(|_| false),
            ),
        ];
        let plain = evaluate(&filters, "tag", false);
        assert_eq!(plain.state, FilterState::Pass);
        assert!(!plain.send_dedupe);

        let deduped = evaluate(&filters, "tag", true);
        assert_eq!(deduped.state, FilterState::Fail);
        assert!(deduped.send_dedupe);
    }
}
