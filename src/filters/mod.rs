//! Admission filters and the decision algorithm.
//!
//! ## Contents
//! - [`Filter`] one predicate: match function, state function, polarity, order
//! - [`FilterState`] the answer codes (`Disabled`, `Session`, `Pass`, `Fail`, `Retry`)
//! - [`evaluate`] folds a filter list into a [`Decision`]
//! - [`SessionTrigger`] fired by a session starter once its session is established

mod decision;
mod filter;
mod session;
mod state;

pub use decision::{Decision, evaluate};
pub use filter::{Filter, MatchFn, Polarity, StateFn};
pub use session::{SessionStarter, SessionTrigger};
pub use state::FilterState;
