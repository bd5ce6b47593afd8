//! Components C-F: matching stack (spec.md §4.C-§4.F).

mod cascade;
mod coordinator;
mod simple;
mod tracker;

pub use cascade::{CascadeLevel, CascadeMatcher, CascadeOutcome};
pub use coordinator::{CoordinatorConfig, CoordinatorOutcome, MatchingCoordinator};
pub use simple::{SimpleMatchOutcome, SimpleMatcher, SimpleMatcherConfig};
pub use tracker::{TrackerOutcome, TranslationTracker};
