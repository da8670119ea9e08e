//! Signal subscriptions and the tree that indexes them.

pub mod rule;
pub mod tree;

pub use rule::{
    signal_handler, HandlerError, MatchRule, MatchSpec, SignalEvent, SignalHandler, MAX_MATCH_ARG,
};
pub use tree::MatchTree;
