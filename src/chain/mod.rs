//! Batch chains and their materialized state.
//!
//! The manager runs one capture cycle at a time per account: load the
//! materialized state, diff the new capture against it, append the batch with
//! the head as parent, then update the cache. State can always be rebuilt by
//! folding the chain from its first batch; checkpoints shorten the fold.

mod manager;
mod state;

pub use manager::{ChainConfig, ChainManager};
pub use state::{fold, ChainHead, Materialized};
