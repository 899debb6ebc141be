//! Account ID sets and their on-disk encoding.

pub mod codec;
mod set;

pub use set::{IdSet, MembershipConflict};
