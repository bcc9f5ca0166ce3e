//! Round cap accounting and quadratic-funding matching.
//!
//! Rounds run in sequence: early-access rounds with hard per-project and
//! per-user caps, then QF rounds whose matching pool is split across projects
//! by the quadratic-funding formula.  [`engine::Engine`] is the in-process
//! entry point; the binary hosts it behind a small REST API.

pub mod aggregates;
pub mod api;
pub mod caps;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod locks;
pub mod matching;
pub mod registry;
pub mod reputation;
pub mod scheduler;
pub mod selector;
pub mod types;

#[cfg(test)]
mod test_engine;
