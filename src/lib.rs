//! maskrelay - anonymous group relay fleet.
//!
//! An operator ("father") service accepts user-supplied bot credentials and,
//! for each, runs a group relay that re-broadcasts private messages to every
//! member with the sender hidden behind an ephemeral emoji mask. Edits,
//! deletions, pins and private replies propagate through a durable
//! per-relay operation queue; administrative state (roles, bans, welcome
//! flows, invite codes) is persisted in SQLite.

pub mod cache;
pub mod codes;
pub mod config;
pub mod db;
pub mod error;
pub mod father;
pub mod fleet;
pub mod mask;
pub mod relay;
pub mod voice;
pub mod worker;
