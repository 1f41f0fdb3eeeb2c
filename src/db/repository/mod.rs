//! Repository layer: entity-scoped database operations.
//!
//! All public functions are re-exported here so callers use
//! `db::repository::insert_flow(..)` without knowing the file split.

mod appointment;
mod automation;
mod automation_log;
mod confirmation;
mod conversation;
mod legal;
mod patient;

#[cfg(test)]
pub(crate) mod fixtures;

pub use appointment::*;
pub use automation::*;
pub use automation_log::*;
pub use confirmation::*;
pub use conversation::*;
pub use legal::*;
pub use patient::*;
