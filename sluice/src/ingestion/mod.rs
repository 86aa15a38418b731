//! Record ingestion: a bounded in-memory channel and a TCP source for it.
//!
//! Processing units consume records from an [`IngestionChannel`]; an
//! [`IngestionListener`] (or any other producer) pushes into it.

mod channel;
mod error;
mod listener;

pub use channel::{Health, IngestionChannel};
pub use error::{IngestionError, Result};
pub use listener::IngestionListener;
