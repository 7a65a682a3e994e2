//! Domain models for tekmerion.

mod config;
mod error;
mod item;
mod query;

pub use config::*;
pub use error::*;
pub use item::*;
pub use query::*;
