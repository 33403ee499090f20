//! Search indexing and query subsystem for a wiki content store
//!
//! See [`search`] for the components and [`config::Config`] for runtime settings.

pub mod config;
pub mod error;
pub mod search;

pub use error::{AppError, Result};
