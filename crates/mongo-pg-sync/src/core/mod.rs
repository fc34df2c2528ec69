//! Core types shared across the engine: entity catalogue, row values, retry policy.

pub mod entity;
pub mod retry;
pub mod value;

pub use entity::{Column, ColumnKind, EntityType, ORIGIN_ID_COLUMN, SURROGATE_ID_COLUMN};
pub use retry::{Backoff, Jitter, RetryPolicy};
pub use value::{Row, SqlNullType, SqlValue};
