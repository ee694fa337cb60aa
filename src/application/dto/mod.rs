//! Data transfer objects for application layer.

mod fetch_dto;

pub use fetch_dto::{FetchReport, FetchRequest};
