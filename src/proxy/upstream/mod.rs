pub mod catalog;
pub mod client;

pub use client::{UpstreamClient, UpstreamError, UpstreamErrorKind};
