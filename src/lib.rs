//! Core of a read-only federating proxy over N independent Solr-like search
//! backends: schema merging, multi-backend querying, and cross-backend
//! pagination.
//!
//! The HTTP surface, process bootstrap, and backend discovery mechanism
//! live outside this crate; [`coordinator::Coordinator`] exposes the
//! system's public operations as plain async methods.

pub mod cache;
pub mod client;
pub mod column;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod drip;
pub mod error;
pub mod http;
pub mod merge;
pub mod pager;
pub mod query;

pub use coordinator::Coordinator;
pub use document::{Attachment, Document};
pub use error::ProxyError;
