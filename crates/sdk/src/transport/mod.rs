//! Transport layer for the Shiioo SDK.

pub mod http;

pub use http::HttpTransport;
