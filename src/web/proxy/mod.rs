//! Streaming relay of one HTTP exchange between a caller and a worker.

pub mod http_proxy;
pub mod pipe;
