//! Model router: supervises one worker server process per model and proxies
//! requests to them by name.

pub mod web;
