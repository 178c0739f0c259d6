//! txn-server: a framed TCP transaction server.
//!
//! Each connection carries one request frame (a 4-digit ASCII length header
//! followed by a JSON body), is routed by the body's `TransCode` field to a
//! registered handler, and receives one response frame before being closed.

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod router;
pub mod server;
