//! Core protocol types: request/response messages and error definitions.

pub mod error;
pub mod message;

pub use error::{Result, TierwayError};
pub use message::{Request, Response, SENTINEL, STOP_COMMAND, STOP_ACK};
