//! Request and response messages.
//!
//! Messages travel as plain text, one per connection. A request is the
//! caller id and the value separated by a single ASCII space; a response is
//! either a number formatted to exactly two decimals or the sentinel `-1`
//! denoting a rejected request. The sentinel is encoded the same way as a
//! numeric response so the wire format stays uniform end to end.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{Result, TierwayError};

/// The literal response sent for an illegal (negative) request.
///
/// Also used when a tier cannot produce a real result (downstream failure,
/// malformed input): the caller always gets a well-formed response line.
pub const SENTINEL: &str = "-1";

/// Control line that asks a tier process to stop accepting and exit cleanly.
pub const STOP_COMMAND: &str = "stop";

/// Acknowledgement a tier sends back before exiting on [`STOP_COMMAND`].
pub const STOP_ACK: &str = "ok";

/// A request as it travels through the fabric.
///
/// The request is created by the client and relayed unmodified by the load
/// balancer and the reverse proxy; only the proxy may short-circuit it with
/// the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller identity, the load balancer's routing key.
    pub caller_id: i64,
    /// The operand the compute server applies its workload to.
    pub value: f64,
}

impl Request {
    pub fn new(caller_id: i64, value: f64) -> Self {
        Request { caller_id, value }
    }

    /// Parses a request line of the form `"<caller_id> <value>"`.
    ///
    /// Both fields are mandatory and nothing may follow the value. Parse
    /// failures are reported as [`TierwayError::Parse`] so the serving loop
    /// can answer with the sentinel instead of dying on bad input.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (id_part, value_part) = line
            .split_once(' ')
            .ok_or_else(|| TierwayError::Parse(format!("expected '<caller_id> <value>', got '{line}'")))?;

        let caller_id: i64 = id_part
            .parse()
            .map_err(|e| TierwayError::Parse(format!("invalid caller id '{id_part}': {e}")))?;
        let value: f64 = value_part
            .trim()
            .parse()
            .map_err(|e| TierwayError::Parse(format!("invalid value '{value_part}': {e}")))?;

        Ok(Request { caller_id, value })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.caller_id, self.value)
    }
}

/// A response as rendered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// A computed result, rendered with exactly two decimals.
    Value(f64),
    /// The `-1` sentinel for a rejected or failed request.
    Illegal,
}

impl Response {
    /// Parses a response line: the sentinel or a float literal.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line == SENTINEL {
            return Ok(Response::Illegal);
        }
        let value: f64 = line
            .parse()
            .map_err(|e| TierwayError::Parse(format!("invalid response '{line}': {e}")))?;
        Ok(Response::Value(value))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Value(v) => write!(f, "{v:.2}"),
            Response::Illegal => f.write_str(SENTINEL),
        }
    }
}
