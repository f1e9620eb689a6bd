//! Socket kind enumeration.
//!
//! A connection manager hands out exactly two kinds of sockets. The set is
//! closed: anything else is rejected when parsed from a string.

use crate::error::WarrenError;
use std::fmt;
use std::str::FromStr;

/// Request/reply socket roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// REQ socket: client role, round-robins requests and awaits replies
    Request,

    /// REP socket: server role, consumes requests and ships replies
    Reply,
}

impl SocketType {
    /// Get the socket type as a string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "REQ",
            Self::Reply => "REP",
        }
    }

    /// Check if this socket type talks to the given peer type.
    pub fn is_compatible(&self, peer: SocketType) -> bool {
        matches!(
            (self, peer),
            (Self::Request, Self::Reply) | (Self::Reply, Self::Request)
        )
    }
}

impl FromStr for SocketType {
    type Err = WarrenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "req" | "request" => Ok(Self::Request),
            "rep" | "reply" => Ok(Self::Reply),
            _ => Err(WarrenError::InvalidSocketType(s.to_string())),
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
