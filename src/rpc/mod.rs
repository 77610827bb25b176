//! src/rpc/mod.rs
//!
//! The seam between the simulator and a puppet's RPC endpoint. The engine
//! only needs request/response calls and streaming calls against a session
//! addressed by port; the wire protocol behind them is pluggable through
//! [`Connector`].

use crate::error::Result;
use futures::{future::BoxFuture, stream::BoxStream};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

pub mod jsonline;

pub use jsonline::{JsonLineClient, JsonLineConnector};

/// An open session with one puppet.
pub trait RpcClient: Send + Sync {
    /// A request with exactly one response.
    fn call<'a>(&'a self, method: &'a str, args: Value) -> BoxFuture<'a, Result<Value>>;

    /// A request answered by a sequence of values. The stream ends when the
    /// peer closes it; errors are yielded in-band.
    fn open_stream<'a>(&'a self, method: &'a str, args: Value) -> BoxStream<'a, Result<Value>>;
}

/// Opens sessions. One connector serves the whole run.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<Box<dyn RpcClient>>>;
}

/// Everything needed to reach and authenticate against a puppet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub port: u16,
    pub caps: String,
    /// The puppet's own secret, used as the local identity of the session.
    pub secret: PathBuf,
}

/// Options of the streaming calls, serialised as the call's argument object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reverse: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub live: bool,
}

impl StreamOptions {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
