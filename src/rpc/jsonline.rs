//! src/rpc/jsonline.rs
//!
//! A newline-delimited JSON transport for shims that expose a plain control
//! socket on their RPC port.
//!
//! Requests are `{"id", "method", "args", "stream"}` objects, one per line.
//! Every response line carries the request `id` and one of `result`,
//! `error` or `"end": true` (streams only).

use crate::{
    error::{Error, Result},
    rpc::{Connector, RpcClient, Session},
};
use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    FutureExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::{
    io::{split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{Mutex, MutexGuard},
};

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    args: Value,
    stream: bool,
}

#[derive(Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    end: bool,
}

enum Frame {
    Value(Value),
    End,
}

struct Channel<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> Channel<S> {
    async fn send(&mut self, request: &Request<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads lines until one answers `id`. Frames for other ids belong to
    /// abandoned requests and are dropped.
    async fn recv(&mut self, id: u64) -> Result<Frame> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(Error::Transport("connection closed by peer".into()));
            }
            if line.trim().is_empty() {
                continue;
            }
            let response: Response = serde_json::from_str(&line).map_err(Error::transport)?;
            if response.id != id {
                tracing::trace!(expected = id, got = response.id, "Dropping stale response frame");
                continue;
            }
            if let Some(error) = response.error {
                return Err(Error::Transport(error));
            }
            if response.end {
                return Ok(Frame::End);
            }
            return Ok(Frame::Value(response.result.unwrap_or(Value::Null)));
        }
    }
}

/// One session over any bidirectional byte stream. Requests are serialised
/// on the connection; a stream holds it until it is drained or dropped.
pub struct JsonLineClient<S> {
    channel: Mutex<Channel<S>>,
    next_id: AtomicU64,
}

impl<S> JsonLineClient<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: S) -> Self {
        let (read, writer) = split(io);
        Self {
            channel: Mutex::new(Channel {
                reader: BufReader::new(read),
                writer,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

enum StreamState<'a, S> {
    Pending(Request<'a>),
    Open(MutexGuard<'a, Channel<S>>),
    Done,
}

impl<S> RpcClient for JsonLineClient<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn call<'a>(&'a self, method: &'a str, args: Value) -> BoxFuture<'a, Result<Value>> {
        async move {
            let id = self.next_id();
            tracing::trace!(id, method, "rpc call");
            let mut channel = self.channel.lock().await;
            channel
                .send(&Request {
                    id,
                    method,
                    args,
                    stream: false,
                })
                .await?;
            match channel.recv(id).await? {
                Frame::Value(value) => Ok(value),
                Frame::End => Ok(Value::Null),
            }
        }
        .boxed()
    }

    fn open_stream<'a>(&'a self, method: &'a str, args: Value) -> BoxStream<'a, Result<Value>> {
        let id = self.next_id();
        tracing::trace!(id, method, "rpc stream");
        let request = Request {
            id,
            method,
            args,
            stream: true,
        };
        stream::unfold(StreamState::Pending(request), move |state| async move {
            let mut channel = match state {
                StreamState::Pending(request) => {
                    let mut channel = self.channel.lock().await;
                    if let Err(e) = channel.send(&request).await {
                        return Some((Err(e), StreamState::Done));
                    }
                    channel
                }
                StreamState::Open(channel) => channel,
                StreamState::Done => return None,
            };
            match channel.recv(id).await {
                Ok(Frame::Value(value)) => Some((Ok(value), StreamState::Open(channel))),
                Ok(Frame::End) => None,
                Err(e) => Some((Err(e), StreamState::Done)),
            }
        })
        .boxed()
    }
}

/// Connects to `127.0.0.1:<port>` over plain TCP.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLineConnector;

impl Connector for JsonLineConnector {
    fn connect<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<Box<dyn RpcClient>>> {
        async move {
            let stream = TcpStream::connect(("127.0.0.1", session.port))
                .await
                .map_err(Error::transport)?;
            stream.set_nodelay(true)?;
            tracing::debug!(port = session.port, "Opened control session");
            Ok(Box::new(JsonLineClient::new(stream)) as Box<dyn RpcClient>)
        }
        .boxed()
    }
}
