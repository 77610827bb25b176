//! src/sim/ops.rs
//!
//! Typed RPC operations against a running puppet. Every operation opens its
//! own session through the run's [`Connector`].

use crate::{
    error::{Error, Result},
    feed::{multiserver_address, FeedId},
    rpc::{Connector, Session, StreamOptions},
};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// One entry of `replicate.upto`: the newest sequence a peer holds of a feed.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Latest {
    #[serde(alias = "ID")]
    pub id: String,
    #[serde(alias = "Sequence")]
    pub sequence: u64,
    #[serde(default, alias = "TS")]
    pub ts: Option<i64>,
}

pub async fn whoami(conn: &dyn Connector, session: &Session) -> Result<FeedId> {
    let client = conn.connect(session).await?;
    let reply = client.call("whoami", json!([])).await?;
    let id = reply
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Transport(format!("whoami returned no id: {reply}")))?;
    id.parse()
}

pub async fn connect(conn: &dyn Connector, session: &Session, port: u16, dst: &FeedId) -> Result<()> {
    let client = conn.connect(session).await?;
    client
        .call("conn.connect", json!([multiserver_address(port, dst)]))
        .await?;
    Ok(())
}

pub async fn disconnect(conn: &dyn Connector, session: &Session, port: u16, dst: &FeedId) -> Result<()> {
    let client = conn.connect(session).await?;
    client
        .call("conn.disconnect", json!([multiserver_address(port, dst)]))
        .await?;
    Ok(())
}

pub async fn publish(conn: &dyn Connector, session: &Session, content: Value) -> Result<()> {
    let client = conn.connect(session).await?;
    client.call("publish", json!([content])).await?;
    Ok(())
}

/// A contact message; `following == false` unfollows.
pub fn contact(dst: &FeedId, following: bool) -> Value {
    json!({"type": "contact", "contact": dst, "following": following})
}

/// The canned post published by `post`.
pub fn canned_post() -> Value {
    json!({"type": "post", "text": "bep"})
}

pub async fn is_following(
    conn: &dyn Connector,
    session: &Session,
    source: &FeedId,
    dest: &FeedId,
) -> Result<bool> {
    let client = conn.connect(session).await?;
    let reply = client
        .call("friends.isFollowing", json!([{"source": source, "dest": dest}]))
        .await?;
    reply
        .as_bool()
        .ok_or_else(|| Error::Transport(format!("friends.isFollowing returned {reply}")))
}

pub async fn latest_sequences(conn: &dyn Connector, session: &Session) -> Result<Vec<Latest>> {
    let client = conn.connect(session).await?;
    let values: Vec<Value> = client
        .open_stream("replicate.upto", json!({}))
        .try_collect()
        .await?;
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(Error::from))
        .collect()
}

/// Sum of every feed's latest sequence held by the puppet.
pub async fn count_messages(conn: &dyn Connector, session: &Session) -> Result<u64> {
    Ok(latest_sequences(conn, session)
        .await?
        .iter()
        .map(|l| l.sequence)
        .sum())
}

/// Blocks until the puppet holds `feed` at `seq`, or `timeout` passes.
/// Returns the message, pretty-printed.
pub async fn history(
    conn: &dyn Connector,
    session: &Session,
    feed: &FeedId,
    seq: u64,
    timeout: Duration,
) -> Result<String> {
    let client = conn.connect(session).await?;
    let opts = StreamOptions {
        id: Some(feed.to_string()),
        seq: Some(seq),
        limit: Some(1),
        live: true,
        ..Default::default()
    };
    let mut stream = client.open_stream("createHistoryStream", opts.to_value());
    match tokio::time::timeout(timeout, stream.next()).await {
        Err(_) => Err(Error::Timeout(timeout)),
        Ok(None) => Err(Error::Transport(
            "createHistoryStream ended without a message".into(),
        )),
        Ok(Some(item)) => Ok(serde_json::to_string_pretty(&item?)?),
    }
}

/// The newest `limit` messages of the puppet's log, newest first,
/// pretty-printed.
pub async fn log_stream(conn: &dyn Connector, session: &Session, limit: usize) -> Result<Vec<String>> {
    let client = conn.connect(session).await?;
    let opts = StreamOptions {
        limit: Some(limit),
        reverse: true,
        ..Default::default()
    };
    let values: Vec<Value> = client
        .open_stream("createLogStream", opts.to_value())
        .try_collect()
        .await?;
    values
        .iter()
        .map(|v| serde_json::to_string_pretty(v).map_err(Error::from))
        .collect()
}
