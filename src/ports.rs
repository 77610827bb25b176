//! src/ports.rs
//!
//! Hands out pairs of adjacent free TCP ports. Each puppet gets `port` for
//! its RPC listener and reserves `port + 1` for a secondary (websocket)
//! listener it is also started with.

use crate::error::{Error, Result};
use socket2::{Domain, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};

pub struct PortAllocator {
    base: u16,
    counter: u16,
    max_attempts: u32,
}

impl PortAllocator {
    pub fn new(base: u16, max_attempts: u32) -> Self {
        Self {
            base,
            counter: 0,
            max_attempts,
        }
    }

    /// Returns the first port of a pair where both ports could be bound.
    /// The counter moves by two on every attempt, used or not, so a port is
    /// never handed out twice in one run.
    pub async fn acquire(&mut self) -> Result<u16> {
        let start = self.base.saturating_add(self.counter);
        for _ in 0..self.max_attempts {
            let Some(port) = self.next_candidate() else {
                break;
            };
            let (first, second) = futures::future::join(probe(port), probe(port + 1)).await;
            match (first, second) {
                (Ok(()), Ok(())) => {
                    tracing::debug!(port, "Acquired port pair");
                    return Ok(port);
                }
                (Err(e), _) | (_, Err(e)) => {
                    tracing::debug!(port, error = %e, "Port pair unavailable, trying the next one");
                }
            }
        }
        let end = start.saturating_add((self.max_attempts as u16).saturating_mul(2));
        Err(Error::PortsExhausted { start, end })
    }

    fn next_candidate(&mut self) -> Option<u16> {
        let port = self.base.checked_add(self.counter)?;
        self.counter = self.counter.checked_add(2)?;
        // Both ports of the pair must be representable.
        port.checked_add(1).map(|_| port)
    }
}

/// Binds and immediately releases `port` on localhost.
async fn probe(port: u16) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.bind(&addr.into())?;
        socket.listen(1)?;
        Ok(())
    })
    .await?
}
