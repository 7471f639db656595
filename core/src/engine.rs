// Request engine — one logical request, bounded retry
//
// Drives a full request/response exchange through the transport: acquire a
// link, send every continuation block (reverse index order, one acknowledged
// write at a time), send the primary block, and hand back its response.
// A failed attempt disconnects and retries until the budget is exhausted.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::transport::codec::{self, OpCode, Response};
use crate::transport::{HsmCentral, HsmLink};
use crate::ProxyError;

pub struct RequestEngine {
    central: Arc<dyn HsmCentral>,
    max_attempts: u32,
}

impl RequestEngine {
    pub fn new(central: Arc<dyn HsmCentral>, max_attempts: u32) -> Self {
        Self {
            central,
            max_attempts,
        }
    }

    /// Execute one request against the security module and return the raw
    /// response payload.
    pub async fn execute(&self, op: OpCode, args: &[&[u8]]) -> Result<Vec<u8>, ProxyError> {
        let body = codec::encode_request(op, args)?;
        let blocks = codec::split_blocks(&body);
        debug!(
            op = op.name(),
            bytes = body.len(),
            blocks = blocks.len(),
            "sending request"
        );

        let mut last_failure = None;
        for attempt in 1..=self.max_attempts {
            match self.attempt(&blocks).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(
                        op = op.name(),
                        attempt,
                        budget = self.max_attempts,
                        "attempt failed: {err}"
                    );
                    last_failure = Some(err);
                }
            }
        }

        Err(ProxyError::RequestFailed {
            attempts: self.max_attempts,
            cause: Box::new(last_failure.unwrap_or(ProxyError::Transport(
                "no attempt was made".to_string(),
            ))),
        })
    }

    /// One attempt: acquire, send all blocks, release. The link is closed on
    /// every path before the result is reported.
    async fn attempt(&self, blocks: &[Vec<u8>]) -> Result<Vec<u8>, ProxyError> {
        let mut link = self.central.acquire().await?;
        let outcome = Self::send_blocks(link.as_mut(), blocks).await;
        let closed = link.close().await;
        let response = outcome?;
        // The device has already processed the request; a disconnect failure
        // must not force a retry of a now-stale exchange.
        if let Err(err) = closed {
            warn!("disconnect failed after a completed exchange: {err}");
        }
        Ok(response)
    }

    async fn send_blocks(
        link: &mut dyn HsmLink,
        blocks: &[Vec<u8>],
    ) -> Result<Vec<u8>, ProxyError> {
        let Some((primary, extras)) = blocks.split_last() else {
            return Err(ProxyError::Transport("request produced no blocks".to_string()));
        };

        for block in extras {
            let reply = link.write_block(block).await?;
            if let Response::Rejected(code) = codec::classify_response(&reply) {
                return Err(ProxyError::BlockRejected(code));
            }
        }

        let reply = link.write_block(primary).await?;
        if let Response::Rejected(code) = codec::classify_response(&reply) {
            return Err(ProxyError::BlockRejected(code));
        }
        Ok(reply)
    }
}
