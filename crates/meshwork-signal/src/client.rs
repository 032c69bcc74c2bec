//! Relay client
//!
//! `push` is fire-and-forget: delivery failure is reported to the caller but
//! never retried here — a lost handshake message is recovered by retrying the
//! whole negotiation attempt, not the message. `pull` is the opposite: it
//! retries against the relay indefinitely with bounded backoff until its
//! token is cancelled.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use meshwork_tasks::{Backoff, ShutdownToken};

use crate::error::{SignalError, SignalResult};
use crate::message::{Channel, SignalMessage};

/// Messages older than this are replayed state from before a relay restart
/// and must not drive a new negotiation.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(30);

/// Ceiling for the pull retry delay.
pub const PULL_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Per-request HTTP timeout; comfortably above the relay's 5s pull window.
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Client for the push/pull signaling relay.
#[derive(Debug, Clone)]
pub struct SignalClient {
    base: String,
    http: reqwest::Client,
    freshness: Duration,
}

impl SignalClient {
    /// Create a client for the relay at `base_url` (scheme and authority,
    /// no trailing slash required).
    pub fn new(base_url: impl Into<String>) -> SignalResult<Self> {
        let base = base_url.into().trim_end_matches('/').to_string();
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(SignalError::InvalidUrl(base));
        }
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            base,
            http,
            freshness: DEFAULT_FRESHNESS,
        })
    }

    /// Override the freshness window used by `pull`.
    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Relay base URL.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Send one message on a channel, stamping the current time if the
    /// sender did not provide one.
    pub async fn push(&self, channel: &Channel, mut message: SignalMessage) -> SignalResult<()> {
        message.stamp();
        let url = format!("{}/push/{}", self.base, channel.id());
        trace!(channel = %channel, "pushing signal message");

        let response = self.http.post(&url).json(&message).send().await?;
        if response.status() != StatusCode::OK {
            return Err(SignalError::RelayStatus(response.status().as_u16()));
        }
        Ok(())
    }

    /// Start pulling a channel.
    ///
    /// Returns a receiver that yields at most one message per relay
    /// round-trip. The background task retries transport failures with
    /// backoff capped at [`PULL_BACKOFF_CAP`], drops stale messages, and
    /// exits (closing the receiver) once `token` is cancelled or the
    /// receiver is dropped.
    pub fn pull(&self, token: ShutdownToken, channel: &Channel) -> mpsc::Receiver<SignalMessage> {
        let (tx, rx) = mpsc::channel(1);
        let url = format!("{}/pull/{}", self.base, channel.id());
        let http = self.http.clone();
        let channel = channel.clone();
        let freshness = chrono::Duration::from_std(self.freshness)
            .unwrap_or(chrono::Duration::MAX);

        tokio::spawn(async move {
            let mut backoff = Backoff::new(PULL_BACKOFF_CAP);
            loop {
                let response = tokio::select! {
                    _ = token.cancelled() => break,
                    r = http.get(&url).send() => r,
                };

                let response = match response {
                    Ok(r) => r,
                    Err(e) => {
                        if token.is_cancelled() {
                            break;
                        }
                        warn!(channel = %channel, error = %e, "pull transport failure");
                        if wait_backoff(&token, &mut backoff).await {
                            break;
                        }
                        continue;
                    }
                };

                match response.status() {
                    StatusCode::OK => {}
                    // Relay long-poll expired with nothing pending: go again.
                    StatusCode::REQUEST_TIMEOUT => {
                        backoff.reset();
                        continue;
                    }
                    status => {
                        warn!(channel = %channel, %status, "pull rejected by relay");
                        if wait_backoff(&token, &mut backoff).await {
                            break;
                        }
                        continue;
                    }
                }

                let message = match response.json::<SignalMessage>().await {
                    Ok(m) => m,
                    Err(e) => {
                        if token.is_cancelled() {
                            break;
                        }
                        warn!(channel = %channel, error = %e, "pull decode failure");
                        if wait_backoff(&token, &mut backoff).await {
                            break;
                        }
                        continue;
                    }
                };
                backoff.reset();

                if message.age() > freshness {
                    debug!(channel = %channel, "skipping stale signal message");
                    continue;
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            // Receiver gone; nothing left to pull for.
                            break;
                        }
                    }
                }
            }
            trace!(channel = %channel, "pull loop ended");
        });

        rx
    }
}

/// Sleep out one backoff interval; returns true if cancelled while waiting.
async fn wait_backoff(token: &ShutdownToken, backoff: &mut Backoff) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(backoff.next_delay()) => false,
    }
}
