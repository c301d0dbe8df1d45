//! Captcha token buffering.
//!
//! Tokens are single-use and take seconds to mint, so a background task keeps
//! a buffer topped up and the submission hot path only pops from it. A token
//! leaves the buffer the moment it is handed out and is never reused.

use crate::error::CaptchaError;

use async_trait::async_trait;
use futures::future;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// A one-shot token for the `g-recaptcha-response` form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaToken {
    pub value: String,
    pub minted_at: Instant,
}

impl CaptchaToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            minted_at: Instant::now(),
        }
    }
}

/// Produces fresh tokens. Minting internals live outside this crate.
#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint(&self) -> Result<CaptchaToken, CaptchaError>;
}

/// Mints by asking an external token service; each GET returns one token as text.
pub struct HttpTokenMinter {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenMinter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CaptchaError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl TokenMinter for HttpTokenMinter {
    async fn mint(&self) -> Result<CaptchaToken, CaptchaError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(CaptchaError::Status(response.status()));
        }
        let value = response.text().await?.trim().to_string();
        if value.is_empty() {
            return Err(CaptchaError::Empty);
        }
        Ok(CaptchaToken::new(value))
    }
}

/// Buffer of pre-minted tokens.
pub struct CaptchaTokenSupplier {
    minter: Arc<dyn TokenMinter>,
    buffer: Mutex<VecDeque<CaptchaToken>>,
    target: usize,
    concurrency: usize,
    max_age: Duration,
}

impl CaptchaTokenSupplier {
    /// `target` is the buffer size the refill loop aims for, `concurrency`
    /// the number of mints it runs at once.
    pub fn new(minter: Arc<dyn TokenMinter>, target: usize, concurrency: usize, max_age: Duration) -> Self {
        Self {
            minter,
            buffer: Mutex::new(VecDeque::with_capacity(target)),
            target,
            concurrency: concurrency.max(1),
            max_age,
        }
    }

    /// Pop a fresh token without waiting. Stale tokens are discarded on the way.
    pub fn take(&self) -> Option<CaptchaToken> {
        let mut buffer = self.buffer.lock();
        while let Some(token) = buffer.pop_front() {
            if token.minted_at.elapsed() < self.max_age {
                return Some(token);
            }
        }
        None
    }

    /// Pop a buffered token, or mint one on the spot when the buffer is dry.
    pub async fn take_or_mint(&self) -> Result<CaptchaToken, CaptchaError> {
        if let Some(token) = self.take() {
            return Ok(token);
        }
        debug!("Captcha buffer empty, minting synchronously");
        self.minter.mint().await
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Mint until the buffer reaches its target size. Returns the number of
    /// tokens added.
    pub async fn refill(&self) -> usize {
        let missing = self.target.saturating_sub(self.buffered());
        if missing == 0 {
            return 0;
        }

        let mut added = 0;
        let mut remaining = missing;
        while remaining > 0 {
            let batch = remaining.min(self.concurrency);
            let results = future::join_all((0..batch).map(|_| self.minter.mint())).await;
            remaining -= batch;

            let mut failed = 0;
            for result in results {
                match result {
                    Ok(token) => {
                        let mut buffer = self.buffer.lock();
                        if buffer.len() < self.target && !buffer.iter().any(|t| t.value == token.value) {
                            buffer.push_back(token);
                            added += 1;
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        debug!("Captcha mint failed: {}", e);
                    }
                }
            }
            if failed == batch {
                warn!("Every captcha mint in the last batch failed");
                break;
            }
        }
        added
    }

    /// Keep the buffer topped up in the background.
    pub fn spawn_refill(self: &Arc<Self>, idle: Duration) -> JoinHandle<()> {
        let supplier = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                supplier.refill().await;
                tokio::time::sleep(idle).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMinter {
        minted: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TokenMinter for CountingMinter {
        async fn mint(&self) -> Result<CaptchaToken, CaptchaError> {
            if self.fail {
                return Err(CaptchaError::Empty);
            }
            let n = self.minted.fetch_add(1, Ordering::SeqCst);
            Ok(CaptchaToken::new(format!("token-{}", n)))
        }
    }

    fn supplier(fail: bool, max_age: Duration) -> (Arc<CountingMinter>, CaptchaTokenSupplier) {
        let minter = Arc::new(CountingMinter {
            minted: AtomicUsize::new(0),
            fail,
        });
        let supplier = CaptchaTokenSupplier::new(minter.clone(), 5, 2, max_age);
        (minter, supplier)
    }

    #[tokio::test]
    async fn refill_reaches_target_and_take_consumes() {
        let (_, supplier) = supplier(false, Duration::from_secs(60));
        assert_eq!(supplier.refill().await, 5);
        assert_eq!(supplier.buffered(), 5);
        assert_eq!(supplier.refill().await, 0);

        let first = supplier.take().unwrap();
        let second = supplier.take().unwrap();
        assert_ne!(first, second);
        assert_eq!(supplier.buffered(), 3);
    }

    #[tokio::test]
    async fn empty_buffer_falls_back_to_minting() {
        let (minter, supplier) = supplier(false, Duration::from_secs(60));
        assert!(supplier.take().is_none());

        let token = tokio_test::assert_ok!(supplier.take_or_mint().await);
        assert_eq!(token.value, "token-0");
        assert_eq!(minter.minted.load(Ordering::SeqCst), 1);
        assert_eq!(supplier.buffered(), 0);
    }

    #[tokio::test]
    async fn stale_tokens_are_discarded() {
        let (_, supplier) = supplier(false, Duration::from_millis(20));
        supplier.refill().await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(supplier.take().is_none());
        assert_eq!(supplier.buffered(), 0);
    }

    #[tokio::test]
    async fn failing_minter_stops_refill() {
        let (_, supplier) = supplier(true, Duration::from_secs(60));
        assert_eq!(supplier.refill().await, 0);
        tokio_test::assert_err!(supplier.take_or_mint().await);
    }
}
