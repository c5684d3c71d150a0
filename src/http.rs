use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::blocking::{Client, Response};

use crate::config::Settings;
use crate::error::{DossierError, Result};

/// Set once from the ctrlc handler; checked by the polite delay so a
/// shutdown never waits out a sleep.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn install() -> Self {
        let flag = Self::default();
        let inner = flag.0.clone();
        let _ = ctrlc::set_handler(move || {
            inner.store(true, Ordering::SeqCst);
        });
        flag
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Fetcher {
    client: Client,
    sleep: Duration,
    shutdown: ShutdownFlag,
}

impl Fetcher {
    pub fn new(settings: &Settings, shutdown: ShutdownFlag) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .user_agent(settings.http_user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            sleep: Duration::from_millis(settings.registry_sleep_ms),
            shutdown: shutdown.clone(),
        })
    }

    pub fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response> {
        let resp = self.client.get(url).query(query).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DossierError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp)
    }

    pub fn get_text(&self, url: &str) -> Result<String> {
        Ok(self.get(url, &[])?.text()?)
    }

    pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        Ok(self.get(url, &[])?.bytes()?.to_vec())
    }

    /// Lightweight existence check via a partial-content request; used by
    /// URL-pattern discovery so probing never downloads full artifacts.
    pub fn probe(&self, url: &str) -> bool {
        self.client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .map(|resp| {
                let status = resp.status();
                status.is_success() || status == reqwest::StatusCode::PARTIAL_CONTENT
            })
            .unwrap_or(false)
    }

    /// The one intentional suspension point: a fixed polite delay between
    /// paginated registry requests, sliced so shutdown interrupts it.
    pub fn polite_sleep(&self) -> Result<()> {
        let slice = Duration::from_millis(25);
        let mut remaining = self.sleep;
        while !remaining.is_zero() {
            if self.shutdown.is_set() {
                return Err(DossierError::Interrupted);
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
        if self.shutdown.is_set() {
            return Err(DossierError::Interrupted);
        }
        Ok(())
    }
}
