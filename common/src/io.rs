//! Interfaces to the collaborators the panel core drives: HTTP client, pixel display,
//! flash update sink, persisted config store and the monotonic clock.

use core::convert::TryInto;
use std::{
    io::Read,
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use smart_leds::RGB8;
use thiserror::Error;

use crate::{error::Result, ota::UpdateTarget};

#[derive(Debug)]
pub struct HttpResponse<B> {
    pub status: u16,
    /// Declared body length; `None` when the server did not send one.
    pub content_length: Option<u64>,
    pub body: B,
}

impl<B> HttpResponse<B> {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking HTTP GET with redirect following.
///
/// Body reads follow `std::io::Read`: `Ok(0)` means the stream has ended, while
/// `WouldBlock`, `TimedOut` and `Interrupted` errors mean no bytes are available yet.
pub trait HttpClient {
    type Body: Read;

    fn get(&mut self, url: &str, timeout: Duration) -> Result<HttpResponse<Self::Body>>;
}

pub trait PixelDisplay {
    fn show(&mut self, pixels: &[RGB8], brightness: u8) -> Result<()>;
}

/// Error text reported by the flash subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FlashError(pub String);

impl FlashError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub trait FlashSink {
    fn begin(&mut self, expected_size: Option<u64>, target: UpdateTarget)
        -> Result<(), FlashError>;

    /// Returns the number of bytes accepted; anything short of `data.len()` is a failure.
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError>;

    fn end(&mut self) -> Result<(), FlashError>;

    /// Drops a started update without activating it.
    fn abort(&mut self) {}
}

/// Raw access to the persisted configuration document.
pub trait ConfigStore {
    /// `Ok(None)` when nothing has been stored yet.
    fn load_raw(&mut self) -> Result<Option<Vec<u8>>>;

    fn save_raw(&mut self, payload: &[u8]) -> Result<()>;

    /// Re-attach the backing filesystem after its partition has been rewritten.
    fn remount(&mut self) -> Result<()>;
}

pub trait Clock {
    fn now_ms(&self) -> u64;

    fn sleep_ms(&self, ms: u64);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
