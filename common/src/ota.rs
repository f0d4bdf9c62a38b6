//! Streaming firmware / filesystem replacement.
//!
//! The procedure is a blocking takeover: it owns the HTTP body and the flash sink until it
//! either finalizes the image or fails. It never reboots; that is left to the caller.

use core::fmt;
use std::io::{ErrorKind, Read};
use std::time::Duration;

use log::{error, info, warn};
use sha2::{Digest, Sha256};

use crate::{
    error::{PanelError, Result},
    io::{Clock, ConfigStore, FlashError, FlashSink, HttpClient},
};

pub const UPDATE_CHUNK_SIZE: usize = 1024;
/// Unknown-length downloads ramp the progress bar once per this many bytes.
pub const UNKNOWN_SIZE_RAMP_BYTES: u64 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTarget {
    Firmware,
    Filesystem,
}

impl fmt::Display for UpdateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Firmware => "firmware",
            Self::Filesystem => "filesystem",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Connecting,
    Streaming,
    Finalizing,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateProgress {
    pub target: UpdateTarget,
    pub phase: UpdatePhase,
    pub written: u64,
    pub expected: Option<u64>,
}

impl UpdateProgress {
    /// Completed fraction in `[0, 1]`. Without a declared size this is a repeating ramp.
    pub fn fraction(&self) -> f32 {
        match self.expected {
            Some(total) if total > 0 => (self.written as f32 / total as f32).clamp(0.0, 1.0),
            _ => (self.written % UNKNOWN_SIZE_RAMP_BYTES) as f32 / UNKNOWN_SIZE_RAMP_BYTES as f32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub chunk_size: usize,
    pub http_timeout: Duration,
    pub stall_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub log_every_bytes: u64,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            chunk_size: UPDATE_CHUNK_SIZE,
            http_timeout: Duration::from_secs(20),
            stall_timeout_ms: 60_000,
            poll_interval_ms: 25,
            log_every_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub target: UpdateTarget,
    pub url: String,
    pub sha256: Option<String>,
}

impl UpdateRequest {
    pub fn new(target: UpdateTarget, url: impl Into<String>) -> Self {
        Self {
            target,
            url: url.into(),
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, sha256: Option<String>) -> Self {
        self.sha256 = sha256;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub target: UpdateTarget,
    pub bytes_written: u64,
    pub declared: Option<u64>,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleReport {
    pub filesystem: Option<UpdateReport>,
    pub firmware: UpdateReport,
}

pub fn validate_url(url: &str) -> Result<()> {
    let url = url.trim();
    if url.is_empty() {
        return Err(PanelError::invalid("missing url"));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(PanelError::invalid("url must start with http:// or https://"));
    }
    Ok(())
}

/// Normalizes an optional digest to lowercase hex; blank counts as absent.
pub fn normalize_sha256(value: Option<&str>) -> Result<Option<String>> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PanelError::invalid("sha256 must be 64 hex characters"));
    }
    Ok(Some(value.to_ascii_lowercase()))
}

/// Collaborators borrowed for the duration of one update operation.
pub struct Updater<'a, H, F, C> {
    pub http: &'a mut H,
    pub flash: &'a mut F,
    pub clock: &'a C,
    pub settings: &'a UpdateSettings,
}

impl<'a, H, F, C> Updater<'a, H, F, C>
where
    H: HttpClient,
    F: FlashSink,
    C: Clock,
{
    pub fn new(
        http: &'a mut H,
        flash: &'a mut F,
        clock: &'a C,
        settings: &'a UpdateSettings,
    ) -> Self {
        Self {
            http,
            flash,
            clock,
            settings,
        }
    }

    /// Downloads `request.url` into the flash sink, reporting progress after every chunk.
    pub fn stream<P>(
        &mut self,
        request: &UpdateRequest,
        mut on_progress: P,
    ) -> Result<UpdateReport>
    where
        P: FnMut(&UpdateProgress),
    {
        let target = request.target;
        let mut progress = UpdateProgress {
            target,
            phase: UpdatePhase::Connecting,
            written: 0,
            expected: None,
        };

        let result = run_update(
            self.http,
            self.flash,
            self.clock,
            request,
            self.settings,
            &mut progress,
            &mut on_progress,
        );

        progress.phase = match &result {
            Ok(report) => {
                info!(
                    "{target} update finalized: {} bytes, sha256 {}",
                    report.bytes_written, report.sha256
                );
                UpdatePhase::Success
            }
            Err(err) => {
                error!("{target} update failed: {err}");
                UpdatePhase::Failed
            }
        };
        on_progress(&progress);
        result
    }

    /// Replaces the filesystem image and writes the previously stored configuration back.
    ///
    /// The stored document is captured before streaming starts. Nothing is restored when the
    /// download fails; a failed restore is reported as `ConfigRestore`.
    pub fn filesystem_preserving_config<S, P>(
        &mut self,
        store: &mut S,
        url: &str,
        sha256: Option<String>,
        on_progress: P,
    ) -> Result<UpdateReport>
    where
        S: ConfigStore,
        P: FnMut(&UpdateProgress),
    {
        let saved = store.load_raw()?;
        match &saved {
            Some(bytes) => info!("preserving {} bytes of configuration", bytes.len()),
            None => warn!("no stored configuration to preserve"),
        }

        let request = UpdateRequest::new(UpdateTarget::Filesystem, url).with_sha256(sha256);
        let report = self.stream(&request, on_progress)?;

        store
            .remount()
            .map_err(|err| PanelError::ConfigRestore(err.to_string()))?;
        if let Some(bytes) = saved {
            store
                .save_raw(&bytes)
                .map_err(|err| PanelError::ConfigRestore(err.to_string()))?;
            info!("configuration restored ({} bytes)", bytes.len());
        }
        Ok(report)
    }

    /// Filesystem first (when given), then firmware. A filesystem failure skips the firmware.
    pub fn bundle<S, P>(
        &mut self,
        store: &mut S,
        firmware: &UpdateRequest,
        filesystem: Option<&UpdateRequest>,
        mut on_progress: P,
    ) -> Result<BundleReport>
    where
        S: ConfigStore,
        P: FnMut(&UpdateProgress),
    {
        validate_url(&firmware.url)?;

        let filesystem = match filesystem.filter(|request| !request.url.trim().is_empty()) {
            Some(request) => Some(self.filesystem_preserving_config(
                store,
                &request.url,
                request.sha256.clone(),
                &mut on_progress,
            )?),
            None => None,
        };

        let firmware = self.stream(firmware, &mut on_progress)?;
        Ok(BundleReport {
            filesystem,
            firmware,
        })
    }
}

fn run_update<H, F, C, P>(
    http: &mut H,
    flash: &mut F,
    clock: &C,
    request: &UpdateRequest,
    settings: &UpdateSettings,
    progress: &mut UpdateProgress,
    on_progress: &mut P,
) -> Result<UpdateReport>
where
    H: HttpClient,
    F: FlashSink,
    C: Clock,
    P: FnMut(&UpdateProgress),
{
    let target = request.target;
    validate_url(&request.url)?;
    let expected_sha256 = normalize_sha256(request.sha256.as_deref())?;

    on_progress(progress);
    info!("{target} update: fetching {}", request.url);
    let response = http.get(request.url.trim(), settings.http_timeout)?;
    if !response.is_success() {
        return Err(PanelError::HttpStatus(response.status));
    }

    let declared = response.content_length.filter(|len| *len > 0);
    progress.expected = declared;
    match declared {
        Some(len) => info!("{target} update: {len} bytes declared"),
        None => warn!("{target} update: size unknown, streaming until close"),
    }

    flash
        .begin(declared, target)
        .map_err(|err| write_failure(target, err))?;

    let outcome = stream_body(
        response.body,
        flash,
        clock,
        target,
        settings,
        progress,
        on_progress,
    )
    .and_then(|digest| {
        if let Some(expected) = expected_sha256 {
            if digest != expected {
                return Err(PanelError::ChecksumMismatch {
                    expected,
                    actual: digest,
                });
            }
        }

        progress.phase = UpdatePhase::Finalizing;
        on_progress(progress);
        flash
            .end()
            .map_err(|err| PanelError::UpdateFinalizeFailure {
                target,
                message: err.0,
            })?;
        Ok(digest)
    });

    match outcome {
        Ok(sha256) => Ok(UpdateReport {
            target,
            bytes_written: progress.written,
            declared,
            sha256,
        }),
        Err(err) => {
            flash.abort();
            Err(err)
        }
    }
}

fn stream_body<B, F, C, P>(
    mut body: B,
    flash: &mut F,
    clock: &C,
    target: UpdateTarget,
    settings: &UpdateSettings,
    progress: &mut UpdateProgress,
    on_progress: &mut P,
) -> Result<String>
where
    B: Read,
    F: FlashSink,
    C: Clock,
    P: FnMut(&UpdateProgress),
{
    let declared = progress.expected;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0_u8; settings.chunk_size.max(1)];
    let mut last_data_ms = clock.now_ms();
    let mut next_log = settings.log_every_bytes.max(1);

    progress.phase = UpdatePhase::Streaming;
    on_progress(progress);

    loop {
        let want = match declared {
            Some(total) if progress.written >= total => break,
            Some(total) => chunk.len().min((total - progress.written) as usize),
            None => chunk.len(),
        };

        match body.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(read) => {
                let accepted = flash
                    .write(&chunk[..read])
                    .map_err(|err| write_failure(target, err))?;
                if accepted != read {
                    return Err(PanelError::UpdateWriteFailure {
                        target,
                        message: format!("short write: {accepted} of {read} bytes"),
                    });
                }

                hasher.update(&chunk[..read]);
                progress.written = progress.written.saturating_add(read as u64);
                last_data_ms = clock.now_ms();
                on_progress(progress);

                if progress.written >= next_log {
                    info!("{target} update: {} bytes written", progress.written);
                    next_log = next_log.saturating_add(settings.log_every_bytes.max(1));
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                let idle_ms = clock.now_ms().saturating_sub(last_data_ms);
                if idle_ms >= settings.stall_timeout_ms {
                    return Err(PanelError::NetworkTimeout(format!(
                        "no data received for {} s",
                        idle_ms / 1000
                    )));
                }
                clock.sleep_ms(settings.poll_interval_ms);
            }
            Err(err) if declared.is_some() => {
                warn!("{target} update: stream closed early: {err}");
                break;
            }
            Err(err) => {
                return Err(PanelError::NetworkUnavailable(format!(
                    "{target} download interrupted: {err}"
                )));
            }
        }
    }

    if let Some(expected) = declared {
        if progress.written < expected {
            return Err(PanelError::UpdateIncomplete {
                target,
                written: progress.written,
                expected,
            });
        }
    }
    if progress.written == 0 {
        return Err(PanelError::UpdateWriteFailure {
            target,
            message: "download body is empty".to_string(),
        });
    }

    Ok(hex_digest(hasher.finalize().as_slice()))
}

fn write_failure(target: UpdateTarget, err: FlashError) -> PanelError {
    PanelError::UpdateWriteFailure {
        target,
        message: err.0,
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    use core::fmt::Write as _;

    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}
