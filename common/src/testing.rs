//! In-memory fakes for the collaborator traits.

use std::{
    cell::Cell,
    collections::{HashMap, VecDeque},
    io::{self, Read},
    time::Duration,
};

use smart_leds::RGB8;

use crate::{
    error::{PanelError, Result},
    io::{Clock, ConfigStore, FlashError, FlashSink, HttpClient, HttpResponse, PixelDisplay},
    ota::UpdateTarget,
};

#[derive(Debug, Clone)]
pub enum Step {
    Data(Vec<u8>),
    Pending,
    Fail,
}

#[derive(Debug, Default)]
pub struct ScriptedBody {
    steps: VecDeque<Step>,
}

impl ScriptedBody {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }
}

impl Read for ScriptedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.steps.pop_front() {
            None => Ok(0),
            Some(Step::Pending) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Some(Step::Fail) => Err(io::Error::from(io::ErrorKind::ConnectionReset)),
            Some(Step::Data(mut data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                if len < data.len() {
                    self.steps.push_front(Step::Data(data.split_off(len)));
                }
                Ok(len)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub content_length: Option<u64>,
    pub steps: Vec<Step>,
}

impl Route {
    pub fn ok(body: &[u8]) -> Self {
        Self {
            status: 200,
            content_length: Some(body.len() as u64),
            steps: vec![Step::Data(body.to_vec())],
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_length: None,
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeHttp {
    pub routes: HashMap<String, Route>,
    pub requests: Vec<String>,
}

impl FakeHttp {
    pub fn with_route(mut self, url: &str, route: Route) -> Self {
        self.routes.insert(url.to_string(), route);
        self
    }
}

impl HttpClient for FakeHttp {
    type Body = ScriptedBody;

    fn get(&mut self, url: &str, _timeout: Duration) -> Result<HttpResponse<Self::Body>> {
        self.requests.push(url.to_string());
        let route = self
            .routes
            .get(url)
            .cloned()
            .ok_or_else(|| PanelError::NetworkUnavailable(format!("no route to {url}")))?;
        Ok(HttpResponse {
            status: route.status,
            content_length: route.content_length,
            body: ScriptedBody::new(route.steps),
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeClock {
    now: Cell<u64>,
}

impl FakeClock {
    pub fn at(now_ms: u64) -> Self {
        Self {
            now: Cell::new(now_ms),
        }
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

#[derive(Debug, Default)]
pub struct FakeFlash {
    pub begun: Vec<(Option<u64>, UpdateTarget)>,
    pub data: Vec<u8>,
    pub finalized: usize,
    pub aborted: usize,
    pub end_error: Option<String>,
    pub accept_limit: Option<usize>,
}

impl FlashSink for FakeFlash {
    fn begin(
        &mut self,
        expected_size: Option<u64>,
        target: UpdateTarget,
    ) -> Result<(), FlashError> {
        self.begun.push((expected_size, target));
        self.data.clear();
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        let accepted = self.accept_limit.map_or(data.len(), |limit| limit.min(data.len()));
        self.data.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn end(&mut self) -> Result<(), FlashError> {
        if let Some(message) = &self.end_error {
            return Err(FlashError::new(message.clone()));
        }
        self.finalized += 1;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted += 1;
    }
}

/// Remounting simulates a freshly written filesystem image: the stored document is gone.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub raw: Option<Vec<u8>>,
    pub saves: usize,
    pub remounts: usize,
    pub fail_saves: bool,
}

impl MemoryStore {
    pub fn with(raw: &[u8]) -> Self {
        Self {
            raw: Some(raw.to_vec()),
            ..Self::default()
        }
    }
}

impl ConfigStore for MemoryStore {
    fn load_raw(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.raw.clone())
    }

    fn save_raw(&mut self, payload: &[u8]) -> Result<()> {
        if self.fail_saves {
            return Err(PanelError::Storage("read-only filesystem".to_string()));
        }
        self.saves += 1;
        self.raw = Some(payload.to_vec());
        Ok(())
    }

    fn remount(&mut self) -> Result<()> {
        self.remounts += 1;
        self.raw = None;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingDisplay {
    pub frames: Vec<(Vec<RGB8>, u8)>,
}

impl RecordingDisplay {
    pub fn last(&self) -> &[RGB8] {
        self.frames.last().map(|(pixels, _)| pixels.as_slice()).unwrap_or(&[])
    }
}

impl PixelDisplay for RecordingDisplay {
    fn show(&mut self, pixels: &[RGB8], brightness: u8) -> Result<()> {
        self.frames.push((pixels.to_vec(), brightness));
        Ok(())
    }
}
