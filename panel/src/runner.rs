//! The panel loop thread. HTTP adapters never touch panel state: they post an [`Envelope`]
//! and the loop answers through its reply callback.

use std::{
    sync::mpsc::{Receiver, Sender},
    thread,
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, FixedOffset};
use log::{error, info, warn};

use ledpanel_common::{
    io::SystemClock, Clock, ConfigStore, DeviceConfig, Devices, FlashSink, HttpClient,
    NetworkInfo, Panel, PixelDisplay, Request, Response, TICK_INTERVAL_MS,
};

const PANEL_LOOP_STACK: usize = 16 * 1024;
const RESTART_DELAY_MS: u64 = 500;

pub type Reply = Box<dyn FnOnce(Response) + Send>;

pub struct Envelope {
    pub request: Request,
    pub reply: Reply,
}

pub type CommandSender = Sender<Envelope>;

/// What differs between the host build and the device build.
pub trait Platform {
    /// Local wall-clock time, `None` until the clock has been set.
    fn local_time(&self, config: &DeviceConfig) -> Option<DateTime<FixedOffset>>;

    fn network(&self) -> NetworkInfo;

    fn restart(&self) -> !;
}

pub struct PanelLoop<H, F, S, D> {
    pub panel: Panel,
    pub http: H,
    pub flash: F,
    pub store: S,
    pub display: D,
    pub commands: Receiver<Envelope>,
}

impl<H, F, S, D> PanelLoop<H, F, S, D>
where
    H: HttpClient,
    F: FlashSink,
    S: ConfigStore,
    D: PixelDisplay,
{
    pub fn run<P: Platform>(mut self, platform: &P) -> ! {
        let clock = SystemClock;
        info!("panel loop running");

        loop {
            let local_time = platform.local_time(self.panel.config());

            while let Ok(envelope) = self.commands.try_recv() {
                self.serve(envelope, &clock, local_time, platform);
            }

            if let Err(err) = self.panel.tick(
                &mut self.http,
                &mut self.store,
                &mut self.display,
                local_time,
                clock.now_ms(),
            ) {
                warn!("frame not shown: {err}");
            }

            clock.sleep_ms(TICK_INTERVAL_MS);
        }
    }

    fn serve<P: Platform>(
        &mut self,
        envelope: Envelope,
        clock: &SystemClock,
        local_time: Option<DateTime<FixedOffset>>,
        platform: &P,
    ) {
        let network = platform.network();
        let devices = Devices {
            http: &mut self.http,
            flash: &mut self.flash,
            clock,
            store: &mut self.store,
            display: &mut self.display,
        };
        let response = self
            .panel
            .handle(envelope.request, devices, local_time, &network);

        let reboot = response.is_reboot();
        (envelope.reply)(response);

        if reboot {
            // Pending config changes are already on disk: updates flush before streaming.
            info!("update applied, restarting in {RESTART_DELAY_MS} ms");
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            platform.restart();
        }
    }
}

/// Starts the loop on its own thread. Devices are built on that thread since some of them
/// hold driver handles that cannot cross threads.
pub fn spawn<P, B, H, F, S, D>(platform: P, build: B) -> anyhow::Result<thread::JoinHandle<()>>
where
    P: Platform + Send + 'static,
    B: FnOnce() -> anyhow::Result<PanelLoop<H, F, S, D>> + Send + 'static,
    H: HttpClient,
    F: FlashSink,
    S: ConfigStore,
    D: PixelDisplay,
{
    thread::Builder::new()
        .name("panel-loop".into())
        .stack_size(PANEL_LOOP_STACK)
        .spawn(move || match build() {
            Ok(panel_loop) => panel_loop.run(&platform),
            Err(err) => error!("panel loop failed to start: {err:#}"),
        })
        .context("failed to spawn panel loop")
}
