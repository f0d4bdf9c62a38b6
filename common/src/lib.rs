pub mod api;
pub mod calendar;
pub mod color;
pub mod config;
pub mod error;
pub mod events;
pub mod hours;
pub mod io;
pub mod ota;
pub mod panel;
pub mod render;
pub mod types;
pub mod zone;

#[cfg(test)]
mod testing;

pub use api::{Request, Response, UpdateJob};
pub use calendar::{CalendarCache, CalendarSource};
pub use config::{load_config, DeviceConfig, FIRMWARE_VERSION};
pub use error::{PanelError, Result};
pub use events::{AppointmentList, ManualAppointment, NextEvent, Notification};
pub use hours::{DayOfWeek, DayWindow, OpenHours};
pub use io::{Clock, ConfigStore, FlashError, FlashSink, HttpClient, HttpResponse, PixelDisplay};
pub use ota::{UpdateProgress, UpdateReport, UpdateTarget};
pub use panel::{Devices, NetworkInfo, Panel, TICK_INTERVAL_MS};
pub use render::RenderState;
pub use types::{DisplayMode, EffectKind, PanelStatus};
pub use zone::Zone;
