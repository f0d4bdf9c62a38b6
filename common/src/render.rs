use chrono::{DateTime, FixedOffset, Timelike};
use smart_leds::RGB8;

use crate::{
    color::{fade_to_black, hue, parse_hex_or_white, scale_video, BLACK, WHITE},
    config::{DeviceConfig, MAX_EFFECT_SPEED, MIN_EFFECT_SPEED},
    error::Result,
    events::Notification,
    io::PixelDisplay,
    ota::{UpdateProgress, UpdateTarget},
    types::{DisplayMode, EffectKind},
};

pub const ALERT_BLINK_HALF_PERIOD_MS: u64 = 400;

const ORANGE: RGB8 = RGB8 {
    r: 255,
    g: 165,
    b: 0,
};
const BLUE: RGB8 = RGB8 { r: 0, g: 0, b: 255 };

const SEASONAL_PALETTE: [RGB8; 4] = [
    RGB8 { r: 255, g: 0, b: 0 },
    RGB8 { r: 0, g: 128, b: 0 },
    RGB8 {
        r: 255,
        g: 215,
        b: 0,
    },
    BLUE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Clock,
    Status,
    AlertBlink,
    Effect(EffectKind),
}

/// Everything a single frame depends on.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub config: &'a DeviceConfig,
    /// `None` while the wall clock has not been set.
    pub local_time: Option<DateTime<FixedOffset>>,
    pub notification: &'a Notification,
    pub open: bool,
    pub now_ms: u64,
}

pub fn select_state(
    config: &DeviceConfig,
    notification: &Notification,
    synced: bool,
) -> RenderState {
    if !synced {
        return RenderState::Effect(config.effect);
    }
    if notification.active {
        return RenderState::AlertBlink;
    }
    match config.mode {
        DisplayMode::Effect => RenderState::Effect(config.effect),
        DisplayMode::Status => RenderState::Status,
        DisplayMode::Clock => RenderState::Clock,
    }
}

/// Arduino-style integer range mapping (truncating toward zero).
fn map_range(value: i32, in_min: i32, in_max: i32, out_min: i32, out_max: i32) -> i32 {
    (value - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

fn speed_map(speed: u8, out_min: i32, out_max: i32) -> i32 {
    let speed = speed.clamp(MIN_EFFECT_SPEED, MAX_EFFECT_SPEED) as i32;
    map_range(
        speed,
        MIN_EFFECT_SPEED as i32,
        MAX_EFFECT_SPEED as i32,
        out_min,
        out_max,
    )
}

/// Sine beat between `low` and `high` at `bpm` beats per minute.
fn beat_sine(now_ms: u64, bpm: i32, low: u8, high: u8) -> u8 {
    let phase = (now_ms as f64 * bpm as f64 / 60_000.0).fract();
    let unit = ((phase * core::f64::consts::TAU).sin() + 1.0) / 2.0;
    let span = (high - low) as f64;
    (low as f64 + (unit * span).round()) as u8
}

/// Lights the strip like a 12-hour dial: one pixel per `12 / n` hours, last one partial.
pub fn clock_face(pixels: &mut [RGB8], hour: u32, minute: u32, color: RGB8) {
    let n = pixels.len();
    let hours12 = (hour % 12) as f64 + minute as f64 / 60.0;
    let pos = hours12 / 12.0 * n as f64;
    let full = pos.floor() as usize;
    let frac = pos - pos.floor();

    for (index, pixel) in pixels.iter_mut().enumerate() {
        *pixel = if index < full {
            color
        } else if index == full && frac > 0.0 {
            scale_video(color, (frac * 255.0).round() as u8)
        } else {
            BLACK
        };
    }
}

/// Blue bar on the first half for filesystem images, orange on the second for firmware.
pub fn progress_bar(pixels: &mut [RGB8], progress: &UpdateProgress) {
    let n = pixels.len();
    let half = n / 2;
    let (start, mut len, color) = match progress.target {
        UpdateTarget::Filesystem => (0, half, BLUE),
        UpdateTarget::Firmware => (half, n - half, ORANGE),
    };
    if len == 0 {
        len = n;
    }

    let pct = progress.fraction();
    let lit = (pct * len as f32).round() as usize;

    pixels.fill(BLACK);
    for offset in 0..len {
        let Some(pixel) = pixels.get_mut(start + offset) else {
            break;
        };
        if offset < lit {
            *pixel = color;
        } else if offset == lit && pct < 1.0 {
            *pixel = scale_video(color, 80);
        }
    }
}

/// Small xorshift generator for the sparkle effects.
#[derive(Debug, Clone)]
struct Rng(u32);

impl Rng {
    const fn new(seed: u32) -> Self {
        Self(if seed == 0 { 0x2545_f491 } else { seed })
    }

    fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }

    fn byte(&mut self) -> u8 {
        (self.next() >> 24) as u8
    }

    fn below(&mut self, max: u32) -> u32 {
        self.next() % max
    }
}

/// Owns the pixel buffer and the animation state carried between frames.
#[derive(Debug, Clone)]
pub struct Renderer {
    pixels: Vec<RGB8>,
    hue: u8,
    chase: usize,
    last_theater_step_ms: u64,
    last_seasonal_step_ms: u64,
    rng: Rng,
}

impl Renderer {
    pub fn new(led_count: u16, seed: u32) -> Self {
        Self {
            pixels: vec![BLACK; led_count as usize],
            hue: 0,
            chase: 0,
            last_theater_step_ms: 0,
            last_seasonal_step_ms: 0,
            rng: Rng::new(seed),
        }
    }

    pub fn pixels(&self) -> &[RGB8] {
        &self.pixels
    }

    pub fn resize(&mut self, led_count: u16) {
        self.pixels.resize(led_count as usize, BLACK);
    }

    pub fn render(&mut self, frame: &Frame<'_>) -> RenderState {
        let config = frame.config;
        self.resize(config.led_count);

        let state = select_state(config, frame.notification, frame.local_time.is_some());
        match (state, frame.local_time) {
            (RenderState::AlertBlink, Some(now)) => {
                let base = frame
                    .notification
                    .next
                    .as_ref()
                    .map_or(WHITE, |event| event.alert_color());
                let color = if (frame.now_ms / ALERT_BLINK_HALF_PERIOD_MS) % 2 == 0 {
                    WHITE
                } else {
                    base
                };
                clock_face(&mut self.pixels, now.hour(), now.minute(), color);
            }
            (RenderState::Clock | RenderState::Status, Some(now)) => {
                let hex = if !config.enable_open_hours {
                    &config.clock_color
                } else if frame.open {
                    &config.open_color
                } else {
                    &config.closed_color
                };
                let base = parse_hex_or_white(hex);
                clock_face(&mut self.pixels, now.hour(), now.minute(), base);
            }
            (RenderState::Effect(kind), _) => self.effect(kind, config, frame.now_ms),
            (_, None) => self.effect(config.effect, config, frame.now_ms),
        }
        state
    }

    pub fn render_progress(&mut self, led_count: u16, progress: &UpdateProgress) {
        self.resize(led_count);
        progress_bar(&mut self.pixels, progress);
    }

    pub fn show<D: PixelDisplay>(&self, display: &mut D, brightness: u8) -> Result<()> {
        display.show(&self.pixels, brightness)
    }

    fn effect(&mut self, kind: EffectKind, config: &DeviceConfig, now_ms: u64) {
        let speed = config.effect_speed.clamp(MIN_EFFECT_SPEED, MAX_EFFECT_SPEED);
        let color = parse_hex_or_white(&config.effect_color);

        match kind {
            EffectKind::Rainbow => {
                for (index, pixel) in self.pixels.iter_mut().enumerate() {
                    *pixel = hue(self.hue.wrapping_add((index as u8).wrapping_mul(3)));
                }
                self.hue = self.hue.wrapping_add(speed);
            }
            EffectKind::Solid => self.pixels.fill(color),
            EffectKind::Breathe => {
                let level = beat_sine(now_ms, speed_map(speed, 6, 30), 10, 255);
                self.pixels.fill(scale_video(color, level));
            }
            EffectKind::Theater => {
                let step_ms = speed_map(speed, 250, 40) as u64;
                if now_ms.saturating_sub(self.last_theater_step_ms) >= step_ms {
                    self.last_theater_step_ms = now_ms;
                    self.chase = (self.chase + 1) % 3;
                }
                for (index, pixel) in self.pixels.iter_mut().enumerate() {
                    *pixel = if index % 3 == self.chase { color } else { BLACK };
                }
            }
            EffectKind::Twinkle => {
                for pixel in self.pixels.iter_mut() {
                    *pixel = fade_to_black(*pixel, 20);
                    if self.rng.byte() < speed {
                        *pixel = color;
                    }
                }
            }
            EffectKind::Seasonal => {
                let step_ms = speed_map(speed, 320, 80) as u64;
                if now_ms.saturating_sub(self.last_seasonal_step_ms) < step_ms {
                    return;
                }
                self.last_seasonal_step_ms = now_ms;
                let chance = speed_map(speed, 20, 120) as u8;
                for pixel in self.pixels.iter_mut() {
                    *pixel = fade_to_black(*pixel, 40);
                    if self.rng.byte() < chance {
                        *pixel = SEASONAL_PALETTE[self.rng.below(4) as usize];
                    }
                }
            }
        }
    }
}
