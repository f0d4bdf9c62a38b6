use std::time::Duration;

use anyhow::Context;
use esp_idf_hal::{
    gpio::OutputPin,
    peripheral::Peripheral,
    rmt::{
        config::TransmitConfig, PinState, Pulse, RmtChannel, TxRmtDriver, VariableLengthSignal,
    },
    sys::EspError,
};
use smart_leds::RGB8;

use ledpanel_common::{PanelError, PixelDisplay};

const BITS_PER_PIXEL: usize = 24;

/// WS2812 strip on one RMT channel, GRB order, 800 kHz.
pub struct Ws2812 {
    tx: TxRmtDriver<'static>,
    zero: [Pulse; 2],
    one: [Pulse; 2],
}

impl Ws2812 {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let config = TransmitConfig::new().clock_divider(1);
        let tx = TxRmtDriver::new(channel, pin, &config).context("failed to init RMT LED driver")?;

        let ticks_hz = tx.counter_clock()?;
        let pulse = |level: PinState, nanos: u64| {
            Pulse::new_with_duration(ticks_hz, level, &Duration::from_nanos(nanos))
        };
        let zero = [pulse(PinState::High, 350)?, pulse(PinState::Low, 800)?];
        let one = [pulse(PinState::High, 700)?, pulse(PinState::Low, 600)?];

        Ok(Self { tx, zero, one })
    }

    fn encode(&self, pixels: &[RGB8], brightness: u8) -> Result<VariableLengthSignal, EspError> {
        let mut signal = VariableLengthSignal::with_capacity(pixels.len() * BITS_PER_PIXEL * 2);
        for pixel in smart_leds::brightness(pixels.iter().copied(), brightness) {
            for byte in [pixel.g, pixel.r, pixel.b] {
                for bit in (0..8).rev() {
                    let pulses = if (byte >> bit) & 1 == 1 {
                        &self.one
                    } else {
                        &self.zero
                    };
                    signal.push(pulses)?;
                }
            }
        }
        Ok(signal)
    }
}

impl PixelDisplay for Ws2812 {
    fn show(&mut self, pixels: &[RGB8], brightness: u8) -> ledpanel_common::Result<()> {
        let signal = self
            .encode(pixels, brightness)
            .map_err(|err| PanelError::Display(err.to_string()))?;
        self.tx
            .start_blocking(&signal)
            .map_err(|err| PanelError::Display(err.to_string()))
    }
}
