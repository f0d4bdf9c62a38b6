use smart_leds::{
    hsv::{hsv2rgb, Hsv},
    RGB8,
};

pub const BLACK: RGB8 = RGB8 { r: 0, g: 0, b: 0 };
pub const WHITE: RGB8 = RGB8 {
    r: 255,
    g: 255,
    b: 255,
};

/// Parses a 6-digit `rrggbb` string (no leading `#`).
pub fn parse_hex(hex: &str) -> Option<RGB8> {
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let value = u32::from_str_radix(hex, 16).ok()?;
    Some(RGB8::new(
        ((value >> 16) & 0xff) as u8,
        ((value >> 8) & 0xff) as u8,
        (value & 0xff) as u8,
    ))
}

pub fn is_hex_color(hex: &str) -> bool {
    parse_hex(hex).is_some()
}

/// Display colors fall back to white when the stored string is malformed.
pub fn parse_hex_or_white(hex: &str) -> RGB8 {
    parse_hex(hex).unwrap_or(WHITE)
}

/// Scales a channel so that a lit channel never rounds down to fully off.
fn scale_channel_video(channel: u8, scale: u8) -> u8 {
    if channel == 0 || scale == 0 {
        return 0;
    }
    (((channel as u16 * scale as u16) >> 8) + 1).min(255) as u8
}

pub fn scale_video(color: RGB8, scale: u8) -> RGB8 {
    RGB8::new(
        scale_channel_video(color.r, scale),
        scale_channel_video(color.g, scale),
        scale_channel_video(color.b, scale),
    )
}

/// Dims a color by `amount / 256`.
pub fn fade_to_black(color: RGB8, amount: u8) -> RGB8 {
    let keep = 256 - amount as u16;
    RGB8::new(
        ((color.r as u16 * keep) >> 8) as u8,
        ((color.g as u16 * keep) >> 8) as u8,
        ((color.b as u16 * keep) >> 8) as u8,
    )
}

pub fn hue(hue: u8) -> RGB8 {
    hsv2rgb(Hsv {
        hue,
        sat: 255,
        val: 255,
    })
}
