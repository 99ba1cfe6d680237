//! Inbound command decoding: one decimal-string payload packs three 8-bit
//! channel intensities into a 24-bit value.

/// Fixed multiplier from an 8-bit channel level to the actuator's 10-bit
/// PWM range (255 * 4 = 1020, inside 0..=1023).
pub const CHANNEL_SCALE: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLevels {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl ChannelLevels {
    /// Decodes a raw payload. The command topic is assumed to carry only
    /// trusted input, so there is no validation beyond the numeric parse:
    /// non-numeric or out-of-u32-range text decodes as zero, and bits 24-31
    /// of a valid parse are ignored by the unpacking.
    pub fn decode(payload: &[u8]) -> Self {
        let packed = std::str::from_utf8(payload)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok())
            .unwrap_or(0);
        Self::unpack(packed)
    }

    /// red = bits 0-7, green = bits 8-15, blue = bits 16-23.
    pub fn unpack(packed: u32) -> Self {
        Self {
            red: packed as u8,
            green: (packed >> 8) as u8,
            blue: (packed >> 16) as u8,
        }
    }

    /// Channel intensities in the actuator's native range.
    pub fn scaled(self) -> (u16, u16, u16) {
        (
            u16::from(self.red) * CHANNEL_SCALE,
            u16::from(self.green) * CHANNEL_SCALE,
            u16::from(self.blue) * CHANNEL_SCALE,
        )
    }
}
