//! WS2812 single-pixel driver over SPIM.
//!
//! Each WS2812 bit is stretched to four SPI bits at 4 MHz (`0` -> `1000`,
//! `1` -> `1110`), so one 24-bit GRB frame is 12 bytes on the wire. A zero
//! byte leads the frame to settle the MOSI line, and trailing zero bytes hold
//! it low past the 50 us reset latch.

use embassy_nrf::spim::{Instance, Spim};
use relay_core::Pixel;

const LEAD_BYTES: usize = 1;
const DATA_BYTES: usize = 12;
const RESET_BYTES: usize = 40;
const BUF_LEN: usize = LEAD_BYTES + DATA_BYTES + RESET_BYTES;

// SPI byte for each pair of WS2812 bits.
const PATTERNS: [u8; 4] = [0b1000_1000, 0b1000_1110, 0b1110_1000, 0b1110_1110];

pub struct Ws2812<'d, T: Instance> {
    spim: Spim<'d, T>,
    brightness: u8,
    buf: [u8; BUF_LEN],
}

impl<'d, T: Instance> Ws2812<'d, T> {
    /// `spim` must be configured for 4 MHz, MSB first.
    pub fn new(spim: Spim<'d, T>, brightness: u8) -> Self {
        Self {
            spim,
            brightness,
            buf: [0; BUF_LEN],
        }
    }

    fn scale(&self, c: u8) -> u8 {
        ((c as u16 * (self.brightness as u16 + 1)) >> 8) as u8
    }

    fn encode(&mut self, r: u8, g: u8, b: u8) {
        // GRB order on the wire.
        let frame = [self.scale(g), self.scale(r), self.scale(b)];
        let mut i = LEAD_BYTES;
        for byte in frame {
            for pair in [byte >> 6, (byte >> 4) & 0b11, (byte >> 2) & 0b11, byte & 0b11] {
                self.buf[i] = PATTERNS[pair as usize];
                i += 1;
            }
        }
    }
}

impl<'d, T: Instance> Pixel for Ws2812<'d, T> {
    async fn set_color(&mut self, r: u8, g: u8, b: u8) {
        self.encode(r, g, b);
        let buf = self.buf;
        if let Err(e) = self.spim.write(&buf).await {
            defmt::error!("Pixel write failed: {:?}", e);
        }
    }
}
