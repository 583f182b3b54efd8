use crate::gpio::DigitalPin;

/// Software-clocked serial bus. Chip select is not part of the bus; callers
/// scope it with [`super::ChipSelect`].
pub struct SoftSpi {
    clk: Box<dyn DigitalPin>,
    mosi: Option<Box<dyn DigitalPin>>,
    miso: Box<dyn DigitalPin>,
}

impl SoftSpi {
    pub fn new(
        mut clk: Box<dyn DigitalPin>,
        mosi: Option<Box<dyn DigitalPin>>,
        miso: Box<dyn DigitalPin>,
    ) -> Self {
        clk.set_low();
        Self { clk, mosi, miso }
    }

    /// Read-only bus (no MOSI line).
    pub fn read_only(clk: Box<dyn DigitalPin>, miso: Box<dyn DigitalPin>) -> Self {
        Self::new(clk, None, miso)
    }

    pub fn idle(&mut self) {
        self.clk.set_low();
    }

    /// Full-duplex byte exchange, MSB first. Data is driven on the falling
    /// edge and MISO sampled after it.
    pub fn transfer(&mut self, out: u8) -> u8 {
        let mut reply = 0u8;
        for i in (0..8).rev() {
            reply <<= 1;
            self.clk.set_high();
            if let Some(mosi) = self.mosi.as_mut() {
                mosi.set((out & (1 << i) != 0).into());
            }
            self.clk.set_low();
            if self.miso.is_high() {
                reply |= 1;
            }
        }
        reply
    }

    /// Clock in `n` bits MSB first, sampling while the clock is high.
    pub fn read_bits(&mut self, n: u32) -> u32 {
        let mut bits = 0u32;
        for _ in 0..n {
            self.clk.set_high();
            bits <<= 1;
            if self.miso.is_high() {
                bits |= 1;
            }
            self.clk.set_low();
        }
        bits
    }
}
