//! MAX31865 RTD-to-digital converter over a bit-banged SPI bus.

use std::thread;
use std::time::Duration;
use tracing::debug;

use super::spi::SoftSpi;
use super::{ChipSelect, Sample, Sampler, SensorFault};
use crate::gpio::DigitalPin;

const CONFIG_REG: u8 = 0x00;
const RTD_MSB_REG: u8 = 0x01;
const FAULT_STATUS_REG: u8 = 0x07;

const CONFIG_BIAS: u8 = 0x80;
const CONFIG_MODE_AUTO: u8 = 0x40;
const CONFIG_1SHOT: u8 = 0x20;
const CONFIG_3WIRE: u8 = 0x10;
const CONFIG_FAULT_STAT: u8 = 0x02;
const CONFIG_FAULT_CYCLE_MASK: u8 = 0x2C;

const WRITE_FLAG: u8 = 0x80;

const BIAS_SETTLE: Duration = Duration::from_millis(10);
const CONVERSION_TIME: Duration = Duration::from_millis(65);

// Callendar-Van Dusen coefficients for platinum RTDs.
const RTD_A: f32 = 3.9083e-3;
const RTD_B: f32 = -5.775e-7;

pub const PT100_NOMINAL: f32 = 100.0;
pub const DEFAULT_REFERENCE_RESISTOR: f32 = 430.0;

pub struct Max31865 {
    cs: Box<dyn DigitalPin>,
    bus: SoftSpi,
    rtd_nominal: f32,
    reference_resistor: f32,
}

impl Max31865 {
    /// Puts the chip in 3-wire mode with bias and auto-conversion off and
    /// clears any latched fault.
    pub fn new(
        mut cs: Box<dyn DigitalPin>,
        mut bus: SoftSpi,
        rtd_nominal: f32,
        reference_resistor: f32,
    ) -> Self {
        cs.set_high();
        bus.idle();

        let mut chip = Self {
            cs,
            bus,
            rtd_nominal,
            reference_resistor,
        };
        chip.update_config(|c| c | CONFIG_3WIRE);
        chip.update_config(|c| c & !CONFIG_BIAS);
        chip.update_config(|c| c & !CONFIG_MODE_AUTO);
        chip.clear_fault();
        chip
    }

    /// One-shot conversion; returns the 15-bit RTD code.
    fn read_rtd(&mut self) -> u16 {
        self.clear_fault();
        self.update_config(|c| c | CONFIG_BIAS);
        thread::sleep(BIAS_SETTLE);

        self.update_config(|c| c | CONFIG_1SHOT);
        thread::sleep(CONVERSION_TIME);

        // Bit 0 of the LSB register is the fault flag.
        self.read16(RTD_MSB_REG) >> 1
    }

    fn clear_fault(&mut self) {
        self.update_config(|c| (c & !CONFIG_FAULT_CYCLE_MASK) | CONFIG_FAULT_STAT);
    }

    fn update_config(&mut self, f: impl FnOnce(u8) -> u8) {
        let config = self.read8(CONFIG_REG);
        self.write8(CONFIG_REG, f(config));
    }

    fn write8(&mut self, addr: u8, value: u8) {
        self.bus.idle();
        let _cs = ChipSelect::assert(self.cs.as_mut());
        self.bus.transfer(addr | WRITE_FLAG);
        self.bus.transfer(value);
    }

    fn read_registers(&mut self, addr: u8, buf: &mut [u8]) {
        self.bus.idle();
        let _cs = ChipSelect::assert(self.cs.as_mut());
        self.bus.transfer(addr & !WRITE_FLAG);
        for b in buf.iter_mut() {
            *b = self.bus.transfer(0xFF);
        }
    }

    fn read8(&mut self, addr: u8) -> u8 {
        let mut buf = [0u8; 1];
        self.read_registers(addr, &mut buf);
        buf[0]
    }

    fn read16(&mut self, addr: u8) -> u16 {
        let mut buf = [0u8; 2];
        self.read_registers(addr, &mut buf);
        u16::from_be_bytes(buf)
    }
}

impl Sampler for Max31865 {
    fn sample(&mut self) -> Result<Sample, SensorFault> {
        let code = self.read_rtd();
        let fault = self.read8(FAULT_STATUS_REG);
        self.update_config(|c| c & !CONFIG_BIAS);

        if fault != 0 {
            self.clear_fault();
            return Err(SensorFault::Device { fault });
        }

        let resistance = code_to_resistance(code, self.reference_resistor);
        let value = resistance_to_celsius(resistance, self.rtd_nominal);
        debug!(code, resistance, value, "rtd conversion");
        Ok(Sample::now(value))
    }
}

pub fn code_to_resistance(code: u16, reference_resistor: f32) -> f32 {
    f32::from(code) / 32768.0 * reference_resistor
}

/// Callendar-Van Dusen, closed form above 0 °C and a fifth-order polynomial
/// fit below it.
pub fn resistance_to_celsius(rt: f32, rtd_nominal: f32) -> f32 {
    let z1 = -RTD_A;
    let z2 = RTD_A * RTD_A - 4.0 * RTD_B;
    let z3 = (4.0 * RTD_B) / rtd_nominal;
    let z4 = 2.0 * RTD_B;

    let temp = ((z2 + z3 * rt).sqrt() + z1) / z4;
    if temp >= 0.0 {
        return temp;
    }

    // The fit is for a 100 ohm element.
    let r = rt / rtd_nominal * 100.0;
    let mut rpoly = r;
    let mut temp = -242.02;
    temp += 2.2228 * rpoly;
    rpoly *= r;
    temp += 2.5859e-3 * rpoly;
    rpoly *= r;
    temp -= 4.8260e-6 * rpoly;
    rpoly *= r;
    temp -= 2.8183e-8 * rpoly;
    rpoly *= r;
    temp += 1.5243e-10 * rpoly;
    temp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Level;
    use std::sync::{Arc, Mutex};

    /// Register-level model of the chip, driven by the pins below.
    #[derive(Default)]
    struct Chip {
        regs: [u8; 8],
        fault_on_conversion: u8,
        rtd_code: u16,
        selected: bool,
        mosi: bool,
        miso: bool,
        clk: bool,
        shift_in: u8,
        bit: u8,
        byte_index: usize,
        addr: u8,
        write: bool,
        out: u8,
        conversions: u32,
    }

    impl Chip {
        fn select(&mut self, selected: bool) {
            self.selected = selected;
            if selected {
                self.bit = 0;
                self.byte_index = 0;
                self.shift_in = 0;
                self.out = 0;
            }
        }

        fn falling_edge(&mut self) {
            if !self.selected {
                return;
            }
            self.shift_in = (self.shift_in << 1) | u8::from(self.mosi);
            self.miso = self.out & (0x80 >> self.bit) != 0;
            self.bit += 1;
            if self.bit < 8 {
                return;
            }

            let byte = self.shift_in;
            if self.byte_index == 0 {
                self.addr = byte & 0x7F;
                self.write = byte & WRITE_FLAG != 0;
            } else if self.write {
                let reg = (self.addr as usize + self.byte_index - 1) & 7;
                self.store(reg, byte);
            }
            self.byte_index += 1;
            self.bit = 0;
            self.shift_in = 0;
            self.out = if self.write {
                0
            } else {
                self.regs[(self.addr as usize + self.byte_index - 1) & 7]
            };
        }

        fn store(&mut self, reg: usize, value: u8) {
            if reg != CONFIG_REG as usize {
                self.regs[reg] = value;
                return;
            }
            if value & CONFIG_FAULT_STAT != 0 {
                self.regs[FAULT_STATUS_REG as usize] = 0;
            }
            if value & CONFIG_1SHOT != 0 {
                self.conversions += 1;
                let raw = (self.rtd_code << 1) | u16::from(self.fault_on_conversion != 0);
                let [msb, lsb] = raw.to_be_bytes();
                self.regs[1] = msb;
                self.regs[2] = lsb;
                self.regs[FAULT_STATUS_REG as usize] = self.fault_on_conversion;
            }
            // Fault-clear and one-shot bits self-clear.
            self.regs[0] = value & !(CONFIG_1SHOT | CONFIG_FAULT_STAT);
        }
    }

    #[derive(Clone, Copy)]
    enum Line {
        Cs,
        Clk,
        Mosi,
        Miso,
    }

    struct ChipPin {
        chip: Arc<Mutex<Chip>>,
        line: Line,
    }

    impl DigitalPin for ChipPin {
        fn set(&mut self, level: Level) {
            let mut chip = self.chip.lock().unwrap();
            match self.line {
                Line::Cs => chip.select(level == Level::Low),
                Line::Clk => {
                    let was_high = chip.clk;
                    chip.clk = level.is_high();
                    if was_high && !chip.clk {
                        chip.falling_edge();
                    }
                }
                Line::Mosi => chip.mosi = level.is_high(),
                Line::Miso => {}
            }
        }

        fn read(&self) -> Level {
            let chip = self.chip.lock().unwrap();
            match self.line {
                Line::Cs => Level::from(!chip.selected),
                Line::Clk => Level::from(chip.clk),
                Line::Mosi => Level::from(chip.mosi),
                Line::Miso => Level::from(chip.miso),
            }
        }
    }

    fn driver(chip: &Arc<Mutex<Chip>>) -> Max31865 {
        let pin = |line| -> Box<dyn DigitalPin> {
            Box::new(ChipPin {
                chip: Arc::clone(chip),
                line,
            })
        };
        let bus = SoftSpi::new(pin(Line::Clk), Some(pin(Line::Mosi)), pin(Line::Miso));
        Max31865::new(pin(Line::Cs), bus, PT100_NOMINAL, DEFAULT_REFERENCE_RESISTOR)
    }

    #[test]
    fn converts_nominal_resistance_to_zero() {
        assert!(resistance_to_celsius(100.0, 100.0).abs() < 0.01);
    }

    #[test]
    fn converts_positive_branch() {
        // PT100 at 100 C is 138.5055 ohm.
        let t = resistance_to_celsius(138.5055, 100.0);
        assert!((t - 100.0).abs() < 0.05, "got {t}");
    }

    #[test]
    fn converts_sub_zero_branch() {
        // PT100 at -50 C is 80.306 ohm.
        let t = resistance_to_celsius(80.306, 100.0);
        assert!((t + 50.0).abs() < 0.2, "got {t}");
    }

    #[test]
    fn initialises_three_wire_without_bias() {
        let chip = Arc::new(Mutex::new(Chip::default()));
        let _rtd = driver(&chip);
        let chip = chip.lock().unwrap();
        assert_eq!(chip.regs[0] & CONFIG_3WIRE, CONFIG_3WIRE);
        assert_eq!(chip.regs[0] & (CONFIG_BIAS | CONFIG_MODE_AUTO), 0);
        assert!(!chip.selected);
    }

    #[test]
    fn samples_over_the_bus() {
        let chip = Arc::new(Mutex::new(Chip::default()));
        // 93 C on a PT100 is ~135.85 ohm.
        let code = (135.85 / DEFAULT_REFERENCE_RESISTOR * 32768.0) as u16;
        chip.lock().unwrap().rtd_code = code;

        let mut rtd = driver(&chip);
        let sample = rtd.sample().unwrap();
        assert!((sample.value - 93.0).abs() < 0.2, "got {}", sample.value);

        let chip = chip.lock().unwrap();
        assert_eq!(chip.conversions, 1);
        assert!(!chip.selected);
        assert_eq!(chip.regs[0] & CONFIG_BIAS, 0);
    }

    #[test]
    fn reports_fault_register() {
        let chip = Arc::new(Mutex::new(Chip::default()));
        {
            let mut c = chip.lock().unwrap();
            c.rtd_code = 0x7FFF;
            c.fault_on_conversion = 0x84;
        }
        let mut rtd = driver(&chip);
        assert_eq!(rtd.sample(), Err(SensorFault::Device { fault: 0x84 }));

        let chip = chip.lock().unwrap();
        assert!(!chip.selected);
        assert_eq!(chip.regs[FAULT_STATUS_REG as usize], 0);
    }
}
