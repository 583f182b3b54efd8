//! MAX6675 cold-junction-compensated thermocouple converter (read-only
//! serial interface).

use super::spi::SoftSpi;
use super::{ChipSelect, Sample, Sampler, SensorFault};
use crate::gpio::DigitalPin;

const FRAME_BITS: u32 = 16;
const OPEN_CIRCUIT_BIT: u16 = 0b100;
const DEGREES_PER_UNIT: f32 = 0.25;

pub struct Max6675 {
    cs: Box<dyn DigitalPin>,
    bus: SoftSpi,
}

impl Max6675 {
    pub fn new(mut cs: Box<dyn DigitalPin>, mut bus: SoftSpi) -> Self {
        cs.set_high();
        bus.idle();
        Self { cs, bus }
    }

    fn read_frame(&mut self) -> u16 {
        let _cs = ChipSelect::assert(self.cs.as_mut());
        self.bus.read_bits(FRAME_BITS) as u16
    }
}

impl Sampler for Max6675 {
    fn sample(&mut self) -> Result<Sample, SensorFault> {
        let frame = self.read_frame();
        decode(frame).map(Sample::now)
    }
}

/// Bits 14..3 hold the temperature in quarter degrees; bit 2 is set when the
/// thermocouple is disconnected.
pub fn decode(frame: u16) -> Result<f32, SensorFault> {
    if frame & OPEN_CIRCUIT_BIT != 0 {
        return Err(SensorFault::OpenCircuit);
    }
    let units = (frame >> 3) & 0x0FFF;
    Ok(f32::from(units) * DEGREES_PER_UNIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Level;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Chip {
        frame: u16,
        selected: bool,
        index: u32,
        clk: bool,
    }

    #[derive(Clone, Copy)]
    enum Line {
        Cs,
        Clk,
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
                Line::Cs => {
                    chip.selected = level == Level::Low;
                    chip.index = 0;
                }
                Line::Clk => {
                    let falling = chip.clk && !level.is_high();
                    chip.clk = level.is_high();
                    if falling && chip.selected {
                        chip.index += 1;
                    }
                }
                Line::Miso => {}
            }
        }

        fn read(&self) -> Level {
            let chip = self.chip.lock().unwrap();
            match self.line {
                Line::Cs => Level::from(!chip.selected),
                Line::Clk => Level::from(chip.clk),
                Line::Miso => {
                    let high = chip.selected
                        && chip.index < FRAME_BITS
                        && chip.frame & (0x8000 >> chip.index) != 0;
                    Level::from(high)
                }
            }
        }
    }

    fn driver(frame: u16) -> (Max6675, Arc<Mutex<Chip>>) {
        let chip = Arc::new(Mutex::new(Chip {
            frame,
            ..Chip::default()
        }));
        let pin = |line| -> Box<dyn DigitalPin> {
            Box::new(ChipPin {
                chip: Arc::clone(&chip),
                line,
            })
        };
        let bus = SoftSpi::read_only(pin(Line::Clk), pin(Line::Miso));
        let tc = Max6675::new(pin(Line::Cs), bus);
        (tc, chip)
    }

    #[test]
    fn decodes_quarter_degrees() {
        // 93.25 C = 373 units.
        assert_eq!(decode(373 << 3), Ok(93.25));
        assert_eq!(decode(0), Ok(0.0));
        assert_eq!(decode(0x0FFF << 3), Ok(1023.75));
    }

    #[test]
    fn open_circuit_flag_is_a_fault() {
        assert_eq!(decode((400 << 3) | OPEN_CIRCUIT_BIT), Err(SensorFault::OpenCircuit));
    }

    #[test]
    fn reads_frame_msb_first() {
        let (mut tc, chip) = driver(373 << 3);
        let sample = tc.sample().unwrap();
        assert_eq!(sample.value, 93.25);
        assert!(!chip.lock().unwrap().selected);
    }

    #[test]
    fn releases_chip_select_on_fault() {
        let (mut tc, chip) = driver(OPEN_CIRCUIT_BIT);
        assert_eq!(tc.sample(), Err(SensorFault::OpenCircuit));
        assert!(!chip.lock().unwrap().selected);
    }
}
