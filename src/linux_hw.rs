//! Linux peripheral bindings for the `hardware` feature.
//!
//! - [`CdevChipSelect`]: chip-select line through the GPIO character device
//! - [`SpidevHost`]: kernel SPI device, opened on `begin` and closed on `end`
//! - [`Ds3231`]: battery-backed clock on I2C
//!
//! [`board_bus_lines`] assembles the bus switch from the board configuration.

use crate::bus::{GpioBusLines, GpioPin, SpiHost};
use crate::config::{BoardConfig, BusPins};
use crate::error::HwError;
use crate::time_authority::RtcDevice;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use embedded_hal::i2c::I2c;
use linux_embedded_hal::gpio_cdev::{Chip, LineHandle, LineRequestFlags};
use linux_embedded_hal::spidev::{SpiModeFlags, Spidev, SpidevOptions};
use linux_embedded_hal::I2cdev;
use log::{debug, info};
use std::path::PathBuf;

fn hw<E: std::fmt::Display>(e: E) -> HwError {
    HwError(e.to_string())
}

/// Output line requested high (deselected) from a GPIO chip.
pub struct CdevChipSelect {
    line: LineHandle,
}

impl CdevChipSelect {
    pub fn new(chip: &mut Chip, offset: u32) -> Result<Self, HwError> {
        let line = chip
            .get_line(offset)
            .map_err(hw)?
            .request(LineRequestFlags::OUTPUT, 1, "photo-frame")
            .map_err(hw)?;
        Ok(Self { line })
    }
}

impl GpioPin for CdevChipSelect {
    fn set_high(&mut self) -> Result<(), HwError> {
        self.line.set_value(1).map_err(hw)
    }

    fn set_low(&mut self) -> Result<(), HwError> {
        self.line.set_value(0).map_err(hw)
    }
}

/// Kernel SPI device. Pin routing is fixed by the device tree, so `begin`
/// only opens and configures the device node.
pub struct SpidevHost {
    path: PathBuf,
    speed_hz: u32,
    dev: Option<Spidev>,
}

impl SpidevHost {
    pub fn new(path: impl Into<PathBuf>, speed_hz: u32) -> Self {
        Self {
            path: path.into(),
            speed_hz,
            dev: None,
        }
    }
}

impl SpiHost for SpidevHost {
    fn begin(&mut self, pins: BusPins) -> Result<(), HwError> {
        if self.dev.is_some() {
            return Ok(());
        }
        let mut dev = Spidev::open(&self.path).map_err(hw)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(self.speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        dev.configure(&options).map_err(hw)?;
        debug!("{} opened for cs={}", self.path.display(), pins.cs);
        self.dev = Some(dev);
        Ok(())
    }

    fn end(&mut self) {
        if self.dev.take().is_some() {
            debug!("{} closed", self.path.display());
        }
    }
}

/// SPI clock for both peripherals.
const SPI_SPEED_HZ: u32 = 8_000_000;

/// Chip-select lines and SPI host wired as `board` describes.
pub fn board_bus_lines(
    board: &BoardConfig,
) -> Result<GpioBusLines<SpidevHost, CdevChipSelect>, HwError> {
    let mut chip = Chip::new(&board.gpio_chip).map_err(hw)?;
    let storage_cs = CdevChipSelect::new(&mut chip, board.storage_pins.cs as u32)?;
    let display_cs = CdevChipSelect::new(&mut chip, board.display_pins.cs as u32)?;
    info!(
        "Chip selects on {}: storage GPIO {}, display GPIO {}",
        board.gpio_chip, board.storage_pins.cs, board.display_pins.cs
    );
    Ok(GpioBusLines::new(
        SpidevHost::new(&board.spi_device, SPI_SPEED_HZ),
        storage_cs,
        display_cs,
        board,
    ))
}

const DS3231_ADDR: u8 = 0x68;
const REG_SECONDS: u8 = 0x00;
const REG_STATUS: u8 = 0x0F;
/// Oscillator stop flag
const STATUS_OSF: u8 = 0x80;

fn bcd_to_bin(v: u8) -> u8 {
    (v >> 4) * 10 + (v & 0x0F)
}

fn bin_to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// Maxim DS3231 real-time clock.
pub struct Ds3231<I2C> {
    i2c: I2C,
}

impl Ds3231<I2cdev> {
    pub fn open(path: &str) -> Result<Self, HwError> {
        Ok(Self::new(I2cdev::new(path).map_err(hw)?))
    }
}

impl<I2C: I2c> Ds3231<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self { i2c }
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, HwError> {
        let mut buf = [0u8];
        self.i2c
            .write_read(DS3231_ADDR, &[reg], &mut buf)
            .map_err(|e| HwError(format!("{e:?}")))?;
        Ok(buf[0])
    }
}

impl<I2C: I2c> RtcDevice for Ds3231<I2C> {
    fn begin(&mut self) -> Result<(), HwError> {
        self.read_reg(REG_STATUS).map(|_| ())
    }

    fn lost_power(&mut self) -> Result<bool, HwError> {
        Ok(self.read_reg(REG_STATUS)? & STATUS_OSF != 0)
    }

    fn now(&mut self) -> Result<NaiveDateTime, HwError> {
        let mut regs = [0u8; 7];
        self.i2c
            .write_read(DS3231_ADDR, &[REG_SECONDS], &mut regs)
            .map_err(|e| HwError(format!("{e:?}")))?;

        let second = bcd_to_bin(regs[0] & 0x7F) as u32;
        let minute = bcd_to_bin(regs[1] & 0x7F) as u32;
        let hour = bcd_to_bin(regs[2] & 0x3F) as u32;
        let day = bcd_to_bin(regs[4] & 0x3F) as u32;
        let month = bcd_to_bin(regs[5] & 0x1F) as u32;
        let year = 2000 + bcd_to_bin(regs[6]) as i32;

        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, second))
            .ok_or_else(|| HwError(format!("clock registers out of range: {regs:02X?}")))
    }

    fn adjust(&mut self, time: NaiveDateTime) -> Result<(), HwError> {
        let year = time.year();
        if !(2000..2100).contains(&year) {
            return Err(HwError(format!("year {year} not representable")));
        }
        let frame = [
            REG_SECONDS,
            bin_to_bcd(time.second() as u8),
            bin_to_bcd(time.minute() as u8),
            bin_to_bcd(time.hour() as u8),
            time.weekday().number_from_sunday() as u8,
            bin_to_bcd(time.day() as u8),
            bin_to_bcd(time.month() as u8),
            bin_to_bcd((year - 2000) as u8),
        ];
        self.i2c
            .write(DS3231_ADDR, &frame)
            .map_err(|e| HwError(format!("{e:?}")))?;

        let status = self.read_reg(REG_STATUS)?;
        self.i2c
            .write(DS3231_ADDR, &[REG_STATUS, status & !STATUS_OSF])
            .map_err(|e| HwError(format!("{e:?}")))?;
        info!("DS3231 set to {}", time.format("%Y-%m-%d %H:%M:%S"));
        Ok(())
    }
}
