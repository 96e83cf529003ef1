//! SHT30 temperature/humidity sensor.
//!
//! Single-shot, high-repeatability measurement (command 0x2C06, clock
//! stretching enabled). The 6-byte response carries two 16-bit words each
//! followed by a CRC-8 (polynomial 0x31, init 0xFF).

use crate::hardware::{Hardware, HardwareError, HwResult};
use log::debug;
use std::collections::HashMap;
use std::time::Duration;

const CMD_MEASURE_HIGH: [u8; 2] = [0x2C, 0x06];
const CMD_SOFT_RESET: [u8; 2] = [0x30, 0xA2];

/// Worst-case measurement duration for high repeatability per datasheet.
const MEASURE_DELAY: Duration = Duration::from_millis(16);

pub struct Sht30 {
    address: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvReading {
    pub temperature: f64,
    pub humidity: f64,
}

fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

impl Sht30 {
    pub fn new(address: u16) -> Self {
        Self { address }
    }

    /// Soft-reset the sensor. Used before the first measurement after a
    /// string of failures.
    pub async fn reset(&self, hardware: &dyn Hardware) -> HwResult<()> {
        hardware
            .i2c_write(self.address, CMD_SOFT_RESET[0], &CMD_SOFT_RESET[1..])
            .await
    }

    /// Trigger a single-shot measurement and read it back.
    pub async fn read(&self, hardware: &dyn Hardware) -> HwResult<EnvReading> {
        hardware
            .i2c_write(self.address, CMD_MEASURE_HIGH[0], &CMD_MEASURE_HIGH[1..])
            .await?;
        tokio::time::sleep(MEASURE_DELAY).await;
        let frame = hardware.i2c_receive(self.address, 6).await?;
        if frame.len() < 6 {
            return Err(HardwareError::Bus("short SHT30 frame".into()));
        }
        if crc8(&frame[0..2]) != frame[2] || crc8(&frame[3..5]) != frame[5] {
            return Err(HardwareError::Bus("SHT30 CRC mismatch".into()));
        }
        let raw_t = u16::from_be_bytes([frame[0], frame[1]]);
        let raw_rh = u16::from_be_bytes([frame[3], frame[4]]);
        let temperature = -45.0 + 175.0 * f64::from(raw_t) / 65535.0;
        let humidity = 100.0 * f64::from(raw_rh) / 65535.0;
        debug!(
            "sht30 0x{:02x}: {temperature:.2} C {humidity:.1} %RH",
            self.address
        );
        Ok(EnvReading {
            temperature,
            humidity,
        })
    }
}

impl EnvReading {
    pub fn into_fields(self) -> HashMap<String, f64> {
        HashMap::from([
            ("temperature".to_string(), self.temperature),
            ("humidity".to_string(), self.humidity),
        ])
    }
}
