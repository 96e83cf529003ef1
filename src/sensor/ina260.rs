//! INA260 current/voltage/power monitor.
//!
//! Register map: current 0x01 (signed, 1.25 mA/LSB), bus voltage 0x02
//! (1.25 mV/LSB), power 0x03 (10 mW/LSB). All three are 16-bit big-endian.

use crate::hardware::{Hardware, HardwareError, HwResult};
use log::debug;
use std::collections::HashMap;

const REG_CURRENT: u8 = 0x01;
const REG_BUS_VOLTAGE: u8 = 0x02;
const REG_POWER: u8 = 0x03;

const CURRENT_LSB_A: f64 = 0.00125;
const VOLTAGE_LSB_V: f64 = 0.00125;
const POWER_LSB_W: f64 = 0.010;

pub struct Ina260 {
    address: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReading {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

impl Ina260 {
    pub fn new(address: u16) -> Self {
        Self { address }
    }

    async fn read_register(&self, hardware: &dyn Hardware, register: u8) -> HwResult<u16> {
        let bytes = hardware.i2c_read(self.address, register, 2).await?;
        if bytes.len() < 2 {
            return Err(HardwareError::Bus(format!(
                "short read from 0x{:02x}/{register:#04x}",
                self.address
            )));
        }
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read voltage, current and power in SI units.
    pub async fn read(&self, hardware: &dyn Hardware) -> HwResult<PowerReading> {
        let voltage = f64::from(self.read_register(hardware, REG_BUS_VOLTAGE).await?) * VOLTAGE_LSB_V;
        // Current is two's complement; negative means reverse flow.
        let current =
            f64::from(self.read_register(hardware, REG_CURRENT).await? as i16) * CURRENT_LSB_A;
        let power = f64::from(self.read_register(hardware, REG_POWER).await?) * POWER_LSB_W;
        debug!(
            "ina260 0x{:02x}: {voltage:.3} V {current:.3} A {power:.3} W",
            self.address
        );
        Ok(PowerReading {
            voltage,
            current,
            power,
        })
    }
}

impl PowerReading {
    pub fn into_fields(self) -> HashMap<String, f64> {
        HashMap::from([
            ("voltage".to_string(), self.voltage),
            ("current".to_string(), self.current),
            ("power".to_string(), self.power),
        ])
    }
}
