//! In-memory hardware backend for tests and device-less hosts.
//!
//! Lines and I²C registers live in concurrent maps. Tests can preload
//! register contents, inject failures per address and inspect the write log.

use super::{Hardware, HardwareError, HwResult, Level};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A recorded line write, newest last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineWrite {
    pub line: u8,
    pub level: Level,
}

#[derive(Default)]
pub struct MockHardware {
    lines: DashMap<u8, Level>,
    registers: DashMap<(u16, u8), Vec<u8>>,
    raw: DashMap<u16, Vec<u8>>,
    failing_addrs: DashMap<u16, ()>,
    fail_gpio: AtomicBool,
    writes: Mutex<Vec<LineWrite>>,
}

impl MockHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset the level a not-yet-configured line reads back as.
    pub fn set_line(&self, line: u8, level: Level) {
        self.lines.insert(line, level);
    }

    /// Preload the bytes returned by `i2c_read(addr, register, ..)`.
    pub fn set_register(&self, addr: u16, register: u8, bytes: Vec<u8>) {
        self.registers.insert((addr, register), bytes);
    }

    /// Preload the bytes returned by `i2c_receive(addr, ..)`.
    pub fn set_raw(&self, addr: u16, bytes: Vec<u8>) {
        self.raw.insert(addr, bytes);
    }

    /// Make every transaction against `addr` fail with a bus error.
    pub fn fail_address(&self, addr: u16, failing: bool) {
        if failing {
            self.failing_addrs.insert(addr, ());
        } else {
            self.failing_addrs.remove(&addr);
        }
    }

    /// Make every GPIO operation fail.
    pub fn fail_gpio(&self, failing: bool) {
        self.fail_gpio.store(failing, Ordering::SeqCst);
    }

    pub fn line_writes(&self) -> Vec<LineWrite> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    fn check_gpio(&self) -> HwResult<()> {
        if self.fail_gpio.load(Ordering::SeqCst) {
            return Err(HardwareError::Bus("injected gpio failure".into()));
        }
        Ok(())
    }

    fn check_addr(&self, addr: u16) -> HwResult<()> {
        if self.failing_addrs.contains_key(&addr) {
            return Err(HardwareError::Bus(format!(
                "injected failure at 0x{addr:02x}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Hardware for MockHardware {
    async fn configure_output(&self, line: u8, initial: Level) -> HwResult<()> {
        self.check_gpio()?;
        self.lines.insert(line, initial);
        Ok(())
    }

    async fn write_line(&self, line: u8, level: Level) -> HwResult<()> {
        self.check_gpio()?;
        self.lines.insert(line, level);
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(LineWrite { line, level });
        }
        Ok(())
    }

    async fn read_line(&self, line: u8) -> HwResult<Level> {
        self.check_gpio()?;
        Ok(self.lines.get(&line).map(|l| *l).unwrap_or(Level::Low))
    }

    async fn i2c_read(&self, addr: u16, register: u8, len: usize) -> HwResult<Vec<u8>> {
        self.check_addr(addr)?;
        let bytes = self
            .registers
            .get(&(addr, register))
            .map(|b| b.clone())
            .ok_or_else(|| HardwareError::Bus(format!("no data at 0x{addr:02x}/{register:#04x}")))?;
        Ok(bytes.into_iter().take(len).collect())
    }

    async fn i2c_write(&self, addr: u16, register: u8, bytes: &[u8]) -> HwResult<()> {
        self.check_addr(addr)?;
        self.registers.insert((addr, register), bytes.to_vec());
        Ok(())
    }

    async fn i2c_receive(&self, addr: u16, len: usize) -> HwResult<Vec<u8>> {
        self.check_addr(addr)?;
        let bytes = self
            .raw
            .get(&addr)
            .map(|b| b.clone())
            .ok_or_else(|| HardwareError::Bus(format!("no data at 0x{addr:02x}")))?;
        Ok(bytes.into_iter().take(len).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_line_round_trip() {
        let hw = MockHardware::new();
        hw.configure_output(17, Level::Low).await.unwrap();
        hw.write_line(17, Level::High).await.unwrap();
        assert_eq!(hw.read_line(17).await.unwrap(), Level::High);
        assert_eq!(hw.line_writes().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_i2c_failure() {
        let hw = MockHardware::new();
        hw.set_register(0x44, 0x02, vec![0x10, 0x00]);
        hw.fail_address(0x44, true);
        assert!(hw.i2c_read(0x44, 0x02, 2).await.is_err());
        hw.fail_address(0x44, false);
        assert_eq!(hw.i2c_read(0x44, 0x02, 2).await.unwrap(), vec![0x10, 0x00]);
    }
}
