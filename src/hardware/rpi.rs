//! Raspberry Pi hardware backend built on `rppal`.
//!
//! One `RpiHardware` owns the GPIO chip and the I²C bus handles for the
//! whole process. GPIO lines are claimed lazily on first configure/read and
//! kept claimed for the lifetime of the backend; each line sits behind its
//! own mutex, each I²C bus behind one mutex per bus number. The blocking
//! ioctls run on the blocking pool so relay and sensor workers never stall
//! the runtime.

use super::{Hardware, HardwareError, HwResult, Level};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use rppal::gpio::{Gpio, IoPin, Mode};
use rppal::i2c::I2c;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound on any single blocking hardware call.
const OP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RpiHardware {
    gpio: Gpio,
    lines: DashMap<u8, Arc<Mutex<IoPin>>>,
    buses: DashMap<u8, Arc<Mutex<I2c>>>,
}

impl RpiHardware {
    /// Open the GPIO chip. Fails with `Unavailable` when the device tree is
    /// missing, which is fatal at startup.
    pub fn new() -> HwResult<Self> {
        let gpio = Gpio::new()
            .map_err(|e| HardwareError::Unavailable(format!("gpiochip: {e}")))?;
        Ok(Self {
            gpio,
            lines: DashMap::new(),
            buses: DashMap::new(),
        })
    }

    fn line(&self, line: u8, mode: Mode) -> HwResult<Arc<Mutex<IoPin>>> {
        if let Some(existing) = self.lines.get(&line) {
            return Ok(existing.clone());
        }
        let pin = self
            .gpio
            .get(line)
            .map_err(|e| HardwareError::Unavailable(format!("gpio line {line}: {e}")))?
            .into_io(mode);
        debug!("claimed gpio line {line} in {mode:?} mode");
        let pin = Arc::new(Mutex::new(pin));
        self.lines.insert(line, pin.clone());
        Ok(pin)
    }

    fn bus(&self, bus: u8) -> HwResult<Arc<Mutex<I2c>>> {
        if let Some(existing) = self.buses.get(&bus) {
            return Ok(existing.clone());
        }
        let i2c = I2c::with_bus(bus)
            .map_err(|e| HardwareError::Unavailable(format!("i2c-{bus}: {e}")))?;
        let i2c = Arc::new(Mutex::new(i2c));
        self.buses.insert(bus, i2c.clone());
        Ok(i2c)
    }

    async fn run_blocking<T, F>(&self, what: &str, op: F) -> HwResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> HwResult<T> + Send + 'static,
    {
        let joined = tokio::time::timeout(OP_TIMEOUT, tokio::task::spawn_blocking(op)).await;
        match joined {
            Err(_) => {
                warn!("hardware op timed out: {what}");
                Err(HardwareError::Timeout(what.to_string()))
            }
            Ok(Err(join)) => Err(HardwareError::Bus(format!("{what}: {join}"))),
            Ok(Ok(result)) => result,
        }
    }
}

fn to_rppal(level: Level) -> rppal::gpio::Level {
    match level {
        Level::Low => rppal::gpio::Level::Low,
        Level::High => rppal::gpio::Level::High,
    }
}

fn from_rppal(level: rppal::gpio::Level) -> Level {
    match level {
        rppal::gpio::Level::Low => Level::Low,
        rppal::gpio::Level::High => Level::High,
    }
}

#[async_trait]
impl Hardware for RpiHardware {
    async fn configure_output(&self, line: u8, initial: Level) -> HwResult<()> {
        let pin = self.line(line, Mode::Output)?;
        self.run_blocking("configure_output", move || {
            let mut pin = pin
                .lock()
                .map_err(|_| HardwareError::Bus("gpio line lock poisoned".into()))?;
            pin.set_mode(Mode::Output);
            pin.write(to_rppal(initial));
            Ok(())
        })
        .await
    }

    async fn write_line(&self, line: u8, level: Level) -> HwResult<()> {
        let pin = self.line(line, Mode::Output)?;
        self.run_blocking("write_line", move || {
            let mut pin = pin
                .lock()
                .map_err(|_| HardwareError::Bus("gpio line lock poisoned".into()))?;
            pin.write(to_rppal(level));
            Ok(())
        })
        .await
    }

    async fn read_line(&self, line: u8) -> HwResult<Level> {
        // First touch claims the line as an input so a boot-time snapshot
        // does not disturb the level.
        let pin = self.line(line, Mode::Input)?;
        self.run_blocking("read_line", move || {
            let pin = pin
                .lock()
                .map_err(|_| HardwareError::Bus("gpio line lock poisoned".into()))?;
            Ok(from_rppal(pin.read()))
        })
        .await
    }

    async fn i2c_read(&self, addr: u16, register: u8, len: usize) -> HwResult<Vec<u8>> {
        let bus = self.bus(1)?;
        self.run_blocking("i2c_read", move || {
            let mut bus = bus
                .lock()
                .map_err(|_| HardwareError::Bus("i2c lock poisoned".into()))?;
            bus.set_slave_address(addr)
                .map_err(|e| HardwareError::Bus(e.to_string()))?;
            let mut buf = vec![0u8; len];
            bus.block_read(register, &mut buf)
                .map_err(|e| HardwareError::Bus(e.to_string()))?;
            Ok(buf)
        })
        .await
    }

    async fn i2c_write(&self, addr: u16, register: u8, bytes: &[u8]) -> HwResult<()> {
        let bus = self.bus(1)?;
        let bytes = bytes.to_vec();
        self.run_blocking("i2c_write", move || {
            let mut bus = bus
                .lock()
                .map_err(|_| HardwareError::Bus("i2c lock poisoned".into()))?;
            bus.set_slave_address(addr)
                .map_err(|e| HardwareError::Bus(e.to_string()))?;
            bus.block_write(register, &bytes)
                .map_err(|e| HardwareError::Bus(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn i2c_receive(&self, addr: u16, len: usize) -> HwResult<Vec<u8>> {
        let bus = self.bus(1)?;
        self.run_blocking("i2c_receive", move || {
            let mut bus = bus
                .lock()
                .map_err(|_| HardwareError::Bus("i2c lock poisoned".into()))?;
            bus.set_slave_address(addr)
                .map_err(|e| HardwareError::Bus(e.to_string()))?;
            let mut buf = vec![0u8; len];
            bus.read(&mut buf)
                .map_err(|e| HardwareError::Bus(e.to_string()))?;
            Ok(buf)
        })
        .await
    }
}
