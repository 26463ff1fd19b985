//! An in-memory adapter that models a chip closely enough to exercise the
//! protocol engines and orchestrator without hardware.
//!
//! Used both as the shipped "no programmer attached yet" default (the CLI's
//! `--adapter simulated`, see `spec.md` §4.8) and as the backbone of the
//! property-based tests in `spec.md` §8. Mirrors the `dummy`/`internal`
//! backend every multi-backend flasher in this domain ships for exactly
//! this reason.

use crate::adapter::{Adapter, AdapterKind, Pin};
use crate::capabilities::{HardwareCapabilities, SpeedTier};
use crate::error::{Error, Kind, Result};

const SPI_BUSY: u8 = 1 << 0;
const SPI_WEL: u8 = 1 << 1;

#[derive(Debug, Clone, Copy)]
enum SpiOpcode {
    Rdid,
    Read,
    Pp,
    Se,
    Be,
    Ce,
    Rdsr,
    Wren,
    Wrdi,
    Unknown(u8),
}

impl From<u8> for SpiOpcode {
    fn from(b: u8) -> Self {
        match b {
            0x9F => SpiOpcode::Rdid,
            0x03 | 0x0B => SpiOpcode::Read,
            0x02 => SpiOpcode::Pp,
            0x20 => SpiOpcode::Se,
            0xD8 => SpiOpcode::Be,
            0x60 | 0xC7 => SpiOpcode::Ce,
            0x05 => SpiOpcode::Rdsr,
            0x06 => SpiOpcode::Wren,
            0x04 => SpiOpcode::Wrdi,
            other => SpiOpcode::Unknown(other),
        }
    }
}

/// Simulated bus state. One instance models one chip; which protocol it
/// answers to is chosen when constructing it.
pub struct SimulatedAdapter {
    connected: bool,
    capabilities: HardwareCapabilities,

    // SPI NOR/NAND model.
    memory: Vec<u8>,
    sector_size: usize,
    jedec: [u8; 3],
    status: u8,
    addr_bytes: u8,

    // I2C model: a flat address space, banked by device address.
    i2c_base_dev: u8,
    i2c_bank_size: u32,

    // MicroWire model.
    mw_words: Vec<u16>,
    mw_write_enabled: bool,

    gpio: [bool; 8],
}

impl SimulatedAdapter {
    /// A blank SPI NOR chip of `size` bytes with the given geometry.
    pub fn spi_nor(size: usize, sector_size: usize, jedec: [u8; 3]) -> Self {
        Self {
            connected: false,
            capabilities: HardwareCapabilities::SPI | HardwareCapabilities::GPIO,
            memory: vec![0xFF; size],
            sector_size,
            jedec,
            status: 0,
            addr_bytes: if size > 16 * 1024 * 1024 { 4 } else { 3 },
            i2c_base_dev: 0x50,
            i2c_bank_size: 256,
            mw_words: Vec::new(),
            mw_write_enabled: false,
            gpio: [false; 8],
        }
    }

    /// A blank I2C EEPROM addressed across `bank_count` device addresses
    /// starting at `base_dev`, each bank holding `bank_size` bytes.
    pub fn i2c_eeprom(base_dev: u8, bank_count: u8, bank_size: u32) -> Self {
        Self {
            connected: false,
            capabilities: HardwareCapabilities::I2C,
            memory: vec![0xFF; bank_size as usize * bank_count as usize],
            sector_size: 0,
            jedec: [0, 0, 0],
            status: 0,
            addr_bytes: 2,
            i2c_base_dev: base_dev,
            i2c_bank_size: bank_size,
            mw_words: Vec::new(),
            mw_write_enabled: false,
            gpio: [false; 8],
        }
    }

    /// A blank MicroWire EEPROM with `word_count` 16-bit words.
    pub fn microwire(word_count: usize) -> Self {
        Self {
            connected: false,
            capabilities: HardwareCapabilities::MICROWIRE | HardwareCapabilities::GPIO,
            memory: Vec::new(),
            sector_size: 0,
            jedec: [0, 0, 0],
            status: 0,
            addr_bytes: 0,
            i2c_base_dev: 0,
            i2c_bank_size: 0,
            mw_words: vec![0xFFFF; word_count],
            mw_write_enabled: false,
            gpio: [false; 8],
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::new(Kind::NotConnected, "simulated adapter not open"))
        }
    }
}

impl Adapter for SimulatedAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Simulated
    }

    fn enumerate(&self) -> Result<Vec<String>> {
        Ok(vec!["simulated0".to_string()])
    }

    fn open(&mut self, _path: Option<&str>) -> Result<()> {
        if self.connected {
            return Err(Error::new(Kind::Busy, "already open"));
        }
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn firmware_version(&self) -> Result<String> {
        Ok("simulated-1.0".to_string())
    }

    fn capabilities(&self) -> HardwareCapabilities {
        self.capabilities
    }

    fn set_speed(&mut self, _speed: SpeedTier) -> Result<()> {
        Ok(())
    }

    fn delay(&self, _ms: u32, cancel: &crate::result::CancellationToken) -> Result<()> {
        // No real clock to wait on; still an observable cancellation point.
        cancel.check()
    }

    fn spi_init(&mut self) -> Result<()> {
        self.require_connected()?;
        self.status = 0;
        Ok(())
    }

    fn spi_deinit(&mut self) -> Result<()> {
        Ok(())
    }

    fn spi_send_cmd(&mut self, cmd: u8) -> Result<()> {
        self.spi_transfer(&[cmd], 0).map(|_| ())
    }

    fn spi_read(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(vec![0; len])
    }

    fn spi_write(&mut self, data: &[u8]) -> Result<()> {
        self.spi_transfer(data, 0).map(|_| ())
    }

    fn spi_transfer(&mut self, write: &[u8], read_len: usize) -> Result<Vec<u8>> {
        self.require_connected()?;
        if write.is_empty() {
            return Ok(vec![0; read_len]);
        }
        let opcode = SpiOpcode::from(write[0]);
        match opcode {
            SpiOpcode::Rdid => {
                let mut out = vec![0u8];
                out.extend_from_slice(&self.jedec);
                out.resize(1 + read_len.max(3), 0);
                Ok(out[1..].to_vec())
            }
            SpiOpcode::Rdsr => Ok(vec![self.status; read_len.max(1)]),
            SpiOpcode::Wren => {
                self.status |= SPI_WEL;
                Ok(Vec::new())
            }
            SpiOpcode::Wrdi => {
                self.status &= !SPI_WEL;
                Ok(Vec::new())
            }
            SpiOpcode::Read => {
                let n = self.addr_bytes as usize;
                if write.len() < 1 + n {
                    return Err(Error::invalid_argument("short READ command"));
                }
                let addr = be_addr(&write[1..1 + n]);
                let tail = &write[1 + n..];
                let len = if !tail.is_empty() { tail.len() } else { read_len };
                let start = addr as usize;
                let end = (start + len).min(self.memory.len());
                if start >= self.memory.len() {
                    return Ok(vec![0xFF; len]);
                }
                let mut out = self.memory[start..end].to_vec();
                out.resize(len, 0xFF);
                Ok(out)
            }
            SpiOpcode::Pp => {
                if self.status & SPI_WEL == 0 {
                    return Err(Error::new(Kind::ProtocolError, "PP without WREN"));
                }
                let n = self.addr_bytes as usize;
                if write.len() < 1 + n {
                    return Err(Error::invalid_argument("short PP command"));
                }
                let addr = be_addr(&write[1..1 + n]) as usize;
                let data = &write[1 + n..];
                let end = (addr + data.len()).min(self.memory.len());
                if addr < self.memory.len() {
                    self.memory[addr..end].copy_from_slice(&data[..end - addr]);
                }
                self.status &= !SPI_WEL;
                Ok(Vec::new())
            }
            SpiOpcode::Se | SpiOpcode::Be => {
                if self.status & SPI_WEL == 0 {
                    return Err(Error::new(Kind::ProtocolError, "erase without WREN"));
                }
                let n = self.addr_bytes as usize;
                if write.len() < 1 + n {
                    return Err(Error::invalid_argument("short erase command"));
                }
                let addr = be_addr(&write[1..1 + n]) as usize;
                let size = self.sector_size.max(1);
                let aligned = (addr / size) * size;
                let end = (aligned + size).min(self.memory.len());
                if aligned < self.memory.len() {
                    self.memory[aligned..end].fill(0xFF);
                }
                self.status &= !SPI_WEL;
                Ok(Vec::new())
            }
            SpiOpcode::Ce => {
                if self.status & SPI_WEL == 0 {
                    return Err(Error::new(Kind::ProtocolError, "chip erase without WREN"));
                }
                self.memory.fill(0xFF);
                self.status &= !SPI_WEL;
                Ok(Vec::new())
            }
            SpiOpcode::Unknown(b) => Err(Error::new(
                Kind::ProtocolError,
                format!("simulated adapter: unknown opcode {b:#04x}"),
            )),
        }
        .map(|mut v| {
            if v.is_empty() && read_len > 0 {
                v = vec![0; read_len];
            }
            v
        })
    }

    fn i2c_init(&mut self, _khz: u32) -> Result<()> {
        self.require_connected()
    }

    fn i2c_deinit(&mut self) -> Result<()> {
        Ok(())
    }

    fn i2c_scan(&mut self) -> Result<Vec<u8>> {
        let banks = (self.memory.len() as u32 / self.i2c_bank_size.max(1)) as u8;
        Ok((0..banks).map(|b| self.i2c_base_dev + b).collect())
    }

    fn i2c_read(&mut self, dev: u8, len: usize) -> Result<Vec<u8>> {
        self.i2c_read_from_address(dev, 0, 2, len)
    }

    fn i2c_write(&mut self, dev: u8, data: &[u8]) -> Result<()> {
        self.i2c_write_to_address(dev, 0, 2, data)
    }

    fn i2c_read_from_address(
        &mut self,
        dev: u8,
        mem_addr: u32,
        _addr_bytes: u8,
        len: usize,
    ) -> Result<Vec<u8>> {
        self.require_connected()?;
        let base = (dev.wrapping_sub(self.i2c_base_dev) as u32) * self.i2c_bank_size + mem_addr;
        let start = base as usize;
        let end = (start + len).min(self.memory.len());
        if start >= self.memory.len() {
            return Ok(vec![0xFF; len]);
        }
        let mut out = self.memory[start..end].to_vec();
        out.resize(len, 0xFF);
        Ok(out)
    }

    fn i2c_write_to_address(
        &mut self,
        dev: u8,
        mem_addr: u32,
        _addr_bytes: u8,
        data: &[u8],
    ) -> Result<()> {
        self.require_connected()?;
        let base = (dev.wrapping_sub(self.i2c_base_dev) as u32) * self.i2c_bank_size + mem_addr;
        let start = base as usize;
        let end = (start + data.len()).min(self.memory.len());
        if start < self.memory.len() {
            self.memory[start..end].copy_from_slice(&data[..end - start]);
        }
        Ok(())
    }

    fn mw_init(&mut self, _address_bits: u8) -> Result<()> {
        self.require_connected()
    }

    fn mw_deinit(&mut self) -> Result<()> {
        Ok(())
    }

    fn mw_enable(&mut self) -> Result<()> {
        self.mw_write_enabled = true;
        Ok(())
    }

    fn mw_disable(&mut self) -> Result<()> {
        self.mw_write_enabled = false;
        Ok(())
    }

    fn mw_read(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len * 2);
        for i in 0..len {
            let word = *self.mw_words.get(addr as usize + i).unwrap_or(&0xFFFF);
            out.extend_from_slice(&word.to_be_bytes());
        }
        Ok(out)
    }

    fn mw_write(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        if !self.mw_write_enabled {
            return Err(Error::new(Kind::ProtocolError, "MicroWire write without EWEN"));
        }
        for (i, chunk) in data.chunks(2).enumerate() {
            let word = u16::from_be_bytes([chunk[0], *chunk.get(1).unwrap_or(&0xFF)]);
            if let Some(slot) = self.mw_words.get_mut(addr as usize + i) {
                *slot = word;
            }
        }
        Ok(())
    }

    fn mw_erase(&mut self, addr: u16) -> Result<()> {
        if !self.mw_write_enabled {
            return Err(Error::new(Kind::ProtocolError, "MicroWire erase without EWEN"));
        }
        if let Some(slot) = self.mw_words.get_mut(addr as usize) {
            *slot = 0xFFFF;
        }
        Ok(())
    }

    fn mw_erase_all(&mut self) -> Result<()> {
        if !self.mw_write_enabled {
            return Err(Error::new(Kind::ProtocolError, "MicroWire erase-all without EWEN"));
        }
        self.mw_words.fill(0xFFFF);
        Ok(())
    }

    fn gpio_set(&mut self, pin: Pin, value: bool) -> Result<()> {
        if let Some(slot) = self.gpio.get_mut(pin as usize) {
            *slot = value;
            Ok(())
        } else {
            Err(Error::invalid_argument(format!("no such pin {pin}")))
        }
    }

    fn gpio_get(&mut self, pin: Pin) -> Result<bool> {
        self.gpio
            .get(pin as usize)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("no such pin {pin}")))
    }
}

fn be_addr(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_is_idempotent_on_close() {
        let mut a = SimulatedAdapter::spi_nor(1024, 256, [0xEF, 0x40, 0x16]);
        a.open(None).unwrap();
        a.close().unwrap();
        assert!(a.close().is_ok());
        assert!(!a.is_connected());
    }

    #[test]
    fn double_open_fails() {
        let mut a = SimulatedAdapter::spi_nor(1024, 256, [0xEF, 0x40, 0x16]);
        a.open(None).unwrap();
        assert!(a.open(None).is_err());
    }

    #[test]
    fn rdid_returns_configured_jedec() {
        let mut a = SimulatedAdapter::spi_nor(1024, 256, [0xEF, 0x40, 0x16]);
        a.open(None).unwrap();
        let resp = a.spi_transfer(&[0x9F], 3).unwrap();
        assert_eq!(resp, vec![0xEF, 0x40, 0x16]);
    }

    #[test]
    fn program_requires_write_enable() {
        let mut a = SimulatedAdapter::spi_nor(1024, 256, [0xEF, 0x40, 0x16]);
        a.open(None).unwrap();
        let mut cmd = vec![0x02, 0, 0, 0];
        cmd.extend_from_slice(&[0xAA; 4]);
        assert!(a.spi_transfer(&cmd, 0).is_err());
    }

    #[test]
    fn erase_resets_sector_to_ff() {
        let mut a = SimulatedAdapter::spi_nor(1024, 256, [0xEF, 0x40, 0x16]);
        a.open(None).unwrap();
        a.spi_transfer(&[0x06], 0).unwrap();
        let mut cmd = vec![0x02, 0, 0, 0];
        cmd.extend_from_slice(&[0x00; 4]);
        a.spi_transfer(&cmd, 0).unwrap();
        a.spi_transfer(&[0x06], 0).unwrap();
        a.spi_transfer(&[0x20, 0, 0, 0], 0).unwrap();
        let read = a.spi_transfer(&[0x03, 0, 0, 0], 4).unwrap();
        assert_eq!(read, vec![0xFF; 4]);
    }
}
