//! Adapter driver (`spec.md` §4.1, component C1).
//!
//! The `Adapter` trait is the hardware abstraction boundary: everything
//! above it (protocol engines, orchestrator) talks only in terms of these
//! primitives. Concrete adapters are picked at runtime, so `Adapter` is
//! used as a trait object at the `Session` boundary (`spec.md` §9).

pub mod ch341a;
pub mod simulated;

use crate::capabilities::{AddressByteRange, HardwareCapabilities, SpeedTier};
use crate::error::{Error, Kind, Result};

pub use ch341a::Ch341aAdapter;
pub use simulated::SimulatedAdapter;

/// Which family of adapter is being driven. Exposed for enumeration and for
/// the CLI's `--adapter` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Ch341a,
    Simulated,
}

/// A GPIO pin identifier. Concrete adapters map this to whatever numbering
/// their hardware uses.
pub type Pin = u8;

/// The hardware abstraction layer. One adapter instance owns at most one
/// open USB handle.
///
/// Unsupported primitives return `Err(Kind::UnsupportedOperation)` rather
/// than panicking or aborting the process (`spec.md` §4.1).
pub trait Adapter: Send {
    fn kind(&self) -> AdapterKind;

    /// Lists currently attached devices of this adapter's kind. Does not
    /// open any of them. May be empty. Idempotent.
    fn enumerate(&self) -> Result<Vec<String>>;

    /// Binds the process to one device. `path` selects a specific device;
    /// `None` selects index 0.
    fn open(&mut self, path: Option<&str>) -> Result<()>;

    /// Releases the device. Idempotent: closing an already-closed adapter
    /// returns `Ok` (`spec.md` §8, property 2).
    fn close(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn firmware_version(&self) -> Result<String>;

    fn capabilities(&self) -> HardwareCapabilities;

    fn address_byte_range(&self) -> AddressByteRange {
        AddressByteRange::THREE_OR_FOUR
    }

    fn set_speed(&mut self, speed: SpeedTier) -> Result<()>;

    /// A cancellable sleep. Adapters with no hardware notion of "sleep"
    /// (e.g. `SimulatedAdapter`) still honor cancellation by polling the
    /// token in short slices.
    fn delay(&self, ms: u32, cancel: &crate::result::CancellationToken) -> Result<()> {
        let mut remaining = ms;
        const SLICE_MS: u32 = 5;
        while remaining > 0 {
            cancel.check()?;
            let slice = remaining.min(SLICE_MS);
            std::thread::sleep(std::time::Duration::from_millis(slice as u64));
            remaining -= slice;
        }
        Ok(())
    }

    // ---- SPI primitives ----

    fn spi_init(&mut self) -> Result<()> {
        Err(Error::unsupported("SPI"))
    }

    fn spi_deinit(&mut self) -> Result<()> {
        Err(Error::unsupported("SPI"))
    }

    fn spi_send_cmd(&mut self, _cmd: u8) -> Result<()> {
        Err(Error::unsupported("SPI"))
    }

    fn spi_read(&mut self, _len: usize) -> Result<Vec<u8>> {
        Err(Error::unsupported("SPI"))
    }

    fn spi_write(&mut self, _data: &[u8]) -> Result<()> {
        Err(Error::unsupported("SPI"))
    }

    /// A single chip-select-asserted transaction: shifts out `write`, then
    /// clocks in `read_len` bytes, all while holding CS low.
    fn spi_transfer(&mut self, write: &[u8], read_len: usize) -> Result<Vec<u8>> {
        let _ = (write, read_len);
        Err(Error::unsupported("SPI"))
    }

    // ---- I2C primitives ----

    fn i2c_init(&mut self, _khz: u32) -> Result<()> {
        Err(Error::unsupported("I2C"))
    }

    fn i2c_deinit(&mut self) -> Result<()> {
        Err(Error::unsupported("I2C"))
    }

    fn i2c_scan(&mut self) -> Result<Vec<u8>> {
        Err(Error::unsupported("I2C"))
    }

    fn i2c_read(&mut self, _dev: u8, _len: usize) -> Result<Vec<u8>> {
        Err(Error::unsupported("I2C"))
    }

    fn i2c_write(&mut self, _dev: u8, _data: &[u8]) -> Result<()> {
        Err(Error::unsupported("I2C"))
    }

    fn i2c_read_from_address(
        &mut self,
        _dev: u8,
        _mem_addr: u32,
        _addr_bytes: u8,
        _len: usize,
    ) -> Result<Vec<u8>> {
        Err(Error::unsupported("I2C"))
    }

    fn i2c_write_to_address(
        &mut self,
        _dev: u8,
        _mem_addr: u32,
        _addr_bytes: u8,
        _data: &[u8],
    ) -> Result<()> {
        Err(Error::unsupported("I2C"))
    }

    // ---- MicroWire primitives ----

    fn mw_init(&mut self, _address_bits: u8) -> Result<()> {
        Err(Error::unsupported("MicroWire"))
    }

    fn mw_deinit(&mut self) -> Result<()> {
        Err(Error::unsupported("MicroWire"))
    }

    fn mw_enable(&mut self) -> Result<()> {
        Err(Error::unsupported("MicroWire"))
    }

    fn mw_disable(&mut self) -> Result<()> {
        Err(Error::unsupported("MicroWire"))
    }

    fn mw_read(&mut self, _addr: u16, _len: usize) -> Result<Vec<u8>> {
        Err(Error::unsupported("MicroWire"))
    }

    fn mw_write(&mut self, _addr: u16, _data: &[u8]) -> Result<()> {
        Err(Error::unsupported("MicroWire"))
    }

    fn mw_erase(&mut self, _addr: u16) -> Result<()> {
        Err(Error::unsupported("MicroWire"))
    }

    fn mw_erase_all(&mut self) -> Result<()> {
        Err(Error::unsupported("MicroWire"))
    }

    // ---- GPIO ----

    fn gpio_set(&mut self, _pin: Pin, _value: bool) -> Result<()> {
        Err(Error::unsupported("GPIO"))
    }

    fn gpio_get(&mut self, _pin: Pin) -> Result<bool> {
        Err(Error::unsupported("GPIO"))
    }
}

/// Marshals an address big-endian, MSB first, into `addr_bytes` bytes.
/// `spec.md` §8, property 6: wire byte `i` equals
/// `addr >> ((n-1-i)*8) & 0xFF`.
pub fn address_bytes_be(addr: u32, addr_bytes: u8) -> Vec<u8> {
    let n = addr_bytes as u32;
    (0..n)
        .map(|i| (addr >> ((n - 1 - i) * 8)) as u8)
        .collect()
}

/// Default-implemented helper: `spi_read_with_address`, built only in terms
/// of `spi_transfer` (`spec.md` §4.1). Free function rather than a trait
/// default method because it needs to build the command buffer and borrow
/// the adapter mutably across the call.
pub fn spi_read_with_address(
    adapter: &mut dyn Adapter,
    cmd: u8,
    addr: u32,
    addr_bytes: u8,
    len: usize,
) -> Result<Vec<u8>> {
    if !adapter.address_byte_range().contains(addr_bytes) {
        return Err(Error::new(
            Kind::InvalidArgument,
            format!("unsupported address width {addr_bytes}"),
        ));
    }
    let mut write = Vec::with_capacity(1 + addr_bytes as usize);
    write.push(cmd);
    write.extend(address_bytes_be(addr, addr_bytes));
    adapter.spi_transfer(&write, len)
}

/// Default-implemented helper: `spi_write_with_address`.
pub fn spi_write_with_address(
    adapter: &mut dyn Adapter,
    cmd: u8,
    addr: u32,
    addr_bytes: u8,
    data: &[u8],
) -> Result<()> {
    if !adapter.address_byte_range().contains(addr_bytes) {
        return Err(Error::new(
            Kind::InvalidArgument,
            format!("unsupported address width {addr_bytes}"),
        ));
    }
    let mut write = Vec::with_capacity(1 + addr_bytes as usize + data.len());
    write.push(cmd);
    write.extend(address_bytes_be(addr, addr_bytes));
    write.extend_from_slice(data);
    adapter.spi_transfer(&write, 0).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_address_encoding_3_bytes() {
        let bytes = address_bytes_be(0x00ABCDEF, 3);
        assert_eq!(bytes, vec![0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn big_endian_address_encoding_4_bytes() {
        let bytes = address_bytes_be(0xAABBCCDD, 4);
        assert_eq!(bytes, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn every_index_matches_shift_formula() {
        let addr: u32 = 0x0102_0304;
        for &n in &[3u8, 4u8] {
            let bytes = address_bytes_be(addr, n);
            for i in 0..n as u32 {
                let expected = (addr >> ((n as u32 - 1 - i) * 8)) as u8;
                assert_eq!(bytes[i as usize], expected);
            }
        }
    }
}
