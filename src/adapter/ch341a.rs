//! A production `Adapter` for the CH341A-class USB SPI/I2C/GPIO bridge.
//!
//! Structured the way the CH347 USB programmer reference driver in this
//! domain is structured: vendor/product id constants, a small command-byte
//! wire protocol, bulk transfers chunked to a fixed packet size, and a
//! `Drop` impl that releases the claimed interface. The vendor-DLL ABI
//! described in `spec.md` §6 is illustrative; this binds to the device
//! directly over USB bulk transfers via `rusb` instead of loading a vendor
//! dynamic library, which is the idiomatic Rust way to speak to a libusb
//! device and needs no out-of-tree driver.
//!
//! CH341A exposes no hardware MicroWire sequencer: the `mw_*` primitives
//! report `UnsupportedOperation` here, and
//! [`crate::protocol::microwire::MicrowireEngine`] instead bit-bangs the
//! protocol directly over `gpio_set`/`gpio_get`/`delay`, per `spec.md`
//! §4.1's "unsupported primitives... return `Err` rather than aborting".

use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use crate::adapter::{Adapter, AdapterKind, Pin};
use crate::capabilities::{HardwareCapabilities, SpeedTier};
use crate::error::{Error, Kind, Result};

pub const CH341A_VID: u16 = 0x1A86;
pub const CH341A_PID: u16 = 0x5512;

const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x82;
const USB_TIMEOUT: Duration = Duration::from_millis(1000);
const PACKET_SIZE: usize = 32;

// Command bytes for the CH341A "stream" protocol, as used by the common
// Linux flashers for this chip family.
const CMD_UIO_STREAM: u8 = 0xAB;
const CMD_I2C_STREAM: u8 = 0xAA;
const CMD_SPI_STREAM: u8 = 0xA8;

const I2C_STREAM_STA: u8 = 0x74;
const I2C_STREAM_STO: u8 = 0x75;
const I2C_STREAM_OUT: u8 = 0x80;
const I2C_STREAM_IN: u8 = 0xC0;
const I2C_STREAM_END: u8 = 0x00;

pub struct Ch341aAdapter {
    handle: Option<DeviceHandle<Context>>,
    interface: u8,
    spi_cs_pin: Pin,
    gpio_shadow: u8,
}

impl Default for Ch341aAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Ch341aAdapter {
    pub fn new() -> Self {
        Self {
            handle: None,
            interface: 0,
            spi_cs_pin: 0,
            gpio_shadow: 0xFF,
        }
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::new(Kind::NotConnected, "CH341A adapter not open"))
    }

    fn write_bulk(&self, data: &[u8]) -> Result<usize> {
        Ok(self.handle()?.write_bulk(EP_OUT, data, USB_TIMEOUT)?)
    }

    fn read_bulk(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.handle()?.read_bulk(EP_IN, buf, USB_TIMEOUT)?)
    }

    fn uio_write_gpio(&mut self) -> Result<()> {
        let cmd = [CMD_UIO_STREAM, 0x00 | self.gpio_shadow, 0x20];
        self.write_bulk(&cmd)?;
        Ok(())
    }

    fn spi_assert_cs(&mut self, assert: bool) -> Result<()> {
        if assert {
            self.gpio_shadow &= !(1 << self.spi_cs_pin);
        } else {
            self.gpio_shadow |= 1 << self.spi_cs_pin;
        }
        self.uio_write_gpio()
    }

    /// Shifts `data` out in `PACKET_SIZE`-sized packets. Every byte
    /// shifted out also shifts one byte in (full-duplex SPI), so the
    /// response to a write-only packet is discarded here.
    fn spi_shift_write(&self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(PACKET_SIZE - 1) {
            let mut packet = Vec::with_capacity(chunk.len() + 1);
            packet.push(CMD_SPI_STREAM);
            packet.extend_from_slice(chunk);
            self.write_bulk(&packet)?;
            let mut resp = vec![0u8; chunk.len()];
            self.read_bulk(&mut resp)?;
        }
        Ok(())
    }

    /// Clocks in `len` bytes, shifting out `0xFF` filler (MISO-only read).
    fn spi_shift_read(&self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let chunk_len = remaining.min(PACKET_SIZE - 1);
            let mut packet = vec![CMD_SPI_STREAM];
            packet.extend(std::iter::repeat(0xFFu8).take(chunk_len));
            self.write_bulk(&packet)?;
            let mut resp = vec![0u8; chunk_len];
            let n = self.read_bulk(&mut resp)?;
            resp.truncate(n);
            resp.resize(chunk_len, 0xFF);
            out.extend_from_slice(&resp);
            remaining -= chunk_len;
        }
        Ok(out)
    }
}

impl Adapter for Ch341aAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Ch341a
    }

    fn enumerate(&self) -> Result<Vec<String>> {
        let context = Context::new()?;
        let mut found = Vec::new();
        for (index, device) in context.devices()?.iter().enumerate() {
            if let Ok(desc) = device.device_descriptor() {
                if desc.vendor_id() == CH341A_VID && desc.product_id() == CH341A_PID {
                    found.push(format!("ch341a:{index}"));
                }
            }
        }
        Ok(found)
    }

    fn open(&mut self, path: Option<&str>) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::new(Kind::Busy, "adapter already open"));
        }
        let context = Context::new()?;
        let wanted_index: usize = path
            .and_then(|p| p.rsplit(':').next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let device_list = context.devices()?;
        let mut candidates = device_list.iter().filter(|d| {
            d.device_descriptor()
                .map(|desc| desc.vendor_id() == CH341A_VID && desc.product_id() == CH341A_PID)
                .unwrap_or(false)
        });

        let device = candidates
            .nth(wanted_index)
            .ok_or_else(|| Error::new(Kind::NotConnected, "no CH341A device found"))?;

        let handle = device.open()?;
        let interface = 0;
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(interface).unwrap_or(false) {
                let _ = handle.detach_kernel_driver(interface);
            }
        }
        handle.claim_interface(interface)?;

        self.handle = Some(handle);
        self.interface = interface;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.release_interface(self.interface);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    fn firmware_version(&self) -> Result<String> {
        let device = self.handle()?.device();
        let desc = device.device_descriptor()?;
        Ok(format!(
            "{}.{}.{}",
            desc.device_version().major(),
            desc.device_version().minor(),
            desc.device_version().sub_minor()
        ))
    }

    fn capabilities(&self) -> HardwareCapabilities {
        HardwareCapabilities::SPI
            | HardwareCapabilities::I2C
            | HardwareCapabilities::GPIO
            | HardwareCapabilities::MICROWIRE
    }

    fn set_speed(&mut self, _speed: SpeedTier) -> Result<()> {
        // Advisory only; the CH341A's SPI clock divisor is fixed by the
        // `spi_init` configuration packet, which this driver does not yet
        // expose per-speed-tier tuning for.
        Ok(())
    }

    fn spi_init(&mut self) -> Result<()> {
        self.handle()?;
        self.gpio_shadow = 0xFF;
        self.uio_write_gpio()
    }

    fn spi_deinit(&mut self) -> Result<()> {
        self.spi_assert_cs(false)
    }

    fn spi_send_cmd(&mut self, cmd: u8) -> Result<()> {
        self.spi_transfer(&[cmd], 0).map(|_| ())
    }

    fn spi_read(&mut self, len: usize) -> Result<Vec<u8>> {
        self.spi_transfer(&[], len)
    }

    fn spi_write(&mut self, data: &[u8]) -> Result<()> {
        self.spi_transfer(data, 0).map(|_| ())
    }

    /// A single chip-select-asserted transaction: shift `write` out, then
    /// clock in `read_len` bytes, per `spec.md` §4.1.
    fn spi_transfer(&mut self, write: &[u8], read_len: usize) -> Result<Vec<u8>> {
        self.spi_assert_cs(true)?;
        let result = (|| {
            if !write.is_empty() {
                self.spi_shift_write(write)?;
            }
            if read_len > 0 {
                self.spi_shift_read(read_len)
            } else {
                Ok(Vec::new())
            }
        })();
        self.spi_assert_cs(false)?;
        result
    }

    fn i2c_init(&mut self, _khz: u32) -> Result<()> {
        self.handle()?;
        Ok(())
    }

    fn i2c_deinit(&mut self) -> Result<()> {
        Ok(())
    }

    fn i2c_scan(&mut self) -> Result<Vec<u8>> {
        let mut found = Vec::new();
        for dev in 0x03u8..0x78 {
            let cmd = [
                CMD_I2C_STREAM,
                I2C_STREAM_STA,
                I2C_STREAM_OUT,
                dev << 1,
                I2C_STREAM_STO,
                I2C_STREAM_END,
            ];
            if self.write_bulk(&cmd).is_ok() {
                let mut resp = [0u8; 1];
                if self.read_bulk(&mut resp).is_ok() && resp[0] == 0 {
                    found.push(dev);
                }
            }
        }
        Ok(found)
    }

    fn i2c_read(&mut self, dev: u8, len: usize) -> Result<Vec<u8>> {
        let mut cmd = vec![
            CMD_I2C_STREAM,
            I2C_STREAM_STA,
            I2C_STREAM_OUT,
            (dev << 1) | 1,
        ];
        cmd.push(I2C_STREAM_IN | (len as u8));
        cmd.push(I2C_STREAM_STO);
        cmd.push(I2C_STREAM_END);
        self.write_bulk(&cmd)?;
        let mut resp = vec![0u8; len];
        let n = self.read_bulk(&mut resp)?;
        resp.truncate(n);
        resp.resize(len, 0);
        Ok(resp)
    }

    fn i2c_write(&mut self, dev: u8, data: &[u8]) -> Result<()> {
        let mut cmd = vec![CMD_I2C_STREAM, I2C_STREAM_STA, I2C_STREAM_OUT, dev << 1];
        cmd.push(I2C_STREAM_OUT | (data.len() as u8));
        cmd.extend_from_slice(data);
        cmd.push(I2C_STREAM_STO);
        cmd.push(I2C_STREAM_END);
        self.write_bulk(&cmd)?;
        let mut ack = [0u8; 1];
        self.read_bulk(&mut ack)?;
        Ok(())
    }

    fn i2c_read_from_address(
        &mut self,
        dev: u8,
        mem_addr: u32,
        addr_bytes: u8,
        len: usize,
    ) -> Result<Vec<u8>> {
        let addr_bytes_be = crate::adapter::address_bytes_be(mem_addr, addr_bytes);
        self.i2c_write(dev, &addr_bytes_be)?;
        self.i2c_read(dev, len)
    }

    fn i2c_write_to_address(
        &mut self,
        dev: u8,
        mem_addr: u32,
        addr_bytes: u8,
        data: &[u8],
    ) -> Result<()> {
        let mut payload = crate::adapter::address_bytes_be(mem_addr, addr_bytes);
        payload.extend_from_slice(data);
        self.i2c_write(dev, &payload)
    }

    // No hardware MicroWire sequencer: all six primitives are left at the
    // trait's default `UnsupportedOperation`. The MicroWire engine falls
    // back to bit-banging `gpio_set`/`gpio_get`/`delay` directly, which
    // this adapter does implement.

    fn gpio_set(&mut self, pin: Pin, value: bool) -> Result<()> {
        if pin > 7 {
            return Err(Error::invalid_argument(format!("no such pin {pin}")));
        }
        if value {
            self.gpio_shadow |= 1 << pin;
        } else {
            self.gpio_shadow &= !(1 << pin);
        }
        self.uio_write_gpio()
    }

    fn gpio_get(&mut self, pin: Pin) -> Result<bool> {
        if pin > 7 {
            return Err(Error::invalid_argument(format!("no such pin {pin}")));
        }
        let cmd = [CMD_UIO_STREAM, 0x00, 0x20];
        self.write_bulk(&cmd)?;
        let mut resp = [0u8; 1];
        self.read_bulk(&mut resp)?;
        Ok(resp[0] & (1 << pin) != 0)
    }
}

impl Drop for Ch341aAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.release_interface(self.interface);
        }
    }
}
