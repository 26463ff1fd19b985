//! I2C EEPROM engine (`spec.md` §4.3, component C3).
//!
//! EEPROMs larger than one device address's addressable range are banked
//! across consecutive 7-bit device addresses (`spec.md` §4.3): address
//! `addr` lives at device `base_device + addr / bank_size`, memory offset
//! `addr % bank_size`, where `bank_size = 2^(8 * address_bytes)`.

use crate::adapter::Adapter;
use crate::chip::ChipDescriptor;
use crate::error::{Error, Kind, Result};
use crate::result::{CancellationToken, Observers, ProgressSink};

const READ_CHUNK: u64 = 64 * 1024;
const IO_RETRY_BACKOFF_MS: [u64; 3] = [1, 5, 25];
const ACK_POLL_TIMEOUT_MS: u32 = 50;

#[derive(Debug, Clone)]
pub struct I2cEngine {
    base_device: u8,
    addr_bytes: u8,
    bank_size: u64,
    page_size: u32,
    size_bytes: u64,
}

impl I2cEngine {
    pub fn new(descriptor: &ChipDescriptor) -> Self {
        let shift = (descriptor.i2c_address_bytes.min(3)) * 8;
        Self {
            base_device: descriptor.i2c_base_device,
            addr_bytes: descriptor.i2c_address_bytes,
            bank_size: 1u64 << shift,
            page_size: descriptor.page_size,
            size_bytes: descriptor.size_bytes,
        }
    }

    fn check_bounds(&self, addr: u64, len: u64) -> Result<()> {
        if addr.checked_add(len).map(|end| end > self.size_bytes).unwrap_or(true) {
            return Err(Error::invalid_argument(format!(
                "range [{addr:#x}, {:#x}) exceeds chip size {:#x}",
                addr + len,
                self.size_bytes
            )));
        }
        Ok(())
    }

    fn device_for(&self, addr: u64) -> (u8, u32) {
        let bank = (addr / self.bank_size) as u8;
        let offset = (addr % self.bank_size) as u32;
        (self.base_device + bank, offset)
    }

    fn with_retry<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut last_err = None;
        for backoff in IO_RETRY_BACKOFF_MS.iter() {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient_io() => {
                    std::thread::sleep(std::time::Duration::from_millis(*backoff));
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::new(Kind::Io, "retry exhausted")))
    }

    /// Polls with a zero-length write until the device acknowledges its own
    /// address again, signalling the internal write cycle has finished.
    fn ack_poll(
        &self,
        adapter: &mut dyn Adapter,
        dev: u8,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut waited = 0u32;
        loop {
            cancel.check()?;
            match adapter.i2c_write_to_address(dev, 0, self.addr_bytes, &[]) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient_io() => {
                    if waited >= ACK_POLL_TIMEOUT_MS {
                        return Err(Error::timeout("EEPROM write cycle did not ack in time"));
                    }
                    adapter.delay(1, cancel)?;
                    waited += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn scan(&self, adapter: &mut dyn Adapter) -> Result<Vec<u8>> {
        adapter.i2c_scan()
    }

    pub fn read(
        &self,
        adapter: &mut dyn Adapter,
        addr: u64,
        len: u64,
        observers: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.check_bounds(addr, len)?;
        let mut out = Vec::with_capacity(len as usize);
        if len == 0 {
            observers.emit_progress("read", 0, 0, "reading");
            return Ok(out);
        }
        let mut done = 0u64;
        while done < len {
            cancel.check()?;
            let cur = addr + done;
            let (dev, mem_addr) = self.device_for(cur);
            let bank_remaining = self.bank_size - mem_addr as u64;
            let chunk_len = bank_remaining.min(len - done).min(READ_CHUNK) as usize;
            let chunk = self.with_retry(|| {
                adapter.i2c_read_from_address(dev, mem_addr, self.addr_bytes, chunk_len)
            })?;
            out.extend_from_slice(&chunk);
            done += chunk_len as u64;
            observers.emit_progress("read", done, len, "reading");
        }
        Ok(out)
    }

    /// Writes `data` at `addr`, each transfer held within one page and one
    /// device address, followed by ACK polling for that page's write cycle.
    pub fn write(
        &self,
        adapter: &mut dyn Adapter,
        addr: u64,
        data: &[u8],
        observers: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.check_bounds(addr, data.len() as u64)?;
        if data.is_empty() {
            observers.emit_progress("write", 0, 0, "writing");
            return Ok(());
        }
        let page = self.page_size.max(1) as u64;
        let total = data.len() as u64;
        let mut done = 0u64;
        while done < total {
            cancel.check()?;
            let cur = addr + done;
            let (dev, mem_addr) = self.device_for(cur);
            let offset_in_page = mem_addr as u64 % page;
            let page_remaining = page - offset_in_page;
            let bank_remaining = self.bank_size - mem_addr as u64;
            let chunk_len = page_remaining.min(bank_remaining).min(total - done) as usize;
            let chunk = &data[done as usize..done as usize + chunk_len];
            self.with_retry(|| adapter.i2c_write_to_address(dev, mem_addr, self.addr_bytes, chunk))?;
            self.ack_poll(adapter, dev, cancel)?;
            done += chunk_len as u64;
            observers.emit_progress("write", done, total, "writing");
        }
        Ok(())
    }

    /// EEPROMs have no erase opcode; "erase" is a write of `0xFF` across the
    /// range (`spec.md` §4.3).
    pub fn erase(
        &self,
        adapter: &mut dyn Adapter,
        addr: u64,
        len: u64,
        observers: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let blank = vec![0xFFu8; len as usize];
        self.write(adapter, addr, &blank, observers, cancel)
    }

    pub fn verify(
        &self,
        adapter: &mut dyn Adapter,
        addr: u64,
        expected: &[u8],
        observers: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let actual = self.read(adapter, addr, expected.len() as u64, observers, cancel)?;
        for (i, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
            if e != a {
                return Err(Error::verify_mismatch(addr + i as u64, e, a));
            }
        }
        Ok(())
    }

    pub fn blank_check(
        &self,
        adapter: &mut dyn Adapter,
        addr: u64,
        len: u64,
        observers: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let data = self.read(adapter, addr, len, observers, cancel)?;
        Ok(data.iter().all(|&b| b == 0xFF))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SimulatedAdapter;
    use crate::chip::{ChipDescriptor, Manufacturer};
    use crate::memory_id::MemoryId;
    use crate::protocol::Protocol;

    fn engine_and_adapter() -> (I2cEngine, SimulatedAdapter) {
        let descriptor = ChipDescriptor::new(
            "24c256",
            "24C256",
            Manufacturer::MicrochipAtmel,
            Protocol::I2c,
            32 * 1024,
            64,
            64,
            32 * 1024,
            MemoryId::BLANK,
        )
        .unwrap()
        .with_i2c_address(0x50, 2);
        let mut adapter = SimulatedAdapter::i2c_eeprom(0x50, 1, 32 * 1024);
        adapter.open(None).unwrap();
        (I2cEngine::new(&descriptor), adapter)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (engine, mut adapter) = engine_and_adapter();
        let cancel = CancellationToken::new();
        let observers = Observers::new();
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        engine.write(&mut adapter, 10, &data, &observers, &cancel).unwrap();
        let read = engine.read(&mut adapter, 10, 200, &observers, &cancel).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn erase_writes_blank_pattern() {
        let (engine, mut adapter) = engine_and_adapter();
        let cancel = CancellationToken::new();
        let observers = Observers::new();
        let data = vec![0x55u8; 64];
        engine.write(&mut adapter, 0, &data, &observers, &cancel).unwrap();
        engine.erase(&mut adapter, 0, 64, &observers, &cancel).unwrap();
        assert!(engine.blank_check(&mut adapter, 0, 64, &observers, &cancel).unwrap());
    }

    #[test]
    fn verify_reports_mismatch_offset() {
        let (engine, mut adapter) = engine_and_adapter();
        let cancel = CancellationToken::new();
        let observers = Observers::new();
        let data = vec![0x11u8; 32];
        engine.write(&mut adapter, 0, &data, &observers, &cancel).unwrap();
        let mut expected = data.clone();
        expected[3] = 0x22;
        let err = engine
            .verify(&mut adapter, 0, &expected, &observers, &cancel)
            .unwrap_err();
        assert_eq!(err.kind, Kind::VerifyMismatch);
        assert_eq!(err.verify.unwrap().offset, 3);
    }

    #[test]
    fn zero_length_read_emits_one_complete_event() {
        let (engine, mut adapter) = engine_and_adapter();
        let cancel = CancellationToken::new();
        let observers = Observers::new();
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = events.clone();
        observers.subscribe_progress(move |p| captured.lock().unwrap().push((p.current_bytes, p.total_bytes)));
        let out = engine.read(&mut adapter, 0, 0, &observers, &cancel).unwrap();
        assert!(out.is_empty());
        assert_eq!(*events.lock().unwrap(), vec![(0, 0)]);
    }

    #[test]
    fn zero_length_write_emits_one_complete_event() {
        let (engine, mut adapter) = engine_and_adapter();
        let cancel = CancellationToken::new();
        let observers = Observers::new();
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = events.clone();
        observers.subscribe_progress(move |p| captured.lock().unwrap().push((p.current_bytes, p.total_bytes)));
        engine.write(&mut adapter, 0, &[], &observers, &cancel).unwrap();
        assert_eq!(*events.lock().unwrap(), vec![(0, 0)]);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let (engine, mut adapter) = engine_and_adapter();
        let cancel = CancellationToken::new();
        let observers = Observers::new();
        let err = engine
            .read(&mut adapter, 32 * 1024 - 4, 8, &observers, &cancel)
            .unwrap_err();
        assert_eq!(err.kind, Kind::InvalidArgument);
    }
}
