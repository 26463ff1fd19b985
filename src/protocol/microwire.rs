//! MicroWire (93Cxx-family) EEPROM engine (`spec.md` §4.4, component C4).
//!
//! The CH341A exposes no hardware MicroWire sequencer, so every primitive
//! here first tries the adapter's native `mw_*` call (useful for
//! [`crate::adapter::SimulatedAdapter`] and any future adapter that does
//! have one) and falls back to bit-banging the protocol over
//! `gpio_set`/`gpio_get`/`delay` when the adapter reports
//! `Kind::UnsupportedOperation`.
//!
//! Instruction format, MSB first: one start bit, a 2-bit opcode, then an
//! `address_bits`-wide address (6..=12 bits, chip-dependent). Opcode `00`
//! is the "extended" group, disambiguated by the top two address bits:
//! `11`=EWEN, `00`=EWDS, `10`=ERAL, `01`=WRAL.

use crate::adapter::{Adapter, Pin};
use crate::chip::ChipDescriptor;
use crate::error::{Error, Kind, Result};
use crate::result::{CancellationToken, Observers, ProgressSink};

const OP_READ: u32 = 0b10;
const OP_WRITE: u32 = 0b01;
const OP_ERASE: u32 = 0b11;
const OP_EXTENDED: u32 = 0b00;

const EXT_EWDS: u32 = 0b00;
const EXT_WRAL: u32 = 0b01;
const EXT_ERAL: u32 = 0b10;
const EXT_EWEN: u32 = 0b11;

/// Inferred from common 93Cxx datasheets; not validated against real
/// hardware. See `spec.md` §9 open question on MicroWire busy timing.
const WRITE_TIMEOUT_MS: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct MicrowirePins {
    pub cs: Pin,
    pub clk: Pin,
    pub di: Pin,
    pub do_: Pin,
}

impl Default for MicrowirePins {
    fn default() -> Self {
        Self { cs: 0, clk: 1, di: 2, do_: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct MicrowireEngine {
    address_bits: u8,
    word_count: u64,
    pins: MicrowirePins,
}

impl MicrowireEngine {
    pub fn new(descriptor: &ChipDescriptor) -> Result<Self> {
        let address_bits = descriptor
            .address_bits
            .ok_or_else(|| Error::invalid_argument("MicroWire descriptor missing address_bits"))?;
        Ok(Self {
            address_bits,
            word_count: 1u64 << address_bits,
            pins: MicrowirePins::default(),
        })
    }

    pub fn with_pins(mut self, pins: MicrowirePins) -> Self {
        self.pins = pins;
        self
    }

    fn check_word_range(&self, addr: u16, words: u64) -> Result<()> {
        if addr as u64 + words > self.word_count {
            return Err(Error::invalid_argument(format!(
                "word range [{addr}, {}) exceeds {}-bit address space ({} words)",
                addr as u64 + words,
                self.address_bits,
                self.word_count
            )));
        }
        Ok(())
    }

    fn is_unsupported(e: &Error) -> bool {
        e.kind == Kind::UnsupportedOperation
    }

    fn clock_pulse(&self, adapter: &mut dyn Adapter, cancel: &CancellationToken) -> Result<()> {
        adapter.gpio_set(self.pins.clk, true)?;
        adapter.delay(1, cancel)?;
        adapter.gpio_set(self.pins.clk, false)?;
        adapter.delay(1, cancel)?;
        Ok(())
    }

    fn send_bits(
        &self,
        adapter: &mut dyn Adapter,
        value: u32,
        nbits: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for i in (0..nbits).rev() {
            let bit = (value >> i) & 1 != 0;
            adapter.gpio_set(self.pins.di, bit)?;
            self.clock_pulse(adapter, cancel)?;
        }
        Ok(())
    }

    fn recv_bits(
        &self,
        adapter: &mut dyn Adapter,
        nbits: u32,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..nbits {
            self.clock_pulse(adapter, cancel)?;
            let bit = adapter.gpio_get(self.pins.do_)?;
            value = (value << 1) | (bit as u32);
        }
        Ok(value)
    }

    fn start_instruction(
        &self,
        adapter: &mut dyn Adapter,
        opcode: u32,
        address: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        adapter.gpio_set(self.pins.cs, true)?;
        self.send_bits(adapter, 1, 1, cancel)?;
        self.send_bits(adapter, opcode, 2, cancel)?;
        self.send_bits(adapter, address, self.address_bits as u32, cancel)?;
        Ok(())
    }

    fn end_instruction(&self, adapter: &mut dyn Adapter) -> Result<()> {
        adapter.gpio_set(self.pins.cs, false)
    }

    /// Polls `DO` for the ready level that follows a WRITE/ERASE/WRAL/ERAL
    /// cycle, bounded by [`WRITE_TIMEOUT_MS`].
    fn wait_ready_bitbanged(
        &self,
        adapter: &mut dyn Adapter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut waited = 0u32;
        loop {
            cancel.check()?;
            if adapter.gpio_get(self.pins.do_)? {
                return Ok(());
            }
            if waited >= WRITE_TIMEOUT_MS {
                return Err(Error::timeout("MicroWire write cycle did not complete"));
            }
            adapter.delay(1, cancel)?;
            waited += 1;
        }
    }

    fn bitbang_enable(&self, adapter: &mut dyn Adapter, enable: bool, cancel: &CancellationToken) -> Result<()> {
        let ext = if enable { EXT_EWEN } else { EXT_EWDS };
        self.start_instruction(adapter, OP_EXTENDED, ext << (self.address_bits as u32 - 2), cancel)?;
        self.end_instruction(adapter)
    }

    pub fn enable_erase_write(
        &self,
        adapter: &mut dyn Adapter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match adapter.mw_enable() {
            Err(e) if Self::is_unsupported(&e) => self.bitbang_enable(adapter, true, cancel),
            other => other,
        }
    }

    pub fn disable_erase_write(
        &self,
        adapter: &mut dyn Adapter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match adapter.mw_disable() {
            Err(e) if Self::is_unsupported(&e) => self.bitbang_enable(adapter, false, cancel),
            other => other,
        }
    }

    pub fn read(
        &self,
        adapter: &mut dyn Adapter,
        addr: u16,
        word_count: u64,
        observers: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.check_word_range(addr, word_count)?;
        if word_count == 0 {
            observers.emit_progress("read", 0, 0, "reading");
            return Ok(Vec::new());
        }
        match adapter.mw_read(addr, word_count as usize) {
            Err(e) if Self::is_unsupported(&e) => {
                let mut out = Vec::with_capacity(word_count as usize * 2);
                for i in 0..word_count {
                    cancel.check()?;
                    self.start_instruction(adapter, OP_READ, addr as u32 + i as u32, cancel)?;
                    let word = self.recv_bits(adapter, 16, cancel)?;
                    self.end_instruction(adapter)?;
                    out.extend_from_slice(&(word as u16).to_be_bytes());
                    observers.emit_progress("read", (i + 1) * 2, word_count * 2, "reading");
                }
                Ok(out)
            }
            Ok(bytes) => {
                observers.emit_progress("read", bytes.len() as u64, bytes.len() as u64, "reading");
                Ok(bytes)
            }
            Err(e) => Err(e),
        }
    }

    /// `data` must hold a whole number of 16-bit words (`spec.md` §4.4):
    /// MicroWire has no partial-word write.
    pub fn write(
        &self,
        adapter: &mut dyn Adapter,
        addr: u16,
        data: &[u8],
        observers: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if data.len() % 2 != 0 {
            return Err(Error::invalid_argument(
                "MicroWire write requires an even number of bytes",
            ));
        }
        let word_count = (data.len() / 2) as u64;
        self.check_word_range(addr, word_count)?;
        if data.is_empty() {
            observers.emit_progress("write", 0, 0, "writing");
            return Ok(());
        }

        match adapter.mw_write(addr, data) {
            Err(e) if Self::is_unsupported(&e) => {
                self.enable_erase_write(adapter, cancel)?;
                for (i, chunk) in data.chunks(2).enumerate() {
                    cancel.check()?;
                    let word = u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
                    self.start_instruction(adapter, OP_WRITE, addr as u32 + i as u32, cancel)?;
                    self.send_bits(adapter, word, 16, cancel)?;
                    self.end_instruction(adapter)?;
                    self.wait_ready_bitbanged(adapter, cancel)?;
                    observers.emit_progress(
                        "write",
                        (i as u64 + 1) * 2,
                        word_count * 2,
                        "writing",
                    );
                }
                self.disable_erase_write(adapter, cancel)
            }
            Ok(()) => {
                observers.emit_progress("write", data.len() as u64, data.len() as u64, "writing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn erase(
        &self,
        adapter: &mut dyn Adapter,
        addr: u16,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.check_word_range(addr, 1)?;
        match adapter.mw_erase(addr) {
            Err(e) if Self::is_unsupported(&e) => {
                self.enable_erase_write(adapter, cancel)?;
                self.start_instruction(adapter, OP_ERASE, addr as u32, cancel)?;
                self.end_instruction(adapter)?;
                self.wait_ready_bitbanged(adapter, cancel)?;
                self.disable_erase_write(adapter, cancel)
            }
            other => other,
        }
    }

    pub fn erase_all(&self, adapter: &mut dyn Adapter, cancel: &CancellationToken) -> Result<()> {
        match adapter.mw_erase_all() {
            Err(e) if Self::is_unsupported(&e) => {
                self.enable_erase_write(adapter, cancel)?;
                self.start_instruction(
                    adapter,
                    OP_EXTENDED,
                    EXT_ERAL << (self.address_bits as u32 - 2),
                    cancel,
                )?;
                self.end_instruction(adapter)?;
                self.wait_ready_bitbanged(adapter, cancel)?;
                self.disable_erase_write(adapter, cancel)
            }
            other => other,
        }
    }

    /// Writes the same 16-bit `word` to every address (WRAL). No adapter in
    /// this crate implements a native fast path for it, so it always
    /// bit-bangs.
    pub fn write_all(
        &self,
        adapter: &mut dyn Adapter,
        word: u16,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.enable_erase_write(adapter, cancel)?;
        self.start_instruction(
            adapter,
            OP_EXTENDED,
            (EXT_WRAL << (self.address_bits as u32 - 2)) as u32,
            cancel,
        )?;
        self.send_bits(adapter, word as u32, 16, cancel)?;
        self.end_instruction(adapter)?;
        self.wait_ready_bitbanged(adapter, cancel)?;
        self.disable_erase_write(adapter, cancel)
    }

    pub fn verify(
        &self,
        adapter: &mut dyn Adapter,
        addr: u16,
        expected: &[u8],
        observers: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let word_count = (expected.len() as u64 + 1) / 2;
        let actual = self.read(adapter, addr, word_count, observers, cancel)?;
        for (i, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
            if e != a {
                return Err(Error::verify_mismatch(addr as u64 + i as u64, e, a));
            }
        }
        Ok(())
    }

    pub fn blank_check(
        &self,
        adapter: &mut dyn Adapter,
        addr: u16,
        word_count: u64,
        observers: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let data = self.read(adapter, addr, word_count, observers, cancel)?;
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

    fn engine_and_adapter() -> (MicrowireEngine, SimulatedAdapter) {
        let descriptor = ChipDescriptor::new(
            "93c46",
            "93C46",
            Manufacturer::MicrochipAtmel,
            Protocol::MicroWire,
            128,
            2,
            2,
            128,
            MemoryId::BLANK,
        )
        .unwrap()
        .with_address_bits(6)
        .unwrap();
        let mut adapter = SimulatedAdapter::microwire(64);
        adapter.open(None).unwrap();
        (MicrowireEngine::new(&descriptor).unwrap(), adapter)
    }

    #[test]
    fn write_then_read_round_trips_via_native_path() {
        let (engine, mut adapter) = engine_and_adapter();
        let cancel = CancellationToken::new();
        let observers = Observers::new();
        engine.enable_erase_write(&mut adapter, &cancel).unwrap();
        let data = [0xAB, 0xCD, 0x12, 0x34];
        engine.write(&mut adapter, 4, &data, &observers, &cancel).unwrap();
        let read = engine.read(&mut adapter, 4, 2, &observers, &cancel).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn write_rejects_odd_length() {
        let (engine, mut adapter) = engine_and_adapter();
        let cancel = CancellationToken::new();
        let observers = Observers::new();
        let err = engine
            .write(&mut adapter, 0, &[0xAA, 0xBB, 0xCC], &observers, &cancel)
            .unwrap_err();
        assert_eq!(err.kind, Kind::InvalidArgument);
    }

    #[test]
    fn out_of_range_word_address_rejected() {
        let (engine, mut adapter) = engine_and_adapter();
        let cancel = CancellationToken::new();
        let observers = Observers::new();
        let err = engine
            .read(&mut adapter, 63, 2, &observers, &cancel)
            .unwrap_err();
        assert_eq!(err.kind, Kind::InvalidArgument);
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
    fn erase_all_resets_to_blank() {
        let (engine, mut adapter) = engine_and_adapter();
        let cancel = CancellationToken::new();
        let observers = Observers::new();
        engine.enable_erase_write(&mut adapter, &cancel).unwrap();
        engine.write(&mut adapter, 0, &[0x11, 0x22], &observers, &cancel).unwrap();
        engine.enable_erase_write(&mut adapter, &cancel).unwrap();
        engine.erase_all(&mut adapter, &cancel).unwrap();
        assert!(engine.blank_check(&mut adapter, 0, 4, &observers, &cancel).unwrap());
    }
}
