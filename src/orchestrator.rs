//! [`Orchestrator`]: the top-level entry point (`spec.md` §4.6, component
//! C6). Wraps a [`Session`], dispatches each call to whichever protocol
//! engine is bound, and wraps every outcome in an [`OperationResult`].

use std::fs;
use std::path::Path;

use crate::adapter::{Adapter, AdapterKind, Ch341aAdapter, SimulatedAdapter};
use crate::chip::{ChipDatabase, ChipDescriptor};
use crate::error::{Error, Kind, Result};
use crate::result::{CancellationToken, Observers, OperationResult, OperationStatus, ProgressSink};
use crate::session::{Engine, Session};

/// Which region an `erase` call targets (`spec.md` §4.6).
#[derive(Debug, Clone, Copy)]
pub enum EraseTarget {
    Chip,
    Block(u64),
    Sector(u64),
    /// Rounds outward to sector boundaries before erasing, per `spec.md`
    /// §4.6: a caller-specified byte range may not itself be aligned.
    Range { addr: u64, len: u64 },
}

pub struct Orchestrator {
    session: Session,
    database: ChipDatabase,
    descriptor: Option<ChipDescriptor>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            session: Session::new(),
            database: ChipDatabase::built_in(),
            descriptor: None,
        }
    }

    pub fn with_database(database: ChipDatabase) -> Self {
        Self {
            session: Session::new(),
            database,
            descriptor: None,
        }
    }

    pub fn database(&self) -> &ChipDatabase {
        &self.database
    }

    pub fn database_mut(&mut self) -> &mut ChipDatabase {
        &mut self.database
    }

    pub fn load_database(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.database = ChipDatabase::load(path)?;
        Ok(())
    }

    pub fn current_chip(&self) -> Option<&ChipDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn status(&self) -> OperationStatus {
        self.session.observers.current_status()
    }

    pub fn subscribe_progress(
        &self,
        callback: impl FnMut(&crate::result::ProgressInfo) + Send + 'static,
    ) -> crate::result::SubscriptionId {
        self.session.observers.subscribe_progress(callback)
    }

    pub fn subscribe_status(
        &self,
        callback: impl FnMut(OperationStatus) + Send + 'static,
    ) -> crate::result::SubscriptionId {
        self.session.observers.subscribe_status(callback)
    }

    pub fn cancel_operation(&self) {
        self.session.cancel();
    }

    pub fn enumerate_hardware(&self, kind: AdapterKind) -> Result<Vec<String>> {
        let probe: Box<dyn Adapter> = match kind {
            AdapterKind::Ch341a => Box::new(Ch341aAdapter::new()),
            AdapterKind::Simulated => Box::new(SimulatedAdapter::spi_nor(0, 0, [0; 3])),
        };
        probe.enumerate()
    }

    pub fn connect(&mut self, kind: AdapterKind, path: Option<&str>) -> Result<()> {
        let adapter: Box<dyn Adapter> = match kind {
            AdapterKind::Ch341a => Box::new(Ch341aAdapter::new()),
            AdapterKind::Simulated => Box::new(SimulatedAdapter::spi_nor(
                4 * 1024 * 1024,
                4096,
                [0xEF, 0x40, 0x16],
            )),
        };
        self.session.open(adapter, path)
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.descriptor = None;
        self.session.close()
    }

    pub fn select_chip(&mut self, descriptor: ChipDescriptor) -> Result<()> {
        self.session.bind_chip(&descriptor)?;
        self.descriptor = Some(descriptor);
        Ok(())
    }

    /// Runs RDID (or the equivalent for the currently bound engine's
    /// protocol) and looks the id up in the chip database.
    pub fn detect(&mut self) -> OperationResult<ChipDescriptor> {
        let database = self.database.clone();
        self.run(move |session, _cancel| {
            let engine = session.engine_cloned()?;
            let id = match engine {
                Engine::Spi(spi) => spi.detect(session.adapter_mut()?)?,
                Engine::I2c(_) | Engine::MicroWire(_) => {
                    return Err(Error::unsupported("detect (non-SPI protocol)"));
                }
            };
            database
                .find_by_id(id)
                .cloned()
                .ok_or_else(|| Error::unknown_chip(id))
        })
    }

    pub fn read_memory(&mut self, addr: u64, len: u64) -> OperationResult<Vec<u8>> {
        self.run(move |session, cancel| dispatch_read(session, addr, len, cancel))
    }

    pub fn write_memory(&mut self, addr: u64, data: Vec<u8>) -> OperationResult<()> {
        self.run(move |session, cancel| dispatch_write(session, addr, &data, cancel))
    }

    pub fn verify_memory(&mut self, addr: u64, expected: Vec<u8>) -> OperationResult<()> {
        self.run(move |session, cancel| dispatch_verify(session, addr, &expected, cancel))
    }

    pub fn blank_check(&mut self, addr: u64, len: u64) -> OperationResult<bool> {
        self.run(move |session, cancel| dispatch_blank_check(session, addr, len, cancel))
    }

    pub fn erase(&mut self, target: EraseTarget) -> OperationResult<()> {
        let descriptor = match self.descriptor.clone() {
            Some(d) => d,
            None => return OperationResult::err(Error::new(Kind::NotConnected, "no chip selected")),
        };
        self.run(move |session, cancel| {
            let engine = session.engine_cloned()?;
            match (engine, target) {
                (Engine::Spi(spi), EraseTarget::Chip) => {
                    spi.erase_chip(session.adapter_mut()?, cancel)
                }
                (Engine::Spi(spi), EraseTarget::Block(addr)) => {
                    spi.erase_block(session.adapter_mut()?, addr, cancel)
                }
                (Engine::Spi(spi), EraseTarget::Sector(addr)) => {
                    spi.erase_sector(session.adapter_mut()?, addr, cancel)
                }
                (Engine::Spi(spi), EraseTarget::Range { addr, len }) => {
                    let sector = descriptor.sector_size as u64;
                    let start = (addr / sector) * sector;
                    let end = (addr + len).div_ceil(sector) * sector;
                    let mut a = start;
                    while a < end {
                        spi.erase_sector(session.adapter_mut()?, a, cancel)?;
                        a += sector;
                    }
                    Ok(())
                }
                (Engine::I2c(i2c), target) => {
                    let (addr, len) = i2c_erase_range(&descriptor, target);
                    let (adapter, observers) = session.adapter_and_observers()?;
                    i2c.erase(adapter, addr, len, observers, cancel)
                }
                (Engine::MicroWire(mw), _) => mw.erase_all(session.adapter_mut()?, cancel),
            }
        })
    }

    /// Erase-then-write-then-verify. On SPI this erases every sector the
    /// write touches first; I2C/MicroWire have no erase step since writes
    /// overwrite directly (`spec.md` §4.6).
    ///
    /// Progress is reported as contiguous bands against one grand total
    /// rather than each phase restarting at `0` (`spec.md` §4.6, §8
    /// property 3): erase, then write, then verify, each sized by the
    /// number of bytes it touches.
    pub fn program_and_verify(&mut self, addr: u64, data: Vec<u8>) -> OperationResult<()> {
        let descriptor = match self.descriptor.clone() {
            Some(d) => d,
            None => return OperationResult::err(Error::new(Kind::NotConnected, "no chip selected")),
        };
        self.run(move |session, cancel| {
            let engine = session.engine_cloned()?;
            let total_len = data.len() as u64;
            match engine {
                Engine::Spi(spi) => {
                    let sector = descriptor.sector_size as u64;
                    let start = (addr / sector) * sector;
                    let end = (addr + total_len).div_ceil(sector) * sector;
                    let erase_len = end - start;
                    let grand_total = erase_len + total_len + total_len;

                    {
                        let (_, observers) = session.adapter_and_observers()?;
                        observers.emit_progress("program_and_verify", 0, grand_total, "erasing");
                    }
                    let mut a = start;
                    while a < end {
                        spi.erase_sector(session.adapter_mut()?, a, cancel)?;
                        a += sector;
                    }
                    {
                        let (_, observers) = session.adapter_and_observers()?;
                        observers.emit_progress("program_and_verify", erase_len, grand_total, "erased");
                    }
                    {
                        let (adapter, observers) = session.adapter_and_observers()?;
                        let band = Band::new(observers, erase_len, total_len, grand_total);
                        spi.write(adapter, addr, &data, &band, cancel)?;
                    }
                    let (adapter, observers) = session.adapter_and_observers()?;
                    let band = Band::new(observers, erase_len + total_len, total_len, grand_total);
                    spi.verify(adapter, addr, &data, &band, cancel)
                }
                Engine::I2c(i2c) => {
                    let grand_total = total_len * 2;
                    {
                        let (adapter, observers) = session.adapter_and_observers()?;
                        let band = Band::new(observers, 0, total_len, grand_total);
                        i2c.write(adapter, addr, &data, &band, cancel)?;
                    }
                    let (adapter, observers) = session.adapter_and_observers()?;
                    let band = Band::new(observers, total_len, total_len, grand_total);
                    i2c.verify(adapter, addr, &data, &band, cancel)
                }
                Engine::MicroWire(mw) => {
                    let grand_total = total_len * 2;
                    {
                        let (adapter, observers) = session.adapter_and_observers()?;
                        let band = Band::new(observers, 0, total_len, grand_total);
                        mw.write(adapter, addr as u16, &data, &band, cancel)?;
                    }
                    let (adapter, observers) = session.adapter_and_observers()?;
                    let band = Band::new(observers, total_len, total_len, grand_total);
                    mw.verify(adapter, addr as u16, &data, &band, cancel)
                }
            }
        })
    }

    pub fn read_to_file(
        &mut self,
        addr: u64,
        len: u64,
        path: impl AsRef<Path>,
    ) -> OperationResult<()> {
        match self.read_memory(addr, len) {
            OperationResult::Ok { value: Some(data), .. } => match fs::write(path, &data) {
                Ok(()) => OperationResult::ok_unit(format!("wrote {} bytes to file", data.len())),
                Err(e) => {
                    OperationResult::err(Error::with_cause(Kind::Io, "failed to write output file", e))
                }
            },
            OperationResult::Ok { value: None, message } => OperationResult::ok_unit(message),
            OperationResult::Err(e) => OperationResult::Err(e),
        }
    }

    pub fn write_from_file(&mut self, addr: u64, path: impl AsRef<Path>) -> OperationResult<()> {
        match fs::read(path) {
            Ok(data) => self.write_memory(addr, data),
            Err(e) => OperationResult::err(Error::with_cause(Kind::Io, "failed to read input file", e)),
        }
    }

    /// Formats `data` as `AAAAAAAA:  XX XX ... XX  ASCII` lines, 16 bytes
    /// per row, starting at display offset `base_addr`.
    pub fn hex_dump_to_string(base_addr: u64, data: &[u8]) -> String {
        let mut out = String::new();
        for (row, chunk) in data.chunks(16).enumerate() {
            let offset = base_addr + (row as u64) * 16;
            out.push_str(&format!("{offset:08X}:  "));
            for (i, byte) in chunk.iter().enumerate() {
                out.push_str(&format!("{byte:02X} "));
                if i == 7 {
                    out.push(' ');
                }
            }
            let pad = 16usize.saturating_sub(chunk.len());
            for _ in 0..pad {
                out.push_str("   ");
            }
            out.push(' ');
            for &byte in chunk {
                let c = if (0x20..0x7f).contains(&byte) { byte as char } else { '.' };
                out.push(c);
            }
            out.push('\n');
        }
        out
    }

    fn run<T>(
        &mut self,
        f: impl FnOnce(&mut Session, &CancellationToken) -> Result<T>,
    ) -> OperationResult<T> {
        if self.session.is_busy() {
            return OperationResult::err(Error::new(Kind::Busy, "an operation is already running"));
        }
        self.session.reset_cancellation();
        self.session.observers.begin();
        let cancel = self.session.cancellation_token().clone();
        let outcome = f(&mut self.session, &cancel);
        match outcome {
            Ok(value) => {
                self.session.observers.finish(OperationStatus::Completed);
                OperationResult::ok(value, "completed")
            }
            Err(e) if e.kind == Kind::Cancelled => {
                self.session.observers.finish(OperationStatus::Cancelled);
                OperationResult::err(e)
            }
            Err(e) => {
                self.session.observers.finish(OperationStatus::Failed);
                OperationResult::err(e)
            }
        }
    }
}

/// Remaps a sub-operation's own `current`/`total` progress into one
/// contiguous band `[start, start + span)` of a single logical
/// `grand_total`, so a multi-phase operation like `program_and_verify`
/// reports one monotone sequence instead of each phase restarting at `0`.
struct Band<'a> {
    parent: &'a Observers,
    start: u64,
    span: u64,
    grand_total: u64,
}

impl<'a> Band<'a> {
    fn new(parent: &'a Observers, start: u64, span: u64, grand_total: u64) -> Self {
        Self { parent, start, span, grand_total }
    }
}

impl<'a> ProgressSink for Band<'a> {
    fn emit_progress(&self, _operation_name: &str, current: u64, total: u64, message: &str) {
        let local_frac = if total == 0 { 1.0 } else { current as f64 / total as f64 };
        let mapped = self.start + (local_frac * self.span as f64).round() as u64;
        self.parent.emit_progress(
            "program_and_verify",
            mapped.min(self.grand_total),
            self.grand_total,
            message,
        );
    }
}

fn i2c_erase_range(descriptor: &ChipDescriptor, target: EraseTarget) -> (u64, u64) {
    match target {
        EraseTarget::Chip => (0, descriptor.size_bytes),
        EraseTarget::Block(addr) => (addr, descriptor.block_size as u64),
        EraseTarget::Sector(addr) => (addr, descriptor.sector_size as u64),
        EraseTarget::Range { addr, len } => (addr, len),
    }
}

fn dispatch_read(
    session: &mut Session,
    addr: u64,
    len: u64,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let engine = session.engine_cloned()?;
    let (adapter, observers) = session.adapter_and_observers()?;
    match engine {
        Engine::Spi(spi) => spi.read(adapter, addr, len, observers, cancel),
        Engine::I2c(i2c) => i2c.read(adapter, addr, len, observers, cancel),
        Engine::MicroWire(mw) => mw.read(adapter, addr as u16, (len + 1) / 2, observers, cancel),
    }
}

fn dispatch_write(session: &mut Session, addr: u64, data: &[u8], cancel: &CancellationToken) -> Result<()> {
    let engine = session.engine_cloned()?;
    let (adapter, observers) = session.adapter_and_observers()?;
    match engine {
        Engine::Spi(spi) => spi.write(adapter, addr, data, observers, cancel),
        Engine::I2c(i2c) => i2c.write(adapter, addr, data, observers, cancel),
        Engine::MicroWire(mw) => mw.write(adapter, addr as u16, data, observers, cancel),
    }
}

fn dispatch_verify(
    session: &mut Session,
    addr: u64,
    expected: &[u8],
    cancel: &CancellationToken,
) -> Result<()> {
    let engine = session.engine_cloned()?;
    let (adapter, observers) = session.adapter_and_observers()?;
    match engine {
        Engine::Spi(spi) => spi.verify(adapter, addr, expected, observers, cancel),
        Engine::I2c(i2c) => i2c.verify(adapter, addr, expected, observers, cancel),
        Engine::MicroWire(mw) => mw.verify(adapter, addr as u16, expected, observers, cancel),
    }
}

fn dispatch_blank_check(
    session: &mut Session,
    addr: u64,
    len: u64,
    cancel: &CancellationToken,
) -> Result<bool> {
    let engine = session.engine_cloned()?;
    let (adapter, observers) = session.adapter_and_observers()?;
    match engine {
        Engine::Spi(spi) => spi.blank_check(adapter, addr, len, observers, cancel),
        Engine::I2c(i2c) => i2c.blank_check(adapter, addr, len, observers, cancel),
        Engine::MicroWire(mw) => mw.blank_check(adapter, addr as u16, (len + 1) / 2, observers, cancel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterKind;
    use crate::chip::Manufacturer;
    use crate::memory_id::MemoryId;

    fn w25q32() -> ChipDescriptor {
        ChipDescriptor::new(
            "w25q32",
            "W25Q32",
            Manufacturer::Winbond,
            crate::protocol::Protocol::Spi,
            4 * 1024 * 1024,
            256,
            4096,
            65536,
            MemoryId::from_jedec([0xEF, 0x40, 0x16]),
        )
        .unwrap()
    }

    #[test]
    fn s1_scenario_detect_connect_program_verify() {
        let mut orch = Orchestrator::new();
        orch.connect(AdapterKind::Simulated, None).unwrap();
        orch.select_chip(w25q32()).unwrap();
        let data = vec![0x5Au8; 512];
        let result = orch.program_and_verify(0, data.clone());
        assert!(result.is_ok());
        let read = orch.read_memory(0, 512);
        match read {
            OperationResult::Ok { value: Some(bytes), .. } => assert_eq!(bytes, data),
            _ => panic!("expected read to succeed"),
        }
    }

    #[test]
    fn program_and_verify_progress_is_monotone_and_reaches_total() {
        let mut orch = Orchestrator::new();
        orch.connect(AdapterKind::Simulated, None).unwrap();
        orch.select_chip(w25q32()).unwrap();
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = events.clone();
        orch.session
            .observers
            .subscribe_progress(move |p| captured.lock().unwrap().push((p.current_bytes, p.total_bytes)));
        let data = vec![0x5Au8; 512];
        let result = orch.program_and_verify(0, data);
        assert!(result.is_ok());
        let seen = events.lock().unwrap();
        assert!(!seen.is_empty());
        let total = seen[0].1;
        assert!(seen.iter().all(|&(_, t)| t == total));
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(seen.last().unwrap().0, total);
    }

    #[test]
    fn busy_rejects_concurrent_operation() {
        let mut orch = Orchestrator::new();
        orch.connect(AdapterKind::Simulated, None).unwrap();
        orch.select_chip(w25q32()).unwrap();
        orch.session.observers.begin();
        let result = orch.read_memory(0, 16);
        assert!(!result.is_ok());
        orch.session.observers.finish(OperationStatus::Completed);
    }

    #[test]
    fn hex_dump_formats_rows_of_sixteen() {
        let data: Vec<u8> = (0..20u8).collect();
        let dump = Orchestrator::hex_dump_to_string(0, &data);
        assert_eq!(dump.lines().count(), 2);
        assert!(dump.starts_with("00000000:"));
    }

    #[test]
    fn detect_looks_up_built_in_database() {
        let mut orch = Orchestrator::new();
        orch.connect(AdapterKind::Simulated, None).unwrap();
        orch.select_chip(w25q32()).unwrap();
        let result = orch.detect();
        match result {
            OperationResult::Ok { value: Some(chip), .. } => assert_eq!(chip.id, "w25q32"),
            _ => panic!("expected detect to find the simulated chip"),
        }
    }
}
