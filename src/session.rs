//! [`Session`]: scoped ownership of one open adapter and the engine bound to
//! whatever chip it's currently talking to (`spec.md` §3, §9).
//!
//! A session owns at most one open adapter and one bound engine at a time.
//! Dropping it closes the adapter and cancels any operation still in
//! flight, so a panicking caller or an early return can never leave a USB
//! handle open.

use crate::adapter::Adapter;
use crate::chip::ChipDescriptor;
use crate::error::{Error, Kind, Result};
use crate::protocol::{I2cEngine, MicrowireEngine, Protocol, SpiEngine};
use crate::result::{CancellationToken, Observers, OperationStatus};

/// The protocol engine currently bound to the session's open adapter.
#[derive(Clone)]
pub enum Engine {
    Spi(SpiEngine),
    I2c(I2cEngine),
    MicroWire(MicrowireEngine),
}

impl Engine {
    pub fn for_descriptor(descriptor: &ChipDescriptor) -> Result<Self> {
        Ok(match descriptor.protocol {
            Protocol::Spi => Engine::Spi(SpiEngine::new(descriptor)),
            Protocol::I2c => Engine::I2c(I2cEngine::new(descriptor)),
            Protocol::MicroWire => Engine::MicroWire(MicrowireEngine::new(descriptor)?),
        })
    }
}

pub struct Session {
    adapter: Option<Box<dyn Adapter>>,
    engine: Option<Engine>,
    pub observers: Observers,
    cancel: CancellationToken,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            adapter: None,
            engine: None,
            observers: Observers::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        match &self.adapter {
            Some(adapter) => adapter.is_connected(),
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.observers.current_status() == OperationStatus::Running
    }

    fn require_idle(&self) -> Result<()> {
        if self.is_busy() {
            return Err(Error::new(Kind::Busy, "an operation is already running"));
        }
        Ok(())
    }

    /// Opens `adapter` and binds it to this session. Fails with `Busy` if a
    /// different adapter is already open; opening the same kind again while
    /// closed is fine.
    pub fn open(&mut self, mut adapter: Box<dyn Adapter>, path: Option<&str>) -> Result<()> {
        self.require_idle()?;
        if self.is_open() {
            return Err(Error::new(Kind::Busy, "session already has an open adapter"));
        }
        adapter.open(path)?;
        self.adapter = Some(adapter);
        Ok(())
    }

    /// Releases the adapter. Idempotent (`spec.md` §8, property 2): closing
    /// a session with nothing open is a no-op success.
    pub fn close(&mut self) -> Result<()> {
        self.engine = None;
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.close()?;
        }
        self.adapter = None;
        Ok(())
    }

    pub fn bind_chip(&mut self, descriptor: &ChipDescriptor) -> Result<()> {
        self.require_idle()?;
        if !self.is_open() {
            return Err(Error::new(Kind::NotConnected, "no adapter open"));
        }
        self.engine = Some(Engine::for_descriptor(descriptor)?);
        Ok(())
    }

    pub fn adapter_mut(&mut self) -> Result<&mut (dyn Adapter + 'static)> {
        self.adapter
            .as_deref_mut()
            .ok_or_else(|| Error::new(Kind::NotConnected, "no adapter open"))
    }

    /// Borrows the adapter mutably and the observers immutably at once.
    /// Field-level, so the borrow checker sees them as disjoint even though
    /// `adapter_mut()` alone would borrow all of `self`.
    pub fn adapter_and_observers(&mut self) -> Result<(&mut dyn Adapter, &Observers)> {
        let adapter = self
            .adapter
            .as_deref_mut()
            .ok_or_else(|| Error::new(Kind::NotConnected, "no adapter open"))?;
        Ok((adapter, &self.observers))
    }

    pub fn engine(&self) -> Result<&Engine> {
        self.engine
            .as_ref()
            .ok_or_else(|| Error::new(Kind::NotConnected, "no chip bound"))
    }

    /// An owned copy of the bound engine, independent of any borrow of
    /// `self`. Callers that also need `adapter_mut()` in the same scope use
    /// this instead of `engine()`, since the protocol engines are cheap to
    /// clone and this avoids holding an immutable borrow of the session
    /// across a later mutable one.
    pub fn engine_cloned(&self) -> Result<Engine> {
        self.engine().map(|e| e.clone())
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Replaces the cancellation token with a fresh one, for the next
    /// operation to use. Called by the orchestrator at the start of every
    /// cancellable call so a stale cancellation doesn't leak into it.
    pub fn reset_cancellation(&mut self) {
        self.cancel = CancellationToken::new();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SimulatedAdapter;
    use crate::chip::Manufacturer;
    use crate::memory_id::MemoryId;

    fn descriptor() -> ChipDescriptor {
        ChipDescriptor::new(
            "w25q32",
            "W25Q32",
            Manufacturer::Winbond,
            Protocol::Spi,
            4 * 1024 * 1024,
            256,
            4096,
            65536,
            MemoryId::from_jedec([0xEF, 0x40, 0x16]),
        )
        .unwrap()
    }

    #[test]
    fn close_without_open_is_ok() {
        let mut session = Session::new();
        assert!(session.close().is_ok());
        assert!(session.close().is_ok());
    }

    #[test]
    fn bind_chip_requires_open_adapter() {
        let mut session = Session::new();
        assert!(session.bind_chip(&descriptor()).is_err());
    }

    #[test]
    fn open_then_bind_then_close() {
        let mut session = Session::new();
        let adapter = Box::new(SimulatedAdapter::spi_nor(
            4 * 1024 * 1024,
            4096,
            [0xEF, 0x40, 0x16],
        ));
        session.open(adapter, None).unwrap();
        session.bind_chip(&descriptor()).unwrap();
        assert!(matches!(session.engine().unwrap(), Engine::Spi(_)));
        session.close().unwrap();
        assert!(!session.is_open());
    }

    #[test]
    fn double_open_is_rejected() {
        let mut session = Session::new();
        let a1 = Box::new(SimulatedAdapter::spi_nor(1024, 256, [0xEF, 0x40, 0x16]));
        let a2 = Box::new(SimulatedAdapter::spi_nor(1024, 256, [0xEF, 0x40, 0x16]));
        session.open(a1, None).unwrap();
        assert!(session.open(a2, None).is_err());
    }
}
