//! Host-side programmer for SPI/I2C/MicroWire memory chips driven through a
//! USB-attached adapter.
//!
//! The crate is layered bottom-up:
//!
//! - [`adapter`] — the [`adapter::Adapter`] trait, the hardware boundary
//!   (component C1).
//! - [`protocol`] — one engine per wire protocol, built only on `Adapter`
//!   primitives (components C2–C4).
//! - [`chip`] — the chip descriptor database (component C5).
//! - [`session`] — owns at most one open adapter and the engine bound to it.
//! - [`orchestrator`] — the entry point most callers use: wraps a session,
//!   dispatches to the bound engine, and reports progress through
//!   [`result::Observers`] (component C6).
//!
//! `cargo build --features cli` also builds the `memprog` binary.

pub mod adapter;
pub mod capabilities;
pub mod chip;
pub mod error;
pub mod memory_id;
pub mod orchestrator;
pub mod protocol;
pub mod result;
pub mod session;

pub use adapter::{Adapter, AdapterKind, Ch341aAdapter, SimulatedAdapter};
pub use capabilities::{AddressByteRange, HardwareCapabilities, SpeedTier};
pub use chip::{ChipDatabase, ChipDescriptor, Manufacturer, SpiCommands, Timing};
pub use error::{Error, Kind, Result, VerifyMismatch};
pub use memory_id::MemoryId;
pub use orchestrator::{EraseTarget, Orchestrator};
pub use protocol::Protocol;
pub use result::{
    CancellationToken, Observers, OperationResult, OperationStatus, ProgressInfo, ProgressSink,
    SubscriptionId,
};
pub use session::{Engine, Session};
