//! Chip descriptor database (`spec.md` §3, §4.5, component C5).

pub mod database;
pub mod xml;

pub use database::ChipDatabase;

use crate::error::{Error, Result};
use crate::memory_id::MemoryId;
use crate::protocol::Protocol;

/// Manufacturers that appear in public SPI/I2C/MicroWire chip databases for
/// this domain. `Other` accepts anything the XML loader encounters that
/// isn't in this closed set, so loading a database never fails solely
/// because of an unrecognized manufacturer string (`spec.md` SPEC_FULL §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Manufacturer {
    Winbond,
    Macronix,
    GigaDevice,
    Issi,
    MicrochipAtmel,
    St,
    Sst,
    Eon,
    CypressSpansion,
    Amic,
    Puya,
    Other(String),
}

impl Manufacturer {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "winbond" => Manufacturer::Winbond,
            "macronix" => Manufacturer::Macronix,
            "gigadevice" => Manufacturer::GigaDevice,
            "issi" => Manufacturer::Issi,
            "microchip" | "atmel" | "microchip/atmel" => Manufacturer::MicrochipAtmel,
            "st" | "stmicroelectronics" => Manufacturer::St,
            "sst" => Manufacturer::Sst,
            "eon" => Manufacturer::Eon,
            "cypress" | "spansion" | "cypress/spansion" => Manufacturer::CypressSpansion,
            "amic" => Manufacturer::Amic,
            "puya" => Manufacturer::Puya,
            other => Manufacturer::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Manufacturer::Winbond => "Winbond",
            Manufacturer::Macronix => "Macronix",
            Manufacturer::GigaDevice => "GigaDevice",
            Manufacturer::Issi => "ISSI",
            Manufacturer::MicrochipAtmel => "Microchip/Atmel",
            Manufacturer::St => "ST",
            Manufacturer::Sst => "SST",
            Manufacturer::Eon => "Eon",
            Manufacturer::CypressSpansion => "Cypress/Spansion",
            Manufacturer::Amic => "Amic",
            Manufacturer::Puya => "Puya",
            Manufacturer::Other(s) => s,
        }
    }
}

/// SPI opcode set for one chip, defaulting to the values in the teacher's
/// `series25::Opcode` enum when a descriptor (or its XML source) doesn't
/// specify one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiCommands {
    pub rdid: u8,
    pub read: u8,
    pub fast_read: u8,
    pub pp: u8,
    pub se: u8,
    pub be: u8,
    pub ce: u8,
    pub rdsr: u8,
    pub wren: u8,
    pub wrdi: u8,
    pub address_bytes: u8,
}

impl Default for SpiCommands {
    fn default() -> Self {
        Self {
            rdid: 0x9F,
            read: 0x03,
            fast_read: 0x0B,
            pp: 0x02,
            se: 0x20,
            be: 0xD8,
            ce: 0xC7,
            rdsr: 0x05,
            wren: 0x06,
            wrdi: 0x04,
            address_bytes: 3,
        }
    }
}

/// Per-operation timing budgets, in milliseconds, used as the `max_ms`
/// argument to `wait_not_busy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub page_program_ms: u32,
    pub sector_erase_ms: u32,
    pub block_erase_ms: u32,
    pub chip_erase_ms: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            page_program_ms: 5,
            sector_erase_ms: 400,
            block_erase_ms: 2000,
            chip_erase_ms: 50_000,
        }
    }
}

/// An immutable chip descriptor, once loaded.
#[derive(Debug, Clone)]
pub struct ChipDescriptor {
    pub id: String,
    pub name: String,
    pub manufacturer: Manufacturer,
    pub protocol: Protocol,

    pub size_bytes: u64,
    pub page_size: u32,
    pub sector_size: u32,
    pub block_size: u32,
    /// MicroWire only: address width in bits, 6..=12.
    pub address_bits: Option<u8>,

    pub voltage_mv: u32,
    pub memory_id: MemoryId,

    pub commands: SpiCommands,
    pub timing: Timing,

    /// I2C only: 7-bit base device address and how many bytes the memory
    /// address takes (1 or 2).
    pub i2c_base_device: u8,
    pub i2c_address_bytes: u8,

    /// Set by [`ChipDescriptor::with_commands`]: this descriptor's XML
    /// source (or builder call) specified its own opcode set rather than
    /// relying on the SPI defaults. Used by
    /// [`database::ChipDatabase::find_by_id`] to break ties between
    /// descriptors that share a `MemoryId`, per `spec.md` §4.5.
    pub explicit_commands: bool,
}

impl ChipDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        manufacturer: Manufacturer,
        protocol: Protocol,
        size_bytes: u64,
        page_size: u32,
        sector_size: u32,
        block_size: u32,
        memory_id: MemoryId,
    ) -> Result<Self> {
        let descriptor = Self {
            id: id.into(),
            name: name.into(),
            manufacturer,
            protocol,
            size_bytes,
            page_size,
            sector_size,
            block_size,
            address_bits: None,
            voltage_mv: 3300,
            memory_id,
            commands: SpiCommands::default(),
            timing: Timing::default(),
            i2c_base_device: 0x50,
            i2c_address_bytes: 2,
            explicit_commands: false,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<()> {
        if self.size_bytes == 0 {
            return Err(Error::invalid_argument("size_bytes must be > 0"));
        }
        let divides = |whole: u64, part: u32| part > 0 && whole % part as u64 == 0;
        if !divides(self.size_bytes, self.page_size) {
            return Err(Error::invalid_argument("page_size must divide size_bytes"));
        }
        if !divides(self.size_bytes, self.sector_size) {
            return Err(Error::invalid_argument(
                "sector_size must divide size_bytes",
            ));
        }
        if !divides(self.size_bytes, self.block_size) {
            return Err(Error::invalid_argument("block_size must divide size_bytes"));
        }
        if self.sector_size % self.page_size != 0 {
            return Err(Error::invalid_argument("page_size must divide sector_size"));
        }
        if self.block_size % self.sector_size != 0 {
            return Err(Error::invalid_argument(
                "sector_size must divide block_size",
            ));
        }
        if let Some(bits) = self.address_bits {
            if !(6..=12).contains(&bits) {
                return Err(Error::invalid_argument(
                    "MicroWire address_bits must be 6..=12",
                ));
            }
        }
        Ok(())
    }

    pub fn with_address_bits(mut self, bits: u8) -> Result<Self> {
        self.address_bits = Some(bits);
        self.validate()?;
        Ok(self)
    }

    pub fn with_commands(mut self, commands: SpiCommands) -> Self {
        self.commands = commands;
        self.explicit_commands = true;
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_i2c_address(mut self, base_device: u8, address_bytes: u8) -> Self {
        self.i2c_base_device = base_device;
        self.i2c_address_bytes = address_bytes;
        self
    }

    pub fn page_count(&self) -> u64 {
        self.size_bytes / self.page_size as u64
    }

    pub fn size_kb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn display_label(&self) -> String {
        format!(
            "{} {} ({:.2} MB, {})",
            self.manufacturer.as_str(),
            self.name,
            self.size_mb(),
            self.memory_id
        )
    }

    /// `spec.md` §4.2: 4-byte addressing iff size exceeds 16 MiB, or the
    /// descriptor already requests it via `commands.address_bytes == 4`.
    pub fn spi_address_bytes(&self) -> u8 {
        if self.size_bytes > 16 * 1024 * 1024 || self.commands.address_bytes == 4 {
            4
        } else {
            3
        }
    }
}
