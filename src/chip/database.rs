//! `ChipDatabase`: the in-memory mapping `id -> ChipDescriptor`
//! (`spec.md` §3, §4.5).

use std::path::Path;

use crate::chip::{ChipDescriptor, Manufacturer, SpiCommands, Timing};
use crate::error::Result;
use crate::memory_id::MemoryId;
use crate::protocol::Protocol;

/// Keys are unique; insertion order is preserved for listing, by keeping
/// the descriptors in a plain `Vec` rather than a hash map.
#[derive(Debug, Clone, Default)]
pub struct ChipDatabase {
    chips: Vec<ChipDescriptor>,
}

impl ChipDatabase {
    pub fn new() -> Self {
        Self { chips: Vec::new() }
    }

    /// A small built-in seed database, used when no external XML source is
    /// configured. Every public tool in this domain ships some baseline
    /// part list for exactly this reason (`spec.md` SPEC_FULL §4.5).
    pub fn built_in() -> Self {
        let mut db = Self::new();
        db.upsert(
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
            .unwrap(),
        );
        db.upsert(
            ChipDescriptor::new(
                "w25q64",
                "W25Q64",
                Manufacturer::Winbond,
                Protocol::Spi,
                8 * 1024 * 1024,
                256,
                4096,
                65536,
                MemoryId::from_jedec([0xEF, 0x40, 0x17]),
            )
            .unwrap(),
        );
        db.upsert(
            ChipDescriptor::new(
                "w25q128",
                "W25Q128",
                Manufacturer::Winbond,
                Protocol::Spi,
                16 * 1024 * 1024,
                256,
                4096,
                65536,
                MemoryId::from_jedec([0xEF, 0x40, 0x18]),
            )
            .unwrap(),
        );
        db.upsert(
            ChipDescriptor::new(
                "mx25l3206e",
                "MX25L3206E",
                Manufacturer::Macronix,
                Protocol::Spi,
                4 * 1024 * 1024,
                256,
                4096,
                65536,
                MemoryId::from_jedec([0xC2, 0x20, 0x16]),
            )
            .unwrap(),
        );
        db.upsert(
            ChipDescriptor::new(
                "gd25q32",
                "GD25Q32",
                Manufacturer::GigaDevice,
                Protocol::Spi,
                4 * 1024 * 1024,
                256,
                4096,
                65536,
                MemoryId::from_jedec([0xC8, 0x40, 0x16]),
            )
            .unwrap(),
        );
        db.upsert(
            ChipDescriptor::new(
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
            .with_i2c_address(0x50, 2),
        );
        db.upsert(
            ChipDescriptor::new(
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
            .unwrap(),
        );
        db
    }

    pub fn len(&self) -> usize {
        self.chips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChipDescriptor> {
        self.chips.iter()
    }

    /// Replaces any existing descriptor with the same `id`.
    pub fn upsert(&mut self, descriptor: ChipDescriptor) {
        if let Some(existing) = self.chips.iter_mut().find(|c| c.id == descriptor.id) {
            *existing = descriptor;
        } else {
            self.chips.push(descriptor);
        }
    }

    /// Returns whether a descriptor with this id was present and removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.chips.len();
        self.chips.retain(|c| c.id != id);
        self.chips.len() != before
    }

    pub fn find_by_id_str(&self, id: &str) -> Option<&ChipDescriptor> {
        self.chips.iter().find(|c| c.id == id)
    }

    /// Exact match on `(manufacturer_id, device_id)`. If multiple
    /// descriptors share an id, the one with the richest command set wins
    /// (tie-break: alphabetical by name), per `spec.md` §4.5.
    pub fn find_by_id(&self, memory_id: MemoryId) -> Option<&ChipDescriptor> {
        self.chips
            .iter()
            .filter(|c| c.memory_id == memory_id)
            .max_by(|a, b| {
                a.explicit_commands
                    .cmp(&b.explicit_commands)
                    .then_with(|| b.name.cmp(&a.name))
            })
    }

    /// Case-insensitive substring match, insertion order.
    pub fn find_by_name(&self, pattern: &str) -> Vec<&ChipDescriptor> {
        let needle = pattern.to_ascii_lowercase();
        self.chips
            .iter()
            .filter(|c| c.name.to_ascii_lowercase().contains(&needle))
            .collect()
    }

    pub fn find_by_manufacturer(&self, manufacturer: &Manufacturer) -> Vec<&ChipDescriptor> {
        self.chips
            .iter()
            .filter(|c| &c.manufacturer == manufacturer)
            .collect()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        crate::chip::xml::load(path.as_ref())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::chip::xml::save(self, path.as_ref())
    }

    pub(crate) fn push_raw(&mut self, descriptor: ChipDescriptor) {
        self.chips.push(descriptor);
    }
}

/// SPI opcode defaults used when an XML `<Commands>` element is missing or
/// incomplete, per `spec.md` §6: "missing commands fall back to protocol
/// defaults."
pub fn default_commands() -> SpiCommands {
    SpiCommands::default()
}

pub fn default_timing() -> Timing {
    Timing::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_has_no_blank_sentinel_ids() {
        let db = ChipDatabase::built_in();
        for chip in db.iter() {
            if chip.protocol == Protocol::Spi {
                assert!(!chip.memory_id.is_blank());
            }
        }
    }

    #[test]
    fn s1_scenario_lookup() {
        let db = ChipDatabase::built_in();
        let id = MemoryId::from_jedec([0xEF, 0x40, 0x16]);
        let chip = db.find_by_id(id).expect("W25Q32 present");
        assert_eq!(chip.name, "W25Q32");
        assert_eq!(chip.size_bytes, 4 * 1024 * 1024);
        assert_eq!(chip.page_size, 256);
        assert_eq!(chip.sector_size, 4096);
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut db = ChipDatabase::new();
        let chip = ChipDescriptor::new(
            "x",
            "X v1",
            Manufacturer::Other("Acme".into()),
            Protocol::Spi,
            1024,
            256,
            256,
            1024,
            MemoryId::from_jedec([1, 2, 3]),
        )
        .unwrap();
        db.upsert(chip);
        assert_eq!(db.find_by_id_str("x").unwrap().name, "X v1");

        let chip2 = ChipDescriptor::new(
            "x",
            "X v2",
            Manufacturer::Other("Acme".into()),
            Protocol::Spi,
            1024,
            256,
            256,
            1024,
            MemoryId::from_jedec([1, 2, 3]),
        )
        .unwrap();
        db.upsert(chip2);
        assert_eq!(db.len(), 1);
        assert_eq!(db.find_by_id_str("x").unwrap().name, "X v2");
    }

    #[test]
    fn remove_reports_whether_it_deleted() {
        let mut db = ChipDatabase::built_in();
        assert!(db.remove("w25q32"));
        assert!(!db.remove("w25q32"));
    }

    #[test]
    fn find_by_id_tie_break_prefers_explicit_commands_then_name() {
        let mut db = ChipDatabase::new();
        let id = MemoryId::from_jedec([9, 9, 9]);
        db.upsert(
            ChipDescriptor::new(
                "b",
                "Bravo",
                Manufacturer::Other("X".into()),
                Protocol::Spi,
                1024,
                256,
                256,
                1024,
                id,
            )
            .unwrap(),
        );
        db.upsert(
            ChipDescriptor::new(
                "a",
                "Alpha",
                Manufacturer::Other("X".into()),
                Protocol::Spi,
                1024,
                256,
                256,
                1024,
                id,
            )
            .unwrap()
            .with_commands(SpiCommands::default()),
        );
        let found = db.find_by_id(id).unwrap();
        assert_eq!(found.name, "Alpha");
    }
}
