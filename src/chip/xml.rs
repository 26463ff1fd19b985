//! XML persistence for [`super::ChipDatabase`] (`spec.md` §6).
//!
//! Schema:
//! ```xml
//! <ChipDatabase>
//!   <Chip id="w25q32" name="W25Q32" manufacturer="Winbond" protocol="spi"
//!         size="4194304" pageSize="256" sectorSize="4096" blockSize="65536"
//!         voltage="3300" manufacturerId="EF" deviceId="4016">
//!     <Commands rdid="9F" read="03" fastRead="0B" pp="02" se="20" be="D8"
//!               ce="C7" rdsr="05" wren="06" wrdi="04" addressBytes="3"/>
//!     <Timing pageProgramMs="5" sectorEraseMs="400" blockEraseMs="2000"
//!             chipEraseMs="50000"/>
//!   </Chip>
//! </ChipDatabase>
//! ```
//! Unknown elements and attributes are ignored rather than rejected, so a
//! database grown by a newer tool version still loads here. A `<Chip>` with
//! no `<Commands>` falls back to [`SpiCommands::default`].

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::chip::{ChipDatabase, ChipDescriptor, Manufacturer, SpiCommands, Timing};
use crate::error::{Error, Result};
use crate::memory_id::MemoryId;
use crate::protocol::Protocol;

fn attr_str(tag: &BytesStart, key: &str) -> Result<Option<String>> {
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| Error::new(crate::error::Kind::ProtocolError, e.to_string()))?;
        if attr.key.as_ref() == key.as_bytes() {
            let value = attr
                .decode_and_unescape_value(&Reader::from_str(""))
                .unwrap_or(Cow::Borrowed(""));
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn attr_required(tag: &BytesStart, key: &str) -> Result<String> {
    attr_str(tag, key)?
        .ok_or_else(|| Error::invalid_argument(format!("<Chip> missing required attribute {key}")))
}

fn attr_u64(tag: &BytesStart, key: &str, default: u64) -> Result<u64> {
    match attr_str(tag, key)? {
        Some(s) => s
            .parse()
            .map_err(|_| Error::invalid_argument(format!("attribute {key} is not a number"))),
        None => Ok(default),
    }
}

fn attr_u32(tag: &BytesStart, key: &str, default: u32) -> Result<u32> {
    Ok(attr_u64(tag, key, default as u64)? as u32)
}

fn attr_hex_u8(tag: &BytesStart, key: &str, default: u8) -> Result<u8> {
    match attr_str(tag, key)? {
        Some(s) => u8::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|_| Error::invalid_argument(format!("attribute {key} is not hex"))),
        None => Ok(default),
    }
}

fn attr_hex_u16(tag: &BytesStart, key: &str, default: u16) -> Result<u16> {
    match attr_str(tag, key)? {
        Some(s) => u16::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|_| Error::invalid_argument(format!("attribute {key} is not hex"))),
        None => Ok(default),
    }
}

fn protocol_from_str(s: &str) -> Protocol {
    match s.to_ascii_lowercase().as_str() {
        "i2c" => Protocol::I2c,
        "microwire" | "mw" => Protocol::MicroWire,
        _ => Protocol::Spi,
    }
}

fn protocol_to_str(p: Protocol) -> &'static str {
    match p {
        Protocol::Spi => "spi",
        Protocol::I2c => "i2c",
        Protocol::MicroWire => "microwire",
    }
}

pub fn load(path: &Path) -> Result<ChipDatabase> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::with_cause(crate::error::Kind::Io, "failed to read chip database", e))?;
    parse(&text)
}

pub fn parse(xml: &str) -> Result<ChipDatabase> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut db = ChipDatabase::new();
    let mut buf = Vec::new();

    let mut current: Option<ChipBuilder> = None;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| Error::new(crate::error::Kind::ProtocolError, e.to_string()))?
        {
            Event::Start(tag) | Event::Empty(tag) => {
                match tag.name().as_ref() {
                    b"Chip" => {
                        current = Some(ChipBuilder::from_tag(&tag)?);
                    }
                    b"Commands" => {
                        if let Some(builder) = current.as_mut() {
                            builder.commands = Some(parse_commands(&tag)?);
                        }
                    }
                    b"Timing" => {
                        if let Some(builder) = current.as_mut() {
                            builder.timing = Some(parse_timing(&tag)?);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(tag) => {
                if tag.name().as_ref() == b"Chip" {
                    if let Some(builder) = current.take() {
                        db.push_raw(builder.build()?);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(db)
}

struct ChipBuilder {
    id: String,
    name: String,
    manufacturer: Manufacturer,
    protocol: Protocol,
    size_bytes: u64,
    page_size: u32,
    sector_size: u32,
    block_size: u32,
    voltage_mv: u32,
    manufacturer_id: u8,
    device_id: u16,
    i2c_base_device: u8,
    i2c_address_bytes: u8,
    address_bits: Option<u8>,
    commands: Option<SpiCommands>,
    timing: Option<Timing>,
}

impl ChipBuilder {
    fn from_tag(tag: &BytesStart) -> Result<Self> {
        let protocol = protocol_from_str(&attr_str(tag, "protocol")?.unwrap_or_default());
        Ok(Self {
            id: attr_required(tag, "id")?,
            name: attr_required(tag, "name")?,
            manufacturer: Manufacturer::parse(&attr_str(tag, "manufacturer")?.unwrap_or_default()),
            protocol,
            size_bytes: attr_u64(tag, "size", 0)?,
            page_size: attr_u32(tag, "pageSize", 256)?,
            sector_size: attr_u32(tag, "sectorSize", 4096)?,
            block_size: attr_u32(tag, "blockSize", 65536)?,
            voltage_mv: attr_u32(tag, "voltage", 3300)?,
            manufacturer_id: attr_hex_u8(tag, "manufacturerId", 0xFF)?,
            device_id: attr_hex_u16(tag, "deviceId", 0xFFFF)?,
            i2c_base_device: attr_hex_u8(tag, "i2cBaseDevice", 0x50)?,
            i2c_address_bytes: attr_u32(tag, "i2cAddressBytes", 2)? as u8,
            address_bits: match attr_str(tag, "addressBits")? {
                Some(s) => Some(
                    s.parse()
                        .map_err(|_| Error::invalid_argument("addressBits is not a number"))?,
                ),
                None => None,
            },
            commands: None,
            timing: None,
        })
    }

    fn build(self) -> Result<ChipDescriptor> {
        let memory_id = MemoryId {
            manufacturer_id: self.manufacturer_id,
            device_id: self.device_id,
        };
        let mut descriptor = ChipDescriptor::new(
            self.id,
            self.name,
            self.manufacturer,
            self.protocol,
            self.size_bytes,
            self.page_size,
            self.sector_size,
            self.block_size,
            memory_id,
        )?;
        descriptor.voltage_mv = self.voltage_mv;
        descriptor = descriptor.with_i2c_address(self.i2c_base_device, self.i2c_address_bytes);
        if let Some(bits) = self.address_bits {
            descriptor = descriptor.with_address_bits(bits)?;
        }
        if let Some(commands) = self.commands {
            descriptor = descriptor.with_commands(commands);
        }
        if let Some(timing) = self.timing {
            descriptor = descriptor.with_timing(timing);
        }
        Ok(descriptor)
    }
}

fn parse_commands(tag: &BytesStart) -> Result<SpiCommands> {
    let default = SpiCommands::default();
    Ok(SpiCommands {
        rdid: attr_hex_u8(tag, "rdid", default.rdid)?,
        read: attr_hex_u8(tag, "read", default.read)?,
        fast_read: attr_hex_u8(tag, "fastRead", default.fast_read)?,
        pp: attr_hex_u8(tag, "pp", default.pp)?,
        se: attr_hex_u8(tag, "se", default.se)?,
        be: attr_hex_u8(tag, "be", default.be)?,
        ce: attr_hex_u8(tag, "ce", default.ce)?,
        rdsr: attr_hex_u8(tag, "rdsr", default.rdsr)?,
        wren: attr_hex_u8(tag, "wren", default.wren)?,
        wrdi: attr_hex_u8(tag, "wrdi", default.wrdi)?,
        address_bytes: attr_u32(tag, "addressBytes", default.address_bytes as u32)? as u8,
    })
}

fn parse_timing(tag: &BytesStart) -> Result<Timing> {
    let default = Timing::default();
    Ok(Timing {
        page_program_ms: attr_u32(tag, "pageProgramMs", default.page_program_ms)?,
        sector_erase_ms: attr_u32(tag, "sectorEraseMs", default.sector_erase_ms)?,
        block_erase_ms: attr_u32(tag, "blockEraseMs", default.block_erase_ms)?,
        chip_erase_ms: attr_u32(tag, "chipEraseMs", default.chip_erase_ms)?,
    })
}

pub fn save(db: &ChipDatabase, path: &Path) -> Result<()> {
    let xml = to_string(db)?;
    fs::write(path, xml)
        .map_err(|e| Error::with_cause(crate::error::Kind::Io, "failed to write chip database", e))
}

pub fn to_string(db: &ChipDatabase) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .create_element("ChipDatabase")
        .write_inner_content::<_, quick_xml::Error>(|writer| {
            for chip in db.iter() {
                let raw = chip.memory_id.raw_jedec();
                writer
                    .create_element("Chip")
                    .with_attribute(("id", chip.id.as_str()))
                    .with_attribute(("name", chip.name.as_str()))
                    .with_attribute(("manufacturer", chip.manufacturer.as_str()))
                    .with_attribute(("protocol", protocol_to_str(chip.protocol)))
                    .with_attribute(("size", chip.size_bytes.to_string().as_str()))
                    .with_attribute(("pageSize", chip.page_size.to_string().as_str()))
                    .with_attribute(("sectorSize", chip.sector_size.to_string().as_str()))
                    .with_attribute(("blockSize", chip.block_size.to_string().as_str()))
                    .with_attribute(("voltage", chip.voltage_mv.to_string().as_str()))
                    .with_attribute(("manufacturerId", format!("{:02X}", raw[0]).as_str()))
                    .with_attribute((
                        "deviceId",
                        format!("{:02X}{:02X}", raw[1], raw[2]).as_str(),
                    ))
                    .write_inner_content::<_, quick_xml::Error>(|writer| {
                        if chip.explicit_commands {
                            let c = &chip.commands;
                            writer
                                .create_element("Commands")
                                .with_attribute(("rdid", format!("{:02X}", c.rdid).as_str()))
                                .with_attribute(("read", format!("{:02X}", c.read).as_str()))
                                .with_attribute((
                                    "fastRead",
                                    format!("{:02X}", c.fast_read).as_str(),
                                ))
                                .with_attribute(("pp", format!("{:02X}", c.pp).as_str()))
                                .with_attribute(("se", format!("{:02X}", c.se).as_str()))
                                .with_attribute(("be", format!("{:02X}", c.be).as_str()))
                                .with_attribute(("ce", format!("{:02X}", c.ce).as_str()))
                                .with_attribute(("rdsr", format!("{:02X}", c.rdsr).as_str()))
                                .with_attribute(("wren", format!("{:02X}", c.wren).as_str()))
                                .with_attribute(("wrdi", format!("{:02X}", c.wrdi).as_str()))
                                .with_attribute((
                                    "addressBytes",
                                    c.address_bytes.to_string().as_str(),
                                ))
                                .write_empty()?;
                        }
                        let t = &chip.timing;
                        writer
                            .create_element("Timing")
                            .with_attribute((
                                "pageProgramMs",
                                t.page_program_ms.to_string().as_str(),
                            ))
                            .with_attribute((
                                "sectorEraseMs",
                                t.sector_erase_ms.to_string().as_str(),
                            ))
                            .with_attribute(("blockEraseMs", t.block_erase_ms.to_string().as_str()))
                            .with_attribute(("chipEraseMs", t.chip_erase_ms.to_string().as_str()))
                            .write_empty()?;
                        Ok(())
                    })?;
            }
            Ok(())
        })
        .map_err(|e| Error::new(crate::error::Kind::ProtocolError, e.to_string()))?;

    String::from_utf8(writer.into_inner())
        .map_err(|e| Error::new(crate::error::Kind::Internal, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_built_in_database() {
        let db = ChipDatabase::built_in();
        let xml = to_string(&db).unwrap();
        let loaded = parse(&xml).unwrap();
        assert_eq!(loaded.len(), db.len());
        let original = db.find_by_id_str("w25q32").unwrap();
        let reloaded = loaded.find_by_id_str("w25q32").unwrap();
        assert_eq!(original.memory_id, reloaded.memory_id);
        assert_eq!(original.size_bytes, reloaded.size_bytes);
        assert_eq!(original.page_size, reloaded.page_size);
    }

    #[test]
    fn missing_commands_falls_back_to_spi_defaults() {
        let xml = r#"<ChipDatabase>
            <Chip id="x" name="X" manufacturer="Winbond" protocol="spi"
                  size="1048576" pageSize="256" sectorSize="4096" blockSize="65536"
                  manufacturerId="EF" deviceId="1234">
              <Timing pageProgramMs="5" sectorEraseMs="400" blockEraseMs="2000" chipEraseMs="50000"/>
            </Chip>
        </ChipDatabase>"#;
        let db = parse(xml).unwrap();
        let chip = db.find_by_id_str("x").unwrap();
        assert_eq!(chip.commands, SpiCommands::default());
        assert!(!chip.explicit_commands);
    }

    #[test]
    fn unknown_attributes_are_ignored() {
        let xml = r#"<ChipDatabase>
            <Chip id="x" name="X" manufacturer="Winbond" protocol="spi"
                  size="1048576" pageSize="256" sectorSize="4096" blockSize="65536"
                  manufacturerId="EF" deviceId="1234" futureField="whatever">
            </Chip>
        </ChipDatabase>"#;
        let db = parse(xml).unwrap();
        assert_eq!(db.len(), 1);
    }
}
