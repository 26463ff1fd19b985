//! Integration coverage for the scenarios and properties named in
//! `spec.md` §8 that aren't already exercised by a module's own unit tests.

use std::sync::{Arc, Mutex};

use memprog::adapter::{Adapter, AdapterKind, SimulatedAdapter};
use memprog::chip::{ChipDescriptor, Manufacturer};
use memprog::error::Kind;
use memprog::memory_id::MemoryId;
use memprog::orchestrator::Orchestrator;
use memprog::protocol::{MicrowireEngine, Protocol, SpiEngine};
use memprog::result::{CancellationToken, Observers};

fn w25q32() -> ChipDescriptor {
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

/// S2: program_and_verify over a full blank 4 MiB chip round-trips.
#[test]
fn s2_full_chip_program_and_verify_round_trips() {
    let mut orch = Orchestrator::new();
    orch.connect(AdapterKind::Simulated, None).unwrap();
    orch.select_chip(w25q32()).unwrap();

    let image = vec![0xAAu8; 4 * 1024 * 1024];
    let result = orch.program_and_verify(0, image.clone());
    assert!(result.is_ok(), "{:?}", result.message());

    let read = orch.read_memory(0, image.len() as u64);
    match read {
        memprog::result::OperationResult::Ok { value: Some(bytes), .. } => {
            assert_eq!(bytes, image)
        }
        other => panic!("expected full read-back to succeed, got {other:?}"),
    }
}

/// S3: a freshly simulated chip reads back as all-0xFF and blank_check
/// agrees.
#[test]
fn s3_fresh_chip_reads_blank() {
    let mut orch = Orchestrator::new();
    orch.connect(AdapterKind::Simulated, None).unwrap();
    orch.select_chip(w25q32()).unwrap();

    let read = orch.read_memory(0, 256);
    match read {
        memprog::result::OperationResult::Ok { value: Some(bytes), .. } => {
            assert!(bytes.iter().all(|&b| b == 0xFF));
        }
        other => panic!("expected blank read, got {other:?}"),
    }

    let blank = orch.blank_check(0, 4096);
    match blank {
        memprog::result::OperationResult::Ok { value: Some(true), .. } => {}
        other => panic!("expected blank_check(0, 4096) == true, got {other:?}"),
    }
}

/// S4: cancelling partway through a multi-chunk read surfaces `Cancelled`,
/// the last progress event is at or before the cancellation point, and the
/// adapter is still usable for a subsequent operation.
#[test]
fn s4_cancel_mid_read_stops_cleanly() {
    let descriptor = w25q32();
    let engine = SpiEngine::new(&descriptor);
    let mut adapter = SimulatedAdapter::spi_nor(4 * 1024 * 1024, 4096, [0xEF, 0x40, 0x16]);
    adapter.open(None).unwrap();

    let cancel = CancellationToken::new();
    let observers = Observers::new();
    let chunks_seen = Arc::new(Mutex::new(Vec::new()));
    let chunks_seen2 = chunks_seen.clone();
    let cancel_for_callback = cancel.clone();
    observers.subscribe_progress(move |p| {
        chunks_seen2.lock().unwrap().push(p.current_bytes);
        if p.current_bytes == 5 * 64 * 1024 {
            cancel_for_callback.cancel();
        }
    });

    let total = 8 * 64 * 1024u64;
    let result = engine.read(&mut adapter, 0, total, &observers, &cancel);
    let err = result.unwrap_err();
    assert_eq!(err.kind, Kind::Cancelled);

    let seen = chunks_seen.lock().unwrap();
    assert_eq!(*seen.last().unwrap(), 5 * 64 * 1024);

    // The adapter itself is untouched by cancellation; a fresh operation
    // against it still works.
    let cancel2 = CancellationToken::new();
    let observers2 = Observers::new();
    let retry = engine.read(&mut adapter, 0, 4096, &observers2, &cancel2);
    assert!(retry.is_ok());
}

/// S5: an 8-bit-address MicroWire chip rejects a write at the first
/// out-of-range word address.
#[test]
fn s5_microwire_rejects_out_of_range_write() {
    let descriptor = ChipDescriptor::new(
        "93c66",
        "93C66",
        Manufacturer::MicrochipAtmel,
        Protocol::MicroWire,
        512,
        2,
        2,
        512,
        MemoryId::BLANK,
    )
    .unwrap()
    .with_address_bits(8)
    .unwrap();
    let engine = MicrowireEngine::new(&descriptor).unwrap();
    let mut adapter = SimulatedAdapter::microwire(256);
    adapter.open(None).unwrap();

    let cancel = CancellationToken::new();
    let observers = Observers::new();
    let err = engine
        .write(&mut adapter, 0x100, &[0xAB, 0xCD], &observers, &cancel)
        .unwrap_err();
    assert_eq!(err.kind, Kind::InvalidArgument);
}

/// S6: JEDEC id decoding and its length validation.
#[test]
fn s6_memory_id_decodes_jedec_bytes_and_rejects_wrong_length() {
    let id = MemoryId::from_jedec([0xEF, 0x40, 0x16]);
    assert_eq!(id.manufacturer_id, 0xEF);
    assert_eq!(id.device_id, 0x4016);

    let err = MemoryId::from_jedec_slice(&[0xEF, 0x40]).unwrap_err();
    assert_eq!(err.kind, Kind::InvalidArgument);
}

/// Property 1 (round-trip), restated against the orchestrator's public API
/// rather than the engine directly, over a partial range.
#[test]
fn property_round_trip_partial_range() {
    let mut orch = Orchestrator::new();
    orch.connect(AdapterKind::Simulated, None).unwrap();
    orch.select_chip(w25q32()).unwrap();

    let data: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
    assert!(orch.program_and_verify(8192, data.clone()).is_ok());
    match orch.read_memory(8192, data.len() as u64) {
        memprog::result::OperationResult::Ok { value: Some(bytes), .. } => {
            assert_eq!(bytes, data)
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

/// Property 2 (idempotent close), restated at the orchestrator level.
#[test]
fn property_disconnect_is_idempotent() {
    let mut orch = Orchestrator::new();
    orch.connect(AdapterKind::Simulated, None).unwrap();
    assert!(orch.disconnect().is_ok());
    assert!(orch.disconnect().is_ok());
}
