//! Integration tests for guest memory overlays.
//!
//! The guest is an in-memory snapshot with hand-built long mode page tables, so virtual
//! overlays exercise the full translate-per-page path.

use std::sync::Arc;

use vmscope::{
    arch::x86::{Cr0, Cr4, Efer, PageTableEntry, Registers},
    event::{context, Event, EventDetail},
    prelude::*,
    Result,
};

const CR3: u64 = 0x1000;

/// Maps VA 0x40_0000 -> PA 0x8000 and VA 0x40_1000 -> PA 0x6000. VA 0x40_2000 is not present.
fn guest() -> Arc<SnapshotMemory> {
    let memory = SnapshotMemory::new();
    let flags = (PageTableEntry::PRESENT | PageTableEntry::WRITABLE).bits();
    let entry = |frame: u64| (frame | flags).to_le_bytes();

    memory.load(CR3, &entry(0x2000)).unwrap();
    memory.load(0x2000, &entry(0x3000)).unwrap();
    memory.load(0x3000 + 2 * 8, &entry(0x4000)).unwrap();
    memory.load(0x4000, &entry(0x8000)).unwrap();
    memory.load(0x4000 + 8, &entry(0x6000)).unwrap();

    memory.load(0x8ff8, &1u32.to_le_bytes()).unwrap();
    memory.load(0x8ffc, &2u32.to_le_bytes()).unwrap();
    memory.load(0x6000, &3u32.to_le_bytes()).unwrap();
    memory.load(0x6004, &4u32.to_le_bytes()).unwrap();
    Arc::new(memory)
}

fn long_mode_event() -> Arc<Event> {
    let registers = Registers {
        cr0: Cr0::PE | Cr0::PG,
        cr3: CR3,
        cr4: Cr4::PAE,
        efer: Efer::LME | Efer::LMA,
        ..Default::default()
    };
    Arc::new(Event::new(
        1,
        0,
        0,
        Arc::new(registers),
        EventDetail::SingleStep,
    ))
}

fn read_u32(memory: &SnapshotMemory, address: u64) -> u32 {
    let mut raw = [0u8; 4];
    memory
        .read_physical(GuestPhysicalAddress::new(address), &mut raw)
        .unwrap();
    u32::from_le_bytes(raw)
}

#[test]
fn test_virtual_overlay_spans_discontiguous_pages() -> Result<()> {
    let memory = guest();
    let _scope = context::enter(long_mode_event());

    let address = GuestVirtualAddress::from_active_event(0x40_0ff8)?;
    let values = GuestPtr::<u32>::new(memory.clone(), address.into(), 4)?;
    assert_eq!(values.read_all()?, vec![1, 2, 3, 4]);

    // read-your-writes before any flush
    values.set(3, 0x44)?;
    assert_eq!(values.get(3)?, 0x44);
    assert!(values.is_dirty());
    assert_eq!(read_u32(&memory, 0x6004), 4);

    values.commit()?;
    assert!(!values.is_dirty());
    assert_eq!(read_u32(&memory, 0x6004), 0x44);
    Ok(())
}

#[test]
fn test_not_present_page_is_an_error() -> Result<()> {
    let memory = guest();
    let _scope = context::enter(long_mode_event());

    // Construction records intent only.
    let address = GuestVirtualAddress::from_active_event(0x40_2000)?;
    let values = GuestPtr::<u64>::new(memory, address.into(), 2)?;
    assert!(!values.is_cached());

    match values.get(0) {
        Err(Error::MemoryAccess { fault, space, .. }) => {
            assert_eq!(fault, MemoryFault::NotPresent);
            assert_eq!(space, AddressSpace::Virtual);
        }
        other => panic!("expected a memory access error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_bounds_are_enforced() -> Result<()> {
    let memory = guest();
    let values = GuestPtr::<u32>::new(
        memory,
        GuestPhysicalAddress::new(0x6000).into(),
        2,
    )?;

    assert_eq!(values.get(1)?, 4);
    assert!(matches!(values.get(2), Err(Error::OutOfBounds)));
    assert!(matches!(values.read_at::<u64>(4), Err(Error::OutOfBounds)));
    assert!(matches!(values.set(2, 0), Err(Error::OutOfBounds)));
    assert!(matches!(values.subview(1, 2), Err(Error::OutOfBounds)));
    Ok(())
}

#[test]
fn test_overlay_decodes_little_endian_elements() -> Result<()> {
    let bytes = [0x34, 0x12, 0xcd, 0xab, 0x01, 0x00];
    let memory = Arc::new(SnapshotMemory::with_data(0x7000, &bytes)?);
    let words = GuestPtr::<u16>::new(memory, GuestPhysicalAddress::new(0x7000).into(), 3)?;

    let expected: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    assert_eq!(words.read_all()?, expected);
    Ok(())
}

#[test]
fn test_staleness_is_explicit() -> Result<()> {
    let memory = guest();
    let value = GuestPtr::<u32>::new(memory.clone(), GuestPhysicalAddress::new(0x6000).into(), 1)?;
    assert!(!value.is_stale());
    assert_eq!(value.get(0)?, 3);

    // The guest runs and changes the value.
    memory.load(0x6000, &30u32.to_le_bytes())?;
    memory.advance_epoch();

    assert!(value.is_stale());
    assert_eq!(value.get(0)?, 3);

    value.refresh()?;
    assert_eq!(value.get(0)?, 30);
    assert!(!value.is_stale());

    value.set(0, 31)?;
    assert!(matches!(value.refresh(), Err(Error::InvalidMethod(_))));
    value.discard();
    assert_eq!(value.get(0)?, 30);
    Ok(())
}

#[test]
fn test_failed_commit_keeps_writes() -> Result<()> {
    let memory = guest();
    let value = GuestPtr::<u32>::new(memory.clone(), GuestPhysicalAddress::new(0x6000).into(), 1)?;
    assert_eq!(value.get(0)?, 3);

    memory.unmap(0x6000);
    value.set(0, 7)?;
    assert!(matches!(value.commit(), Err(Error::MemoryAccess { .. })));
    assert!(value.is_dirty());
    assert_eq!(value.get(0)?, 7);

    value.discard();
    Ok(())
}

#[test]
fn test_strings_are_capped() -> Result<()> {
    let mut wide: Vec<u8> = "\\Device\\HarddiskVolume2"
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect();
    wide.extend_from_slice(&[0, 0]);

    let snapshot = SnapshotMemory::with_data(0x9000, &wide)?;
    snapshot.load(0xa000, &[b'A'; 0x2000])?;
    let memory = GuestMemory::new(
        Arc::new(snapshot),
        MemoryConfig::new().with_max_string_length(0x100),
    );

    let path = memory.wstring(GuestPhysicalAddress::new(0x9000))?;
    assert_eq!(path.to_string_lossy()?, "\\Device\\HarddiskVolume2");

    // No terminator within the cap: the scan stops at the cap.
    let runaway = memory.cstring(GuestAddress::from(GuestPhysicalAddress::new(0xa000)))?;
    assert_eq!(runaway.len(), 0x100);
    Ok(())
}
