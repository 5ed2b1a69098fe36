#![allow(unused)]
extern crate vmscope;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::{hint::black_box, sync::Arc};
use vmscope::{
    arch::x86::{translate, PageDirectory, PageTableEntry, PagingMode},
    prelude::*,
};

const CR3: u64 = 0x1000;
const IMAGE: u64 = 0x40_0000;
const PAGES: u64 = 16;

/// Long mode guest mapping `PAGES` pages at `IMAGE` onto scattered physical frames.
fn guest() -> (Arc<SnapshotMemory>, PageDirectory) {
    let memory = SnapshotMemory::new();
    let flags = (PageTableEntry::PRESENT | PageTableEntry::WRITABLE).bits();
    let entry = |frame: u64| (frame | flags).to_le_bytes();

    memory.load(CR3, &entry(0x2000)).unwrap();
    memory.load(0x2000, &entry(0x3000)).unwrap();
    memory.load(0x3000 + 2 * 8, &entry(0x4000)).unwrap();
    for page in 0..PAGES {
        // reverse order so neighbouring virtual pages are never physically adjacent
        let frame = 0x10_0000 + (PAGES - page) * 0x2000;
        memory.load(0x4000 + page * 8, &entry(frame)).unwrap();
        memory.load(frame, &vec![page as u8; 0x1000]).unwrap();
    }

    (
        Arc::new(memory),
        PageDirectory::new(GuestPhysicalAddress::new(CR3), PagingMode::Long4),
    )
}

/// Benchmark single page walks and full overlay fetches across page boundaries
///
/// The overlay fetch is dominated by one translation and one channel read per page, so the
/// two groups together show how much of a fetch is spent walking page tables.
fn bench_overlay(c: &mut Criterion) {
    let (memory, directory) = guest();

    let mut group = c.benchmark_group("translate");
    group.bench_function("long_mode_4k", |b| {
        b.iter(|| {
            let pa = translate(memory.as_ref(), directory, black_box(IMAGE + 0x3123)).unwrap();
            black_box(pa)
        });
    });
    group.finish();

    let size = (PAGES * 0x1000) as usize;
    let address = GuestVirtualAddress::new(IMAGE, directory).unwrap();

    let mut group = c.benchmark_group("guest_ptr");
    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function("virtual_fetch", |b| {
        b.iter(|| {
            let bytes = GuestPtr::<u8>::new(memory.clone(), address.into(), size).unwrap();
            black_box(bytes.bytes().unwrap())
        });
    });
    group.bench_function("physical_fetch", |b| {
        let start = GuestPhysicalAddress::new(0x10_2000);
        b.iter(|| {
            let bytes = GuestPtr::<u8>::new(memory.clone(), start.into(), 0x1000).unwrap();
            black_box(bytes.bytes().unwrap())
        });
    });
    group.bench_function("cached_u64_reads", |b| {
        let words = GuestPtr::<u64>::new(memory.clone(), address.into(), size / 8).unwrap();
        words.refresh().unwrap();
        b.iter(|| {
            let mut sum = 0u64;
            for index in 0..words.len() {
                sum = sum.wrapping_add(words.get(index).unwrap());
            }
            black_box(sum)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_overlay);
criterion_main!(benches);
