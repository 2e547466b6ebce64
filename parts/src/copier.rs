// Concurrent raw sector copy: one reader thread filling a double buffer, one
// writer thread draining it. Used for disk-to-disk copies and partition
// pastes, where source and destination ranges never overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use carve_core::{BlockDevice, CarveError, Disk, Progress};
use log::{debug, error};

pub const BUFFER_SIZE: usize = 1_048_576;
pub const MIN_BUFFER_SIZE: usize = 65_536;

struct SlotState {
    data: Vec<u8>,
    full: bool,
    len: usize,
}

struct Slot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl Slot {
    fn new(data: Vec<u8>) -> Self {
        Slot {
            state: Mutex::new(SlotState {
                data,
                full: false,
                len: 0,
            }),
            changed: Condvar::new(),
        }
    }
}

/// Allocate one copy buffer, halving the size on allocation failure down to
/// the minimum.
fn alloc_buffer(size: &mut usize) -> Result<Vec<u8>, CarveError> {
    loop {
        let mut buf: Vec<u8> = Vec::new();
        if buf.try_reserve_exact(*size).is_ok() {
            buf.resize(*size, 0);
            return Ok(buf);
        }
        *size /= 2;
        if *size < MIN_BUFFER_SIZE {
            return Err(CarveError::NoSpace(
                "Unable to allocate memory buffer".to_string(),
            ));
        }
    }
}

fn reader_loop(
    dev: &mut dyn BlockDevice,
    start_sector: u64,
    num_sectors: u64,
    sector_size: u64,
    slots: &[Slot; 2],
    terminate: &AtomicBool,
) -> Result<(), CarveError> {
    let mut current_sector = start_sector;
    let mut do_sectors = num_sectors;
    let mut slot_index = 0usize;

    while do_sectors > 0 && !terminate.load(Ordering::SeqCst) {
        let slot = &slots[slot_index];
        let mut state = slot.state.lock().unwrap();
        while state.full && !terminate.load(Ordering::SeqCst) {
            state = slot.changed.wait(state).unwrap();
        }
        if terminate.load(Ordering::SeqCst) {
            break;
        }

        let sectors_per_op = ((state.data.len() as u64 / sector_size).min(do_sectors)).max(1);
        let len = (sectors_per_op * sector_size) as usize;
        if let Err(e) = dev.read_sectors(current_sector, sectors_per_op, &mut state.data[..len]) {
            error!(
                "Error reading {} sectors at {}: {}",
                sectors_per_op, current_sector, e
            );
            terminate.store(true, Ordering::SeqCst);
            slots[0].changed.notify_all();
            slots[1].changed.notify_all();
            return Err(e);
        }
        state.full = true;
        state.len = len;
        slot.changed.notify_all();
        drop(state);

        current_sector += sectors_per_op;
        do_sectors -= sectors_per_op;
        slot_index ^= 1;
    }

    Ok(())
}

fn writer_loop(
    dev: &mut dyn BlockDevice,
    start_sector: u64,
    num_sectors: u64,
    sector_size: u64,
    slots: &[Slot; 2],
    terminate: &AtomicBool,
    prog: &Progress,
) -> Result<(), CarveError> {
    let started = Instant::now();
    let mut current_sector = start_sector;
    let mut do_sectors = num_sectors;
    let mut slot_index = 0usize;

    while do_sectors > 0 && !terminate.load(Ordering::SeqCst) {
        let slot = &slots[slot_index];
        let mut state = slot.state.lock().unwrap();
        while !state.full && !terminate.load(Ordering::SeqCst) {
            state = slot.changed.wait(state).unwrap();
        }
        if terminate.load(Ordering::SeqCst) {
            break;
        }

        let sectors_per_op = state.len as u64 / sector_size;
        if let Err(e) = dev.write_sectors(current_sector, sectors_per_op, &state.data[..state.len])
        {
            error!(
                "Error writing {} sectors at {}: {}",
                sectors_per_op, current_sector, e
            );
            terminate.store(true, Ordering::SeqCst);
            slots[0].changed.notify_all();
            slots[1].changed.notify_all();
            return Err(e);
        }
        state.full = false;
        slot.changed.notify_all();
        drop(state);

        current_sector += sectors_per_op;
        do_sectors -= sectors_per_op;

        prog.update_with_eta(current_sector - start_sector, started, sectors_per_op);

        slot_index ^= 1;
    }

    Ok(())
}

/// Copy `num_sectors` raw sectors between devices through the double-buffer
/// pipeline. Device write caches are disabled for the duration and restored
/// afterwards, success or not. Cancellation is honored between chunks; on
/// cancel the destination may be partially written but the source is intact.
pub fn copy_data(
    src_disk: &Disk,
    src_dev: &mut dyn BlockDevice,
    src_sector: u64,
    dst_disk: &Disk,
    dst_dev: &mut dyn BlockDevice,
    dst_sector: u64,
    num_sectors: u64,
    prog: &Progress,
) -> Result<(), CarveError> {
    if src_disk.sector_size != dst_disk.sector_size {
        return Err(CarveError::Parameter(
            "Source and destination sector sizes differ".to_string(),
        ));
    }
    let sector_size = src_disk.sector_size as u64;

    let mut buffer_size = BUFFER_SIZE;
    let slots = [
        Slot::new(alloc_buffer(&mut buffer_size)?),
        Slot::new(alloc_buffer(&mut buffer_size)?),
    ];
    debug!(
        "Copying {} sectors with 2x{} byte buffers",
        num_sectors, buffer_size
    );

    prog.set_total(num_sectors);

    let src_cache = src_dev.cache_enabled();
    let dst_cache = dst_dev.cache_enabled();
    if src_cache {
        src_dev.set_cache_enabled(false);
    }
    if dst_cache {
        dst_dev.set_cache_enabled(false);
    }

    let terminate = AtomicBool::new(false);

    let result = std::thread::scope(|scope| {
        let reader = scope.spawn(|| {
            reader_loop(
                &mut *src_dev,
                src_sector,
                num_sectors,
                sector_size,
                &slots,
                &terminate,
            )
        });
        let writer = scope.spawn(|| {
            writer_loop(
                &mut *dst_dev,
                dst_sector,
                num_sectors,
                sector_size,
                &slots,
                &terminate,
                prog,
            )
        });

        // Poll for cancellation and for either task dying.
        while !reader.is_finished() || !writer.is_finished() {
            if prog.is_cancelled() {
                terminate.store(true, Ordering::SeqCst);
                slots[0].changed.notify_all();
                slots[1].changed.notify_all();
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let read_result = reader.join().expect("reader thread panicked");
        let write_result = writer.join().expect("writer thread panicked");

        if prog.is_cancelled() {
            return Err(CarveError::Cancelled);
        }
        read_result?;
        write_result?;
        Ok(())
    });

    // Flush whatever reached the destination, then restore caching.
    let flush_result = dst_dev.flush();
    if src_cache {
        src_dev.set_cache_enabled(true);
    }
    if dst_cache {
        dst_dev.set_cache_enabled(true);
    }

    result?;
    flush_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use carve_core::test_utils::MemoryDevice;

    #[test]
    fn test_copy_between_devices() {
        let src_disk = Disk::new("src", 512, 8192, 255, 63);
        let dst_disk = Disk::new("dst", 512, 8192, 255, 63);
        let mut src = MemoryDevice::new(8192, 512);
        let mut dst = MemoryDevice::new(8192, 512);

        for (i, b) in src.data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let prog = Progress::new(4096);
        copy_data(&src_disk, &mut src, 1024, &dst_disk, &mut dst, 2048, 4096, &prog).unwrap();

        let copied = &dst.data[2048 * 512..(2048 + 4096) * 512];
        let original = &src.data[1024 * 512..(1024 + 4096) * 512];
        assert_eq!(copied, original);
        assert_eq!(prog.snapshot().finished, 4096);
        assert!(dst.flush_count > 0);
    }

    #[test]
    fn test_copy_restores_cache_flags() {
        let disk = Disk::new("d", 512, 256, 16, 16);
        let mut src = MemoryDevice::new(256, 512);
        let mut dst = MemoryDevice::new(256, 512);
        assert!(src.cache_enabled());

        let prog = Progress::new(128);
        copy_data(&disk, &mut src, 0, &disk.clone(), &mut dst, 0, 128, &prog).unwrap();
        assert!(src.cache_enabled());
        assert!(dst.cache_enabled());
    }

    #[test]
    fn test_cancel_before_start() {
        let disk = Disk::new("d", 512, 4096, 255, 63);
        let mut src = MemoryDevice::new(4096, 512);
        let mut dst = MemoryDevice::new(4096, 512);

        let prog = Progress::new(4096);
        prog.request_cancel();
        match copy_data(&disk, &mut src, 0, &disk.clone(), &mut dst, 0, 4096, &prog) {
            Err(CarveError::Cancelled) => {}
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[test]
    fn test_short_tail_chunk() {
        // Not a multiple of the buffer size: the final chunk is shorter.
        let disk = Disk::new("d", 512, 2100, 16, 16);
        let mut src = MemoryDevice::new(2100, 512);
        let mut dst = MemoryDevice::new(2100, 512);
        for (i, b) in src.data.iter_mut().enumerate() {
            *b = (i % 13) as u8;
        }

        let prog = Progress::new(2100);
        copy_data(&disk, &mut src, 0, &disk.clone(), &mut dst, 0, 2100, &prog).unwrap();
        assert_eq!(src.data, dst.data);
    }
}
