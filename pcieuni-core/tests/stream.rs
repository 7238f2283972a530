// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! End-to-end streaming tests against the simulated board.

use std::sync::Arc;
use std::time::Duration;

use pcieuni::{
    pattern_byte, BoardDevice, CancelToken, DeviceConfig, DeviceId, DeviceRegistry,
    EngineTimeouts, Error, RegWidth, SimBoard, SimConfig, DMA_QUANTUM,
};

const BUFFER_SIZE: usize = 64 * 1024;

fn test_config() -> DeviceConfig {
    DeviceConfig {
        buffer_count: 2,
        buffer_size: BUFFER_SIZE,
        timeouts: EngineTimeouts {
            acquire: Duration::from_millis(500),
            reserve: Duration::from_millis(500),
            completion: Duration::from_millis(300),
        },
    }
}

fn attach() -> (DeviceRegistry, Arc<SimBoard>, Arc<BoardDevice>) {
    let registry = DeviceRegistry::new();
    let board = SimBoard::new(SimConfig::default());
    let device = registry
        .attach(DeviceId(0), board.clone(), test_config())
        .expect("attach failed");
    (registry, board, device)
}

fn expected(device_offset: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| pattern_byte(device_offset + i as u64)).collect()
}

#[test]
fn test_stream_read_200000_bytes_in_four_chunks() {
    let (_registry, board, device) = attach();

    let total = 200000usize;
    let mut sink = vec![0u8; total];
    let n = device.read_transfer(0, total, &mut sink, None).unwrap();

    assert_eq!(n, total);
    assert_eq!(sink, expected(0, total));
    // 3 full buffers plus the rounded remainder: exactly 4 transfers for
    // a 2-buffer pool.
    assert_eq!(board.transfers_completed(), 4);
}

#[test]
fn test_small_read_uses_single_chunk() {
    let (_registry, board, device) = attach();

    let mut sink = vec![0u8; 1000];
    let n = device.read_transfer(0x2_0000, 1000, &mut sink, None).unwrap();

    assert_eq!(n, 1000);
    assert_eq!(sink, expected(0x2_0000, 1000));
    assert_eq!(board.transfers_completed(), 1);
}

#[test]
fn test_read_delivers_offset_correct_data() {
    let (_registry, _board, device) = attach();

    let offset = 3 * DMA_QUANTUM as u64;
    let len = BUFFER_SIZE + DMA_QUANTUM; // spans two chunks
    let mut sink = vec![0u8; len];
    device.read_transfer(offset, len, &mut sink, None).unwrap();

    assert_eq!(sink, expected(offset, len));
}

#[test]
fn test_two_phase_request_wait_protocol() {
    let (_registry, _board, device) = attach();

    let (_, buffer_size) = device.pool_info();
    let total = 3 * buffer_size;
    let mut sink = vec![0u8; total];

    // Caller-side pipelining, the point of the two-phase protocol: keep
    // one chunk in flight while draining the previous one.
    let first = total.min(buffer_size);
    device.request_transfer(0, first, None).unwrap();
    let mut in_flight = Some((0u64, first));
    let mut requested = first;
    let mut delivered = 0usize;

    while let Some((offset, len)) = in_flight.take() {
        if requested < total {
            let next_len = (total - requested).min(buffer_size);
            device
                .request_transfer(requested as u64, next_len, None)
                .unwrap();
            in_flight = Some((requested as u64, next_len));
            requested += next_len;
        }
        let n = device
            .wait_transfer(offset, len, &mut sink[delivered..delivered + len], None)
            .unwrap();
        assert_eq!(n, len);
        delivered += n;
    }

    assert_eq!(delivered, total);
    assert_eq!(sink, expected(0, total));
}

#[test]
fn test_wait_without_request_is_not_found() {
    let (_registry, _board, device) = attach();
    let mut sink = vec![0u8; 4096];
    let err = device.wait_transfer(0x5000, 4096, &mut sink, None).unwrap_err();
    assert_eq!(err, Error::NotFound);
}

#[test]
fn test_lost_interrupt_times_out_and_recovers_channel() {
    let (_registry, board, device) = attach();

    board.lose_next_irq();
    let mut sink = vec![0u8; 4096];
    let err = device.read_transfer(0, 4096, &mut sink, None).unwrap_err();
    assert_eq!(err, Error::Timeout);

    // The forced release must leave the channel reservable: the next
    // transfer goes through untouched.
    assert!(device.engine().reservation().is_idle());
    let n = device.read_transfer(0x1000, 4096, &mut sink, None).unwrap();
    assert_eq!(n, 4096);
    assert_eq!(sink, expected(0x1000, 4096));
}

#[test]
fn test_register_write_failure_rolls_back() {
    let (_registry, board, device) = attach();

    board.fail_register_writes(true);
    let mut sink = vec![0u8; 4096];
    let err = device.read_transfer(0, 4096, &mut sink, None).unwrap_err();
    assert!(matches!(err, Error::RegisterIo { .. }));

    // Buffer back to Free, channel idle: retry succeeds.
    board.fail_register_writes(false);
    assert!(device.engine().reservation().is_idle());
    device.read_transfer(0, 4096, &mut sink, None).unwrap();
    assert_eq!(sink, expected(0, 4096));
}

#[test]
fn test_mapped_path_defers_release() {
    let (_registry, _board, device) = attach();

    let (count, buffer_size) = device.pool_info();
    assert_eq!(count, 2);

    let mapped = device.map_region(buffer_size).unwrap();
    assert_eq!(mapped.block_count(), 2);
    assert_eq!(mapped.block_size(), buffer_size);

    device.request_transfer(0x8000, buffer_size, None).unwrap();
    let driver_offset = device.wait_mapped(0x8000, buffer_size, None).unwrap();

    let block = mapped.block(driver_offset).unwrap();
    assert_eq!(block, &expected(0x8000, buffer_size)[..]);

    // The buffer is still held: with one of two buffers out, two more
    // concurrent chunks cannot both be resident.
    device.release_mapped(driver_offset).unwrap();

    // After the acknowledgment the full pool is available again.
    let mut sink = vec![0u8; 2 * buffer_size];
    device
        .read_transfer(0, 2 * buffer_size, &mut sink, None)
        .unwrap();
    assert_eq!(sink, expected(0, 2 * buffer_size));
}

#[test]
fn test_map_region_validates_block_size() {
    let (_registry, _board, device) = attach();
    let err = device.map_region(4096).unwrap_err();
    assert_eq!(err, Error::InvalidArgument("mapping size != buffer size"));
}

#[test]
fn test_register_loopback_contract() {
    let (_registry, _board, device) = attach();

    device.reg_write(0, 0x200, RegWidth::Dword, 1).unwrap();
    assert_eq!(device.reg_read(0, 0x200, RegWidth::Dword).unwrap(), 1);

    // Width and alignment violations.
    assert!(device.reg_read(0, 0x201, RegWidth::Dword).is_err());
    assert!(device.reg_read(0, 0x201, RegWidth::Word).is_err());
    assert!(device.reg_write(9, 0, RegWidth::Dword, 0).is_err());
    assert!(device.reg_write(0, 0x200, RegWidth::Byte, 0x1FF).is_err());
}

#[test]
fn test_device_introspection() {
    let (_registry, _board, device) = attach();

    let info = device.device_info().unwrap();
    assert_eq!(info.firmware_version, SimConfig::default().firmware_version);
    assert_eq!(info.slot_number, SimConfig::default().slot_number);
    assert_eq!(info.bar_mask, 0b111);

    let mut sink = vec![0u8; 4096];
    device.read_transfer(0, 4096, &mut sink, None).unwrap();
    let times = device.dma_time();
    let start = times.start.expect("start time recorded");
    let stop = times.stop.expect("stop time recorded");
    assert!(stop >= start);
}

#[test]
fn test_concurrent_streams_deliver_exact_bytes() {
    let (_registry, _board, device) = attach();

    let mut handles = Vec::new();
    for i in 0..4u64 {
        let device = Arc::clone(&device);
        handles.push(std::thread::spawn(move || {
            let offset = i * 0x10_0000;
            let len = 100_000usize;
            let mut sink = vec![0u8; len];
            let n = device.read_transfer(offset, len, &mut sink, None).unwrap();
            assert_eq!(n, len);
            assert_eq!(sink, expected(offset, len));
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_cancelled_wait_reports_interrupted() {
    let (_registry, _board, device) = attach();

    let (_, buffer_size) = device.pool_info();
    // Occupy both buffers so the next stream has to sleep for one.
    device.request_transfer(0, buffer_size, None).unwrap();
    device
        .request_transfer(buffer_size as u64, buffer_size, None)
        .unwrap();

    let token = CancelToken::new();
    token.cancel();
    let mut sink = vec![0u8; 4096];
    let err = device
        .read_transfer(0x40_0000, 4096, &mut sink, Some(&token))
        .unwrap_err();
    assert_eq!(err, Error::Interrupted);

    // Drain the two outstanding chunks.
    let mut chunk = vec![0u8; buffer_size];
    device.wait_transfer(0, buffer_size, &mut chunk, None).unwrap();
    device
        .wait_transfer(buffer_size as u64, buffer_size, &mut chunk, None)
        .unwrap();
}

#[test]
fn test_invalid_stream_arguments() {
    let (_registry, _board, device) = attach();

    let mut sink = vec![0u8; 16];
    assert!(matches!(
        device.read_transfer(0, 0, &mut sink, None),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(
        device.read_transfer(0, 64, &mut sink, None).unwrap_err(),
        Error::TransferFault
    );
}

#[test]
fn test_detach_after_traffic() {
    let registry = DeviceRegistry::new();
    let board = SimBoard::new(SimConfig::default());
    let device = registry
        .attach(DeviceId(3), board.clone(), test_config())
        .unwrap();

    let mut sink = vec![0u8; 8192];
    device.read_transfer(0, 8192, &mut sink, None).unwrap();

    registry.detach(DeviceId(3)).unwrap();
    assert!(registry.get(DeviceId(3)).is_none());
    assert_eq!(registry.detach(DeviceId(3)).unwrap_err(), Error::Detached);

    // Duplicate attach under a taken id must be refused.
    let device2 = registry
        .attach(DeviceId(4), board.clone(), test_config())
        .unwrap();
    assert_eq!(
        registry
            .attach(DeviceId(4), board, test_config())
            .unwrap_err(),
        Error::AlreadyAttached(4)
    );
    drop(device2);
}
