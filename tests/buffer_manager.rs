use maplit::hashset;
use nova_memory::logging::{init_logging, LoggingConfig};
use nova_memory::memory::{BufferManager, ManagerError};
use nova_memory::rhi::headless::HeadlessDevice;
use nova_memory::rhi::{Buffer, BufferUsage, SharingMode};
use nova_memory::settings::MemorySettings;
use std::collections::{HashMap, HashSet};

fn init() {
    init_logging(LoggingConfig {
        env_filter: Some("nova_memory=debug".into()),
        is_test: true,
    });
}

#[test]
fn full_buffers_spill_into_new_ones() -> Result<(), ManagerError> {
    init();
    // 1024 partitions of 8 bytes: 8 KiB per buffer.
    let settings = MemorySettings::from_json(r#"{ "partitionSize": 8 }"#).unwrap();
    assert_eq!(settings.partition_count, 1024);
    let mut manager = BufferManager::new(HeadlessDevice::with_alignment(8), settings)?;

    let mut addresses = vec![manager.reserve_buffer(16, BufferUsage::VERTEX, SharingMode::Exclusive)?];
    for _ in 0..10 {
        addresses.push(manager.reserve_buffer(1024, BufferUsage::VERTEX, SharingMode::Exclusive)?);
    }
    assert_eq!(manager.buffer_count(), 2);

    let mut ranges: HashMap<_, Vec<(u64, u64)>> = HashMap::new();
    for &address in &addresses {
        let access = manager.get_buffer_access_data(address)?;
        assert!(access.offset + access.size <= access.buffer.size());
        ranges
            .entry(access.buffer_handle)
            .or_default()
            .push((access.offset, access.offset + access.size));
    }

    for (_, mut ranges) in ranges {
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }

    let ids: HashSet<u64> = manager.buffers().map(|(_, buffer)| buffer.id()).collect();
    assert_eq!(ids, hashset! {0, 1});

    Ok(())
}

#[test]
fn released_space_is_reused_before_new_buffers() -> Result<(), ManagerError> {
    init();
    let settings = MemorySettings {
        partition_size: 64,
        partition_count: 4,
        ..MemorySettings::default()
    };
    let mut manager = BufferManager::new(HeadlessDevice::new(), settings)?;

    let first = manager.reserve_buffer(128, BufferUsage::UNIFORM, SharingMode::HostVisible)?;
    let second = manager.reserve_buffer(128, BufferUsage::UNIFORM, SharingMode::HostVisible)?;
    let first_offset = manager.get_buffer_access_data(first)?.offset;

    manager.release_address(first)?;
    let third = manager.reserve_buffer(100, BufferUsage::UNIFORM, SharingMode::HostVisible)?;

    assert_eq!(manager.buffer_count(), 1);
    assert_eq!(manager.get_buffer_access_data(third)?.offset, first_offset);
    assert_eq!(manager.address_count(), 2);

    manager.release_address(second)?;
    manager.release_address(third)?;
    let buffer = manager.buffers().map(|(handle, _)| handle).next().unwrap();
    manager.release_buffer(buffer)?;
    assert_eq!(manager.buffer_count(), 0);
    assert_eq!(manager.buffers_created(), 1);

    Ok(())
}

#[test]
fn uploads_and_readbacks_work_for_both_sharing_modes() -> Result<(), ManagerError> {
    init();
    let mut manager = BufferManager::new(HeadlessDevice::new(), MemorySettings::default())?;
    let data: Vec<u8> = (0..=255).collect();

    for &sharing in &[SharingMode::HostVisible, SharingMode::Exclusive] {
        let address = manager.reserve_buffer(data.len() as u64, BufferUsage::STORAGE, sharing)?;
        manager.copy_to_buffer(address, &data)?;
        manager.flush_transfers()?;

        assert_eq!(manager.read_buffer(address)?, data);
        manager.release_address(address)?;
    }

    assert_eq!(manager.address_count(), 0);
    assert_eq!(manager.pending_transfer_count(), 0);

    Ok(())
}
