//! End-to-end scenarios exercising the cache and inode layer together
//! through the public `FileSystem` surface.

use std::sync::Arc;
use std::thread;

use rv6fs_core::{BitmapFreeMap, FileSystem, FreeMap, MemBlockDevice};

fn mounted(num_sectors: usize) -> FileSystem<MemBlockDevice> {
    let _ = env_logger::try_init();
    let device = Arc::new(MemBlockDevice::new(num_sectors));
    let freemap: Arc<dyn FreeMap> = Arc::new(BitmapFreeMap::new(num_sectors));
    FileSystem::init(device, freemap, true).unwrap()
}

#[test]
fn blind_write_hit_rate() {
    let fs = mounted(256);
    fs.cache().reset();
    let sector = fs.allocate_inode_sector().unwrap();

    fs.cache().write(sector, &[0xABu8; 512], 0, 512);
    let mut out = [0u8; 512];
    fs.cache().read(sector, &mut out, 0, 512);

    assert_eq!(out, [0xABu8; 512]);
    assert_eq!(fs.access_count(), 2);
    assert_eq!(fs.hit_count(), 1);
}

#[test]
fn cold_vs_warm_sequential_read() {
    let fs = mounted(256);
    let sector = fs.allocate_inode_sector().unwrap();
    fs.create(sector, 0, false).unwrap();
    let handle = fs.open(sector);

    let payload: Vec<u8> = (0..100u32).flat_map(|i| (i as u64).to_le_bytes()[..10].to_vec()).collect();
    fs.write_at(&handle, &payload, 0);

    fs.reset_instrumentation();

    let mut out = vec![0u8; 10];
    for i in 0..10u32 {
        fs.read_at(&handle, &mut out, i * 10);
    }
    let (h1, a1) = (fs.hit_count(), fs.access_count());

    for i in 0..10u32 {
        fs.read_at(&handle, &mut out, i * 10);
    }
    let h2 = fs.hit_count() - h1;
    let a2 = fs.access_count() - a1;

    assert!(h2 > h1, "warm pass ({h2} hits) should beat the cold pass ({h1} hits)");
    assert_eq!(a1, a2, "both passes touch the same sectors the same number of times");

    fs.close(&handle);
}

#[test]
fn write_coalescing_one_byte_at_a_time() {
    let fs = mounted(256);
    let sector = fs.allocate_inode_sector().unwrap();
    fs.create(sector, 65536, false).unwrap();
    let handle = fs.open(sector);
    fs.reset_instrumentation();

    for offset in 0..4069u32 * 16 {
        if offset as usize >= 65536 {
            break;
        }
        fs.write_at(&handle, &[offset as u8], offset);
    }

    let gap = fs.access_count() - fs.hit_count();
    assert!(
        gap < 1024,
        "expected same-sector hits to dominate (access-hit={gap})"
    );

    fs.close(&handle);
}

#[test]
fn extension_allocates_and_persists() {
    let fs = mounted(256);
    let sector = fs.allocate_inode_sector().unwrap();
    fs.create(sector, 0, false).unwrap();
    let handle = fs.open(sector);

    let payload = vec![0x7Eu8; 600];
    let written = fs.write_at(&handle, &payload, 0);
    assert_eq!(written, 600);

    let mut out = vec![0u8; 600];
    let read = fs.read_at(&handle, &mut out, 0);
    assert_eq!(read, 600);
    assert_eq!(out, payload);

    fs.close(&handle);
}

#[test]
fn independent_file_descriptor_positions() {
    let fs = mounted(256);
    let sector = fs.allocate_inode_sector().unwrap();
    fs.create(sector, 0, false).unwrap();

    let writer = fs.open(sector);
    fs.write_at(&writer, b"AB", 0);
    fs.close(&writer);

    let first = fs.open(sector);
    let second = fs.open(sector);

    let mut a = [0u8; 1];
    let mut b = [0u8; 1];
    fs.read_at(&first, &mut a, 0);
    fs.read_at(&second, &mut b, 0);
    assert_eq!(a, b);

    let mut next = [0u8; 1];
    fs.read_at(&first, &mut next, 1);
    assert_eq!(next, [b'B']);

    fs.close(&first);
    fs.close(&second);
}

#[test]
fn removed_on_last_close() {
    let device = Arc::new(MemBlockDevice::new(256));
    let freemap = Arc::new(BitmapFreeMap::new(256));
    let fs = FileSystem::init(Arc::clone(&device), Arc::clone(&freemap) as Arc<dyn FreeMap>, true).unwrap();

    let before = freemap.allocated_count();
    let sector = fs.allocate_inode_sector().unwrap();
    fs.create(sector, 100, false).unwrap();

    let first = fs.open(sector);
    let second = fs.open(sector);
    fs.remove(&first);
    fs.close(&first);

    let mut out = [0u8; 10];
    let read = fs.read_at(&second, &mut out, 0);
    assert_eq!(read, 10, "file stays readable while a handle remains open");

    fs.close(&second);
    assert_eq!(
        freemap.allocated_count(),
        before,
        "storage is returned to the free map once the last handle closes"
    );
}

#[test]
fn concurrent_readers_and_a_writer_stay_consistent() {
    let fs = Arc::new(mounted(256));
    let sector = fs.allocate_inode_sector().unwrap();
    fs.create(sector, 4096, false).unwrap();

    let writer_fs = Arc::clone(&fs);
    let writer = thread::spawn(move || {
        let handle = writer_fs.open(sector);
        for i in 0..4096u32 {
            writer_fs.write_at(&handle, &[(i % 251) as u8], i);
        }
        writer_fs.close(&handle);
    });

    let mut readers = Vec::new();
    for _ in 0..4 {
        let reader_fs = Arc::clone(&fs);
        readers.push(thread::spawn(move || {
            let handle = reader_fs.open(sector);
            let mut buf = [0u8; 4096];
            for _ in 0..20 {
                reader_fs.read_at(&handle, &mut buf, 0);
            }
            reader_fs.close(&handle);
        }));
    }

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }

    let handle = fs.open(sector);
    let mut out = [0u8; 4096];
    let n = fs.read_at(&handle, &mut out, 0);
    assert_eq!(n, 4096);
    for (i, &b) in out.iter().enumerate() {
        assert_eq!(b, (i as u32 % 251) as u8);
    }
    fs.close(&handle);
}
