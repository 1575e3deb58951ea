#![forbid(unsafe_code)]
//! File API behavior against a RAM-backed device.

use ember_block::RamBlockDevice;
use ember_core::{format, Fs, OpenFlags};
use ember_error::EmberError;
use ember_types::Geometry;
use std::io::SeekFrom;
use std::sync::Arc;

fn geo() -> Geometry {
    Geometry {
        read_size: 16,
        prog_size: 16,
        block_size: 256,
        block_count: 64,
        cache_size: 64,
        lookahead_size: 16,
        block_cycles: 0,
        inline_max: 64,
    }
}

fn fresh_fs(geo: &Geometry) -> (Arc<RamBlockDevice>, Fs) {
    let dev = Arc::new(RamBlockDevice::new(geo));
    format(&*dev, geo).expect("format");
    let fs = Fs::mount(dev.clone(), *geo).expect("mount");
    (dev, fs)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn small_round_trip_with_rewind_and_tell() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("file1.txt", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    let msg = vec![b'1'; 26];
    assert_eq!(fs.file_write(fh, &msg).unwrap(), 26);
    assert_eq!(fs.file_tell(fh).unwrap(), 26);

    fs.file_rewind(fh).unwrap();
    assert_eq!(fs.file_tell(fh).unwrap(), 0);

    let mut buf = [0u8; 100];
    let n = fs.file_read(fh, &mut buf).unwrap();
    assert_eq!(n, 26);
    assert_eq!(&buf[..n], msg.as_slice());
    assert_eq!(fs.file_tell(fh).unwrap(), 26);

    fs.file_close(fh).unwrap();
}

#[test]
fn contents_survive_remount() {
    let geo = geo();
    let (dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("persist.bin", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    let data = pattern(1000);
    fs.file_write(fh, &data).unwrap();
    fs.file_close(fh).unwrap();
    fs.unmount().unwrap();

    let mut fs = Fs::mount(dev, geo).expect("remount");
    let fh = fs.file_open("persist.bin", OpenFlags::READ_ONLY).unwrap();
    let mut buf = vec![0u8; 2000];
    let n = fs.file_read(fh, &mut buf).unwrap();
    assert_eq!(n, 1000);
    assert_eq!(&buf[..n], data.as_slice());
    fs.file_close(fh).unwrap();
}

#[test]
fn inline_threshold_controls_block_allocation() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);
    // Only the root pair is in use on a fresh filesystem.
    assert_eq!(fs.fs_size().unwrap(), 2);

    let fh = fs
        .file_open("small", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.file_write(fh, &vec![7u8; geo.inline_max as usize]).unwrap();
    fs.file_close(fh).unwrap();
    // At the threshold the file stays inline: no data blocks.
    assert_eq!(fs.fs_size().unwrap(), 2);

    let fh = fs
        .file_open("large", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.file_write(fh, &vec![7u8; geo.inline_max as usize + 1]).unwrap();
    fs.file_close(fh).unwrap();
    // One byte past the threshold migrates to exactly one data block.
    assert_eq!(fs.fs_size().unwrap(), 3);
}

#[test]
fn multi_block_write_and_random_seek() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("big", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    let data = pattern(5000);
    fs.file_write(fh, &data).unwrap();
    fs.file_sync(fh).unwrap();

    // Random-access reads across block boundaries.
    for &(off, len) in &[(0usize, 16usize), (250, 20), (255, 2), (4990, 10), (1234, 777)] {
        let pos = fs.file_seek(fh, SeekFrom::Start(off as u64)).unwrap();
        assert_eq!(pos, off as u64);
        let mut buf = vec![0u8; len];
        let n = fs.file_read(fh, &mut buf).unwrap();
        assert_eq!(n, len.min(5000 - off));
        assert_eq!(&buf[..n], &data[off..off + n]);
    }

    // Seek relative to current and end.
    fs.file_seek(fh, SeekFrom::Start(100)).unwrap();
    assert_eq!(fs.file_seek(fh, SeekFrom::Current(50)).unwrap(), 150);
    assert_eq!(fs.file_seek(fh, SeekFrom::End(-1)).unwrap(), 4999);
    assert!(matches!(
        fs.file_seek(fh, SeekFrom::Current(-5000)),
        Err(EmberError::InvalidSeek)
    ));
    fs.file_close(fh).unwrap();
}

#[test]
fn mid_file_overwrite_preserves_tail() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("cow", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    let mut expected = pattern(3000);
    fs.file_write(fh, &expected).unwrap();

    fs.file_seek(fh, SeekFrom::Start(700)).unwrap();
    fs.file_write(fh, &[0xEE; 100]).unwrap();
    expected[700..800].fill(0xEE);

    fs.file_rewind(fh).unwrap();
    let mut buf = vec![0u8; 3000];
    let n = fs.file_read(fh, &mut buf).unwrap();
    assert_eq!(n, 3000);
    assert_eq!(buf, expected);
    fs.file_close(fh).unwrap();
}

#[test]
fn write_past_end_zero_fills_the_gap() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("sparse", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.file_write(fh, b"head").unwrap();
    fs.file_seek(fh, SeekFrom::Start(600)).unwrap();
    fs.file_write(fh, b"tail").unwrap();

    fs.file_rewind(fh).unwrap();
    let mut buf = vec![0xAAu8; 700];
    let n = fs.file_read(fh, &mut buf).unwrap();
    assert_eq!(n, 604);
    assert_eq!(&buf[..4], b"head");
    assert!(buf[4..600].iter().all(|&b| b == 0), "gap must read as zeros");
    assert_eq!(&buf[600..604], b"tail");
    fs.file_close(fh).unwrap();
}

#[test]
fn truncate_shrinks_and_grows() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("trunc", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    let data = pattern(2000);
    fs.file_write(fh, &data).unwrap();

    fs.file_truncate(fh, 500).unwrap();
    assert_eq!(fs.file_size(fh).unwrap(), 500);
    fs.file_rewind(fh).unwrap();
    let mut buf = vec![0u8; 2000];
    let n = fs.file_read(fh, &mut buf).unwrap();
    assert_eq!(n, 500);
    assert_eq!(&buf[..500], &data[..500]);

    fs.file_truncate(fh, 800).unwrap();
    assert_eq!(fs.file_size(fh).unwrap(), 800);
    fs.file_rewind(fh).unwrap();
    let n = fs.file_read(fh, &mut buf).unwrap();
    assert_eq!(n, 800);
    assert_eq!(&buf[..500], &data[..500]);
    assert!(buf[500..800].iter().all(|&b| b == 0));

    // Shrinking an outlined file never re-inlines it.
    fs.file_truncate(fh, 3).unwrap();
    fs.file_close(fh).unwrap();
    assert!(fs.fs_size().unwrap() > 2);
}

#[test]
fn append_flag_always_writes_at_end() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("log", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.file_write(fh, b"one").unwrap();
    fs.file_close(fh).unwrap();

    let fh = fs
        .file_open("log", OpenFlags::READ_WRITE | OpenFlags::APPEND)
        .unwrap();
    fs.file_rewind(fh).unwrap();
    fs.file_write(fh, b"two").unwrap();
    fs.file_rewind(fh).unwrap();
    let mut buf = [0u8; 16];
    let n = fs.file_read(fh, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"onetwo");
    fs.file_close(fh).unwrap();
}

#[test]
fn truncate_flag_discards_existing_content() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("t", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.file_write(fh, &pattern(1500)).unwrap();
    fs.file_close(fh).unwrap();

    let fh = fs
        .file_open("t", OpenFlags::READ_WRITE | OpenFlags::TRUNCATE)
        .unwrap();
    assert_eq!(fs.file_size(fh).unwrap(), 0);
    fs.file_write(fh, b"short").unwrap();
    fs.file_close(fh).unwrap();

    let fh = fs.file_open("t", OpenFlags::READ_ONLY).unwrap();
    let mut buf = [0u8; 32];
    let n = fs.file_read(fh, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"short");
    fs.file_close(fh).unwrap();
}

#[test]
fn open_error_taxonomy() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    assert!(matches!(
        fs.file_open("missing", OpenFlags::READ_ONLY),
        Err(EmberError::NotFound(_))
    ));

    let fh = fs
        .file_open("exists", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.file_close(fh).unwrap();
    assert!(matches!(
        fs.file_open(
            "exists",
            OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::EXCL
        ),
        Err(EmberError::Exists(_))
    ));

    fs.mkdir("dir").unwrap();
    assert!(matches!(
        fs.file_open("dir", OpenFlags::READ_ONLY),
        Err(EmberError::IsDirectory)
    ));
    assert!(matches!(
        fs.file_open("exists/inner", OpenFlags::READ_ONLY),
        Err(EmberError::NotDirectory)
    ));

    // Writes through a read-only handle are rejected.
    let fh = fs.file_open("exists", OpenFlags::READ_ONLY).unwrap();
    assert!(matches!(
        fs.file_write(fh, b"no"),
        Err(EmberError::ReadOnly)
    ));
    fs.file_close(fh).unwrap();

    // A closed handle is dead.
    assert!(matches!(
        fs.file_read(fh, &mut [0u8; 4]),
        Err(EmberError::BadHandle)
    ));
}

#[test]
fn directories_nest_and_list() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    fs.mkdir("etc").unwrap();
    fs.mkdir("etc/conf.d").unwrap();
    let fh = fs
        .file_open("etc/conf.d/net", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.file_write(fh, b"dhcp").unwrap();
    fs.file_close(fh).unwrap();

    let listing = fs.read_dir("etc").unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "conf.d");

    let stat = fs.stat("etc/conf.d/net").unwrap();
    assert_eq!(stat.size, 4);

    // Parent traversal resolves against the walk stack.
    let stat = fs.stat("etc/conf.d/../conf.d/net").unwrap();
    assert_eq!(stat.name, "net");

    assert!(matches!(fs.mkdir("etc"), Err(EmberError::Exists(_))));
    assert!(matches!(fs.remove("etc"), Err(EmberError::NotEmpty)));

    fs.remove("etc/conf.d/net").unwrap();
    fs.remove("etc/conf.d").unwrap();
    fs.remove("etc").unwrap();
    assert!(matches!(
        fs.stat("etc"),
        Err(EmberError::NotFound(_))
    ));
}

#[test]
fn short_reads_never_error() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("short", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.file_write(fh, b"abc").unwrap();
    // At EOF a read returns zero bytes.
    let mut buf = [0u8; 8];
    assert_eq!(fs.file_read(fh, &mut buf).unwrap(), 0);
    fs.file_seek(fh, SeekFrom::Start(100)).unwrap();
    assert_eq!(fs.file_read(fh, &mut buf).unwrap(), 0);
    fs.file_close(fh).unwrap();
}

#[test]
fn double_open_is_rejected() {
    let geo = geo();
    let (_dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("solo", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    assert!(matches!(
        fs.file_open("solo", OpenFlags::READ_ONLY),
        Err(EmberError::Exists(_))
    ));
    fs.file_close(fh).unwrap();
    let fh = fs.file_open("solo", OpenFlags::READ_ONLY).unwrap();
    fs.file_close(fh).unwrap();
}

#[test]
fn unsynced_writes_are_lost_but_metadata_survives() {
    let geo = geo();
    let (dev, mut fs) = fresh_fs(&geo);

    let fh = fs
        .file_open("stable", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.file_write(fh, b"durable").unwrap();
    fs.file_close(fh).unwrap();

    // Write without sync, then drop the mount (simulated crash).
    let fh = fs
        .file_open("volatile", OpenFlags::READ_WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.file_write(fh, &pattern(2000)).unwrap();
    drop(fs);

    let mut fs = Fs::mount(dev, geo).expect("remount after crash");
    let mut buf = [0u8; 16];
    let fh = fs.file_open("stable", OpenFlags::READ_ONLY).unwrap();
    let n = fs.file_read(fh, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"durable");
    fs.file_close(fh).unwrap();
    // The unsynced file exists (created at open) but holds no data.
    assert_eq!(fs.stat("volatile").unwrap().size, 0);
}
