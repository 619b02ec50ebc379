mod common;

use common::*;
use flogfs::{Error, FlogFs, Geometry};

#[test]
fn test_write_then_read_in_chunks() {
    let (mut fs, _) = mounted(large_geometry());
    let data = pattern(1024, 3);

    let mut handle = fs.open_write("file.bin").unwrap();
    for chunk in data.chunks(256) {
        assert_eq!(fs.write(&mut handle, chunk).unwrap(), 256);
    }
    assert_eq!(fs.write_file_size(&handle), 1024);
    fs.close_write(handle).unwrap();

    let mut handle = fs.open_read("file.bin").unwrap();
    assert_eq!(fs.read_file_size(&handle), 1024);
    let mut buf = [0u8; 64];
    let mut read = Vec::new();
    for i in 0..16 {
        let n = fs.read(&mut handle, &mut buf).unwrap();
        assert_eq!(n, 64, "read {} came up short", i);
        read.extend_from_slice(&buf[..n]);
    }
    assert_eq!(fs.read(&mut handle, &mut buf).unwrap(), 0);
    assert!(handle.is_eof());
    fs.close_read(handle).unwrap();
    assert_eq!(read, data);
}

#[test]
fn test_seek_then_read() {
    let (mut fs, _) = mounted(large_geometry());
    let data = pattern(1024, 9);
    write_file(&mut fs, "file.bin", &data, 256);

    let mut handle = fs.open_read("file.bin").unwrap();
    fs.read_seek(&mut handle, 256).unwrap();
    assert_eq!(handle.position(), 256);
    let mut buf = [0u8; 64];
    for i in 0..12 {
        assert_eq!(fs.read(&mut handle, &mut buf).unwrap(), 64);
        let at = 256 + i * 64;
        assert_eq!(&buf[..], &data[at..at + 64]);
    }
    assert_eq!(fs.read(&mut handle, &mut buf).unwrap(), 0);
    fs.close_read(handle).unwrap();
}

#[test]
fn test_seek_bounds() {
    let (mut fs, _) = mounted(small_geometry());
    let data = pattern(2000, 1);
    write_file(&mut fs, "seek", &data, 100);

    let mut handle = fs.open_read("seek").unwrap();
    assert_eq!(
        fs.read_seek(&mut handle, 2001),
        Err(Error::OutOfRange { offset: 2001, size: 2000 })
    );

    // Backwards across a block boundary.
    fs.read_seek(&mut handle, 1500).unwrap();
    fs.read_seek(&mut handle, 10).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(fs.read(&mut handle, &mut buf).unwrap(), 5);
    assert_eq!(&buf, &data[10..15]);

    fs.read_seek(&mut handle, 2000).unwrap();
    assert_eq!(fs.read(&mut handle, &mut buf).unwrap(), 0);
    fs.close_read(handle).unwrap();
}

#[test]
fn test_listing() {
    let (mut fs, _) = mounted(small_geometry());
    for i in 0..10 {
        let name = format!("file-{:02}.bin", i);
        write_file(&mut fs, &name, &pattern(256, i as u8), 256);
    }

    let mut listing = fs.start_listing().unwrap();
    let mut names = Vec::new();
    while let Some(name) = fs.next_listing_entry(&mut listing) {
        names.push(name);
    }
    fs.stop_listing(listing);

    let expected: Vec<String> = (0..10).map(|i| format!("file-{:02}.bin", i)).collect();
    assert_eq!(names, expected);
    log!("listed {} files", names.len());
}

#[test]
fn test_listing_restart() {
    let (mut fs, _) = mounted(small_geometry());
    write_file(&mut fs, "a", b"1", 1);
    write_file(&mut fs, "b", b"2", 1);

    let mut listing = fs.start_listing().unwrap();
    assert_eq!(fs.next_listing_entry(&mut listing).as_deref(), Some("a"));
    listing.restart();
    let all: Vec<String> = listing.collect();
    assert_eq!(all, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn test_reopen_reports_prior_size() {
    let (mut fs, _) = mounted(small_geometry());
    write_file(&mut fs, "log.txt", &pattern(300, 0), 300);

    let handle = fs.open_write("log.txt").unwrap();
    assert_eq!(fs.write_file_size(&handle), 300);
    fs.close_write(handle).unwrap();
}

#[test]
fn test_reopen_append_content() {
    let (mut fs, _) = mounted(small_geometry());
    let first = pattern(100, 1);
    let second = pattern(1500, 2);
    write_file(&mut fs, "log.txt", &first, 100);
    write_file(&mut fs, "log.txt", &second, 64);

    let mut expected = first.clone();
    expected.extend_from_slice(&second);
    assert_eq!(read_file(&mut fs, "log.txt", 37), expected);
    assert_eq!(fs.directory().unwrap().lookup("log.txt").unwrap().size, 1600);
}

#[test]
fn test_exists_and_remove() {
    let (mut fs, _) = mounted(small_geometry());
    assert!(!fs.check_exists("gone"));
    write_file(&mut fs, "gone", b"bye", 3);
    assert!(fs.check_exists("gone"));

    fs.remove("gone").unwrap();
    assert!(!fs.check_exists("gone"));
    assert_eq!(fs.open_read("gone").unwrap_err(), Error::NotFound);
    assert_eq!(fs.remove("gone"), Err(Error::NotFound));
}

#[test]
fn test_remove_then_recreate() {
    let (mut fs, _) = mounted(small_geometry());
    write_file(&mut fs, "cfg", b"old contents", 4);
    let old_id = fs.directory().unwrap().lookup("cfg").unwrap().file_id;
    fs.remove("cfg").unwrap();

    write_file(&mut fs, "cfg", b"new", 3);
    let entry = fs.directory().unwrap().lookup("cfg").unwrap().clone();
    assert!(entry.file_id > old_id);
    assert_eq!(read_file(&mut fs, "cfg", 16), b"new");
}

#[test]
fn test_empty_file() {
    let (mut fs, _) = mounted(small_geometry());
    let handle = fs.open_write("empty").unwrap();
    fs.close_write(handle).unwrap();

    assert!(fs.check_exists("empty"));
    let mut handle = fs.open_read("empty").unwrap();
    assert_eq!(fs.read_file_size(&handle), 0);
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(&mut handle, &mut buf).unwrap(), 0);
    fs.close_read(handle).unwrap();
}

#[test]
fn test_invalid_names() {
    let (mut fs, _) = mounted(small_geometry());
    assert_eq!(fs.open_write("").unwrap_err(), Error::InvalidFileName);
    let long = "x".repeat(33);
    assert_eq!(fs.open_write(&long).unwrap_err(), Error::InvalidFileName);
    assert_eq!(fs.open_write("nul\0name").unwrap_err(), Error::InvalidFileName);

    let longest = "y".repeat(32);
    write_file(&mut fs, &longest, b"ok", 2);
    assert!(fs.check_exists(&longest));
}

#[test]
fn test_not_mounted() {
    init_logger();
    let geometry = small_geometry();
    let mut fs = FlogFs::initialize(RamFlash::new(geometry), geometry).unwrap();
    assert_eq!(fs.open_write("a").unwrap_err(), Error::NotMounted);
    assert_eq!(fs.open_read("a").unwrap_err(), Error::NotMounted);
    assert!(fs.start_listing().is_err());
    assert!(!fs.check_exists("a"));

    fs.format().unwrap();
    assert!(!fs.is_mounted());
    fs.mount().unwrap();
    write_file(&mut fs, "a", b"1", 1);
    let handle = fs.open_read("a").unwrap();
    fs.unmount();
    assert_eq!(fs.remove("a"), Err(Error::NotMounted));
    assert_eq!(fs.close_read(handle), Err(Error::NotMounted));
}

#[test]
fn test_invalid_geometry() {
    assert_eq!(Geometry::new(1, 4, 4, 64).unwrap_err(), Error::InvalidGeometry);
    assert_eq!(Geometry::new(8, 1, 2, 64).unwrap_err(), Error::InvalidGeometry);
    assert_eq!(Geometry::new(8, 4, 4, 16).unwrap_err(), Error::InvalidGeometry);
    assert!(Geometry::new(8, 1, 3, 64).is_ok());
}

#[test]
fn test_two_writers() {
    let (mut fs, _) = mounted(small_geometry());
    let a = pattern(1000, 5);
    let b = pattern(1200, 6);

    let mut wa = fs.open_write("a").unwrap();
    let mut wb = fs.open_write("b").unwrap();
    for (ca, cb) in a.chunks(50).zip(b.chunks(60)) {
        fs.write(&mut wa, ca).unwrap();
        fs.write(&mut wb, cb).unwrap();
    }
    fs.close_write(wa).unwrap();
    fs.close_write(wb).unwrap();

    assert_eq!(read_file(&mut fs, "a", 128), a);
    assert_eq!(read_file(&mut fs, "b", 128), b);
}
