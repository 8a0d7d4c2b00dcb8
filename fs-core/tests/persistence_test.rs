use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;
use tinyext::blockdev::FileBackedBlockDevice;
use tinyext::format::Superblock;
use tinyext::{Access, Credentials, FileSystem, FormatOptions, FsConfig, FsError, Mode};

/// Test that verifies data is actually written to the image and survives a remount
#[test]
fn test_data_persistence() {
    env_logger::builder().is_test(true).try_init().ok();

    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let image = temp_dir.path().join("disk.img");
    let test_data = b"This data should persist to disk!";

    // Step 1: Format and populate the image
    {
        let options = FormatOptions {
            volume_name: Some("persist".into()),
            ..FormatOptions::with_geometry(512, 1024)
        };
        let device = Arc::new(FileBackedBlockDevice::create(&image, 1024, 512).unwrap());
        let mut fs = FileSystem::format(device, &options, FsConfig::default()).unwrap();
        let session = fs.open_session("root", Credentials::ROOT);

        fs.make_directory(&session, "/docs", Mode::DEFAULT_DIR).unwrap();
        fs.create_file(&session, "/docs/note", Mode::new(0o640).unwrap()).unwrap();
        let handle = fs.open_file(&session, "/docs/note", Access::Write).unwrap();
        fs.write_file(&session, handle, test_data).unwrap();
        fs.close_file(&session, handle).unwrap();
        fs.sync().unwrap();
    }

    // Step 2: Verify the image carries the magic number
    let mut magic = [0u8; 8];
    File::open(&image).unwrap().read_exact(&mut magic).unwrap();
    assert_eq!(&magic, b"TINYEXT\x00");

    let superblock = Superblock::probe(&image).unwrap();
    assert_eq!(superblock.block_size, 512);
    assert_eq!(superblock.volume_name(), "persist");

    // Step 3: Remount and read everything back
    let device = Arc::new(FileBackedBlockDevice::open(&image, 512, false).unwrap());
    let mut fs = FileSystem::mount(device, FsConfig::default()).unwrap();
    let session = fs.open_session("root", Credentials::ROOT);

    let note = fs.stat(&session, "/docs/note").unwrap();
    assert_eq!(note.size, test_data.len() as u64);
    assert_eq!(note.mode.bits(), 0o640);

    let handle = fs.open_file(&session, "/docs/note", Access::Read).unwrap();
    assert_eq!(fs.read_file(&session, handle, 100).unwrap(), test_data.to_vec());
    assert!(fs.check_disk().unwrap().is_clean());
    assert_eq!(fs.statfs().volume_name, "persist");
}

#[test]
fn test_mount_rejects_damaged_superblock() {
    let temp_dir = TempDir::new().unwrap();
    let image = temp_dir.path().join("disk.img");
    {
        let device = Arc::new(FileBackedBlockDevice::create(&image, 256, 512).unwrap());
        FileSystem::format(device, &FormatOptions::with_geometry(512, 256), FsConfig::default())
            .unwrap();
    }

    // Corrupt a byte inside the checksummed superblock fields
    let mut bytes = std::fs::read(&image).unwrap();
    bytes[20] ^= 0xFF;
    std::fs::write(&image, &bytes).unwrap();

    let device = Arc::new(FileBackedBlockDevice::open(&image, 512, false).unwrap());
    let result = FileSystem::mount(device, FsConfig::default());
    assert!(matches!(result, Err(FsError::Corrupt(_))));
}

#[test]
fn test_mount_with_wrong_block_size() {
    let temp_dir = TempDir::new().unwrap();
    let image = temp_dir.path().join("disk.img");
    {
        let device = Arc::new(FileBackedBlockDevice::create(&image, 256, 1024).unwrap());
        FileSystem::format(device, &FormatOptions::with_geometry(1024, 256), FsConfig::default())
            .unwrap();
    }

    let device = Arc::new(FileBackedBlockDevice::open(&image, 512, true).unwrap());
    let result = FileSystem::mount(device, FsConfig::default());
    assert!(matches!(result, Err(FsError::Corrupt(_))));
}
