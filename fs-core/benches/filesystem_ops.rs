use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tinyext::blockdev::MemoryBlockDevice;
use tinyext::{Access, Credentials, FileSystem, FormatOptions, FsConfig, Mode};

fn fresh_fs() -> (FileSystem, tinyext::Session) {
    let options = FormatOptions::with_geometry(512, 4096);
    let device = Arc::new(MemoryBlockDevice::new(options.block_count, options.block_size));
    let mut fs = FileSystem::format(device, &options, FsConfig::default()).unwrap();
    let session = fs.open_session("bench", Credentials::ROOT);
    (fs, session)
}

fn benchmark_file_operations(c: &mut Criterion) {
    let (mut fs, session) = fresh_fs();

    c.bench_function("file_create_write_1kb", |b| {
        let data = vec![0u8; 1024];
        b.iter(|| {
            fs.create_file(&session, "/bench", Mode::DEFAULT_FILE).unwrap();
            let handle = fs.open_file(&session, "/bench", Access::Write).unwrap();
            fs.write_file(&session, handle, black_box(&data)).unwrap();
            fs.close_file(&session, handle).unwrap();
            fs.remove(&session, "/bench").unwrap();
        });
    });

    // Create a test file for read benchmark
    fs.create_file(&session, "/data", Mode::DEFAULT_FILE).unwrap();
    let handle = fs.open_file(&session, "/data", Access::ReadWrite).unwrap();
    fs.write_file(&session, handle, &[42u8; 1024]).unwrap();

    c.bench_function("file_read_1kb", |b| {
        b.iter(|| {
            fs.seek(&session, handle, 0).unwrap();
            black_box(fs.read_file(&session, handle, 1024).unwrap());
        });
    });

    c.bench_function("path_resolve_deep", |b| {
        let mut path = String::new();
        for depth in 0..8 {
            path.push_str(&format!("/d{}", depth));
            fs.make_directory(&session, &path, Mode::DEFAULT_DIR).unwrap();
        }
        b.iter(|| black_box(fs.stat(&session, &path).unwrap()));
    });

    c.bench_function("check_disk", |b| {
        b.iter(|| black_box(fs.check_disk().unwrap()));
    });
}

criterion_group!(benches, benchmark_file_operations);
criterion_main!(benches);
