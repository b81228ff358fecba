#![feature(test)]
extern crate cannyjio;
extern crate tempdir;
extern crate test;
#[macro_use]
extern crate trackable;

use cannyjio::{JournaledFile, TransactionFlags};
use tempdir::TempDir;
use test::Bencher;

#[bench]
fn commit_small(b: &mut Bencher) {
    let dir = TempDir::new("cannyjio_bench").unwrap();
    let file = track_try_unwrap!(JournaledFile::open(dir.path().join("bench.dat")));
    let mut i = 0;
    b.iter(|| {
        track_try_unwrap!(file.pwrite(b"foo", i * 3));
        i += 1;
    });
}

#[bench]
fn commit_small_linger(b: &mut Bencher) {
    let dir = TempDir::new("cannyjio_bench").unwrap();
    let file = track_try_unwrap!(JournaledFile::open(dir.path().join("bench.dat")));
    let flags = TransactionFlags {
        linger: true,
        no_lock: true,
        ..TransactionFlags::default()
    };
    let mut i = 0;
    b.iter(|| {
        let mut t = track_try_unwrap!(file.transaction(flags));
        track_try_unwrap!(t.write(b"foo", i * 3));
        track_try_unwrap!(t.commit());
        i += 1;
        if i % 100 == 0 {
            track_try_unwrap!(file.sync());
        }
    });
}

#[bench]
fn commit_multi_ops(b: &mut Bencher) {
    let dir = TempDir::new("cannyjio_bench").unwrap();
    let file = track_try_unwrap!(JournaledFile::open(dir.path().join("bench.dat")));
    let data = vec![1; 4096];
    b.iter(|| {
        let mut t = track_try_unwrap!(file.transaction(TransactionFlags::default()));
        for j in 0..16 {
            track_try_unwrap!(t.write(&data, j * 4096));
        }
        track_try_unwrap!(t.commit());
    });
}

#[bench]
fn transactional_read(b: &mut Bencher) {
    let dir = TempDir::new("cannyjio_bench").unwrap();
    let file = track_try_unwrap!(JournaledFile::open(dir.path().join("bench.dat")));
    track_try_unwrap!(file.pwrite(&vec![0; 1024 * 1024], 0));
    let mut t = track_try_unwrap!(file.transaction(TransactionFlags::default()));
    for j in 0..64 {
        track_try_unwrap!(t.write(b"foo", j * 1024));
    }
    b.iter(|| {
        track_try_unwrap!(t.read(4096, 512));
    });
}
