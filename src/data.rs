//! トランザクションの書き込み対象となるデータファイル.
//!
//! このモジュールが提供するのは、ジャーナリングを伴わない素のファイル操作のみ.
//! 位置指定の読み書きと、同期、サイズ変更、およびプロセス間の排他制御用のバイト範囲ロックを扱う.
use libc;
use std::fs::{self, File};
use std::io;
use std::mem;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::{ErrorKind, Result};

/// 書き込み可能な範囲の終端(排他的)の最大値.
///
/// `off_t`で表現可能な範囲に制限される.
pub const MAX_OFFSET: u64 = i64::max_value() as u64;

/// `DataFile`のオープン方法.
///
/// `open(2)`のフラグおよびパーミッションに相当する.
#[derive(Debug, Clone)]
pub struct DataFileOptions {
    pub(crate) read_only: bool,
    pub(crate) create: bool,
    pub(crate) truncate: bool,
    pub(crate) mode: u32,
}
impl DataFileOptions {
    /// デフォルト設定で`DataFileOptions`インスタンスを生成する.
    ///
    /// デフォルトでは「読み書き可能」かつ「存在しない場合には作成(パーミッションは`0o600`)」となる.
    pub fn new() -> Self {
        DataFileOptions {
            read_only: false,
            create: true,
            truncate: false,
            mode: 0o600,
        }
    }

    /// 読み込み専用で開くかどうかを設定する.
    ///
    /// 有効にした場合には`create`および`truncate`の設定は無視される.
    pub fn read_only(&mut self, enabled: bool) -> &mut Self {
        self.read_only = enabled;
        self
    }

    /// ファイルが存在しない場合に作成するかどうかを設定する.
    pub fn create(&mut self, enabled: bool) -> &mut Self {
        self.create = enabled;
        self
    }

    /// オープン時にファイルを空にするかどうかを設定する.
    pub fn truncate(&mut self, enabled: bool) -> &mut Self {
        self.truncate = enabled;
        self
    }

    /// 新規作成時のパーミッションを設定する.
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode;
        self
    }

    /// 指定のパスのファイルを開く.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<DataFile> {
        // 読み込み専用の場合には、作成および切り詰めは行わない
        let writable = !self.read_only;
        let mut options = fs::OpenOptions::new();
        options
            .read(true)
            .write(writable)
            .create(writable && self.create)
            .truncate(writable && self.truncate)
            .mode(self.mode);
        let file = track!(
            track_io!(options.open(path.as_ref())),
            "path={:?}",
            path.as_ref()
        )?;
        Ok(DataFile {
            file,
            path: path.as_ref().to_path_buf(),
            read_only: self.read_only,
        })
    }
}
impl Default for DataFileOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// トランザクションの書き込み対象となるファイル.
///
/// 全ての読み書きは位置指定(`pread(2)`/`pwrite(2)`)で行われるため、
/// 複数スレッドから共有参照経由で同時に利用可能.
#[derive(Debug)]
pub struct DataFile {
    file: File,
    path: PathBuf,
    read_only: bool,
}
impl DataFile {
    /// デフォルト設定でファイルを開く.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        DataFileOptions::new().open(path)
    }

    /// ファイルのパスを返す.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 読み込み専用で開かれているかどうかを返す.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// ファイルのサイズを返す.
    pub fn size(&self) -> Result<u64> {
        let metadata = track_io!(self.file.metadata())?;
        Ok(metadata.len())
    }

    /// `offset`から最大`len`バイトを読み込む.
    ///
    /// ファイルの末尾を越える部分は読み込まれないので、結果の長さは`len`未満となり得る.
    pub fn read_at(&self, len: usize, offset: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        let mut filled = 0;
        while filled < len {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return track_io!(Err(e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// `offset`の位置に`data`を全て書き込む.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        track_assert!(!self.read_only, ErrorKind::InvalidInput, "read-only file");
        track_io!(self.file.write_all_at(data, offset))?;
        Ok(())
    }

    /// ファイルのサイズを`len`に変更する.
    pub fn truncate(&self, len: u64) -> Result<()> {
        track_assert!(!self.read_only, ErrorKind::InvalidInput, "read-only file");
        track_io!(self.file.set_len(len))?;
        Ok(())
    }

    /// ファイルの内容を物理デバイスに同期する.
    pub fn sync(&self) -> Result<()> {
        if !self.read_only {
            track_io!(self.file.sync_data())?;
        }
        Ok(())
    }

    /// `[offset..offset+len)`の範囲に書き込み用のロック(`fcntl(2)`の`F_WRLCK`)を取得する.
    ///
    /// ロックが取得できるまで待機する.
    /// 取得したロックは、返り値がドロップされた時点で解放される.
    ///
    /// POSIXのレコードロックであるため、排他の対象は他のプロセスのみ.
    /// 同一プロセス内の複数のトランザクションは互いに排他されない.
    /// また、ロックはプロセスに属するので、同一プロセス内で同じファイルを指す別のディスクリプタが
    /// クローズされると(e.g., 並行して実行された`check`)、その時点で全ての範囲ロックが外れてしまう.
    ///
    /// 範囲の終端が`MAX_OFFSET`を超える場合には`ErrorKind::InvalidInput`が返される.
    pub fn lock_range(&self, offset: u64, len: u64) -> Result<RangeLock> {
        track_assert!(
            offset.checked_add(len).map_or(false, |end| end <= MAX_OFFSET),
            ErrorKind::InvalidInput;
            offset,
            len
        );
        track!(fcntl_lock(self.as_raw_fd(), libc::F_WRLCK, offset, len))?;
        Ok(RangeLock {
            fd: self.as_raw_fd(),
            offset,
            len,
        })
    }
}
impl AsRawFd for DataFile {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// `DataFile::lock_range`によって取得されたバイト範囲ロック.
#[derive(Debug)]
pub struct RangeLock {
    fd: RawFd,
    offset: u64,
    len: u64,
}
impl Drop for RangeLock {
    fn drop(&mut self) {
        let _ = fcntl_lock(self.fd, libc::F_UNLCK, self.offset, self.len);
    }
}

fn fcntl_lock(fd: RawFd, lock_type: libc::c_int, offset: u64, len: u64) -> Result<()> {
    let mut lock: libc::flock = unsafe { mem::zeroed() };
    lock.l_type = lock_type as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = offset as libc::off_t;
    lock.l_len = len as libc::off_t;
    loop {
        if unsafe { libc::fcntl(fd, libc::F_SETLKW, &lock) } == 0 {
            return Ok(());
        }
        let e = io::Error::last_os_error();
        if e.kind() != io::ErrorKind::Interrupted {
            return track_io!(Err(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;

    #[test]
    fn read_write_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(DataFile::open(dir.path().join("foo")))?;
        assert_eq!(track!(file.size())?, 0);
        assert_eq!(track!(file.read_at(4, 0))?, b"");

        track!(file.write_at(b"ABCD", 0))?;
        track!(file.write_at(b"EFGH", 4))?;
        assert_eq!(track!(file.size())?, 8);
        assert_eq!(track!(file.read_at(4, 4))?, b"EFGH");

        // 末尾を越える部分は読み込まれない
        assert_eq!(track!(file.read_at(10, 6))?, b"GH");

        track!(file.truncate(2))?;
        assert_eq!(track!(file.size())?, 2);
        assert_eq!(track!(file.read_at(8, 0))?, b"AB");
        track!(file.sync())?;
        Ok(())
    }

    #[test]
    fn read_only_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");

        // 存在しないファイルは読み込み専用では開けない
        assert!(DataFileOptions::new().read_only(true).open(&path).is_err());

        let file = track!(DataFile::open(&path))?;
        track!(file.write_at(b"foo", 0))?;
        mem::drop(file);

        let file = track!(DataFileOptions::new().read_only(true).open(&path))?;
        assert!(file.is_read_only());
        assert_eq!(track!(file.read_at(3, 0))?, b"foo");
        assert_eq!(
            file.write_at(b"bar", 0).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        Ok(())
    }

    #[test]
    fn lock_range_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(DataFile::open(dir.path().join("foo")))?;
        {
            let _lock0 = track!(file.lock_range(0, 10))?;

            // 同一プロセス内のロックは互いに排他されない
            let _lock1 = track!(file.lock_range(5, 10))?;
        }
        let _lock = track!(file.lock_range(0, 10))?;

        // off_tに収まらない範囲
        assert_eq!(
            file.lock_range(MAX_OFFSET, 1).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        assert_eq!(
            file.lock_range(u64::max_value(), 1).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        Ok(())
    }
}
