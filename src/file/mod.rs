//! ジャーナル付きファイル.
//!
//! `cannyjio`の利用者が直接触るのは、主にこのモジュールが提供する`JournaledFile`.
use slog::Logger;
use std::io::SeekFrom;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use self::builder::JournaledFileBuilder;

use crate::autosync::AutoSync;
use crate::data::DataFile;
use crate::journal::{EntryState, JournalStore};
use crate::metrics::FileMetrics;
use crate::transaction::{Transaction, TransactionFlags, TransactionState};
use crate::{Error, ErrorKind, Result};

mod builder;

/// ジャーナル付きファイル.
///
/// 書き込みは全てトランザクション経由で行われ、クラッシュを跨いでもアトミックに反映される.
/// 読み込みは対象ファイルに対して直接行われる.
///
/// 複数のスレッドから共有参照経由で利用可能.
///
/// # Examples
///
/// ```
/// # extern crate cannyjio;
/// # extern crate tempdir;
/// use cannyjio::{JournaledFile, TransactionFlags};
/// use tempdir::TempDir;
///
/// # fn main() -> Result<(), cannyjio::Error> {
/// let dir = TempDir::new("cannyjio_doc").unwrap();
/// let file = JournaledFile::open(dir.path().join("foo"))?;
///
/// let mut transaction = file.transaction(TransactionFlags::default())?;
/// transaction.write(b"foo", 0)?;
/// transaction.write(b"bar", 3)?;
/// transaction.commit()?;
/// assert_eq!(file.pread(6, 0)?, b"foobar");
///
/// file.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct JournaledFile {
    inner: Arc<SharedFile>,
    position: Mutex<u64>,
}
impl JournaledFile {
    /// デフォルト設定で指定のパスのファイルを開く.
    ///
    /// ファイルが存在しない場合には(パーミッション`0o600`で)作成され、
    /// ジャーナルに未完了のエントリが残っている場合には復旧処理が実行される.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        track!(JournaledFileBuilder::new().open(path))
    }

    /// ファイルのパスを返す.
    pub fn path(&self) -> &Path {
        self.inner.data.path()
    }

    /// ファイルのメトリクスを返す.
    pub fn metrics(&self) -> &FileMetrics {
        &self.inner.metrics
    }

    /// ジャーナルディレクトリのパスを返す.
    pub fn journal_dir(&self) -> Result<PathBuf> {
        let journal = track!(self.inner.lock_journal())?;
        Ok(journal.dir().to_path_buf())
    }

    /// 新しいトランザクションを開始する.
    ///
    /// `flags`は、`JournaledFileBuilder::flags`で指定したデフォルトのフラグ群と合成される.
    ///
    /// 同一プロセス内で並行してオープンされたトランザクション同士は直列化されない.
    /// コミット時の範囲ロック(`fcntl(2)`)が排他するのは他プロセスのみ.
    /// さらにPOSIXのレコードロックはプロセス単位であるため、同一プロセス内で同じファイルを指す
    /// 別のディスクリプタがクローズされると(e.g., コミット中に`check`を実行した場合)、
    /// その時点で保持中の範囲ロックは全て外れる.
    pub fn transaction(&self, flags: TransactionFlags) -> Result<Transaction> {
        let flags = self.inner.flags.merge(flags);
        track!(Transaction::new(self.inner.clone(), flags))
    }

    /// トランザクションを開始して`f`を実行する.
    ///
    /// - `f`がエラーを返した場合には、トランザクションはロールバックされる
    /// - `f`が成功した場合には、(まだコミットないしロールバックされていなければ)コミットされる
    ///
    /// いずれの場合も、トランザクションは一度だけ解放される(`f`がパニックした場合も含む).
    ///
    /// # Examples
    ///
    /// ```
    /// # extern crate cannyjio;
    /// # extern crate tempdir;
    /// use cannyjio::{JournaledFile, TransactionFlags};
    /// use std::io;
    /// use tempdir::TempDir;
    ///
    /// # fn main() -> Result<(), cannyjio::Error> {
    /// let dir = TempDir::new("cannyjio_doc").unwrap();
    /// let file = JournaledFile::open(dir.path().join("foo"))?;
    ///
    /// let result: Result<(), cannyjio::Error> =
    ///     file.transaction_scope(TransactionFlags::default(), |t| {
    ///         t.write(b"COMMIT", 0)?;
    ///         Err(io::Error::new(io::ErrorKind::Other, "rollback").into())
    ///     });
    /// assert!(result.is_err());
    /// assert_eq!(file.pread(6, 0)?, b"");
    /// # Ok(())
    /// # }
    /// ```
    pub fn transaction_scope<F, T>(&self, flags: TransactionFlags, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut transaction = track!(self.transaction(flags))?;
        match f(&mut transaction) {
            Err(e) => {
                if transaction.state() == TransactionState::Open {
                    if let Err(rollback_error) = transaction.rollback() {
                        warn!(self.inner.logger, "Rollback failed";
                              "error" => rollback_error.to_string());
                    }
                }
                transaction.release();
                Err(track!(e))
            }
            Ok(value) => {
                let result = if transaction.state() == TransactionState::Open {
                    track!(transaction.commit())
                } else {
                    Ok(())
                };
                transaction.release();
                result.map(|()| value)
            }
        }
    }

    /// 対象ファイルを同期し、`linger`指定で保持されていたエントリを回収する.
    pub fn sync(&self) -> Result<()> {
        track!(self.inner.sync())
    }

    /// ジャーナルディレクトリを`new_parent`配下に移動する.
    ///
    /// 詳細は`JournalStore::relocate`を参照のこと.
    pub fn move_journal<P: AsRef<Path>>(&self, new_parent: P) -> Result<()> {
        let mut journal = track!(self.inner.lock_journal())?;
        track!(journal.relocate(new_parent))
    }

    /// 自動同期スレッドを起動する.
    ///
    /// `interval`ごと、ないしコミットされたバイト数が`max_dirty_bytes`に達するごとに`sync`相当の処理が行われる.
    /// `max_dirty_bytes`が`0`の場合には、間隔による同期のみが行われる.
    ///
    /// 既に起動済みの場合には`ErrorKind::AlreadyActive`エラーが返される.
    pub fn autosync(&self, interval: Duration, max_dirty_bytes: u64) -> Result<()> {
        let mut autosync = track!(self.inner.lock_autosync())?;
        track_assert!(
            autosync.is_none(),
            ErrorKind::AlreadyActive,
            "Autosync is already running"
        );
        let handle = track!(AutoSync::start(
            Arc::downgrade(&self.inner),
            interval,
            max_dirty_bytes,
            self.inner.logger.clone(),
            self.inner.metrics.autosync.clone(),
        ))?;
        *autosync = Some(handle);
        Ok(())
    }

    /// 自動同期スレッドを停止する.
    ///
    /// 起動していない場合には何も行わない.
    pub fn stop_autosync(&self) -> Result<()> {
        let handle = track!(self.inner.lock_autosync())?.take();
        if let Some(handle) = handle {
            handle.stop();
        }
        Ok(())
    }

    /// 自動同期を停止した上でファイルを同期し、閉じる.
    pub fn close(self) -> Result<()> {
        track!(self.stop_autosync())?;
        track!(self.sync())?;
        track!(track!(self.inner.lock_journal())?.persist_header())?;
        info!(self.inner.logger, "Journaled file is closed");
        Ok(())
    }

    /// ファイルディスクリプタを返す.
    pub fn fileno(&self) -> RawFd {
        self.inner.data.as_raw_fd()
    }

    /// これまでに(コミットや同期等の)内部処理が失敗したかどうかを返す.
    ///
    /// このフラグは`clear_error`が呼ばれるまで立ったままとなる.
    pub fn is_error(&self) -> bool {
        self.inner.error.load(Ordering::SeqCst)
    }

    /// エラーフラグを下ろす.
    pub fn clear_error(&self) {
        self.inner.error.store(false, Ordering::SeqCst);
    }

    /// 現在位置から最大`len`バイトを読み込み、その分だけ位置を進める.
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        let mut position = track!(self.lock_position())?;
        let buf = track!(self.inner.data.read_at(len, *position))?;
        *position += buf.len() as u64;
        Ok(buf)
    }

    /// `offset`から最大`len`バイトを読み込む.
    ///
    /// 現在位置は変更されない.
    pub fn pread(&self, len: usize, offset: u64) -> Result<Vec<u8>> {
        track!(self.inner.data.read_at(len, offset))
    }

    /// 現在位置に`data`を書き込み、その分だけ位置を進める.
    ///
    /// 書き込みは一つの操作のみを含むトランザクションとして行われる.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut position = track!(self.lock_position())?;
        let written = track!(self.pwrite(data, *position))?;
        *position += written as u64;
        Ok(written)
    }

    /// `offset`の位置に`data`を書き込む.
    ///
    /// 書き込みは一つの操作のみを含むトランザクションとして行われる.
    /// 現在位置は変更されない.
    pub fn pwrite(&self, data: &[u8], offset: u64) -> Result<usize> {
        let mut transaction = track!(self.transaction(TransactionFlags::default()))?;
        let written = track!(transaction.write(data, offset))?;
        track!(transaction.commit())?;
        Ok(written)
    }

    /// 現在位置を変更し、変更後の位置を返す.
    pub fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let mut position = track!(self.lock_position())?;
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => (0, offset as i128),
            SeekFrom::Current(delta) => (*position, i128::from(delta)),
            SeekFrom::End(delta) => (track!(self.inner.data.size())?, i128::from(delta)),
        };
        let next = i128::from(base) + delta;
        track_assert!(
            next >= 0 && next <= i128::from(u64::max_value()),
            ErrorKind::InvalidInput,
            "Invalid seek position: {:?}",
            pos
        );
        *position = next as u64;
        Ok(*position)
    }

    /// 現在位置を返す.
    pub fn tell(&self) -> Result<u64> {
        Ok(*track!(self.lock_position())?)
    }

    /// 現在位置をファイルの先頭に戻す.
    pub fn rewind(&self) -> Result<()> {
        *track!(self.lock_position())? = 0;
        Ok(())
    }

    /// 現在位置がファイルの末尾以降かどうかを判定する.
    pub fn is_eof(&self) -> Result<bool> {
        let position = *track!(self.lock_position())?;
        Ok(position >= track!(self.inner.data.size())?)
    }

    /// ファイルのサイズを`len`に変更する.
    ///
    /// この操作はジャーナリングされない.
    pub fn truncate(&self, len: u64) -> Result<()> {
        track!(self.inner.data.truncate(len))
    }

    /// ファイルのサイズを返す.
    pub fn size(&self) -> Result<u64> {
        track!(self.inner.data.size())
    }

    fn lock_position(&self) -> Result<MutexGuard<u64>> {
        let position = track!(self.position.lock().map_err(Error::from))?;
        Ok(position)
    }
}
impl AsRawFd for JournaledFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fileno()
    }
}
impl Drop for JournaledFile {
    fn drop(&mut self) {
        if let Err(e) = self.stop_autosync() {
            warn!(self.inner.logger, "Cannot stop the autosync thread"; "error" => e.to_string());
        }
    }
}

/// `JournaledFile`とそのトランザクション群、および自動同期スレッドで共有される状態.
#[derive(Debug)]
pub(crate) struct SharedFile {
    pub(crate) data: DataFile,
    pub(crate) journal: Mutex<JournalStore>,
    pub(crate) flags: TransactionFlags,
    pub(crate) error: AtomicBool,
    pub(crate) autosync: Mutex<Option<AutoSync>>,
    pub(crate) logger: Logger,
    pub(crate) metrics: FileMetrics,
}
impl SharedFile {
    pub(crate) fn lock_journal(&self) -> Result<MutexGuard<JournalStore>> {
        let journal = track!(self.journal.lock().map_err(Error::from))?;
        Ok(journal)
    }

    fn lock_autosync(&self) -> Result<MutexGuard<Option<AutoSync>>> {
        let autosync = track!(self.autosync.lock().map_err(Error::from))?;
        Ok(autosync)
    }

    pub(crate) fn set_error(&self) {
        self.error.store(true, Ordering::SeqCst);
    }

    pub(crate) fn notify_dirty(&self, bytes: u64) {
        if let Ok(autosync) = self.autosync.lock() {
            if let Some(ref autosync) = *autosync {
                autosync.notify_dirty(bytes);
            }
        }
    }

    pub(crate) fn sync(&self) -> Result<()> {
        let result: Result<()> = (|| {
            track!(self.data.sync())?;
            let mut journal = track!(self.lock_journal())?;
            for seq in journal.lingering_entries() {
                track!(journal.mark_sequence(seq, EntryState::Applied))?;
            }
            track!(journal.compact())?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.metrics.syncs.increment();
                Ok(())
            }
            Err(e) => {
                self.set_error();
                Err(track!(e))
            }
        }
    }
}
