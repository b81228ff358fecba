//! トランザクション.
//!
//! トランザクションは、対象ファイルへの複数の書き込みをバッファリングし、
//! コミット時にそれらを一つのジャーナルエントリとしてまとめて永続化する.
//!
//! # 状態遷移
//!
//! ```text
//! Open --commit--> Committed --undo--> RolledBack
//!  |
//!  +--rollback--> RolledBack
//!
//! (任意の状態) --release--> Released
//! ```
//!
//! `Released`は終端状態であり、`Drop`時にも自動で遷移する.
//! `Open`状態のまま解放された場合には、暗黙的にロールバックされる.
use std::cmp;
use std::sync::Arc;
use trackable::error::ErrorKindExt;

pub use self::flags::TransactionFlags;

use crate::data::{RangeLock, MAX_OFFSET};
use crate::file::SharedFile;
use crate::journal::{EntryHandle, EntryState, SequenceId, WriteOp};
use crate::{Error, ErrorKind, Result};

mod flags;

/// トランザクションの状態.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// 書き込みのバッファリング中.
    Open,

    /// コミット済み.
    Committed,

    /// ロールバック済み.
    RolledBack,

    /// 解放済み.
    Released,
}

/// `Transaction::release`の結果.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Release {
    /// 今回の呼び出しで解放された.
    Released,

    /// 既に解放済みだった.
    AlreadyReleased,
}

/// トランザクション内の読み込みのうち、未コミットの書き込みと重なっていたものの結果.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    offset: u64,
    data: Vec<u8>,
}
impl View {
    /// 読み込み開始位置を返す.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// 読み込まれたバイト列を返す.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 所有権を放棄して、読み込まれたバイト列を返す.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// 対象ファイルに対するトランザクション.
///
/// `JournaledFile::transaction`によって生成される.
///
/// 書き込みはコミットされるまで対象ファイルには一切反映されない.
/// 同一ファイルに対して複数のトランザクションを同時にオープンすることは可能だが、
/// 同じ範囲に書き込むトランザクション同士の適用順序は保証されない.
#[derive(Debug)]
pub struct Transaction {
    file: Arc<SharedFile>,
    flags: TransactionFlags,
    state: TransactionState,
    ops: Vec<WriteOp>,
    views: Vec<View>,
    pre_images: Vec<WriteOp>,
    pre_size: u64,
    truncate_to: Option<u64>,
    in_doubt: Option<EntryHandle>,
    lingering: Option<SequenceId>,
    rollbacking: bool,
}
impl Transaction {
    pub(crate) fn new(file: Arc<SharedFile>, flags: TransactionFlags) -> Result<Self> {
        track!(file.lock_journal())?.begin_transaction();
        file.metrics.transaction.begun.increment();
        Ok(Transaction {
            file,
            flags,
            state: TransactionState::Open,
            ops: Vec::new(),
            views: Vec::new(),
            pre_images: Vec::new(),
            pre_size: 0,
            truncate_to: None,
            in_doubt: None,
            lingering: None,
            rollbacking: false,
        })
    }

    /// トランザクションに適用されているフラグ群を返す.
    pub fn flags(&self) -> TransactionFlags {
        self.flags
    }

    /// 現在の状態を返す.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// コミット済みかどうかを判定する.
    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }

    /// ロールバック済みかどうかを判定する.
    pub fn is_rolled_back(&self) -> bool {
        self.state == TransactionState::RolledBack
    }

    /// `undo`の実行中(ないし途中で失敗した状態)かどうかを判定する.
    pub fn is_rollbacking(&self) -> bool {
        self.rollbacking
    }

    /// 解放済みかどうかを判定する.
    pub fn is_released(&self) -> bool {
        self.state == TransactionState::Released
    }

    /// バッファリングされている書き込み操作群を、発行順に返す.
    pub fn pending_ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// `offset`の位置への`data`の書き込みをバッファリングする.
    ///
    /// 対象ファイルには触れず、常にデータ全体のバイト数が返される.
    ///
    /// # Errors
    ///
    /// - オープン状態以外: `ErrorKind::InvalidState`
    /// - 読み込み専用のファイル、ないし`offset + data.len()`が`data::MAX_OFFSET`を超える: `ErrorKind::InvalidInput`
    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        track!(self.check_open())?;
        track_assert!(
            !self.file.data.is_read_only(),
            ErrorKind::InvalidInput,
            "read-only file"
        );
        track_assert!(
            offset
                .checked_add(data.len() as u64)
                .map_or(false, |end| end <= MAX_OFFSET),
            ErrorKind::InvalidInput;
            offset,
            data.len()
        );
        self.ops.push(WriteOp::new(offset, data.to_owned()));
        Ok(data.len())
    }

    /// `write`と同じ.
    ///
    /// トランザクションはファイル位置を持たないので、書き込み先は常に明示される.
    pub fn pwrite(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        track!(self.write(data, offset))
    }

    /// `offset`から最大`len`バイトを読み込む.
    ///
    /// 結果は、対象ファイルの内容の上に、このトランザクションでバッファリング済みの書き込みを
    /// (発行順に)重ねたものとなる.
    /// 結果の長さは`min(len, max(ファイルサイズ, 重なる書き込みの終端) - offset)`で、
    /// ファイル末尾を越えた書き込みとの間の隙間は0で埋められる.
    ///
    /// 読み込み範囲が一つ以上のバッファリング済みの書き込みと重なる場合には、結果が`View`として記録される.
    pub fn read(&mut self, len: usize, offset: u64) -> Result<Vec<u8>> {
        track!(self.check_open())?;
        let end = track_assert_some!(
            offset.checked_add(len as u64),
            ErrorKind::InvalidInput,
            "offset={}, len={}",
            offset,
            len
        );

        let size = track!(self.file.data.size())?;
        let overlapping = self
            .ops
            .iter()
            .filter(|op| op.overlaps(offset, len as u64))
            .collect::<Vec<_>>();
        let furthest = overlapping.iter().map(|op| op.end()).max().unwrap_or(0);
        let limit = cmp::min(end, cmp::max(size, furthest));
        if limit <= offset {
            return Ok(Vec::new());
        }

        let n = (limit - offset) as usize;
        let mut buf = track!(self.file.data.read_at(n, offset))?;
        buf.resize(n, 0);
        for op in &overlapping {
            let start = cmp::max(op.offset, offset);
            let stop = cmp::min(op.end(), limit);
            if start < stop {
                let src = &op.data[(start - op.offset) as usize..(stop - op.offset) as usize];
                buf[(start - offset) as usize..(stop - offset) as usize].copy_from_slice(src);
            }
        }
        if !overlapping.is_empty() {
            self.views.push(View {
                offset,
                data: buf.clone(),
            });
        }
        Ok(buf)
    }

    /// `read`と同じ.
    pub fn pread(&mut self, len: usize, offset: u64) -> Result<Vec<u8>> {
        track!(self.read(len, offset))
    }

    /// 記録された`View`群を読み込み順に返す.
    ///
    /// `TransactionFlags::linger`付きでコミットされた後でのみ参照可能で、それ以外の場合は常に空となる.
    pub fn views(&self) -> &[View] {
        if self.state == TransactionState::Committed && self.flags.linger {
            &self.views
        } else {
            &[]
        }
    }

    /// トランザクションをコミットする.
    ///
    /// 以下の順で処理が行われ、全てが完了してから返る:
    ///
    /// 1. (`no_lock`でなければ)対象ファイルの書き込み範囲をロックする
    /// 2. (`no_rollback`でなければ)書き込み範囲の元の内容を保存する
    /// 3. ジャーナルにエントリを追記する
    /// 4. 書き込みを発行順に対象ファイルに適用する
    /// 5. 対象ファイルを同期する
    /// 6. エントリを適用済みとして回収する(`linger`の場合は`committed`として保持する)
    ///
    /// 書き込みが一つも無い場合には、ジャーナルには何も追記されない.
    ///
    /// # Errors
    ///
    /// オープン状態以外の場合には`ErrorKind::InvalidState`が返される.
    ///
    /// 処理中に失敗した場合には`ErrorKind::CommitFailure`が返され、ファイルのエラーフラグが立つ.
    /// 3の前に失敗した場合には、トランザクションはそのままオープン状態に留まる.
    /// 3の後に失敗した場合には、エントリはジャーナルに残り、
    /// `commit`の再実行ないし次回の復旧処理によって再適用される.
    pub fn commit(&mut self) -> Result<()> {
        track_assert_eq!(self.state, TransactionState::Open, ErrorKind::InvalidState);
        if !self.ops.is_empty() {
            if let Err(e) = track!(self.try_commit()) {
                self.file.set_error();
                self.file.metrics.transaction.failed_commits.increment();
                debug!(self.file.logger, "Commit failed"; "error" => e.to_string());
                let e: Error = ErrorKind::CommitFailure.cause(e).into();
                return Err(track!(e));
            }
        }

        let bytes = self.ops.iter().map(|op| op.data.len() as u64).sum::<u64>();
        self.state = TransactionState::Committed;
        self.file.metrics.transaction.committed.increment();
        self.file.metrics.transaction.committed_bytes.add_u64(bytes);
        self.file.notify_dirty(bytes);
        Ok(())
    }

    fn try_commit(&mut self) -> Result<()> {
        let _lock = track!(self.lock_range())?;
        let mut entry = if let Some(entry) = self.in_doubt.take() {
            entry
        } else {
            if !self.flags.no_rollback {
                track!(self.capture_pre_images())?;
            }
            let mut journal = track!(self.file.lock_journal())?;
            track!(journal.append_with_truncation(
                &self.ops,
                self.truncate_to,
                !self.flags.no_lock
            ))?
        };

        if let Err(e) = track!(self.apply(&mut entry)) {
            self.in_doubt = Some(entry);
            return Err(e);
        }
        if self.flags.linger {
            self.lingering = Some(entry.seq());
        }
        debug!(self.file.logger, "Transaction is committed";
               "seq" => entry.seq(), "ops" => self.ops.len(), "linger" => self.flags.linger);
        Ok(())
    }

    fn lock_range(&self) -> Result<Option<RangeLock>> {
        if self.flags.no_lock {
            return Ok(None);
        }
        let start = self.ops.iter().map(|op| op.offset).min();
        let end = self.ops.iter().map(|op| op.end()).max();
        match (start, end) {
            (Some(start), Some(end)) if start < end => {
                let lock = track!(self.file.data.lock_range(start, end - start))?;
                Ok(Some(lock))
            }
            _ => Ok(None),
        }
    }

    fn capture_pre_images(&mut self) -> Result<()> {
        let mut images = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let mut data = track!(self.file.data.read_at(op.data.len(), op.offset))?;
            data.resize(op.data.len(), 0);
            images.push(WriteOp::new(op.offset, data));
        }
        self.pre_size = track!(self.file.data.size())?;
        self.pre_images = images;
        Ok(())
    }

    fn apply(&self, entry: &mut EntryHandle) -> Result<()> {
        for op in &self.ops {
            track!(self.file.data.write_at(&op.data, op.offset); entry.seq())?;
        }
        if let Some(size) = self.truncate_to {
            if track!(self.file.data.size())? > size {
                track!(self.file.data.truncate(size); entry.seq())?;
            }
        }
        track!(self.file.data.sync())?;

        let mut journal = track!(self.file.lock_journal())?;
        if self.flags.linger {
            track!(journal.mark(entry, EntryState::Committed))?;
        } else {
            track!(journal.mark(entry, EntryState::Applied))?;
            track!(journal.compact())?;
        }
        Ok(())
    }

    /// オープン状態のトランザクションをロールバックする.
    ///
    /// バッファリングされていた書き込みと`View`群は破棄される.
    /// 既にロールバック済みの場合には何も行わない.
    ///
    /// # Errors
    ///
    /// コミット済みないし解放済みの場合、および失敗したコミットのエントリが
    /// ジャーナルに残っている場合には`ErrorKind::InvalidState`が返される.
    /// コミット済みの内容を取り消したい場合には`undo`を使用する.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Open => {
                track_assert!(
                    self.in_doubt.is_none(),
                    ErrorKind::InvalidState,
                    "The journal entry of the failed commit will be replayed"
                );
                self.ops.clear();
                self.views.clear();
                self.state = TransactionState::RolledBack;
                self.file.metrics.transaction.rolled_back.increment();
                Ok(())
            }
            TransactionState::RolledBack => Ok(()),
            TransactionState::Committed | TransactionState::Released => {
                track_panic!(ErrorKind::InvalidState, "state={:?}", self.state)
            }
        }
    }

    /// コミット済みのトランザクションを取り消す.
    ///
    /// コミット時に保存した元の内容を、新しいトランザクションとして(逆順に)コミットすることで、
    /// 取り消し自体もクラッシュに対してアトミックに行われる.
    /// コミットによってファイルが伸長していた場合には、元のサイズに切り詰められる
    /// (切り詰めも同じエントリに記録される).
    ///
    /// 成功した場合には、トランザクションはロールバック済みとなる.
    /// 途中で失敗した場合には、`is_rollbacking`が`true`のまま残る.
    ///
    /// # Errors
    ///
    /// コミット済みでない場合、ないし`no_rollback`付きでコミットされた場合には
    /// `ErrorKind::InvalidState`が返される.
    pub fn undo(&mut self) -> Result<()> {
        track_assert_eq!(self.state, TransactionState::Committed, ErrorKind::InvalidState);
        track_assert!(
            !self.flags.no_rollback,
            ErrorKind::InvalidState,
            "No pre-images have been saved"
        );
        if self.ops.is_empty() {
            self.state = TransactionState::RolledBack;
            return Ok(());
        }

        self.rollbacking = true;
        let flags = TransactionFlags {
            linger: false,
            no_lock: self.flags.no_lock,
            no_rollback: true,
        };
        let written_end = self.ops.iter().map(|op| op.end()).max().unwrap_or(0);
        let mut reverse = track!(Transaction::new(self.file.clone(), flags))?;
        reverse.ops = self.pre_images.iter().rev().cloned().collect();
        if written_end > self.pre_size && track!(self.file.data.size())? == written_end {
            reverse.truncate_to = Some(self.pre_size);
        }
        track!(reverse.commit())?;
        reverse.release();

        if let Some(seq) = self.lingering.take() {
            let mut journal = track!(self.file.lock_journal())?;
            if journal.lingering_entries().contains(&seq) {
                track!(journal.mark_sequence(seq, EntryState::RolledBack))?;
                track!(journal.compact())?;
            }
        }

        self.views.clear();
        self.state = TransactionState::RolledBack;
        self.rollbacking = false;
        self.file.metrics.transaction.undone.increment();
        debug!(self.file.logger, "Transaction is undone"; "ops" => self.ops.len());
        Ok(())
    }

    /// トランザクションを解放する.
    ///
    /// オープン状態の場合には暗黙的にロールバックが行われる(その際のエラーは無視される).
    /// 二回目以降の呼び出しでは`Release::AlreadyReleased`が返される.
    pub fn release(&mut self) -> Release {
        if self.state == TransactionState::Released {
            return Release::AlreadyReleased;
        }
        if self.state == TransactionState::Open {
            if let Err(e) = self.rollback() {
                warn!(self.file.logger, "Implicit rollback failed"; "error" => e.to_string());
            }
        }

        self.in_doubt = None;
        self.lingering = None;
        self.ops = Vec::new();
        self.views = Vec::new();
        self.pre_images = Vec::new();
        match self.file.lock_journal() {
            Ok(mut journal) => journal.end_transaction(),
            Err(e) => {
                warn!(self.file.logger, "Cannot release the transaction"; "error" => e.to_string())
            }
        }
        self.state = TransactionState::Released;
        Release::Released
    }

    fn check_open(&self) -> Result<()> {
        track_assert_eq!(self.state, TransactionState::Open, ErrorKind::InvalidState);
        track_assert!(
            self.in_doubt.is_none(),
            ErrorKind::InvalidState,
            "Commit is in progress"
        );
        Ok(())
    }
}
impl Drop for Transaction {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::mem;
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;
    use crate::file::{JournaledFile, JournaledFileBuilder};
    use crate::journal::{JournalStore, ScanOutcome};

    fn linger() -> TransactionFlags {
        TransactionFlags {
            linger: true,
            ..TransactionFlags::new()
        }
    }

    #[test]
    fn commit_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(JournaledFile::open(dir.path().join("foo")))?;

        let mut t = track!(file.transaction(linger()))?;
        assert_eq!(track!(t.write(b"COMMIT", 0))?, 6);

        // コミット前は対象ファイルに反映されない
        assert_eq!(track!(file.pread(6, 0))?, b"");

        track!(t.commit())?;
        assert!(t.is_committed());
        assert_eq!(track!(file.pread(6, 0))?, b"COMMIT");

        // 二重コミット
        assert_eq!(t.commit().err().map(|e| *e.kind()), Some(ErrorKind::InvalidState));
        assert_eq!(
            t.write(b"foo", 0).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidState)
        );

        assert_eq!(t.release(), Release::Released);
        assert_eq!(t.release(), Release::AlreadyReleased);
        assert_eq!(file.metrics().transaction().committed(), 1);
        assert_eq!(file.metrics().transaction().committed_bytes(), 6);
        Ok(())
    }

    #[test]
    fn views_work() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(JournaledFile::open(dir.path().join("foo")))?;

        let mut t = track!(file.transaction(linger()))?;
        track!(t.write(b"COMMIT", 0))?;
        assert_eq!(track!(t.read(2, 2))?, b"MM");
        assert_eq!(track!(t.read(2, 4))?, b"IT");
        assert_eq!(track!(t.read(2, 10))?, b""); // 重ならない
        assert!(t.views().is_empty());

        track!(t.commit())?;
        let views = t.views().iter().map(|v| v.data().to_owned()).collect::<Vec<_>>();
        assert_eq!(views, vec![b"MM".to_vec(), b"IT".to_vec()]);
        assert_eq!(t.views()[1].offset(), 4);
        Ok(())
    }

    #[test]
    fn views_are_hidden_without_linger() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(JournaledFile::open(dir.path().join("foo")))?;

        let mut t = track!(file.transaction(TransactionFlags::new()))?;
        track!(t.write(b"COMMIT", 0))?;
        track!(t.read(2, 2))?;
        track!(t.commit())?;
        assert!(t.views().is_empty());
        Ok(())
    }

    #[test]
    fn overlay_read_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(JournaledFile::open(dir.path().join("foo")))?;
        track!(file.pwrite(b"0123456789", 0))?;

        let mut t = track!(file.transaction(TransactionFlags::new()))?;
        track!(t.write(b"abc", 2))?;
        track!(t.write(b"X", 3))?; // 後の書き込みが優先される
        assert_eq!(track!(t.read(6, 0))?, b"01aXc5");

        // 重ならない読み込みはファイルの内容そのまま
        assert_eq!(track!(t.read(3, 7))?, b"789");

        // ファイル末尾を越える書き込みとの間は0で埋められる
        track!(t.write(b"Z", 12))?;
        assert_eq!(track!(t.read(100, 8))?, b"89\0\0Z");

        // ファイルの末尾以降で、何とも重ならない読み込み
        assert_eq!(track!(t.read(4, 20))?, b"");
        Ok(())
    }

    #[test]
    fn rollback_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(JournaledFile::open(dir.path().join("foo")))?;

        let mut t = track!(file.transaction(linger()))?;
        track!(t.write(b"COMMIT", 0))?;
        track!(t.read(2, 0))?;
        track!(t.rollback())?;
        assert!(t.is_rolled_back());
        assert!(t.views().is_empty());
        track!(t.rollback())?; // 冪等
        assert_eq!(t.commit().err().map(|e| *e.kind()), Some(ErrorKind::InvalidState));
        mem::drop(t);
        assert_eq!(track!(file.pread(6, 0))?, b"");

        // コミット済みのトランザクションはロールバックできない
        let mut t = track!(file.transaction(linger()))?;
        track!(t.write(b"COMMIT", 0))?;
        track!(t.commit())?;
        assert_eq!(t.rollback().err().map(|e| *e.kind()), Some(ErrorKind::InvalidState));
        Ok(())
    }

    #[test]
    fn release_rolls_back_open_transaction() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(JournaledFile::open(dir.path().join("foo")))?;
        {
            let mut t = track!(file.transaction(TransactionFlags::new()))?;
            track!(t.write(b"COMMIT", 0))?;
        }
        assert_eq!(track!(file.pread(6, 0))?, b"");
        assert_eq!(file.metrics().transaction().rolled_back(), 1);
        Ok(())
    }

    #[test]
    fn empty_commit_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(JournaledFile::open(dir.path().join("foo")))?;

        let mut t = track!(file.transaction(TransactionFlags::new()))?;
        track!(t.commit())?;
        assert!(t.is_committed());
        assert_eq!(file.metrics().journal().appended_entries(), 0);
        Ok(())
    }

    #[test]
    fn undo_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        let file = track!(JournaledFile::open(&path))?;
        track!(file.pwrite(b"hello", 0))?;

        let mut t = track!(file.transaction(linger()))?;
        track!(t.write(b"COMMIT", 0))?;
        track!(t.commit())?;
        assert_eq!(track!(file.pread(6, 0))?, b"COMMIT");

        track!(t.undo())?;
        assert!(t.is_rolled_back());
        assert!(!t.is_rollbacking());
        assert_eq!(track!(file.pread(10, 0))?, b"hello");
        assert_eq!(track!(file.size())?, 5);

        // 取り消したエントリは回収されている
        assert_eq!(file.metrics().journal().pending_entries(), 0);
        assert_eq!(t.undo().err().map(|e| *e.kind()), Some(ErrorKind::InvalidState));

        // 開き直しても取り消し後の内容のまま
        mem::drop(t);
        mem::drop(file);
        let file = track!(JournaledFile::open(&path))?;
        assert_eq!(track!(file.pread(10, 0))?, b"hello");
        assert_eq!(track!(file.size())?, 5);
        assert_eq!(file.metrics().check().entries().reapplied, 0);
        Ok(())
    }

    #[test]
    fn undo_records_truncation_in_journal() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        let file = track!(JournaledFile::open(&path))?;
        track!(file.pwrite(b"hello", 0))?;

        // 保持中のエントリがあるので、後続のエントリも回収されずに残る
        let mut pending = track!(file.transaction(linger()))?;
        track!(pending.write(b"X", 0))?;
        track!(pending.commit())?;

        let mut t = track!(file.transaction(TransactionFlags::new()))?;
        track!(t.write(b"COMMIT!", 0))?;
        track!(t.commit())?;
        assert_eq!(track!(file.size())?, 7);
        track!(t.undo())?;
        assert_eq!(track!(file.pread(10, 0))?, b"Xello");

        let store = track!(JournalStore::open(&path))?;
        let mut truncations = Vec::new();
        for scanned in track!(store.scan())? {
            if let ScanOutcome::Valid(entry) = track!(scanned)?.outcome {
                truncations.push(entry.truncate_to);
            }
        }
        assert_eq!(truncations, vec![None, None, Some(5)]);
        mem::drop(store);

        // 同期せずに閉じた後の復旧でも、サイズを含めて取り消し後の状態になる
        mem::drop(t);
        mem::drop(pending);
        mem::drop(file);
        let file = track!(JournaledFile::open(&path))?;
        assert_eq!(track!(file.pread(10, 0))?, b"Xello");
        assert_eq!(track!(file.size())?, 5);
        assert_eq!(file.metrics().check().entries().reapplied, 3);
        Ok(())
    }

    #[test]
    fn too_large_offset_is_rejected() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(JournaledFile::open(dir.path().join("foo")))?;

        let mut t = track!(file.transaction(TransactionFlags::new()))?;
        assert_eq!(
            t.write(b"foo", MAX_OFFSET - 2).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        assert_eq!(track!(t.write(b"foo", MAX_OFFSET - 3))?, 3);
        assert_eq!(
            file.pwrite(b"foo", u64::max_value() / 2 + 1).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        Ok(())
    }

    #[test]
    fn undo_requires_pre_images() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(JournaledFile::open(dir.path().join("foo")))?;

        let flags = TransactionFlags {
            no_rollback: true,
            ..TransactionFlags::new()
        };
        let mut t = track!(file.transaction(flags))?;
        track!(t.write(b"COMMIT", 0))?;
        track!(t.commit())?;
        assert_eq!(t.undo().err().map(|e| *e.kind()), Some(ErrorKind::InvalidState));
        assert!(!t.is_rollbacking());
        Ok(())
    }

    #[test]
    fn read_only_file_rejects_writes() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        track!(JournaledFile::open(&path))?;

        let file = track!(JournaledFileBuilder::new().read_only(true).open(&path))?;
        let mut t = track!(file.transaction(TransactionFlags::new()))?;
        assert_eq!(
            t.write(b"foo", 0).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        assert_eq!(
            t.write(b"foo", u64::max_value()).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        Ok(())
    }

    #[test]
    fn failed_commit_sets_error_flag() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let file = track!(JournaledFile::open(dir.path().join("foo")))?;

        // ジャーナルディレクトリを消して、追記を失敗させる
        track_io!(fs::remove_dir_all(track!(file.journal_dir())?))?;

        let mut t = track!(file.transaction(TransactionFlags::new()))?;
        track!(t.write(b"COMMIT", 0))?;
        assert_eq!(t.commit().err().map(|e| *e.kind()), Some(ErrorKind::CommitFailure));
        assert!(file.is_error());
        assert_eq!(t.state(), TransactionState::Open);
        assert_eq!(file.metrics().transaction().failed_commits(), 1);
        assert_eq!(track!(file.pread(6, 0))?, b"");

        // 追記前に失敗した場合はロールバックできる
        track!(t.rollback())?;
        file.clear_error();
        assert!(!file.is_error());
        Ok(())
    }
}
