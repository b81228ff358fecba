//! クラッシュ後の復旧処理.
//!
//! ジャーナル内のエントリをシーケンス番号順に走査し、以下のように分類・処理する:
//!
//! | 状況 | 分類 | 処理 |
//! |:---|:---|:---|
//! | 他のコミット処理がロック中 | `in_progress` | 残す |
//! | フレームが途中で切れている | `invalid` | 削除 |
//! | チェックサムが一致しない | `corrupt` | 削除 |
//! | その他の構造上の不整合 | `broken` | 削除 |
//! | 正常かつ未適用(`in_progress`/`committed`) | `reapplied` | 再適用後に削除 |
//! | 正常かつ適用済みで、それより前に再適用したエントリがある | `reapplied` | 再適用後に削除 |
//! | 正常かつ適用済み(`applied`/`rolled_back`) | (集計対象外) | 削除 |
//!
//! 未解決のエントリより新しいエントリは、適用済みであっても回収されずに残されている
//! (`JournalStore::compact`参照).
//! 未解決のエントリを再適用すると、それ以降の書き込みを上書きしてしまうので、
//! 最初に再適用したエントリ以降は、状態に関わらず全てのエントリを順番に再適用する.
//!
//! 一度復旧処理を実行した後に再度実行しても、(ロック中のもの以外は)何も集計されない.
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::path::{Path, PathBuf};

use crate::data::{DataFile, DataFileOptions};
use crate::journal::{
    EntryDefect, EntryState, JournalEntry, JournalStore, JournalStoreBuilder, ScanOutcome,
};
use crate::metrics::{CheckMetrics, JournalMetrics};
use crate::Result;

/// 復旧処理の結果.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct CheckReport {
    /// 再適用されたエントリの数.
    pub reapplied: u64,

    /// 追記途中で切れていたため破棄されたエントリの数.
    pub invalid: u64,

    /// チェックサムが一致しなかったため破棄されたエントリの数.
    pub corrupt: u64,

    /// 他のコミット処理によって処理中だったため、そのまま残されたエントリの数.
    pub in_progress: u64,

    /// 構造上の不整合があったため破棄されたエントリの数.
    pub broken: u64,

    /// 上記の合計.
    pub total: u64,
}
impl CheckReport {
    /// `total`以外の各分類の合計を返す.
    pub fn sum(&self) -> u64 {
        self.reapplied + self.invalid + self.corrupt + self.in_progress + self.broken
    }
}

/// `check`関数に指定可能なフラグ群.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckFlags {
    /// 復旧後にジャーナルが空であれば、ジャーナルディレクトリ(および移動元のシンボリックリンク)を削除する.
    pub cleanup: bool,
}

/// デフォルト設定で、`path`のファイルに対する復旧処理を実行する.
///
/// ジャーナルディレクトリが存在しない場合には、空の`CheckReport`が返される.
///
/// # Examples
///
/// ```
/// # extern crate cannyjio;
/// # extern crate tempdir;
/// use cannyjio::{check, CheckFlags, CheckReport, JournaledFile};
/// use tempdir::TempDir;
///
/// # fn main() -> Result<(), cannyjio::Error> {
/// let dir = TempDir::new("cannyjio_doc").unwrap();
/// let path = dir.path().join("foo");
/// JournaledFile::open(&path)?.close()?;
///
/// let report = check(&path, CheckFlags::default())?;
/// assert_eq!(report, CheckReport::default());
/// # Ok(())
/// # }
/// ```
pub fn check<P: AsRef<Path>>(path: P, flags: CheckFlags) -> Result<CheckReport> {
    let mut checker = Checker::new();
    checker.cleanup(flags.cleanup);
    track!(checker.check(path))
}

/// 復旧処理の実行器.
#[derive(Debug, Clone)]
pub struct Checker {
    journal_dir: Option<PathBuf>,
    cleanup: bool,
    logger: Logger,
    metrics: MetricBuilder,
}
impl Checker {
    /// デフォルト設定で`Checker`インスタンスを生成する.
    pub fn new() -> Self {
        Checker {
            journal_dir: None,
            cleanup: false,
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// ジャーナルディレクトリの位置を明示的に指定する.
    ///
    /// `JournaledFileBuilder::journal_dir`を使ってファイルを開いていた場合には、同じ値を指定する必要がある.
    pub fn journal_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.journal_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// 復旧後に空のジャーナルディレクトリを削除するかどうかを設定する.
    ///
    /// デフォルト値は`false`.
    pub fn cleanup(&mut self, enabled: bool) -> &mut Self {
        self.cleanup = enabled;
        self
    }

    /// ロガーを設定する.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// `path`のファイルに対する復旧処理を実行する.
    pub fn check<P: AsRef<Path>>(&self, path: P) -> Result<CheckReport> {
        let path = path.as_ref();
        let mut builder = JournalStoreBuilder::new();
        builder.logger(self.logger.clone());
        if let Some(ref dir) = self.journal_dir {
            builder.journal_dir(dir);
        }

        let metrics = CheckMetrics::new(&self.metrics);
        let journal_metrics = JournalMetrics::new(&self.metrics);
        let mut journal =
            if let Some(journal) = track!(builder.open_existing_with_metrics(path, journal_metrics))? {
                journal
            } else {
                metrics.record(&CheckReport::default());
                return Ok(CheckReport::default());
            };
        let data = track!(DataFileOptions::new().create(false).open(path))?;
        track!(recover(
            &data,
            &mut journal,
            self.cleanup,
            &self.logger,
            &metrics
        ))
    }
}
impl Default for Checker {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn recover(
    data: &DataFile,
    journal: &mut JournalStore,
    cleanup: bool,
    logger: &Logger,
    metrics: &CheckMetrics,
) -> Result<CheckReport> {
    let mut report = CheckReport::default();
    let mut reapplied = Vec::new();
    let mut replaying = false;
    let mut scanned_entries = Vec::new();
    for scanned in track!(journal.scan())? {
        let scanned = track!(scanned)?;
        match scanned.outcome {
            ScanOutcome::Locked => {
                report.in_progress += 1;
            }
            ScanOutcome::Defective(ref defect) => {
                match *defect {
                    EntryDefect::Truncated { .. } => report.invalid += 1,
                    EntryDefect::ChecksumMismatch { .. } => report.corrupt += 1,
                    EntryDefect::Malformed(_) => report.broken += 1,
                }
                warn!(logger, "Defective journal entry is discarded";
                      "seq" => scanned.seq, "defect" => defect.to_string());
                journal.discard(scanned.seq);
            }
            ScanOutcome::Valid(ref entry) => {
                let resolved = entry.state.is_resolved();
                if !resolved || replaying {
                    track!(replay(data, entry))?;
                    replaying = true;
                    report.reapplied += 1;
                    debug!(logger, "Journal entry is reapplied";
                           "seq" => entry.seq, "state" => format!("{:?}", entry.state));
                }
                if resolved {
                    journal.discard(entry.seq);
                } else {
                    reapplied.push(entry.seq);
                }
            }
        }
        scanned_entries.push(scanned);
    }

    if !reapplied.is_empty() {
        track!(data.sync())?;
        for seq in reapplied {
            track!(journal.mark_sequence(seq, EntryState::Applied))?;
        }
    }
    track!(journal.compact())?;
    scanned_entries.clear();

    if cleanup {
        track!(journal.remove_if_empty())?;
    }

    report.total = report.sum();
    metrics.record(&report);
    info!(logger, "Journal check finished";
          "reapplied" => report.reapplied, "invalid" => report.invalid,
          "corrupt" => report.corrupt, "in_progress" => report.in_progress,
          "broken" => report.broken);
    Ok(report)
}

fn replay(data: &DataFile, entry: &JournalEntry) -> Result<()> {
    for op in &entry.ops {
        track!(data.write_at(&op.data, op.offset); entry.seq)?;
    }
    if let Some(size) = entry.truncate_to {
        if track!(data.size())? > size {
            track!(data.truncate(size); entry.seq)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::{self, OpenOptions};
    use std::mem;
    use std::os::unix::fs::FileExt;
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;
    use crate::journal::{JournalStore, WriteOp};
    use crate::{JournaledFile, TransactionFlags};

    #[test]
    fn missing_journal_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let report = track!(check(dir.path().join("foo"), CheckFlags::default()))?;
        assert_eq!(report, CheckReport::default());
        Ok(())
    }

    #[test]
    fn classification_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        track!(DataFile::open(&path))?;
        {
            let mut journal = track!(JournalStore::open(&path))?;
            let ops = vec![WriteOp::new(0, b"COMMIT".to_vec())];
            let mut e = track!(journal.append(&ops, false))?;
            track!(journal.mark(&mut e, EntryState::Committed))?;
            track!(journal.append(&ops, false))?;
            track!(journal.append(&ops, false))?;

            // 2: 途中で切れたエントリ
            let path2 = journal.dir().join("2");
            let len = track_io!(fs::metadata(&path2))?.len();
            let file = track_io!(OpenOptions::new().write(true).open(&path2))?;
            track_io!(file.set_len(len / 2))?;

            // 3: 末尾のチェックサムのバイトを反転させたエントリ
            let path3 = journal.dir().join("3");
            let len = track_io!(fs::metadata(&path3))?.len();
            let file = track_io!(OpenOptions::new().read(true).write(true).open(&path3))?;
            let mut last = [0; 1];
            track_io!(file.read_exact_at(&mut last, len - 1))?;
            track_io!(file.write_all_at(&[!last[0]], len - 1))?;
        }

        let report = track!(check(&path, CheckFlags::default()))?;
        assert_eq!(
            report,
            CheckReport {
                reapplied: 1,
                invalid: 1,
                corrupt: 1,
                in_progress: 0,
                broken: 0,
                total: 3,
            }
        );
        assert_eq!(track!(DataFile::open(&path)?.read_at(6, 0))?, b"COMMIT");

        // 二回目は何も見つからない
        let report = track!(check(&path, CheckFlags::default()))?;
        assert_eq!(report, CheckReport::default());
        Ok(())
    }

    #[test]
    fn entries_after_reapplied_one_are_replayed_in_order() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        let data = track!(DataFile::open(&path))?;
        {
            let mut journal = track!(JournalStore::open(&path))?;
            let mut e1 = track!(journal.append(&[WriteOp::new(0, b"AAAA".to_vec())], false))?;
            track!(journal.mark(&mut e1, EntryState::Committed))?;
            let mut e2 = track!(journal.append(&[WriteOp::new(0, b"BBBB".to_vec())], false))?;
            track!(journal.mark(&mut e2, EntryState::Applied))?;
            let ops = vec![WriteOp::new(2, b"CCCC".to_vec())];
            let mut e3 = track!(journal.append_with_truncation(&ops, Some(3), false))?;
            track!(journal.mark(&mut e3, EntryState::Applied))?;
            assert_eq!(track!(journal.compact())?, 0);
        }
        track!(data.write_at(b"BBC", 0))?;

        let report = track!(check(&path, CheckFlags::default()))?;
        assert_eq!(report.reapplied, 3);
        assert_eq!(report.total, 3);
        assert_eq!(track!(data.read_at(10, 0))?, b"BBC");

        let report = track!(check(&path, CheckFlags::default()))?;
        assert_eq!(report, CheckReport::default());
        Ok(())
    }

    #[test]
    fn later_commit_survives_reopen_after_linger_commit() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        {
            let file = track!(JournaledFile::open(&path))?;
            let flags = TransactionFlags {
                linger: true,
                ..TransactionFlags::new()
            };
            let mut t = track!(file.transaction(flags))?;
            track!(t.write(b"AAAA", 0))?;
            track!(t.commit())?;
            track!(file.pwrite(b"BBBB", 0))?;
            // 同期も`close`も行わずに閉じる
        }
        let report = track!(check(&path, CheckFlags::default()))?;
        assert_eq!(report.reapplied, 2);
        assert_eq!(track!(DataFile::open(&path)?.read_at(4, 0))?, b"BBBB");

        let file = track!(JournaledFile::open(&path))?;
        assert_eq!(track!(file.pread(4, 0))?, b"BBBB");
        assert_eq!(file.metrics().check().entries(), CheckReport::default());
        Ok(())
    }

    #[test]
    fn broken_entry_is_discarded() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        track!(DataFile::open(&path))?;

        let journal_dir = {
            let mut journal = track!(JournalStore::open(&path))?;
            track!(journal.append(&[WriteOp::new(0, b"foo".to_vec())], false))?;
            journal.dir().to_path_buf()
        };

        // ファイル名とシーケンス番号が一致しない
        track_io!(fs::rename(journal_dir.join("1"), journal_dir.join("7")))?;

        let report = track!(check(&path, CheckFlags::default()))?;
        assert_eq!(report.broken, 1);
        assert_eq!(report.total, 1);
        assert_eq!(track!(DataFile::open(&path)?.read_at(3, 0))?, b"");
        Ok(())
    }

    #[test]
    fn resolved_entries_are_removed_silently() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        track!(DataFile::open(&path))?;

        let journal_dir = {
            let mut journal = track!(JournalStore::open(&path))?;
            let mut e = track!(journal.append(&[WriteOp::new(0, b"foo".to_vec())], false))?;
            track!(journal.mark(&mut e, EntryState::RolledBack))?;
            journal.dir().to_path_buf()
        };
        assert!(journal_dir.join("1").exists());

        let report = track!(check(&path, CheckFlags::default()))?;
        assert_eq!(report, CheckReport::default());
        assert!(!journal_dir.join("1").exists());
        assert_eq!(track!(DataFile::open(&path)?.read_at(3, 0))?, b"");
        Ok(())
    }

    #[test]
    fn locked_entry_is_kept() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        track!(DataFile::open(&path))?;

        let mut journal = track!(JournalStore::open(&path))?;
        let e = track!(journal.append(&[WriteOp::new(0, b"foo".to_vec())], true))?;

        let report = track!(check(&path, CheckFlags::default()))?;
        assert_eq!(report.in_progress, 1);
        assert_eq!(report.total, 1);
        assert!(journal.dir().join("1").exists());

        // コミット処理が終わらないまま(ロックが解放されて)クラッシュした場合
        mem::drop(e);
        let report = track!(check(&path, CheckFlags::default()))?;
        assert_eq!(report.reapplied, 1);
        assert_eq!(track!(DataFile::open(&path)?.read_at(3, 0))?, b"foo");
        Ok(())
    }

    #[test]
    fn cleanup_works() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        track!(DataFile::open(&path))?;
        let journal_dir = track!(JournalStore::open(&path))?.dir().to_path_buf();
        assert!(journal_dir.exists());

        let flags = CheckFlags { cleanup: true };
        let report = track!(check(&path, flags))?;
        assert_eq!(report, CheckReport::default());
        assert!(!journal_dir.exists());
        Ok(())
    }

    #[test]
    fn metrics_work() -> TestResult {
        let dir = track_io!(TempDir::new("cannyjio_test"))?;
        let path = dir.path().join("foo");
        track!(DataFile::open(&path))?;
        {
            let mut journal = track!(JournalStore::open(&path))?;
            track!(journal.append(&[WriteOp::new(0, b"foo".to_vec())], false))?;
        }

        let metrics = CheckMetrics::new(&MetricBuilder::new());
        let mut journal = track!(JournalStore::open(&path))?;
        let data = track!(DataFile::open(&path))?;
        let logger = Logger::root(Discard, o!());
        let report = track!(recover(&data, &mut journal, false, &logger, &metrics))?;
        assert_eq!(report.reapplied, 1);
        assert_eq!(metrics.runs(), 1);
        assert_eq!(metrics.entries(), report);
        Ok(())
    }
}
