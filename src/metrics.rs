//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, MetricBuilder};

use crate::check::CheckReport;
use crate::journal::EntryState;

/// ジャーナルストアのメトリクス.
#[derive(Debug, Clone)]
pub struct JournalMetrics {
    pub(crate) appended_entries: Counter,
    pub(crate) appended_bytes: Counter,
    pub(crate) marked_entries: EntryStateCounter,
    pub(crate) compacted_entries: Counter,
    pub(crate) relocations: Counter,
}
impl JournalMetrics {
    /// ジャーナルに追記されたエントリの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_journal_appended_entries_total <COUNTER>
    /// ```
    pub fn appended_entries(&self) -> u64 {
        self.appended_entries.value() as u64
    }

    /// ジャーナルに追記されたバイト数(エントリのフレームも含む).
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_journal_appended_bytes_total <COUNTER>
    /// ```
    pub fn appended_bytes(&self) -> u64 {
        self.appended_bytes.value() as u64
    }

    /// 状態が書き換えられたエントリの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_journal_marked_entries_total { state="committed|applied|rolled_back" } <COUNTER>
    /// ```
    pub fn marked_entries(&self) -> &EntryStateCounter {
        &self.marked_entries
    }

    /// 回収(削除)されたエントリの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_journal_compacted_entries_total <COUNTER>
    /// ```
    pub fn compacted_entries(&self) -> u64 {
        self.compacted_entries.value() as u64
    }

    /// ジャーナルディレクトリの移動回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_journal_relocations_total <COUNTER>
    /// ```
    pub fn relocations(&self) -> u64 {
        self.relocations.value() as u64
    }

    /// 追記されたが、まだ回収されていないエントリの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_journal_appended_entries_total - cannyjio_journal_compacted_entries_total
    /// ```
    pub fn pending_entries(&self) -> u64 {
        // NOTE: 以下の順番で値を取得しないとアンダーフローする可能性がある
        let dec = self.compacted_entries();
        let inc = self.appended_entries();
        inc.saturating_sub(dec)
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("cannyjio").subsystem("journal");
        JournalMetrics {
            appended_entries: builder
                .counter("appended_entries_total")
                .help("Number of entries appended to the journal")
                .finish()
                .expect("Never fails"),
            appended_bytes: builder
                .counter("appended_bytes_total")
                .help("Number of bytes appended to the journal")
                .finish()
                .expect("Never fails"),
            marked_entries: EntryStateCounter::new(
                &builder,
                "marked_entries_total",
                "Number of entries whose state has been rewritten",
            ),
            compacted_entries: builder
                .counter("compacted_entries_total")
                .help("Number of entries removed from the journal")
                .finish()
                .expect("Never fails"),
            relocations: builder
                .counter("relocations_total")
                .help("Number of journal directory relocations")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// エントリの状態毎のカウンタ.
///
/// 初期状態である`in_progress`はマークの対象とならないため、カウント対象には含まれていない.
#[derive(Debug, Clone)]
pub struct EntryStateCounter {
    pub(crate) committed: Counter,
    pub(crate) applied: Counter,
    pub(crate) rolled_back: Counter,
}
impl EntryStateCounter {
    /// `committed`に遷移したエントリの数.
    pub fn committed(&self) -> u64 {
        self.committed.value() as u64
    }

    /// `applied`に遷移したエントリの数.
    pub fn applied(&self) -> u64 {
        self.applied.value() as u64
    }

    /// `rolled_back`に遷移したエントリの数.
    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.value() as u64
    }

    pub(crate) fn increment(&self, state: EntryState) {
        match state {
            EntryState::InProgress => {}
            EntryState::Committed => self.committed.increment(),
            EntryState::Applied => self.applied.increment(),
            EntryState::RolledBack => self.rolled_back.increment(),
        }
    }

    fn new(builder: &MetricBuilder, name: &str, help: &str) -> Self {
        let counter = |state| {
            builder
                .counter(name)
                .help(help)
                .label("state", state)
                .finish()
                .expect("Never fails")
        };
        EntryStateCounter {
            committed: counter("committed"),
            applied: counter("applied"),
            rolled_back: counter("rolled_back"),
        }
    }
}

/// トランザクションのメトリクス.
#[derive(Debug, Clone)]
pub struct TransactionMetrics {
    pub(crate) begun: Counter,
    pub(crate) committed: Counter,
    pub(crate) committed_bytes: Counter,
    pub(crate) failed_commits: Counter,
    pub(crate) rolled_back: Counter,
    pub(crate) undone: Counter,
}
impl TransactionMetrics {
    /// 開始されたトランザクションの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_transaction_begun_total <COUNTER>
    /// ```
    pub fn begun(&self) -> u64 {
        self.begun.value() as u64
    }

    /// コミットに成功したトランザクションの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_transaction_committed_total <COUNTER>
    /// ```
    pub fn committed(&self) -> u64 {
        self.committed.value() as u64
    }

    /// コミットによってファイルに書き込まれたバイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_transaction_committed_bytes_total <COUNTER>
    /// ```
    pub fn committed_bytes(&self) -> u64 {
        self.committed_bytes.value() as u64
    }

    /// コミットに失敗した回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_transaction_failed_commits_total <COUNTER>
    /// ```
    pub fn failed_commits(&self) -> u64 {
        self.failed_commits.value() as u64
    }

    /// ロールバックされたトランザクションの数.
    ///
    /// 明示的な`rollback`と、未コミットのままの解放による暗黙のロールバックの両方を含む.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_transaction_rolled_back_total <COUNTER>
    /// ```
    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.value() as u64
    }

    /// コミット後に取り消された(`undo`)トランザクションの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_transaction_undone_total <COUNTER>
    /// ```
    pub fn undone(&self) -> u64 {
        self.undone.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("cannyjio").subsystem("transaction");
        TransactionMetrics {
            begun: builder
                .counter("begun_total")
                .help("Number of transactions begun")
                .finish()
                .expect("Never fails"),
            committed: builder
                .counter("committed_total")
                .help("Number of transactions committed")
                .finish()
                .expect("Never fails"),
            committed_bytes: builder
                .counter("committed_bytes_total")
                .help("Number of bytes written by committed transactions")
                .finish()
                .expect("Never fails"),
            failed_commits: builder
                .counter("failed_commits_total")
                .help("Number of failed commits")
                .finish()
                .expect("Never fails"),
            rolled_back: builder
                .counter("rolled_back_total")
                .help("Number of transactions rolled back")
                .finish()
                .expect("Never fails"),
            undone: builder
                .counter("undone_total")
                .help("Number of committed transactions undone")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// 自動同期スレッドのメトリクス.
#[derive(Debug, Clone)]
pub struct AutoSyncMetrics {
    pub(crate) syncs_by_interval: Counter,
    pub(crate) syncs_by_dirty_bytes: Counter,
    pub(crate) failed_syncs: Counter,
}
impl AutoSyncMetrics {
    /// 自動同期スレッドが発行した同期の回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_autosync_syncs_total { trigger="interval|dirty_bytes" } <COUNTER>
    /// ```
    pub fn syncs(&self) -> u64 {
        self.syncs_by_interval.value() as u64 + self.syncs_by_dirty_bytes.value() as u64
    }

    /// 未同期バイト数の閾値超過を契機とした同期の回数.
    pub fn syncs_by_dirty_bytes(&self) -> u64 {
        self.syncs_by_dirty_bytes.value() as u64
    }

    /// 失敗した同期の回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_autosync_failed_syncs_total <COUNTER>
    /// ```
    pub fn failed_syncs(&self) -> u64 {
        self.failed_syncs.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("cannyjio").subsystem("autosync");
        AutoSyncMetrics {
            syncs_by_interval: builder
                .counter("syncs_total")
                .help("Number of synchronizations issued by the autosync thread")
                .label("trigger", "interval")
                .finish()
                .expect("Never fails"),
            syncs_by_dirty_bytes: builder
                .counter("syncs_total")
                .help("Number of synchronizations issued by the autosync thread")
                .label("trigger", "dirty_bytes")
                .finish()
                .expect("Never fails"),
            failed_syncs: builder
                .counter("failed_syncs_total")
                .help("Number of failed synchronizations issued by the autosync thread")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// 復旧処理のメトリクス.
#[derive(Debug, Clone)]
pub struct CheckMetrics {
    pub(crate) runs: Counter,
    pub(crate) reapplied: Counter,
    pub(crate) invalid: Counter,
    pub(crate) corrupt: Counter,
    pub(crate) in_progress: Counter,
    pub(crate) broken: Counter,
}
impl CheckMetrics {
    /// 復旧処理の実行回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_check_runs_total <COUNTER>
    /// ```
    pub fn runs(&self) -> u64 {
        self.runs.value() as u64
    }

    /// これまでの復旧処理で見つかったエントリの分類毎の合計.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_check_entries_total { outcome="reapplied|invalid|corrupt|in_progress|broken" } <COUNTER>
    /// ```
    pub fn entries(&self) -> CheckReport {
        let mut report = CheckReport {
            reapplied: self.reapplied.value() as u64,
            invalid: self.invalid.value() as u64,
            corrupt: self.corrupt.value() as u64,
            in_progress: self.in_progress.value() as u64,
            broken: self.broken.value() as u64,
            total: 0,
        };
        report.total = report.sum();
        report
    }

    pub(crate) fn record(&self, report: &CheckReport) {
        self.runs.increment();
        self.reapplied.add_u64(report.reapplied);
        self.invalid.add_u64(report.invalid);
        self.corrupt.add_u64(report.corrupt);
        self.in_progress.add_u64(report.in_progress);
        self.broken.add_u64(report.broken);
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("cannyjio").subsystem("check");
        let entries = |outcome| {
            builder
                .counter("entries_total")
                .help("Number of journal entries classified by the check procedure")
                .label("outcome", outcome)
                .finish()
                .expect("Never fails")
        };
        CheckMetrics {
            runs: builder
                .counter("runs_total")
                .help("Number of check procedure runs")
                .finish()
                .expect("Never fails"),
            reapplied: entries("reapplied"),
            invalid: entries("invalid"),
            corrupt: entries("corrupt"),
            in_progress: entries("in_progress"),
            broken: entries("broken"),
        }
    }
}

/// [`JournaledFile`]のメトリクス.
///
/// [`JournaledFile`]: ../file/struct.JournaledFile.html
#[derive(Debug, Clone)]
pub struct FileMetrics {
    pub(crate) syncs: Counter,
    pub(crate) journal: JournalMetrics,
    pub(crate) transaction: TransactionMetrics,
    pub(crate) autosync: AutoSyncMetrics,
    pub(crate) check: CheckMetrics,
}
impl FileMetrics {
    /// ファイルの同期(`JournaledFile::sync`)の実行回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// cannyjio_file_syncs_total <COUNTER>
    /// ```
    pub fn syncs(&self) -> u64 {
        self.syncs.value() as u64
    }

    /// ジャーナルストアのメトリクスを返す.
    pub fn journal(&self) -> &JournalMetrics {
        &self.journal
    }

    /// トランザクションのメトリクスを返す.
    pub fn transaction(&self) -> &TransactionMetrics {
        &self.transaction
    }

    /// 自動同期スレッドのメトリクスを返す.
    pub fn autosync(&self) -> &AutoSyncMetrics {
        &self.autosync
    }

    /// 復旧処理のメトリクスを返す.
    pub fn check(&self) -> &CheckMetrics {
        &self.check
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut file_builder = builder.clone();
        file_builder.namespace("cannyjio").subsystem("file");
        FileMetrics {
            syncs: file_builder
                .counter("syncs_total")
                .help("Number of file synchronizations")
                .finish()
                .expect("Never fails"),
            journal: JournalMetrics::new(builder),
            transaction: TransactionMetrics::new(builder),
            autosync: AutoSyncMetrics::new(builder),
            check: CheckMetrics::new(builder),
        }
    }
}
