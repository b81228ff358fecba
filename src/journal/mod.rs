//! 先行書き込みログ(ジャーナル)の永続化.
//!
//! # ディレクトリ構成
//!
//! 対象ファイルが`<親ディレクトリ>/<ファイル名>`の場合、ジャーナルは
//! `<親ディレクトリ>/.<ファイル名>.jio/`に置かれる.
//!
//! ```text
//! .<ファイル名>.jio/
//!   header  ... ジャーナルヘッダ(次のシーケンス番号等)
//!   1       ... シーケンス番号1のエントリ
//!   2       ... シーケンス番号2のエントリ
//!   ...
//! ```
//!
//! 一つのエントリは一つのトランザクションに対応し、そのファイル名はシーケンス番号の十進表記となる.
//!
//! ジャーナルディレクトリは`JournalStore::relocate`によって別のディレクトリに移動可能.
//! その場合、元の位置には移動先へのシンボリックリンクが置かれるので、
//! 復旧処理は対象ファイルのパスのみからジャーナルを辿ることができる.
use libc;
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{symlink, FileExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::vec;

pub use self::header::JournalHeader;
pub use self::record::{EntryDefect, EntryState, JournalEntry, SequenceId, WriteOp};

use self::record::STATE_OFFSET;
use crate::metrics::JournalMetrics;
use crate::{ErrorKind, Result};

mod header;
mod record;

pub(crate) const HEADER_FILE_NAME: &str = "header";

/// 対象ファイルに隣接するジャーナルディレクトリのパスを返す.
///
/// # Examples
///
/// ```
/// use cannyjio::journal::default_journal_dir;
/// use std::path::Path;
///
/// let dir = default_journal_dir("/tmp/foo.db").unwrap();
/// assert_eq!(dir, Path::new("/tmp/.foo.db.jio"));
/// ```
pub fn default_journal_dir<P: AsRef<Path>>(data_path: P) -> Result<PathBuf> {
    let data_path = data_path.as_ref();
    let name = track_assert_some!(
        data_path.file_name(),
        ErrorKind::InvalidInput,
        "path={:?}",
        data_path
    );
    let dir_name = format!(".{}.jio", name.to_string_lossy());
    match data_path.parent() {
        Some(parent) if parent != Path::new("") => Ok(parent.join(dir_name)),
        _ => Ok(PathBuf::from(dir_name)),
    }
}

/// `JournalStore`のビルダ.
#[derive(Debug, Clone)]
pub struct JournalStoreBuilder {
    journal_dir: Option<PathBuf>,
    logger: Logger,
    metrics: MetricBuilder,
}
impl JournalStoreBuilder {
    /// デフォルト設定で`JournalStoreBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        JournalStoreBuilder {
            journal_dir: None,
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// ジャーナルディレクトリの位置を明示的に指定する.
    ///
    /// デフォルトでは対象ファイルに隣接するディレクトリ(ないしそこからのシンボリックリンクの先)が使われる.
    pub fn journal_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.journal_dir = Some(dir.as_ref().to_path_buf());
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

    /// `data_path`に対応するジャーナルストアを開く.
    ///
    /// ジャーナルディレクトリが存在しない場合には作成される.
    pub fn open<P: AsRef<Path>>(&self, data_path: P) -> Result<JournalStore> {
        let metrics = JournalMetrics::new(&self.metrics);
        track!(self.open_with_metrics(data_path.as_ref(), metrics))
    }

    /// `data_path`に対応する既存のジャーナルストアを開く.
    ///
    /// ジャーナルディレクトリが存在しない場合には`Ok(None)`が返される.
    pub fn open_existing<P: AsRef<Path>>(&self, data_path: P) -> Result<Option<JournalStore>> {
        let metrics = JournalMetrics::new(&self.metrics);
        track!(self.open_existing_with_metrics(data_path.as_ref(), metrics))
    }

    pub(crate) fn open_with_metrics(
        &self,
        data_path: &Path,
        metrics: JournalMetrics,
    ) -> Result<JournalStore> {
        let (default_dir, dir) = track!(self.locate(data_path))?;
        track!(
            track_io!(fs::create_dir_all(&dir)),
            "journal_dir={:?}",
            dir
        )?;
        track!(JournalStore::open_dir(
            default_dir,
            dir,
            self.logger.clone(),
            metrics
        ))
    }

    pub(crate) fn open_existing_with_metrics(
        &self,
        data_path: &Path,
        metrics: JournalMetrics,
    ) -> Result<Option<JournalStore>> {
        let (default_dir, dir) = track!(self.locate(data_path))?;
        if !dir.is_dir() {
            return Ok(None);
        }
        let store = track!(JournalStore::open_dir(
            default_dir,
            dir,
            self.logger.clone(),
            metrics
        ))?;
        Ok(Some(store))
    }

    fn locate(&self, data_path: &Path) -> Result<(PathBuf, PathBuf)> {
        let default_dir = track!(default_journal_dir(data_path))?;
        let dir = if let Some(ref dir) = self.journal_dir {
            dir.clone()
        } else {
            track!(resolve_link(&default_dir))?
        };
        Ok((default_dir, dir))
    }
}
impl Default for JournalStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// ジャーナルストア.
///
/// エントリの追記・状態の書き換え・走査・回収、およびディレクトリの移動を担当する.
///
/// 複数スレッドから利用する場合には、外側で`Mutex`等による排他を行う必要がある.
#[derive(Debug)]
pub struct JournalStore {
    default_dir: PathBuf,
    dir: PathBuf,
    header: JournalHeader,
    persisted_next_sequence: SequenceId,
    lingering: BTreeSet<SequenceId>,
    unresolved: BTreeSet<SequenceId>,
    reclaimable: BTreeSet<SequenceId>,
    active_transactions: usize,
    logger: Logger,
    metrics: JournalMetrics,
}
impl JournalStore {
    /// デフォルト設定で`data_path`に対応するジャーナルストアを開く.
    pub fn open<P: AsRef<Path>>(data_path: P) -> Result<Self> {
        track!(JournalStoreBuilder::new().open(data_path))
    }

    fn open_dir(
        default_dir: PathBuf,
        dir: PathBuf,
        logger: Logger,
        metrics: JournalMetrics,
    ) -> Result<Self> {
        let logger = logger.new(o!("journal_dir" => dir.to_string_lossy().into_owned()));
        let mut header = if let Some(header) = track!(JournalHeader::read_from_dir(&dir))? {
            header
        } else {
            let header = JournalHeader::new();
            track!(header.write_to_dir(&dir))?;
            info!(logger, "New journal header is created"; "uuid" => header.instance_uuid.to_string());
            header
        };
        let persisted_next_sequence = header.next_sequence;

        let ids = track!(list_entry_ids(&dir))?;
        if let Some(last) = ids.last() {
            header.next_sequence = ::std::cmp::max(header.next_sequence, last + 1);
        }
        info!(logger, "Journal store is opened";
              "entries" => ids.len(), "next_sequence" => header.next_sequence);

        Ok(JournalStore {
            default_dir,
            dir,
            header,
            persisted_next_sequence,
            lingering: BTreeSet::new(),
            unresolved: BTreeSet::new(),
            reclaimable: BTreeSet::new(),
            active_transactions: 0,
            logger,
            metrics,
        })
    }

    /// ジャーナルディレクトリのパスを返す.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// ジャーナルヘッダを返す.
    ///
    /// `next_sequence`には、まだ永続化されていない値が含まれ得る.
    pub fn header(&self) -> &JournalHeader {
        &self.header
    }

    /// ジャーナルストアのメトリクスを返す.
    pub fn metrics(&self) -> &JournalMetrics {
        &self.metrics
    }

    /// `linger`指定によりコミット済み状態のまま保持されているエントリ群を返す.
    pub fn lingering_entries(&self) -> Vec<SequenceId> {
        self.lingering.iter().cloned().collect()
    }

    /// このインスタンスが追記したエントリのうち、まだ適用済みないし取り消し済みになっていないものの中で、
    /// 最も古いもののシーケンス番号を返す.
    ///
    /// これより新しいエントリは、解決済みであっても回収されずに残される.
    pub fn oldest_unresolved_entry(&self) -> Option<SequenceId> {
        self.unresolved.iter().next().cloned()
    }

    /// オープン中のトランザクションの数を返す.
    pub fn active_transactions(&self) -> usize {
        self.active_transactions
    }

    pub(crate) fn begin_transaction(&mut self) {
        self.active_transactions += 1;
    }

    pub(crate) fn end_transaction(&mut self) {
        self.active_transactions = self.active_transactions.saturating_sub(1);
    }

    /// 書き込み操作群を新しいエントリとしてジャーナルに追記する.
    ///
    /// エントリの状態は`EntryState::InProgress`となる.
    /// この関数が返った時点で、エントリとそのディレクトリエントリの永続化は完了している.
    ///
    /// `lock`が`true`の場合には、返り値がドロップされるまでエントリファイルの排他ロック(`flock(2)`)が保持され、
    /// 並行して実行された復旧処理は、そのエントリを処理中として扱う.
    pub fn append(&mut self, ops: &[WriteOp], lock: bool) -> Result<EntryHandle> {
        track!(self.append_with_truncation(ops, None, lock))
    }

    /// `append`と同様だが、書き込み操作群の適用後にファイルを`truncate_to`のサイズまで切り詰めることも記録する.
    pub fn append_with_truncation(
        &mut self,
        ops: &[WriteOp],
        truncate_to: Option<u64>,
        lock: bool,
    ) -> Result<EntryHandle> {
        let seq = self.header.next_sequence;
        self.header.next_sequence += 1;

        let entry = JournalEntry {
            seq,
            state: EntryState::InProgress,
            ops,
            truncate_to,
        };
        let mut buf = Vec::with_capacity(entry.external_size());
        track!(entry.write_to(&mut buf))?;

        let path = entry_path(&self.dir, seq);
        let mut file = track!(
            track_io!(OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)),
            "path={:?}",
            path
        )?;
        let result: Result<()> = (|| {
            if lock {
                track_io!(flock(&file, libc::LOCK_EX))?;
            }
            track_io!(file.write_all(&buf))?;
            track_io!(file.sync_data())?;
            track!(sync_dir(&self.dir))?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&path);
            return Err(track!(e; seq));
        }

        self.unresolved.insert(seq);
        self.metrics.appended_entries.increment();
        self.metrics.appended_bytes.add_u64(buf.len() as u64);
        debug!(self.logger, "Journal entry is appended";
               "seq" => seq, "ops" => ops.len(), "bytes" => buf.len());
        Ok(EntryHandle {
            seq,
            state: EntryState::InProgress,
            file,
        })
    }

    /// 追記済みのエントリの状態を書き換える.
    ///
    /// 同じ状態への書き換えは何も行わない.
    /// 遷移が許されていない場合には`ErrorKind::InvalidState`エラーが返される.
    pub fn mark(&mut self, entry: &mut EntryHandle, state: EntryState) -> Result<()> {
        if entry.state == state {
            return Ok(());
        }
        track!(write_state(&entry.file, entry.seq, entry.state, state))?;
        entry.state = state;
        self.after_mark(entry.seq, state);
        Ok(())
    }

    /// シーケンス番号で指定されたエントリの状態を書き換える.
    ///
    /// エントリが既に存在しない場合(i.e., 回収済み)には何も行わない.
    pub fn mark_sequence(&mut self, seq: SequenceId, state: EntryState) -> Result<()> {
        let path = entry_path(&self.dir, seq);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                self.lingering.remove(&seq);
                return Ok(());
            }
            Err(e) => return track!(track_io!(Err(e)), "path={:?}", path),
        };

        let mut current = [0; 1];
        track_io!(file.read_exact_at(&mut current, STATE_OFFSET))?;
        let current = track_assert_some!(
            EntryState::from_u8(current[0]),
            ErrorKind::InvalidState,
            "Unknown entry state: seq={}, state={}",
            seq,
            current[0]
        );
        if current != state {
            track!(write_state(&file, seq, current, state))?;
        }
        self.after_mark(seq, state);
        Ok(())
    }

    /// 復旧処理等で不要と判断されたエントリを、次回の回収対象に加える.
    pub(crate) fn discard(&mut self, seq: SequenceId) {
        self.lingering.remove(&seq);
        self.unresolved.remove(&seq);
        self.reclaimable.insert(seq);
    }

    fn after_mark(&mut self, seq: SequenceId, state: EntryState) {
        self.metrics.marked_entries.increment(state);
        match state {
            EntryState::InProgress => {}
            EntryState::Committed => {
                self.lingering.insert(seq);
            }
            EntryState::Applied | EntryState::RolledBack => {
                self.lingering.remove(&seq);
                self.unresolved.remove(&seq);
                self.reclaimable.insert(seq);
            }
        }
    }

    /// ジャーナル内のエントリをシーケンス番号順に走査するイテレータを返す.
    ///
    /// 走査対象は呼び出し時点で存在するエントリ.
    /// 走査中に削除されたエントリは単にスキップされる.
    pub fn scan(&self) -> Result<Scan> {
        let ids = track!(list_entry_ids(&self.dir))?;
        Ok(Scan {
            dir: self.dir.clone(),
            ids: ids.into_iter(),
        })
    }

    /// ヘッダを永続化した上で、適用済みないし取り消し済みのエントリを削除する.
    ///
    /// 未解決のエントリ(`oldest_unresolved_entry`)よりも新しいものは削除されない.
    /// 復旧処理は未解決のエントリ以降を順番に再適用するので、その後に続く書き込みも残しておく必要がある.
    ///
    /// 削除したエントリの数を返す.
    pub fn compact(&mut self) -> Result<usize> {
        let barrier = self.oldest_unresolved_entry();
        let targets = self
            .reclaimable
            .iter()
            .cloned()
            .filter(|&seq| barrier.map_or(true, |barrier| seq < barrier))
            .collect::<Vec<_>>();
        if targets.is_empty() {
            return Ok(0);
        }

        // エントリを全て消した後でもシーケンス番号が巻き戻らないように、先にヘッダを更新する
        track!(self.persist_header())?;

        let mut removed = 0;
        for seq in targets {
            match fs::remove_file(entry_path(&self.dir, seq)) {
                Ok(()) => removed += 1,
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.metrics.compacted_entries.add_u64(removed as u64);
                    return track!(track_io!(Err(e)), "seq={}", seq);
                }
            }
            self.reclaimable.remove(&seq);
        }
        track!(sync_dir(&self.dir))?;
        self.metrics.compacted_entries.add_u64(removed as u64);
        debug!(self.logger, "Journal is compacted";
               "removed" => removed, "retained" => self.reclaimable.len());
        Ok(removed)
    }

    /// メモリ上のヘッダ(次のシーケンス番号)を永続化する.
    pub fn persist_header(&mut self) -> Result<()> {
        if self.header.next_sequence != self.persisted_next_sequence {
            track!(self.header.write_to_dir(&self.dir))?;
            self.persisted_next_sequence = self.header.next_sequence;
        }
        Ok(())
    }

    /// ジャーナルディレクトリを`new_parent`配下に移動する.
    ///
    /// 移動先は`new_parent/.<ファイル名>.jio`となり、
    /// 元の(対象ファイルに隣接する)位置には移動先へのシンボリックリンクが置かれる.
    ///
    /// 現在の位置と同じ場所が指定された場合には何も行わない.
    /// オープン中のトランザクションが存在する場合には`ErrorKind::Busy`エラーが返される.
    pub fn relocate<P: AsRef<Path>>(&mut self, new_parent: P) -> Result<()> {
        track_assert_eq!(
            self.active_transactions,
            0,
            ErrorKind::Busy,
            "Cannot move the journal while transactions are open"
        );
        let new_parent = new_parent.as_ref();
        track!(
            track_io!(fs::create_dir_all(new_parent)),
            "new_parent={:?}",
            new_parent
        )?;
        let dir_name = track_assert_some!(self.default_dir.file_name(), ErrorKind::InconsistentState)
            .to_owned();
        let new_parent = track_io!(fs::canonicalize(new_parent))?;
        let new_dir = new_parent.join(&dir_name);
        let old_dir = track_io!(fs::canonicalize(&self.dir))?;
        if new_dir == old_dir {
            return Ok(());
        }
        track!(self.persist_header())?;

        let default_parent = track_io!(fs::canonicalize(parent_of(&self.default_dir)))?;
        let default_dir = default_parent.join(&dir_name);
        let had_link = is_symlink(&default_dir);
        if had_link {
            track_io!(fs::remove_file(&default_dir))?;
        }
        track_assert!(
            fs::symlink_metadata(&new_dir).is_err(),
            ErrorKind::InvalidInput,
            "Destination already exists: {:?}",
            new_dir
        );

        if let Err(e) = track!(move_dir(&old_dir, &new_dir)) {
            if had_link {
                let _ = symlink(&old_dir, &default_dir);
            }
            return Err(e);
        }
        if new_dir != default_dir {
            track_io!(symlink(&new_dir, &default_dir))?;
        }
        track!(sync_dir(&new_parent))?;
        track!(sync_dir(&default_parent))?;
        if let Some(old_parent) = old_dir.parent() {
            track!(sync_dir(old_parent))?;
        }

        self.metrics.relocations.increment();
        info!(self.logger, "Journal directory is relocated";
              "from" => old_dir.to_string_lossy().into_owned(),
              "to" => new_dir.to_string_lossy().into_owned());
        self.dir = new_dir;
        Ok(())
    }

    /// ジャーナルが空の場合に、ジャーナルディレクトリ(および移動元のシンボリックリンク)を削除する.
    ///
    /// 削除した場合には`true`が返される.
    pub fn remove_if_empty(&mut self) -> Result<bool> {
        if !track!(list_entry_ids(&self.dir))?.is_empty() {
            return Ok(false);
        }
        match fs::remove_file(self.dir.join(HEADER_FILE_NAME)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return track_io!(Err(e)),
        }
        track!(
            track_io!(fs::remove_dir(&self.dir)),
            "journal_dir={:?}",
            self.dir
        )?;
        if is_symlink(&self.default_dir) {
            track_io!(fs::remove_file(&self.default_dir))?;
        }
        track!(sync_dir(parent_of(&self.default_dir)))?;
        self.lingering.clear();
        self.unresolved.clear();
        self.reclaimable.clear();
        self.persisted_next_sequence = 0;
        info!(self.logger, "Empty journal directory is removed");
        Ok(true)
    }
}

/// 追記されたエントリへのハンドル.
///
/// `JournalStore::append`の`lock`引数が`true`の場合には、
/// このハンドルがドロップされるまでエントリファイルの排他ロックが保持される.
#[derive(Debug)]
pub struct EntryHandle {
    seq: SequenceId,
    state: EntryState,
    file: File,
}
impl EntryHandle {
    /// エントリのシーケンス番号を返す.
    pub fn seq(&self) -> SequenceId {
        self.seq
    }

    /// エントリの(最後に書き込んだ)状態を返す.
    pub fn state(&self) -> EntryState {
        self.state
    }
}

/// ジャーナル内のエントリを走査するイテレータ.
///
/// `JournalStore::scan`によって生成される.
#[derive(Debug)]
pub struct Scan {
    dir: PathBuf,
    ids: vec::IntoIter<SequenceId>,
}
impl Scan {
    fn load(&self, seq: SequenceId) -> Result<Option<ScannedEntry>> {
        let path = entry_path(&self.dir, seq);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return track!(track_io!(Err(e)), "path={:?}", path),
        };
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => {
                return Ok(Some(ScannedEntry {
                    seq,
                    path,
                    outcome: ScanOutcome::Locked,
                    _lock: None,
                }));
            }
            Err(e) => return track!(track_io!(Err(e)), "path={:?}", path),
        }

        let mut bytes = Vec::new();
        track_io!(file.read_to_end(&mut bytes))?;
        let outcome = match JournalEntry::decode(&bytes) {
            Ok(ref entry) if entry.seq != seq => {
                ScanOutcome::Defective(EntryDefect::Malformed("sequence mismatch"))
            }
            Ok(entry) => ScanOutcome::Valid(entry),
            Err(defect) => ScanOutcome::Defective(defect),
        };
        Ok(Some(ScannedEntry {
            seq,
            path,
            outcome,
            _lock: Some(file),
        }))
    }
}
impl Iterator for Scan {
    type Item = Result<ScannedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(seq) = self.ids.next() {
            match track!(self.load(seq)) {
                Ok(None) => {}
                Ok(Some(entry)) => return Some(Ok(entry)),
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// 走査されたエントリ.
///
/// `outcome`が`ScanOutcome::Locked`以外の場合には、
/// この値がドロップされるまでエントリファイルの排他ロックが保持される.
#[derive(Debug)]
pub struct ScannedEntry {
    /// ファイル名から得られたシーケンス番号.
    pub seq: SequenceId,

    /// エントリファイルのパス.
    pub path: PathBuf,

    /// 走査結果.
    pub outcome: ScanOutcome,

    _lock: Option<File>,
}

/// エントリの走査結果.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// 他のコミット処理によってロックされている.
    Locked,

    /// 正常なエントリ.
    Valid(JournalEntry),

    /// 復号できなかったエントリ.
    Defective(EntryDefect),
}

pub(crate) fn sync_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    let dir = track_io!(File::open(dir.as_ref()))?;
    track_io!(dir.sync_all())?;
    Ok(())
}

fn entry_path(dir: &Path, seq: SequenceId) -> PathBuf {
    dir.join(seq.to_string())
}

fn list_entry_ids(dir: &Path) -> Result<Vec<SequenceId>> {
    let mut ids = Vec::new();
    for entry in track!(track_io!(fs::read_dir(dir)), "dir={:?}", dir)? {
        let entry = track_io!(entry)?;
        let name = entry.file_name();
        let seq = name.to_str().and_then(|s| {
            s.parse::<SequenceId>()
                .ok()
                .filter(|seq| seq.to_string() == s)
        });
        if let Some(seq) = seq {
            ids.push(seq);
        }
    }
    ids.sort();
    Ok(ids)
}

fn write_state(file: &File, seq: SequenceId, current: EntryState, next: EntryState) -> Result<()> {
    track_assert!(
        current.can_transit_to(next),
        ErrorKind::InvalidState,
        "Illegal entry state transition: seq={}, {:?} => {:?}",
        seq,
        current,
        next
    );
    track_io!(file.write_all_at(&[next.as_u8()], STATE_OFFSET))?;
    track_io!(file.sync_data())?;
    Ok(())
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        if unsafe { libc::flock(file.as_raw_fd(), operation) } == 0 {
            return Ok(());
        }
        let e = io::Error::last_os_error();
        if e.kind() != io::ErrorKind::Interrupted {
            return Err(e);
        }
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

fn parent_of(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if parent != Path::new("") => parent,
        _ => Path::new("."),
    }
}

fn resolve_link(default_dir: &Path) -> Result<PathBuf> {
    if !is_symlink(default_dir) {
        return Ok(default_dir.to_path_buf());
    }
    let target = track_io!(fs::read_link(default_dir))?;
    if target.is_absolute() {
        Ok(target)
    } else {
        Ok(parent_of(default_dir).join(target))
    }
}

fn move_dir(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(ref e) if e.raw_os_error() == Some(libc::EXDEV) => {
            // デバイスを跨ぐ場合には、コピーしてから削除する
            track_io!(fs::create_dir(to))?;
            for entry in track_io!(fs::read_dir(from))? {
                let entry = track_io!(entry)?;
                let dst = to.join(entry.file_name());
                track_io!(fs::copy(entry.path(), &dst))?;
                track_io!(track_io!(File::open(&dst))?.sync_all())?;
            }
            track!(sync_dir(to))?;
            track_io!(fs::remove_dir_all(from))?;
            Ok(())
        }
        Err(e) => track!(track_io!(Err(e)), "from={:?}, to={:?}", from, to),
    }
}
