use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use super::{JournaledFile, SharedFile};
use crate::check;
use crate::data::DataFileOptions;
use crate::journal::JournalStoreBuilder;
use crate::metrics::FileMetrics;
use crate::transaction::TransactionFlags;
use crate::Result;

/// `JournaledFile`のビルダ.
///
/// # Examples
///
/// ```
/// # extern crate cannyjio;
/// # extern crate tempdir;
/// use cannyjio::{JournaledFileBuilder, TransactionFlags};
/// use tempdir::TempDir;
///
/// # fn main() -> Result<(), cannyjio::Error> {
/// let dir = TempDir::new("cannyjio_doc").unwrap();
/// let file = JournaledFileBuilder::new()
///     .mode(0o644)
///     .flags(TransactionFlags { linger: true, ..TransactionFlags::default() })
///     .open(dir.path().join("foo"))?;
/// file.pwrite(b"foo", 0)?;
/// assert_eq!(file.pread(3, 0)?, b"foo");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct JournaledFileBuilder {
    options: DataFileOptions,
    flags: TransactionFlags,
    journal_dir: Option<PathBuf>,
    recover_on_open: bool,
    logger: Logger,
    metrics: MetricBuilder,
}
impl JournaledFileBuilder {
    /// デフォルト設定で`JournaledFileBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        JournaledFileBuilder {
            options: DataFileOptions::new(),
            flags: TransactionFlags::default(),
            journal_dir: None,
            recover_on_open: true,
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// 読み込み専用で開くかどうかを設定する.
    ///
    /// 読み込み専用の場合には、トランザクションへの書き込みは全て`ErrorKind::InvalidInput`となり、
    /// オープン時の復旧処理も行われない.
    ///
    /// デフォルト値は`false`.
    pub fn read_only(&mut self, enabled: bool) -> &mut Self {
        self.options.read_only(enabled);
        self
    }

    /// ファイルが存在しない場合に作成するかどうかを設定する.
    ///
    /// デフォルト値は`true`.
    pub fn create(&mut self, enabled: bool) -> &mut Self {
        self.options.create(enabled);
        self
    }

    /// オープン時にファイルを空にするかどうかを設定する.
    ///
    /// デフォルト値は`false`.
    pub fn truncate(&mut self, enabled: bool) -> &mut Self {
        self.options.truncate(enabled);
        self
    }

    /// 新規作成時のパーミッションを設定する.
    ///
    /// デフォルト値は`0o600`.
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.options.mode(mode);
        self
    }

    /// 全てのトランザクションに適用されるフラグ群を設定する.
    ///
    /// `JournaledFile::transaction`に指定されたフラグとの論理和が実際に使われる.
    pub fn flags(&mut self, flags: TransactionFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// ジャーナルディレクトリの位置を明示的に指定する.
    ///
    /// デフォルトでは対象ファイルに隣接する`.<ファイル名>.jio`ディレクトリが使われる.
    pub fn journal_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.journal_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// オープン時に復旧処理を実行するかどうかを設定する.
    ///
    /// デフォルト値は`true`.
    pub fn recover_on_open(&mut self, enabled: bool) -> &mut Self {
        self.recover_on_open = enabled;
        self
    }

    /// ロガーを設定する.
    ///
    /// デフォルト値は`Logger::root(Discard, o!())`.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// 指定のパスのファイルを開く.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<JournaledFile> {
        let path = path.as_ref();
        let logger = self
            .logger
            .new(o!("path" => path.to_string_lossy().into_owned()));
        let metrics = FileMetrics::new(&self.metrics);

        let data = track!(self.options.open(path))?;
        let mut journal_builder = JournalStoreBuilder::new();
        journal_builder.logger(logger.clone());
        if let Some(ref dir) = self.journal_dir {
            journal_builder.journal_dir(dir);
        }
        let mut journal = track!(journal_builder.open_with_metrics(path, metrics.journal.clone()))?;

        if !self.recover_on_open {
            debug!(logger, "Recovery is skipped by configuration");
        } else if data.is_read_only() {
            debug!(logger, "Recovery is skipped for a read-only file");
        } else {
            track!(check::recover(
                &data,
                &mut journal,
                false,
                &logger,
                &metrics.check
            ))?;
        }

        info!(logger, "Journaled file is opened"; "read_only" => data.is_read_only());
        let shared = SharedFile {
            data,
            journal: Mutex::new(journal),
            flags: self.flags,
            error: AtomicBool::new(false),
            autosync: Mutex::new(None),
            logger,
            metrics,
        };
        Ok(JournaledFile {
            inner: Arc::new(shared),
            position: Mutex::new(0),
        })
    }
}
impl Default for JournaledFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
