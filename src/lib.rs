//! Canny Journaled I/O.
//!
//! `cannyjio`は、通常のファイルに対する複数の書き込みを一つのトランザクションとしてまとめ、
//! プロセスやマシンのクラッシュを跨いでも「全て反映される」か「全く反映されない」かのどちらかを保証するI/O層.
//!
//! # 特徴
//!
//! - 対象ファイル([data])とは別に、その隣にジャーナル([journal])用のディレクトリを持つ
//!   - `<親ディレクトリ>/.<ファイル名>.jio/`
//! - 書き込みは[transaction]内にバッファリングされ、コミット時に以下の順序で永続化される:
//!   1. ジャーナルへのエントリ追記(同期完了まで待機)
//!   2. 対象ファイルへの書き込み(発行順)
//!   3. 対象ファイルの同期
//!   4. ジャーナルエントリを適用済みとしてマークし、回収する
//! - クラッシュ後は[check]によってジャーナルが走査され、未完了のエントリは再適用ないし破棄される
//! - [autosync]スレッドにより、定期的な同期を利用者の介在なしに行える
//! - データベースのような構造化クエリや、複数ファイルに跨るトランザクションは扱わない
//!
//! # モジュールの依存関係
//!
//! ```text
//! file => {transaction, autosync, check} => journal => data
//! ```
//!
//! - [file]モジュール:
//!   - 主に[JournaledFile]構造体を提供
//!   - `cannyjio`の利用者が直接触るのはこの構造体
//! - [transaction]モジュール:
//!   - 書き込みのバッファリングとコミット/ロールバックを担当する[Transaction]を提供
//! - [journal]モジュール:
//!   - ジャーナルの永続化フォーマットと、その追記・マーク・走査・回収・移動を担当
//! - [check]モジュール:
//!   - クラッシュ後の復旧処理と、その結果である[CheckReport]を提供
//!
//! # 注意
//!
//! 排他制御に`flock(2)`および`fcntl(2)`を利用しているため、UNIX環境専用.
//!
//! [data]: ./data/index.html
//! [journal]: ./journal/index.html
//! [transaction]: ./transaction/index.html
//! [Transaction]: ./transaction/struct.Transaction.html
//! [check]: ./check/index.html
//! [CheckReport]: ./check/struct.CheckReport.html
//! [autosync]: ./autosync/index.html
//! [file]: ./file/index.html
//! [JournaledFile]: ./file/struct.JournaledFile.html
#![warn(missing_docs)]
extern crate adler32;
extern crate byteorder;
extern crate libc;
extern crate prometrics;
#[cfg(test)]
extern crate tempdir;
#[macro_use]
extern crate trackable;
extern crate uuid;
#[macro_use]
extern crate slog;

pub use crate::check::{check, CheckFlags, CheckReport, Checker};
pub use crate::error::{Error, ErrorKind};
pub use crate::file::{JournaledFile, JournaledFileBuilder};
pub use crate::transaction::{Release, Transaction, TransactionFlags, TransactionState, View};

macro_rules! track_io {
    ($expr:expr) => {
        $expr.map_err(|e: ::std::io::Error| track!(crate::Error::from(e)))
    };
}

pub mod autosync;
pub mod check;
pub mod data;
pub mod file;
pub mod journal;
pub mod metrics;
pub mod transaction;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
