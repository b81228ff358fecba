use std;
use trackable;
use trackable::error::ErrorKindExt;

/// crate固有のエラー型.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(trackable::error::TrackableError<ErrorKind>);
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if let Some(e) = e.get_ref().and_then(|e| e.downcast_ref::<Error>()).cloned() {
            e
        } else if e.kind() == std::io::ErrorKind::InvalidInput {
            ErrorKind::InvalidInput.cause(e).into()
        } else {
            ErrorKind::IoFault.cause(e).into()
        }
    }
}
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        if *e.kind() == ErrorKind::InvalidInput {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        } else {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        }
    }
}
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ErrorKind::InconsistentState.cause(e.to_string()).into()
    }
}

/// 発生し得るエラーの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 下位のストレージ操作に失敗した.
    ///
    /// E.g., ディスクフル、権限不足、デバイスエラー
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側で（指数バックオフ等を挟みつつ）何度かリトライ
    ///   - それでもダメなら、致命的な異常が発生していると判断
    IoFault,

    /// コミット処理の途中(ジャーナルへの追記、ないしデータの適用)で失敗した.
    ///
    /// ジャーナルへの追記前に失敗した場合には、トランザクションはオープン状態のまま残る.
    /// 追記後に失敗した場合には、そのエントリの扱いは次回の復旧処理によって決定される.
    ///
    /// # 典型的な対応策
    ///
    /// - `Transaction::commit`をリトライする
    /// - ファイルを開き直して復旧処理を走らせる
    CommitFailure,

    /// トランザクションの現在の状態では実行できない操作が要求された.
    ///
    /// E.g., 二重コミット、コミット済みトランザクションのロールバック
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正する
    InvalidState,

    /// 進行中の他の操作と競合している.
    ///
    /// E.g., オープン中のトランザクションが存在する状態でのジャーナルの移動
    ///
    /// # 典型的な対応策
    ///
    /// - 全てのトランザクションを終了させてからリトライする
    Busy,

    /// 既に起動済みのものを再度起動しようとした.
    ///
    /// E.g., 一つのファイルに対する二つ目の自動同期スレッドの起動
    AlreadyActive,

    /// ジャーナルのヘッダが壊れている.
    ///
    /// # 典型的な対応策
    ///
    /// - もし人手で復旧可能な場合には復旧する
    /// - それが無理であれば、ジャーナルディレクトリを削除する
    StorageCorrupted,

    /// 入力が不正.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して入力を正しくする
    InvalidInput,

    /// 内部状態が不整合に陥っている.
    ///
    /// プログラムにバグがあることを示している.
    ///
    /// # 典型的な対応策
    ///
    /// - バグ修正を行ってプログラムを更新する
    InconsistentState,
}
impl trackable::error::ErrorKind for ErrorKind {}
