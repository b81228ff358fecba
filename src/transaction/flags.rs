/// トランザクションの挙動を調整するためのフラグ群.
///
/// `JournaledFileBuilder::flags`で指定したファイル単位のデフォルト値と、
/// `JournaledFile::transaction`で指定したトランザクション単位の値の論理和が実際に使われる.
///
/// # Examples
///
/// ```
/// use cannyjio::TransactionFlags;
///
/// let flags = TransactionFlags {
///     linger: true,
///     ..TransactionFlags::default()
/// };
/// assert!(flags.merge(TransactionFlags::default()).linger);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionFlags {
    /// コミット後もジャーナルエントリを`committed`状態のまま保持する.
    ///
    /// 保持されたエントリは`JournaledFile::sync`(ないし自動同期)で回収される.
    /// また`Transaction::views`はこのフラグが有効な場合にのみ、コミット後に参照可能となる.
    pub linger: bool,

    /// コミット時に対象ファイルの書き込み範囲をロックしない.
    ///
    /// 他のプロセスと同じファイルを共有しないことが分かっている場合に指定する.
    pub no_lock: bool,

    /// コミット時に書き込み範囲の元の内容を保存しない.
    ///
    /// 指定した場合には`Transaction::undo`が利用できなくなる.
    pub no_rollback: bool,
}
impl TransactionFlags {
    /// 全てのフラグが無効な`TransactionFlags`を返す.
    pub fn new() -> Self {
        Self::default()
    }

    /// `self`と`other`のいずれかで有効なフラグを有効にしたものを返す.
    pub fn merge(self, other: TransactionFlags) -> Self {
        TransactionFlags {
            linger: self.linger || other.linger,
            no_lock: self.no_lock || other.no_lock,
            no_rollback: self.no_rollback || other.no_rollback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_works() {
        let a = TransactionFlags {
            linger: true,
            ..TransactionFlags::new()
        };
        let b = TransactionFlags {
            no_lock: true,
            ..TransactionFlags::new()
        };
        assert_eq!(
            a.merge(b),
            TransactionFlags {
                linger: true,
                no_lock: true,
                no_rollback: false,
            }
        );
        assert_eq!(TransactionFlags::new().merge(TransactionFlags::new()), TransactionFlags::new());
    }
}
