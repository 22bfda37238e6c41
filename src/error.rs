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
        } else {
            match e.kind() {
                std::io::ErrorKind::InvalidInput => ErrorKind::InvalidInput.cause(e).into(),
                std::io::ErrorKind::NotFound => ErrorKind::NoSuchFile.cause(e).into(),
                std::io::ErrorKind::PermissionDenied => {
                    ErrorKind::PermissionDenied.cause(e).into()
                }
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout.cause(e).into(),
                _ => ErrorKind::Other.cause(e).into(),
            }
        }
    }
}
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        let kind = match *e.kind() {
            ErrorKind::InvalidInput => std::io::ErrorKind::InvalidInput,
            ErrorKind::PermissionDenied => std::io::ErrorKind::PermissionDenied,
            ErrorKind::NoSuchFile => std::io::ErrorKind::NotFound,
            ErrorKind::Timeout => std::io::ErrorKind::TimedOut,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ErrorKind::Other.cause(e.to_string()).into()
    }
}

/// 発生し得るエラーの種別.
///
/// 「存在しない」系のエラーは、対象エンティティ毎に別の種別になっている.
/// 利用者はこれを見て、例えば「グループなら自動作成するが、プールなら作成しない」
/// といった振る舞いの切り替えを行うことができる.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 指定された名前のプールが存在しない.
    NoSuchPool,

    /// 指定されたレプリカが存在しない.
    NoSuchReplica,

    /// 指定されたファイル(ないしディレクトリ)が存在しない.
    NoSuchFile,

    /// 指定されたユーザが存在しない.
    NoSuchUser,

    /// 指定されたグループが存在しない.
    NoSuchGroup,

    /// ファイルにレプリカが一つも存在しない.
    NoReplicasExist,

    /// レプリカは存在するが、読み込み可能なものが一つもない.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者が時間をおいてリトライする (ファイルシステムが復帰するのを待つ)
    NoReplicasAvailable,

    /// 書き込み先として選択可能なプールないしファイルシステムがない.
    ///
    /// # 典型的な対応策
    ///
    /// - 別のプールを指定してリトライする
    NoSpace,

    /// 権限が不足している.
    ///
    /// 非rootユーザによるプール管理操作や、読み込み専用トークンでの書き込み要求、等.
    PermissionDenied,

    /// 入力が不正.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して入力を正しくする
    InvalidInput,

    /// 要求された処理がまだ完了していない.
    ///
    /// エラーではなく、利用者は時間をおいて再度問い合わせることが期待されている.
    InProgress,

    /// リソースプールに空きがない (非ブロッキング取得時のみ).
    Busy,

    /// 作成しようとしたエントリが既に存在する.
    AlreadyExists,

    /// 待機時間の上限を超えた.
    Timeout,

    /// その他エラー.
    ///
    /// E.g., バックエンドに到達できない、トランザクションの失敗
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側で（指数バックオフ等を挟みつつ）何度かリトライ
    Other,
}
impl trackable::error::ErrorKind for ErrorKind {}
