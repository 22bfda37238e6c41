//! ファイルとレプリカのメタデータを保持するカタログ.
//!
//! 永続化層(e.g., RDBMS、リモートのヘッドノード)そのものはこのcrateの対象外であり、
//! [Catalog]トレイトを実装する外部コンポーネントとして注入される.
//!
//! [Catalog]: trait.Catalog.html
use std::collections::BTreeMap;
use std::fmt;

use crate::{ErrorKind, Result};

pub use self::memory::MemoryCatalog;

mod memory;

/// inode番号.
pub type Ino = u64;

/// ファイル種別を取り出すためのマスク.
pub const S_IFMT: u32 = 0o170_000;

/// ディレクトリ.
pub const S_IFDIR: u32 = 0o040_000;

/// 通常ファイル.
pub const S_IFREG: u32 = 0o100_000;

/// ファイルないしディレクトリのメタデータ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedStat {
    /// inode番号.
    pub ino: Ino,

    /// 親ディレクトリのinode番号 (ルートの場合は`0`).
    pub parent: Ino,

    /// 名前.
    pub name: String,

    /// モード.
    pub mode: u32,

    /// サイズ.
    ///
    /// ディレクトリの場合には、配下のファイルのサイズの合計(の近似値).
    pub size: u64,

    /// 所有者のユーザID.
    pub uid: u32,

    /// 所有グループのID.
    pub gid: u32,

    /// リンク数.
    pub nlink: u32,

    /// ACL.
    pub acl: String,

    /// 拡張属性 (e.g., `checksum.adler32`).
    pub xattrs: BTreeMap<String, String>,
}
impl ExtendedStat {
    /// ディレクトリかどうかを判定する.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// 通常ファイルかどうかを判定する.
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// レプリカの状態.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaStatus {
    /// 書き込み中.
    BeingPopulated,

    /// 利用可能.
    Available,

    /// 削除予定.
    ToBeDeleted,
}
impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let c = match *self {
            ReplicaStatus::BeingPopulated => 'P',
            ReplicaStatus::Available => '-',
            ReplicaStatus::ToBeDeleted => 'D',
        };
        write!(f, "{}", c)
    }
}

/// レプリカの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaType {
    /// 期限付き.
    Volatile,

    /// 永続.
    Permanent,
}

/// ファイルの物理的な複製.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    /// レプリカID (カタログへの登録時に割り当てられる).
    pub replica_id: u64,

    /// 所属するファイルのinode番号.
    pub file_id: Ino,

    /// 格納先のディスクサーバ.
    pub server: String,

    /// 物理的な格納位置 (通常は`server:/path`形式).
    pub rfn: String,

    /// 状態.
    pub status: ReplicaStatus,

    /// 種別.
    pub kind: ReplicaType,

    /// 所属するプール名.
    pub pool: String,

    /// 格納先のファイルシステム.
    pub filesystem: String,

    /// スペーストークン.
    pub setname: String,

    /// 最終アクセス時刻 (UNIXエポックからの秒数).
    pub atime: u64,

    /// 固定期限 (UNIXエポックからの秒数).
    pub ptime: u64,

    /// 生存期限 (UNIXエポックからの秒数).
    pub ltime: u64,

    /// アクセス回数.
    pub nbaccesses: u64,

    /// 拡張属性.
    pub xattrs: BTreeMap<String, String>,
}
impl Replica {
    /// 書き込み中状態の新しいレプリカを生成する.
    pub fn new(file_id: Ino, server: &str, rfn: &str) -> Self {
        Replica {
            replica_id: 0,
            file_id,
            server: server.to_owned(),
            rfn: rfn.to_owned(),
            status: ReplicaStatus::BeingPopulated,
            kind: ReplicaType::Permanent,
            pool: String::new(),
            filesystem: String::new(),
            setname: String::new(),
            atime: 0,
            ptime: 0,
            ltime: 0,
            nbaccesses: 0,
            xattrs: BTreeMap::new(),
        }
    }
}

/// メタデータストア.
///
/// 全ての操作は同期的に実行され、バックエンドに到達できない場合等には`ErrorKind::Other`を返す.
///
/// `begin`と`commit`は入れ子にすることができ、最も外側の`commit`のみが実際に変更を確定する.
pub trait Catalog {
    /// パスを指定してメタデータを取得する.
    ///
    /// 存在しない場合には`ErrorKind::NoSuchFile`を返す.
    fn stat_by_path(&self, path: &str) -> Result<ExtendedStat>;

    /// inode番号を指定してメタデータを取得する.
    fn stat_by_inode(&self, ino: Ino) -> Result<ExtendedStat>;

    /// 親ディレクトリと名前を指定してメタデータを取得する.
    fn stat_by_parent_and_name(&self, parent: Ino, name: &str) -> Result<ExtendedStat>;

    /// エントリを作成する.
    ///
    /// 既に存在する場合には`ErrorKind::AlreadyExists`を、親ディレクトリが存在しない場合には`ErrorKind::NoSuchFile`を返す.
    fn create_entry(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<ExtendedStat>;

    /// エントリを削除する.
    ///
    /// エントリに紐付くレプリカも合わせて削除される.
    fn unlink(&self, ino: Ino) -> Result<()>;

    /// サイズを設定する.
    fn set_size(&self, ino: Ino, size: u64) -> Result<()>;

    /// モードとACLを設定する.
    fn set_mode(&self, ino: Ino, mode: u32, acl: &str) -> Result<()>;

    /// 拡張属性を設定する.
    fn set_xattr(&self, ino: Ino, key: &str, value: &str) -> Result<()>;

    /// レプリカを登録する.
    ///
    /// 割り当てられたレプリカIDを含むレプリカが返される.
    fn add_replica(&self, replica: &Replica) -> Result<Replica>;

    /// レプリカの登録を削除する.
    ///
    /// 存在しない場合には`ErrorKind::NoSuchReplica`を返す.
    fn delete_replica(&self, replica: &Replica) -> Result<()>;

    /// レプリカの情報を更新する.
    fn update_replica(&self, replica: &Replica) -> Result<()>;

    /// ファイルのレプリカ一覧を取得する.
    fn get_replicas(&self, ino: Ino) -> Result<Vec<Replica>>;

    /// 物理的な格納位置を指定してレプリカを取得する.
    ///
    /// 存在しない場合には`ErrorKind::NoSuchReplica`を返す.
    fn get_replica_by_rfn(&self, rfn: &str) -> Result<Replica>;

    /// トランザクションを開始する.
    fn begin(&self) -> Result<()>;

    /// トランザクションを確定する.
    fn commit(&self) -> Result<()>;

    /// トランザクションを破棄する.
    fn rollback(&self) -> Result<()>;
}

/// スコープ付きのトランザクション.
///
/// `commit`されないままドロップされた場合には、自動でロールバックされる.
pub struct Transaction<'a, C: Catalog + ?Sized + 'a> {
    catalog: &'a C,
    finished: bool,
}
impl<'a, C: Catalog + ?Sized + 'a> Transaction<'a, C> {
    /// トランザクションを開始する.
    pub fn begin(catalog: &'a C) -> Result<Self> {
        track!(catalog.begin())?;
        Ok(Transaction {
            catalog,
            finished: false,
        })
    }

    /// トランザクションを確定する.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        track!(self.catalog.commit())
    }
}
impl<'a, C: Catalog + ?Sized + 'a> Drop for Transaction<'a, C> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.catalog.rollback();
        }
    }
}
impl<'a, C: Catalog + ?Sized + 'a> fmt::Debug for Transaction<'a, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Transaction {{ finished: {} }}", self.finished)
    }
}

/// ファイルのサイズ変化を祖先ディレクトリに反映する.
///
/// `stat`はサイズが変化したファイルのメタデータ.
/// 反映対象は、ルートからの距離が`2..=depth`の範囲にある祖先のみで、
/// ルートとその直下のディレクトリは(更新が集中するため)対象外となる.
/// 更新後のサイズが負になる場合には`0`に丸められる.
///
/// 呼び出し元がトランザクションを管理すること.
pub fn propagate_size<C: Catalog + ?Sized>(
    catalog: &C,
    stat: &ExtendedStat,
    delta: i64,
    depth: usize,
) -> Result<()> {
    // hierarchy[0]が直近の親、末尾がルート
    let mut hierarchy = Vec::new();
    let mut current = stat.clone();
    while current.parent != 0 {
        current = track!(catalog.stat_by_inode(current.parent))?;
        hierarchy.push((current.ino, current.size));
        track_assert!(
            hierarchy.len() < 128,
            ErrorKind::Other,
            "Too many parent directories: ino={}",
            stat.ino
        );
    }

    let len = hierarchy.len();
    let lowest = len.saturating_sub(depth + 1);
    if len < 3 || lowest > len - 3 {
        return Ok(());
    }
    for &(ino, size) in hierarchy[lowest..=len - 3].iter() {
        let size = if delta < 0 {
            size.saturating_sub(delta.unsigned_abs())
        } else {
            size.saturating_add(delta as u64)
        };
        track!(catalog.set_size(ino, size))?;
    }
    Ok(())
}
