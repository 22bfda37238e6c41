//! プールの管理と、読み書き先のレプリカの選択.
//!
//! # 構成
//!
//! ```text
//! PoolManager => PoolDriver (プール種別毎) => PoolHandler (プール毎)
//! ```
//!
//! - [PoolManager]:
//!   - プール一覧の管理(キャッシュ付き)と、読み書き先の選択を担当する
//!   - 標準実装は[StandardPoolManager]
//! - [PoolDriver]:
//!   - 特定の種別(e.g., `"filesystem"`)のプール群を扱うドライバ
//!   - プールの作成・更新・削除時のフックと、[PoolHandler]の生成を担当する
//! - [PoolHandler]:
//!   - 一つのプールに束縛された操作群
//!   - 実際の物理的な配置の決定や、アクセス用トークンの発行を行う
//!
//! [PoolManager]: trait.PoolManager.html
//! [StandardPoolManager]: struct.StandardPoolManager.html
//! [PoolDriver]: trait.PoolDriver.html
//! [PoolHandler]: trait.PoolHandler.html
use std::collections::BTreeMap;
use std::fmt;

use crate::catalog::{Ino, Replica};
use crate::context::RequestContext;
use crate::location::Location;
use crate::Result;

pub use self::filesystem::{
    DiskBackend, FilesystemPoolDriver, PutDone, PutReply, PutRequest, FILESYSTEM_POOL_TYPE,
};
pub use self::manager::{PoolStore, StandardPoolManager, StandardPoolManagerBuilder};
pub use self::memory::{MemoryDiskBackend, MemoryPoolStore};
pub use self::profiler::ProfilingPoolManager;

mod filesystem;
mod manager;
mod memory;
mod profiler;

/// プール.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pool {
    /// プール名 (一意).
    pub name: String,

    /// プールを扱うドライバの種別 (e.g., `"filesystem"`).
    pub kind: String,

    /// 所属するファイルシステム群.
    pub filesystems: Vec<Filesystem>,

    /// その他の属性 (e.g., `defsize`, `gc_start_thresh`, `s_type`).
    pub attributes: BTreeMap<String, String>,
}
impl Pool {
    /// 新しい`Pool`インスタンスを生成する.
    pub fn new(name: &str, kind: &str) -> Self {
        Pool {
            name: name.to_owned(),
            kind: kind.to_owned(),
            ..Pool::default()
        }
    }
}

/// ファイルシステムの状態.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsStatus {
    /// 読み書き可能.
    Enabled,

    /// 無効.
    Disabled,

    /// 読み込みのみ可能.
    ReadOnly,
}
impl Default for FsStatus {
    fn default() -> Self {
        FsStatus::Enabled
    }
}

/// プールに所属するファイルシステム.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filesystem {
    /// 所属するプール名.
    pub pool: String,

    /// ファイルシステムを持つディスクサーバ.
    pub server: String,

    /// ファイルシステムのマウントポイント.
    pub fs: String,

    /// 状態.
    pub status: FsStatus,

    /// 書き込み先の選択時の重み.
    pub weight: u32,

    /// 容量.
    pub capacity: u64,

    /// 空き容量.
    pub free: u64,
}
impl Filesystem {
    /// 新しい`Filesystem`インスタンスを生成する.
    pub fn new(pool: &str, server: &str, fs: &str, status: FsStatus) -> Self {
        Filesystem {
            pool: pool.to_owned(),
            server: server.to_owned(),
            fs: fs.to_owned(),
            status,
            weight: 1,
            ..Filesystem::default()
        }
    }

    /// `server:fs`形式の名前を返す.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.server, self.fs)
    }
}

/// プール一覧の取得時の絞り込み条件.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolAvailability {
    /// 全て.
    Any,

    /// 利用可能なファイルシステムを持たないもの.
    None,

    /// 読み込み可能なもの.
    ForRead,

    /// 書き込み可能なもの.
    ForWrite,

    /// 読み書き可能なもの.
    ForBoth,
}
impl PoolAvailability {
    /// 判定に書き込み可能性を用いるかどうか.
    pub fn for_write(self) -> bool {
        self == PoolAvailability::ForWrite || self == PoolAvailability::ForBoth
    }
}

/// 一つのプールに束縛された操作群.
pub trait PoolHandler {
    /// プールの種別を返す.
    fn pool_type(&self) -> &str;

    /// プール名を返す.
    fn pool_name(&self) -> &str;

    /// プールの総容量を返す.
    fn total_space(&self) -> Result<u64>;

    /// プールの空き容量を返す.
    fn free_space(&self) -> Result<u64>;

    /// プールが利用可能かどうかを判定する.
    ///
    /// `write`が`true`なら書き込み可能なファイルシステムが、
    /// `false`なら無効化されていないファイルシステムが、一つでもあれば利用可能となる.
    fn pool_is_available(&self, write: bool) -> Result<bool>;

    /// レプリカが読み込み可能かどうかを判定する.
    fn replica_is_available(&self, replica: &Replica) -> Result<bool>;

    /// レプリカを読み込むための`Location`を返す.
    fn where_to_read(&self, ctx: &RequestContext, replica: &Replica) -> Result<Location>;

    /// レプリカを物理的に削除する.
    ///
    /// カタログ上のレプリカの登録削除も合わせて行われる.
    /// 最後のレプリカが削除された場合にのみ、祖先ディレクトリのサイズが減らされる.
    fn remove_replica(&self, ctx: &RequestContext, replica: &Replica) -> Result<()>;

    /// `sfn`に対応する新しいレプリカの書き込み先を返す.
    fn where_to_write(&self, ctx: &RequestContext, sfn: &str) -> Result<Location>;

    /// `where_to_write`で開始した書き込みを取り消す.
    fn cancel_write(&self, ctx: &RequestContext, location: &Location) -> Result<()>;
}

/// 特定の種別のプール群を扱うドライバ.
pub trait PoolDriver {
    /// 扱うプールの種別を返す.
    fn pool_type(&self) -> &str;

    /// 指定のプール用のハンドラを生成する.
    fn create_pool_handler(&self, pool_name: &str) -> Result<Box<dyn PoolHandler>>;

    /// プールが作成される直前に呼び出される.
    fn to_be_created(&self, ctx: &RequestContext, pool: &Pool) -> Result<()>;

    /// プールが作成された直後に呼び出される.
    fn just_created(&self, ctx: &RequestContext, pool: &Pool) -> Result<()>;

    /// プールが更新された直後に呼び出される.
    fn update(&self, ctx: &RequestContext, pool: &Pool) -> Result<()>;

    /// プールが削除される直前に呼び出される.
    fn to_be_deleted(&self, ctx: &RequestContext, pool: &Pool) -> Result<()>;
}

/// プールの管理と読み書き先の選択を行うコンポーネント.
pub trait PoolManager {
    /// 条件に合致するプールの一覧を返す.
    fn get_pools(&self, availability: PoolAvailability) -> Result<Vec<Pool>>;

    /// 指定の名前のプールを返す.
    ///
    /// 存在しない場合には`ErrorKind::NoSuchPool`が返される.
    fn get_pool(&self, name: &str) -> Result<Pool>;

    /// プールを作成する (管理者のみ).
    fn new_pool(&self, ctx: &RequestContext, pool: &Pool) -> Result<()>;

    /// プールを更新する (管理者のみ).
    fn update_pool(&self, ctx: &RequestContext, pool: &Pool) -> Result<()>;

    /// プールを削除する (管理者のみ).
    fn delete_pool(&self, ctx: &RequestContext, pool: &Pool) -> Result<()>;

    /// パスで指定されたファイルの読み込み先を返す.
    fn where_to_read(&self, ctx: &RequestContext, path: &str) -> Result<Location>;

    /// inode番号で指定されたファイルの読み込み先を返す.
    fn where_to_read_inode(&self, ctx: &RequestContext, ino: Ino) -> Result<Location>;

    /// パスで指定されたファイルの書き込み先を返す.
    ///
    /// リクエストパラメータ`pool`による書き込み先プールの指定は全ての利用者に許される.
    /// `filesystem`と`replicate`の指定は管理者の場合にのみ有効となる.
    fn where_to_write(&self, ctx: &RequestContext, path: &str) -> Result<Location>;

    /// `where_to_write`で開始した書き込みを取り消す.
    ///
    /// レプリカが未登録の場合は、位置のクエリパラメータ(`sfn`, `dpmtoken`, `pool`)から対象を特定する.
    /// ディスクサーバでの中断とカタログエントリの削除はどちらも最善努力で行われる.
    fn cancel_write(&self, ctx: &RequestContext, location: &Location) -> Result<()>;
}

impl fmt::Debug for dyn PoolHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "PoolHandler {{ pool_type: {:?}, pool_name: {:?} }}",
            self.pool_type(),
            self.pool_name()
        )
    }
}
