//! 設定.
//!
//! 設定ファイルの読み込み自体は外側のプラグイン設定層の責務であり、
//! このモジュールは「読み込み済みのキー・値の組」から型付きの[Config]を構築するだけ.
//!
//! [Config]: struct.Config.html
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::{ErrorKind, Result};

/// トークンに埋め込む利用者識別子の種類.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenId {
    /// クライアントの証明書DN.
    Dn,

    /// クライアントのIPアドレス.
    Ip,
}

/// 型付きの設定.
///
/// 各値の意味は[ConfigBuilder]の同名メソッドを参照のこと.
///
/// [ConfigBuilder]: struct.ConfigBuilder.html
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) token_password: String,
    pub(crate) token_id: TokenId,
    pub(crate) token_life: Duration,
    pub(crate) admin_username: String,
    pub(crate) retry_limit: u32,
    pub(crate) dir_space_report_depth: usize,
    pub(crate) pool_cache_ttl: Duration,
    pub(crate) filesystem_cache_ttl: Duration,
    pub(crate) id_map_cache_ttl: Duration,
    pub(crate) checksum_max_total: usize,
    pub(crate) checksum_max_per_node: usize,
    pub(crate) checksum_queue_timeout: Duration,
    pub(crate) pool_size: usize,
}
impl Config {
    /// キー・値の組から設定を構築する.
    ///
    /// キーの大文字・小文字は区別しない.
    /// 未知のキーや、数値として解釈できない値が含まれている場合には`ErrorKind::InvalidInput`が返される.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let mut builder = ConfigBuilder::new();
        for (key, value) in map {
            track!(builder.set(key, value))?;
        }
        Ok(builder.finish())
    }

    /// トークン署名用の秘密鍵.
    pub fn token_password(&self) -> &str {
        &self.token_password
    }

    /// トークンに埋め込む利用者識別子の種類.
    pub fn token_id(&self) -> TokenId {
        self.token_id
    }

    /// 発行するトークンの有効期間.
    pub fn token_life(&self) -> Duration {
        self.token_life
    }

    /// 管理者とみなされるユーザ名.
    pub fn admin_username(&self) -> &str {
        &self.admin_username
    }

    /// バックエンド呼び出しの最大リトライ回数.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// ディレクトリサイズを更新する祖先の深さ.
    pub fn dir_space_report_depth(&self) -> usize {
        self.dir_space_report_depth
    }

    /// プール一覧キャッシュの有効期間.
    pub fn pool_cache_ttl(&self) -> Duration {
        self.pool_cache_ttl
    }

    /// ファイルシステム一覧キャッシュの有効期間.
    pub fn filesystem_cache_ttl(&self) -> Duration {
        self.filesystem_cache_ttl
    }

    /// IDマッピングキャッシュの有効期間.
    pub fn id_map_cache_ttl(&self) -> Duration {
        self.id_map_cache_ttl
    }

    /// 同時に実行可能なチェックサム計算の総数.
    pub fn checksum_max_total(&self) -> usize {
        self.checksum_max_total
    }

    /// ディスクサーバ毎に同時に実行可能なチェックサム計算の数.
    pub fn checksum_max_per_node(&self) -> usize {
        self.checksum_max_per_node
    }

    /// チェックサム計算キューの要素が参照されずに保持される最大時間.
    pub fn checksum_queue_timeout(&self) -> Duration {
        self.checksum_queue_timeout
    }

    /// リソースプールの容量.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}
impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().finish()
    }
}

/// `Config`のビルダ.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}
impl ConfigBuilder {
    /// デフォルト設定で`ConfigBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config {
                token_password: "default".to_owned(),
                token_id: TokenId::Dn,
                token_life: Duration::from_secs(600),
                admin_username: "root".to_owned(),
                retry_limit: 3,
                dir_space_report_depth: 6,
                pool_cache_ttl: Duration::from_secs(60),
                filesystem_cache_ttl: Duration::from_secs(30),
                id_map_cache_ttl: Duration::from_secs(300),
                checksum_max_total: 10,
                checksum_max_per_node: 2,
                checksum_queue_timeout: Duration::from_secs(30),
                pool_size: 10,
            },
        }
    }

    /// キー名で値を設定する.
    ///
    /// キーの大文字・小文字は区別しない.
    pub fn set(&mut self, key: &str, value: &str) -> Result<&mut Self> {
        let c = &mut self.config;
        match key.to_ascii_lowercase().as_str() {
            "tokenpassword" => c.token_password = value.to_owned(),
            "tokenid" => {
                c.token_id = match value.to_ascii_lowercase().as_str() {
                    "ip" => TokenId::Ip,
                    "dn" | "id" => TokenId::Dn,
                    _ => track_panic!(ErrorKind::InvalidInput, "Unknown TokenId: {:?}", value),
                }
            }
            "tokenlife" => c.token_life = Duration::from_secs(track!(parse(key, value))?),
            "adminusername" => c.admin_username = value.to_owned(),
            "retrylimit" => c.retry_limit = track!(parse(key, value))?,
            "dirspacereportdepth" => c.dir_space_report_depth = track!(parse(key, value))?,
            "poolcachettl" => c.pool_cache_ttl = Duration::from_secs(track!(parse(key, value))?),
            "filesystemcachettl" => {
                c.filesystem_cache_ttl = Duration::from_secs(track!(parse(key, value))?)
            }
            "idmapcachettl" => {
                c.id_map_cache_ttl = Duration::from_secs(track!(parse(key, value))?)
            }
            "checksummaxtotal" => c.checksum_max_total = track!(parse(key, value))?,
            "checksummaxpernode" => c.checksum_max_per_node = track!(parse(key, value))?,
            "checksumqueuetimeout" => {
                c.checksum_queue_timeout = Duration::from_secs(track!(parse(key, value))?)
            }
            "poolsize" => c.pool_size = track!(parse(key, value))?,
            _ => track_panic!(ErrorKind::InvalidInput, "Unknown configuration key: {}", key),
        }
        Ok(self)
    }

    /// トークン署名用の秘密鍵を設定する.
    ///
    /// デフォルト値は`"default"`.
    pub fn token_password(&mut self, password: &str) -> &mut Self {
        self.config.token_password = password.to_owned();
        self
    }

    /// トークンに埋め込む利用者識別子の種類を設定する.
    ///
    /// デフォルト値は`TokenId::Dn`.
    pub fn token_id(&mut self, id: TokenId) -> &mut Self {
        self.config.token_id = id;
        self
    }

    /// 発行するトークンの有効期間を設定する.
    ///
    /// デフォルト値は`Duration::from_secs(600)`.
    pub fn token_life(&mut self, life: Duration) -> &mut Self {
        self.config.token_life = life;
        self
    }

    /// 管理者とみなすユーザ名を設定する.
    ///
    /// このユーザのみが、書き込み時にプールやファイルシステムを明示的に指定できる.
    ///
    /// デフォルト値は`"root"`.
    pub fn admin_username(&mut self, name: &str) -> &mut Self {
        self.config.admin_username = name.to_owned();
        self
    }

    /// バックエンド呼び出しの最大リトライ回数を設定する.
    ///
    /// デフォルト値は`3`.
    pub fn retry_limit(&mut self, n: u32) -> &mut Self {
        self.config.retry_limit = n;
        self
    }

    /// ファイルサイズを反映するディレクトリの深さ(ルートからの距離)の上限を設定する.
    ///
    /// ルートとその直下は、常に更新が集中するため対象外となる.
    ///
    /// デフォルト値は`6`.
    pub fn dir_space_report_depth(&mut self, depth: usize) -> &mut Self {
        self.config.dir_space_report_depth = depth;
        self
    }

    /// プール一覧キャッシュの有効期間を設定する.
    ///
    /// デフォルト値は`Duration::from_secs(60)`.
    pub fn pool_cache_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.config.pool_cache_ttl = ttl;
        self
    }

    /// ファイルシステム一覧キャッシュの有効期間を設定する.
    ///
    /// デフォルト値は`Duration::from_secs(30)`.
    pub fn filesystem_cache_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.config.filesystem_cache_ttl = ttl;
        self
    }

    /// IDマッピングキャッシュの有効期間を設定する.
    ///
    /// デフォルト値は`Duration::from_secs(300)`.
    pub fn id_map_cache_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.config.id_map_cache_ttl = ttl;
        self
    }

    /// チェックサム計算の同時実行数の上限(全体およびノード毎)を設定する.
    ///
    /// デフォルト値は`(10, 2)`.
    pub fn checksum_limits(&mut self, max_total: usize, max_per_node: usize) -> &mut Self {
        self.config.checksum_max_total = max_total;
        self.config.checksum_max_per_node = max_per_node;
        self
    }

    /// チェックサム計算キューのタイムアウトを設定する.
    ///
    /// デフォルト値は`Duration::from_secs(30)`.
    pub fn checksum_queue_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.checksum_queue_timeout = timeout;
        self
    }

    /// リソースプールの容量を設定する.
    ///
    /// デフォルト値は`10`.
    pub fn pool_size(&mut self, n: usize) -> &mut Self {
        self.config.pool_size = n;
        self
    }

    /// 設定を確定する.
    pub fn finish(&self) -> Config {
        self.config.clone()
    }
}
impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    let v = track_assert_some!(
        value.trim().parse().ok(),
        ErrorKind::InvalidInput,
        "Invalid value for {}: {:?}",
        key,
        value
    );
    Ok(v)
}
