//! プロセス全体で共有されるコンテキストと、要求毎のコンテキスト.
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::idmap::IdMapCache;
use crate::resource::{PoolContainer, PoolContainerBuilder, PoolElementFactory};
use crate::security::{self, IdentityBackend, SecurityContext, SecurityCredentials};
use crate::{ErrorKind, Result};

/// プロセス全体で共有されるコンテキスト.
///
/// 起動時に一度だけ構築され、各コンポーネントの生成時に参照で渡される.
///
/// 名前付きのリソースプールも保持しており、同じ`Context`(ないしその複製)から
/// 生成されたコンポーネント群は、同名のプールを共有する.
#[derive(Debug, Clone)]
pub struct Context {
    config: Config,
    logger: Logger,
    metrics: MetricBuilder,
    id_map_cache: Arc<IdMapCache>,
    resource_pools: Arc<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}
impl Context {
    /// 新しい`Context`インスタンスを生成する.
    pub fn new(config: Config) -> Self {
        let id_map_cache = Arc::new(IdMapCache::new(config.id_map_cache_ttl()));
        Context {
            config,
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
            id_map_cache,
            resource_pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// logger を設定する.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// 設定を返す.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// logger を返す.
    pub fn root_logger(&self) -> &Logger {
        &self.logger
    }

    /// メトリクス用の共通設定を返す.
    pub fn metric_builder(&self) -> &MetricBuilder {
        &self.metrics
    }

    /// 共有のIDマッピングキャッシュを返す.
    pub fn id_map_cache(&self) -> &Arc<IdMapCache> {
        &self.id_map_cache
    }

    /// `name`という名前のリソースプールを返す.
    ///
    /// 未登録の場合には、`factory`を使って容量`pool_size`のプールが生成・登録される.
    /// 登録済みの場合には`factory`は使われずに破棄される.
    /// 同名のプールが異なるファクトリ型で登録済みの場合には`ErrorKind::InvalidInput`が返される.
    pub fn resource_pool<F>(&self, name: &str, factory: F) -> Result<Arc<PoolContainer<F>>>
    where
        F: PoolElementFactory + Send + Sync + 'static,
        F::Element: Send + 'static,
    {
        let mut pools = track_lock!(self.resource_pools.lock())?;
        if let Some(pool) = pools.get(name) {
            let pool = track_assert_some!(
                Arc::clone(pool).downcast::<PoolContainer<F>>().ok(),
                ErrorKind::InvalidInput,
                "Resource pool {:?} holds another type of elements",
                name
            );
            return Ok(pool);
        }
        let pool = Arc::new(
            PoolContainerBuilder::new(name)
                .capacity(self.config.pool_size())
                .metrics(self.metrics.clone())
                .logger(self.logger.clone())
                .finish(factory),
        );
        pools.insert(name.to_owned(), pool.clone() as Arc<dyn Any + Send + Sync>);
        debug!(self.logger, "Created a resource pool";
               "name" => name, "capacity" => self.config.pool_size());
        Ok(pool)
    }

    /// 資格情報から`SecurityContext`を生成する.
    pub fn create_security_context<B: IdentityBackend + ?Sized>(
        &self,
        backend: &B,
        credentials: SecurityCredentials,
    ) -> Result<SecurityContext> {
        track!(security::create_security_context(
            backend,
            &self.id_map_cache,
            credentials
        ))
    }
}

/// 要求毎のコンテキスト.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// 要求元の利用者.
    pub security: SecurityContext,

    /// 要求毎のパラメータ.
    pub params: RequestParams,
}
impl RequestContext {
    /// 新しい`RequestContext`インスタンスを生成する.
    pub fn new(security: SecurityContext) -> Self {
        RequestContext {
            security,
            params: RequestParams::default(),
        }
    }
}

/// 要求毎のパラメータ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    /// 既存のファイルを上書きするかどうか.
    pub overwrite: bool,

    /// 書き込み先のプール (一般利用者も指定可能).
    pub pool: Option<String>,

    /// 書き込み先のファイルシステム (`server:fs`形式、管理者のみ有効).
    pub filesystem: Option<String>,

    /// 複製の作成要求かどうか (管理者のみ有効).
    pub replicate: bool,

    /// スペーストークン.
    pub space_token: Option<String>,

    /// スペーストークンの説明 (`space_token`が未指定の場合に使われる).
    pub user_space_token_description: Option<String>,

    /// 書き込み予定のサイズ.
    pub requested_size: u64,

    /// 要求する生存期間(秒).
    pub lifetime: u64,

    /// ファイル種別 (`'V'`, `'D'`, `'P'`).
    pub f_type: Option<char>,
}
impl RequestParams {
    /// キー・値の組からパラメータを構築する.
    ///
    /// 未知のキーは無視される.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let mut params = RequestParams::default();
        for (key, value) in map {
            match key.as_str() {
                "overwrite" => params.overwrite = track!(parse_flag(key, value))?,
                "pool" => params.pool = Some(value.clone()),
                "filesystem" => params.filesystem = Some(value.clone()),
                "replicate" => params.replicate = track!(parse_flag(key, value))?,
                "SpaceToken" => params.space_token = Some(value.clone()),
                "UserSpaceTokenDescription" => {
                    params.user_space_token_description = Some(value.clone())
                }
                "requested_size" => params.requested_size = track!(parse_number(key, value))?,
                "lifetime" => params.lifetime = track!(parse_number(key, value))?,
                "f_type" => {
                    let c = track_assert_some!(
                        value.chars().next(),
                        ErrorKind::InvalidInput,
                        "Empty f_type"
                    );
                    params.f_type = Some(c);
                }
                _ => {}
            }
        }
        Ok(params)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "" | "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        _ => track_panic!(ErrorKind::InvalidInput, "Invalid value for {}: {:?}", key, value),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    let n = track_assert_some!(
        value.parse().ok(),
        ErrorKind::InvalidInput,
        "Invalid value for {}: {:?}",
        key,
        value
    );
    Ok(n)
}
