//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

/// 優先度付きタスクキューのメトリクス.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    pub(crate) inserted_items: Counter,
    pub(crate) removed_items: Counter,
    pub(crate) started_items: Counter,
    pub(crate) expired_items: Counter,
    pub(crate) waiting_items: Gauge,
    pub(crate) total_items: Gauge,
}
impl QueueMetrics {
    /// キューに追加された要素の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_queue_inserted_items_total { queue="..." } <COUNTER>
    /// ```
    pub fn inserted_items(&self) -> u64 {
        self.inserted_items.value() as u64
    }

    /// キューから取り除かれた要素の数.
    ///
    /// 完了・明示的な削除・タイムアウトの全てを含む.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_queue_removed_items_total { queue="..." } <COUNTER>
    /// ```
    pub fn removed_items(&self) -> u64 {
        self.removed_items.value() as u64
    }

    /// `get_next_to_run`によって実行状態に遷移した要素の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_queue_started_items_total { queue="..." } <COUNTER>
    /// ```
    pub fn started_items(&self) -> u64 {
        self.started_items.value() as u64
    }

    /// 参照されないまま期限切れとなり削除された要素の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_queue_expired_items_total { queue="..." } <COUNTER>
    /// ```
    pub fn expired_items(&self) -> u64 {
        self.expired_items.value() as u64
    }

    /// 実行待ちの要素数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_queue_waiting_items { queue="..." } <GAUGE>
    /// ```
    pub fn waiting_items(&self) -> usize {
        self.waiting_items.value() as usize
    }

    /// キューに格納されている要素の総数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_queue_total_items { queue="..." } <GAUGE>
    /// ```
    pub fn total_items(&self) -> usize {
        self.total_items.value() as usize
    }

    pub(crate) fn new(builder: &MetricBuilder, queue: &str) -> Self {
        let mut builder = builder.clone();
        builder
            .namespace("gridpool")
            .subsystem("queue")
            .label("queue", queue);
        QueueMetrics {
            inserted_items: builder
                .counter("inserted_items_total")
                .help("Number of items inserted into the queue")
                .finish()
                .expect("Never fails"),
            removed_items: builder
                .counter("removed_items_total")
                .help("Number of items removed from the queue")
                .finish()
                .expect("Never fails"),
            started_items: builder
                .counter("started_items_total")
                .help("Number of items promoted to the running state")
                .finish()
                .expect("Never fails"),
            expired_items: builder
                .counter("expired_items_total")
                .help("Number of items purged because nobody touched them")
                .finish()
                .expect("Never fails"),
            waiting_items: builder
                .gauge("waiting_items")
                .help("Number of waiting items")
                .finish()
                .expect("Never fails"),
            total_items: builder
                .gauge("total_items")
                .help("Number of items in the queue")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// プールマネージャのメトリクス.
#[derive(Debug, Clone)]
pub struct PoolManagerMetrics {
    pub(crate) cache_hits: Counter,
    pub(crate) cache_refreshes: Counter,
    pub(crate) read_locations: Counter,
    pub(crate) write_locations: Counter,
    pub(crate) cancelled_writes: Counter,
}
impl PoolManagerMetrics {
    /// プール一覧の取得がキャッシュで済んだ回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_pool_manager_cache_hits_total <COUNTER>
    /// ```
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.value() as u64
    }

    /// プール一覧をバックエンドから再取得した回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_pool_manager_cache_refreshes_total <COUNTER>
    /// ```
    pub fn cache_refreshes(&self) -> u64 {
        self.cache_refreshes.value() as u64
    }

    /// 読み込み先として返した`Location`の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_pool_manager_read_locations_total <COUNTER>
    /// ```
    pub fn read_locations(&self) -> u64 {
        self.read_locations.value() as u64
    }

    /// 書き込み先として返した`Location`の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_pool_manager_write_locations_total <COUNTER>
    /// ```
    pub fn write_locations(&self) -> u64 {
        self.write_locations.value() as u64
    }

    /// 取り消された書き込みの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_pool_manager_cancelled_writes_total <COUNTER>
    /// ```
    pub fn cancelled_writes(&self) -> u64 {
        self.cancelled_writes.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("gridpool").subsystem("pool_manager");
        PoolManagerMetrics {
            cache_hits: builder
                .counter("cache_hits_total")
                .help("Number of pool listings served from the cache")
                .finish()
                .expect("Never fails"),
            cache_refreshes: builder
                .counter("cache_refreshes_total")
                .help("Number of pool listings fetched from the backend")
                .finish()
                .expect("Never fails"),
            read_locations: builder
                .counter("read_locations_total")
                .help("Number of read locations handed out")
                .finish()
                .expect("Never fails"),
            write_locations: builder
                .counter("write_locations_total")
                .help("Number of write locations handed out")
                .finish()
                .expect("Never fails"),
            cancelled_writes: builder
                .counter("cancelled_writes_total")
                .help("Number of cancelled writes")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// リソースプールのメトリクス.
#[derive(Debug, Clone)]
pub struct ResourcePoolMetrics {
    pub(crate) created: Counter,
    pub(crate) destroyed: Counter,
    pub(crate) acquired: Counter,
    pub(crate) released: Counter,
    pub(crate) in_use: Gauge,
}
impl ResourcePoolMetrics {
    /// 生成された要素の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_resource_pool_created_total { pool="..." } <COUNTER>
    /// ```
    pub fn created(&self) -> u64 {
        self.created.value() as u64
    }

    /// 破棄された要素の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_resource_pool_destroyed_total { pool="..." } <COUNTER>
    /// ```
    pub fn destroyed(&self) -> u64 {
        self.destroyed.value() as u64
    }

    /// 貸し出された回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_resource_pool_acquired_total { pool="..." } <COUNTER>
    /// ```
    pub fn acquired(&self) -> u64 {
        self.acquired.value() as u64
    }

    /// 返却された回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_resource_pool_released_total { pool="..." } <COUNTER>
    /// ```
    pub fn released(&self) -> u64 {
        self.released.value() as u64
    }

    /// 現在貸し出し中の要素数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_resource_pool_in_use { pool="..." } <GAUGE>
    /// ```
    pub fn in_use(&self) -> usize {
        self.in_use.value() as usize
    }

    pub(crate) fn new(builder: &MetricBuilder, pool: &str) -> Self {
        let mut builder = builder.clone();
        builder
            .namespace("gridpool")
            .subsystem("resource_pool")
            .label("pool", pool);
        ResourcePoolMetrics {
            created: builder
                .counter("created_total")
                .help("Number of created elements")
                .finish()
                .expect("Never fails"),
            destroyed: builder
                .counter("destroyed_total")
                .help("Number of destroyed elements")
                .finish()
                .expect("Never fails"),
            acquired: builder
                .counter("acquired_total")
                .help("Number of acquisitions")
                .finish()
                .expect("Never fails"),
            released: builder
                .counter("released_total")
                .help("Number of releases")
                .finish()
                .expect("Never fails"),
            in_use: builder
                .gauge("in_use")
                .help("Number of elements checked out of the pool")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// 計測用デコレータのメトリクス.
#[derive(Debug, Clone)]
pub struct ProfilerMetrics {
    pub(crate) calls: Counter,
    pub(crate) failures: Counter,
    pub(crate) elapsed_seconds: Counter,
}
impl ProfilerMetrics {
    /// 呼び出し回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_profiler_calls_total { component="..." } <COUNTER>
    /// ```
    pub fn calls(&self) -> u64 {
        self.calls.value() as u64
    }

    /// エラーを返した呼び出しの回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_profiler_failures_total { component="..." } <COUNTER>
    /// ```
    pub fn failures(&self) -> u64 {
        self.failures.value() as u64
    }

    /// 呼び出しに要した時間の合計(秒).
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// gridpool_profiler_elapsed_seconds_total { component="..." } <COUNTER>
    /// ```
    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_seconds.value()
    }

    pub(crate) fn new(builder: &MetricBuilder, component: &str) -> Self {
        let mut builder = builder.clone();
        builder
            .namespace("gridpool")
            .subsystem("profiler")
            .label("component", component);
        ProfilerMetrics {
            calls: builder
                .counter("calls_total")
                .help("Number of forwarded calls")
                .finish()
                .expect("Never fails"),
            failures: builder
                .counter("failures_total")
                .help("Number of forwarded calls which failed")
                .finish()
                .expect("Never fails"),
            elapsed_seconds: builder
                .counter("elapsed_seconds_total")
                .help("Time spent on forwarded calls")
                .finish()
                .expect("Never fails"),
        }
    }
}
