//! 並行実行数の上限付き優先度キュー.
//!
//! チェックサム計算やファイル取得といったバックグラウンド処理を、
//! 資源(e.g., ディスクサーバ、ファイルシステム)毎の同時実行数の上限を守りながら順番に実行するために使われる.
//!
//! 各要素は以下の情報を持つ:
//!
//! - 要素を一意に識別する文字列キー(`namekey`)
//! - 状態(`Waiting` => `Running` => `Finished`の順にのみ遷移する)
//! - 優先度(大きいほど先に実行される)
//! - 上限判定用の修飾子列(`qualifiers`)
//!   - `qualifiers[i]`は`limits[i]`と比較される
//!   - 例えばチェックサム計算では、第一列にサーバ名、第二列に`サーバ名:ファイルシステム`を入れることで、
//!     「サーバ毎にN1個まで」「ファイルシステム毎にN2個まで」という制約を表現できる
//!
//! 一定時間参照されなかった要素は[tick]によって破棄される.
//! 逆に、参照されれば(存在しない場合には)再作成されるので、
//! キューの内容は利用者からの参照によって漸進的に再構築可能となっている.
//!
//! [tick]: struct.PrioQueue.html#method.tick
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::cmp::{self, Reverse};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::metrics::QueueMetrics;

/// キューの要素の状態.
///
/// 状態は前方(値が大きい方)にのみ遷移する.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueStatus {
    /// 不明.
    Unknown = 0,

    /// 実行待ち.
    Waiting = 1,

    /// 実行中.
    Running = 2,

    /// 完了.
    Finished = 3,
}

/// キューの要素.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// 要素を一意に識別するキー.
    pub namekey: String,

    /// 同時実行数の上限判定に使われる修飾子列.
    pub qualifiers: Vec<String>,

    /// 要素の状態.
    pub status: QueueStatus,

    /// 優先度.
    pub priority: i32,

    insertion_time: Instant,
    access_time: Instant,
}
impl QueueItem {
    /// 要素がキューに(再)挿入された時刻.
    pub fn insertion_time(&self) -> Instant {
        self.insertion_time
    }

    /// 要素が最後に参照された時刻.
    pub fn access_time(&self) -> Instant {
        self.access_time
    }
}

/// `touch_item_or_create_new`の結果.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    /// 新しい要素が作成された.
    Created,

    /// 優先度ないし修飾子が変わったため、要素が再挿入された.
    Requeued,

    /// 状態が前進した.
    Advanced,

    /// 完了通知により要素が取り除かれた.
    Removed,

    /// 参照時刻が更新されただけ.
    Unchanged,

    /// 新規作成時の状態が不正だったため、何もしなかった.
    Rejected,
}

/// `PrioQueue`のビルダ.
#[derive(Debug, Clone)]
pub struct PrioQueueBuilder {
    name: String,
    timeout: Duration,
    limits: Vec<usize>,
    metrics: MetricBuilder,
    logger: Logger,
}
impl PrioQueueBuilder {
    /// デフォルト設定で`PrioQueueBuilder`インスタンスを生成する.
    pub fn new(name: &str) -> Self {
        PrioQueueBuilder {
            name: name.to_owned(),
            timeout: Duration::from_secs(30),
            limits: Vec::new(),
            metrics: MetricBuilder::new(),
            logger: Logger::root(Discard, o!()),
        }
    }

    /// 要素が参照されずにキューに保持される最大時間を設定する.
    ///
    /// デフォルト値は`Duration::from_secs(30)`.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// 修飾子の列毎の同時実行数の上限を設定する.
    ///
    /// デフォルトは空(i.e., 上限無し).
    pub fn limits(&mut self, limits: Vec<usize>) -> &mut Self {
        self.limits = limits;
        self
    }

    /// メトリクス用の共通設定を登録する.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// logger を登録する.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// `PrioQueue`を生成する.
    pub fn finish(&self) -> PrioQueue {
        PrioQueue {
            timeout: self.timeout,
            limits: self.limits.clone(),
            inner: Mutex::new(Inner::new(self.limits.len())),
            metrics: QueueMetrics::new(&self.metrics, &self.name),
            logger: self.logger.new(o!("queue" => self.name.clone())),
        }
    }
}

/// スレッドセーフな汎用優先度付きタスクキュー.
///
/// [モジュールドキュメント](index.html)も参照のこと.
///
/// 全ての操作はメモリ上で完結し、失敗することはない.
/// 利用者の誤り(e.g., 不正な状態での新規作成)はログに記録された上で無視される.
#[derive(Debug)]
pub struct PrioQueue {
    timeout: Duration,
    limits: Vec<usize>,
    inner: Mutex<Inner>,
    metrics: QueueMetrics,
    logger: Logger,
}
impl PrioQueue {
    /// 新しい`PrioQueue`インスタンスを生成する.
    pub fn new(timeout: Duration, limits: Vec<usize>) -> Self {
        PrioQueueBuilder::new("default")
            .timeout(timeout)
            .limits(limits)
            .finish()
    }

    /// 要素を参照する.
    ///
    /// 要素が存在しない場合には、指定の内容で作成する(状態は`Waiting`か`Running`でなければならない).
    ///
    /// 存在する場合には参照時刻を更新した上で:
    ///
    /// - `status`が`Finished`なら、要素を取り除く
    /// - 優先度ないし修飾子が異なるなら、新しい値で再挿入する (状態は後退しない)
    ///   - ただし実行中の要素の新しい修飾子が上限に達している場合は、元の修飾子を保持する
    /// - `status`が現在の状態よりも先なら、状態を進める
    /// - それ以外なら、何もしない
    ///
    /// いずれの場合も同時実行数の上限は超えない.
    /// 上限に達している修飾子を持つ要素を`Running`で作成しようとした場合には、`Waiting`で作成される.
    pub fn touch_item_or_create_new(
        &self,
        namekey: &str,
        status: QueueStatus,
        priority: i32,
        qualifiers: &[String],
    ) -> TouchOutcome {
        self.touch_item_or_create_new_at(Instant::now(), namekey, status, priority, qualifiers)
    }

    /// 現在時刻を明示して`touch_item_or_create_new`を実行する.
    pub fn touch_item_or_create_new_at(
        &self,
        now: Instant,
        namekey: &str,
        status: QueueStatus,
        priority: i32,
        qualifiers: &[String],
    ) -> TouchOutcome {
        let mut inner = self.lock_inner();
        debug!(self.logger, "Touching item";
               "namekey" => namekey, "status" => ?status, "priority" => priority);

        let outcome = if let Some(mut item) = inner.detach(namekey) {
            item.access_time = now;
            if status == QueueStatus::Finished {
                item.status = QueueStatus::Finished;
                self.metrics.removed_items.increment();
                TouchOutcome::Removed
            } else if priority != item.priority || qualifiers != &item.qualifiers[..] {
                let old_qualifiers = mem::replace(&mut item.qualifiers, qualifiers.to_vec());
                item.priority = priority;
                item.status = cmp::max(item.status, status);
                item.insertion_time = now;
                if item.status == QueueStatus::Running
                    && !inner.is_possible_to_run(&item, &self.limits)
                {
                    // 新しい修飾子が上限に達している場合は、元の枠を保持し続ける
                    item.qualifiers = old_qualifiers;
                }
                inner.attach(item);
                TouchOutcome::Requeued
            } else if status > item.status {
                if status == QueueStatus::Running && !inner.is_possible_to_run(&item, &self.limits) {
                    debug!(self.logger, "Cannot start the item because of the limits";
                           "namekey" => namekey);
                    inner.attach(item);
                    TouchOutcome::Unchanged
                } else {
                    item.status = status;
                    inner.attach(item);
                    TouchOutcome::Advanced
                }
            } else {
                inner.attach(item);
                TouchOutcome::Unchanged
            }
        } else if status == QueueStatus::Waiting || status == QueueStatus::Running {
            let mut item = QueueItem {
                namekey: namekey.to_owned(),
                qualifiers: qualifiers.to_vec(),
                status,
                priority,
                insertion_time: now,
                access_time: now,
            };
            if status == QueueStatus::Running && !inner.is_possible_to_run(&item, &self.limits) {
                item.status = QueueStatus::Waiting;
            }
            inner.attach(item);
            self.metrics.inserted_items.increment();
            TouchOutcome::Created
        } else {
            warn!(self.logger, "Tried to add an item with status neither Waiting nor Running";
                  "namekey" => namekey, "status" => ?status);
            TouchOutcome::Rejected
        };
        self.update_gauges(&inner);
        outcome
    }

    /// 指定の要素を(状態に関わらず)キューから取り除く.
    ///
    /// 取り除かれた要素の状態は`Finished`となる.
    /// 要素が存在しない場合には何もせずに`None`を返す.
    pub fn remove_item(&self, namekey: &str) -> Option<QueueItem> {
        let mut inner = self.lock_inner();
        let item = inner.detach(namekey).map(|mut item| {
            item.status = QueueStatus::Finished;
            item
        });
        if item.is_some() {
            self.metrics.removed_items.increment();
        }
        self.update_gauges(&inner);
        item
    }

    /// 次に実行可能な要素を選び、その状態を`Running`に遷移させた上で返す.
    ///
    /// 実行待ちの要素は「優先度の降順、挿入時刻の昇順、キーの昇順」に走査され、
    /// 全ての修飾子について同時実行数が上限未満となる最初の要素が選ばれる.
    /// そのような要素が無い場合には`None`が返される.
    pub fn get_next_to_run(&self) -> Option<QueueItem> {
        let mut inner = self.lock_inner();
        let namekey = inner
            .waiting
            .iter()
            .map(|k| &k.namekey)
            .find(|namekey| {
                inner
                    .items
                    .get(namekey.as_str())
                    .map_or(false, |item| inner.is_possible_to_run(item, &self.limits))
            })
            .cloned()?;
        let mut item = inner.detach(&namekey)?;
        item.status = QueueStatus::Running;
        inner.attach(item.clone());
        self.metrics.started_items.increment();
        self.update_gauges(&inner);
        debug!(self.logger, "Promoted item to running"; "namekey" => &item.namekey);
        Some(item)
    }

    /// 実行待ちの要素数を返す.
    pub fn n_waiting(&self) -> usize {
        self.lock_inner().waiting.len()
    }

    /// キューに格納されている要素の総数を返す.
    pub fn n_total(&self) -> usize {
        self.lock_inner().items.len()
    }

    /// 指定の要素の内容を返す.
    pub fn get(&self, namekey: &str) -> Option<QueueItem> {
        self.lock_inner().items.get(namekey).cloned()
    }

    /// `dimension`列目の修飾子が`value`である実行中の要素数を返す.
    pub fn running_count(&self, dimension: usize, value: &str) -> usize {
        self.lock_inner()
            .active
            .get(dimension)
            .and_then(|m| m.get(value).cloned())
            .unwrap_or(0)
    }

    /// 参照されないまま`timeout`を超えた要素群を取り除く.
    ///
    /// 取り除かれた要素は、最後の状態を保持したまま返される.
    pub fn tick(&self, now: Instant) -> Vec<QueueItem> {
        let mut inner = self.lock_inner();
        let mut expired = Vec::new();
        loop {
            let namekey = match inner.timesort.iter().next() {
                Some((access_time, namekey))
                    if now.saturating_duration_since(*access_time) > self.timeout =>
                {
                    namekey.clone()
                }
                _ => break, // 以降の要素は全てこれよりも新しい
            };
            if let Some(item) = inner.detach(&namekey) {
                info!(self.logger, "Queue item timed out";
                      "namekey" => &item.namekey, "timeout" => ?self.timeout);
                self.metrics.expired_items.increment();
                self.metrics.removed_items.increment();
                expired.push(item);
            }
        }
        self.update_gauges(&inner);
        expired
    }

    /// キューのメトリクスを返す.
    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    fn lock_inner(&self) -> MutexGuard<Inner> {
        // 内部状態は各操作の終了時点で常に整合しているので、パニック後もそのまま使う
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_gauges(&self, inner: &Inner) {
        self.metrics.waiting_items.set(inner.waiting.len() as f64);
        self.metrics.total_items.set(inner.items.len() as f64);
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct WaitingKey {
    priority: Reverse<i32>,
    insertion_time: Instant,
    namekey: String,
}
impl WaitingKey {
    fn new(item: &QueueItem) -> Self {
        WaitingKey {
            priority: Reverse(item.priority),
            insertion_time: item.insertion_time,
            namekey: item.namekey.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    items: BTreeMap<String, QueueItem>,
    waiting: BTreeSet<WaitingKey>,
    timesort: BTreeSet<(Instant, String)>,

    // `active[i][v]`は、`i`列目の修飾子が`v`である実行中の要素数.
    // 値が`0`になったエントリは削除される.
    active: Vec<HashMap<String, usize>>,
}
impl Inner {
    fn new(dimensions: usize) -> Self {
        Inner {
            items: BTreeMap::new(),
            waiting: BTreeSet::new(),
            timesort: BTreeSet::new(),
            active: vec![HashMap::new(); dimensions],
        }
    }

    /// 要素を全ての索引に登録する.
    ///
    /// 実行中の要素の場合、上限の判定は行わずに計数のみを行う.
    fn attach(&mut self, item: QueueItem) {
        match item.status {
            QueueStatus::Waiting => {
                self.waiting.insert(WaitingKey::new(&item));
            }
            QueueStatus::Running => {
                for (count, q) in self.active.iter_mut().zip(item.qualifiers.iter()) {
                    *count.entry(q.clone()).or_insert(0) += 1;
                }
            }
            QueueStatus::Unknown | QueueStatus::Finished => unreachable!(),
        }
        self.timesort
            .insert((item.access_time, item.namekey.clone()));
        self.items.insert(item.namekey.clone(), item);
    }

    /// 要素を全ての索引から外して返す.
    fn detach(&mut self, namekey: &str) -> Option<QueueItem> {
        let item = self.items.remove(namekey)?;
        match item.status {
            QueueStatus::Waiting => {
                self.waiting.remove(&WaitingKey::new(&item));
            }
            QueueStatus::Running => {
                for (count, q) in self.active.iter_mut().zip(item.qualifiers.iter()) {
                    let remaining = count.get_mut(q.as_str()).map(|n| {
                        *n -= 1;
                        *n
                    });
                    if remaining == Some(0) {
                        count.remove(q.as_str());
                    }
                }
            }
            QueueStatus::Unknown | QueueStatus::Finished => {}
        }
        self.timesort
            .remove(&(item.access_time, item.namekey.clone()));
        Some(item)
    }

    fn is_possible_to_run(&self, item: &QueueItem, limits: &[usize]) -> bool {
        self.active
            .iter()
            .zip(limits.iter())
            .zip(item.qualifiers.iter())
            .all(|((count, limit), q)| count.get(q.as_str()).cloned().unwrap_or(0) < *limit)
    }
}
