//! 生成コストの高いハンドル(e.g., DBコネクション、HTTPクライアント文脈)のプール.
//!
//! [PoolContainer]は、同時に貸し出されるハンドルの数を容量以下に抑えつつ、
//! 返却されたハンドルを再利用する.
//! 貸し出しは[PoolGrabber]経由で行われ、スコープを抜けると(エラーによる早期リターンも含めて)必ず返却される.
//!
//! 待機中の要素は後入れ先出し(LIFO)で再利用される.
//! i.e., 最後に返却された要素が次に貸し出される.
//!
//! [PoolContainer]: struct.PoolContainer.html
//! [PoolGrabber]: struct.PoolGrabber.html
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::metrics::ResourcePoolMetrics;
use crate::{ErrorKind, Result};

/// プールの要素の生成・検証・破棄を担当するファクトリ.
pub trait PoolElementFactory {
    /// プールに格納される要素の型.
    type Element;

    /// 要素を一つ生成する.
    ///
    /// バックエンドに到達できない場合等にはエラーを返す.
    /// この層ではリトライは行われず、エラーはそのまま呼び出し元に伝播する.
    fn create(&self) -> Result<Self::Element>;

    /// 要素を破棄する.
    ///
    /// 失敗してもエラーは返さない(ベストエフォート).
    fn destroy(&self, element: Self::Element);

    /// 要素がまだ利用可能かどうかを判定する.
    ///
    /// ドライバ層で自動再接続を行う実装であれば、常に`true`を返して構わない.
    fn is_valid(&self, element: &Self::Element) -> bool;
}

/// `PoolContainer`のビルダ.
#[derive(Debug, Clone)]
pub struct PoolContainerBuilder {
    name: String,
    capacity: usize,
    metrics: MetricBuilder,
    logger: Logger,
}
impl PoolContainerBuilder {
    /// デフォルト設定で`PoolContainerBuilder`インスタンスを生成する.
    pub fn new(name: &str) -> Self {
        PoolContainerBuilder {
            name: name.to_owned(),
            capacity: 10,
            metrics: MetricBuilder::new(),
            logger: Logger::root(Discard, o!()),
        }
    }

    /// 同時に貸し出し可能な要素数の上限を設定する.
    ///
    /// デフォルト値は`10`.
    pub fn capacity(&mut self, n: usize) -> &mut Self {
        self.capacity = n;
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

    /// 指定のファクトリを使う`PoolContainer`を生成する.
    pub fn finish<F: PoolElementFactory>(&self, factory: F) -> PoolContainer<F> {
        PoolContainer {
            factory,
            state: Mutex::new(PoolState {
                capacity: self.capacity,
                idle: VecDeque::new(),
                in_use: 0,
            }),
            available: Condvar::new(),
            metrics: ResourcePoolMetrics::new(&self.metrics, &self.name),
            logger: self.logger.new(o!("resource_pool" => self.name.clone())),
        }
    }
}

/// 要素を貸し出すスレッドセーフなプール.
pub struct PoolContainer<F: PoolElementFactory> {
    factory: F,
    state: Mutex<PoolState<F::Element>>,
    available: Condvar,
    metrics: ResourcePoolMetrics,
    logger: Logger,
}
impl<F: PoolElementFactory> PoolContainer<F> {
    /// デフォルト設定で`PoolContainer`インスタンスを生成する.
    pub fn new(factory: F, capacity: usize) -> Self {
        PoolContainerBuilder::new("default")
            .capacity(capacity)
            .finish(factory)
    }

    /// 要素を一つ借りる.
    ///
    /// 容量一杯まで貸し出し中の場合には、返却されるまで呼び出しスレッドがブロックする.
    pub fn acquire(&self) -> Result<PoolGrabber<F>> {
        let state = track!(self.lock_state())?;
        let mut state = track_lock!(self.available.wait_while(state, |s| s.is_full()))?;
        let idle = state.checkout();
        drop(state);
        track!(self.finish_acquire(idle))
    }

    /// 最大`timeout`だけ待機して要素を一つ借りる.
    ///
    /// 時間内に空きが出なければ`ErrorKind::Timeout`が返される.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PoolGrabber<F>> {
        let started_at = Instant::now();
        let mut state = track!(self.lock_state())?;
        while state.is_full() {
            let elapsed = started_at.elapsed();
            track_assert!(elapsed < timeout, ErrorKind::Timeout; elapsed, timeout);
            let (s, _) = track_lock!(self.available.wait_timeout(state, timeout - elapsed))?;
            state = s;
        }
        let idle = state.checkout();
        drop(state);
        track!(self.finish_acquire(idle))
    }

    /// ブロックせずに要素を一つ借りる.
    ///
    /// 空きが無い場合には`ErrorKind::Busy`が返される.
    pub fn try_acquire(&self) -> Result<PoolGrabber<F>> {
        let mut state = track!(self.lock_state())?;
        track_assert!(
            !state.is_full(),
            ErrorKind::Busy,
            "No resources available"
        );
        let idle = state.checkout();
        drop(state);
        track!(self.finish_acquire(idle))
    }

    /// 容量を変更する.
    ///
    /// 変更は以降の貸し出しにのみ影響し、貸し出し中の要素が強制的に回収されることはない.
    pub fn resize(&self, capacity: usize) -> Result<()> {
        let mut state = track!(self.lock_state())?;
        state.capacity = capacity;
        while state.idle.len() > capacity {
            // 最も長く使われていない要素から破棄する
            if let Some(e) = state.idle.pop_front() {
                self.metrics.destroyed.increment();
                self.factory.destroy(e);
            }
        }
        self.available.notify_all();
        debug!(self.logger, "Resized"; "capacity" => capacity, "in_use" => state.in_use);
        Ok(())
    }

    /// 現在の容量を返す.
    pub fn capacity(&self) -> usize {
        self.state.lock().map(|s| s.capacity).unwrap_or(0)
    }

    /// 現在貸し出し中の要素数を返す.
    pub fn in_use(&self) -> usize {
        self.state.lock().map(|s| s.in_use).unwrap_or(0)
    }

    /// プールのメトリクスを返す.
    pub fn metrics(&self) -> &ResourcePoolMetrics {
        &self.metrics
    }

    /// 要素を返却する.
    fn release(&self, element: F::Element) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => {
                warn!(self.logger, "Poisoned pool state: {}", e);
                self.factory.destroy(element);
                return;
            }
        };
        state.in_use -= 1;
        if state.idle.len() < state.capacity {
            state.idle.push_back(element);
        } else {
            self.metrics.destroyed.increment();
            self.factory.destroy(element);
        }
        self.metrics.released.increment();
        self.metrics.in_use.decrement();
        self.available.notify_one();
    }

    fn lock_state(&self) -> Result<MutexGuard<PoolState<F::Element>>> {
        let state = track_lock!(self.state.lock())?;
        Ok(state)
    }

    // 予約済みのスロットに要素を割り当てる (ロック外で実行される).
    fn finish_acquire(&self, idle: Option<F::Element>) -> Result<PoolGrabber<F>> {
        let element = match idle {
            Some(e) if self.factory.is_valid(&e) => Ok(e),
            Some(e) => {
                debug!(self.logger, "Discarding an invalid element");
                self.metrics.destroyed.increment();
                self.factory.destroy(e);
                self.create()
            }
            None => self.create(),
        };
        match element {
            Ok(e) => {
                self.metrics.acquired.increment();
                self.metrics.in_use.increment();
                Ok(PoolGrabber {
                    pool: self,
                    element: Some(e),
                })
            }
            Err(e) => {
                // 予約したスロットを解放する
                if let Ok(mut state) = self.state.lock() {
                    state.in_use -= 1;
                }
                self.available.notify_one();
                Err(track!(e))
            }
        }
    }

    fn create(&self) -> Result<F::Element> {
        let e = track!(self.factory.create())?;
        self.metrics.created.increment();
        Ok(e)
    }
}
impl<F: PoolElementFactory> Drop for PoolContainer<F> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            while let Some(e) = state.idle.pop_front() {
                self.factory.destroy(e);
            }
            if state.in_use > 0 {
                warn!(self.logger, "{} used elements from a pool not released on destruction", state.in_use);
            }
        }
    }
}
impl<F: PoolElementFactory> fmt::Debug for PoolContainer<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "PoolContainer {{ capacity: {}, in_use: {} }}",
            self.capacity(),
            self.in_use()
        )
    }
}

struct PoolState<E> {
    capacity: usize,
    idle: VecDeque<E>,
    in_use: usize,
}
impl<E> PoolState<E> {
    fn is_full(&self) -> bool {
        self.in_use >= self.capacity
    }

    // 呼び出し元はロックを保持していること
    fn checkout(&mut self) -> Option<E> {
        self.in_use += 1;
        self.idle.pop_back()
    }
}

/// プールから借りた要素のガード.
///
/// ドロップ時に要素はプールへ返却される.
pub struct PoolGrabber<'a, F: PoolElementFactory> {
    pool: &'a PoolContainer<F>,
    element: Option<F::Element>,
}
impl<'a, F: PoolElementFactory> Deref for PoolGrabber<'a, F> {
    type Target = F::Element;
    fn deref(&self) -> &Self::Target {
        self.element.as_ref().expect("Never fails")
    }
}
impl<'a, F: PoolElementFactory> DerefMut for PoolGrabber<'a, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.element.as_mut().expect("Never fails")
    }
}
impl<'a, F: PoolElementFactory> Drop for PoolGrabber<'a, F> {
    fn drop(&mut self) {
        if let Some(e) = self.element.take() {
            self.pool.release(e);
        }
    }
}
impl<'a, F: PoolElementFactory> fmt::Debug for PoolGrabber<'a, F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PoolGrabber {{ .. }}")
    }
}
