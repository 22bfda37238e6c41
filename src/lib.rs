//! Grid Storage Pool Core.
//!
//! `gridpool`は、グリッドストレージのミドルウェアにおける「要求の振り分け」と「バックグラウンド処理の調停」の中核部分を提供するcrate.
//!
//! # 特徴
//!
//! - ファイルの読み書き要求に対して、どの物理レプリカを読むべきか/どこに新しいレプリカを書くべきかを決定する
//!   - 読み込み: 利用可能なレプリカ群の中から一様ランダムに選択
//!   - 書き込み: 書き込み可能なプール群の中から一様ランダムに選択 (管理者のみ明示指定可能)
//! - 選択結果は[Location]として返され、そこにはI/Oエンドポイント向けの署名付きトークンが埋め込まれる
//! - チェックサム計算のようなバックグラウンド処理を、資源毎の同時実行数の上限を守りながら順番に実行する[PrioQueue]を提供
//! - 全ての操作は呼び出しスレッド上で同期的に実行される (非同期ランタイムは使わない)
//! - メタデータの永続化層やディスクサーバとの通信は、トレイトとして外部から注入される
//!
//! # モジュールの依存関係
//!
//! ```text
//! io/checksum => pool => catalog => security
//!                     => token
//! ```
//!
//! - [pool]モジュール:
//!   - 主に[PoolManager]トレイトとその実装である[StandardPoolManager]を提供
//!   - プール一覧のキャッシュ、読み書き先の選択、上書き時の古いレプリカの削除等を担当する
//!   - プール種別毎の処理は[PoolDriver]と[PoolHandler]に委譲される
//! - [catalog]モジュール:
//!   - メタデータストアを抽象化した[Catalog]トレイトを提供
//! - [queue]モジュール:
//!   - 同時実行数の上限付き優先度キューである[PrioQueue]を提供
//! - [token]モジュール:
//!   - HMACベースのアクセストークンの生成と検証
//!
//! [Location]: ./location/struct.Location.html
//! [PrioQueue]: ./queue/struct.PrioQueue.html
//! [pool]: ./pool/index.html
//! [PoolManager]: ./pool/trait.PoolManager.html
//! [StandardPoolManager]: ./pool/struct.StandardPoolManager.html
//! [PoolDriver]: ./pool/trait.PoolDriver.html
//! [PoolHandler]: ./pool/trait.PoolHandler.html
//! [catalog]: ./catalog/index.html
//! [Catalog]: ./catalog/trait.Catalog.html
//! [queue]: ./queue/index.html
//! [token]: ./token/index.html
#![warn(missing_docs)]
extern crate adler32;
extern crate base64;
extern crate hmac;
extern crate prometrics;
extern crate rand;
extern crate sha1;
#[macro_use]
extern crate trackable;
extern crate uuid;
#[macro_use]
extern crate slog;

pub use crate::error::{Error, ErrorKind};

macro_rules! track_lock {
    ($expr:expr) => {
        $expr.map_err(|e| track!(crate::Error::from(e)))
    };
}

pub mod catalog;
pub mod checksum;
pub mod config;
pub mod context;
pub mod idmap;
pub mod io;
pub mod location;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod resource;
pub mod security;
pub mod token;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
