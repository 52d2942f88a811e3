//! # rsnet-core
//!
//! 盤面評価用 CNN（残差タワー + ポリシー/バリューヘッド）の推論コア。
//!
//! ## モジュール構成
//!
//! - `device`: デバイスメモリ・要素型・数値ライブラリハンドル
//! - `tensor`: 形状とレイアウト（NCHW / NHWC）
//! - `kernels`: Winograd 変換・SE・ポリシーマップ等の計算カーネル
//! - `layers`: 層（融合 Winograd 畳み込み、残差ブロック、FC、SoftMax 等）
//! - `workspace`: 層間で共有するスクラッチ領域
//! - `network`: 推論グラフの構築と評価
//! - `config` / `weights`: 構成（TOML）とホスト側重み
//!
//! ## 使用例
//!
//! ```
//! use rsnet_core::{Device, Network, NetworkConfig, NetworkWeights};
//!
//! let config = NetworkConfig {
//!     filters: 8,
//!     blocks: 2,
//!     se_channels: 4,
//!     max_batch: 2,
//!     ..NetworkConfig::default()
//! };
//! let weights = NetworkWeights::random(&config, 0);
//! let device = Device::new();
//! let network = Network::<f32>::build(&config, &weights, &device)?;
//! let mut session = network.new_session(&device)?;
//!
//! let input = vec![0.0f32; config.input_shape().numel()];
//! let mut policy = vec![0.0f32; config.policy_size];
//! let mut value = vec![0.0f32; config.value_size()];
//! session.evaluate(&network, 1, &input, &mut policy, &mut value);
//! assert!((value.iter().sum::<f32>() - 1.0).abs() < 1e-5);
//! # Ok::<(), rsnet_core::Error>(())
//! ```

// 基盤
pub mod device;
pub mod error;
pub mod stats;
pub mod tensor;

// 計算
pub mod kernels;
pub mod layers;
pub mod workspace;

// グラフ
pub mod config;
pub mod network;
pub mod weights;

pub use config::{NetworkConfig, PolicyHead, ValueHead};
pub use device::{Device, DeviceBuffer, Element, GemmPath, MathHandles, Precision};
pub use error::{Error, Result};
pub use layers::Layer;
pub use network::{Network, Session};
pub use tensor::{Layout, Shape};
pub use weights::NetworkWeights;
pub use workspace::{ScratchPlan, ScratchRequirement, Workspace};
