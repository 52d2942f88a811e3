//! エラー型
//!
//! 推論コアで回復可能な失敗は「デバイスメモリ確保」と「構成の不整合」のみ。
//! 形状不一致・スクラッチ不足・重み配列長の不正は契約違反として assert で扱う。

/// 推論コアのエラー
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// デバイスメモリの予算超過
    #[error("device out of memory: requested {requested} bytes, in use {in_use} bytes, capacity {capacity} bytes")]
    OutOfMemory {
        requested: usize,
        in_use: usize,
        capacity: usize,
    },

    /// アロケータ自体が確保に失敗した
    #[error("device allocation of {0} bytes failed")]
    AllocationFailed(usize),

    /// ネットワーク構成の不整合
    #[error("invalid network config: {0}")]
    InvalidConfig(String),

    /// 構成ファイル（TOML）の解析エラー
    #[error(transparent)]
    Config(#[from] toml::de::Error),

    /// ファイル I/O エラー
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 推論コアの Result 型
pub type Result<T> = std::result::Result<T, Error>;
