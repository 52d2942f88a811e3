//! デバイスメモリと数値ライブラリハンドル
//!
//! - `Device`: 確保量を記帳するメモリ予算（アロケーション失敗を再現可能にする）
//! - `DeviceBuffer`: デバイスメモリの所有ハンドル（Drop で記帳を返却）
//! - `MathHandles`: 呼び出し側が所有する DNN / BLAS コンテキストの組
//!
//! カーネルは呼び出しスレッド上でプログラム順に発行される。
//! ストリーム順序 = 発行順序であり、層間でのホスト同期は行わない。

mod element;
mod handles;

pub use element::{DeviceRepr, Element, Precision, round_up};
pub use handles::{BlasHandle, DnnHandle, GemmPath, MathHandles, Transpose};

use crate::error::{Error, Result};
use log::debug;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 確保量の記帳
#[derive(Debug, Default)]
struct Ledger {
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

/// デバイス（メモリ予算）
///
/// `Clone` は同じ記帳を共有する。
#[derive(Debug, Clone)]
pub struct Device {
    capacity: usize,
    ledger: Arc<Ledger>,
}

impl Device {
    /// 予算無制限のデバイス
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// 予算 `capacity` バイトのデバイス
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ledger: Arc::new(Ledger::default()),
        }
    }

    /// 予算（バイト）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 使用中のバイト数
    #[inline]
    pub fn bytes_in_use(&self) -> usize {
        self.ledger.in_use.load(Ordering::Relaxed)
    }

    /// 使用量のピーク
    #[inline]
    pub fn peak_bytes(&self) -> usize {
        self.ledger.peak.load(Ordering::Relaxed)
    }

    /// ゼロ初期化したバッファを確保
    pub fn alloc_zeroed<T: DeviceRepr>(&self, len: usize) -> Result<DeviceBuffer<T>> {
        let bytes = len * size_of::<T>();
        let reserved = self.ledger.in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            used.checked_add(bytes).filter(|&next| next <= self.capacity)
        });
        let in_use = match reserved {
            Ok(prev) => prev + bytes,
            Err(used) => {
                return Err(Error::OutOfMemory {
                    requested: bytes,
                    in_use: used,
                    capacity: self.capacity,
                });
            }
        };
        self.ledger.peak.fetch_max(in_use, Ordering::Relaxed);

        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            self.ledger.in_use.fetch_sub(bytes, Ordering::AcqRel);
            return Err(Error::AllocationFailed(bytes));
        }
        data.resize(len, T::default());

        Ok(DeviceBuffer {
            data,
            ledger: Some(Arc::clone(&self.ledger)),
        })
    }

    /// ホストの f32 配列を要素型に変換して転送
    pub fn upload<T: Element>(&self, host: &[f32]) -> Result<DeviceBuffer<T>> {
        let mut buf = self.alloc_zeroed(host.len())?;
        buf.copy_from_host(host);
        Ok(buf)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

/// デバイスメモリの所有ハンドル
///
/// 共有されず、Drop 時に記帳から差し引かれる。
/// `Default` は確保を伴わない空バッファ。
#[derive(Debug)]
pub struct DeviceBuffer<T: DeviceRepr> {
    data: Vec<T>,
    ledger: Option<Arc<Ledger>>,
}

impl<T: DeviceRepr> DeviceBuffer<T> {
    /// 要素数
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// バイト数
    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.data.len() * size_of::<T>()
    }

    /// 全要素をゼロにする
    #[inline]
    pub fn fill_zero(&mut self) {
        self.data.fill(T::default());
    }
}

impl<T: Element> DeviceBuffer<T> {
    /// 先頭からホスト配列を書き込む（f32 → 要素型）
    pub fn copy_from_host(&mut self, host: &[f32]) {
        assert!(host.len() <= self.data.len(), "host copy overruns device buffer");
        for (dst, &src) in self.data.iter_mut().zip(host) {
            *dst = T::from_f32(src);
        }
    }

    /// ホストへ読み出す（要素型 → f32）
    pub fn to_host(&self) -> Vec<f32> {
        self.data.iter().map(|v| v.to_f32()).collect()
    }
}

impl<T: DeviceRepr> Default for DeviceBuffer<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            ledger: None,
        }
    }
}

impl<T: DeviceRepr> Deref for DeviceBuffer<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T: DeviceRepr> DerefMut for DeviceBuffer<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: DeviceRepr> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            let bytes = self.data.len() * size_of::<T>();
            ledger.in_use.fetch_sub(bytes, Ordering::AcqRel);
            if bytes >= 1 << 20 {
                debug!("[Device] released {bytes} bytes");
            }
        }
    }
}
