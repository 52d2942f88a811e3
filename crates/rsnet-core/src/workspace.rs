//! 共有ワークスペース
//!
//! グラフ全体で 1 つのスクラッチ領域を使い回す。各層は必要量（要素数）を申告し、
//! ドライバがその和集合（= 最大値）で一度だけ確保する。
//!
//! ```text
//! scratch: 1 回の eval / load の間だけ有効な一時領域
//! carry:   隣接する残差ブロック間で受け渡す Winograd 変換済みテンソル
//! ```

use crate::device::{Device, DeviceBuffer, Element};
use crate::error::Result;
use log::debug;

/// 1 層が必要とするワークスペース量（要素数）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchRequirement {
    /// eval 時のスクラッチ
    pub eval: usize,
    /// ロード時のスクラッチ（重みのステージングと変換）
    pub load: usize,
    /// ブロック間キャリー
    pub carry: usize,
}

impl ScratchRequirement {
    /// 何も要さない
    pub const NONE: Self = Self {
        eval: 0,
        load: 0,
        carry: 0,
    };

    /// 要素ごとの最大値
    #[inline]
    pub fn union(self, other: Self) -> Self {
        Self {
            eval: self.eval.max(other.eval),
            load: self.load.max(other.load),
            carry: self.carry.max(other.carry),
        }
    }

    /// スクラッチとして確保すべき要素数
    #[inline]
    pub fn scratch_len(&self) -> usize {
        self.eval.max(self.load)
    }
}

/// グラフ全体の確保計画
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchPlan {
    total: ScratchRequirement,
}

impl ScratchPlan {
    /// 新規作成
    pub fn new() -> Self {
        Self::default()
    }

    /// 層の要求を追加
    pub fn add(&mut self, req: ScratchRequirement) {
        self.total = self.total.union(req);
    }

    /// 和集合
    #[inline]
    pub fn requirement(&self) -> ScratchRequirement {
        self.total
    }

    /// 確保に必要なバイト数
    pub fn bytes<T: Element>(&self) -> usize {
        (self.total.scratch_len() + self.total.carry) * size_of::<T>()
    }
}

impl FromIterator<ScratchRequirement> for ScratchPlan {
    fn from_iter<I: IntoIterator<Item = ScratchRequirement>>(iter: I) -> Self {
        let mut plan = Self::new();
        for req in iter {
            plan.add(req);
        }
        plan
    }
}

/// ワークスペース本体
///
/// 各層の `eval` に `&mut` で渡される。スクラッチの内容は呼び出しをまたいで保持されない。
#[derive(Debug, Default)]
pub struct Workspace<T: Element> {
    pub scratch: DeviceBuffer<T>,
    pub carry: DeviceBuffer<T>,
}

impl<T: Element> Workspace<T> {
    /// 計画に従って確保
    pub fn new(device: &Device, plan: &ScratchPlan) -> Result<Self> {
        let req = plan.requirement();
        let scratch = device.alloc_zeroed(req.scratch_len())?;
        let carry = device.alloc_zeroed(req.carry)?;
        debug!(
            "[Workspace] scratch={} carry={} elements ({} bytes)",
            scratch.len(),
            carry.len(),
            plan.bytes::<T>()
        );
        Ok(Self { scratch, carry })
    }

    /// スクラッチのみ（ロード専用など）
    pub fn scratch_only(device: &Device, len: usize) -> Result<Self> {
        Ok(Self {
            scratch: device.alloc_zeroed(len)?,
            carry: DeviceBuffer::default(),
        })
    }

    /// 確保済みバイト数
    pub fn size_in_bytes(&self) -> usize {
        self.scratch.size_in_bytes() + self.carry.size_in_bytes()
    }
}

/// スクラッチ量の前提条件（不足は契約違反）
#[inline]
#[track_caller]
pub(crate) fn require_scratch(have: usize, need: usize) {
    assert!(have >= need, "scratch too small: have {have} elements, need {need}");
}
