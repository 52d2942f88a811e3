//! ポリシーマップ層
//!
//! 畳み込みポリシーヘッドの中間出力（例: 80×8×8、うち有効 73×8×8）を
//! `i16` の対応表でポリシー空間（例: 1858）へ散布する。`-1` は未使用。

use crate::device::{Device, DeviceBuffer, Element};
use crate::error::Result;
use crate::kernels;
use crate::tensor::{Layout, Shape};

#[derive(Debug)]
pub struct PolicyMapLayer {
    shape: Shape,
    input_shape: Shape,
    layout: Layout,
    /// パディングなしの有効エントリ数（入力の CHW 平坦化位置）
    used_size: usize,
    /// 格納済み対応表の長さ（NHWC 変換後はパディング込み）
    table_len: usize,
    table: DeviceBuffer<i16>,
}

impl PolicyMapLayer {
    /// 新規作成
    ///
    /// `input_shape` はパディング込みの中間出力形状、`(c, h, w)` はポリシー空間の形状。
    pub fn new(
        device: &Device,
        layout: Layout,
        input_shape: Shape,
        c: usize,
        h: usize,
        w: usize,
        used_size: usize,
    ) -> Result<Self> {
        assert!(used_size <= input_shape.numel(), "policy map used size exceeds input");
        Ok(Self {
            shape: Shape::new(c, h, w),
            input_shape,
            layout,
            used_size,
            table_len: 0,
            table: device.alloc_zeroed(input_shape.numel())?,
        })
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    pub fn used_size(&self) -> usize {
        self.used_size
    }

    #[inline]
    pub fn table_len(&self) -> usize {
        self.table_len
    }

    pub fn weights_bytes(&self) -> usize {
        self.table.size_in_bytes()
    }

    /// `table`: 入力の CHW 平坦化位置ごとの出力インデックス（先頭 `used_size` 個を使う）
    ///
    /// NHWC では位置を HWC 順へ並べ替え、パディングチャネルを含む全長を `-1` で埋める。
    pub fn load_weights(&mut self, table: &[i16]) {
        debug_assert!(table.len() >= self.used_size, "policy map table too short");
        debug_assert!(
            table[..self.used_size]
                .iter()
                .all(|&v| v < 0 || (v as usize) < self.shape.numel()),
            "policy map index out of range"
        );

        match self.layout {
            Layout::Nchw => {
                self.table[..self.used_size].copy_from_slice(&table[..self.used_size]);
                self.table_len = self.used_size;
            }
            Layout::Nhwc => {
                let plane = self.input_shape.plane();
                let cin = self.input_shape.c;
                self.table.fill(-1);
                for (index, &v) in table[..self.used_size].iter().enumerate() {
                    if v >= 0 {
                        let c = index / plane;
                        let hw = index % plane;
                        self.table[hw * cin + c] = v;
                    }
                }
                self.table_len = self.input_shape.numel();
            }
        }
    }

    pub fn eval<T: Element>(&self, n: usize, output: &mut [T], input: &[T]) {
        kernels::policy_map(
            n,
            input,
            self.input_shape.numel(),
            &self.table[..self.table_len],
            output,
            self.shape.numel(),
        );
    }
}
