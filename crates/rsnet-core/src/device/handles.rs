//! 数値ライブラリハンドル
//!
//! 推論エンジン側がプロセスごとに作成・所有するコンテキスト。
//! コアはハンドルを借用するだけで、作成も破棄も行わない。

use super::element::Element;
use crate::kernels::{self, Activation};
use crate::stats::{KernelKind, count_launch};
use crate::tensor::Layout;

/// B 行列の転置指定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    /// B は k×n
    No,
    /// B は n×k
    Yes,
}

/// 行列積のコードパス
///
/// どちらも f32 で k 昇順に積算するため結果は一致する。
/// GPU 世代ごとの性能差だけを切り替える。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmPath {
    /// 要素ごとに内積を取るストライド付きバッチ GEMM
    StridedBatched,
    /// 行単位の f32 アキュムレータで積算する拡張 GEMM
    Ex,
}

impl GemmPath {
    #[inline]
    pub fn select(use_gemm_ex: bool) -> Self {
        if use_gemm_ex { Self::Ex } else { Self::StridedBatched }
    }
}

/// BLAS コンテキスト
#[derive(Debug, Default)]
pub struct BlasHandle {
    _private: (),
}

impl BlasHandle {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// 行優先のバッチ行列積 `C[b] = A[b] · op(B[b])`
    ///
    /// - `A[b]`: m×k（ストライド m*k）
    /// - `B[b]`: k×n または n×k（ストライド k*n）
    /// - `C[b]`: m×n（ストライド m*n）
    #[allow(clippy::too_many_arguments)]
    pub fn gemm_batched<T: Element>(
        &self,
        path: GemmPath,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        a: &[T],
        b: &[T],
        c: &mut [T],
        batch: usize,
    ) {
        debug_assert!(a.len() >= batch * m * k);
        debug_assert!(b.len() >= batch * k * n);
        debug_assert!(c.len() >= batch * m * n);
        count_launch(KernelKind::Gemm);

        let b_at = |bm: &[T], p: usize, j: usize| -> f32 {
            match trans_b {
                Transpose::No => bm[p * n + j].to_f32(),
                Transpose::Yes => bm[j * k + p].to_f32(),
            }
        };

        match path {
            GemmPath::StridedBatched => {
                for bi in 0..batch {
                    let am = &a[bi * m * k..(bi + 1) * m * k];
                    let bm = &b[bi * k * n..(bi + 1) * k * n];
                    let cm = &mut c[bi * m * n..(bi + 1) * m * n];
                    for i in 0..m {
                        let row = &am[i * k..(i + 1) * k];
                        for j in 0..n {
                            let mut acc = 0.0f32;
                            for (p, &av) in row.iter().enumerate() {
                                acc += av.to_f32() * b_at(bm, p, j);
                            }
                            cm[i * n + j] = T::from_f32(acc);
                        }
                    }
                }
            }
            GemmPath::Ex => {
                let mut acc = vec![0.0f32; n];
                for bi in 0..batch {
                    let am = &a[bi * m * k..(bi + 1) * m * k];
                    let bm = &b[bi * k * n..(bi + 1) * k * n];
                    let cm = &mut c[bi * m * n..(bi + 1) * m * n];
                    for i in 0..m {
                        acc.fill(0.0);
                        for p in 0..k {
                            let av = am[i * k + p].to_f32();
                            for (j, slot) in acc.iter_mut().enumerate() {
                                *slot += av * b_at(bm, p, j);
                            }
                        }
                        for (dst, &v) in cm[i * n..(i + 1) * n].iter_mut().zip(&acc) {
                            *dst = T::from_f32(v);
                        }
                    }
                }
            }
        }
    }
}

/// DNN コンテキスト（直接畳み込み・softmax・バイアス加算）
#[derive(Debug, Default)]
pub struct DnnHandle {
    _private: (),
}

impl DnnHandle {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// 直接畳み込み（"same" パディング、ストライド 1）
    ///
    /// `filter`: [c_out][c_in][size][size]
    #[allow(clippy::too_many_arguments)]
    pub fn convolution_forward<T: Element>(
        &self,
        layout: Layout,
        n: usize,
        c_in: usize,
        c_out: usize,
        h: usize,
        w: usize,
        size: usize,
        input: &[T],
        filter: &[T],
        output: &mut [T],
    ) {
        count_launch(KernelKind::Convolution);
        kernels::conv_direct(layout, n, c_in, c_out, h, w, size, input, filter, output);
    }

    /// チャネルごとのバイアス加算と活性化（インプレース）
    #[allow(clippy::too_many_arguments)]
    pub fn add_bias_activation<T: Element>(
        &self,
        layout: Layout,
        n: usize,
        c: usize,
        hw: usize,
        data: &mut [T],
        bias: Option<&[T]>,
        activation: Activation,
    ) {
        count_launch(KernelKind::Elementwise);
        kernels::add_bias_activation(layout, n, c, hw, data, bias, activation);
    }

    /// チャネル方向の softmax
    pub fn softmax_forward<T: Element>(
        &self,
        layout: Layout,
        n: usize,
        c: usize,
        hw: usize,
        input: &[T],
        output: &mut [T],
    ) {
        count_launch(KernelKind::Softmax);
        kernels::softmax(layout, n, c, hw, input, output);
    }
}

/// 1 つのグラフが共有する数値ライブラリハンドルの組
#[derive(Debug, Default)]
pub struct MathHandles {
    pub dnn: DnnHandle,
    pub blas: BlasHandle,
}

impl MathHandles {
    pub fn new() -> Self {
        Self {
            dnn: DnnHandle::new(),
            blas: BlasHandle::new(),
        }
    }
}
