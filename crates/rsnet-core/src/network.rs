//! 推論グラフのドライバ
//!
//! ```text
//! input ─▶ 入力畳み込み (3x3) ─▶ 残差タワー ─┬─▶ ポリシーヘッド ─▶ policy
//!                                          └─▶ バリューヘッド ─▶ value
//! ```
//!
//! - [`Network`]: 層と配線（ノード）の不変な集合。重みはビルド時に 1 回だけロードする
//! - [`Session`]: ストリームごとのワークスペース・中間テンソル・数値ライブラリハンドル
//!
//! ノードは「スロット」番号で入出力テンソルを参照する。スロットはセッションが所有し、
//! 層には 1 回の `eval` の間だけスライスとして貸し出される。
//! `eval` は `&self` なので、同じ `Network` を複数のセッションから同時に評価できる。

use crate::config::{NetworkConfig, PolicyHead, ValueHead};
use crate::device::{Device, DeviceBuffer, Element, MathHandles};
use crate::error::{Error, Result};
use crate::layers::{
    Conv1Layer, FcLayer, FusedWinogradConvLayer, Layer, PolicyMapLayer, ResidualBlock,
    SoftMaxLayer,
};
use crate::tensor::Shape;
use crate::weights::{NetworkWeights, PolicyHeadWeights};
use crate::workspace::{ScratchPlan, Workspace};
use log::{debug, info, trace};
use std::mem;

/// 入力テンソルのスロット
const INPUT_SLOT: usize = 0;

/// グラフのノード（層 + 入出力スロット）
#[derive(Debug)]
struct Node<T: Element> {
    layer: Layer<T>,
    input: usize,
    input2: Option<usize>,
    output: usize,
}

/// 構築済みの推論グラフ
#[derive(Debug)]
pub struct Network<T: Element> {
    config: NetworkConfig,
    nodes: Vec<Node<T>>,
    /// スロットごとの 1 サンプルあたり要素数
    slots: Vec<usize>,
    plan: ScratchPlan,
    policy_slot: usize,
    value_slot: usize,
}

// =============================================================================
// 構築
// =============================================================================

/// ノードとスロットを積み上げつつ、各層をその場でロードする
struct GraphBuilder<'a, T: Element> {
    device: &'a Device,
    config: &'a NetworkConfig,
    nodes: Vec<Node<T>>,
    slots: Vec<usize>,
    plan: ScratchPlan,
    /// ロード用スクラッチ（必要に応じて拡張）
    staging: DeviceBuffer<T>,
}

impl<'a, T: Element> GraphBuilder<'a, T> {
    fn new(device: &'a Device, config: &'a NetworkConfig) -> Self {
        Self {
            device,
            config,
            nodes: Vec::new(),
            slots: vec![config.input_shape().numel()],
            plan: ScratchPlan::new(),
            staging: DeviceBuffer::default(),
        }
    }

    fn new_slot(&mut self, shape: Shape) -> usize {
        self.slots.push(shape.numel());
        self.slots.len() - 1
    }

    /// ロード用スクラッチを `len` 要素以上にして返す
    fn staging(&mut self, len: usize) -> Result<&mut [T]> {
        if self.staging.len() < len {
            self.staging = DeviceBuffer::default();
            self.staging = self.device.alloc_zeroed(len)?;
        }
        Ok(&mut self.staging[..])
    }

    fn push(&mut self, layer: Layer<T>, input: usize, input2: Option<usize>, output: usize) {
        assert_ne!(input, output, "layer must not write its own input slot");
        assert!(
            layer.shape().numel() <= self.slots[output],
            "{} output does not fit slot {output}",
            layer.kind()
        );
        let req = layer.scratch_requirement(self.config.max_batch);
        debug!(
            "[Load] #{} {} shape={:?} weights={} bytes scratch={:?}",
            self.nodes.len(),
            layer.kind(),
            layer.shape(),
            layer.weights_bytes(),
            req
        );
        self.plan.add(req);
        self.nodes.push(Node {
            layer,
            input,
            input2,
            output,
        });
    }

    /// 3x3 融合畳み込み（bias 付き、skip/SE なし）
    fn winograd_conv(
        &mut self,
        input: usize,
        c: usize,
        c_in: usize,
        relu: bool,
        filter: &[f32],
        bias: &[f32],
    ) -> Result<usize> {
        let cfg = self.config;
        let bs = cfg.board_size;
        let mut conv = FusedWinogradConvLayer::<T>::new(
            self.device, cfg.layout, c, bs, bs, c_in, relu, true, false, false, 0, cfg.use_gemm_ex,
        )?;
        let load = conv.scratch_requirement(cfg.max_batch).load;
        conv.load_weights(filter, bias, self.staging(load)?);
        let output = self.new_slot(conv.shape());
        self.push(Layer::FusedWinogradConv(conv), input, None, output);
        Ok(output)
    }

    /// 1x1 畳み込み（bias + ReLU）
    fn conv1(&mut self, input: usize, c: usize, c_in: usize, filter: &[f32], bias: &[f32]) -> Result<usize> {
        let cfg = self.config;
        let bs = cfg.board_size;
        let mut conv = Conv1Layer::<T>::new(self.device, cfg.layout, c, bs, bs, c_in, true, true, cfg.use_gemm_ex)?;
        let load = conv.scratch_requirement().load;
        conv.load_weights(filter, bias, self.staging(load)?);
        let output = self.new_slot(conv.shape());
        self.push(Layer::Conv1(conv), input, None, output);
        Ok(output)
    }

    #[allow(clippy::too_many_arguments)]
    fn fc(
        &mut self,
        input: usize,
        input_shape: Shape,
        outputs: usize,
        relu: bool,
        tanh: bool,
        weights: &[f32],
        bias: &[f32],
    ) -> Result<usize> {
        let cfg = self.config;
        let mut fc =
            FcLayer::<T>::new(self.device, cfg.layout, input_shape, outputs, 1, 1, relu, true, tanh, false)?;
        let load = fc.scratch_requirement().load;
        fc.load_weights(weights, bias, self.staging(load)?);
        let output = self.new_slot(fc.shape());
        self.push(Layer::FullyConnected(fc), input, None, output);
        Ok(output)
    }

    /// 残差タワー（2 スロットを交互に使う）
    fn tower(&mut self, input: usize, weights: &NetworkWeights) -> Result<usize> {
        let cfg = self.config;
        let bs = cfg.board_size;
        let other = self.new_slot(cfg.tower_shape());
        let (mut cur, mut next) = (input, other);
        let count = weights.tower.len();

        for (i, w) in weights.tower.iter().enumerate() {
            let (first, last) = (i == 0, i + 1 == count);
            let mut block = ResidualBlock::<T>::new(
                self.device,
                cfg.layout,
                cfg.filters,
                bs,
                bs,
                cfg.se,
                cfg.se_channels,
                cfg.use_gemm_ex,
                first,
                last,
            )?;
            let load = block.scratch_requirement(cfg.max_batch).load;
            let scratch = self.staging(load)?;
            block.load_weights0(&w.conv0.filter, &w.conv0.bias, scratch);
            block.load_weights1(&w.conv1.filter, &w.conv1.bias, scratch);
            if let Some(se) = &w.se {
                block.load_se_weights(&se.w1, &se.b1, &se.w2, &se.b2, scratch);
            }
            // 先頭ブロック以外は入力をキャリーから読むため、スキップは input2 で渡す
            let input2 = (!first).then_some(cur);
            self.push(Layer::ResidualBlock(block), cur, input2, next);
            mem::swap(&mut cur, &mut next);
        }
        Ok(cur)
    }
}

impl<T: Element> Network<T> {
    /// グラフを構築し、全層の重みをロードする
    ///
    /// 確保に失敗した場合は構築途中の層をすべて破棄してエラーを返す。
    pub fn build(config: &NetworkConfig, weights: &NetworkWeights, device: &Device) -> Result<Self> {
        config.validate()?;
        if config.precision != T::PRECISION {
            return Err(Error::InvalidConfig(format!(
                "config precision {:?} does not match element type {:?}",
                config.precision,
                T::PRECISION
            )));
        }
        weights.check(config)?;

        let f = config.filters;
        let bs = config.board_size;
        let plane = bs * bs;
        let mut b = GraphBuilder::<T>::new(device, config);

        // 入力畳み込み → 残差タワー
        let stem = b.winograd_conv(INPUT_SLOT, f, config.input_channels, true, &weights.input.filter, &weights.input.bias)?;
        let trunk = b.tower(stem, weights)?;

        // ポリシーヘッド
        let policy_slot = match &weights.policy {
            PolicyHeadWeights::Convolution { conv1, conv2, map } => {
                let p1 = b.winograd_conv(trunk, f, f, true, &conv1.filter, &conv1.bias)?;
                let p2 = b.winograd_conv(p1, config.policy_conv_channels, f, false, &conv2.filter, &conv2.bias)?;
                let mut policy = PolicyMapLayer::new(
                    device,
                    config.layout,
                    Shape::new(config.policy_conv_channels, bs, bs),
                    config.policy_size,
                    1,
                    1,
                    config.policy_used_channels * plane,
                )?;
                policy.load_weights(map);
                let out = b.new_slot(policy.shape());
                b.push(Layer::PolicyMap(policy), p2, None, out);
                out
            }
            PolicyHeadWeights::Classical { conv, fc } => {
                let p1 = b.conv1(trunk, config.policy_channels, f, &conv.filter, &conv.bias)?;
                let shape = Shape::new(config.policy_channels, bs, bs);
                b.fc(p1, shape, config.policy_size, false, false, &fc.weights, &fc.bias)?
            }
        };
        debug_assert!(matches!(
            (&weights.policy, config.policy_head),
            (PolicyHeadWeights::Convolution { .. }, PolicyHead::Convolution)
                | (PolicyHeadWeights::Classical { .. }, PolicyHead::Classical)
        ));

        // バリューヘッド
        let v = &weights.value;
        let v1 = b.conv1(trunk, config.value_channels, f, &v.conv.filter, &v.conv.bias)?;
        let v1_shape = Shape::new(config.value_channels, bs, bs);
        let v2 = b.fc(v1, v1_shape, config.value_fc, true, false, &v.fc1.weights, &v.fc1.bias)?;
        let value_slot = match config.value_head {
            ValueHead::Scalar => b.fc(v2, Shape::new(config.value_fc, 1, 1), 1, false, true, &v.fc2.weights, &v.fc2.bias)?,
            ValueHead::Wdl => {
                let logits = b.fc(v2, Shape::new(config.value_fc, 1, 1), 3, false, false, &v.fc2.weights, &v.fc2.bias)?;
                let softmax = SoftMaxLayer::new(config.layout, Shape::new(3, 1, 1));
                let out = b.new_slot(softmax.shape());
                b.push(Layer::SoftMax(softmax), logits, None, out);
                out
            }
        };

        let GraphBuilder { nodes, slots, plan, .. } = b;
        let network = Self {
            config: config.clone(),
            nodes,
            slots,
            plan,
            policy_slot,
            value_slot,
        };
        info!(
            "[Graph] built {} layers: filters={} blocks={} se={} layout={:?} precision={:?} gemm_ex={} weights={} bytes workspace={} bytes (max_batch={})",
            network.nodes.len(),
            f,
            config.blocks,
            config.se,
            config.layout,
            config.precision,
            config.use_gemm_ex,
            network.weights_bytes(),
            network.plan.bytes::<T>(),
            config.max_batch
        );
        Ok(network)
    }

    #[inline]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// 層の数
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 層を構築順に列挙
    pub fn layers(&self) -> impl Iterator<Item = &Layer<T>> {
        self.nodes.iter().map(|node| &node.layer)
    }

    /// ワークスペースの確保計画
    #[inline]
    pub fn scratch_plan(&self) -> &ScratchPlan {
        &self.plan
    }

    /// 全層が所有する重みのバイト数
    pub fn weights_bytes(&self) -> usize {
        self.layers().map(Layer::weights_bytes).sum()
    }

    /// 評価セッションを作成（max_batch 分のテンソルとワークスペースを確保）
    pub fn new_session(&self, device: &Device) -> Result<Session<T>> {
        let max_batch = self.config.max_batch;
        let workspace = Workspace::new(device, &self.plan)?;
        let tensors = self
            .slots
            .iter()
            .map(|&numel| device.alloc_zeroed(max_batch * numel))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "[Graph] session: {} tensors, workspace {} bytes",
            tensors.len(),
            workspace.size_in_bytes()
        );
        Ok(Session {
            workspace,
            tensors,
            handles: MathHandles::new(),
            max_batch,
        })
    }
}

// =============================================================================
// 評価
// =============================================================================

/// ストリームごとの評価状態
///
/// 評価中は `&mut` で借用されるため、1 つのワークスペースが同時に使われることはない。
#[derive(Debug)]
pub struct Session<T: Element> {
    workspace: Workspace<T>,
    tensors: Vec<DeviceBuffer<T>>,
    handles: MathHandles,
    max_batch: usize,
}

impl<T: Element> Session<T> {
    #[inline]
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// `n` 局面を評価する
    ///
    /// - `input`: `n × input_channels × H × W`（ネットワークのレイアウト）
    /// - `policy_out`: `n × policy_size`
    /// - `value_out`: `n × value_size`
    ///
    /// `n == 0` は何もしない。`n > max_batch` は契約違反。
    pub fn evaluate(
        &mut self,
        network: &Network<T>,
        n: usize,
        input: &[f32],
        policy_out: &mut [f32],
        value_out: &mut [f32],
    ) {
        if n == 0 {
            return;
        }
        assert!(n <= self.max_batch, "batch {n} exceeds max_batch {}", self.max_batch);
        assert_eq!(self.tensors.len(), network.slots.len(), "session belongs to another network");

        let in_len = n * network.slots[INPUT_SLOT];
        let policy_len = n * network.slots[network.policy_slot];
        let value_len = n * network.slots[network.value_slot];
        assert!(input.len() >= in_len, "input shorter than n * C * H * W");
        assert!(policy_out.len() >= policy_len, "policy output too small");
        assert!(value_out.len() >= value_len, "value output too small");

        trace!("[Eval] batch={n} layers={}", network.nodes.len());
        self.tensors[INPUT_SLOT].copy_from_host(&input[..in_len]);

        for node in &network.nodes {
            let mut output = mem::take(&mut self.tensors[node.output]);
            let input2 = node.input2.map(|slot| &self.tensors[slot][..]);
            node.layer.eval(
                n,
                &mut output,
                &self.tensors[node.input],
                input2,
                &mut self.workspace,
                &self.handles,
            );
            self.tensors[node.output] = output;
        }

        download(&self.tensors[network.policy_slot][..policy_len], &mut policy_out[..policy_len]);
        download(&self.tensors[network.value_slot][..value_len], &mut value_out[..value_len]);
    }
}

fn download<T: Element>(src: &[T], dst: &mut [f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = s.to_f32();
    }
}
