//! ホスト側の重み
//!
//! 重みファイルの解析は呼び出し側の責務。ここでは解析済みの f32 配列を
//! 層ごとの平坦化順のまま保持する。
//!
//! | 配列 | 並び |
//! |---|---|
//! | 畳み込みフィルタ | `[C][Cin][k][k]` |
//! | 全結合 | `[out][in]` |
//! | SE | `w1 [K][C]`, `b1 [K]`, `w2 [2C][K]`, `b2 [2C]` |
//! | ポリシーマップ | `i16`、入力の CHW 平坦化位置ごとの出力インデックス（`-1` は未使用） |

use crate::config::{NetworkConfig, PolicyHead};
use crate::error::{Error, Result};
use log::debug;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// 畳み込み（または 1x1 畳み込み）の重み
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvWeights {
    pub filter: Vec<f32>,
    pub bias: Vec<f32>,
}

/// 全結合層の重み
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FcWeights {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

/// SE ユニットの重み
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeUnitWeights {
    pub w1: Vec<f32>,
    pub b1: Vec<f32>,
    pub w2: Vec<f32>,
    pub b2: Vec<f32>,
}

/// 残差ブロック 1 個分
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResidualWeights {
    pub conv0: ConvWeights,
    pub conv1: ConvWeights,
    pub se: Option<SeUnitWeights>,
}

/// ポリシーヘッド
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyHeadWeights {
    Convolution {
        conv1: ConvWeights,
        conv2: ConvWeights,
        map: Vec<i16>,
    },
    Classical {
        conv: ConvWeights,
        fc: FcWeights,
    },
}

/// バリューヘッド
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueHeadWeights {
    pub conv: ConvWeights,
    pub fc1: FcWeights,
    pub fc2: FcWeights,
}

/// ネットワーク全体の重み
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkWeights {
    pub input: ConvWeights,
    pub tower: Vec<ResidualWeights>,
    pub policy: PolicyHeadWeights,
    pub value: ValueHeadWeights,
}

// =============================================================================
// 形状検証
// =============================================================================

fn check_len(name: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(Error::InvalidConfig(format!(
            "{name}: expected {expected} values, got {actual}"
        )));
    }
    Ok(())
}

impl ConvWeights {
    fn check(&self, name: &str, c: usize, c_in: usize, k: usize) -> Result<()> {
        check_len(&format!("{name}.filter"), self.filter.len(), c * c_in * k * k)?;
        check_len(&format!("{name}.bias"), self.bias.len(), c)
    }
}

impl FcWeights {
    fn check(&self, name: &str, outputs: usize, inputs: usize) -> Result<()> {
        check_len(&format!("{name}.weights"), self.weights.len(), outputs * inputs)?;
        check_len(&format!("{name}.bias"), self.bias.len(), outputs)
    }
}

impl SeUnitWeights {
    fn check(&self, name: &str, c: usize, k: usize) -> Result<()> {
        check_len(&format!("{name}.w1"), self.w1.len(), k * c)?;
        check_len(&format!("{name}.b1"), self.b1.len(), k)?;
        check_len(&format!("{name}.w2"), self.w2.len(), 2 * c * k)?;
        check_len(&format!("{name}.b2"), self.b2.len(), 2 * c)
    }
}

impl NetworkWeights {
    /// 構成と配列長が一致するか検証
    pub fn check(&self, config: &NetworkConfig) -> Result<()> {
        let f = config.filters;
        let plane = config.board_size * config.board_size;

        self.input.check("input", f, config.input_channels, 3)?;
        check_len("tower", self.tower.len(), config.blocks)?;
        for (i, block) in self.tower.iter().enumerate() {
            block.conv0.check(&format!("tower[{i}].conv0"), f, f, 3)?;
            block.conv1.check(&format!("tower[{i}].conv1"), f, f, 3)?;
            match (&block.se, config.se) {
                (Some(se), true) => se.check(&format!("tower[{i}].se"), f, config.se_channels)?,
                (None, false) => {}
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "tower[{i}]: SE weights do not match se = {}",
                        config.se
                    )));
                }
            }
        }

        match (&self.policy, config.policy_head) {
            (PolicyHeadWeights::Convolution { conv1, conv2, map }, PolicyHead::Convolution) => {
                conv1.check("policy.conv1", f, f, 3)?;
                conv2.check("policy.conv2", config.policy_conv_channels, f, 3)?;
                let used = config.policy_used_channels * plane;
                if map.len() < used {
                    return Err(Error::InvalidConfig(format!(
                        "policy.map: expected at least {used} entries, got {}",
                        map.len()
                    )));
                }
                if let Some(&bad) = map[..used]
                    .iter()
                    .find(|&&v| v >= 0 && v as usize >= config.policy_size)
                {
                    return Err(Error::InvalidConfig(format!(
                        "policy.map: index {bad} out of range for policy_size {}",
                        config.policy_size
                    )));
                }
            }
            (PolicyHeadWeights::Classical { conv, fc }, PolicyHead::Classical) => {
                conv.check("policy.conv", config.policy_channels, f, 1)?;
                fc.check("policy.fc", config.policy_size, config.policy_channels * plane)?;
            }
            _ => {
                return Err(Error::InvalidConfig("policy head weights do not match policy_head".into()));
            }
        }

        self.value.conv.check("value.conv", config.value_channels, f, 1)?;
        self.value
            .fc1
            .check("value.fc1", config.value_fc, config.value_channels * plane)?;
        self.value.fc2.check("value.fc2", config.value_size(), config.value_fc)
    }
}

// =============================================================================
// 乱数重み（テスト・ベンチ用）
// =============================================================================

struct WeightRng {
    rng: Xoshiro256PlusPlus,
}

impl WeightRng {
    /// fan_in に応じた一様分布 [-1/sqrt(fan_in), 1/sqrt(fan_in))
    fn uniform(&mut self, len: usize, fan_in: usize) -> Vec<f32> {
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        (0..len).map(|_| self.rng.random_range(-bound..bound)).collect()
    }

    fn conv(&mut self, c: usize, c_in: usize, k: usize) -> ConvWeights {
        ConvWeights {
            filter: self.uniform(c * c_in * k * k, c_in * k * k),
            bias: self.uniform(c, c_in * k * k),
        }
    }

    fn fc(&mut self, outputs: usize, inputs: usize) -> FcWeights {
        FcWeights {
            weights: self.uniform(outputs * inputs, inputs),
            bias: self.uniform(outputs, inputs),
        }
    }

    fn se(&mut self, c: usize, k: usize) -> SeUnitWeights {
        SeUnitWeights {
            w1: self.uniform(k * c, c),
            b1: self.uniform(k, c),
            w2: self.uniform(2 * c * k, k),
            b2: self.uniform(2 * c, k),
        }
    }

    /// 有効位置をシャッフルして先頭から出力 0.. を割り当てる（重複なし）
    fn policy_map(&mut self, used: usize, padded: usize, policy_size: usize) -> Vec<i16> {
        let mut positions: Vec<usize> = (0..used).collect();
        positions.shuffle(&mut self.rng);
        let mut map = vec![-1i16; padded];
        for (out, &pos) in positions.iter().take(policy_size).enumerate() {
            map[pos] = out as i16;
        }
        map
    }
}

impl NetworkWeights {
    /// 構成に合った乱数重みを生成する（同じ seed なら同じ重み）
    pub fn random(config: &NetworkConfig, seed: u64) -> Self {
        let mut g = WeightRng {
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        };
        let f = config.filters;
        let plane = config.board_size * config.board_size;

        let input = g.conv(f, config.input_channels, 3);
        let tower = (0..config.blocks)
            .map(|_| ResidualWeights {
                conv0: g.conv(f, f, 3),
                conv1: g.conv(f, f, 3),
                se: config.se.then(|| g.se(f, config.se_channels)),
            })
            .collect();
        let policy = match config.policy_head {
            PolicyHead::Convolution => PolicyHeadWeights::Convolution {
                conv1: g.conv(f, f, 3),
                conv2: g.conv(config.policy_conv_channels, f, 3),
                map: g.policy_map(
                    config.policy_used_channels * plane,
                    config.policy_conv_channels * plane,
                    config.policy_size,
                ),
            },
            PolicyHead::Classical => PolicyHeadWeights::Classical {
                conv: g.conv(config.policy_channels, f, 1),
                fc: g.fc(config.policy_size, config.policy_channels * plane),
            },
        };
        let value = ValueHeadWeights {
            conv: g.conv(config.value_channels, f, 1),
            fc1: g.fc(config.value_fc, config.value_channels * plane),
            fc2: g.fc(config.value_size(), config.value_fc),
        };

        debug!("[Weights] generated random weights: filters={f} blocks={} seed={seed}", config.blocks);
        Self {
            input,
            tower,
            policy,
            value,
        }
    }
}
