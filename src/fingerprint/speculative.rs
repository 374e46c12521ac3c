//! 推测解码(speculative decoding)检测
//!
//! 基于 ITT 序列的突发比例与变异系数的启发式判断,是叠加在后端
//! 分类之上的次级低置信度信号,两者不做交叉验证。

use serde::{Deserialize, Serialize};

/// 判定至少需要的间隔数,低于此值直接报告未检出
pub const MIN_SAMPLES: usize = 20;

/// 小于该值的间隔视为一次推测命中产生的突发
const BURST_THRESHOLD_MS: f64 = 10.0;

/// 检出的加速模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeculativePattern {
    Rest,
    Eagle,
    Lade,
    Unknown,
}

impl SpeculativePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rest => "REST",
            Self::Eagle => "EAGLE",
            Self::Lade => "LADE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// 对整条流的 ITT 序列做推测解码检测
///
/// 规则按顺序匹配,首个命中生效;阈值为经验校准值,与后端档案表
/// 一样按原样保留。
pub fn detect_speculative(itt_values: &[f64]) -> Option<SpeculativePattern> {
    if itt_values.len() < MIN_SAMPLES {
        return None;
    }

    let n = itt_values.len() as f64;
    let burst_count = itt_values.iter().filter(|&&v| v < BURST_THRESHOLD_MS).count();
    let burst_ratio = burst_count as f64 / n;

    let mean = itt_values.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return None;
    }
    // 总体方差(分母 n):序列本身就是完整观测,不是抽样
    let variance = itt_values.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let cv = variance.sqrt() / mean;

    if burst_ratio > 0.3 && cv > 0.8 {
        Some(SpeculativePattern::Rest)
    } else if burst_ratio > 0.2 && cv > 0.6 {
        Some(SpeculativePattern::Eagle)
    } else if burst_ratio > 0.15 && cv > 0.5 {
        Some(SpeculativePattern::Lade)
    } else if cv > 1.0 {
        Some(SpeculativePattern::Unknown)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 样本不足 20 个时一律未检出
    #[test]
    fn test_below_min_samples() {
        let values = vec![2.0; MIN_SAMPLES - 1];
        assert_eq!(detect_speculative(&values), None);
    }

    /// 均匀间隔没有突发也没有方差,不应误报
    #[test]
    fn test_uniform_stream_not_detected() {
        let values = vec![30.0; 25];
        assert_eq!(detect_speculative(&values), None);
    }

    /// 高突发比例 + 高变异系数 => REST
    #[test]
    fn test_rest_pattern() {
        let mut values = vec![2.0; 10];
        values.extend(vec![100.0; 10]);
        assert_eq!(detect_speculative(&values), Some(SpeculativePattern::Rest));
    }

    /// 中等突发(0.25)配显著方差 => EAGLE
    #[test]
    fn test_eagle_pattern() {
        let mut values = vec![5.0; 5];
        values.extend(vec![40.0; 13]);
        values.extend(vec![150.0; 2]);
        assert_eq!(detect_speculative(&values), Some(SpeculativePattern::Eagle));
    }

    /// 低突发(0.2)配中等方差 => LADE
    #[test]
    fn test_lade_pattern() {
        let mut values = vec![5.0; 4];
        values.extend(vec![45.0; 14]);
        values.extend(vec![120.0; 2]);
        assert_eq!(detect_speculative(&values), Some(SpeculativePattern::Lade));
    }

    /// 无突发但变异系数超过 1.0 => 未知类型的加速
    #[test]
    fn test_unknown_pattern() {
        let mut values = vec![20.0; 18];
        values.extend(vec![500.0; 2]);
        assert_eq!(detect_speculative(&values), Some(SpeculativePattern::Unknown));
    }
}
