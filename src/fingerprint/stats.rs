//! ITT(inter-token time)统计引擎
//!
//! 只在流结束后的终端回调中运行,热路径不做任何统计计算。

use serde::{Deserialize, Serialize};

/// 超过此阈值的间隔视为代理卡顿/重试,不是真实的 token 间隔
const OUTLIER_THRESHOLD_MS: f64 = 5000.0;

/// 单条流(或单个阶段)的 ITT 分布统计
///
/// 不足 2 个间隔时所有字段为 0,表示"无信号"而非错误。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IttStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub variance_coef: f64,
}

impl IttStats {
    /// 从毫秒间隔序列计算统计量
    ///
    /// 先剔除 >= 5000ms 的离群值;若剔除后不足 2 个样本则回退到
    /// 未过滤的序列。mean/std/min/max/percentile 保留 2 位小数,
    /// variance_coef 保留 3 位。
    pub fn from_deltas(deltas: &[f64]) -> Self {
        if deltas.len() < 2 {
            return Self::default();
        }

        let filtered: Vec<f64> = deltas
            .iter()
            .copied()
            .filter(|&d| d < OUTLIER_THRESHOLD_MS)
            .collect();
        let samples: &[f64] = if filtered.len() < 2 { deltas } else { &filtered };

        let n = samples.len();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let std = if n > 1 {
            let var = samples.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };

        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        // 最近秩百分位:索引为 n*q 向下取整,钳制在 n-1 内
        let percentile = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];

        Self {
            mean: round_dp(mean, 2),
            std: round_dp(std, 2),
            min: round_dp(sorted[0], 2),
            max: round_dp(sorted[n - 1], 2),
            p50: round_dp(percentile(0.50), 2),
            p90: round_dp(percentile(0.90), 2),
            p99: round_dp(percentile(0.99), 2),
            variance_coef: if mean > 0.0 { round_dp(std / mean, 3) } else { 0.0 },
        }
    }
}

/// 在按时间排序的副本上计算相邻正间隔(ms)
///
/// 原始序列的追加顺序不被修改;非正间隔(时钟回拨或同刻事件)被丢弃。
pub fn positive_deltas(timestamps_ms: &[f64]) -> Vec<f64> {
    if timestamps_ms.len() < 2 {
        return Vec::new();
    }
    let mut sorted = timestamps_ms.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|&d| d > 0.0)
        .collect()
}

/// 四舍五入到指定小数位
pub fn round_dp(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 不足 2 个间隔时返回全零统计
    #[test]
    fn test_too_few_deltas_returns_zero() {
        assert_eq!(IttStats::from_deltas(&[]), IttStats::default());
        assert_eq!(IttStats::from_deltas(&[42.0]), IttStats::default());
    }

    #[test]
    fn test_basic_stats() {
        let stats = IttStats::from_deltas(&[40.0, 50.0]);
        assert_eq!(stats.mean, 45.0);
        // 样本标准差: sqrt(((40-45)^2+(50-45)^2)/1) = sqrt(50)
        assert_eq!(stats.std, 7.07);
        assert_eq!(stats.min, 40.0);
        assert_eq!(stats.max, 50.0);
        assert_eq!(stats.variance_coef, 0.157);
    }

    /// 离群间隔(>=5000ms)被剔除后再计算
    #[test]
    fn test_outlier_filtered() {
        let stats = IttStats::from_deltas(&[40.0, 42.0, 44.0, 6000.0]);
        assert_eq!(stats.mean, 42.0);
        assert_eq!(stats.max, 44.0);
    }

    /// 剔除后不足 2 个样本时回退到未过滤的序列
    #[test]
    fn test_outlier_filter_falls_back() {
        let stats = IttStats::from_deltas(&[30.0, 6000.0]);
        assert_eq!(stats.mean, 3015.0);
        assert_eq!(stats.max, 6000.0);
    }

    /// 最近秩百分位的取数位置
    #[test]
    fn test_percentile_indexing() {
        let deltas: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let stats = IttStats::from_deltas(&deltas);
        // n=10: p50 -> sorted[5], p90 -> sorted[9], p99 -> sorted[9]
        assert_eq!(stats.p50, 6.0);
        assert_eq!(stats.p90, 10.0);
        assert_eq!(stats.p99, 10.0);
    }

    #[test]
    fn test_positive_deltas_sorts_copy() {
        // 乱序到达:按时间排序后计算,且原序列不被改动
        let timestamps = vec![100.0, 150.0, 130.0, 190.0];
        let deltas = positive_deltas(&timestamps);
        assert_eq!(deltas, vec![30.0, 20.0, 40.0]);
        assert_eq!(timestamps, vec![100.0, 150.0, 130.0, 190.0]);
    }

    #[test]
    fn test_positive_deltas_drops_non_positive() {
        let deltas = positive_deltas(&[100.0, 100.0, 140.0]);
        assert_eq!(deltas, vec![40.0]);
        assert!(positive_deltas(&[100.0]).is_empty());
    }

    #[test]
    fn test_round_dp() {
        assert_eq!(round_dp(1.2345, 2), 1.23);
        assert_eq!(round_dp(1.235, 1), 1.2);
        assert_eq!(round_dp(0.15678, 3), 0.157);
    }
}
