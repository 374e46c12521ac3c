//! 后端硬件分类器
//!
//! 对照固定档案表给时序/吞吐签名打分,输出可解释的启发式结论,
//! 不是训练出来的分类器,确定性和可审计性优先于精度。

use serde::{Deserialize, Serialize};

use super::stats::{IttStats, round_dp};

/// 单个后端档案:ITT 区间、吞吐区间、方差系数区间
pub struct BackendProfile {
    pub key: &'static str,
    pub display_name: &'static str,
    pub location: &'static str,
    pub itt_range: (f64, f64),
    pub tps_range: (f64, f64),
    pub variance_range: (f64, f64),
}

/// 经验校准数据,调整前需要重新采样验证,不要凭直觉改动
pub const BACKEND_PROFILES: &[BackendProfile] = &[
    BackendProfile {
        key: "trainium",
        display_name: "AWS Trainium",
        location: "US-East (Indiana/PA)",
        itt_range: (35.0, 70.0),
        tps_range: (8.0, 25.0),
        variance_range: (0.15, 0.35),
    },
    BackendProfile {
        key: "tpu",
        display_name: "Google TPU",
        location: "GCP",
        itt_range: (25.0, 50.0),
        tps_range: (12.0, 30.0),
        variance_range: (0.10, 0.25),
    },
    BackendProfile {
        key: "gpu",
        display_name: "Standard GPU",
        location: "Various",
        itt_range: (50.0, 120.0),
        tps_range: (5.0, 15.0),
        variance_range: (0.20, 0.50),
    },
];

/// 分类结果,evidence 保留各维度打分依据供事后审计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub backend: String,
    pub confidence: f64,
    pub location: String,
    pub evidence: Vec<String>,
}

impl Classification {
    fn unknown() -> Self {
        Self {
            backend: "unknown".to_string(),
            confidence: 0.0,
            location: "unknown".to_string(),
            evidence: Vec::new(),
        }
    }
}

/// 区间中心打分:区间内按到中心的距离线性衰减,区间外按相对偏移衰减到 0
fn range_score(value: f64, range: (f64, f64)) -> f64 {
    let (lo, hi) = range;
    if value >= lo && value <= hi {
        let center = (lo + hi) / 2.0;
        1.0 - (value - center).abs() / (hi - lo)
    } else if value < lo {
        (1.0 - (lo - value) / lo).max(0.0)
    } else {
        (1.0 - (value - hi) / hi).max(0.0)
    }
}

/// 按 50% ITT + 30% 吞吐 + 20% 方差的权重对所有档案打分,取最高者
///
/// ITT 均值为 0 说明没有可用时序数据,直接短路返回 unknown
/// 而不是对噪声打分。
pub fn classify_backend(itt: &IttStats, tps: f64) -> Classification {
    if itt.mean == 0.0 {
        return Classification::unknown();
    }

    let mut best: Option<(f64, &BackendProfile, Vec<String>)> = None;
    for profile in BACKEND_PROFILES {
        let itt_score = range_score(itt.mean, profile.itt_range);
        let tps_score = if tps > 0.0 {
            range_score(tps, profile.tps_range)
        } else {
            0.0
        };
        let (var_lo, var_hi) = profile.variance_range;
        let var_in_band = itt.variance_coef >= var_lo && itt.variance_coef <= var_hi;
        let var_score = if var_in_band { 1.0 } else { 0.5 };

        let score = itt_score * 0.5 + tps_score * 0.3 + var_score * 0.2;
        let evidence = vec![
            format!(
                "itt {:.1}ms vs {:.0}-{:.0} => {:.2}",
                itt.mean, profile.itt_range.0, profile.itt_range.1, itt_score
            ),
            format!(
                "tps {:.1} vs {:.0}-{:.0} => {:.2}",
                tps, profile.tps_range.0, profile.tps_range.1, tps_score
            ),
            format!(
                "var {:.3} {} {:.2}-{:.2} => {:.2}",
                itt.variance_coef,
                if var_in_band { "in" } else { "outside" },
                var_lo,
                var_hi,
                var_score
            ),
        ];

        // 同分保留先出现的档案
        if best.as_ref().is_none_or(|(s, _, _)| score > *s) {
            best = Some((score, profile, evidence));
        }
    }

    // 档案表非空,best 必有值
    let (score, profile, evidence) = best.expect("backend profile table is empty");
    Classification {
        backend: profile.key.to_string(),
        confidence: round_dp(score * 100.0, 1),
        location: profile.location.to_string(),
        evidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_with(mean: f64, variance_coef: f64) -> IttStats {
        IttStats {
            mean,
            variance_coef,
            ..IttStats::default()
        }
    }

    /// 无时序数据时必须短路到 unknown,不能对零值打分
    #[test]
    fn test_zero_itt_mean_short_circuits() {
        let result = classify_backend(&stats_with(0.0, 0.0), 100.0);
        assert_eq!(result.backend, "unknown");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.location, "unknown");
        assert!(result.evidence.is_empty());
    }

    /// 三个维度全部落在 trainium 中心时得满分
    #[test]
    fn test_perfect_trainium_match() {
        let result = classify_backend(&stats_with(52.5, 0.25), 16.5);
        assert_eq!(result.backend, "trainium");
        assert_eq!(result.confidence, 100.0);
        assert_eq!(result.location, "US-East (Indiana/PA)");
        assert_eq!(result.evidence.len(), 3);
    }

    /// 43ms 左右的 ITT 配高吞吐应当偏向 tpu
    #[test]
    fn test_mid_itt_leans_tpu() {
        let result = classify_backend(&stats_with(43.0, 0.05), 23.0);
        assert_eq!(result.backend, "tpu");
        assert!(result.confidence > 70.0);
    }

    /// 慢且高方差的签名落到 gpu
    #[test]
    fn test_slow_high_variance_leans_gpu() {
        let result = classify_backend(&stats_with(95.0, 0.4), 7.0);
        assert_eq!(result.backend, "gpu");
        assert_eq!(result.location, "Various");
    }

    /// 吞吐为 0 时该维度得 0 分,但仍可分类
    #[test]
    fn test_zero_tps_still_classifies() {
        let result = classify_backend(&stats_with(43.0, 0.2), 0.0);
        assert_ne!(result.backend, "unknown");
    }

    #[test]
    fn test_range_score_shape() {
        // 中心满分,边缘半分
        assert_eq!(range_score(50.0, (40.0, 60.0)), 1.0);
        assert_eq!(range_score(40.0, (40.0, 60.0)), 0.5);
        // 区间外按相对偏移衰减
        assert!(range_score(15.0, (40.0, 60.0)) < 0.5);
        assert_eq!(range_score(120.0, (40.0, 60.0)), 0.0);
    }
}
