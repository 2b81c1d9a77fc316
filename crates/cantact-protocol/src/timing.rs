//! 位定时求解
//!
//! 由目标波特率和设备 BT_CONST 约束计算 `DeviceBitTiming`，采样点目标 87.5%。

use crate::ProtocolError;
use crate::gs_usb::{DeviceBitTiming, DeviceCapability};

/// 目标采样点（千分比）
pub const DEFAULT_SAMPLE_POINT_PERMILLE: u32 = 875;

/// 设备位定时约束（tseg1 = prop_seg + phase_seg1）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimingLimits {
    pub fclk_can: u32,
    pub tseg1_min: u32,
    pub tseg1_max: u32,
    pub tseg2_min: u32,
    pub tseg2_max: u32,
    pub sjw_max: u32,
    pub brp_min: u32,
    pub brp_max: u32,
    pub brp_inc: u32,
}

impl From<&DeviceCapability> for TimingLimits {
    fn from(cap: &DeviceCapability) -> Self {
        Self {
            fclk_can: cap.fclk_can,
            tseg1_min: cap.tseg1_min,
            tseg1_max: cap.tseg1_max,
            tseg2_min: cap.tseg2_min,
            tseg2_max: cap.tseg2_max,
            sjw_max: cap.sjw_max,
            brp_min: cap.brp_min,
            brp_max: cap.brp_max,
            brp_inc: cap.brp_inc,
        }
    }
}

impl TimingLimits {
    /// 检查一组位定时是否落在设备约束内
    pub fn check(&self, timing: &DeviceBitTiming) -> bool {
        let Some(tseg1) = timing.prop_seg.checked_add(timing.phase_seg1) else {
            return false;
        };
        let brp_step = self.brp_inc.max(1);
        (self.tseg1_min..=self.tseg1_max).contains(&tseg1)
            && (self.tseg2_min..=self.tseg2_max).contains(&timing.phase_seg2)
            && timing.sjw >= 1
            && timing.sjw <= self.sjw_max
            && (self.brp_min..=self.brp_max).contains(&timing.brp)
            && (timing.brp - self.brp_min) % brp_step == 0
    }
}

impl DeviceBitTiming {
    /// 按默认采样点求解
    pub fn for_bitrate(bitrate: u32, limits: &TimingLimits) -> Result<Self, ProtocolError> {
        Self::for_bitrate_with_sample_point(bitrate, DEFAULT_SAMPLE_POINT_PERMILLE, limits)
    }

    /// 遍历预分频，要求每位时间量子数为整数，选采样点误差最小的一组。
    /// 误差相同时取时间量子更多（预分频更小）的解。
    pub fn for_bitrate_with_sample_point(
        bitrate: u32,
        sample_point_permille: u32,
        limits: &TimingLimits,
    ) -> Result<Self, ProtocolError> {
        let invalid = ProtocolError::InvalidBitrate {
            bitrate,
            fclk: limits.fclk_can,
        };
        if bitrate == 0
            || sample_point_permille == 0
            || sample_point_permille >= 1000
            || limits.fclk_can == 0
            || limits.tseg1_min > limits.tseg1_max
            || limits.tseg2_min > limits.tseg2_max
        {
            return Err(invalid);
        }

        let min_tq = 1u32
            .saturating_add(limits.tseg1_min)
            .saturating_add(limits.tseg2_min);
        let max_tq = 1u32
            .saturating_add(limits.tseg1_max)
            .saturating_add(limits.tseg2_max);
        let step = limits.brp_inc.max(1);
        let mut best: Option<(u32, DeviceBitTiming)> = None;

        let mut brp = limits.brp_min.max(1);
        while brp <= limits.brp_max {
            let denom = u64::from(brp) * u64::from(bitrate);
            let fclk = u64::from(limits.fclk_can);
            if fclk % denom == 0 {
                let tq = (fclk / denom) as u32;
                if (min_tq..=max_tq).contains(&tq)
                    && let Some((error, timing)) =
                        Self::split_quanta(tq, brp, sample_point_permille, limits)
                    && best.as_ref().is_none_or(|(e, _)| error < *e)
                {
                    best = Some((error, timing));
                }
            }
            brp = match brp.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }

        best.map(|(_, timing)| timing).ok_or(invalid)
    }

    fn split_quanta(
        tq: u32,
        brp: u32,
        sample_point_permille: u32,
        limits: &TimingLimits,
    ) -> Option<(u32, DeviceBitTiming)> {
        let target = (u64::from(tq) * u64::from(sample_point_permille) + 500) / 1000;
        let target = u32::try_from(target).ok()?;
        let mut tseg1 = target
            .saturating_sub(1)
            .clamp(limits.tseg1_min, limits.tseg1_max);
        let mut tseg2 = tq.checked_sub(1)?.checked_sub(tseg1)?;
        if tseg2 < limits.tseg2_min {
            tseg2 = limits.tseg2_min;
            tseg1 = tq.checked_sub(1)?.checked_sub(tseg2)?;
        } else if tseg2 > limits.tseg2_max {
            tseg2 = limits.tseg2_max;
            tseg1 = tq.checked_sub(1)?.checked_sub(tseg2)?;
        }
        if !(limits.tseg1_min..=limits.tseg1_max).contains(&tseg1) {
            return None;
        }

        let prop_seg = tseg1 / 2;
        let timing = DeviceBitTiming {
            prop_seg,
            phase_seg1: tseg1 - prop_seg,
            phase_seg2: tseg2,
            sjw: tseg2.min(limits.sjw_max).max(1),
            brp,
        };
        let error = timing.sample_point_permille().abs_diff(sample_point_permille);
        Some((error, timing))
    }

    /// 实际采样点（千分比）
    pub fn sample_point_permille(&self) -> u32 {
        let quanta = self.quanta_per_bit();
        if quanta == 0 {
            return 0;
        }
        let tseg1 = 1 + u64::from(self.prop_seg) + u64::from(self.phase_seg1);
        u32::try_from(tseg1 * 1000 / u64::from(quanta)).unwrap_or(u32::MAX)
    }
}
