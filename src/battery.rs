//! Li-ion battery state of charge.
//!
//! Percent comes from a 21-step discharge table (0% at 3270 mV, 100% at
//! 4200 mV) with linear interpolation between steps. Readings below
//! [`NO_BATTERY_MV`] mean the cell is absent and the board runs from USB.

use serde::{Deserialize, Serialize};

const STEPS: [(u8, u32); 21] = [
    (0, 3270),
    (5, 3610),
    (10, 3690),
    (15, 3710),
    (20, 3730),
    (25, 3750),
    (30, 3770),
    (35, 3790),
    (40, 3800),
    (45, 3820),
    (50, 3840),
    (55, 3850),
    (60, 3870),
    (65, 3910),
    (70, 3950),
    (75, 3980),
    (80, 4020),
    (85, 4080),
    (90, 4110),
    (95, 4150),
    (100, 4200),
];

pub const NO_BATTERY_MV: u32 = 2000;

pub fn battery_percentage(millivolts: u32) -> u8 {
    let (full_pct, full_mv) = STEPS[STEPS.len() - 1];
    let (empty_pct, empty_mv) = STEPS[0];
    if millivolts >= full_mv {
        return full_pct;
    }
    if millivolts <= empty_mv {
        return empty_pct;
    }

    for pair in STEPS.windows(2) {
        let (lo_pct, lo_mv) = pair[0];
        let (hi_pct, hi_mv) = pair[1];
        if (lo_mv..=hi_mv).contains(&millivolts) {
            let span_mv = hi_mv - lo_mv;
            let span_pct = (hi_pct - lo_pct) as u32;
            return lo_pct + ((millivolts - lo_mv) * span_pct / span_mv) as u8;
        }
    }
    0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
    pub millivolts: u32,
    pub percent: u8,
}

impl BatteryInfo {
    pub fn from_mv(millivolts: u32) -> Self {
        Self {
            millivolts,
            percent: battery_percentage(millivolts),
        }
    }

    /// Mains-powered board with no cell fitted.
    pub fn external_power() -> Self {
        Self {
            millivolts: 0,
            percent: 100,
        }
    }

    pub fn is_present(&self) -> bool {
        self.millivolts >= NO_BATTERY_MV
    }

    /// Present and below `critical_mv`: the cycle must not run.
    pub fn is_critical(&self, critical_mv: u32) -> bool {
        self.is_present() && self.millivolts < critical_mv
    }
}

impl std::fmt::Display for BatteryInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_present() {
            write!(f, "{}% ({} mV)", self.percent, self.millivolts)
        } else {
            write!(f, "external power")
        }
    }
}
