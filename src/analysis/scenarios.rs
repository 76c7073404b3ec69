use crate::errors::{HedgeError, HedgeResult};
use crate::state::{HistoricalScenario, MarketSnapshot};
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Calm days before the crash leg.
const CALM_DAYS: i64 = 60;
/// Days after the trough.
const RECOVERY_DAYS: i64 = 60;
const CALM_DRIFT: f64 = 0.0003;
const CALM_VIX: f64 = 14.0;
const SETTLED_VIX: f64 = 20.0;
/// Share of the crash's log loss recovered by the end of the path.
const RECOVERY_SHARE: f64 = 0.4;
/// Snapshot time of day, UTC (US cash close).
const CLOSE_HOUR: u32 = 21;

/// Historical crash presets used to synthesize daily stress paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StressProfile {
    BlackMonday1987,
    DotCom2000,
    Gfc2008,
    Covid2020,
    FlashCrash2010,
    NormalCorrection,
    SevereCorrection,
}

impl StressProfile {
    pub const ALL: [StressProfile; 7] = [
        StressProfile::BlackMonday1987,
        StressProfile::DotCom2000,
        StressProfile::Gfc2008,
        StressProfile::Covid2020,
        StressProfile::FlashCrash2010,
        StressProfile::NormalCorrection,
        StressProfile::SevereCorrection,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::BlackMonday1987 => "Black Monday 1987",
            Self::DotCom2000 => "Dot-com Crash 2000",
            Self::Gfc2008 => "Financial Crisis 2008",
            Self::Covid2020 => "COVID-19 Crash 2020",
            Self::FlashCrash2010 => "Flash Crash 2010",
            Self::NormalCorrection => "Normal Correction",
            Self::SevereCorrection => "Severe Correction",
        }
    }

    /// Peak-to-trough move, negative.
    pub fn drawdown(self) -> f64 {
        match self {
            Self::BlackMonday1987 => -0.226,
            Self::DotCom2000 => -0.49,
            Self::Gfc2008 => -0.57,
            Self::Covid2020 => -0.34,
            Self::FlashCrash2010 => -0.09,
            Self::NormalCorrection => -0.10,
            Self::SevereCorrection => -0.20,
        }
    }

    /// Calendar days from peak to trough.
    pub fn crash_days(self) -> i64 {
        match self {
            Self::BlackMonday1987 | Self::FlashCrash2010 => 1,
            Self::DotCom2000 => 640,
            Self::Gfc2008 => 180,
            Self::Covid2020 => 23,
            Self::NormalCorrection => 30,
            Self::SevereCorrection => 60,
        }
    }

    pub fn peak_vix(self) -> f64 {
        match self {
            Self::BlackMonday1987 => 100.0,
            Self::DotCom2000 => 45.0,
            Self::Gfc2008 => 80.0,
            Self::Covid2020 => 82.0,
            Self::FlashCrash2010 => 40.0,
            Self::NormalCorrection => 25.0,
            Self::SevereCorrection => 35.0,
        }
    }

    /// Date the crash leg begins in the historical record.
    pub fn crash_start(self) -> NaiveDate {
        let (y, m, d) = match self {
            Self::BlackMonday1987 => (1987, 10, 16),
            Self::DotCom2000 => (2000, 3, 24),
            Self::Gfc2008 => (2008, 9, 15),
            Self::Covid2020 => (2020, 2, 19),
            Self::FlashCrash2010 => (2010, 5, 5),
            Self::NormalCorrection => (2018, 1, 26),
            Self::SevereCorrection => (2018, 9, 20),
        };
        NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
    }

    /// Stress path anchored so the crash leg starts on its historical date.
    pub fn scenario(self, start_spot: f64, rate: f64) -> HedgeResult<HistoricalScenario> {
        self.build(self.crash_start() - Duration::days(CALM_DAYS), start_spot, rate)
    }

    /// Deterministic daily path: a calm drift, a geometric crash with VIX
    /// ramping to its peak, then a partial recovery with VIX decaying.
    pub fn build(self, start: NaiveDate, start_spot: f64, rate: f64) -> HedgeResult<HistoricalScenario> {
        if !start_spot.is_finite() || start_spot <= 0.0 {
            return Err(HedgeError::Config(format!("scenario start spot must be > 0, got {start_spot}")));
        }
        if !rate.is_finite() {
            return Err(HedgeError::Config("scenario rate must be finite".into()));
        }
        let open = start
            .and_hms_opt(CLOSE_HOUR, 0, 0)
            .ok_or_else(|| HedgeError::Config(format!("invalid scenario start {start}")))?;
        let t0 = Utc.from_utc_datetime(&open);

        let crash_days = self.crash_days();
        let log_loss = (1.0 + self.drawdown()).ln();
        let peak_vix = self.peak_vix();
        let total = CALM_DAYS + crash_days + RECOVERY_DAYS;

        let mut snapshots = Vec::with_capacity(total as usize + 1);
        let mut peak_spot = start_spot;
        let mut trough_spot = start_spot;

        for day in 0..=total {
            let (spot, vix) = if day <= CALM_DAYS {
                let wobble = ((day % 5) as f64 - 2.0) * 0.3;
                peak_spot = start_spot * (CALM_DRIFT * day as f64).exp();
                (peak_spot, CALM_VIX + wobble)
            } else if day <= CALM_DAYS + crash_days {
                let k = (day - CALM_DAYS) as f64 / crash_days as f64;
                trough_spot = peak_spot * (log_loss * k).exp();
                (trough_spot, CALM_VIX + (peak_vix - CALM_VIX) * k)
            } else {
                let j = (day - CALM_DAYS - crash_days) as f64;
                let k = j / RECOVERY_DAYS as f64;
                let spot = trough_spot * (-RECOVERY_SHARE * log_loss * k).exp();
                let vix = SETTLED_VIX + (peak_vix - SETTLED_VIX) * (-j / 15.0).exp();
                (spot, vix)
            };
            snapshots.push(MarketSnapshot::new(t0 + Duration::days(day), "SPX", spot, rate, vix));
        }

        tracing::debug!(
            scenario = self.label(),
            snapshots = snapshots.len(),
            trough = trough_spot,
            "synthesized stress path"
        );
        HistoricalScenario::new(self.label(), snapshots)
    }
}

impl std::fmt::Display for StressProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BlackMonday1987 => "black-monday-1987",
            Self::DotCom2000 => "dot-com-2000",
            Self::Gfc2008 => "gfc-2008",
            Self::Covid2020 => "covid-2020",
            Self::FlashCrash2010 => "flash-crash-2010",
            Self::NormalCorrection => "normal-correction",
            Self::SevereCorrection => "severe-correction",
        };
        f.write_str(s)
    }
}

impl FromStr for StressProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.to_string() == key)
            .ok_or_else(|| format!("unknown stress scenario '{s}'"))
    }
}

/// Instantaneous shock applied to entry contracts for point-in-time
/// protection ratios.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StressShock {
    /// Relative spot move, e.g. -0.20.
    pub spot_move: f64,
    /// VIX level after the shock; also the floor for shocked vol.
    pub vix: f64,
}

impl Default for StressShock {
    fn default() -> Self {
        Self {
            spot_move: -0.20,
            vix: 45.0,
        }
    }
}

impl StressShock {
    pub fn validate(&self) -> HedgeResult<()> {
        if !self.spot_move.is_finite() || self.spot_move <= -1.0 {
            return Err(HedgeError::Config(format!("stress spot move must be > -1, got {}", self.spot_move)));
        }
        if !self.vix.is_finite() || self.vix <= 0.0 {
            return Err(HedgeError::Config(format!("stress vix must be > 0, got {}", self.vix)));
        }
        Ok(())
    }
}
