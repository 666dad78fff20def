//! Rolling-window NowCast AQI with EPA PM2.5 correction, plus the dual-laser
//! confidence classifier that decides which channel values feed it.

pub mod breakpoints;
pub mod confidence;
pub mod correction;
pub mod history;
pub mod nowcast;

pub use breakpoints::{AqiBreakpoint, BreakpointTable};
pub use confidence::{DivergenceThresholds, classify, classify_with, select_value};
pub use correction::CorrectionTable;
pub use history::{HistoryBucket, RollingHistory, Sample};
pub use nowcast::{NowCastCalculator, NowCastEstimate, NowCastSettings, Pm25Reading};
