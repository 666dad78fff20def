//! Versioned concentration-to-AQI breakpoint tables.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AqiBreakpoint {
    pub concentration_low: f64,
    pub concentration_high: f64,
    pub aqi_low: f64,
    pub aqi_high: f64,
}

const fn bp(
    concentration_low: f64,
    concentration_high: f64,
    aqi_low: f64,
    aqi_high: f64,
) -> AqiBreakpoint {
    AqiBreakpoint {
        concentration_low,
        concentration_high,
        aqi_low,
        aqi_high,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakpointTable {
    pub name: &'static str,
    pub breakpoints: &'static [AqiBreakpoint],
}

/// PM2.5 (24h) table in force from 2012 until the 2024 revision, with the
/// customary 500.5-999.9 extension above the index.
pub const PM25_EPA_2012: BreakpointTable = BreakpointTable {
    name: "epa-2012",
    breakpoints: &[
        bp(0.0, 12.0, 0.0, 50.0),
        bp(12.1, 35.4, 51.0, 100.0),
        bp(35.5, 55.4, 101.0, 150.0),
        bp(55.5, 150.4, 151.0, 200.0),
        bp(150.5, 250.4, 201.0, 300.0),
        bp(250.5, 350.4, 301.0, 400.0),
        bp(350.5, 500.4, 401.0, 500.0),
        bp(500.5, 999.9, 501.0, 999.0),
    ],
};

/// PM2.5 table from the 2024 NAAQS revision. The last row carries the same
/// above-index extension as the 2012 table.
pub const PM25_EPA_2024: BreakpointTable = BreakpointTable {
    name: "epa-2024",
    breakpoints: &[
        bp(0.0, 9.0, 0.0, 50.0),
        bp(9.1, 35.4, 51.0, 100.0),
        bp(35.5, 55.4, 101.0, 150.0),
        bp(55.5, 125.4, 151.0, 200.0),
        bp(125.5, 225.4, 201.0, 300.0),
        bp(225.5, 325.4, 301.0, 500.0),
        bp(325.5, 999.9, 501.0, 999.0),
    ],
};

pub const TABLES: &[&BreakpointTable] = &[&PM25_EPA_2012, &PM25_EPA_2024];

impl BreakpointTable {
    pub fn by_name(name: &str) -> Option<&'static BreakpointTable> {
        TABLES.iter().copied().find(|table| table.name == name)
    }

    /// Map a concentration to an integer AQI value. The concentration is
    /// rounded to one decimal first so it always lands inside a row; values
    /// outside the table (or non-finite) yield `None`.
    pub fn aqi(&self, concentration: f64) -> Option<f64> {
        if !concentration.is_finite() {
            return None;
        }

        let concentration = round_to_tenth(concentration);
        let row = self.breakpoints.iter().find(|bp| {
            bp.concentration_low <= concentration && concentration <= bp.concentration_high
        })?;

        let aqi_range = row.aqi_high - row.aqi_low;
        let concentration_range = row.concentration_high - row.concentration_low;
        let aqi = (aqi_range / concentration_range) * (concentration - row.concentration_low)
            + row.aqi_low;

        Some(aqi.round())
    }
}

pub(crate) fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
