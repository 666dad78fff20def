//! Humidity corrections that map raw PM2.5 (cf_1) onto FEM-equivalent values.

use crate::breakpoints::round_to_tenth;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalRegime {
    pub concentration: f64,
    pub humidity: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighRegime {
    pub linear: f64,
    pub quadratic: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionTable {
    pub name: &'static str,
    /// Concentrations above this use the high regime, when there is one.
    pub breakpoint: f64,
    pub normal: NormalRegime,
    pub high: Option<HighRegime>,
}

/// `0.52 * pm - 0.086 * rh + 5.75`, switching to a quadratic fit above 343.
pub const EPA_2021: CorrectionTable = CorrectionTable {
    name: "epa-2021",
    breakpoint: 343.0,
    normal: NormalRegime {
        concentration: 0.52,
        humidity: -0.086,
        offset: 5.75,
    },
    high: Some(HighRegime {
        linear: 0.46,
        quadratic: 3.93e-4,
        offset: 2.97,
    }),
};

pub const EPA_2020: CorrectionTable = CorrectionTable {
    name: "epa-2020",
    breakpoint: f64::INFINITY,
    normal: NormalRegime {
        concentration: 0.534,
        humidity: -0.0844,
        offset: 5.604,
    },
    high: None,
};

pub const TABLES: &[&CorrectionTable] = &[&EPA_2021, &EPA_2020];

impl CorrectionTable {
    pub fn by_name(name: &str) -> Option<&'static CorrectionTable> {
        TABLES.iter().copied().find(|table| table.name == name)
    }

    /// Corrected concentration, floored at zero and rounded to one decimal.
    ///
    /// Returns `None` for non-finite inputs or humidity outside 0-100 %.
    pub fn correct(&self, pm2_5: f64, humidity: f64) -> Option<f64> {
        if !pm2_5.is_finite() || !humidity.is_finite() {
            return None;
        }

        if !(0.0..=100.0).contains(&humidity) {
            return None;
        }

        let corrected = match self.high {
            Some(high) if pm2_5 > self.breakpoint => {
                high.linear * pm2_5 + high.quadratic * pm2_5 * pm2_5 + high.offset
            }
            _ => {
                self.normal.concentration * pm2_5
                    + self.normal.humidity * humidity
                    + self.normal.offset
            }
        };

        Some(round_to_tenth(corrected.max(0.0)))
    }
}
