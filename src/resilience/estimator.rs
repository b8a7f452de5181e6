//! Unit cost estimation for translation text.

use crate::errors::{ErrorKind, QwenError, QwenResult};

/// Characters per unit for CJK scripts.
const CJK_CHARS_PER_UNIT: u64 = 2;

/// Characters per unit for everything else.
const OTHER_CHARS_PER_UNIT: u64 = 4;

fn is_cjk(c: char) -> bool {
    matches!(
        c,
        '\u{4E00}'..='\u{9FFF}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{3040}'..='\u{309F}'
            | '\u{30A0}'..='\u{30FF}'
    )
}

/// Approximates the unit cost of translating `text`.
///
/// CJK ideographs and kana are charged at two characters per unit, all other
/// characters at four. Non-empty text always costs at least one unit; empty
/// text costs nothing.
pub fn estimate_units(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let (cjk, other) = text.chars().fold((0u64, 0u64), |(cjk, other), c| {
        if is_cjk(c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });

    let units = cjk.div_ceil(CJK_CHARS_PER_UNIT) + other.div_ceil(OTHER_CHARS_PER_UNIT);
    units.max(1)
}

/// Cost argument to admission: explicit units or text to estimate.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitCost {
    /// Explicit unit count. Must be finite and non-negative.
    Units(f64),
    /// Text whose cost is estimated.
    Text(String),
}

impl UnitCost {
    /// Resolves to a whole unit count, rounding fractional counts up.
    pub fn resolve(&self) -> QwenResult<u64> {
        match self {
            UnitCost::Text(text) => Ok(estimate_units(text)),
            UnitCost::Units(units) if units.is_finite() && *units >= 0.0 => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Ok(units.ceil() as u64)
            }
            UnitCost::Units(units) => Err(QwenError::new(ErrorKind::InvalidUnits {
                value: units.to_string(),
            })),
        }
    }
}

impl From<u32> for UnitCost {
    fn from(units: u32) -> Self {
        UnitCost::Units(f64::from(units))
    }
}

impl From<u64> for UnitCost {
    #[allow(clippy::cast_precision_loss)]
    fn from(units: u64) -> Self {
        UnitCost::Units(units as f64)
    }
}

impl From<f64> for UnitCost {
    fn from(units: f64) -> Self {
        UnitCost::Units(units)
    }
}

impl From<&str> for UnitCost {
    fn from(text: &str) -> Self {
        UnitCost::Text(text.to_string())
    }
}

impl From<String> for UnitCost {
    fn from(text: String) -> Self {
        UnitCost::Text(text)
    }
}
