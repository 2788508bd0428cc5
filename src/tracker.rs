//! Running extremum tracking for derived sensors

use serde::{Deserialize, Serialize};

/// Comparison rule for a derived sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Min,
    Max,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Min => "min",
            Mode::Max => "max",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "min" => Some(Mode::Min),
            "max" => Some(Mode::Max),
            _ => None,
        }
    }
}

/// Holds the running minimum or maximum for the current period.
///
/// Pure comparison state: no timing, no notification, no persistence.
/// The surrounding instance decides when samples arrive and when the
/// period rolls over.
#[derive(Debug, Clone)]
pub struct ValueTracker {
    mode: Mode,
    extremum: Option<f64>,
}

impl ValueTracker {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            extremum: None,
        }
    }

    /// Feed one sample. Returns true when the extremum moved.
    ///
    /// The first sample of a period always moves it. Equal values never
    /// count as a change.
    pub fn update(&mut self, value: f64) -> bool {
        match self.extremum {
            None => {
                self.extremum = Some(value);
                true
            }
            Some(current) => {
                let replaces = match self.mode {
                    Mode::Min => value < current,
                    Mode::Max => value > current,
                };
                if replaces {
                    self.extremum = Some(value);
                }
                replaces
            }
        }
    }

    /// Clear the extremum back to absent (start of a new period).
    pub fn reset(&mut self) {
        self.extremum = None;
    }

    pub fn value(&self) -> Option<f64> {
        self.extremum
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Seed the extremum directly (snapshot restore path).
    pub fn seed(&mut self, value: Option<f64>) {
        self.extremum = value;
    }
}
