use std::fmt;
use std::str::FromStr;

use crate::error::ConfigurationError;

pub const DEFAULT_SAMPLE_RATE: f64 = 0.01;
pub const DEFAULT_ALLOCATION_RETAIN_RATE: f64 = 1.0;
pub const DEFAULT_MAX_ALLOCATION_SAMPLES: usize = 10_000;
pub const DEFAULT_MAX_HEAP_SAMPLES: usize = 50_000;
pub const DEFAULT_BACKTRACE_METHOD: BacktraceMethod = BacktraceMethod::Fast;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Fraction of allocations that are sampled at all.
    pub sample_rate: f64,
    /// Fraction of sampled allocations kept in the allocation ledger once
    /// their size is known.
    pub allocation_retain_rate: f64,
    pub max_allocation_samples: usize,
    pub max_heap_samples: usize,
    pub backtrace_method: BacktraceMethod,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            allocation_retain_rate: DEFAULT_ALLOCATION_RETAIN_RATE,
            max_allocation_samples: DEFAULT_MAX_ALLOCATION_SAMPLES,
            max_heap_samples: DEFAULT_MAX_HEAP_SAMPLES,
            backtrace_method: DEFAULT_BACKTRACE_METHOD,
        }
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        Rate::new("sample_rate", self.sample_rate)?;
        Rate::new("allocation_retain_rate", self.allocation_retain_rate)?;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BacktraceMethod {
    /// Walk the interpreter's control frames directly.
    Fast,
    /// Ask the runtime for its own backtrace objects. Slower, and allocates.
    Slow,
}

impl FromStr for BacktraceMethod {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" | "cfp" => Ok(Self::Fast),
            "slow" | "slowrb" => Ok(Self::Slow),
            _ => Err(ConfigurationError::UnknownBacktraceMethod(s.to_owned())),
        }
    }
}

impl fmt::Display for BacktraceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::Slow => f.write_str("slow"),
        }
    }
}

/// A probability in [0, 1] quantized to a 32-bit fixed-point fraction, so a
/// sampling decision is one integer comparison against a random `u32`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rate(u32);

impl Rate {
    pub const NEVER: Rate = Rate(0);
    pub const ALWAYS: Rate = Rate(u32::MAX);

    pub fn new(name: &'static str, value: f64) -> Result<Self, ConfigurationError> {
        // NaN fails the range check too
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigurationError::RateOutOfRange { name, value });
        }
        Ok(Rate((value * u32::MAX as f64) as u32))
    }

    pub fn from_bits(bits: u32) -> Self {
        Rate(bits)
    }

    pub fn to_bits(self) -> u32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / u32::MAX as f64
    }

    /// Whether a uniform random draw passes this rate. The end points are
    /// exact: 0 never passes, 1 always does.
    pub fn admits(self, draw: u32) -> bool {
        match self.0 {
            0 => false,
            u32::MAX => true,
            threshold => draw <= threshold,
        }
    }
}
