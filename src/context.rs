//! Per render pass configuration shared by rays, extractors and ray functions.

/// Which of two competing values wins when a sample is written twice.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Preference {
    /// Keep the larger value.
    Greater,
    /// Keep the smaller value.
    Lesser,
}

/// Decides whether a new sample may replace an already valid one.
///
/// Only the designated variable is compared, all variables are then replaced
/// together.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SampleArbitrator {
    variable: usize,
    preference: Preference,
}

impl SampleArbitrator {
    /// Create a new arbitrator comparing `variable`.
    pub fn new(variable: usize, preference: Preference) -> Self {
        Self {
            variable,
            preference,
        }
    }

    /// The variable that is compared.
    pub fn variable(&self) -> usize {
        self.variable
    }

    /// Return true if `new` should replace `old`.
    pub fn should_overwrite(&self, old: f64, new: f64) -> bool {
        match self.preference {
            Preference::Greater => new > old,
            Preference::Lesser => new < old,
        }
    }
}

/// State of a single render pass.
///
/// A context is set up once before extraction and handed by reference to
/// every component that used to read it from process wide statics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderContext {
    kernel_based_sampling: bool,
    arbitrator: Option<SampleArbitrator>,
}

impl RenderContext {
    /// A context for plain (non-kernel) sampling without arbitration.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context for kernel based sampling.
    pub fn kernel_based() -> Self {
        Self {
            kernel_based_sampling: true,
            arbitrator: None,
        }
    }

    /// Enable or disable kernel based sampling.
    pub fn set_kernel_based_sampling(&mut self, flag: bool) {
        self.kernel_based_sampling = flag;
    }

    /// Set the arbitrator used for repeated plain sample writes.
    pub fn set_arbitrator(&mut self, arbitrator: Option<SampleArbitrator>) {
        self.arbitrator = arbitrator;
    }

    /// Return true if samples are accumulated with kernel weights.
    pub fn kernel_based_sampling(&self) -> bool {
        self.kernel_based_sampling
    }

    /// The current arbitrator.
    pub fn arbitrator(&self) -> Option<&SampleArbitrator> {
        self.arbitrator.as_ref()
    }
}
