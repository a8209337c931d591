//! A single ray of depth samples.
//!
//! A [Ray] is generic over its storage. Rays handed out by a
//! [crate::memory::RayPool] borrow a slot of a pool block as [RayRef] or
//! [RayMut]; a standalone ray owns its buffers.

use crate::{
    constants::VARIABLE_LIMIT,
    context::RenderContext,
    error::{bad_index, RenderError, Result},
};

/// Read access to the buffers of a ray.
pub trait RayData {
    /// Variable major values, the value of variable `v` at sample `i` is at
    /// `v * num_samples + i`.
    fn samples(&self) -> &[f64];

    /// One validity flag per sample.
    fn valid(&self) -> &[bool];

    /// Number of set validity flags.
    fn num_valid(&self) -> usize;
}

/// Write access to the buffers of a ray.
pub trait RayDataMut: RayData {
    /// Values, validity flags and the valid count at once.
    fn parts_mut(&mut self) -> (&mut [f64], &mut [bool], &mut usize);
}

/// Buffers owned by a standalone ray.
#[derive(Clone, Debug)]
pub struct OwnedRayData {
    samples: Vec<f64>,
    valid: Vec<bool>,
    num_valid: usize,
}

impl RayData for OwnedRayData {
    fn samples(&self) -> &[f64] {
        &self.samples
    }

    fn valid(&self) -> &[bool] {
        &self.valid
    }

    fn num_valid(&self) -> usize {
        self.num_valid
    }
}

impl RayDataMut for OwnedRayData {
    fn parts_mut(&mut self) -> (&mut [f64], &mut [bool], &mut usize) {
        (&mut self.samples, &mut self.valid, &mut self.num_valid)
    }
}

/// Shared borrow of a ray slot.
#[derive(Copy, Clone, Debug)]
pub struct SlotData<'a> {
    samples: &'a [f64],
    valid: &'a [bool],
    num_valid: usize,
}

impl<'a> SlotData<'a> {
    pub(crate) fn new(samples: &'a [f64], valid: &'a [bool], num_valid: usize) -> Self {
        Self {
            samples,
            valid,
            num_valid,
        }
    }
}

impl RayData for SlotData<'_> {
    fn samples(&self) -> &[f64] {
        self.samples
    }

    fn valid(&self) -> &[bool] {
        self.valid
    }

    fn num_valid(&self) -> usize {
        self.num_valid
    }
}

/// Exclusive borrow of a ray slot.
#[derive(Debug)]
pub struct SlotDataMut<'a> {
    samples: &'a mut [f64],
    valid: &'a mut [bool],
    num_valid: &'a mut usize,
}

impl<'a> SlotDataMut<'a> {
    pub(crate) fn new(
        samples: &'a mut [f64],
        valid: &'a mut [bool],
        num_valid: &'a mut usize,
    ) -> Self {
        Self {
            samples,
            valid,
            num_valid,
        }
    }
}

impl RayData for SlotDataMut<'_> {
    fn samples(&self) -> &[f64] {
        &*self.samples
    }

    fn valid(&self) -> &[bool] {
        &*self.valid
    }

    fn num_valid(&self) -> usize {
        *self.num_valid
    }
}

impl RayDataMut for SlotDataMut<'_> {
    fn parts_mut(&mut self) -> (&mut [f64], &mut [bool], &mut usize) {
        (&mut *self.samples, &mut *self.valid, &mut *self.num_valid)
    }
}

/// A column of depth samples along the line of sight of one pixel.
///
/// Each of the `num_variables` variables stores `num_samples` values. A sample
/// is only meaningful if its entry in the valid mask is set.
#[derive(Copy, Clone, Debug)]
pub struct Ray<D = OwnedRayData> {
    data: D,
    num_samples: usize,
    num_variables: usize,
}

/// A ray borrowed from a pool.
pub type RayRef<'a> = Ray<SlotData<'a>>;

/// A ray mutably borrowed from a pool.
pub type RayMut<'a> = Ray<SlotDataMut<'a>>;

impl Ray {
    /// Create a standalone ray with all samples invalid.
    pub fn new(num_samples: usize, num_variables: usize) -> Result<Self> {
        if num_variables > VARIABLE_LIMIT {
            return Err(RenderError::TooManyVariables(num_variables));
        }

        Ok(Self {
            data: OwnedRayData {
                samples: vec![0.0; num_samples * num_variables],
                valid: vec![false; num_samples],
                num_valid: 0,
            },
            num_samples,
            num_variables,
        })
    }
}

impl<D: RayData> Ray<D> {
    pub(crate) fn from_data(data: D, num_samples: usize, num_variables: usize) -> Self {
        debug_assert_eq!(data.samples().len(), num_samples * num_variables);
        debug_assert_eq!(data.valid().len(), num_samples);
        Self {
            data,
            num_samples,
            num_variables,
        }
    }

    /// Borrow the ray as a [RayRef].
    pub fn view(&self) -> RayRef<'_> {
        Ray {
            data: SlotData::new(self.data.samples(), self.data.valid(), self.data.num_valid()),
            num_samples: self.num_samples,
            num_variables: self.num_variables,
        }
    }

    /// Number of depth samples.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Number of variables per sample.
    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    /// Number of samples that are currently valid.
    pub fn num_valid_samples(&self) -> usize {
        self.data.num_valid()
    }

    /// The valid mask of the ray.
    pub fn valid_mask(&self) -> &[bool] {
        self.data.valid()
    }

    /// Return true if sample `index` is valid. Out of range indices are never valid.
    pub fn is_valid(&self, index: usize) -> bool {
        self.data.valid().get(index).copied().unwrap_or(false)
    }

    /// All values of variable `variable`, valid or not.
    pub fn variable(&self, variable: usize) -> &[f64] {
        assert!(variable < self.num_variables);
        &self.data.samples()[variable * self.num_samples..(variable + 1) * self.num_samples]
    }

    /// The value of `variable` at sample `index` regardless of validity.
    pub fn value(&self, variable: usize, index: usize) -> f64 {
        assert!(variable < self.num_variables && index < self.num_samples);
        self.data.samples()[variable * self.num_samples + index]
    }

    /// Copy sample `index` into `out` if it is valid.
    ///
    /// Returns whether the sample was valid. `out` is only written for valid samples.
    pub fn get_sample(&self, index: usize, out: &mut [f64; VARIABLE_LIMIT]) -> Result<bool> {
        if index >= self.num_samples {
            return Err(bad_index(index, self.num_samples));
        }

        if !self.data.valid()[index] {
            return Ok(false);
        }

        let samples = self.data.samples();
        for (variable, value) in out.iter_mut().take(self.num_variables).enumerate() {
            *value = samples[variable * self.num_samples + index];
        }

        Ok(true)
    }

    /// Index of the first valid sample.
    pub fn first_valid_sample(&self) -> Option<usize> {
        self.data.valid().iter().position(|&v| v)
    }

    /// The runs of consecutive valid samples as `(start, length)` pairs.
    pub fn runs(&self) -> Vec<(usize, usize)> {
        let mut runs = Vec::new();
        let mut start = None;

        for (index, &valid) in self.data.valid().iter().enumerate() {
            match (valid, start) {
                (true, None) => start = Some(index),
                (false, Some(first)) => {
                    runs.push((first, index - first));
                    start = None;
                }
                _ => (),
            }
        }

        if let Some(first) = start {
            runs.push((first, self.num_samples - first));
        }

        runs
    }

    fn longest_run(&self) -> Option<(usize, usize)> {
        // Only a strictly longer run replaces the current best, so ties go to
        // the first run.
        let mut best: Option<(usize, usize)> = None;
        for (start, len) in self.runs() {
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((start, len));
            }
        }
        best
    }

    /// First sample of the longest run of valid samples.
    pub fn first_sample_of_longest_run(&self) -> Option<usize> {
        self.longest_run().map(|(start, _)| start)
    }

    /// Last sample of the longest run of valid samples.
    pub fn last_sample_of_longest_run(&self) -> Option<usize> {
        self.longest_run().map(|(start, len)| start + len - 1)
    }
}

impl<D: RayDataMut> Ray<D> {
    /// Invalidate every sample. The sample storage itself is kept.
    pub fn reset(&mut self) {
        let (_, valid, num_valid) = self.data.parts_mut();
        valid.fill(false);
        *num_valid = 0;
    }

    /// Write all variables of sample `index`.
    ///
    /// If the sample is already valid and the context has an arbitrator, the
    /// values are only replaced when the arbitrator prefers the new ones.
    pub fn set_sample(
        &mut self,
        index: usize,
        values: &[f64],
        context: &RenderContext,
    ) -> Result<()> {
        if index >= self.num_samples {
            return Err(bad_index(index, self.num_samples));
        }
        debug_assert!(values.len() >= self.num_variables);

        if !self.mark_valid(index) {
            if let Some(arbitrator) = context.arbitrator() {
                let variable = arbitrator.variable();
                if !arbitrator.should_overwrite(self.value(variable, index), values[variable]) {
                    return Ok(());
                }
            }
        }

        self.write(index, values);
        Ok(())
    }

    /// Add a kernel weighted contribution to sample `index`.
    ///
    /// Every variable receives `weight * value` and the trailing variable of
    /// the ray accumulates `weight` itself. The ray must therefore have exactly
    /// one more variable than `values` has entries.
    pub fn accumulate_sample(&mut self, index: usize, values: &[f64], weight: f64) -> Result<()> {
        if index >= self.num_samples {
            return Err(bad_index(index, self.num_samples));
        }
        assert_eq!(values.len() + 1, self.num_variables);

        let num_samples = self.num_samples;
        let weight_variable = self.num_variables - 1;
        let fresh = self.mark_valid(index);
        let (samples, _, _) = self.data.parts_mut();

        if fresh {
            for variable in 0..=weight_variable {
                samples[variable * num_samples + index] = 0.0;
            }
        }

        for (variable, &value) in values.iter().enumerate() {
            samples[variable * num_samples + index] += weight * value;
        }
        samples[weight_variable * num_samples + index] += weight;

        Ok(())
    }

    /// Merge a sample received from another rank.
    ///
    /// In kernel mode the incoming values are still unnormalized sums, weight
    /// channel included, and are added to the local sums. Otherwise the
    /// sample is written like [Ray::set_sample] does.
    pub fn merge_sample(
        &mut self,
        index: usize,
        values: &[f64],
        context: &RenderContext,
    ) -> Result<()> {
        if !context.kernel_based_sampling() {
            return self.set_sample(index, values, context);
        }

        if index >= self.num_samples {
            return Err(bad_index(index, self.num_samples));
        }
        debug_assert!(values.len() >= self.num_variables);

        if self.mark_valid(index) {
            self.write(index, values);
        } else {
            let num_samples = self.num_samples;
            let (samples, _, _) = self.data.parts_mut();
            for (variable, &value) in values.iter().take(self.num_variables).enumerate() {
                samples[variable * num_samples + index] += value;
            }
        }

        Ok(())
    }

    // Returns true if the sample was invalid before.
    fn mark_valid(&mut self, index: usize) -> bool {
        let (_, valid, num_valid) = self.data.parts_mut();
        if valid[index] {
            return false;
        }
        valid[index] = true;
        *num_valid += 1;
        true
    }

    fn write(&mut self, index: usize, values: &[f64]) {
        let num_samples = self.num_samples;
        let num_variables = self.num_variables;
        let (samples, _, _) = self.data.parts_mut();
        for (variable, &value) in values.iter().take(num_variables).enumerate() {
            samples[variable * num_samples + index] = value;
        }
    }

    /// Turn kernel weighted sums into weighted averages.
    ///
    /// Does nothing unless the context uses kernel based sampling. Samples
    /// whose weight is not positive are left untouched.
    pub fn finalize(&mut self, context: &RenderContext) {
        if !context.kernel_based_sampling() || self.num_variables == 0 {
            return;
        }

        let num_samples = self.num_samples;
        let weight_variable = self.num_variables - 1;
        let (samples, valid, _) = self.data.parts_mut();
        let weight_offset = weight_variable * num_samples;

        for index in 0..num_samples {
            if !valid[index] {
                continue;
            }
            let weight = samples[weight_offset + index];
            if weight <= 0.0 {
                continue;
            }
            for variable in 0..weight_variable {
                samples[variable * num_samples + index] /= weight;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use assert_approx_eq::assert_approx_eq;

    use super::Ray;
    use crate::{
        constants::VARIABLE_LIMIT,
        context::{Preference, RenderContext, SampleArbitrator},
        error::RenderError,
    };

    #[test]
    fn test_reset_invalidates_all_samples() {
        let context = RenderContext::new();
        let mut ray = Ray::new(16, 2).unwrap();
        for index in (0..16).step_by(3) {
            ray.set_sample(index, &[1.0, 2.0], &context).unwrap();
        }
        assert_eq!(ray.num_valid_samples(), 6);

        ray.reset();

        let mut out = [0.0; VARIABLE_LIMIT];
        for index in 0..16 {
            assert!(!ray.get_sample(index, &mut out).unwrap());
        }
        assert_eq!(ray.num_valid_samples(), 0);
    }

    #[test]
    fn test_get_sample_out_of_range() {
        let ray = Ray::new(4, 1).unwrap();
        let mut out = [0.0; VARIABLE_LIMIT];
        assert!(matches!(
            ray.get_sample(4, &mut out),
            Err(RenderError::BadIndex { index: 4, len: 4 })
        ));
    }

    #[test]
    fn test_get_sample_leaves_output_for_invalid() {
        let context = RenderContext::new();
        let mut ray = Ray::new(4, 2).unwrap();
        ray.set_sample(1, &[3.0, 4.0], &context).unwrap();

        let mut out = [-1.0; VARIABLE_LIMIT];
        assert!(!ray.get_sample(0, &mut out).unwrap());
        assert_eq!(out[0], -1.0);

        assert!(ray.get_sample(1, &mut out).unwrap());
        assert_eq!(out[0], 3.0);
        assert_eq!(out[1], 4.0);
    }

    #[test]
    fn test_too_many_variables() {
        assert!(matches!(
            Ray::new(4, VARIABLE_LIMIT + 1),
            Err(RenderError::TooManyVariables(_))
        ));
    }

    #[test]
    fn test_longest_run() {
        let context = RenderContext::new();
        let mask = [true, false, true, true, true, false, true];
        let mut ray = Ray::new(mask.len(), 1).unwrap();
        for (index, &valid) in mask.iter().enumerate() {
            if valid {
                ray.set_sample(index, &[1.0], &context).unwrap();
            }
        }

        assert_eq!(ray.first_sample_of_longest_run(), Some(2));
        assert_eq!(ray.last_sample_of_longest_run(), Some(4));
    }

    #[test]
    fn test_longest_run_ties_and_empty() {
        let context = RenderContext::new();
        let mut ray = Ray::new(7, 1).unwrap();
        assert_eq!(ray.first_sample_of_longest_run(), None);
        assert_eq!(ray.last_sample_of_longest_run(), None);

        for index in [0, 1, 4, 5] {
            ray.set_sample(index, &[1.0], &context).unwrap();
        }
        assert_eq!(ray.first_sample_of_longest_run(), Some(0));
        assert_eq!(ray.last_sample_of_longest_run(), Some(1));
    }

    #[test]
    fn test_finalize_normalizes_by_weight() {
        let context = RenderContext::kernel_based();
        let mut ray = Ray::new(3, 3).unwrap();

        ray.accumulate_sample(0, &[2.0, 4.0], 0.5).unwrap();
        ray.accumulate_sample(0, &[4.0, 8.0], 0.25).unwrap();
        ray.accumulate_sample(2, &[1.0, 1.0], 0.0).unwrap();

        let before = [ray.value(0, 0), ray.value(1, 0)];
        let weight = ray.value(2, 0);
        assert_approx_eq!(weight, 0.75);

        ray.finalize(&context);

        assert_approx_eq!(ray.value(0, 0), before[0] / weight);
        assert_approx_eq!(ray.value(1, 0), before[1] / weight);

        // Zero weight samples are not normalizable and stay as they are.
        assert_eq!(ray.value(0, 2), 0.0);
        assert_eq!(ray.value(2, 2), 0.0);
    }

    #[test]
    fn test_finalize_needs_kernel_sampling() {
        let mut ray = Ray::new(1, 2).unwrap();
        ray.accumulate_sample(0, &[3.0], 2.0).unwrap();
        ray.finalize(&RenderContext::new());
        assert_eq!(ray.value(0, 0), 6.0);
    }

    #[test]
    fn test_arbitrator_keeps_preferred_value() {
        let mut context = RenderContext::new();
        context.set_arbitrator(Some(SampleArbitrator::new(1, Preference::Greater)));

        let mut ray = Ray::new(2, 2).unwrap();
        ray.set_sample(0, &[1.0, 5.0], &context).unwrap();
        ray.set_sample(0, &[2.0, 3.0], &context).unwrap();
        assert_eq!(ray.value(0, 0), 1.0);

        ray.set_sample(0, &[7.0, 9.0], &context).unwrap();
        assert_eq!(ray.value(0, 0), 7.0);
        assert_eq!(ray.value(1, 0), 9.0);
        assert_eq!(ray.num_valid_samples(), 1);
    }

    #[test]
    #[should_panic]
    fn test_value_past_the_last_sample() {
        let context = RenderContext::new();
        let mut ray = Ray::new(2, 2).unwrap();
        ray.set_sample(0, &[1.0, 42.0], &context).unwrap();

        // Index 2 would alias the first sample of the second variable.
        ray.value(0, 2);
    }

    #[test]
    fn test_view_shares_samples() {
        let context = RenderContext::new();
        let mut ray = Ray::new(3, 2).unwrap();
        ray.set_sample(1, &[1.5, 2.5], &context).unwrap();

        let view = ray.view();
        assert_eq!(view.num_valid_samples(), 1);
        assert_eq!(view.valid_mask(), &[false, true, false]);
        assert_eq!(view.variable(1), &[0.0, 2.5, 0.0]);
    }
}
