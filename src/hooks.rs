//! Hook points for activation capture and intervention
//!
//! A [`HookPoint`] names a location in the forward pass using the
//! TransformerLens convention (`blocks.{i}.hook_resid_post`, ...). A
//! [`HookSpec`] lists which points to capture and which interventions to
//! apply. Backends call [`HookSpec::run`] at every point they expose, so a
//! spec is the only way to observe or modify a forward pass.
//!
//! Specs are plain values passed into each call. Nothing is registered on
//! the model itself, so an intervention cannot outlive the call that
//! carried it.

use std::collections::HashSet;
use std::fmt;

use anyhow::Result;
use candle_core::Tensor;

use crate::cache::ActivationCache;

/// Named location in a forward pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After token (and position) embedding (`hook_embed`)
    Embed,
    /// Residual stream entering block `i` (`blocks.{i}.hook_resid_pre`)
    ResidPre(usize),
    /// Residual stream leaving block `i` (`blocks.{i}.hook_resid_post`)
    ResidPost(usize),
    /// After the final normalization (`ln_final.hook_normalized`)
    FinalNorm,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "ln_final.hook_normalized"),
        }
    }
}

/// Modification applied to the tensor flowing through a hook point.
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Add a vector, broadcast over every leading dimension
    /// (e.g. a `[d_model]` steering vector over `[batch, seq, d_model]`)
    Add(Tensor),
}

impl Intervention {
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Add(v) => Ok(x.broadcast_add(&v.to_dtype(x.dtype())?.to_device(x.device())?)?),
        }
    }
}

/// Which hook points to capture and which interventions to run.
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    captures: HashSet<HookPoint>,
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Empty spec: the forward pass runs untouched
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the residual stream after every one of `n_layers` blocks
    pub fn resid_post_all(n_layers: usize) -> Self {
        let mut spec = Self::new();
        for layer in 0..n_layers {
            spec.capture(HookPoint::ResidPost(layer));
        }
        spec
    }

    /// Request a capture at `point`
    pub fn capture(&mut self, point: HookPoint) -> &mut Self {
        self.captures.insert(point);
        self
    }

    /// Register an intervention at `point`. Several interventions at the
    /// same point run in registration order.
    pub fn intervene(&mut self, point: HookPoint, intervention: Intervention) -> &mut Self {
        self.interventions.push((point, intervention));
        self
    }

    /// True when the spec neither captures nor intervenes
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    pub fn captures(&self, point: &HookPoint) -> bool {
        self.captures.contains(point)
    }

    pub fn n_captures(&self) -> usize {
        self.captures.len()
    }

    pub fn has_interventions(&self) -> bool {
        !self.interventions.is_empty()
    }

    /// Run the hook at `point`: apply interventions, then capture the
    /// (possibly modified) tensor into `cache`.
    ///
    /// Captures see the post-intervention value, matching how a hook that
    /// returns a modified tensor behaves in TransformerLens.
    pub fn run(
        &self,
        point: &HookPoint,
        mut x: Tensor,
        cache: &mut ActivationCache,
    ) -> Result<Tensor> {
        if self.is_empty() {
            return Ok(x);
        }
        for (p, intervention) in &self.interventions {
            if p == point {
                x = intervention.apply(&x)?;
            }
        }
        if self.captures.contains(point) {
            cache.push(point.clone(), x.clone());
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_hook_point_names() {
        assert_eq!(HookPoint::ResidPost(5).to_string(), "blocks.5.hook_resid_post");
        assert_eq!(HookPoint::ResidPre(0).to_string(), "blocks.0.hook_resid_pre");
        assert_eq!(HookPoint::Embed.to_string(), "hook_embed");
        assert_eq!(HookPoint::FinalNorm.to_string(), "ln_final.hook_normalized");
    }

    #[test]
    fn test_add_broadcasts_over_batch_and_position() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 3, 4), DType::F32, &device).unwrap();
        let v = Tensor::new(&[1f32, 2.0, 3.0, 4.0], &device).unwrap();

        let mut spec = HookSpec::new();
        spec.intervene(HookPoint::ResidPost(1), Intervention::Add(v));

        let mut cache = ActivationCache::with_capacity(0);
        let untouched = spec.run(&HookPoint::ResidPost(0), x.clone(), &mut cache).unwrap();
        assert_eq!(untouched.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);

        let steered = spec.run(&HookPoint::ResidPost(1), x, &mut cache).unwrap();
        let rows: Vec<Vec<Vec<f32>>> = steered.to_vec3().unwrap();
        for batch in &rows {
            for pos in batch {
                assert_eq!(pos, &vec![1.0, 2.0, 3.0, 4.0]);
            }
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capture_sees_intervened_value() {
        let device = Device::Cpu;
        let x = Tensor::ones((1, 2, 2), DType::F32, &device).unwrap();

        let mut spec = HookSpec::new();
        spec.capture(HookPoint::ResidPost(0)).intervene(
            HookPoint::ResidPost(0),
            Intervention::Add(Tensor::new(&[1f32, 1.0], &device).unwrap()),
        );

        let mut cache = ActivationCache::with_capacity(1);
        spec.run(&HookPoint::ResidPost(0), x, &mut cache).unwrap();
        let captured = cache.get(&HookPoint::ResidPost(0)).unwrap();
        assert_eq!(captured.sum_all().unwrap().to_scalar::<f32>().unwrap(), 8.0);
    }
}
