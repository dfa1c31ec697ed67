//! Activation cache: the residual capture record of one forward pass

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};

use crate::hooks::HookPoint;

/// Tensors captured during a single forward pass, in capture order.
///
/// Backends push entries in the order they execute, so `ResidPost`
/// captures always appear in block order.
#[derive(Debug, Default)]
pub struct ActivationCache {
    entries: Vec<(HookPoint, Tensor)>,
}

impl ActivationCache {
    /// Create an empty cache with room for `n` captures
    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
        }
    }

    /// Record a captured tensor
    pub fn push(&mut self, point: HookPoint, tensor: Tensor) {
        self.entries.push((point, tensor));
    }

    /// Look up the capture for a hook point
    pub fn get(&self, point: &HookPoint) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|(p, _)| p == point)
            .map(|(_, t)| t)
    }

    /// Capture for a hook point, or an error naming the missing point
    pub fn require(&self, point: &HookPoint) -> Result<&Tensor> {
        self.get(point)
            .ok_or_else(|| anyhow::anyhow!("Hook point {point} not in cache"))
    }

    /// All `ResidPost` captures, in block order
    pub fn resid_posts(&self) -> impl Iterator<Item = (usize, &Tensor)> {
        self.entries.iter().filter_map(|(p, t)| match p {
            HookPoint::ResidPost(i) => Some((*i, t)),
            _ => None,
        })
    }

    /// Number of captured tensors
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(HookPoint, Tensor)] {
        &self.entries
    }

    /// Activation of batch row `row` at token `position`, as host f32.
    ///
    /// Captures have shape `[batch, seq_len, d_model]`.
    pub fn position_f32(&self, point: &HookPoint, row: usize, position: usize) -> Result<Vec<f32>> {
        let tensor = self.require(point)?;
        let (batch, seq_len, _) = tensor.dims3()?;
        anyhow::ensure!(row < batch, "Row {row} out of range (batch={batch})");
        anyhow::ensure!(
            position < seq_len,
            "Position {position} out of range (seq_len={seq_len})"
        );
        Ok(tensor.i((row, position))?.to_dtype(DType::F32)?.to_vec1()?)
    }
}
