//! KV-cache for autoregressive generation
//!
//! Each layer keeps the keys and values of every position seen so far,
//! laid out as `[batch, num_kv_heads, seq_len, head_dim]`. A generation
//! step then only runs the newest token through the model.
//!
//! A cache belongs to exactly one generation call. Steered and unsteered
//! runs use separate caches, so keys computed under a steering hook never
//! feed an unsteered continuation.

use anyhow::Result;
use candle_core::Tensor;

/// Borrowed (keys, values) slots of a single layer
pub type LayerKv<'a> = (&'a mut Option<Tensor>, &'a mut Option<Tensor>);

/// Append this step's keys/values to a layer slot and return the full
/// sequence. Without a slot the inputs pass through unchanged.
pub fn append_kv(slot: Option<LayerKv<'_>>, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
    let Some((cache_k, cache_v)) = slot else {
        return Ok((k, v));
    };
    let (k, v) = match (cache_k.as_ref(), cache_v.as_ref()) {
        (Some(prev_k), Some(prev_v)) => (
            Tensor::cat(&[prev_k, &k], 2)?,
            Tensor::cat(&[prev_v, &v], 2)?,
        ),
        _ => (k, v),
    };
    *cache_k = Some(k.clone());
    *cache_v = Some(v.clone());
    Ok((k, v))
}

/// Per-layer key/value storage
#[derive(Debug, Clone)]
pub struct KVCache {
    /// Cached keys per layer
    pub keys: Vec<Option<Tensor>>,
    /// Cached values per layer
    pub values: Vec<Option<Tensor>>,
}

impl KVCache {
    /// Empty cache for `n_layers` blocks
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Number of cached positions (0 when empty)
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(|k| k.as_ref())
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(Option::is_none)
    }

    pub fn n_layers(&self) -> usize {
        self.keys.len()
    }

    /// Drop every cached tensor
    pub fn clear(&mut self) {
        self.keys.iter_mut().for_each(|k| *k = None);
        self.values.iter_mut().for_each(|v| *v = None);
    }

    /// Mutable (keys, values) slots for one layer
    pub fn layer_mut(&mut self, layer: usize) -> (&mut Option<Tensor>, &mut Option<Tensor>) {
        (&mut self.keys[layer], &mut self.values[layer])
    }

    /// Bytes held by cached tensors
    pub fn memory_usage(&self) -> usize {
        self.keys
            .iter()
            .chain(self.values.iter())
            .flatten()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

impl Default for KVCache {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_new_cache() {
        let cache = KVCache::new(12);
        assert_eq!(cache.n_layers(), 12);
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
        assert_eq!(cache.memory_usage(), 0);
    }

    #[test]
    fn test_seq_len_and_clear() {
        let device = Device::Cpu;
        let mut cache = KVCache::new(2);
        {
            let (k, v) = cache.layer_mut(1);
            *k = Some(Tensor::zeros((1, 2, 5, 4), DType::F32, &device).unwrap());
            *v = Some(Tensor::zeros((1, 2, 5, 4), DType::F32, &device).unwrap());
        }
        assert_eq!(cache.seq_len(), 5);
        assert_eq!(cache.memory_usage(), 2 * 40 * 4);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
    }

    #[test]
    fn test_append_kv_grows_along_sequence() {
        let device = Device::Cpu;
        let mut cache = KVCache::new(1);
        let step = || Tensor::ones((1, 2, 3, 4), DType::F32, &device).unwrap();

        let (k, _) = append_kv(Some(cache.layer_mut(0)), step(), step()).unwrap();
        assert_eq!(k.dim(2).unwrap(), 3);
        let (k, v) = append_kv(Some(cache.layer_mut(0)), step(), step()).unwrap();
        assert_eq!(k.dim(2).unwrap(), 6);
        assert_eq!(v.dim(2).unwrap(), 6);
        assert_eq!(cache.seq_len(), 6);

        let (k, _) = append_kv(None, step(), step()).unwrap();
        assert_eq!(k.dim(2).unwrap(), 3);
    }

    #[test]
    fn test_default() {
        let cache = KVCache::default();
        assert_eq!(cache.n_layers(), 0);
        assert!(cache.is_empty());
    }
}
