//! Attention masks shared by every backend
//!
//! Causal masks are cached by `(seq_len, device, dtype)`; the cache hands
//! out shallow clones. Batched steering runs reuse a handful of padded
//! lengths, so the cache stays small.
//!
//! Right-padded batches need no extra padding mask: under a causal mask a
//! real token never attends to the pad tokens that follow it.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Causal mask of shape `[1, 1, seq_len, seq_len]`: `0.0` where `j <= i`,
/// `-inf` above the diagonal.
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    {
        let cache = CAUSAL_MASK_CACHE
            .lock()
            .map_err(|_| anyhow::anyhow!("mask cache poisoned"))?;
        if let Some(cached) = cache.get(&cache_key) {
            return Ok(cached.clone());
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASK_CACHE
        .lock()
        .map_err(|_| anyhow::anyhow!("mask cache poisoned"))?
        .insert(cache_key, mask_tensor.clone());

    Ok(mask_tensor)
}

/// Mask for `new_seq_len` tokens appended after `start_pos` cached ones.
///
/// Shape `[1, 1, new_seq_len, total_seq_len]`. A single new token sees the
/// whole context, so that case is all zeros.
pub fn create_generation_mask(
    new_seq_len: usize,
    total_seq_len: usize,
    start_pos: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    if new_seq_len == 1 {
        return Ok(Tensor::zeros((1, 1, 1, total_seq_len), dtype, device)?);
    }

    let mask: Vec<f32> = (0..new_seq_len)
        .flat_map(|i| {
            let visible_up_to = start_pos + i;
            (0..total_seq_len).map(move |j| {
                if j <= visible_up_to {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();

    Ok(Tensor::from_vec(mask, (1, 1, new_seq_len, total_seq_len), device)?.to_dtype(dtype)?)
}

/// Causal mask for `new_seq_len` queries over `total_seq_len` keys.
///
/// A fresh prefill uses the cached square mask; cached steps build the
/// rectangular generation mask.
pub fn attention_mask(
    new_seq_len: usize,
    total_seq_len: usize,
    start_pos: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    if start_pos == 0 && new_seq_len == total_seq_len {
        create_causal_mask(new_seq_len, device, dtype)
    } else {
        create_generation_mask(new_seq_len, total_seq_len, start_pos, device, dtype)
    }
}

/// Causal mask that also hides keys more than `window` positions back.
///
/// Works for both prefill and cached steps: query `i` sits at absolute
/// position `start_pos + i`.
pub fn create_sliding_window_mask(
    new_seq_len: usize,
    total_seq_len: usize,
    start_pos: usize,
    window: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let mask: Vec<f32> = (0..new_seq_len)
        .flat_map(|i| {
            let q = start_pos + i;
            (0..total_seq_len).map(move |j| {
                if j > q || q - j > window {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, new_seq_len, total_seq_len), device)?.to_dtype(dtype)?)
}

/// Drop all cached causal masks
pub fn clear_mask_caches() {
    if let Ok(mut cache) = CAUSAL_MASK_CACHE.lock() {
        cache.clear();
    }
}

/// Number of cached causal masks
pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE.lock().map_or(0, |c| c.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn is_neg_inf(v: f32) -> bool {
        v.is_infinite() && v < 0.0
    }

    #[test]
    #[serial]
    fn test_causal_mask_values() {
        let mask = create_causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        assert_eq!(data[0], 0.0);
        assert!(is_neg_inf(data[1]) && is_neg_inf(data[2]));
        assert_eq!(data[3], 0.0);
        assert_eq!(data[4], 0.0);
        assert!(is_neg_inf(data[5]));
        assert!(data[6..].iter().all(|&v| v == 0.0));
    }

    #[test]
    #[serial]
    fn test_causal_mask_caching() {
        clear_mask_caches();
        let key = (37, device_id(&Device::Cpu), DType::F32);
        let cached = || CAUSAL_MASK_CACHE.lock().unwrap().contains_key(&key);
        assert!(!cached());

        let a = create_causal_mask(37, &Device::Cpu, DType::F32).unwrap();
        assert!(cached());
        assert!(mask_cache_size() >= 1);
        let b = create_causal_mask(37, &Device::Cpu, DType::F32).unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);

        clear_mask_caches();
        assert!(!cached());
    }

    #[test]
    fn test_attention_mask_prefill_matches_causal() {
        let prefill = attention_mask(3, 3, 0, &Device::Cpu, DType::F32).unwrap();
        let causal = create_generation_mask(3, 3, 0, &Device::Cpu, DType::F32).unwrap();
        let a: Vec<f32> = prefill.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = causal.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);

        let step = attention_mask(1, 4, 3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(step.dims(), &[1, 1, 1, 4]);
    }

    #[test]
    fn test_generation_mask_single_token() {
        let mask = create_generation_mask(1, 5, 4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 1, 5]);
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert!(data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_generation_mask_multi_token() {
        // 3 cached + 2 new
        let mask = create_generation_mask(2, 5, 3, &Device::Cpu, DType::F32).unwrap();
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert!(data[0..4].iter().all(|&v| v == 0.0));
        assert!(is_neg_inf(data[4]));
        assert!(data[5..10].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_sliding_window_mask() {
        let mask = create_sliding_window_mask(4, 4, 0, 1, &Device::Cpu, DType::F32).unwrap();
        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        // Row 3 sees positions 2 and 3 only
        assert!(is_neg_inf(rows[3][0]) && is_neg_inf(rows[3][1]));
        assert_eq!(rows[3][2], 0.0);
        assert_eq!(rows[3][3], 0.0);
        // Row 0 sees itself only
        assert_eq!(rows[0][0], 0.0);
        assert!(is_neg_inf(rows[0][1]));
    }
}
