use crate::error::{Result, TranslateError};

use rayon::prelude::*;
use wide::f32x8;

// Some helper functions

pub fn slice_to_u32(slice: &[u8]) -> u32 {
    assert!(slice.len() == 4, "Slice must be exactly 4 bytes long");
    u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]])
}

pub fn slice_to_f32(slice: &[u8]) -> f32 {
    assert!(slice.len() == 4, "Slice must be exactly 4 bytes long");
    f32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]])
}

/// Bounds-checked `u32` read, advancing `offset`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes = take(data, offset, 4)?;
    Ok(slice_to_u32(bytes))
}

pub fn read_f32(data: &[u8], offset: &mut usize) -> Result<f32> {
    let bytes = take(data, offset, 4)?;
    Ok(slice_to_f32(bytes))
}

/// Bounds-checked byte run, advancing `offset`.
pub fn take<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = offset.checked_add(len).filter(|end| *end <= data.len());

    match end {
        Some(end) => {
            let bytes = &data[*offset..end];
            *offset = end;
            Ok(bytes)
        }
        None => Err(TranslateError::Corrupt {
            offset: *offset,
            reason: format!("need {} bytes, {} left", len, data.len().saturating_sub(*offset)),
        }),
    }
}

pub fn u8_to_f32_slice(data: &[u8]) -> Result<&[f32]> {
    let (prefix, f32data, suffix) = unsafe { data.align_to::<f32>() };
    if !prefix.is_empty() || !suffix.is_empty() {
        return Err(TranslateError::Corrupt {
            offset: prefix.len(),
            reason: String::from("f32 payload is not aligned"),
        });
    }
    Ok(f32data)
}

// Functions used in NNs

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let n_simd = n / 8;

    let mut sum = f32x8::ZERO;

    for j in 0..n_simd {
        let a_vec = f32x8::from(&a[j * 8..j * 8 + 8]);
        let b_vec = f32x8::from(&b[j * 8..j * 8 + 8]);
        sum += a_vec * b_vec;
    }

    let mut total = sum.reduce_add();

    for j in n_simd * 8..n {
        total += a[j] * b[j];
    }

    total
}

/// `xout = W x` with `W` row-major `[xout.len(), x.len()]`.
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32]) {
    let n = x.len();
    debug_assert_eq!(w.len(), xout.len() * n);

    xout.par_iter_mut().enumerate().for_each(|(i, val)| {
        *val = dot(&w[i * n..i * n + n], x);
    });
}

pub fn layer_norm(o: &mut [f32], x: &[f32], gamma: &[f32], beta: &[f32], eps: f32) {
    let size = x.len();
    let n_simd = size / 8;

    let mut sum_sim = f32x8::ZERO;
    for j in 0..n_simd {
        sum_sim += f32x8::from(&x[j * 8..j * 8 + 8]);
    }
    let mut sum = sum_sim.reduce_add();
    for v in &x[n_simd * 8..] {
        sum += *v;
    }
    let mean = sum / size as f32;

    let mut var = 0.0f32;
    for v in x.iter() {
        var += (v - mean) * (v - mean);
    }
    let inv_std = 1.0 / (var / size as f32 + eps).sqrt();

    for j in 0..size {
        o[j] = gamma[j] * ((x[j] - mean) * inv_std) + beta[j];
    }
}

pub fn softmax(x: &mut [f32]) {
    let mut sum: f32 = 0.0;
    let mut max_val: f32 = x[0];

    for i in x.iter() {
        if *i > max_val {
            max_val = *i;
        }
    }

    for i in x.iter_mut() {
        *i = (*i - max_val).exp();
        sum += *i;
    }

    for i in x.iter_mut() {
        *i /= sum;
    }
}

pub fn log_softmax(x: &mut [f32]) {
    let mut max_val: f32 = x[0];

    for i in x.iter() {
        if *i > max_val {
            max_val = *i;
        }
    }

    let log_sum = x.iter().map(|v| (v - max_val).exp()).sum::<f32>().ln() + max_val;

    for i in x.iter_mut() {
        *i -= log_sum;
    }
}

pub fn relu(x: &mut [f32]) {
    for v in x.iter_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

pub fn add_in_place(x: &mut [f32], y: &[f32]) {
    for (a, b) in x.iter_mut().zip(y) {
        *a += *b;
    }
}
