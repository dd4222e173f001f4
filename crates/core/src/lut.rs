//! Stochastic LUT evaluation and its exact gradients.
//!
//! Treating each input `x_i ∈ [0,1]` as the probability that bit `i` is set,
//! the expected table output is
//!
//! ```text
//! y = Σ_k t_k · Π_i term_i(k),   term_i(k) = bit_i(k) ? x_i : 1 − x_i
//! ```
//!
//! which is written for every `k` at once as
//! `term_i = x_i · (2·b_i − 1) + (1 − b_i)` with `b_i` the `(K,)` bit pattern.
//! Inputs and table entries are clamped to `[0,1]` on use.
//!
//! Shapes: `x` `(F, In)`, selected inputs `(F, O, N)`, table `(O, K)`,
//! output `(F, O)`, with `K = 2^N`.

use candle_core::Tensor;

use crate::error::{LutError, Result};

/// Per-input terms over every table entry, plus `∂term_i/∂x_i`.
struct Factors {
    terms: Vec<Tensor>,
    slopes: Vec<Tensor>,
}

impl Factors {
    fn new(x_sel: &Tensor, arity: usize) -> Result<Self> {
        let table_size = 1usize << arity;
        let device = x_sel.device();
        let mut terms = Vec::with_capacity(arity);
        let mut slopes = Vec::with_capacity(arity);
        for i in 0..arity {
            let bits: Vec<f32> = (0..table_size).map(|k| ((k >> i) & 1) as f32).collect();
            let bit = Tensor::from_vec(bits, (1, 1, table_size), device)?;
            let slope = bit.affine(2.0, -1.0)?;
            let offset = bit.affine(-1.0, 1.0)?;
            let xi = x_sel.narrow(2, i, 1)?;
            terms.push(xi.broadcast_mul(&slope)?.broadcast_add(&offset)?);
            slopes.push(slope);
        }
        Ok(Self { terms, slopes })
    }

    /// Product of all terms except `skip`: `(F, O, K)`.
    fn product(&self, skip: Option<usize>) -> Result<Tensor> {
        let mut rest = self
            .terms
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip)
            .map(|(_, t)| t);
        let first = rest
            .next()
            .ok_or_else(|| LutError::config("LUT needs at least two inputs"))?
            .clone();
        Ok(rest.try_fold(first, |acc, t| acc.mul(t))?)
    }
}

/// Gather the connected inputs: `(F, In)` → `(F, O, N)`, clamped to `[0,1]`.
pub(crate) fn gather_inputs(x: &Tensor, ids: &Tensor, outputs: usize, arity: usize) -> Result<Tensor> {
    let frames = x.dim(0)?;
    Ok(x
        .index_select(ids, 1)?
        .reshape((frames, outputs, arity))?
        .clamp(0f64, 1f64)?)
}

/// Scatter-add selected-input gradients back: `(F, O, N)` → `(F, In)`.
pub(crate) fn scatter_inputs(dx_sel: &Tensor, ids: &Tensor, input_nodes: usize) -> Result<Tensor> {
    let (frames, outputs, arity) = dx_sel.dims3()?;
    let src = dx_sel.reshape((frames, outputs * arity))?;
    let zeros = Tensor::zeros((frames, input_nodes), src.dtype(), src.device())?;
    Ok(zeros.index_add(ids, &src, 1)?)
}

/// Expected LUT output `(F, O)`.
pub(crate) fn lut_forward(x_sel: &Tensor, table: &Tensor, arity: usize) -> Result<Tensor> {
    let weights = Factors::new(x_sel, arity)?.product(None)?;
    let table = table.clamp(0f64, 1f64)?.unsqueeze(0)?;
    Ok(weights.broadcast_mul(&table)?.sum(2)?)
}

/// Gradients of [`lut_forward`]: `(dx_sel (F,O,N), dtable (O,K))`.
pub(crate) fn lut_backward(
    x_sel: &Tensor,
    table: &Tensor,
    dy: &Tensor,
    arity: usize,
) -> Result<(Tensor, Tensor)> {
    let factors = Factors::new(x_sel, arity)?;
    let dy = dy.unsqueeze(2)?;

    let weights = factors.product(None)?;
    let dtable = weights.broadcast_mul(&dy)?.sum(0)?;

    let weighted = table.clamp(0f64, 1f64)?.unsqueeze(0)?.broadcast_mul(&dy)?;
    let mut dx = Vec::with_capacity(arity);
    for i in 0..arity {
        let partial = factors.product(Some(i))?.broadcast_mul(&factors.slopes[i])?;
        dx.push(partial.mul(&weighted)?.sum_keepdim(2)?);
    }
    Ok((Tensor::cat(&dx, 2)?, dtable))
}

/// Host-side evaluation of one node (used by single-node queries).
pub(crate) fn evaluate_node(table: &[f32], inputs: &[f64]) -> f64 {
    table
        .iter()
        .enumerate()
        .map(|(k, &t)| {
            let weight: f64 = inputs
                .iter()
                .enumerate()
                .map(|(i, &x)| {
                    let x = x.clamp(0.0, 1.0);
                    if (k >> i) & 1 == 1 {
                        x
                    } else {
                        1.0 - x
                    }
                })
                .product();
            weight * f64::from(t).clamp(0.0, 1.0)
        })
        .sum()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn single(x: &[f32], table: &[f32], arity: usize) -> (Tensor, Tensor) {
        let dev = Device::Cpu;
        let x = Tensor::from_vec(x.to_vec(), (1, 1, arity), &dev).unwrap();
        let t = Tensor::from_vec(table.to_vec(), (1, table.len()), &dev).unwrap();
        (x, t)
    }

    #[test]
    fn one_hot_inputs_select_table_entry() {
        let table: Vec<f32> = (0..16).map(|k| k as f32 / 16.0).collect();
        for k in 0..16usize {
            let x: Vec<f32> = (0..4).map(|i| ((k >> i) & 1) as f32).collect();
            let (xs, t) = single(&x, &table, 4);
            let y = lut_forward(&xs, &t, 4).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!((y[0] - table[k]).abs() < 1e-6, "entry {k}: {}", y[0]);
        }
    }

    #[test]
    fn two_input_interpolation() {
        // y = t0(1-a)(1-b) + t1·a(1-b) + t2(1-a)b + t3·ab
        let (a, b) = (0.25f32, 0.5f32);
        let table = [0.0f32, 1.0, 0.5, 0.2];
        let (xs, t) = single(&[a, b], &table, 2);
        let y = lut_forward(&xs, &t, 2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        let expected = 0.0 + 1.0 * a * (1.0 - b) + 0.5 * (1.0 - a) * b + 0.2 * a * b;
        assert!((y - expected).abs() < 1e-6);
        assert!((evaluate_node(&table, &[a as f64, b as f64]) as f32 - expected).abs() < 1e-6);
    }

    #[test]
    fn gradients_match_closed_form() {
        let (a, b) = (0.25f32, 0.5f32);
        let table = [0.0f32, 1.0, 0.5, 0.2];
        let (xs, t) = single(&[a, b], &table, 2);
        let dy = Tensor::new(&[[2f32]], &Device::Cpu).unwrap();
        let (dx, dt) = lut_backward(&xs, &t, &dy, 2).unwrap();
        let dx = dx.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let dt = dt.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        // ∂y/∂a = -t0(1-b) + t1(1-b) - t2·b + t3·b
        let da = -0.0 * (1.0 - b) + 1.0 * (1.0 - b) - 0.5 * b + 0.2 * b;
        // ∂y/∂b = -t0(1-a) - t1·a + t2(1-a) + t3·a
        let db = -0.0 * (1.0 - a) - 1.0 * a + 0.5 * (1.0 - a) + 0.2 * a;
        assert!((dx[0] - 2.0 * da).abs() < 1e-6);
        assert!((dx[1] - 2.0 * db).abs() < 1e-6);

        let w = [(1.0 - a) * (1.0 - b), a * (1.0 - b), (1.0 - a) * b, a * b];
        for k in 0..4 {
            assert!((dt[k] - 2.0 * w[k]).abs() < 1e-6);
        }
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let table = [-1.0f32, 2.0, 0.5, 0.5];
        let (xs, t) = single(&[1.5, -0.5], &table, 2);
        let dev = Device::Cpu;
        let gathered = gather_inputs(
            &xs.reshape((1, 2)).unwrap(),
            &Tensor::new(&[0u32, 1], &dev).unwrap(),
            1,
            2,
        )
        .unwrap();
        let y = lut_forward(&gathered, &t, 2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // x = (1, 0) selects entry 1, clamped from 2.0 to 1.0.
        assert!((y[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn scatter_accumulates_shared_inputs() {
        let dev = Device::Cpu;
        let ids = Tensor::new(&[0u32, 2, 2, 1], &dev).unwrap();
        let dx_sel = Tensor::new(&[[[1f32, 2.0], [3.0, 4.0]]], &dev).unwrap();
        let dx = scatter_inputs(&dx_sel, &ids, 3).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(dx, vec![vec![1.0, 4.0, 5.0]]);
    }
}
