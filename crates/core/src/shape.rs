//! Row-major index flattening over per-frame shapes.
//!
//! Spatial shapes are `(channels, height, width)`; the first dimension is
//! outermost. Every connectivity rule goes through this one pair of functions.

use crate::error::{LutError, Result};

/// Number of nodes in a per-frame shape.
pub fn node_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Multi-index → flat node index.
pub fn flatten_index(indices: &[usize], shape: &[usize]) -> Result<usize> {
    if indices.len() != shape.len() {
        return Err(LutError::shape(format!(
            "index rank {} does not match shape {shape:?}",
            indices.len()
        )));
    }
    let mut flat = 0;
    for (&i, &dim) in indices.iter().zip(shape) {
        if i >= dim {
            return Err(LutError::shape(format!(
                "index {indices:?} out of range for shape {shape:?}"
            )));
        }
        flat = flat * dim + i;
    }
    Ok(flat)
}

/// Flat node index → multi-index.
pub fn unflatten_index(index: usize, shape: &[usize]) -> Result<Vec<usize>> {
    let total = node_count(shape);
    if index >= total {
        return Err(LutError::shape(format!(
            "flat index {index} out of range for shape {shape:?}"
        )));
    }
    let mut indices = vec![0; shape.len()];
    let mut rest = index;
    for (slot, &dim) in indices.iter_mut().zip(shape).rev() {
        *slot = rest % dim;
        rest /= dim;
    }
    Ok(indices)
}

/// Format a shape for log lines.
pub(crate) fn describe(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("({})", dims.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_is_row_major() {
        let shape = [3, 4, 5];
        assert_eq!(flatten_index(&[0, 0, 0], &shape).unwrap(), 0);
        assert_eq!(flatten_index(&[0, 0, 1], &shape).unwrap(), 1);
        assert_eq!(flatten_index(&[0, 1, 0], &shape).unwrap(), 5);
        assert_eq!(flatten_index(&[2, 3, 4], &shape).unwrap(), 59);
    }

    #[test]
    fn unflatten_inverts_flatten() {
        let shape = [2, 3, 4];
        for flat in 0..node_count(&shape) {
            let idx = unflatten_index(flat, &shape).unwrap();
            assert_eq!(flatten_index(&idx, &shape).unwrap(), flat);
        }
    }

    #[test]
    fn out_of_range_is_shape_error() {
        assert!(matches!(flatten_index(&[0, 4], &[2, 4]), Err(LutError::Shape(_))));
        assert!(matches!(flatten_index(&[0], &[2, 4]), Err(LutError::Shape(_))));
        assert!(matches!(unflatten_index(8, &[2, 4]), Err(LutError::Shape(_))));
    }
}
