use anyhow::{bail, Result};
use nalgebra::DVector;
use rayon::prelude::*;

/// Symmetric system matrix in compressed sparse row form
#[derive(Clone, Debug)]
pub struct SparseMatrix {
    size: usize,
    row_ptr: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f32>,
}

impl SparseMatrix {
    /// Compress `(row, col, value)` entries. Duplicate coordinates are summed.
    pub fn from_triplets(size: usize, mut triplets: Vec<(usize, usize, f32)>) -> Self {
        triplets.sort_unstable_by_key(|(r, c, _)| (*r, *c));

        let mut row_ptr = vec![0usize; size + 1];
        let mut cols = Vec::with_capacity(triplets.len());
        let mut values: Vec<f32> = Vec::with_capacity(triplets.len());
        let mut last = None;
        for (r, c, v) in triplets {
            if last == Some((r, c)) {
                if let Some(value) = values.last_mut() {
                    *value += v;
                }
                continue;
            }
            last = Some((r, c));
            cols.push(c);
            values.push(v);
            row_ptr[r + 1] += 1;
        }
        for r in 0..size {
            row_ptr[r + 1] += row_ptr[r];
        }

        Self {
            size,
            row_ptr,
            cols,
            values,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        let range = self.row_ptr[row]..self.row_ptr[row + 1];
        self.cols[range.clone()]
            .iter()
            .zip(self.values[range].iter())
            .find(|(c, _)| **c == col)
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    }

    pub fn diagonal(&self) -> DVector<f32> {
        DVector::from_iterator(self.size, (0..self.size).map(|i| self.get(i, i)))
    }

    /// `out = self * x`, rows computed in parallel
    pub fn mul_to(&self, x: &DVector<f32>, out: &mut DVector<f32>) {
        out.as_mut_slice()
            .par_iter_mut()
            .enumerate()
            .for_each(|(row, o)| {
                let range = self.row_ptr[row]..self.row_ptr[row + 1];
                *o = self.cols[range.clone()]
                    .iter()
                    .zip(self.values[range].iter())
                    .map(|(c, v)| v * x[*c])
                    .sum();
            });
    }
}

/// Jacobi-preconditioned conjugate gradient, starting from `x`. Returns the solution and the
/// number of iterations used.
pub fn conjugate_gradient(
    a: &SparseMatrix,
    b: &DVector<f32>,
    mut x: DVector<f32>,
    max_iterations: usize,
    tolerance: f32,
) -> Result<(DVector<f32>, usize)> {
    let n = a.size();
    let inv_diag = a
        .diagonal()
        .map(|d| if d > 0.0 { 1.0 / d } else { 1.0 });

    let mut ap = DVector::zeros(n);
    a.mul_to(&x, &mut ap);
    let mut r = b - &ap;
    let mut z = r.component_mul(&inv_diag);
    let mut p = z.clone();
    let mut rz = r.dot(&z);

    let target = tolerance * b.norm().max(f32::EPSILON);
    let mut iterations = 0;
    while iterations < max_iterations && r.norm() > target {
        a.mul_to(&p, &mut ap);
        let pap = p.dot(&ap);
        if pap <= 0.0 {
            break;
        }
        let alpha = rz / pap;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &ap, 1.0);
        z = r.component_mul(&inv_diag);
        let rz_next = r.dot(&z);
        p = &z + &p * (rz_next / rz);
        rz = rz_next;
        iterations += 1;
    }

    if x.iter().any(|v| !v.is_finite()) {
        bail!("Conjugate gradient diverged after {} iterations", iterations);
    }
    Ok((x, iterations))
}
