//! The built-in square-matrix resource.
//!
//! The payload is the row-major little-endian `f64` data of an `n x n`
//! matrix. All methods are pure and reentrant; factorizations run per call
//! over the constant payload.

use crate::error::ResourceError;
use crate::layout::Layout;
use crate::resource::{MethodDecl, ResourceImpl};

const INV: usize = 0;
const DET: usize = 1;
const CHOLESKY: usize = 2;
const SOLVE: usize = 3;

pub(crate) struct SquareMatrix {
    name: String,
    n: usize,
    data: Vec<f64>,
}

impl SquareMatrix {
    pub fn load(name: &str, payload: &[u8]) -> Result<Self, ResourceError> {
        if payload.is_empty() || payload.len() % 8 != 0 {
            return Err(ResourceError::new(
                name,
                format!("payload must be a whole number of f64s, got {} bytes", payload.len()),
            ));
        }
        let data: Vec<f64> = payload
            .chunks_exact(8)
            .map(|chunk| f64::from_le_bytes(chunk.try_into().expect("chunk is 8 bytes")))
            .collect();
        let n = (data.len() as f64).sqrt() as usize;
        if n * n != data.len() {
            return Err(ResourceError::new(
                name,
                format!("{} entries do not form a square matrix", data.len()),
            ));
        }
        Ok(SquareMatrix {
            name: name.to_string(),
            n,
            data,
        })
    }

    fn err(&self, message: impl Into<String>) -> ResourceError {
        ResourceError::new(&self.name, message)
    }

    /// LU-decompose a copy of the matrix with partial pivoting. Returns the
    /// factors, the pivot permutation, and the permutation sign.
    fn lu(&self) -> Result<(Vec<f64>, Vec<usize>, f64), ResourceError> {
        let n = self.n;
        let mut lu = self.data.clone();
        let mut piv: Vec<usize> = (0..n).collect();
        let mut sign = 1.0;
        for k in 0..n {
            let mut p = k;
            let mut largest = lu[k * n + k].abs();
            for i in k + 1..n {
                let candidate = lu[i * n + k].abs();
                if candidate > largest {
                    largest = candidate;
                    p = i;
                }
            }
            if largest == 0.0 {
                return Err(self.err("matrix is singular"));
            }
            if p != k {
                for j in 0..n {
                    lu.swap(k * n + j, p * n + j);
                }
                piv.swap(k, p);
                sign = -sign;
            }
            let pivot = lu[k * n + k];
            for i in k + 1..n {
                let factor = lu[i * n + k] / pivot;
                lu[i * n + k] = factor;
                for j in k + 1..n {
                    lu[i * n + j] -= factor * lu[k * n + j];
                }
            }
        }
        Ok((lu, piv, sign))
    }

    /// Solve `A x = b` given the LU factors.
    fn lu_solve(&self, lu: &[f64], piv: &[usize], b: &[f64], x: &mut [f64]) {
        let n = self.n;
        for i in 0..n {
            x[i] = b[piv[i]];
        }
        for i in 0..n {
            for j in 0..i {
                x[i] -= lu[i * n + j] * x[j];
            }
        }
        for i in (0..n).rev() {
            for j in i + 1..n {
                x[i] -= lu[i * n + j] * x[j];
            }
            x[i] /= lu[i * n + i];
        }
    }

    fn cholesky(&self) -> Result<Vec<f64>, ResourceError> {
        let n = self.n;
        let mut l = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut sum = self.data[i * n + j];
                for k in 0..j {
                    sum -= l[i * n + k] * l[j * n + k];
                }
                if i == j {
                    if sum <= 0.0 {
                        return Err(self.err("matrix is not positive definite"));
                    }
                    l[i * n + i] = sum.sqrt();
                } else {
                    l[i * n + j] = sum / l[j * n + j];
                }
            }
        }
        Ok(l)
    }

    fn tensor(&self, dims: &[usize]) -> Layout {
        Layout::tensor(dims)
    }
}

impl ResourceImpl for SquareMatrix {
    fn methods(&self) -> Vec<MethodDecl> {
        let n = self.n;
        vec![
            MethodDecl {
                name: "inv".into(),
                input_layout: Layout::Unit,
                output_layout: self.tensor(&[n, n]),
                reentrant: true,
            },
            MethodDecl {
                name: "det".into(),
                input_layout: Layout::Unit,
                output_layout: Layout::Scalar,
                reentrant: true,
            },
            MethodDecl {
                name: "cholesky".into(),
                input_layout: Layout::Unit,
                output_layout: self.tensor(&[n, n]),
                reentrant: true,
            },
            MethodDecl {
                name: "solve".into(),
                input_layout: Layout::struct_of([("b", self.tensor(&[n]))]),
                output_layout: self.tensor(&[n]),
                reentrant: true,
            },
        ]
    }

    fn call(&self, method: usize, input: &[u64], output: &mut [u64]) -> Result<(), ResourceError> {
        let n = self.n;
        match method {
            INV => {
                let (lu, piv, _) = self.lu()?;
                let mut unit = vec![0.0; n];
                let mut column = vec![0.0; n];
                for j in 0..n {
                    unit.fill(0.0);
                    unit[j] = 1.0;
                    self.lu_solve(&lu, &piv, &unit, &mut column);
                    for i in 0..n {
                        output[i * n + j] = column[i].to_bits();
                    }
                }
                Ok(())
            }
            DET => {
                match self.lu() {
                    Ok((lu, _, sign)) => {
                        let det = (0..n).map(|i| lu[i * n + i]).product::<f64>() * sign;
                        output[0] = det.to_bits();
                    }
                    // A singular matrix still has a determinant.
                    Err(_) => output[0] = 0.0f64.to_bits(),
                }
                Ok(())
            }
            CHOLESKY => {
                let l = self.cholesky()?;
                for (slot, value) in output.iter_mut().zip(&l) {
                    *slot = value.to_bits();
                }
                Ok(())
            }
            SOLVE => {
                let b: Vec<f64> = input.iter().map(|w| f64::from_bits(*w)).collect();
                let (lu, piv, _) = self.lu()?;
                let mut x = vec![0.0; n];
                self.lu_solve(&lu, &piv, &b, &mut x);
                for (slot, value) in output.iter_mut().zip(&x) {
                    *slot = value.to_bits();
                }
                Ok(())
            }
            _ => Err(self.err(format!("no method with index {method}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(data: &[f64]) -> SquareMatrix {
        let payload: Vec<u8> = data.iter().flat_map(|x| x.to_le_bytes()).collect();
        SquareMatrix::load("m", &payload).unwrap()
    }

    #[test]
    fn rejects_non_square_payloads() {
        let payload: Vec<u8> = [1.0f64, 2.0, 3.0]
            .iter()
            .flat_map(|x| x.to_le_bytes())
            .collect();
        assert!(SquareMatrix::load("m", &payload).is_err());
        assert!(SquareMatrix::load("m", &[1, 2, 3]).is_err());
    }

    #[test]
    fn determinant_and_inverse() {
        let m = matrix(&[2.0, 1.0, 1.0, 2.0]);
        let mut out = vec![0u64; 1];
        m.call(DET, &[], &mut out).unwrap();
        assert!((f64::from_bits(out[0]) - 3.0).abs() < 1e-12);

        let mut inv = vec![0u64; 4];
        m.call(INV, &[], &mut inv).unwrap();
        let inv: Vec<f64> = inv.iter().map(|w| f64::from_bits(*w)).collect();
        let expected = [2.0 / 3.0, -1.0 / 3.0, -1.0 / 3.0, 2.0 / 3.0];
        for (got, want) in inv.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{inv:?}");
        }
    }

    #[test]
    fn solve_and_cholesky() {
        let m = matrix(&[2.0, 1.0, 1.0, 2.0]);
        let b = [2.0f64, 1.0];
        let input: Vec<u64> = b.iter().map(|x| x.to_bits()).collect();
        let mut out = vec![0u64; 2];
        m.call(SOLVE, &input, &mut out).unwrap();
        let x: Vec<f64> = out.iter().map(|w| f64::from_bits(*w)).collect();
        assert!((x[0] - 1.0).abs() < 1e-12 && (x[1] - 0.0).abs() < 1e-12, "{x:?}");

        let mut chol = vec![0u64; 4];
        m.call(CHOLESKY, &[], &mut chol).unwrap();
        let l: Vec<f64> = chol.iter().map(|w| f64::from_bits(*w)).collect();
        // L L^T must reproduce the matrix.
        let recovered = [
            l[0] * l[0],
            l[0] * l[2],
            l[2] * l[0],
            l[2] * l[2] + l[3] * l[3],
        ];
        for (got, want) in recovered.iter().zip([2.0, 1.0, 1.0, 2.0]) {
            assert!((got - want).abs() < 1e-12, "{l:?}");
        }

        let not_spd = matrix(&[0.0, 1.0, 1.0, 0.0]);
        assert!(not_spd.call(CHOLESKY, &[], &mut chol).is_err());
    }
}
