//! im2col kernels for "same"-padded 1-D and 2-D convolutions.
//!
//! `unfold*` and `fold*` are adjoint linear maps, so each is the other's backward.

use ndarray::{Array2, Array3, Array4, ArrayD, ArrayView2, ArrayView3, ArrayView4, Ix2, Ix3, Ix4};

fn view2<'a>(op: &str, a: &'a ArrayD<f64>) -> ArrayView2<'a, f64> {
    a.view()
        .into_dimensionality::<Ix2>()
        .unwrap_or_else(|_| panic!("{op}: expected a 2-D array, got shape {:?}", a.shape()))
}

fn view3<'a>(op: &str, a: &'a ArrayD<f64>) -> ArrayView3<'a, f64> {
    a.view()
        .into_dimensionality::<Ix3>()
        .unwrap_or_else(|_| panic!("{op}: expected a 3-D array, got shape {:?}", a.shape()))
}

fn view4<'a>(op: &str, a: &'a ArrayD<f64>) -> ArrayView4<'a, f64> {
    a.view()
        .into_dimensionality::<Ix4>()
        .unwrap_or_else(|_| panic!("{op}: expected a 4-D array, got shape {:?}", a.shape()))
}

/// Maps a padded position back into `0..len`, or `None` when it falls in the padding.
#[inline]
fn unpad(pos: usize, pad: usize, len: usize) -> Option<usize> {
    if pos < pad || pos - pad >= len {
        None
    } else {
        Some(pos - pad)
    }
}

/// `[B, C, L]` -> `[B*L, C*K]`
pub(super) fn unfold1d(x: &ArrayD<f64>, kernel: usize) -> ArrayD<f64> {
    let x = view3("unfold1d", x);
    let (batch, channels, len) = x.dim();
    let pad = kernel / 2;
    let mut cols = Array2::<f64>::zeros((batch * len, channels * kernel));

    for b in 0..batch {
        for l in 0..len {
            let row = b * len + l;
            for c in 0..channels {
                for k in 0..kernel {
                    if let Some(src) = unpad(l + k, pad, len) {
                        cols[[row, c * kernel + k]] = x[[b, c, src]];
                    }
                }
            }
        }
    }
    cols.into_dyn()
}

/// `[B*L, C*K]` -> `[B, C, L]`, summing overlapping taps.
pub(super) fn fold1d(cols: &ArrayD<f64>, shape: &[usize], kernel: usize) -> ArrayD<f64> {
    let cols = view2("fold1d", cols);
    let &[batch, channels, len] = shape else {
        panic!("fold1d: target shape must be [B, C, L], got {shape:?}");
    };
    assert_eq!(
        cols.dim(),
        (batch * len, channels * kernel),
        "fold1d: column matrix does not match target shape {shape:?}"
    );
    let pad = kernel / 2;
    let mut out = Array3::<f64>::zeros((batch, channels, len));

    for b in 0..batch {
        for l in 0..len {
            let row = b * len + l;
            for c in 0..channels {
                for k in 0..kernel {
                    if let Some(dst) = unpad(l + k, pad, len) {
                        out[[b, c, dst]] += cols[[row, c * kernel + k]];
                    }
                }
            }
        }
    }
    out.into_dyn()
}

/// `[B, C, H, W]` -> `[B*H*W, C*K*K]`
pub(super) fn unfold2d(x: &ArrayD<f64>, kernel: usize) -> ArrayD<f64> {
    let x = view4("unfold2d", x);
    let (batch, channels, height, width) = x.dim();
    let pad = kernel / 2;
    let mut cols = Array2::<f64>::zeros((batch * height * width, channels * kernel * kernel));

    for b in 0..batch {
        for i in 0..height {
            for j in 0..width {
                let row = (b * height + i) * width + j;
                for c in 0..channels {
                    for ki in 0..kernel {
                        let Some(src_i) = unpad(i + ki, pad, height) else {
                            continue;
                        };
                        for kj in 0..kernel {
                            if let Some(src_j) = unpad(j + kj, pad, width) {
                                cols[[row, (c * kernel + ki) * kernel + kj]] =
                                    x[[b, c, src_i, src_j]];
                            }
                        }
                    }
                }
            }
        }
    }
    cols.into_dyn()
}

/// `[B*H*W, C*K*K]` -> `[B, C, H, W]`
pub(super) fn fold2d(cols: &ArrayD<f64>, shape: &[usize], kernel: usize) -> ArrayD<f64> {
    let cols = view2("fold2d", cols);
    let &[batch, channels, height, width] = shape else {
        panic!("fold2d: target shape must be [B, C, H, W], got {shape:?}");
    };
    assert_eq!(
        cols.dim(),
        (batch * height * width, channels * kernel * kernel),
        "fold2d: column matrix does not match target shape {shape:?}"
    );
    let pad = kernel / 2;
    let mut out = Array4::<f64>::zeros((batch, channels, height, width));

    for b in 0..batch {
        for i in 0..height {
            for j in 0..width {
                let row = (b * height + i) * width + j;
                for c in 0..channels {
                    for ki in 0..kernel {
                        let Some(dst_i) = unpad(i + ki, pad, height) else {
                            continue;
                        };
                        for kj in 0..kernel {
                            if let Some(dst_j) = unpad(j + kj, pad, width) {
                                out[[b, c, dst_i, dst_j]] +=
                                    cols[[row, (c * kernel + ki) * kernel + kj]];
                            }
                        }
                    }
                }
            }
        }
    }
    out.into_dyn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_unfold1d_same_padding_layout() {
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 1, 3]), vec![1.0, 2.0, 3.0]).unwrap();
        let cols = unfold1d(&x, 3);
        assert_eq!(cols.shape(), &[3, 3]);
        // Row 0 sees [pad, x0, x1]
        assert_eq!(cols[[0, 0]], 0.0);
        assert_eq!(cols[[0, 1]], 1.0);
        assert_eq!(cols[[0, 2]], 2.0);
        // Row 2 sees [x1, x2, pad]
        assert_eq!(cols[[2, 0]], 2.0);
        assert_eq!(cols[[2, 2]], 0.0);
    }

    #[test]
    fn test_fold_is_adjoint_of_unfold() {
        // <unfold(x), y> == <x, fold(y)>
        let x = ArrayD::from_shape_fn(IxDyn(&[2, 2, 4, 3]), |d| {
            (d[0] * 7 + d[1] * 5 + d[2] * 3 + d[3]) as f64 * 0.1 - 1.0
        });
        let cols = unfold2d(&x, 3);
        let y = ArrayD::from_shape_fn(IxDyn(cols.shape()), |d| ((d[0] + 2 * d[1]) % 5) as f64);
        let folded = fold2d(&y, x.shape(), 3);

        let lhs: f64 = cols.iter().zip(y.iter()).map(|(a, b)| a * b).sum();
        let rhs: f64 = x.iter().zip(folded.iter()).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-9);
    }
}
