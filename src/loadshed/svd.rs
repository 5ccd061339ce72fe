//! Singular Value Decomposition and SVD-based least-squares regression
//! (spec.md §4.9 + Design Note §9's 30-iteration budget), translated
//! from `original_source/.../loadshed/prediction.c`'s `svd`/`mlr`, itself
//! adapted from the EISPACK `svd` Fortran routine (Golub-Reinsch).

const MAX_ITERATIONS: usize = 30;
const EPSILON: f64 = 4.940_656_458_412_47e-324;

fn sign(a: f64, b: f64) -> f64 {
    if b >= 0.0 {
        a.abs()
    } else {
        -a.abs()
    }
}

fn pythag(a: f64, b: f64) -> f64 {
    let absa = a.abs();
    let absb = b.abs();
    if absa > absb {
        absa * (1.0 + (absb / absa).powi(2)).sqrt()
    } else if absb == 0.0 {
        0.0
    } else {
        absb * (1.0 + (absa / absb).powi(2)).sqrt()
    }
}

/// Decomposes `u` (an `m`-by-`n` matrix, `m >= n`) in place into
/// `u * diag(w) * v^T`. `v` must already be an `n`-by-`n` matrix (any
/// initial contents are overwritten). Returns `Err(k)` if the `k`-th
/// singular value failed to converge within [`MAX_ITERATIONS`].
pub fn svd(u: &mut Vec<Vec<f64>>, w: &mut [f64], v: &mut Vec<Vec<f64>>) -> Result<(), usize> {
    let m = u.len();
    let n = w.len();
    debug_assert!(m >= n);

    let mut rv1 = vec![0.0f64; n];
    let mut g = 0.0f64;
    let mut scale = 0.0f64;
    let mut x = 0.0f64;
    let mut l = 0usize;

    // Householder reduction to bidiagonal form.
    for i in 0..n {
        l = i + 1;
        rv1[i] = scale * g; // uses scale/g left over from the previous iteration
        g = 0.0;
        let mut s = 0.0;
        scale = 0.0;

        if i <= m - 1 {
            for k in i..m {
                scale += u[k][i].abs();
            }
            if scale != 0.0 {
                for k in i..m {
                    u[k][i] /= scale;
                    s += u[k][i] * u[k][i];
                }
                let f = u[i][i];
                g = -sign(s.sqrt(), f);
                let h = f * g - s;
                u[i][i] = f - g;

                if i != n - 1 {
                    for j in l..n {
                        let mut s2 = 0.0;
                        for k in i..m {
                            s2 += u[k][i] * u[k][j];
                        }
                        let f2 = s2 / h;
                        for k in i..m {
                            u[k][j] += f2 * u[k][i];
                        }
                    }
                }
                for k in i..m {
                    u[k][i] *= scale;
                }
            } else {
                g = 0.0;
            }
        } else {
            g = 0.0;
        }

        w[i] = scale * g;
        g = 0.0;
        s = 0.0;
        scale = 0.0;

        if !(i > m - 1 || i == n - 1) {
            for k in l..n {
                scale += u[i][k].abs();
            }
            if scale != 0.0 {
                for k in l..n {
                    u[i][k] /= scale;
                    s += u[i][k] * u[i][k];
                }
                let f = u[i][l];
                g = -sign(s.sqrt(), f);
                let h = f * g - s;
                u[i][l] = f - g;
                for k in l..n {
                    rv1[k] = u[i][k] / h;
                }
                if i != m - 1 {
                    for j in l..m {
                        let mut s2 = 0.0;
                        for k in l..n {
                            s2 += u[j][k] * u[i][k];
                        }
                        for k in l..n {
                            u[j][k] += s2 * rv1[k];
                        }
                    }
                }
                for k in l..n {
                    u[i][k] *= scale;
                }
            }
        }
        x = x.max(w[i].abs() + rv1[i].abs());
    }

    // Accumulation of right-hand transformations.
    let mut l_carry = l;
    let mut g_carry = g;
    for i in (0..n).rev() {
        if i != n - 1 {
            if g_carry != 0.0 {
                for j in l_carry..n {
                    v[j][i] = (u[i][j] / u[i][l_carry]) / g_carry;
                }
                for j in l_carry..n {
                    let mut s = 0.0;
                    for k in l_carry..n {
                        s += u[i][k] * v[k][j];
                    }
                    for k in l_carry..n {
                        v[k][j] += s * v[k][i];
                    }
                }
            }
            for j in l_carry..n {
                v[i][j] = 0.0;
                v[j][i] = 0.0;
            }
        }
        v[i][i] = 1.0;
        g_carry = rv1[i];
        l_carry = i;
    }

    // Accumulation of left-hand transformations.
    let min_mn = m.min(n);
    for i in (0..min_mn).rev() {
        let l2 = i + 1;
        let g2 = w[i];
        if i != n - 1 {
            for j in l2..n {
                u[i][j] = 0.0;
            }
        }
        if g2 != 0.0 {
            if i != min_mn - 1 {
                for j in l2..n {
                    let mut s = 0.0;
                    for k in l2..m {
                        s += u[k][i] * u[k][j];
                    }
                    let f = (s / u[i][i]) / g2;
                    for k in i..m {
                        u[k][j] += f * u[k][i];
                    }
                }
            }
            for j in i..m {
                u[j][i] /= g2;
            }
        } else {
            for j in i..m {
                u[j][i] = 0.0;
            }
        }
        u[i][i] += 1.0;
    }

    // Diagonalization of the bidiagonal form.
    let tst1 = x;
    for k in (0..n).rev() {
        let mut its = 0usize;

        loop {
            // Test for splitting.
            let mut l_val: isize = k as isize;
            let mut converge_directly = false;
            loop {
                let l1 = l_val - 1;
                let tst2 = tst1 + rv1[l_val as usize].abs();
                if (tst2 - tst1).abs() <= EPSILON {
                    converge_directly = true;
                    break;
                }
                if l1 < 0 {
                    converge_directly = true;
                    break;
                }
                let tst2b = tst1 + w[l1 as usize].abs();
                if (tst2b - tst1).abs() <= EPSILON {
                    break;
                }
                l_val -= 1;
            }

            if !converge_directly {
                let l1 = (l_val - 1) as usize;
                let mut c = 0.0f64;
                let mut s = 1.0f64;
                for i in (l_val as usize)..=k {
                    let f = s * rv1[i];
                    rv1[i] *= c;
                    let tst2 = tst1 + f.abs();
                    if (tst2 - tst1).abs() <= EPSILON {
                        break;
                    }
                    let gg = w[i];
                    let h = pythag(f, gg);
                    w[i] = h;
                    c = gg / h;
                    s = -f / h;
                    for j in 0..m {
                        let y = u[j][l1];
                        let z = u[j][i];
                        u[j][l1] = y * c + z * s;
                        u[j][i] = -y * s + z * c;
                    }
                }
            }

            let z = w[k];
            if l_val == k as isize {
                if z < 0.0 {
                    w[k] = -z;
                    for j in 0..n {
                        v[j][k] = -v[j][k];
                    }
                }
                break;
            }

            if its == MAX_ITERATIONS {
                return Err(k);
            }
            its += 1;

            let k1 = k - 1;
            let mut x_ = w[l_val as usize];
            let y_ = w[k1];
            let mut g_ = rv1[k1];
            let h_ = rv1[k];
            let mut f_ = 0.5 * (((g_ + z) / h_) * ((g_ - z) / y_) + y_ / h_ - h_ / y_);
            g_ = pythag(f_, 1.0);
            f_ = x_ - (z / x_) * z + (h_ / x_) * (y_ / (f_ + sign(g_, f_)) - h_);

            let mut c = 1.0f64;
            let mut s = 1.0f64;

            for i1 in (l_val as usize)..k1 + 1 {
                let i = i1 + 1;
                let mut g2 = rv1[i];
                let mut y2 = w[i];
                let mut h2 = s * g2;
                g2 = c * g2;
                let mut z2 = pythag(f_, h2);
                rv1[i1] = z2;
                c = f_ / z2;
                s = h2 / z2;
                f_ = x_ * c + g2 * s;
                g2 = -x_ * s + g2 * c;
                h2 = y2 * s;
                y2 = y2 * c;

                for j in 0..n {
                    let xx = v[j][i1];
                    let zz = v[j][i];
                    v[j][i1] = xx * c + zz * s;
                    v[j][i] = -xx * s + zz * c;
                }

                z2 = pythag(f_, h2);
                w[i1] = z2;
                if z2 != 0.0 {
                    c = f_ / z2;
                    s = h2 / z2;
                }
                f_ = c * g2 + s * y2;
                x_ = -s * g2 + c * y2;

                for j in 0..m {
                    let yy = u[j][i1];
                    let zz = u[j][i];
                    u[j][i1] = yy * c + zz * s;
                    u[j][i] = -yy * s + zz * c;
                }
            }

            rv1[l_val as usize] = 0.0;
            rv1[k] = f_;
            w[k] = x_;
        }
    }

    Ok(())
}

/// Multiple linear regression via SVD-based least squares (`mlr`):
/// solve `u * c = y` for `c` in the least-squares sense. `u` is consumed
/// (overwritten by its own decomposition, matching the original).
pub fn least_squares(mut u: Vec<Vec<f64>>, y: &[f64], nsel: usize, nobs: usize) -> Vec<f64> {
    let mut w = vec![0.0f64; nsel];
    let mut v = vec![vec![0.0f64; nsel]; nsel];

    if let Err(k) = svd(&mut u, &mut w, &mut v) {
        log::warn!("load-shedding SVD failed to converge on singular value {}", k);
    }

    let mut tmp = vec![0.0f64; nsel];
    for j in 0..nsel {
        if w[j] != 0.0 {
            let mut s = 0.0;
            for i in 0..nobs {
                s += u[i][j] * y[i];
            }
            tmp[j] = s / w[j];
        }
    }

    let mut c = vec![0.0f64; nsel];
    for j in 0..nsel {
        let mut s = 0.0;
        for jj in 0..nsel {
            s += v[j][jj] * tmp[jj];
        }
        c[j] = s;
    }
    c
}

/// Builds the design matrix (a leading constant column plus the
/// selected predictors' histories), fits it against the response
/// history, and predicts the next observation, clipping a negative
/// prediction to zero (`predict()` in the original: negative predicted
/// load makes no physical sense).
pub fn predict(
    selected_histories: &[&[f64]],
    next_obs: &[f64],
    resp: &[f64],
    nobs: usize,
) -> f64 {
    let nsel = selected_histories.len() + 1;
    let mut design = vec![vec![0.0f64; nsel]; nobs];
    for i in 0..nobs {
        design[i][0] = 1.0;
        for (j, hist) in selected_histories.iter().enumerate() {
            design[i][j + 1] = hist[i];
        }
    }

    let c = least_squares(design, resp, nsel, nobs);

    let mut pr = c[0];
    for (j, hist) in selected_histories.iter().enumerate() {
        let _ = hist;
        pr += next_obs[j] * c[j + 1];
    }
    pr.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svd_reconstructs_an_identity_like_matrix() {
        let mut u = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 0.0]];
        let mut w = vec![0.0; 2];
        let mut v = vec![vec![0.0; 2]; 2];
        let result = svd(&mut u, &mut w, &mut v);
        assert!(result.is_ok());
        // both singular values of a (padded) identity are 1.
        let mut sorted = w.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((sorted[0] - 1.0).abs() < 1e-6);
        assert!((sorted[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn least_squares_recovers_an_exact_linear_fit() {
        // y = 2 + 3*x, observed exactly at 5 points.
        let nobs = 5;
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let ys: Vec<f64> = xs.iter().map(|&x| 2.0 + 3.0 * x).collect();
        let design: Vec<Vec<f64>> = xs.iter().map(|&x| vec![1.0, x]).collect();
        let c = least_squares(design, &ys, 2, nobs);
        assert!((c[0] - 2.0).abs() < 1e-6);
        assert!((c[1] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn predict_clips_negative_results_to_zero() {
        let nobs = 4;
        let resp = [-10.0, -11.0, -9.0, -10.0];
        let hist: Vec<f64> = vec![0.0; nobs];
        let c = predict(&[&hist], &[0.0], &resp, nobs);
        assert!(c >= 0.0);
    }
}
