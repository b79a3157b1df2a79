//! SIMD distance kernels
//!
//! Squared Euclidean distance is the only metric the index ranks by, so this
//! module keeps one kernel per ISA:
//!
//! | Platform     | ISA        | Width           | Intrinsics                          |
//! |--------------|------------|-----------------|-------------------------------------|
//! | aarch64      | NEON       | 128-bit (4×f32) | `vsubq_f32`, `vfmaq_f32`, `vaddvq_f32` |
//! | x86_64+AVX2  | AVX2+FMA   | 256-bit (8×f32) | `_mm256_sub_ps`, `_mm256_fmadd_ps`  |
//! | other        | scalar     | 1×f32           | auto-vectorized iterator            |
//!
//! Every caller goes through [`l2_distance_squared`], so a given build ranks
//! with one kernel consistently and identical vectors always score exactly 0.

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn l2_distance_squared_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len();
    let chunks = n / 4;
    let mut acc = vdupq_n_f32(0.0);
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());

    for i in 0..chunks {
        let diff = vsubq_f32(vld1q_f32(a_ptr.add(i * 4)), vld1q_f32(b_ptr.add(i * 4)));
        acc = vfmaq_f32(acc, diff, diff);
    }

    let mut sum = vaddvq_f32(acc);
    for i in chunks * 4..n {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn l2_distance_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let chunks = n / 8;
    let mut acc = _mm256_setzero_ps();
    let (a_ptr, b_ptr) = (a.as_ptr(), b.as_ptr());

    for i in 0..chunks {
        let diff = _mm256_sub_ps(
            _mm256_loadu_ps(a_ptr.add(i * 8)),
            _mm256_loadu_ps(b_ptr.add(i * 8)),
        );
        acc = _mm256_fmadd_ps(diff, diff, acc);
    }

    // 8 lanes -> 1
    let sum128 = _mm_add_ps(_mm256_castps256_ps128(acc), _mm256_extractf128_ps(acc, 1));
    let sums = _mm_add_ps(sum128, _mm_movehdup_ps(sum128));
    let mut sum = _mm_cvtss_f32(_mm_add_ss(sums, _mm_movehl_ps(sums, sums)));

    for i in chunks * 8..n {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

#[inline(always)]
fn l2_distance_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Squared L2 (Euclidean) distance `||a - b||²`.
///
/// This is the score reported to callers: lower is more similar, 0 is an exact
/// match. Slices of different lengths are compared over the shorter one;
/// callers validate dimensions before getting here.
#[inline(always)]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { l2_distance_squared_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { l2_distance_squared_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    l2_distance_squared_scalar(a, b)
}

/// L2 (Euclidean) distance `||a - b||`
#[inline(always)]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_distance_squared(a, b).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_distance() {
        let a = [0.0, 0.0, 0.0];
        let b = [3.0, 4.0, 0.0];
        assert!((l2_distance(&a, &b) - 5.0).abs() < 1e-6);
        assert!((l2_distance_squared(&a, &b) - 25.0).abs() < 1e-5);
    }

    #[test]
    fn test_length_mismatch_stays_in_bounds() {
        let long: Vec<f32> = (0..37).map(|i| i as f32).collect();
        let short = vec![0.0f32; 20];
        let expected: f32 = (0..20).map(|i| (i * i) as f32).sum();
        assert_eq!(l2_distance_squared(&long, &short), expected);
        assert_eq!(l2_distance_squared(&short, &long), expected);
    }

    #[test]
    fn test_identical_vectors_are_exactly_zero() {
        let a: Vec<f32> = (0..2048).map(|i| (i as f32 * 0.37).sin()).collect();
        assert_eq!(l2_distance_squared(&a, &a), 0.0);
    }

    #[test]
    fn test_matches_scalar_on_odd_lengths() {
        for dim in [1usize, 3, 7, 9, 17, 129] {
            let a: Vec<f32> = (0..dim).map(|i| i as f32 / 10.0).collect();
            let b: Vec<f32> = (0..dim).map(|i| (dim - i) as f32 / 10.0).collect();
            let expected = l2_distance_squared_scalar(&a, &b);
            let got = l2_distance_squared(&a, &b);
            assert!(
                (got - expected).abs() <= expected.abs() * 1e-5 + 1e-6,
                "dim {}: {} vs {}",
                dim,
                got,
                expected
            );
        }
    }

    #[test]
    fn test_symmetry() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [4.0f32, 5.0, 6.0];
        assert_eq!(l2_distance_squared(&a, &b), l2_distance_squared(&b, &a));
    }

    #[test]
    fn test_empty_vectors() {
        assert_eq!(l2_distance_squared(&[], &[]), 0.0);
    }
}
