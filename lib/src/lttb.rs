use crate::error::{Error, Result};
use crate::point::Point;

/// Largest Triangle Three Buckets (LTTB) downsampling algorithm.
///
/// Reduces a slice of points sorted by x to exactly `threshold` points
/// while preserving the visual shape of the data. The first and last points
/// are always kept; every other output point is the member of its bucket
/// forming the largest triangle with the previously selected point and the
/// average of the following bucket. Output points are selected, never
/// interpolated.
///
/// Returns the original data unchanged if `threshold >= data.len()`, and
/// only the two endpoints if `threshold == 2`.
pub fn downsample(data: &[Point], threshold: usize) -> Result<Vec<Point>> {
    validate(data, threshold)?;

    let n = data.len();
    if threshold >= n {
        return Ok(data.to_vec());
    }
    if threshold < 3 {
        return Ok(vec![data[0], data[n - 1]]);
    }

    let bounds = bucket_bounds(n, threshold);
    let mut sampled = Vec::with_capacity(threshold);
    sampled.push(data[0]);

    let mut a = data[0];
    for w in bounds.windows(3) {
        let (start, end, next_end) = (w[0], w[1], w[2]);

        // Average of next bucket for the triangle area calculation. For the
        // last interior bucket this is the fixed last point.
        let (avg_x, avg_y) = mean(&data[end..next_end]);

        let mut max_area = -1.0f64;
        let mut max_idx = start;
        for (j, p) in data.iter().enumerate().take(end).skip(start) {
            let area = ((p.x - a.x) * (avg_y - a.y) - (avg_x - a.x) * (p.y - a.y)).abs();
            // Strict comparison keeps the earliest index on ties.
            if area > max_area {
                max_area = area;
                max_idx = j;
            }
        }

        a = data[max_idx];
        sampled.push(a);
    }

    sampled.push(data[n - 1]);
    Ok(sampled)
}

/// Checks the preconditions of [`downsample`] without doing any work.
pub fn validate(data: &[Point], threshold: usize) -> Result<()> {
    if threshold < 2 {
        return Err(Error::invalid(format!(
            "threshold must be at least 2, got {threshold}"
        )));
    }
    if data.len() < 2 {
        return Err(Error::invalid(format!(
            "need at least 2 points, got {}",
            data.len()
        )));
    }

    let mut prev = f64::NEG_INFINITY;
    for (i, p) in data.iter().enumerate() {
        if !p.is_finite() {
            return Err(Error::invalid(format!(
                "non-finite coordinate at index {i}: ({}, {})",
                p.x, p.y
            )));
        }
        if p.x < prev {
            return Err(Error::invalid(format!(
                "points not sorted by x at index {i}: {} follows {}",
                p.x, prev
            )));
        }
        prev = p.x;
    }

    Ok(())
}

// Boundaries of the threshold-2 interior buckets over data[1..n-1], followed
// by n so that bounds[i+1]..bounds[i+2] is always the bucket after bucket i.
// Integer division keeps the partition exact and reproducible. The product is
// taken in u128; the quotient never exceeds n - 2.
fn bucket_bounds(n: usize, threshold: usize) -> Vec<usize> {
    let buckets = (threshold - 2) as u128;
    let interior = (n - 2) as u128;
    let mut bounds: Vec<usize> = (0..=buckets)
        .map(|k| 1 + (k * interior / buckets) as usize)
        .collect();
    bounds.push(n);
    bounds
}

fn mean(points: &[Point]) -> (f64, f64) {
    let (sx, sy) = points
        .iter()
        .fold((0.0f64, 0.0f64), |(sx, sy), p| (sx + p.x, sy + p.y));
    let len = points.len() as f64;
    (sx / len, sy / len)
}
