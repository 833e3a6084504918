//! Chunked parallel loops over buffer rows.
//!
//! Each spectral or elementwise kernel partitions its flat index space
//! into contiguous disjoint rows and dispatches them on rayon's persistent
//! worker pool; the caller blocks until every row is done (fork-join per
//! kernel invocation). Disjointness of the row ranges is the only
//! write-exclusion mechanism, so no locking is needed.

use rayon::prelude::*;

/// Runs `body(row_index, row)` over contiguous `row_len`-sized chunks of
/// `data`, in parallel.
pub fn par_for_rows<T, F>(data: &mut [T], row_len: usize, body: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync + Send,
{
    data.par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(r, row)| body(r, row));
}

/// Maps every `row_len`-sized chunk of `data` to a partial value and sums
/// the partials.
pub fn par_map_rows_sum<T, S, F>(data: &[T], row_len: usize, body: F) -> S
where
    T: Sync,
    S: Send + std::iter::Sum,
    F: Fn(usize, &[T]) -> S + Sync + Send,
{
    data.par_chunks(row_len)
        .enumerate()
        .map(|(r, row)| body(r, row))
        .sum()
}

/// Maps every `row_len`-sized chunk of `data` to a partial value and
/// reduces the partials with `fold`.
pub fn par_map_rows_reduce<T, S, F, R>(data: &[T], row_len: usize, body: F, identity: S, fold: R) -> S
where
    T: Sync,
    S: Send + Sync + Copy,
    F: Fn(usize, &[T]) -> S + Sync + Send,
    R: Fn(S, S) -> S + Sync + Send,
{
    data.par_chunks(row_len)
        .enumerate()
        .map(|(r, row)| body(r, row))
        .reduce(|| identity, fold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_disjoint_and_complete() {
        let mut data = vec![0usize; 24];
        par_for_rows(&mut data, 4, |r, row| {
            for (c, v) in row.iter_mut().enumerate() {
                *v = r * 4 + c;
            }
        });
        let want: Vec<usize> = (0..24).collect();
        assert_eq!(data, want);
    }

    #[test]
    fn row_sum_matches_serial() {
        let data: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let total: f64 = par_map_rows_sum(&data, 7, |_, row| row.iter().sum::<f64>());
        assert_eq!(total, 4950.0);
    }

    #[test]
    fn row_reduce_finds_max() {
        let data: Vec<f64> = (0..50).map(|i| ((i * 37) % 50) as f64).collect();
        let max = par_map_rows_reduce(
            &data,
            8,
            |_, row| row.iter().cloned().fold(f64::MIN, f64::max),
            f64::MIN,
            f64::max,
        );
        assert_eq!(max, 49.0);
    }
}
