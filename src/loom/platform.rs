/// Splits `data` into consecutive rows of `len` elements and calls `f(index, row)` on each.
///
/// Rows are disjoint, so every element is written by exactly one call. With the `rayon` feature
/// the rows are processed on the current thread pool.
#[inline]
pub fn for_each_row<F>(data: &mut [f32], len: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Send + Sync,
{
    debug_assert!(len > 0 && data.len() % len == 0);

    #[cfg(not(feature = "rayon"))]
    data.chunks_exact_mut(len)
        .enumerate()
        .for_each(|(index, row)| f(index, row));

    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        data.par_chunks_exact_mut(len)
            .enumerate()
            .for_each(|(index, row)| f(index, row));
    }
}

#[cfg(test)]
mod tests {
    use super::for_each_row;

    #[test]
    fn test_rows_written_once() {
        let mut data = vec![0.0f32; 6 * 5];
        for_each_row(&mut data, 5, |index, row| {
            row.iter_mut().for_each(|x| *x += index as f32 + 1.0)
        });
        for (index, row) in data.chunks_exact(5).enumerate() {
            assert!(row.iter().all(|&x| x == index as f32 + 1.0));
        }
    }
}
