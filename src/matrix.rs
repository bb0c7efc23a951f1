//! Column-major host matrices and chunk tiling.

/// A dense column-major matrix: element `(row, col)` lives at
/// `col * rows + row`. Rows are points, columns are features.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
}

impl<T: Copy> Matrix<T> {
    pub fn from_vec(data: Vec<T>, rows: usize, cols: usize) -> Matrix<T> {
        assert_eq!(data.len(), rows * cols, "matrix dimensions do not match data length");
        Matrix { data, rows, cols }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[col * self.rows + row]
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self.data[col * self.rows + row] = value;
    }
}

/// Re-tiles a column-major matrix so that every window of
/// `points_per_chunk` rows becomes an independent, contiguous column-major
/// sub-matrix. A chunk staged to the device is then self-contained: the
/// kernel indexes it with the chunk's own row count as the column stride.
///
/// The final tile carries the remaining rows and uses that remainder as
/// its stride.
pub fn partition_tiles<T: Copy>(matrix: &Matrix<T>, points_per_chunk: usize) -> Vec<T> {
    assert!(points_per_chunk > 0);
    let rows = matrix.rows();
    let cols = matrix.cols();
    let src = matrix.data();

    let mut dst = Vec::with_capacity(src.len());
    let mut base = 0;
    while base < rows {
        let width = points_per_chunk.min(rows - base);
        for f in 0..cols {
            let col = &src[f * rows + base..f * rows + base + width];
            dst.extend_from_slice(col);
        }
        base += width;
    }
    dst
}

/// Gathers the first `k` rows as a column-major `k x cols` centroid
/// matrix ("first K points" initialization).
pub fn first_k_centroids<T: Copy>(matrix: &Matrix<T>, k: usize) -> Vec<T> {
    assert!(k <= matrix.rows());
    let mut out = Vec::with_capacity(k * matrix.cols());
    for f in 0..matrix.cols() {
        for c in 0..k {
            out.push(matrix.get(c, f));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Matrix<u32> {
        // 5 points, 2 features; column-major.
        let xs = [0, 1, 2, 3, 4];
        let ys = [10, 11, 12, 13, 14];
        let mut data = Vec::new();
        data.extend_from_slice(&xs);
        data.extend_from_slice(&ys);
        Matrix::from_vec(data, 5, 2)
    }

    #[test]
    fn indexing_is_column_major() {
        let m = sample();
        assert_eq!(m.get(3, 0), 3);
        assert_eq!(m.get(3, 1), 13);
    }

    #[test]
    fn tiles_are_self_contained() {
        let m = sample();
        let tiled = partition_tiles(&m, 2);
        // Tile 0: points 0..2, tile 1: points 2..4, tile 2: point 4.
        assert_eq!(tiled, vec![0, 1, 10, 11, 2, 3, 12, 13, 4, 14]);
    }

    #[test]
    fn single_tile_is_identity() {
        let m = sample();
        assert_eq!(partition_tiles(&m, 5), m.data().to_vec());
        assert_eq!(partition_tiles(&m, 8), m.data().to_vec());
    }

    #[test]
    fn first_k_gathers_leading_rows() {
        let m = sample();
        assert_eq!(first_k_centroids(&m, 2), vec![0, 1, 10, 11]);
    }
}
