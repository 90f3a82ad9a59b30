//! Arena-style block-sparse matrix.
//!
//! The matrix is a `major_rows × major_cols` grid of dense
//! `minor_rows × minor_cols` blocks, of which only the non-zero ones are stored.
//! Storage is a single ordered `(block_row, block_col) → slot` index plus one
//! contiguous value array holding every stored block in column-major order.
//! Iteration always follows `(block_row, block_col)` order, so results never
//! depend on the order in which blocks were created.

use super::{LinAlgError, LinAlgResult};
use nalgebra::{DMatrix, DVector, Dim, Matrix, RawStorage};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;

/// Compressed sparse row arrays (0-based) for an external solver.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressedRows {
    pub nrows: usize,
    pub ncols: usize,
    /// `nrows + 1` offsets into `col_indices` / `values`.
    pub row_offsets: Vec<usize>,
    pub col_indices: Vec<usize>,
    pub values: Vec<f64>,
}

impl CompressedRows {
    pub fn nnz(&self) -> usize {
        self.values.len()
    }
}

/// Block-sparse matrix of uniform dense blocks.
#[derive(Clone)]
pub struct SparseBlockMatrix {
    major_rows: usize,
    major_cols: usize,
    minor_rows: usize,
    minor_cols: usize,
    index: BTreeMap<(usize, usize), usize>,
    values: Vec<f64>,
}

impl fmt::Debug for SparseBlockMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseBlockMatrix")
            .field("blocks", &(self.major_rows, self.major_cols))
            .field("block_size", &(self.minor_rows, self.minor_cols))
            .field("stored_blocks", &self.index.len())
            .finish()
    }
}

impl PartialEq for SparseBlockMatrix {
    /// Same shape, same stored blocks, bit-identical values.
    fn eq(&self, other: &Self) -> bool {
        self.shape() == other.shape()
            && self.index.len() == other.index.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a == b)
    }
}

impl SparseBlockMatrix {
    /// Empty matrix of `major_rows × major_cols` blocks of size `minor_rows × minor_cols`.
    pub fn new(major_rows: usize, major_cols: usize, minor_rows: usize, minor_cols: usize) -> Self {
        Self {
            major_rows,
            major_cols,
            minor_rows,
            minor_cols,
            index: BTreeMap::new(),
            values: Vec::new(),
        }
    }

    /// `(major_rows, major_cols, minor_rows, minor_cols)`.
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (
            self.major_rows,
            self.major_cols,
            self.minor_rows,
            self.minor_cols,
        )
    }

    pub fn major_rows(&self) -> usize {
        self.major_rows
    }

    pub fn major_cols(&self) -> usize {
        self.major_cols
    }

    pub fn minor_rows(&self) -> usize {
        self.minor_rows
    }

    pub fn minor_cols(&self) -> usize {
        self.minor_cols
    }

    /// Scalar row count.
    pub fn nrows(&self) -> usize {
        self.major_rows * self.minor_rows
    }

    /// Scalar column count.
    pub fn ncols(&self) -> usize {
        self.major_cols * self.minor_cols
    }

    /// Number of stored blocks.
    pub fn num_blocks(&self) -> usize {
        self.index.len()
    }

    #[inline]
    fn block_len(&self) -> usize {
        self.minor_rows * self.minor_cols
    }

    pub fn has_block(&self, row: usize, col: usize) -> bool {
        self.index.contains_key(&(row, col))
    }

    /// Column-major values of block `(row, col)`, if stored.
    pub fn block_slice(&self, row: usize, col: usize) -> Option<&[f64]> {
        let len = self.block_len();
        self.index
            .get(&(row, col))
            .map(|&slot| &self.values[slot * len..(slot + 1) * len])
    }

    /// Copy of block `(row, col)`, if stored.
    pub fn block(&self, row: usize, col: usize) -> Option<DMatrix<f64>> {
        self.block_slice(row, col)
            .map(|s| DMatrix::from_column_slice(self.minor_rows, self.minor_cols, s))
    }

    /// Stored blocks in `(row, col)` order with their column-major values.
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), &[f64])> {
        let len = self.block_len();
        self.index
            .iter()
            .map(move |(&key, &slot)| (key, &self.values[slot * len..(slot + 1) * len]))
    }

    /// Stored blocks of one block row, in column order.
    pub fn row_blocks(&self, row: usize) -> impl Iterator<Item = (usize, &[f64])> {
        let len = self.block_len();
        self.index
            .range((row, 0)..(row + 1, 0))
            .map(move |(&(_, col), &slot)| (col, &self.values[slot * len..(slot + 1) * len]))
    }

    /// Copies of the diagonal blocks; `None` where no block is stored.
    pub fn diagonal_blocks(&self) -> Vec<Option<DMatrix<f64>>> {
        (0..self.major_rows.min(self.major_cols))
            .map(|b| self.block(b, b))
            .collect()
    }

    /// Frobenius norm of `self - other`; missing blocks count as zero.
    pub fn frobenius_distance(&self, other: &Self) -> LinAlgResult<f64> {
        if self.shape() != other.shape() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "{:?} vs {:?}",
                self.shape(),
                other.shape()
            )));
        }
        let mut sum = 0.0;
        for (key, a) in self.iter() {
            match other.block_slice(key.0, key.1) {
                Some(b) => sum += a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>(),
                None => sum += a.iter().map(|x| x * x).sum::<f64>(),
            }
        }
        for (key, b) in other.iter() {
            if !self.has_block(key.0, key.1) {
                sum += b.iter().map(|y| y * y).sum::<f64>();
            }
        }
        Ok(sum.sqrt())
    }

    fn check_block_index(&self, row: usize, col: usize) -> LinAlgResult<()> {
        if row >= self.major_rows || col >= self.major_cols {
            return Err(LinAlgError::InvalidInput(format!(
                "block ({row}, {col}) outside {}×{} block grid",
                self.major_rows, self.major_cols
            )));
        }
        Ok(())
    }

    fn check_block_shape(&self, rows: usize, cols: usize) -> LinAlgResult<()> {
        if rows != self.minor_rows || cols != self.minor_cols {
            return Err(LinAlgError::DimensionMismatch(format!(
                "block is {rows}×{cols}, expected {}×{}",
                self.minor_rows, self.minor_cols
            )));
        }
        Ok(())
    }

    /// Slot of block `(row, col)`, creating a zero block on first use.
    fn slot_or_insert(&mut self, row: usize, col: usize) -> usize {
        let next = self.index.len();
        let len = self.block_len();
        let slot = *self.index.entry((row, col)).or_insert(next);
        if slot == next {
            self.values.resize((next + 1) * len, 0.0);
        }
        slot
    }

    fn block_values_mut(&mut self, row: usize, col: usize) -> &mut [f64] {
        let slot = self.slot_or_insert(row, col);
        let len = self.block_len();
        &mut self.values[slot * len..(slot + 1) * len]
    }

    /// Overwrite block `(row, col)`.
    pub fn set_block<R: Dim, C: Dim, S: RawStorage<f64, R, C>>(
        &mut self,
        row: usize,
        col: usize,
        block: &Matrix<f64, R, C, S>,
    ) -> LinAlgResult<()> {
        self.check_block_index(row, col)?;
        self.check_block_shape(block.nrows(), block.ncols())?;
        let rows = self.minor_rows;
        let dst = self.block_values_mut(row, col);
        for j in 0..block.ncols() {
            for i in 0..rows {
                dst[j * rows + i] = block[(i, j)];
            }
        }
        Ok(())
    }

    /// Accumulate `block` into block `(row, col)`.
    pub fn add_to_block<R: Dim, C: Dim, S: RawStorage<f64, R, C>>(
        &mut self,
        row: usize,
        col: usize,
        block: &Matrix<f64, R, C, S>,
    ) -> LinAlgResult<()> {
        self.check_block_index(row, col)?;
        self.check_block_shape(block.nrows(), block.ncols())?;
        let rows = self.minor_rows;
        let dst = self.block_values_mut(row, col);
        for j in 0..block.ncols() {
            for i in 0..rows {
                dst[j * rows + i] += block[(i, j)];
            }
        }
        Ok(())
    }

    /// Matrix with block `(col, row)` equal to the transpose of block `(row, col)`.
    pub fn transpose(&self) -> Self {
        let mut result = Self::new(
            self.major_cols,
            self.major_rows,
            self.minor_cols,
            self.minor_rows,
        );
        result.values.reserve(self.values.len());
        let (rows, cols) = (self.minor_rows, self.minor_cols);
        for ((row, col), block) in self.iter() {
            let dst = result.block_values_mut(col, row);
            for j in 0..cols {
                for i in 0..rows {
                    // Transposed block is cols×rows, column-major.
                    dst[i * cols + j] = block[j * rows + i];
                }
            }
        }
        result
    }

    /// Block-sparse product `op(self) · other`, with `op` the transpose when
    /// `transpose_first` is set.
    ///
    /// Transposing the second operand is not supported and reports
    /// [`LinAlgError::Unsupported`]; transpose it explicitly instead.
    pub fn dot_product(
        &self,
        other: &SparseBlockMatrix,
        transpose_first: bool,
        transpose_second: bool,
    ) -> LinAlgResult<Self> {
        if transpose_second {
            return Err(LinAlgError::Unsupported(
                "block product with a transposed second operand".to_string(),
            ));
        }
        if transpose_first {
            return self.transpose().dot_product(other, false, false);
        }
        if self.major_cols != other.major_rows || self.minor_cols != other.minor_rows {
            return Err(LinAlgError::DimensionMismatch(format!(
                "cannot multiply {}×{} blocks of {}×{} by {}×{} blocks of {}×{}",
                self.major_rows,
                self.major_cols,
                self.minor_rows,
                self.minor_cols,
                other.major_rows,
                other.major_cols,
                other.minor_rows,
                other.minor_cols
            )));
        }

        let mut result = Self::new(
            self.major_rows,
            other.major_cols,
            self.minor_rows,
            other.minor_cols,
        );
        let (m, inner, n) = (self.minor_rows, self.minor_cols, other.minor_cols);
        for ((i, k), a) in self.iter() {
            for (j, b) in other.row_blocks(k) {
                let dst = result.block_values_mut(i, j);
                for c in 0..n {
                    for p in 0..inner {
                        let b_pc = b[c * inner + p];
                        if b_pc == 0.0 {
                            continue;
                        }
                        for r in 0..m {
                            dst[c * m + r] += a[p * m + r] * b_pc;
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    /// Dense product `op(self) · vector`, with `op` the transpose when `transpose` is set.
    pub fn dot_vector(&self, vector: &DVector<f64>, transpose: bool) -> LinAlgResult<DVector<f64>> {
        let (input_len, output_len) = if transpose {
            (self.nrows(), self.ncols())
        } else {
            (self.ncols(), self.nrows())
        };
        if vector.len() != input_len {
            return Err(LinAlgError::DimensionMismatch(format!(
                "vector of length {} for {} matrix input of length {input_len}",
                vector.len(),
                if transpose { "transposed" } else { "plain" }
            )));
        }

        let (rows, cols) = (self.minor_rows, self.minor_cols);
        let mut result = DVector::zeros(output_len);
        for ((br, bc), block) in self.iter() {
            let (row_offset, col_offset) = (br * rows, bc * cols);
            for j in 0..cols {
                for i in 0..rows {
                    let v = block[j * rows + i];
                    if transpose {
                        result[col_offset + j] += v * vector[row_offset + i];
                    } else {
                        result[row_offset + i] += v * vector[col_offset + j];
                    }
                }
            }
        }
        Ok(result)
    }

    /// Export the stored scalars as compressed sparse rows.
    ///
    /// With `symmetric`, only entries on or above the diagonal are emitted;
    /// this requires a square matrix of square blocks.
    pub fn to_compressed_rows(&self, symmetric: bool) -> LinAlgResult<CompressedRows> {
        if symmetric && !self.is_square() {
            return Err(LinAlgError::InvalidInput(
                "upper-triangle export of a non-square block matrix".to_string(),
            ));
        }
        let (rows, cols) = (self.minor_rows, self.minor_cols);
        let mut row_offsets = Vec::with_capacity(self.nrows() + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);

        for br in 0..self.major_rows {
            let blocks: Vec<(usize, &[f64])> = self.row_blocks(br).collect();
            for i in 0..rows {
                let row = br * rows + i;
                for &(bc, block) in &blocks {
                    for j in 0..cols {
                        let col = bc * cols + j;
                        if symmetric && col < row {
                            continue;
                        }
                        col_indices.push(col);
                        values.push(block[j * rows + i]);
                    }
                }
                row_offsets.push(values.len());
            }
        }

        Ok(CompressedRows {
            nrows: self.nrows(),
            ncols: self.ncols(),
            row_offsets,
            col_indices,
            values,
        })
    }

    /// Dense copy.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let (rows, cols) = (self.minor_rows, self.minor_cols);
        let mut dense = DMatrix::zeros(self.nrows(), self.ncols());
        for ((br, bc), block) in self.iter() {
            for j in 0..cols {
                for i in 0..rows {
                    dense[(br * rows + i, bc * cols + j)] = block[j * rows + i];
                }
            }
        }
        dense
    }

    /// Square matrix built from square blocks.
    pub fn is_square(&self) -> bool {
        self.major_rows == self.major_cols && self.minor_rows == self.minor_cols
    }

    /// Scalar diagonal; entries of missing diagonal blocks are zero.
    pub fn diagonal(&self) -> LinAlgResult<DVector<f64>> {
        if !self.is_square() {
            return Err(LinAlgError::InvalidInput(
                "diagonal of a non-square block matrix".to_string(),
            ));
        }
        let n = self.minor_rows;
        let mut diagonal = DVector::zeros(self.nrows());
        for b in 0..self.major_rows {
            if let Some(block) = self.block_slice(b, b) {
                for i in 0..n {
                    diagonal[b * n + i] = block[i * n + i];
                }
            }
        }
        Ok(diagonal)
    }

    /// Sum of the scalar diagonal.
    pub fn trace(&self) -> LinAlgResult<f64> {
        Ok(self.diagonal()?.sum())
    }

    /// Add `values` to the scalar diagonal, creating diagonal blocks as needed.
    pub fn add_to_diagonal(&mut self, values: &DVector<f64>) -> LinAlgResult<()> {
        if !self.is_square() || values.len() != self.nrows() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "diagonal update of length {} for a {}×{} matrix",
                values.len(),
                self.nrows(),
                self.ncols()
            )));
        }
        let n = self.minor_rows;
        for b in 0..self.major_rows {
            let dst = self.block_values_mut(b, b);
            for i in 0..n {
                dst[i * n + i] += values[b * n + i];
            }
        }
        Ok(())
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Random matrix whose blocks are each present with probability `density`.
    pub fn random<R: Rng + ?Sized>(
        major_rows: usize,
        major_cols: usize,
        minor_rows: usize,
        minor_cols: usize,
        density: f64,
        rng: &mut R,
    ) -> Self {
        let mut m = Self::new(major_rows, major_cols, minor_rows, minor_cols);
        for row in 0..major_rows {
            for col in 0..major_cols {
                if rng.random::<f64>() < density {
                    let dst = m.block_values_mut(row, col);
                    dst.iter_mut().for_each(|v| *v = rng.random_range(-1.0..1.0));
                }
            }
        }
        m
    }

    /// Random symmetric positive definite matrix `Lᵀ L` of `num_blocks ×
    /// num_blocks` blocks of size `block_size`.
    ///
    /// `L` has one block row per pair `i <= j`: a diagonal pair holds a random
    /// block in column `i`; an off-diagonal pair holds random blocks in columns
    /// `i` and `j` with probability `density`. Every column of `L` therefore
    /// owns a random square block and `Lᵀ L` has full rank almost surely.
    pub fn random_positive_definite<R: Rng + ?Sized>(
        num_blocks: usize,
        block_size: usize,
        density: f64,
        rng: &mut R,
    ) -> LinAlgResult<Self> {
        let pairs = num_blocks * (num_blocks + 1) / 2;
        let mut factor = Self::new(pairs, num_blocks, block_size, block_size);
        let mut row = 0;
        for i in 0..num_blocks {
            for j in i..num_blocks {
                if i == j || rng.random::<f64>() < density {
                    for col in [i, j] {
                        let dst = factor.block_values_mut(row, col);
                        dst.iter_mut().for_each(|v| *v = rng.random_range(-1.0..1.0));
                    }
                }
                row += 1;
            }
        }
        factor.dot_product(&factor, true, false)
    }
}
