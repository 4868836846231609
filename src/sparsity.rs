use std::collections::BTreeSet;

/// Row/column indices of the structurally nonzero entries of a matrix.
///
/// Entries are sorted by row, then column. Derivative values are always
/// reported in this order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsityPattern {
    num_rows: usize,
    num_cols: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl SparsityPattern {
    /// Builds a pattern from the column sets of each row.
    pub(crate) fn from_rows<I, R>(num_cols: usize, rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = usize>,
    {
        let mut pattern = Self {
            num_rows: 0,
            num_cols,
            rows: Vec::new(),
            cols: Vec::new(),
        };
        for (i, row) in rows.into_iter().enumerate() {
            pattern.num_rows = i + 1;
            for j in row {
                debug_assert!(j < num_cols);
                pattern.rows.push(i);
                pattern.cols.push(j);
            }
        }
        pattern
    }

    /// Lower triangle (row ≥ col) of a symmetric interaction structure,
    /// restricted to the first `n` variables.
    pub(crate) fn lower_triangle(n: usize, interactions: &[BTreeSet<usize>]) -> Self {
        let rows = interactions
            .iter()
            .take(n)
            .enumerate()
            .map(|(i, set)| set.range(..=i).copied().collect::<Vec<_>>());
        let mut pattern = Self::from_rows(n, rows);
        pattern.num_rows = n;
        pattern
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }

    /// Mirrors a lower-triangle pattern into the full symmetric structure.
    fn symmetric_rows(&self) -> Vec<Vec<usize>> {
        let mut rows = vec![Vec::new(); self.num_rows];
        for (i, j) in self.iter() {
            rows[i].push(j);
            if i != j {
                rows[j].push(i);
            }
        }
        rows
    }

    fn row_lists(&self) -> Vec<Vec<usize>> {
        let mut rows = vec![Vec::new(); self.num_rows];
        for (i, j) in self.iter() {
            rows[i].push(j);
        }
        rows
    }
}

/// Column coloring in which no two columns of one color share a row.
///
/// Multiplying the matrix by the seed of one color yields, in each row, the
/// single entry whose column has that color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnColoring {
    colors: Vec<usize>,
    num_colors: usize,
}

impl ColumnColoring {
    /// Coloring for direct recovery of a general sparse matrix.
    pub(crate) fn for_jacobian(pattern: &SparsityPattern) -> Self {
        Self::greedy(pattern.num_cols, &pattern.row_lists())
    }

    /// Coloring for direct recovery of a symmetric matrix stored as its
    /// lower triangle.
    pub(crate) fn for_hessian(pattern: &SparsityPattern) -> Self {
        Self::greedy(pattern.num_cols, &pattern.symmetric_rows())
    }

    fn greedy(num_cols: usize, rows: &[Vec<usize>]) -> Self {
        let mut rows_of_col = vec![Vec::new(); num_cols];
        for (i, row) in rows.iter().enumerate() {
            for &j in row {
                rows_of_col[j].push(i);
            }
        }
        let mut colors = vec![usize::MAX; num_cols];
        let mut num_colors = 0;
        let mut forbidden: Vec<usize> = Vec::new();
        for j in 0..num_cols {
            if rows_of_col[j].is_empty() {
                continue;
            }
            // forbidden[c] == j marks color c as taken by a neighbor of j
            for &i in &rows_of_col[j] {
                for &k in &rows[i] {
                    let c = colors[k];
                    if c != usize::MAX {
                        forbidden[c] = j;
                    }
                }
            }
            let color = (0..num_colors)
                .find(|&c| forbidden[c] != j)
                .unwrap_or(num_colors);
            if color == num_colors {
                num_colors += 1;
                forbidden.push(usize::MAX);
            }
            colors[j] = color;
        }
        Self { colors, num_colors }
    }

    pub(crate) fn num_colors(&self) -> usize {
        self.num_colors
    }

    pub(crate) fn color_of(&self, col: usize) -> usize {
        self.colors[col]
    }

    /// Seed direction selecting every column of `color`.
    pub(crate) fn seed(&self, color: usize, seed: &mut [f64]) {
        for (s, &c) in seed.iter_mut().zip(&self.colors) {
            *s = if c == color { 1.0 } else { 0.0 };
        }
    }
}
