use crate::error::SimError;

/// Column-compressed sparse integer matrix.
///
/// The stepper only ever slices whole columns (the stoichiometry of a fired
/// transition, the dependency set of a transition, the compartments a select
/// column picks out), so the storage is the classic `colptr`/`rowind`/
/// `values` triple and `col` is the one access path.
#[derive(Clone, Debug)]
pub struct SparseMatrix {
    nrow: usize,
    ncol: usize,
    colptr: Vec<usize>,
    rowind: Vec<usize>,
    values: Vec<i32>,
}

impl SparseMatrix {
    /// Compress a dense row-major `nrow x ncol` buffer, keeping non-zeros.
    pub fn from_dense(nrow: usize, ncol: usize, data: &[i32]) -> Result<Self, SimError> {
        if data.len() != nrow * ncol {
            return Err(SimError::Shape(format!(
                "dense matrix has {} entries, expected {}x{}",
                data.len(),
                nrow,
                ncol
            )));
        }
        let mut colptr = Vec::with_capacity(ncol + 1);
        let mut rowind = Vec::new();
        let mut values = Vec::new();
        colptr.push(0);
        for j in 0..ncol {
            for i in 0..nrow {
                let value = data[i * ncol + j];
                if value != 0 {
                    rowind.push(i);
                    values.push(value);
                }
            }
            colptr.push(rowind.len());
        }
        Ok(Self {
            nrow,
            ncol,
            colptr,
            rowind,
            values,
        })
    }

    /// Build from pre-assembled compressed-column parts.
    pub fn from_parts(
        nrow: usize,
        ncol: usize,
        colptr: Vec<usize>,
        rowind: Vec<usize>,
        values: Vec<i32>,
    ) -> Result<Self, SimError> {
        if colptr.len() != ncol + 1 || colptr[0] != 0 {
            return Err(SimError::Shape(format!(
                "column pointer has {} entries, expected {}",
                colptr.len(),
                ncol + 1
            )));
        }
        if colptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(SimError::Shape("column pointer must be nondecreasing".into()));
        }
        let nnz = *colptr.last().unwrap_or(&0);
        if rowind.len() != nnz || values.len() != nnz {
            return Err(SimError::Shape(format!(
                "index/value length {}/{} does not match column pointer end {}",
                rowind.len(),
                values.len(),
                nnz
            )));
        }
        if rowind.iter().any(|&i| i >= nrow) {
            return Err(SimError::Shape(format!(
                "row index exceeds row count {}",
                nrow
            )));
        }
        Ok(Self {
            nrow,
            ncol,
            colptr,
            rowind,
            values,
        })
    }

    /// All-zero matrix, for models without events or shifts.
    pub fn zero(nrow: usize, ncol: usize) -> Self {
        Self {
            nrow,
            ncol,
            colptr: vec![0; ncol + 1],
            rowind: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn nrow(&self) -> usize {
        self.nrow
    }

    pub fn ncol(&self) -> usize {
        self.ncol
    }

    pub fn nnz(&self) -> usize {
        self.rowind.len()
    }

    /// Row indices and values of column `j`.
    pub fn col(&self, j: usize) -> (&[usize], &[i32]) {
        let lo = self.colptr[j];
        let hi = self.colptr[j + 1];
        (&self.rowind[lo..hi], &self.values[lo..hi])
    }

    /// Value at `(i, j)`, zero when absent.
    pub fn get(&self, i: usize, j: usize) -> i32 {
        let (rows, vals) = self.col(j);
        rows.iter()
            .position(|&r| r == i)
            .map(|p| vals[p])
            .unwrap_or(0)
    }

    pub fn is_zero_one(&self) -> bool {
        self.values.iter().all(|&v| v == 1)
    }
}
