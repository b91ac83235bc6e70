use crate::error::SimError;

/// Which `(row, time_index)` positions a sparse recording keeps.
#[derive(Clone, Debug)]
pub struct OutputMask {
    per_col: Vec<Vec<usize>>,
}

impl OutputMask {
    pub fn new(
        nrows: usize,
        n_times: usize,
        entries: &[(usize, usize)],
    ) -> Result<Self, SimError> {
        let mut per_col = vec![Vec::new(); n_times];
        for &(row, col) in entries {
            if row >= nrows || col >= n_times {
                return Err(SimError::Shape(format!(
                    "output mask entry ({}, {}) is outside a {}x{} recording",
                    row, col, nrows, n_times
                )));
            }
            per_col[col].push(row);
        }
        for rows in &mut per_col {
            rows.sort_unstable();
            rows.dedup();
        }
        Ok(Self { per_col })
    }
}

/// A recorded trajectory: one state column per observation time, dense or
/// restricted to a mask. Dense data is time-major (column `k` of the
/// logical `rows x T` matrix occupies `data[k*rows .. (k+1)*rows]`).
#[derive(Clone, Debug, PartialEq)]
pub enum OutputData<T> {
    Dense(Vec<T>),
    Sparse {
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: Vec<T>,
    },
}

enum Storage<T> {
    Dense(Vec<T>),
    Sparse {
        mask: OutputMask,
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: Vec<T>,
    },
}

/// Accumulates one output stream (`U` or `V`). Recording happens on the
/// driver thread after each parallel phase; a run that stops early simply
/// finishes with fewer columns written.
pub struct Recorder<T> {
    nrows: usize,
    written: usize,
    storage: Storage<T>,
}

impl<T: Copy> Recorder<T> {
    pub fn dense(nrows: usize, n_times: usize) -> Self {
        Self {
            nrows,
            written: 0,
            storage: Storage::Dense(Vec::with_capacity(nrows * n_times)),
        }
    }

    pub fn sparse(nrows: usize, mask: OutputMask) -> Self {
        Self {
            nrows,
            written: 0,
            storage: Storage::Sparse {
                mask,
                rows: Vec::new(),
                cols: Vec::new(),
                values: Vec::new(),
            },
        }
    }

    pub fn push_column(&mut self, state: &[T]) {
        debug_assert_eq!(state.len(), self.nrows);
        match &mut self.storage {
            Storage::Dense(data) => data.extend_from_slice(state),
            Storage::Sparse {
                mask,
                rows,
                cols,
                values,
            } => {
                for &row in &mask.per_col[self.written] {
                    rows.push(row);
                    cols.push(self.written);
                    values.push(state[row]);
                }
            }
        }
        self.written += 1;
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn finish(self) -> OutputData<T> {
        match self.storage {
            Storage::Dense(data) => OutputData::Dense(data),
            Storage::Sparse {
                rows, cols, values, ..
            } => OutputData::Sparse { rows, cols, values },
        }
    }
}
