//! Row-diagonal parity (RDP)
//!
//! With `p = k + 1` prime, a segment is laid out as a grid of `k` rows by
//! `k + 2` columns. Columns `0..k` hold data, column `k` the XOR of each row,
//! and column `k + 1` the XOR of each diagonal `(row + column) mod p` over the
//! first `k + 1` columns; diagonal `p - 1` is not stored. Each cell is one
//! symbol, so every block holds `k` symbols and the block size is the segment
//! size rounded up to `k * k`, divided by `k`.
//!
//! Any two lost blocks can be rebuilt. Every cell satisfies XOR equations
//! (one per row, one per stored diagonal), so decode and repair solve the
//! unknown cells by elimination over GF(2). A single lost data block is
//! repaired from a mix of row and diagonal equations chosen so that the rows
//! read for one overlap the diagonals read for the other, which reads fewer
//! symbols than a full-block repair.

use super::{Scheme, block_id, is_usable, parse_param};
use crate::codec::CodingError;
use crate::sparse::{SparseBlocks, round_up, xor_into};
use bytes::Bytes;
use ecfs_common::{BlockId, Symbol, SymbolSet};
use std::collections::BTreeSet;
use tracing::trace;

const MAX_DATA_BLOCKS: usize = 252;

/// `(column, row)` position of one symbol
type Cell = (usize, usize);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rdp {
    data_blocks: usize,
}

impl Rdp {
    /// Parse a setting of the form `k`, where `k + 1` must be prime
    pub fn from_setting(setting: &str) -> Result<Self, CodingError> {
        let k = parse_param(setting, "data block count")?;
        if k < 2 || k > MAX_DATA_BLOCKS || !is_prime(k + 1) {
            return Err(CodingError::InvalidSetting(format!(
                "rdp needs k >= 2 with k + 1 prime, got {k}"
            )));
        }
        Ok(Self { data_blocks: k })
    }

    const fn prime(&self) -> usize {
        self.data_blocks + 1
    }

    const fn rows(&self) -> usize {
        self.data_blocks
    }

    const fn row_parity(&self) -> usize {
        self.data_blocks
    }

    const fn diagonal_parity(&self) -> usize {
        self.data_blocks + 1
    }

    fn symbol_size(&self, segment_size: usize) -> usize {
        self.block_size(segment_size) / self.rows()
    }

    /// Row of `column` lying on diagonal `diagonal`, if that row exists
    const fn row_on_diagonal(&self, diagonal: usize, column: usize) -> Option<usize> {
        let p = self.prime();
        let row = (diagonal + p - column % p) % p;
        if row < self.rows() { Some(row) } else { None }
    }

    /// Every parity equation as the list of cells that XOR to zero
    fn equations(&self) -> Vec<Vec<Cell>> {
        let k = self.data_blocks;
        let mut equations = Vec::with_capacity(2 * k);

        for row in 0..k {
            equations.push((0..=self.row_parity()).map(|c| (c, row)).collect());
        }
        for diagonal in 0..k {
            let mut cells: Vec<Cell> = (0..=self.row_parity())
                .filter_map(|c| self.row_on_diagonal(diagonal, c).map(|r| (c, r)))
                .collect();
            cells.push((self.diagonal_parity(), diagonal));
            equations.push(cells);
        }
        equations
    }

    /// Cells a repair of data column `lost` reads, given which rows use diagonals
    fn plan_cells(&self, lost: usize, use_diagonal: &[bool]) -> BTreeSet<Cell> {
        let k = self.data_blocks;
        let mut cells = BTreeSet::new();

        for (row, &diagonal_mode) in use_diagonal.iter().enumerate() {
            if diagonal_mode {
                let diagonal = (row + lost) % self.prime();
                for c in (0..=k).filter(|&c| c != lost) {
                    if let Some(r) = self.row_on_diagonal(diagonal, c) {
                        cells.insert((c, r));
                    }
                }
                cells.insert((self.diagonal_parity(), diagonal));
            } else {
                for c in (0..=k).filter(|&c| c != lost) {
                    cells.insert((c, row));
                }
            }
        }
        cells
    }

    /// Greedy choice of row or diagonal recovery for each lost cell
    fn sub_block_plan(&self, lost: usize) -> BTreeSet<Cell> {
        let mut use_diagonal = vec![false; self.rows()];
        let mut best = self.plan_cells(lost, &use_diagonal);

        for row in 0..self.rows() {
            // The cell on the unstored diagonal can only come from its row
            if (row + lost) % self.prime() == self.prime() - 1 {
                continue;
            }
            use_diagonal[row] = true;
            let candidate = self.plan_cells(lost, &use_diagonal);
            if candidate.len() < best.len() {
                best = candidate;
            } else {
                use_diagonal[row] = false;
            }
        }

        trace!(
            lost,
            symbols = best.len(),
            full = self.rows() * self.rows(),
            "rdp sub-block repair plan"
        );
        best
    }

    /// Turn a set of cells into per-block symbol lists with adjacent rows fused
    fn cells_to_symbols(cells: &BTreeSet<Cell>, symbol_size: usize) -> SymbolSet {
        let mut symbols = SymbolSet::new();
        let mut run: Option<(usize, usize, usize)> = None; // column, first row, row count

        for &(column, row) in cells {
            run = match run {
                Some((c, first, count)) if c == column && first + count == row => {
                    Some((c, first, count + 1))
                }
                Some((c, first, count)) => {
                    symbols.push(
                        block_id(c),
                        Symbol::new(first * symbol_size, count * symbol_size),
                    );
                    Some((column, row, 1))
                }
                None => Some((column, row, 1)),
            };
        }
        if let Some((c, first, count)) = run {
            symbols.push(
                block_id(c),
                Symbol::new(first * symbol_size, count * symbol_size),
            );
        }
        symbols
    }

    /// First `k` usable columns in ascending order, each read in full
    fn full_block_plan(&self, health: &[bool], failed: &[BlockId], block_size: usize) -> SymbolSet {
        let sources: Vec<usize> = (0..self.block_count())
            .filter(|&i| is_usable(health, failed, i))
            .take(self.data_blocks)
            .collect();

        let mut symbols = SymbolSet::new();
        if sources.len() == self.data_blocks {
            for i in sources {
                symbols.insert_full(block_id(i), block_size);
            }
        }
        symbols
    }

    /// Every cell of the grid, solving the ones that were not collected
    ///
    /// A cell is `None` when the collected symbols do not determine it.
    fn solve(&self, blocks: &SparseBlocks) -> Vec<Vec<Option<Vec<u8>>>> {
        let s = blocks.block_size() / self.rows();
        let columns = self.block_count();

        let mut grid: Vec<Vec<Option<Vec<u8>>>> = (0..columns)
            .map(|c| {
                (0..self.rows())
                    .map(|r| blocks.range(block_id(c), r * s, s).map(<[u8]>::to_vec))
                    .collect()
            })
            .collect();

        let unknowns: Vec<Cell> = (0..columns)
            .flat_map(|c| (0..self.rows()).map(move |r| (c, r)))
            .filter(|&(c, r)| grid[c][r].is_none())
            .collect();
        if unknowns.is_empty() {
            return grid;
        }
        let index_of = |cell: Cell| unknowns.iter().position(|&u| u == cell);

        // One row per equation: coefficient bits over the unknowns and the
        // XOR of the known cells as right-hand side
        let mut system: Vec<(Vec<bool>, Vec<u8>)> = Vec::new();
        for equation in self.equations() {
            let mut bits = vec![false; unknowns.len()];
            let mut rhs = vec![0u8; s];
            for (c, r) in equation {
                match &grid[c][r] {
                    Some(known) => xor_into(&mut rhs, known),
                    None => {
                        if let Some(i) = index_of((c, r)) {
                            bits[i] ^= true;
                        }
                    }
                }
            }
            if bits.iter().any(|&b| b) {
                system.push((bits, rhs));
            }
        }

        // Gauss-Jordan elimination
        let mut pivots = vec![None; unknowns.len()];
        let mut next = 0;
        for col in 0..unknowns.len() {
            let Some(found) = (next..system.len()).find(|&i| system[i].0[col]) else {
                continue;
            };
            system.swap(next, found);
            let (pivot_bits, pivot_rhs) = system[next].clone();
            for (i, (bits, rhs)) in system.iter_mut().enumerate() {
                if i != next && bits[col] {
                    for (b, p) in bits.iter_mut().zip(&pivot_bits) {
                        *b ^= p;
                    }
                    xor_into(rhs, &pivot_rhs);
                }
            }
            pivots[col] = Some(next);
            next += 1;
        }

        for (col, &(c, r)) in unknowns.iter().enumerate() {
            if let Some(row) = pivots[col] {
                let (bits, rhs) = &system[row];
                let determined = bits.iter().enumerate().all(|(i, &b)| !b || i == col);
                if determined {
                    grid[c][r] = Some(rhs.clone());
                }
            }
        }
        grid
    }

    /// Concatenate the cells of one column
    fn column(grid: &[Vec<Option<Vec<u8>>>], column: usize) -> Result<Vec<u8>, CodingError> {
        let mut out = Vec::new();
        for (row, cell) in grid[column].iter().enumerate() {
            let cell = cell.as_ref().ok_or_else(|| {
                CodingError::DecodingFailed(format!(
                    "symbol {row} of block {column} is not recoverable from the collected symbols"
                ))
            })?;
            out.extend_from_slice(cell);
        }
        Ok(out)
    }
}

impl Scheme for Rdp {
    fn block_count(&self) -> usize {
        self.data_blocks + 2
    }

    fn min_healthy(&self) -> usize {
        self.data_blocks
    }

    fn block_size(&self, segment_size: usize) -> usize {
        let k = self.data_blocks;
        round_up(segment_size.max(1), k * k) / k
    }

    fn segment_alignment(&self) -> usize {
        self.data_blocks * self.data_blocks
    }

    fn is_parity(&self, block_id: BlockId) -> bool {
        block_id as usize >= self.data_blocks
    }

    fn encode(&self, segment: &[u8]) -> Result<Vec<Bytes>, CodingError> {
        let k = self.data_blocks;
        let block_size = self.block_size(segment.len());
        let s = self.symbol_size(segment.len());

        let mut padded = vec![0u8; block_size * k];
        padded[..segment.len()].copy_from_slice(segment);
        let data: Vec<&[u8]> = padded.chunks(block_size).collect();

        let mut row_parity = vec![0u8; block_size];
        for column in &data {
            xor_into(&mut row_parity, column);
        }

        let mut diagonal_parity = vec![0u8; block_size];
        for diagonal in 0..k {
            let out = &mut diagonal_parity[diagonal * s..(diagonal + 1) * s];
            for c in 0..=self.row_parity() {
                if let Some(r) = self.row_on_diagonal(diagonal, c) {
                    let source = if c == self.row_parity() { &row_parity[..] } else { data[c] };
                    xor_into(out, &source[r * s..(r + 1) * s]);
                }
            }
        }

        let mut blocks: Vec<Bytes> = data.into_iter().map(Bytes::copy_from_slice).collect();
        blocks.push(Bytes::from(row_parity));
        blocks.push(Bytes::from(diagonal_parity));
        Ok(blocks)
    }

    fn decode(&self, blocks: &SparseBlocks, segment_size: usize) -> Result<Vec<u8>, CodingError> {
        let all_data = (0..self.data_blocks).all(|c| blocks.full(block_id(c)).is_some());

        let mut segment = Vec::with_capacity(blocks.block_size() * self.data_blocks);
        if all_data {
            for c in 0..self.data_blocks {
                segment.extend_from_slice(blocks.full(block_id(c)).unwrap_or_default());
            }
        } else {
            let grid = self.solve(blocks);
            for c in 0..self.data_blocks {
                segment.extend_from_slice(&Self::column(&grid, c)?);
            }
        }

        segment.truncate(segment_size);
        Ok(segment)
    }

    fn required_symbols(&self, health: &[bool], segment_size: usize) -> SymbolSet {
        self.full_block_plan(health, &[], self.block_size(segment_size))
    }

    fn repair_symbols(
        &self,
        failed: &[BlockId],
        health: &[bool],
        segment_size: usize,
    ) -> SymbolSet {
        if let [lost] = failed {
            let lost = *lost as usize;
            let others_healthy = (0..self.block_count())
                .filter(|&i| i != lost)
                .all(|i| is_usable(health, failed, i));
            if lost < self.data_blocks && others_healthy {
                let cells = self.sub_block_plan(lost);
                return Self::cells_to_symbols(&cells, self.symbol_size(segment_size));
            }
        }
        self.full_block_plan(health, failed, self.block_size(segment_size))
    }

    fn repair(
        &self,
        failed: &[BlockId],
        blocks: &SparseBlocks,
        _segment_size: usize,
    ) -> Result<Vec<Bytes>, CodingError> {
        let grid = self.solve(blocks);
        failed
            .iter()
            .map(|&id| {
                let column = id as usize;
                if column >= self.block_count() {
                    return Err(CodingError::InvalidSetting(format!("block {id} out of range")));
                }
                Self::column(&grid, column).map(Bytes::from)
            })
            .collect()
    }
}

fn is_prime(n: usize) -> bool {
    n >= 2 && (2..).take_while(|d| d * d <= n).all(|d| n % d != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_prime() {
        let primes: Vec<usize> = (0..20).filter(|&n| is_prime(n)).collect();
        assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19]);
    }

    #[test]
    fn test_setting_requires_prime() {
        assert!(Rdp::from_setting("4").is_ok());
        assert!(Rdp::from_setting("6").is_ok());
        assert!(Rdp::from_setting("5").is_err());
        assert!(Rdp::from_setting("1").is_err());
    }

    #[test]
    fn test_equation_shape() {
        let rdp = Rdp::from_setting("4").unwrap();
        let equations = rdp.equations();
        assert_eq!(equations.len(), 8);
        // Row equations span data plus row parity
        assert!(equations[..4].iter().all(|e| e.len() == 5));
        // Each stored diagonal touches k of the k + 1 columns plus its parity cell
        assert!(equations[4..].iter().all(|e| e.len() == 5));
    }

    #[test]
    fn test_sub_block_plan_reads_less_than_full() {
        let rdp = Rdp::from_setting("6").unwrap();
        for lost in 0..6 {
            let cells = rdp.sub_block_plan(lost);
            assert!(cells.len() < 6 * 6, "lost {lost}: {} cells", cells.len());
            assert!(cells.iter().all(|&(c, _)| c != lost));
        }
    }

    #[test]
    fn test_cells_to_symbols_fuses_runs() {
        let cells: BTreeSet<Cell> = [(0, 0), (0, 1), (0, 3), (2, 2)].into_iter().collect();
        let symbols = Rdp::cells_to_symbols(&cells, 10);
        assert_eq!(
            symbols.get(0),
            Some(&[Symbol::new(0, 20), Symbol::new(30, 10)][..])
        );
        assert_eq!(symbols.get(2), Some(&[Symbol::new(20, 10)][..]));
    }
}
