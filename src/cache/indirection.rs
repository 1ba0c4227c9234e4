//! Beam-search cache indirection
//!
//! Beam search reorders hypotheses between decode steps without moving the
//! cache. Instead a table `[batch, beam_width, max_seq]` records, for every
//! logical position of a beam, which beam slot physically holds that row.
//! Two index spaces are involved:
//!
//! - logical: `(batch, beam, pos)` as the hypothesis sees its history
//! - physical: the `batch * beam_width + slot` row of the cache
//!
//! Rows at `pos >= past_len` were written during the current step by the
//! beam itself and are never redirected. This is deliberate: the table only
//! describes history, so new rows are always read from the beam's own slot
//! and table entries at or past `past_len` are neither read nor validated.

use crate::error::{Error, Result};
use crate::tensor::TensorView;

#[derive(Debug, Clone, Copy)]
pub struct BeamIndirection<'a> {
    table: TensorView<'a, i32>,
    beam_width: usize,
    past_len: usize,
}

impl<'a> BeamIndirection<'a> {
    /// Validates `table` once so that [`resolve`](Self::resolve) never fails.
    pub fn new(table: TensorView<'a, i32>, beam_width: usize, past_len: usize) -> Result<Self> {
        if beam_width == 0 {
            return Err(Error::invalid("beam_width", "must be >= 1"));
        }
        let shape = table.shape();
        if shape.len() != 3 || shape[1] != beam_width {
            return Err(Error::invalid(
                "cache_indirection",
                format!("expected [batch, {beam_width}, max_seq], got {shape:?}"),
            ));
        }
        if past_len > shape[2] {
            return Err(Error::invalid(
                "cache_indirection",
                format!("past length {past_len} exceeds table length {}", shape[2]),
            ));
        }

        for batch in 0..shape[0] {
            for beam in 0..beam_width {
                let row = table.sub(&[batch, beam]).unwrap_or_default();
                if let Some((pos, &slot)) = row[..past_len]
                    .iter()
                    .enumerate()
                    .find(|&(_, &slot)| slot < 0 || slot as usize >= beam_width)
                {
                    return Err(Error::invalid(
                        "cache_indirection",
                        format!(
                            "entry [{batch}, {beam}, {pos}] = {slot} is outside [0, {beam_width})"
                        ),
                    ));
                }
            }
        }

        Ok(Self {
            table,
            beam_width,
            past_len,
        })
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    pub fn past_len(&self) -> usize {
        self.past_len
    }

    /// Physical cache row holding logical position `pos` of `(batch, beam)`.
    #[inline]
    pub fn resolve(&self, batch: usize, beam: usize, pos: usize) -> usize {
        let base = batch * self.beam_width;
        if pos >= self.past_len {
            return base + beam;
        }
        let strides = self.table.layout().strides();
        let slot = self.table.as_slice()[batch * strides[0] + beam * strides[1] + pos];
        base + slot as usize
    }

    /// [`resolve`](Self::resolve) for a flattened `batch * beam_width + beam` index.
    #[inline]
    pub fn resolve_flat(&self, batch_beam: usize, pos: usize) -> usize {
        self.resolve(batch_beam / self.beam_width, batch_beam % self.beam_width, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use proptest::prelude::*;

    #[test]
    fn test_resolve_uses_table_for_history_only() {
        // batch=1, beams=2, max_seq=3, past=2
        let table = Tensor::from_vec(vec![1, 1, 0, 0, 0, 1], &[1, 2, 3]).unwrap();
        let ind = BeamIndirection::new(table.view(), 2, 2).unwrap();
        assert_eq!(ind.resolve(0, 0, 0), 1);
        assert_eq!(ind.resolve(0, 0, 1), 1);
        assert_eq!(ind.resolve(0, 1, 1), 0);
        // current step: own slot regardless of the table
        assert_eq!(ind.resolve(0, 0, 2), 0);
        assert_eq!(ind.resolve(0, 1, 2), 1);
    }

    #[test]
    fn test_second_batch_offsets_by_beam_width() {
        let table = Tensor::from_vec(vec![0, 1, 1, 0], &[2, 2, 1]).unwrap();
        let ind = BeamIndirection::new(table.view(), 2, 1).unwrap();
        assert_eq!(ind.resolve_flat(2, 0), 3);
        assert_eq!(ind.resolve_flat(3, 0), 2);
    }

    #[test]
    fn test_out_of_range_entry_is_rejected() {
        let table = Tensor::from_vec(vec![0, 2, 0, 0], &[1, 2, 2]).unwrap();
        let err = BeamIndirection::new(table.view(), 2, 2).unwrap_err();
        assert!(err.to_string().contains("[0, 0, 1] = 2"));
        // the bad entry is beyond the past and never read
        assert!(BeamIndirection::new(table.view(), 2, 1).is_ok());
        assert!(BeamIndirection::new(table.view(), 3, 1).is_err());
    }

    proptest! {
        #[test]
        fn prop_resolve_stays_in_batch(
            batch in 1usize..4,
            beams in 1usize..5,
            max_seq in 1usize..6,
            seed in any::<u64>(),
        ) {
            let n = batch * beams * max_seq;
            let entries: Vec<i32> = (0..n)
                .map(|i| ((seed.wrapping_mul(6364136223846793005).wrapping_add(i as u64) >> 33)
                    % beams as u64) as i32)
                .collect();
            let table = Tensor::from_vec(entries, &[batch, beams, max_seq]).unwrap();
            let past = max_seq - 1;
            let ind = BeamIndirection::new(table.view(), beams, past).unwrap();
            for b in 0..batch {
                for beam in 0..beams {
                    for pos in 0..max_seq {
                        let slot = ind.resolve(b, beam, pos);
                        prop_assert!(slot >= b * beams && slot < (b + 1) * beams);
                        if pos >= past {
                            prop_assert_eq!(slot, b * beams + beam);
                        }
                    }
                }
            }
        }
    }
}
