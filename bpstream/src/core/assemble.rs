//! Read-side assembly: decode the stored blocks that overlap a selection and place
//! their elements into the caller's buffer.

use std::collections::HashMap;
use std::ops::Range;

use super::index::IndexEntry;
use super::selection::{copy_region, Region};
use crate::transform::{decode_chain, TransformRegistry};
use crate::types::{Dims, ShapeKind};
use crate::{Error, Result, Variable};

fn covering<'a>(entries: &'a [IndexEntry], step: u64) -> impl Iterator<Item = &'a IndexEntry> {
    entries.iter().filter(move |e| e.covers_step(step))
}

/// Bytes a read of `variable` over `steps` produces.
///
/// Global arrays and values produce one count-shaped chunk per step. Local arrays
/// and values produce every block of every step, concatenated in rank order.
pub(crate) fn selection_size(variable: &Variable, steps: Range<u64>, entries: &[IndexEntry]) -> usize {
    let nsteps = (steps.end - steps.start) as usize;
    match variable.shape_kind() {
        ShapeKind::GlobalArray | ShapeKind::GlobalValue => variable.payload_size() * nsteps,
        ShapeKind::LocalArray | ShapeKind::LocalValue => steps
            .map(|step| {
                covering(entries, step)
                    .map(|e| e.step_payload_size() as usize)
                    .sum::<usize>()
            })
            .sum(),
    }
}

/// Decodes blocks on first use and keeps them for the rest of one read.
struct BlockCache<'r, F> {
    registry: &'r TransformRegistry,
    fetch: F,
    decoded: HashMap<(u32, u64), Vec<u8>>,
}

impl<F> BlockCache<'_, F>
where
    F: FnMut(&IndexEntry) -> Result<Vec<u8>>,
{
    /// Untransformed bytes of `step` inside `entry`.
    fn step_bytes(&mut self, entry: &IndexEntry, step: u64) -> Result<&[u8]> {
        let key = (entry.rank, entry.offset);
        if !self.decoded.contains_key(&key) {
            let stored = (self.fetch)(entry)?;
            if stored.len() as u64 != entry.length {
                return Err(Error::InvalidFormat(format!(
                    "block of {} on rank {} holds {} bytes, index says {}",
                    entry.name,
                    entry.rank,
                    stored.len(),
                    entry.length
                )));
            }
            let payload = decode_chain(self.registry, &entry.transforms, stored)?;
            if payload.len() as u64 != entry.payload_size {
                return Err(Error::InvalidFormat(format!(
                    "block of {} decoded to {} bytes, index says {}",
                    entry.name,
                    payload.len(),
                    entry.payload_size
                )));
            }
            self.decoded.insert(key, payload);
        }

        let per_step = entry.step_payload_size() as usize;
        let start = (step - entry.step) as usize * per_step;
        self.decoded
            .get(&key)
            .and_then(|payload| payload.get(start..start + per_step))
            .ok_or_else(|| Error::InvalidFormat(format!("step {} missing from block", step)))
    }
}

/// Fills `out` with the selection of `variable` over `steps`. `fetch` returns the
/// stored bytes of an entry; `entries` are the variable's entries in rank order.
pub(crate) fn read_selection<F>(
    registry: &TransformRegistry,
    variable: &Variable,
    steps: Range<u64>,
    entries: &[IndexEntry],
    out: &mut [u8],
    fetch: F,
) -> Result<()>
where
    F: FnMut(&IndexEntry) -> Result<Vec<u8>>,
{
    let needed = selection_size(variable, steps.clone(), entries);
    if out.len() != needed {
        return Err(Error::InvalidArgument(format!(
            "buffer for {} holds {} bytes, the selection needs {}",
            variable.name(),
            out.len(),
            needed
        )));
    }

    if variable.shape_kind() == ShapeKind::GlobalArray && variable.count().is_empty() {
        return Err(Error::InvalidSelection(format!(
            "no selection set for global array {}",
            variable.name()
        )));
    }

    let element_size = variable.element_size();
    let (clip_start, clip_count): (Dims, Dims) = if variable.memory_count().is_empty() {
        (Dims::new(), Dims::new())
    } else {
        variable.transfer_box()
    };

    let mut cache = BlockCache {
        registry,
        fetch,
        decoded: HashMap::new(),
    };
    let mut cursor = 0usize;

    for step in steps {
        match variable.shape_kind() {
            ShapeKind::GlobalArray => {
                let chunk_len = variable.payload_size();
                let chunk = &mut out[cursor..cursor + chunk_len];
                let clip = if clip_count.is_empty() {
                    None
                } else {
                    Some(Region::new(&clip_start, &clip_count))
                };

                for entry in covering(entries, step) {
                    let src = cache.step_bytes(entry, step)?;
                    copy_region(
                        src,
                        Region::new(&entry.start, &entry.count),
                        chunk,
                        Region::new(variable.start(), variable.count()),
                        clip,
                        element_size,
                    );
                }
                cursor += chunk_len;
            }
            ShapeKind::GlobalValue => {
                let entry = covering(entries, step).next().ok_or_else(|| {
                    Error::NotFound(format!("{} has no value in step {}", variable.name(), step))
                })?;
                let src = cache.step_bytes(entry, step)?;
                out[cursor..cursor + element_size].copy_from_slice(&src[..element_size]);
                cursor += element_size;
            }
            ShapeKind::LocalArray | ShapeKind::LocalValue => {
                for entry in covering(entries, step) {
                    let src = cache.step_bytes(entry, step)?;
                    out[cursor..cursor + src.len()].copy_from_slice(src);
                    cursor += src.len();
                }
            }
        }
    }

    tracing::trace!(name = variable.name(), bytes = cursor, "assembled selection");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::tests::test_registry;
    use crate::transform::{encode_chain, TransformRecord};
    use crate::types::{to_bytes, ElementType, Params};
    use crate::Element;

    fn entry(rank: u32, start: Dims, count: Dims, step: u64, stored: &[u8]) -> IndexEntry {
        IndexEntry {
            name: "T".into(),
            element_type: ElementType::Float32,
            shape_kind: ShapeKind::GlobalArray,
            shape: vec![4, 4],
            start,
            count,
            step,
            step_count: 1,
            rank,
            offset: 0,
            length: stored.len() as u64,
            payload_size: stored.len() as u64,
            transforms: Vec::<TransformRecord>::new(),
        }
    }

    #[test]
    fn stitches_rank_blocks() {
        let (registry, _, _) = test_registry();
        // Two ranks each wrote two rows of a 4x4 array.
        let top = to_bytes(&[1.0f32; 8]);
        let bottom = to_bytes(&[2.0f32; 8]);
        let entries = vec![
            entry(0, vec![0, 0], vec![2, 4], 0, &top),
            entry(1, vec![2, 0], vec![2, 4], 0, &bottom),
        ];

        let mut variable =
            Variable::new("T", ElementType::Float32, vec![4, 4], vec![1, 1], vec![2, 2], false)
                .unwrap();
        let mut out = vec![0u8; variable.payload_size()];
        read_selection(&registry, &variable, 0..1, &entries, &mut out, |e| {
            Ok(if e.rank == 0 { top.clone() } else { bottom.clone() })
        })
        .unwrap();
        assert_eq!(f32::from_bytes(&out), vec![1.0, 1.0, 2.0, 2.0]);

        variable.set_memory_selection(vec![1, 0], vec![1, 1]).unwrap();
        let mut out = to_bytes(&[9.0f32; 4]);
        read_selection(&registry, &variable, 0..1, &entries, &mut out, |e| {
            Ok(if e.rank == 0 { top.clone() } else { bottom.clone() })
        })
        .unwrap();
        assert_eq!(f32::from_bytes(&out), vec![9.0, 9.0, 2.0, 9.0]);
    }

    #[test]
    fn decodes_transformed_blocks() {
        let (registry, xor, reverse) = test_registry();
        let payload = to_bytes(&[3i32, 4, 5]);
        let (stored, records) = encode_chain(
            &registry,
            &[(xor, Params::new()), (reverse, Params::new())],
            payload.clone(),
        )
        .unwrap();

        let mut e = entry(0, vec![], vec![3], 0, &stored);
        e.element_type = ElementType::Int32;
        e.shape_kind = ShapeKind::LocalArray;
        e.shape = vec![];
        e.payload_size = payload.len() as u64;
        e.transforms = records;

        let variable =
            Variable::new("T", ElementType::Int32, vec![], vec![], vec![3], false).unwrap();
        let entries = vec![e];
        assert_eq!(selection_size(&variable, 0..1, &entries), 12);

        let mut out = vec![0u8; 12];
        read_selection(&registry, &variable, 0..1, &entries, &mut out, |_| {
            Ok(stored.clone())
        })
        .unwrap();
        assert_eq!(out, payload);

        let mut short = vec![0u8; 8];
        assert!(matches!(
            read_selection(&registry, &variable, 0..1, &entries, &mut short, |_| Ok(
                stored.clone()
            )),
            Err(Error::InvalidArgument(_))
        ));
    }
}
