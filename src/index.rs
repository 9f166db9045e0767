//! In-memory relational index over per-frame metadata.
//!
//! One row per stored frame; columns are the segment number, one
//! integer per dimension-index pointer, and (when every frame maps to
//! exactly one source instance and frame) the referenced instance UID
//! and frame number. The index is derived state: built once from the
//! frame metadata, never hand-mutated afterwards. Queries join a
//! transient "requested keys" relation against the rows and yield
//! `(output frame, stored frame, output segment)` instructions.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{Result, SegmentationError};

/// Index row for one stored frame.
#[derive(Debug, Clone)]
pub(crate) struct FrameRow {
    pub segment_number: u32,
    pub dimension_index_values: Vec<u32>,
    /// Single contributing source, when the frame has exactly one.
    pub source: Option<SourceRef>,
}

#[derive(Debug, Clone)]
pub(crate) struct SourceRef {
    pub sop_instance_uid: String,
    pub frame_number: Option<u32>,
}

/// One step of a mask reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Instruction {
    pub output_frame: usize,
    pub stored_frame: usize,
    pub output_segment: u32,
}

/// How requested segment numbers map to output segment values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentNumbering {
    /// Positions along the output segment axis, starting at 0.
    StackPosition,
    /// Keep the stored segment numbers.
    Identity,
    /// Renumber to 1..=N in requested order.
    Relabel,
}

#[derive(Debug)]
pub(crate) struct FrameIndex {
    referenced_uids: Vec<(String, String, String)>,
    rows: Vec<FrameRow>,
    /// Whether the optional source columns are populated on every row.
    single_source: bool,
    by_instance: HashMap<String, Vec<usize>>,
    by_frame_number: HashMap<u32, Vec<usize>>,
}

impl FrameIndex {
    /// Build the index. The source columns are kept only when every
    /// row carries a reference; otherwise they are dropped wholesale
    /// and source-based scans refuse to run.
    pub(crate) fn new(
        referenced_uids: Vec<(String, String, String)>,
        mut rows: Vec<FrameRow>,
    ) -> Self {
        let single_source = !rows.is_empty() && rows.iter().all(|r| r.source.is_some());
        let mut by_instance: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_frame_number: HashMap<u32, Vec<usize>> = HashMap::new();
        if single_source {
            for (i, row) in rows.iter().enumerate() {
                let source = row.source.as_ref().expect("all rows carry a source");
                by_instance
                    .entry(source.sop_instance_uid.clone())
                    .or_default()
                    .push(i);
                if let Some(frame_number) = source.frame_number {
                    by_frame_number.entry(frame_number).or_default().push(i);
                }
            }
        } else {
            for row in &mut rows {
                row.source = None;
            }
        }
        Self {
            referenced_uids,
            rows,
            single_source,
            by_instance,
            by_frame_number,
        }
    }

    pub(crate) fn number_of_frames(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn single_source_per_frame(&self) -> bool {
        self.single_source
    }

    pub(crate) fn referenced_uids(&self) -> &[(String, String, String)] {
        &self.referenced_uids
    }

    pub(crate) fn referenced_sop_instance_uids(&self) -> HashSet<&str> {
        self.referenced_uids
            .iter()
            .map(|(_, _, sop)| sop.as_str())
            .collect()
    }

    /// True iff (segment number, selected dimension columns) is a key.
    pub(crate) fn dimension_indices_unique(&self, columns: &[usize]) -> bool {
        let mut groups = HashSet::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut key = Vec::with_capacity(columns.len() + 1);
            key.push(row.segment_number);
            for &c in columns {
                key.push(row.dimension_index_values[c]);
            }
            groups.insert(key);
        }
        groups.len() == self.rows.len()
    }

    /// True iff (referenced instance, segment number) is a key.
    pub(crate) fn referenced_instances_unique(&self) -> bool {
        let mut groups = HashSet::with_capacity(self.rows.len());
        for row in &self.rows {
            let uid = row.source.as_ref().map(|s| s.sop_instance_uid.as_str());
            groups.insert((uid, row.segment_number));
        }
        groups.len() == self.rows.len()
    }

    /// True iff (referenced frame number, segment number) is a key.
    pub(crate) fn referenced_frames_unique(&self) -> bool {
        let mut groups = HashSet::with_capacity(self.rows.len());
        for row in &self.rows {
            let frame = row.source.as_ref().and_then(|s| s.frame_number);
            groups.insert((frame, row.segment_number));
        }
        groups.len() == self.rows.len()
    }

    /// Highest referenced source frame number, if any frame carries one.
    pub(crate) fn max_referenced_frame(&self) -> Option<u32> {
        self.rows
            .iter()
            .filter_map(|r| r.source.as_ref().and_then(|s| s.frame_number))
            .max()
    }

    /// Distinct combinations of the selected dimension columns.
    pub(crate) fn distinct_dimension_values(&self, columns: &[usize]) -> BTreeSet<Vec<u32>> {
        self.rows
            .iter()
            .map(|row| columns.iter().map(|&c| row.dimension_index_values[c]).collect())
            .collect()
    }

    fn require_source_columns(&self) -> Result<()> {
        if self.single_source {
            Ok(())
        } else {
            Err(SegmentationError::NotIndexable(
                "some frames reference zero or several source frames".into(),
            ))
        }
    }

    /// Join the requested instance UIDs against the index.
    pub(crate) fn scan_by_source_instance(
        &self,
        source_sop_instance_uids: &[&str],
        segment_map: &HashMap<u32, u32>,
    ) -> Result<Vec<Instruction>> {
        self.require_source_columns()?;
        reject_duplicate_keys(source_sop_instance_uids)?;
        let mut instructions = Vec::new();
        for (output_frame, &uid) in source_sop_instance_uids.iter().enumerate() {
            let Some(stored) = self.by_instance.get(uid) else {
                continue;
            };
            for &stored_frame in stored {
                let segment = self.rows[stored_frame].segment_number;
                if let Some(&output_segment) = segment_map.get(&segment) {
                    instructions.push(Instruction {
                        output_frame,
                        stored_frame,
                        output_segment,
                    });
                }
            }
        }
        Ok(instructions)
    }

    /// Join the requested source frame numbers against the index.
    pub(crate) fn scan_by_source_frame(
        &self,
        source_frame_numbers: &[u32],
        segment_map: &HashMap<u32, u32>,
    ) -> Result<Vec<Instruction>> {
        self.require_source_columns()?;
        reject_duplicate_keys(source_frame_numbers)?;
        let mut instructions = Vec::new();
        for (output_frame, frame_number) in source_frame_numbers.iter().enumerate() {
            let Some(stored) = self.by_frame_number.get(frame_number) else {
                continue;
            };
            for &stored_frame in stored {
                let segment = self.rows[stored_frame].segment_number;
                if let Some(&output_segment) = segment_map.get(&segment) {
                    instructions.push(Instruction {
                        output_frame,
                        stored_frame,
                        output_segment,
                    });
                }
            }
        }
        Ok(instructions)
    }

    /// Join the requested dimension-index tuples against the index.
    /// `columns` selects and orders the dimension columns the tuples
    /// refer to.
    pub(crate) fn scan_by_dimension_values(
        &self,
        dimension_index_values: &[Vec<u32>],
        columns: &[usize],
        segment_map: &HashMap<u32, u32>,
    ) -> Result<Vec<Instruction>> {
        reject_duplicate_keys(dimension_index_values)?;
        // Transient accelerator for this query only.
        let mut by_values: HashMap<Vec<u32>, Vec<usize>> = HashMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            let key: Vec<u32> = columns
                .iter()
                .map(|&c| row.dimension_index_values[c])
                .collect();
            by_values.entry(key).or_default().push(i);
        }

        let mut instructions = Vec::new();
        for (output_frame, values) in dimension_index_values.iter().enumerate() {
            let Some(stored) = by_values.get(values) else {
                continue;
            };
            for &stored_frame in stored {
                let segment = self.rows[stored_frame].segment_number;
                if let Some(&output_segment) = segment_map.get(&segment) {
                    instructions.push(Instruction {
                        output_frame,
                        stored_frame,
                        output_segment,
                    });
                }
            }
        }
        Ok(instructions)
    }
}

/// The transient "requested segments" relation: requested segment
/// number to output segment value.
pub(crate) fn segment_output_map(
    segment_numbers: &[u32],
    numbering: SegmentNumbering,
) -> Result<HashMap<u32, u32>> {
    reject_duplicate_keys(segment_numbers)?;
    let map = segment_numbers
        .iter()
        .enumerate()
        .map(|(i, &segment)| {
            let output = match numbering {
                SegmentNumbering::StackPosition => i as u32,
                SegmentNumbering::Identity => segment,
                SegmentNumbering::Relabel => i as u32 + 1,
            };
            (segment, output)
        })
        .collect();
    Ok(map)
}

fn reject_duplicate_keys<T: std::hash::Hash + Eq>(keys: &[T]) -> Result<()> {
    let unique: HashSet<&T> = keys.iter().collect();
    if unique.len() != keys.len() {
        return Err(SegmentationError::Configuration(
            "requested keys contain duplicates".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u32) -> String {
        format!("1.2.3.{n}")
    }

    fn row(segment: u32, dims: &[u32], source: Option<(u32, Option<u32>)>) -> FrameRow {
        FrameRow {
            segment_number: segment,
            dimension_index_values: dims.to_vec(),
            source: source.map(|(instance, frame_number)| SourceRef {
                sop_instance_uid: uid(instance),
                frame_number,
            }),
        }
    }

    fn two_segment_index() -> FrameIndex {
        // Two planes x two segments, one single-frame source per plane.
        FrameIndex::new(
            vec![
                ("s".into(), "se".into(), uid(1)),
                ("s".into(), "se".into(), uid(2)),
            ],
            vec![
                row(1, &[1], Some((1, None))),
                row(1, &[2], Some((2, None))),
                row(2, &[1], Some((1, None))),
                row(2, &[2], Some((2, None))),
            ],
        )
    }

    #[test]
    fn uniqueness_checks() {
        let index = two_segment_index();
        assert!(index.dimension_indices_unique(&[0]));
        assert!(index.referenced_instances_unique());
        // Without the dimension column every segment groups together.
        assert!(!index.dimension_indices_unique(&[]));
        // Frame numbers are all absent, so they cannot be a key here.
        assert!(!index.referenced_frames_unique());
    }

    #[test]
    fn source_columns_dropped_when_any_row_lacks_one() {
        let index = FrameIndex::new(
            vec![("s".into(), "se".into(), uid(1))],
            vec![row(1, &[1], Some((1, None))), row(1, &[2], None)],
        );
        assert!(!index.single_source_per_frame());
        let map = segment_output_map(&[1], SegmentNumbering::StackPosition).unwrap();
        let result = index.scan_by_source_instance(&["1.2.3.1"], &map);
        assert!(matches!(result, Err(SegmentationError::NotIndexable(_))));
    }

    #[test]
    fn scan_by_instance_orders_by_output_frame() {
        let index = two_segment_index();
        let map = segment_output_map(&[1, 2], SegmentNumbering::StackPosition).unwrap();
        let uid2 = uid(2);
        let uid1 = uid(1);
        let instructions = index
            .scan_by_source_instance(&[uid2.as_str(), uid1.as_str()], &map)
            .unwrap();
        assert_eq!(instructions.len(), 4);
        assert!(instructions.windows(2).all(|w| w[0].output_frame <= w[1].output_frame));
        // Requested uid order defines output frames: uid2 first.
        assert!(instructions[..2].iter().all(|i| i.output_frame == 0));
        assert!(
            instructions[..2]
                .iter()
                .all(|i| [1usize, 3].contains(&i.stored_frame))
        );
    }

    #[test]
    fn missing_keys_contribute_nothing() {
        let index = two_segment_index();
        let map = segment_output_map(&[1, 2], SegmentNumbering::StackPosition).unwrap();
        let instructions = index
            .scan_by_source_instance(&["9.9.9"], &map)
            .unwrap();
        assert!(instructions.is_empty());
    }

    #[test]
    fn duplicate_keys_rejected() {
        let index = two_segment_index();
        let map = segment_output_map(&[1], SegmentNumbering::StackPosition).unwrap();
        let uid1 = uid(1);
        let result = index.scan_by_source_instance(&[uid1.as_str(), uid1.as_str()], &map);
        assert!(matches!(result, Err(SegmentationError::Configuration(_))));
        assert!(segment_output_map(&[2, 2], SegmentNumbering::Identity).is_err());
    }

    #[test]
    fn segment_numbering_policies() {
        let identity = segment_output_map(&[3, 1], SegmentNumbering::Identity).unwrap();
        assert_eq!(identity[&3], 3);
        assert_eq!(identity[&1], 1);
        let stacked = segment_output_map(&[3, 1], SegmentNumbering::StackPosition).unwrap();
        assert_eq!(stacked[&3], 0);
        assert_eq!(stacked[&1], 1);
        let relabeled = segment_output_map(&[3, 1], SegmentNumbering::Relabel).unwrap();
        assert_eq!(relabeled[&3], 1);
        assert_eq!(relabeled[&1], 2);
    }

    #[test]
    fn scan_by_dimension_values() {
        let index = two_segment_index();
        let map = segment_output_map(&[2], SegmentNumbering::Identity).unwrap();
        let instructions = index
            .scan_by_dimension_values(&[vec![2], vec![1]], &[0], &map)
            .unwrap();
        assert_eq!(
            instructions,
            vec![
                Instruction {
                    output_frame: 0,
                    stored_frame: 3,
                    output_segment: 2
                },
                Instruction {
                    output_frame: 1,
                    stored_frame: 2,
                    output_segment: 2
                },
            ]
        );
    }

    #[test]
    fn scan_by_source_frame_uses_frame_numbers() {
        let index = FrameIndex::new(
            vec![("s".into(), "se".into(), uid(1))],
            vec![
                row(1, &[1], Some((1, Some(5)))),
                row(1, &[2], Some((1, Some(6)))),
            ],
        );
        assert!(index.referenced_frames_unique());
        assert_eq!(index.max_referenced_frame(), Some(6));
        let map = segment_output_map(&[1], SegmentNumbering::StackPosition).unwrap();
        let instructions = index.scan_by_source_frame(&[6], &map).unwrap();
        assert_eq!(
            instructions,
            vec![Instruction {
                output_frame: 0,
                stored_frame: 1,
                output_segment: 0
            }]
        );
    }

    #[test]
    fn distinct_dimension_values_collects_tuples() {
        let index = two_segment_index();
        let distinct = index.distinct_dimension_values(&[0]);
        assert_eq!(distinct.len(), 2);
        assert!(distinct.contains(&vec![1]));
        assert!(distinct.contains(&vec![2]));
    }
}
