//! Metadata index types shared by the writer core, the file reader and staging.

use crate::transform::TransformRecord;
use crate::types::{Dims, ElementType, ShapeKind};

/// Where one put landed and how to read it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    pub element_type: ElementType,
    pub shape_kind: ShapeKind,
    pub shape: Dims,
    pub start: Dims,
    pub count: Dims,
    /// First step covered by this block.
    pub step: u64,
    /// Number of consecutive steps stored back to back in this block.
    pub step_count: u64,
    pub rank: u32,
    /// Position of the stored payload, from the start of the rank's data region.
    pub offset: u64,
    /// Stored (transformed) length.
    pub length: u64,
    /// Length before any transform ran.
    pub payload_size: u64,
    pub transforms: Vec<TransformRecord>,
}

impl IndexEntry {
    #[inline]
    pub fn covers_step(&self, step: u64) -> bool {
        step >= self.step && step - self.step < self.step_count
    }

    /// Untransformed bytes of a single step inside this block.
    #[inline]
    pub fn step_payload_size(&self) -> u64 {
        if self.step_count == 0 {
            0
        } else {
            self.payload_size / self.step_count
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepIndex {
    pub step: u64,
    pub entries: Vec<IndexEntry>,
}

/// A named typed array attached to a whole stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub element_type: ElementType,
    pub data: Vec<u8>,
}

impl Attribute {
    pub fn len(&self) -> usize {
        match self.element_type.size() {
            0 => 0,
            size => self.data.len() / size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn values<T: crate::Element>(&self) -> Option<Vec<T>> {
        if T::TYPE != self.element_type {
            return None;
        }
        Some(T::from_bytes(&self.data))
    }
}

/// Everything one rank wrote: the unit gathered during metadata aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalIndex {
    pub rank: u32,
    pub attributes: Vec<Attribute>,
    pub steps: Vec<StepIndex>,
}

/// Variable-level summary built by readers from all entries they know of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub element_type: ElementType,
    pub shape_kind: ShapeKind,
    pub shape: Dims,
    /// Count of the first block seen; used as the default selection for local arrays.
    pub count: Dims,
    pub first_step: u64,
    pub last_step: u64,
}

impl VariableInfo {
    pub(crate) fn from_entry(entry: &IndexEntry) -> Self {
        VariableInfo {
            name: entry.name.clone(),
            element_type: entry.element_type,
            shape_kind: entry.shape_kind,
            shape: entry.shape.clone(),
            count: entry.count.clone(),
            first_step: entry.step,
            last_step: entry.step.saturating_add(entry.step_count.max(1) - 1),
        }
    }

    pub(crate) fn merge(&mut self, entry: &IndexEntry) {
        let entry_last = entry.step.saturating_add(entry.step_count.max(1) - 1);
        // A later step may grow the global shape.
        if entry_last >= self.last_step && !entry.shape.is_empty() {
            self.shape = entry.shape.clone();
        }
        self.first_step = self.first_step.min(entry.step);
        self.last_step = self.last_step.max(entry_last);
    }

    pub fn steps(&self) -> u64 {
        (self.last_step - self.first_step).saturating_add(1)
    }

    pub(crate) fn to_variable(&self) -> crate::Variable {
        let count = match self.shape_kind {
            ShapeKind::GlobalArray => self.shape.clone(),
            ShapeKind::LocalArray => self.count.clone(),
            ShapeKind::GlobalValue | ShapeKind::LocalValue => Dims::new(),
        };
        let mut variable = crate::Variable::from_index(
            &self.name,
            self.element_type,
            self.shape_kind,
            self.shape.clone(),
            count,
        );
        variable.set_available_steps(self.first_step as usize, self.steps() as usize);
        variable
    }
}
