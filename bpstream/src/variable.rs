//! The variable data model: identity, shape geometry, selections and the transform chain.
//!
//! Geometry is checked twice: when it is assigned (definition and every selection
//! call), and again by [`Variable::check_dims_before_write`] right before an engine
//! accepts data, because selections may change between definition and write.

use crate::transform::{TransformHandle, TransformRecord};
use crate::types::{Dims, ElementType, Params, ShapeKind, LOCAL_VALUE_DIM};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformInfo {
    pub handle: TransformHandle,
    pub params: Params,
    /// Output size of this stage the last time the chain was applied.
    pub resulting_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    element_type: ElementType,
    shape_kind: ShapeKind,
    single_value: bool,
    constant_dims: bool,

    shape: Dims,
    start: Dims,
    count: Dims,

    memory_start: Dims,
    memory_count: Dims,

    step_start: usize,
    step_count: usize,

    available_steps_start: usize,
    available_steps_count: usize,

    transforms: Vec<TransformInfo>,

    /// Set by the first accepted write; freezes constant dims.
    used: bool,
}

#[inline]
fn product(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
}

impl Variable {
    pub(crate) fn new(
        name: &str,
        element_type: ElementType,
        shape: Dims,
        start: Dims,
        count: Dims,
        constant_dims: bool,
    ) -> Result<Variable> {
        let hint = format!("in call to define variable {}", name);

        let (shape_kind, shape) = if shape.is_empty() {
            if start.is_empty() && count.is_empty() {
                (ShapeKind::GlobalValue, shape)
            } else if start.is_empty() {
                (ShapeKind::LocalArray, shape)
            } else {
                return Err(Error::dims(hint, "start is set without a global shape"));
            }
        } else if shape == [LOCAL_VALUE_DIM] {
            if !start.is_empty() || !count.is_empty() {
                return Err(Error::dims(hint, "local values take no start or count"));
            }
            (ShapeKind::LocalValue, Dims::new())
        } else {
            (ShapeKind::GlobalArray, shape)
        };

        let variable = Variable {
            name: name.to_string(),
            element_type,
            shape_kind,
            single_value: shape_kind.is_value(),
            constant_dims,
            shape,
            start,
            count,
            memory_start: Dims::new(),
            memory_count: Dims::new(),
            step_start: 0,
            step_count: 1,
            available_steps_start: 0,
            available_steps_count: 1,
            transforms: Vec::new(),
            used: false,
        };

        variable.check_dims_common(&hint)?;
        Ok(variable)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_type.size()
    }

    #[inline]
    pub fn shape_kind(&self) -> ShapeKind {
        self.shape_kind
    }

    #[inline]
    pub fn is_single_value(&self) -> bool {
        self.single_value
    }

    #[inline]
    pub fn has_constant_dims(&self) -> bool {
        self.constant_dims
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn start(&self) -> &[usize] {
        &self.start
    }

    #[inline]
    pub fn count(&self) -> &[usize] {
        &self.count
    }

    #[inline]
    pub fn memory_start(&self) -> &[usize] {
        &self.memory_start
    }

    #[inline]
    pub fn memory_count(&self) -> &[usize] {
        &self.memory_count
    }

    #[inline]
    pub fn step_selection(&self) -> (usize, usize) {
        (self.step_start, self.step_count)
    }

    #[inline]
    pub fn available_steps_start(&self) -> usize {
        self.available_steps_start
    }

    #[inline]
    pub fn available_steps_count(&self) -> usize {
        self.available_steps_count
    }

    #[inline]
    pub fn transforms(&self) -> &[TransformInfo] {
        &self.transforms
    }

    /// Number of elements in the selection, 1 for single values.
    pub fn total_size(&self) -> usize {
        if self.single_value {
            return 1;
        }
        if self.count.is_empty() {
            return 0;
        }
        product(&self.count).unwrap_or(usize::MAX)
    }

    /// Bytes of one step of the selection before any transform runs.
    pub fn payload_size(&self) -> usize {
        self.total_size().saturating_mul(self.element_size())
    }

    /// Sets start and count, then the step selection. On failure nothing changes.
    pub fn set_selection(&mut self, start: Dims, count: Dims, steps: (usize, usize)) -> Result<()> {
        if self.constant_dims && self.used {
            return Err(Error::InvalidSelection(format!(
                "variable {} has constant dimensions and was already written",
                self.name
            )));
        }

        if self.single_value && (!start.is_empty() || !count.is_empty()) {
            return Err(Error::InvalidSelection(format!(
                "single value variable {} cannot take a box selection",
                self.name
            )));
        }

        let mut candidate = self.clone();
        candidate.start = start;
        candidate.count = count;
        candidate.set_step_selection(steps)?;
        candidate
            .validate_geometry()
            .map_err(|reason| Error::InvalidSelection(format!("{}: {}", self.name, reason)))?;

        *self = candidate;
        Ok(())
    }

    pub fn set_step_selection(&mut self, (start, count): (usize, usize)) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidSelection(format!(
                "step count for {} must be at least 1",
                self.name
            )));
        }
        if start.checked_add(count).is_none() {
            return Err(Error::InvalidSelection(format!(
                "steps {}..+{} of {} overflow",
                start, count, self.name
            )));
        }

        self.step_start = start;
        self.step_count = count;
        Ok(())
    }

    /// Restricts the transferred region to a box inside `count`, e.g. to skip ghost cells.
    /// Passing two empty dims clears the memory selection.
    pub fn set_memory_selection(&mut self, start: Dims, count: Dims) -> Result<()> {
        let mut candidate = self.clone();
        candidate.memory_start = start;
        candidate.memory_count = count;
        candidate
            .validate_geometry()
            .map_err(|reason| Error::InvalidSelection(format!("{}: {}", self.name, reason)))?;

        *self = candidate;
        Ok(())
    }

    /// Changes the global shape of a non-constant global array.
    pub fn set_shape(&mut self, shape: Dims) -> Result<()> {
        if self.shape_kind != ShapeKind::GlobalArray {
            return Err(Error::InvalidSelection(format!(
                "{} is not a global array",
                self.name
            )));
        }
        if self.constant_dims {
            return Err(Error::InvalidSelection(format!(
                "variable {} has constant dimensions",
                self.name
            )));
        }

        let mut candidate = self.clone();
        candidate.shape = shape;
        candidate
            .validate_geometry()
            .map_err(|reason| Error::InvalidSelection(format!("{}: {}", self.name, reason)))?;

        *self = candidate;
        Ok(())
    }

    /// Appends a stage to the transform chain and returns its index in the chain.
    pub fn add_transform(&mut self, handle: TransformHandle, params: Params) -> usize {
        self.transforms.push(TransformInfo {
            handle,
            params,
            resulting_size: None,
        });
        self.transforms.len() - 1
    }

    pub fn reset_transform_parameters(&mut self, index: usize, params: Params) -> Result<()> {
        let len = self.transforms.len();
        match self.transforms.get_mut(index) {
            Some(info) => {
                info.params = params;
                Ok(())
            }
            None => Err(Error::OutOfRange { index, len }),
        }
    }

    pub fn clear_transforms(&mut self) {
        self.transforms.clear();
    }

    /// Re-checks every geometry invariant. Engines call this before accepting data.
    pub fn check_dims_before_write(&self, hint: &str) -> Result<()> {
        self.check_dims_common(hint)?;

        if matches!(
            self.shape_kind,
            ShapeKind::GlobalArray | ShapeKind::LocalArray
        ) && self.count.is_empty()
        {
            return Err(Error::dims(hint, "count is not set for an array variable"));
        }

        Ok(())
    }

    fn check_dims_common(&self, hint: &str) -> Result<()> {
        self.validate_geometry()
            .map_err(|reason| Error::dims(hint, reason))
    }

    fn validate_geometry(&self) -> std::result::Result<(), String> {
        match self.shape_kind {
            ShapeKind::GlobalValue | ShapeKind::LocalValue => {
                if !self.shape.is_empty() || !self.start.is_empty() || !self.count.is_empty() {
                    return Err("single values cannot carry a shape".into());
                }
            }
            ShapeKind::LocalArray => {
                if !self.shape.is_empty() {
                    return Err("local arrays have no global shape".into());
                }
                if !self.start.is_empty() {
                    return Err("local arrays have no global start".into());
                }
            }
            ShapeKind::GlobalArray => {
                if !self.start.is_empty() || !self.count.is_empty() {
                    if self.start.len() != self.shape.len() {
                        return Err(format!(
                            "start has {} dimensions, shape has {}",
                            self.start.len(),
                            self.shape.len()
                        ));
                    }
                    if self.count.len() != self.shape.len() {
                        return Err(format!(
                            "count has {} dimensions, shape has {}",
                            self.count.len(),
                            self.shape.len()
                        ));
                    }
                    for i in 0..self.shape.len() {
                        let end = self.start[i].checked_add(self.count[i]);
                        if end.map(|end| end > self.shape[i]).unwrap_or(true) {
                            return Err(format!(
                                "start[{0}] + count[{0}] = {1} + {2} exceeds shape[{0}] = {3}",
                                i, self.start[i], self.count[i], self.shape[i]
                            ));
                        }
                    }
                }
            }
        }

        if !self.memory_start.is_empty() || !self.memory_count.is_empty() {
            if self.memory_start.len() != self.count.len()
                || self.memory_count.len() != self.count.len()
            {
                return Err("memory selection dimensions do not match count".into());
            }
            for i in 0..self.count.len() {
                let end = self.memory_start[i].checked_add(self.memory_count[i]);
                if end.map(|end| end > self.count[i]).unwrap_or(true) {
                    return Err(format!(
                        "memory selection in dimension {} does not fit in count {}",
                        i, self.count[i]
                    ));
                }
            }
        }

        let bytes = product(&self.count)
            .and_then(|n| n.checked_mul(self.element_size()))
            .and_then(|n| n.checked_mul(self.step_count));
        if bytes.is_none() {
            return Err("selection size overflows".into());
        }

        Ok(())
    }

    /// The box actually transferred, in global coordinates (local coordinates for
    /// local arrays). Differs from start/count only under a memory selection.
    pub(crate) fn transfer_box(&self) -> (Dims, Dims) {
        if self.memory_count.is_empty() {
            return (self.start.clone(), self.count.clone());
        }

        let start = if self.start.is_empty() {
            Dims::new()
        } else {
            self.start
                .iter()
                .zip(&self.memory_start)
                .map(|(s, m)| s + m)
                .collect()
        };
        (start, self.memory_count.clone())
    }

    pub(crate) fn mark_used(&mut self) {
        self.used = true;
    }

    pub(crate) fn record_transform_sizes(&mut self, records: &[TransformRecord]) {
        for (info, record) in self.transforms.iter_mut().zip(records) {
            info.resulting_size = Some(record.output_size);
        }
    }

    pub(crate) fn set_available_steps(&mut self, start: usize, count: usize) {
        self.available_steps_start = start;
        self.available_steps_count = count;
    }

    /// Builds the reader-side view of a variable found in stream metadata.
    pub(crate) fn from_index(
        name: &str,
        element_type: ElementType,
        shape_kind: ShapeKind,
        shape: Dims,
        count: Dims,
    ) -> Variable {
        let start = if shape_kind == ShapeKind::GlobalArray {
            vec![0; shape.len()]
        } else {
            Dims::new()
        };

        Variable {
            name: name.to_string(),
            element_type,
            shape_kind,
            single_value: shape_kind.is_value(),
            constant_dims: false,
            shape,
            start,
            count,
            memory_start: Dims::new(),
            memory_count: Dims::new(),
            step_start: 0,
            step_count: 1,
            available_steps_start: 0,
            available_steps_count: 1,
            transforms: Vec::new(),
            used: false,
        }
    }
}
