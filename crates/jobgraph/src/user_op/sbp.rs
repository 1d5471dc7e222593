//! Split / broadcast / partial-sum parallel descriptors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{InferError, InferResult};
use crate::job::OpArg;

/// How one logical blob is laid out across the devices of its placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SbpParallel {
    /// Each device holds a slice along the axis.
    Split(usize),
    /// Each device holds the whole blob.
    Broadcast,
    /// Each device holds an addend; the logical value is the sum.
    PartialSum,
}

impl fmt::Display for SbpParallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SbpParallel::Split(axis) => write!(f, "S({axis})"),
            SbpParallel::Broadcast => f.write_str("B"),
            SbpParallel::PartialSum => f.write_str("P"),
        }
    }
}

/// Parallel descriptor for every input and output slot of one op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SbpSignature {
    args: BTreeMap<OpArg, SbpParallel>,
}

impl SbpSignature {
    pub fn get(&self, arg: &str, index: usize) -> Option<SbpParallel> {
        self.args.get(&OpArg::new(arg, index)).copied()
    }

    pub fn sbp_of(&self, arg: &OpArg) -> Option<SbpParallel> {
        self.args.get(arg).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OpArg, SbpParallel)> {
        self.args.iter().map(|(arg, sbp)| (arg, *sbp))
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

impl fmt::Display for SbpSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (position, (arg, sbp)) in self.args.iter().enumerate() {
            if position > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}: {sbp}")?;
        }
        f.write_str("}")
    }
}

/// Declares one legal signature. Slots not mentioned are broadcast.
#[derive(Debug, Clone)]
#[must_use]
pub struct SbpSignatureBuilder {
    /// Every slot of the op with the rank of its tensor.
    slots: BTreeMap<OpArg, usize>,
    assigned: BTreeMap<OpArg, SbpParallel>,
}

impl SbpSignatureBuilder {
    pub(crate) fn new(slots: BTreeMap<OpArg, usize>) -> Self {
        Self {
            slots,
            assigned: BTreeMap::new(),
        }
    }

    pub fn split(self, arg: &str, index: usize, axis: usize) -> Self {
        self.with(arg, index, SbpParallel::Split(axis))
    }

    pub fn broadcast(self, arg: &str, index: usize) -> Self {
        self.with(arg, index, SbpParallel::Broadcast)
    }

    pub fn partial_sum(self, arg: &str, index: usize) -> Self {
        self.with(arg, index, SbpParallel::PartialSum)
    }

    /// Splits every slot of the op along `axis`.
    pub fn split_all(mut self, axis: usize) -> Self {
        for slot in self.slots.keys() {
            self.assigned.insert(slot.clone(), SbpParallel::Split(axis));
        }
        self
    }

    fn with(mut self, arg: &str, index: usize, sbp: SbpParallel) -> Self {
        self.assigned.insert(OpArg::new(arg, index), sbp);
        self
    }

    pub fn build(self) -> InferResult<SbpSignature> {
        for (arg, sbp) in &self.assigned {
            let Some(&rank) = self.slots.get(arg) else {
                return Err(InferError::sbp(format!(
                    "signature names `{arg}` which is not an argument of the op"
                )));
            };
            if let SbpParallel::Split(axis) = *sbp {
                if axis >= rank {
                    return Err(InferError::sbp(format!(
                        "split axis {axis} is out of range for `{arg}` of rank {rank}"
                    )));
                }
            }
        }
        let mut args = BTreeMap::new();
        for slot in self.slots.into_keys() {
            let sbp = self
                .assigned
                .get(&slot)
                .copied()
                .unwrap_or(SbpParallel::Broadcast);
            args.insert(slot, sbp);
        }
        Ok(SbpSignature { args })
    }
}
