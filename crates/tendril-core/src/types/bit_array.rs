use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-size bitmap indexed by validator position.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BitArray {
    bits: BitVec<u8, Lsb0>,
}

impl BitArray {
    pub fn new(len: usize) -> Self {
        BitArray {
            bits: bitvec![u8, Lsb0; 0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Out-of-range indices read as unset.
    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).map_or(false, |bit| *bit)
    }

    /// Returns false when `index` is out of range.
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        if index >= self.bits.len() {
            return false;
        }
        self.bits.set(index, value);
        true
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_all_clear(&self) -> bool {
        self.bits.not_any()
    }

    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Union; the result has the length of the longer operand.
    pub fn or(&self, other: &BitArray) -> BitArray {
        let mut out = BitArray::new(self.len().max(other.len()));
        for index in self.ones().chain(other.ones()) {
            out.set(index, true);
        }
        out
    }

    /// Bits set in `self` but not in `other`.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut out = BitArray::new(self.len());
        for index in self.ones().filter(|i| !other.get(*i)) {
            out.set(index, true);
        }
        out
    }
}

impl fmt::Display for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in self.bits.iter() {
            f.write_str(if *bit { "x" } else { "_" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BA{{{}:{}}}", self.len(), self)
    }
}
