use std::ops::{Add, AddAssign};

/// Bytes held from the device versus bytes handed out to callers
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Utilization {
    /// Sum of the sizes of all live blocks
    pub allocated: u64,
    /// Sum of the sizes of all live allocations inside those blocks
    pub used: u64,
}

impl Utilization {
    /// Fraction of allocated memory in use, 1.0 when nothing is allocated
    pub fn efficiency(&self) -> f64 {
        if self.allocated == 0 {
            1.0
        } else {
            self.used as f64 / self.allocated as f64
        }
    }
}

impl Add for Utilization {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            allocated: self.allocated + other.allocated,
            used: self.used + other.used,
        }
    }
}

impl AddAssign for Utilization {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}
