//! Multi-dimensional resource vector used for all capacity accounting.

use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Field names in the order used by [`Resources::as_array`]. The constraint
/// clamp iterates resources by index and uses these names for logging.
pub const RESOURCE_NAMES: [&str; 4] = ["cpus", "mem", "disk", "gpus"];

/// Weighted capacity along every resource dimension the pool tracks.
///
/// Targets and capacities exposed to callers are non-negative; intermediate
/// deltas inside the planner may be transiently negative.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Resources {
    #[serde(default)]
    pub cpus: f64,
    #[serde(default)]
    pub mem: f64,
    #[serde(default)]
    pub disk: f64,
    #[serde(default)]
    pub gpus: f64,
}

impl Resources {
    pub fn new(cpus: f64, mem: f64, disk: f64, gpus: f64) -> Self {
        Self {
            cpus,
            mem,
            disk,
            gpus,
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.cpus, self.mem, self.disk, self.gpus]
    }

    pub fn from_array(values: [f64; 4]) -> Self {
        Self {
            cpus: values[0],
            mem: values[1],
            disk: values[2],
            gpus: values[3],
        }
    }

    /// `true` if every field is <= the corresponding field of `other`.
    pub fn all_le(&self, other: &Resources) -> bool {
        self.as_array()
            .iter()
            .zip(other.as_array())
            .all(|(a, b)| *a <= b)
    }

    /// `true` if every field is >= the corresponding field of `other`.
    pub fn all_ge(&self, other: &Resources) -> bool {
        self.as_array()
            .iter()
            .zip(other.as_array())
            .all(|(a, b)| *a >= b)
    }

    /// `true` if any field is > the corresponding field of `other`.
    pub fn any_gt(&self, other: &Resources) -> bool {
        self.as_array()
            .iter()
            .zip(other.as_array())
            .any(|(a, b)| *a > b)
    }

    /// `true` if any field is < the corresponding field of `other`.
    pub fn any_lt(&self, other: &Resources) -> bool {
        self.as_array()
            .iter()
            .zip(other.as_array())
            .any(|(a, b)| *a < b)
    }

    /// `true` if any field is <= the corresponding field of `other`.
    pub fn any_le(&self, other: &Resources) -> bool {
        self.as_array()
            .iter()
            .zip(other.as_array())
            .any(|(a, b)| *a <= b)
    }

    /// Pointwise minimum with `upper_bound`.
    pub fn clamp(&self, upper_bound: &Resources) -> Resources {
        let bound = upper_bound.as_array();
        let mut clamped = self.as_array();
        for (value, limit) in clamped.iter_mut().zip(bound) {
            *value = value.min(limit);
        }
        Resources::from_array(clamped)
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, other: Resources) -> Resources {
        Resources {
            cpus: self.cpus + other.cpus,
            mem: self.mem + other.mem,
            disk: self.disk + other.disk,
            gpus: self.gpus + other.gpus,
        }
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(self, other: Resources) -> Resources {
        Resources {
            cpus: self.cpus - other.cpus,
            mem: self.mem - other.mem,
            disk: self.disk - other.disk,
            gpus: self.gpus - other.gpus,
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, other: Resources) {
        *self = *self + other;
    }
}

impl SubAssign for Resources {
    fn sub_assign(&mut self, other: Resources) {
        *self = *self - other;
    }
}

impl Div<f64> for Resources {
    type Output = Resources;

    fn div(self, divisor: f64) -> Resources {
        Resources {
            cpus: self.cpus / divisor,
            mem: self.mem / divisor,
            disk: self.disk / divisor,
            gpus: self.gpus / divisor,
        }
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Resources {
        iter.fold(Resources::default(), |acc, value| acc + value)
    }
}
