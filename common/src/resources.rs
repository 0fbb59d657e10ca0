use serde::{Deserialize, Serialize};

/// A four-dimensional resource vector shared by node capacity accounting and
/// pod requests/limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    /// CPU, measured in millicores.
    #[serde(default)]
    pub cpu: u64,
    /// Memory, measured in MiB.
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub pods: u64,
    /// Storage, measured in MiB.
    #[serde(default)]
    pub storage: u64,
}

impl Resources {
    pub fn new(cpu: u64, memory: u64) -> Self {
        Resources {
            cpu,
            memory,
            ..Default::default()
        }
    }

    /// True when `self` fits inside `available` on every dimension.
    pub fn fits(&self, available: &Resources) -> bool {
        self.cpu <= available.cpu
            && self.memory <= available.memory
            && self.pods <= available.pods
            && self.storage <= available.storage
    }

    /// True when every dimension of `self` is at most the matching dimension
    /// of `other`.
    pub fn dominated_by(&self, other: &Resources) -> bool {
        self.fits(other)
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
            pods: self.pods.saturating_add(other.pods),
            storage: self.storage.saturating_add(other.storage),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            pods: self.pods.saturating_sub(other.pods),
            storage: self.storage.saturating_sub(other.storage),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Resources::default()
    }

    /// Largest allocated fraction across dimensions, used by least-allocated
    /// scoring. Dimensions with zero capacity are skipped.
    pub fn max_fraction_of(&self, allocatable: &Resources) -> f64 {
        let dims = [
            (self.cpu, allocatable.cpu),
            (self.memory, allocatable.memory),
            (self.pods, allocatable.pods),
            (self.storage, allocatable.storage),
        ];
        dims.into_iter()
            .filter(|(_, cap)| *cap > 0)
            .map(|(used, cap)| used as f64 / cap as f64)
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_checks_every_dimension() {
        let avail = Resources {
            cpu: 100,
            memory: 256,
            pods: 10,
            storage: 0,
        };
        assert!(Resources::new(100, 256).fits(&avail));
        assert!(!Resources::new(101, 1).fits(&avail));
        assert!(
            !Resources {
                storage: 1,
                ..Default::default()
            }
            .fits(&avail)
        );
    }

    #[test]
    fn saturating_sub_never_underflows() {
        let a = Resources::new(10, 10);
        let b = Resources::new(20, 5);
        let diff = a.saturating_sub(&b);
        assert_eq!(diff.cpu, 0);
        assert_eq!(diff.memory, 5);
    }

    #[test]
    fn max_fraction_skips_zero_capacity() {
        let allocatable = Resources::new(100, 0);
        let used = Resources::new(50, 9999);
        assert_eq!(used.max_fraction_of(&allocatable), 0.5);
    }
}
