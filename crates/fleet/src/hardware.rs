//! Instance type selection.
//!
//! Matches a [`Constraint`] against the backend's catalog. Every specified
//! constraint field is treated as a minimum; among the survivors the
//! cheapest entry wins, ties broken by the smallest memory so that we do
//! not over-provision.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constraints::{Constraint, HardwareCharacteristics};
use crate::error::ProvisionError;

/// One entry in a backend's instance type catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceType {
    /// Backend name of the type (e.g. "m1.small").
    pub name: String,
    pub arch: String,
    /// Memory in MB.
    pub mem: u64,
    pub cpu_cores: u64,
    pub cpu_power: u64,
    /// Relative cost unit supplied by the backend.
    pub cost: u64,
}

impl InstanceType {
    /// Hardware an instance of this type would have.
    #[must_use]
    pub fn characteristics(&self) -> HardwareCharacteristics {
        HardwareCharacteristics {
            arch: self.arch.clone(),
            mem: self.mem,
            cpu_cores: self.cpu_cores,
            cpu_power: self.cpu_power,
            root_disk: None,
        }
    }

    fn matches(&self, constraint: &Constraint) -> bool {
        constraint.arch.as_ref().is_none_or(|a| *a == self.arch)
            && constraint.mem.is_none_or(|m| self.mem >= m)
            && constraint.cpu_cores.is_none_or(|c| self.cpu_cores >= c)
            && constraint.cpu_power.is_none_or(|p| self.cpu_power >= p)
    }
}

/// Result of a successful selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub instance_type: InstanceType,
    pub characteristics: HardwareCharacteristics,
}

/// Pick the instance type to launch for `constraint`.
///
/// The returned characteristics are the selected entry's real values,
/// which may exceed what was asked for. `root-disk` is not a property of
/// the instance type and is ignored here.
///
/// # Errors
///
/// Returns [`ProvisionError::NoMatchingHardware`] when no entry satisfies
/// the constraint.
pub fn select(
    constraint: &Constraint,
    catalog: &[InstanceType],
    region: &str,
) -> Result<Selection, ProvisionError> {
    let best = catalog
        .iter()
        .filter(|it| it.matches(constraint))
        .min_by(|a, b| {
            a.cost
                .cmp(&b.cost)
                .then(a.mem.cmp(&b.mem))
                .then_with(|| a.name.cmp(&b.name))
        })
        .ok_or_else(|| ProvisionError::NoMatchingHardware {
            constraint: constraint.to_string(),
            region: region.to_string(),
        })?;

    debug!(
        instance_type = %best.name,
        constraint = %constraint,
        candidates = catalog.len(),
        "Selected instance type"
    );

    Ok(Selection {
        instance_type: best.clone(),
        characteristics: best.characteristics(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, arch: &str, mem: u64, cores: u64, power: u64, cost: u64) -> InstanceType {
        InstanceType {
            name: name.to_string(),
            arch: arch.to_string(),
            mem,
            cpu_cores: cores,
            cpu_power: power,
            cost,
        }
    }

    fn small() -> InstanceType {
        entry("m1.small", "amd64", 1740, 1, 100, 60)
    }

    fn catalog() -> Vec<InstanceType> {
        vec![
            entry("m1.large", "amd64", 7680, 2, 400, 240),
            small(),
            entry("t1.micro", "arm64", 613, 1, 20, 20),
            entry("m1.medium", "amd64", 3840, 1, 200, 120),
            entry("c1.medium", "amd64", 1740, 2, 500, 145),
        ]
    }

    #[test]
    fn test_empty_constraint_returns_only_entry_unchanged() {
        let selection = select(&Constraint::any(), &[small()], "test").unwrap();
        assert_eq!(selection.instance_type, small());
        assert_eq!(
            selection.characteristics.to_string(),
            "arch=amd64 cpu-cores=1 cpu-power=100 mem=1740M"
        );
    }

    #[test]
    fn test_memory_is_a_minimum() {
        let selection = select(&Constraint::any().with_mem(1024), &[small()], "test").unwrap();
        assert_eq!(selection.instance_type.name, "m1.small");
        assert_eq!(selection.characteristics.mem, 1740);
    }

    #[test]
    fn test_cheapest_match_wins() {
        let selection = select(&Constraint::any().with_arch("amd64"), &catalog(), "test").unwrap();
        assert_eq!(selection.instance_type.name, "m1.small");

        let selection = select(&Constraint::any(), &catalog(), "test").unwrap();
        assert_eq!(selection.instance_type.name, "t1.micro");

        let selection = select(&Constraint::any().with_cpu_cores(2), &catalog(), "test").unwrap();
        assert_eq!(selection.instance_type.name, "c1.medium");
    }

    #[test]
    fn test_cost_tie_prefers_smaller_memory() {
        let catalog = vec![
            entry("big", "amd64", 8192, 2, 100, 50),
            entry("small", "amd64", 2048, 2, 100, 50),
        ];
        let selection = select(&Constraint::any(), &catalog, "test").unwrap();
        assert_eq!(selection.instance_type.name, "small");
    }

    #[test]
    fn test_no_match() {
        let err = select(&Constraint::any().with_mem(1024 * 1024), &catalog(), "test").unwrap_err();
        assert!(matches!(err, ProvisionError::NoMatchingHardware { .. }));

        let err = select(&Constraint::any(), &[], "test").unwrap_err();
        assert!(matches!(err, ProvisionError::NoMatchingHardware { .. }));
    }

    #[test]
    fn test_selection_satisfies_constraint() {
        let constraints = [
            Constraint::any(),
            Constraint::any().with_mem(2000),
            Constraint::any().with_cpu_power(300),
            Constraint::any().with_arch("arm64"),
            Constraint::any().with_arch("amd64").with_cpu_cores(2).with_mem(4000),
            Constraint::any().with_arch("arm64").with_mem(1000),
        ];
        for constraint in &constraints {
            match select(constraint, &catalog(), "test") {
                Ok(selection) => assert!(
                    selection.characteristics.satisfies(constraint),
                    "{} does not satisfy {constraint}",
                    selection.characteristics
                ),
                Err(err) => assert!(matches!(err, ProvisionError::NoMatchingHardware { .. })),
            }
        }
    }
}
