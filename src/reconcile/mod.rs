//! Resource reconciliation.
//!
//! Adapts a template's declared bounds to the capacity of the target host.
//! Each dimension is handled independently:
//!
//! 1. `max' = min(declared max, host capacity)`
//! 2. `normal' = min(declared normal, max')`
//! 3. `min'` stays as declared, except disk where it is raised to the
//!    host-supplied floor (current usage)
//! 4. if `min' > max'` the dimension is reported and left untouched
//!
//! Errors are collected across all dimensions so the operator can fix every
//! violation in one pass. A non-empty error list means the deploy must not
//! proceed.

use crate::descriptor::{BoundTriple, Descriptor, Dimension, ValidationError};
use crate::probe::HostCapacity;
use tracing::{debug, info};

/// CPU usage limit is a percentage regardless of template bounds
const VCPU_LIMIT_CEILING: u32 = 100;

/// Outcome of reconciling one descriptor against a host
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Descriptor with every error-free dimension adjusted
    pub descriptor: Descriptor,
    /// One entry per dimension that could not be reconciled
    pub errors: Vec<ValidationError>,
    /// Dimensions whose values changed
    pub adjusted: Vec<Dimension>,
}

impl Reconciliation {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Reconcile `descriptor` against `capacity` without mutating the input
pub fn reconcile(descriptor: &Descriptor, capacity: &HostCapacity) -> Reconciliation {
    let mut result = descriptor.clone();
    let mut errors = Vec::new();
    let mut adjusted = Vec::new();

    let mut apply_f64 = |dimension: Dimension,
                         triple: &mut BoundTriple<f64>,
                         cap: f64,
                         floor: Option<f64>| {
        match reconcile_rational(triple, cap, floor) {
            Ok(next) => {
                if next != *triple {
                    debug!("{}: {:?} -> {:?}", dimension, triple, next);
                    adjusted.push(dimension);
                    *triple = next;
                }
            }
            Err((min, max)) => errors.push(ValidationError::BoundOrder { dimension, min, max }),
        }
    };

    apply_f64(
        Dimension::Memory,
        &mut result.bounds.memory,
        capacity.free_memory_gb,
        None,
    );
    apply_f64(
        Dimension::Disk,
        &mut result.bounds.disk,
        capacity.free_disk_gb,
        Some(capacity.disk_floor_gb),
    );

    let mut apply_u32 = |dimension: Dimension, triple: &mut BoundTriple<u32>, cap: u32| {
        match reconcile_integral(triple, cap) {
            Ok(next) => {
                if next != *triple {
                    debug!("{}: {:?} -> {:?}", dimension, triple, next);
                    adjusted.push(dimension);
                    *triple = next;
                }
            }
            Err((min, max)) => errors.push(ValidationError::BoundOrder {
                dimension,
                min: f64::from(min),
                max: f64::from(max),
            }),
        }
    };

    apply_u32(Dimension::Vcpu, &mut result.bounds.vcpu, capacity.cpu_count);

    if let Some(settings) = result.openvz_mut() {
        let clamped = BoundTriple::new(
            settings.vcpu_limit.min.min(VCPU_LIMIT_CEILING),
            settings.vcpu_limit.normal.min(VCPU_LIMIT_CEILING),
            settings.vcpu_limit.max,
        );
        let mut triple = clamped;
        apply_u32(Dimension::VcpuLimit, &mut triple, VCPU_LIMIT_CEILING);
        if !errors.iter().any(|e| e.dimension() == Some(Dimension::VcpuLimit)) {
            settings.vcpu_limit = triple;
        }
    }

    if errors.is_empty() {
        info!(
            "Reconciled '{}' ({} dimension(s) adjusted)",
            result.template_name,
            adjusted.len()
        );
    } else {
        info!(
            "Reconciliation of '{}' found {} violation(s)",
            result.template_name,
            errors.len()
        );
    }

    Reconciliation {
        descriptor: result,
        errors,
        adjusted,
    }
}

fn reconcile_rational(
    triple: &BoundTriple<f64>,
    cap: f64,
    floor: Option<f64>,
) -> Result<BoundTriple<f64>, (f64, f64)> {
    let max = triple.max.min(cap);
    let normal = triple.normal.min(max);
    let min = match floor {
        Some(floor) => triple.min.max(floor),
        None => triple.min,
    };
    if min > max {
        return Err((min, max));
    }
    // normal never drops below the minimum once ordering holds.
    Ok(BoundTriple::new(min, normal.max(min), max))
}

fn reconcile_integral(triple: &BoundTriple<u32>, cap: u32) -> Result<BoundTriple<u32>, (u32, u32)> {
    let max = triple.max.min(cap);
    let normal = triple.normal.min(max);
    let min = triple.min;
    if min > max {
        return Err((min, max));
    }
    Ok(BoundTriple::new(min, normal.max(min), max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DomainType;

    fn capacity(cpus: u32, memory: f64, disk: f64) -> HostCapacity {
        HostCapacity {
            cpu_count: cpus,
            free_memory_gb: memory,
            free_disk_gb: disk,
            disk_floor_gb: 0.0,
        }
    }

    #[test]
    fn test_memory_capped_by_free_memory() {
        let mut descriptor = Descriptor::new_kvm("web");
        descriptor.bounds.memory = BoundTriple::new(1.0, 8.0, 16.0);

        let result = reconcile(&descriptor, &capacity(8, 4.0, 500.0));

        assert!(result.is_ok());
        assert_eq!(result.descriptor.bounds.memory, BoundTriple::new(1.0, 4.0, 4.0));
        assert_eq!(result.adjusted, vec![Dimension::Memory]);
    }

    #[test]
    fn test_input_descriptor_is_not_mutated() {
        let mut descriptor = Descriptor::new_kvm("web");
        descriptor.bounds.memory = BoundTriple::new(1.0, 8.0, 16.0);
        let before = descriptor.clone();

        let _ = reconcile(&descriptor, &capacity(1, 2.0, 5.0));
        assert_eq!(descriptor, before);
    }

    #[test]
    fn test_min_above_capacity_is_reported_and_left_untouched() {
        let mut descriptor = Descriptor::new_kvm("web");
        descriptor.bounds.memory = BoundTriple::new(6.0, 8.0, 16.0);
        descriptor.bounds.vcpu = BoundTriple::new(4, 4, 8);

        let result = reconcile(&descriptor, &capacity(2, 4.0, 500.0));

        assert_eq!(
            result.errors,
            vec![
                ValidationError::BoundOrder {
                    dimension: Dimension::Memory,
                    min: 6.0,
                    max: 4.0
                },
                ValidationError::BoundOrder {
                    dimension: Dimension::Vcpu,
                    min: 4.0,
                    max: 2.0
                },
            ]
        );
        assert_eq!(result.descriptor.bounds.memory, descriptor.bounds.memory);
        assert_eq!(result.descriptor.bounds.vcpu, descriptor.bounds.vcpu);
    }

    #[test]
    fn test_disk_floor_raises_minimum() {
        let mut descriptor = Descriptor::new_openvz("ct");
        descriptor.bounds.disk = BoundTriple::new(2.0, 10.0, 100.0);

        let host = capacity(4, 16.0, 50.0).with_disk_floor(6.5);
        let result = reconcile(&descriptor, &host);

        assert!(result.is_ok());
        assert_eq!(result.descriptor.bounds.disk, BoundTriple::new(6.5, 10.0, 50.0));
    }

    #[test]
    fn test_disk_floor_above_free_space_is_error() {
        let descriptor = Descriptor::new_openvz("ct");
        let host = capacity(4, 16.0, 3.0).with_disk_floor(5.0);

        let result = reconcile(&descriptor, &host);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].dimension(), Some(Dimension::Disk));
    }

    #[test]
    fn test_vcpu_limit_clamped_to_percentage() {
        let mut descriptor = Descriptor::new(DomainType::Openvz, "ct");
        if let Some(settings) = descriptor.openvz_mut() {
            settings.vcpu_limit = BoundTriple::new(10, 150, 400);
        }

        let result = reconcile(&descriptor, &capacity(4, 16.0, 100.0));

        assert!(result.is_ok());
        let limit = result.descriptor.openvz().unwrap().vcpu_limit;
        assert_eq!(limit, BoundTriple::new(10, 100, 100));
    }

    #[test]
    fn test_reconciled_bounds_are_ordered_or_reported() {
        let hosts = [
            capacity(1, 0.5, 1.0),
            capacity(2, 4.0, 20.0),
            capacity(64, 512.0, 4096.0),
        ];
        let triples = [(0.5, 1.0, 2.0), (1.0, 8.0, 16.0), (3.0, 3.0, 3.0)];

        for host in &hosts {
            for (min, normal, max) in triples {
                let mut descriptor = Descriptor::new_kvm("web");
                descriptor.bounds.memory = BoundTriple::new(min, normal, max);
                descriptor.bounds.disk = BoundTriple::new(min, normal, max);

                let result = reconcile(&descriptor, host);
                for dimension in [Dimension::Memory, Dimension::Disk] {
                    let triple = match dimension {
                        Dimension::Memory => result.descriptor.bounds.memory,
                        _ => result.descriptor.bounds.disk,
                    };
                    let reported = result.errors.iter().any(|e| e.dimension() == Some(dimension));
                    assert!(triple.is_ordered() || reported);
                }
                assert!(result.descriptor.bounds.vcpu.is_ordered());
            }
        }
    }
}
