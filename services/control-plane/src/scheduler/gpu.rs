//! GPU capacity checks against a cached cluster.

use chrono::{DateTime, Utc};

use super::{SchedulerError, SchedulerResult};
use crate::cache::{Cluster, ProvisionableResource};

/// Instance families known to carry accelerators.
///
/// New families are not picked up automatically; extend this list.
const GPU_INSTANCE_FAMILIES: &[&str] = &["g5", "p4d", "p4de", "p5"];

/// Whether `cluster` can take `requested` more GPUs.
///
/// With GPU nodes present the free count is `allocatable - confirmed - assumed`.
/// Without them the cluster qualifies if the autoscaler can add a GPU shape.
pub fn can_provision_gpus(
    requested: u32,
    cluster: &Cluster,
    now: DateTime<Utc>,
) -> SchedulerResult<bool> {
    if !cluster.gpu_nodes.is_empty() {
        let used = cluster.allocated_gpus() + cluster.assumed_gpus(now);
        let free = cluster.allocatable_gpus().saturating_sub(used);
        return Ok(u64::from(requested) <= free);
    }

    for resource in &cluster.provisionable_resources {
        if is_gpu_resource(resource)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Checks the instance type first, then the family. Empty fields are skipped.
fn is_gpu_resource(resource: &ProvisionableResource) -> SchedulerResult<bool> {
    if !resource.instance_type.is_empty() && is_gpu_instance_type(&resource.instance_type)? {
        return Ok(true);
    }
    Ok(!resource.instance_family.is_empty() && is_gpu_family(&resource.instance_family))
}

/// Classifies an instance type of the form `family.size` (e.g. `g5.12xlarge`).
pub fn is_gpu_instance_type(instance_type: &str) -> SchedulerResult<bool> {
    let mut parts = instance_type.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(family), Some(size), None) if !family.is_empty() && !size.is_empty() => {
            Ok(is_gpu_family(family))
        }
        _ => Err(SchedulerError::InvalidInstanceType(instance_type.to_string())),
    }
}

pub fn is_gpu_family(family: &str) -> bool {
    GPU_INSTANCE_FAMILIES.contains(&family)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ClusterRecord, ClusterStatus};
    use rstest::rstest;

    #[rstest]
    #[case("g5.xlarge", true)]
    #[case("p4d.24xlarge", true)]
    #[case("p4de.24xlarge", true)]
    #[case("p5.48xlarge", true)]
    #[case("m5.large", false)]
    #[case("c6i.2xlarge", false)]
    fn test_instance_type_classification(#[case] instance_type: &str, #[case] gpu: bool) {
        assert_eq!(is_gpu_instance_type(instance_type).unwrap(), gpu);
    }

    #[rstest]
    #[case("")]
    #[case("g5")]
    #[case("g5.")]
    #[case(".xlarge")]
    #[case("g5.x.large")]
    fn test_malformed_instance_type_is_error(#[case] instance_type: &str) {
        assert!(matches!(
            is_gpu_instance_type(instance_type),
            Err(SchedulerError::InvalidInstanceType(_))
        ));
    }

    fn shape(instance_type: &str, instance_family: &str) -> ProvisionableResource {
        ProvisionableResource {
            instance_type: instance_type.into(),
            instance_family: instance_family.into(),
        }
    }

    fn autoscaling_cluster(shapes: Vec<ProvisionableResource>) -> Cluster {
        Cluster::from_record(&ClusterRecord {
            tenant_id: "tenant-a".into(),
            cluster_id: "c1".into(),
            name: "c1".into(),
            status: ClusterStatus {
                provisionable_resources: shapes,
                ..Default::default()
            },
            updated_at: Utc::now(),
        })
    }

    #[rstest]
    #[case(shape("g5.xlarge", "m5"), true)]
    #[case(shape("m5.large", "g5"), true)]
    #[case(shape("", "p5"), true)]
    #[case(shape("m5.large", ""), false)]
    #[case(shape("", "m5"), false)]
    #[case(shape("", ""), false)]
    fn test_shape_classification(#[case] resource: ProvisionableResource, #[case] gpu: bool) {
        assert_eq!(is_gpu_resource(&resource).unwrap(), gpu);
    }

    #[test]
    fn test_malformed_type_reported_even_with_family() {
        assert!(matches!(
            is_gpu_resource(&shape("g5", "g5")),
            Err(SchedulerError::InvalidInstanceType(_))
        ));
    }

    #[test]
    fn test_empty_shape_does_not_hide_later_gpu_shape() {
        let cluster = autoscaling_cluster(vec![shape("", ""), shape("g5.xlarge", "")]);
        assert!(can_provision_gpus(1, &cluster, Utc::now()).unwrap());
    }
}
