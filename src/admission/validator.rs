//! LVMCluster admission validation
//!
//! Pure checks run against an incoming LVMCluster (and the stored version on
//! update). The first violated rule is reported; rejection messages are
//! matched verbatim by clients and must stay stable.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::crd::{DeviceClass, LVMCluster};

/// Filesystems a device class may format volumes with
pub const SUPPORTED_FILESYSTEMS: [&str; 2] = ["ext4", "xfs"];

/// Prefix every device path must carry
pub const DEVICE_PATH_PREFIX: &str = "/dev/";

/// Rejection raised by the validator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    // =========================================================================
    // Singleton / Namespace (Forbidden)
    // =========================================================================
    #[error("duplicate LVMClusters are not allowed, remove the old LVMCluster or this one")]
    DuplicateCluster,

    #[error("invalid namespace was supplied: {supplied}, LVMCluster must be created in the operator namespace {expected}")]
    InvalidNamespace { supplied: String, expected: String },

    // =========================================================================
    // Device Class Layout
    // =========================================================================
    #[error("at least one deviceClass is required")]
    NoDeviceClasses,

    #[error("one deviceClass must be set as default when multiple deviceClasses are specified")]
    NoDefaultDeviceClass,

    #[error("only one default deviceClass is allowed, found {count}")]
    MultipleDefaultDeviceClasses { count: usize },

    #[error("deviceClass name {name} is specified more than once")]
    DuplicateDeviceClassName { name: String },

    // =========================================================================
    // Device Selection
    // =========================================================================
    #[error("either paths or optionalPaths must be specified when deviceSelector is set for deviceClass {device_class}")]
    EmptyDeviceSelector { device_class: String },

    #[error("deviceSelector must be specified for deviceClass {device_class} when there are multiple deviceClasses")]
    MissingDeviceSelector { device_class: String },

    #[error("path {path} in deviceClass {device_class} must be an absolute path under /dev/")]
    InvalidDevicePath { path: String, device_class: String },

    #[error("device path {path} is specified at multiple places in deviceClass {device_class}")]
    DuplicateDevicePath { path: String, device_class: String },

    #[error("device path {path} overlaps in two different deviceClasses {first} and {second}")]
    OverlappingDevicePath {
        path: String,
        first: String,
        second: String,
    },

    #[error("fstype '{fstype}' of deviceClass {device_class} is not supported, must be one of ext4, xfs")]
    UnsupportedFilesystem { fstype: String, device_class: String },

    // =========================================================================
    // Thin Pool
    // =========================================================================
    #[error("thinPoolConfig.sizePercent of deviceClass {device_class} must be between 10 and 100, got {value}")]
    SizePercentOutOfRange { device_class: String, value: i32 },

    #[error("thinPoolConfig.overprovisionRatio of deviceClass {device_class} must be between 1 and 100, got {value}")]
    OverprovisionRatioOutOfRange { device_class: String, value: i32 },

    #[error("thinPoolConfig cannot be added to existing deviceClass {device_class}")]
    ThinPoolAdded { device_class: String },

    #[error("thinPoolConfig cannot be removed from existing deviceClass {device_class}")]
    ThinPoolRemoved { device_class: String },

    #[error("thinPoolConfig.{field} of deviceClass {device_class} is immutable")]
    ThinPoolFieldChanged {
        device_class: String,
        field: &'static str,
    },

    // =========================================================================
    // Path Immutability
    // =========================================================================
    #[error("device path {path} cannot be removed from deviceClass {device_class}, paths can only be added")]
    DevicePathRemoved { path: String, device_class: String },
}

impl ValidationError {
    /// Whether the rejection is a policy denial rather than a malformed object
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            ValidationError::DuplicateCluster | ValidationError::InvalidNamespace { .. }
        )
    }

    /// HTTP status code carried in the admission response
    pub fn code(&self) -> u16 {
        if self.is_forbidden() {
            403
        } else {
            422
        }
    }

    /// Status reason carried in the admission response
    pub fn reason(&self) -> &'static str {
        if self.is_forbidden() {
            "Forbidden"
        } else {
            "Invalid"
        }
    }
}

pub type ValidationResult = std::result::Result<(), ValidationError>;

// =============================================================================
// Entry Points
// =============================================================================

/// Validate a new LVMCluster
///
/// `existing` lists the clusters already stored; `operator_namespace` is the
/// only namespace an LVMCluster may live in.
pub fn validate_create(
    cluster: &LVMCluster,
    existing: &[LVMCluster],
    operator_namespace: &str,
) -> ValidationResult {
    if !existing.is_empty() {
        return Err(ValidationError::DuplicateCluster);
    }

    let supplied = cluster.metadata.namespace.as_deref().unwrap_or_default();
    if supplied != operator_namespace {
        return Err(ValidationError::InvalidNamespace {
            supplied: supplied.to_string(),
            expected: operator_namespace.to_string(),
        });
    }

    validate_spec(cluster)
}

/// Validate a change to a stored LVMCluster
pub fn validate_update(old: &LVMCluster, new: &LVMCluster) -> ValidationResult {
    validate_spec(new)?;

    for device_class in new.device_classes() {
        // Classes introduced by this update have nothing to compare against
        let Some(previous) = old.device_class(&device_class.name) else {
            continue;
        };
        verify_thin_pool_unchanged(previous, device_class)?;
        verify_paths_retained(previous, device_class)?;
    }

    Ok(())
}

/// Checks shared by create and update
pub fn validate_spec(cluster: &LVMCluster) -> ValidationResult {
    let device_classes = cluster.device_classes();

    verify_single_default(device_classes)?;
    verify_unique_names(device_classes)?;
    verify_device_selectors(device_classes)?;
    verify_absolute_paths(device_classes)?;
    verify_no_overlap(device_classes)?;
    verify_filesystems(device_classes)?;
    verify_thin_pool_bounds(device_classes)?;

    Ok(())
}

// =============================================================================
// Spec Checks
// =============================================================================

fn verify_single_default(device_classes: &[DeviceClass]) -> ValidationResult {
    match device_classes.len() {
        0 => Err(ValidationError::NoDeviceClasses),
        // A lone device class is the default implicitly
        1 => Ok(()),
        _ => match device_classes.iter().filter(|dc| dc.default).count() {
            0 => Err(ValidationError::NoDefaultDeviceClass),
            1 => Ok(()),
            count => Err(ValidationError::MultipleDefaultDeviceClasses { count }),
        },
    }
}

fn verify_unique_names(device_classes: &[DeviceClass]) -> ValidationResult {
    let mut seen = std::collections::HashSet::new();
    for dc in device_classes {
        if !seen.insert(dc.name.as_str()) {
            return Err(ValidationError::DuplicateDeviceClassName {
                name: dc.name.clone(),
            });
        }
    }
    Ok(())
}

fn verify_device_selectors(device_classes: &[DeviceClass]) -> ValidationResult {
    for dc in device_classes {
        match &dc.device_selector {
            Some(selector) if selector.is_empty() => {
                return Err(ValidationError::EmptyDeviceSelector {
                    device_class: dc.name.clone(),
                });
            }
            None if device_classes.len() > 1 => {
                return Err(ValidationError::MissingDeviceSelector {
                    device_class: dc.name.clone(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

fn verify_absolute_paths(device_classes: &[DeviceClass]) -> ValidationResult {
    for dc in device_classes {
        let Some(selector) = &dc.device_selector else {
            continue;
        };
        if let Some(path) = selector
            .all_paths()
            .find(|p| !p.starts_with(DEVICE_PATH_PREFIX))
        {
            return Err(ValidationError::InvalidDevicePath {
                path: path.clone(),
                device_class: dc.name.clone(),
            });
        }
    }
    Ok(())
}

/// Device paths must be unique among device classes sharing a node selector
///
/// Selectors are compared by their serialized form, so two selectors that
/// select the same nodes with differently ordered terms are not considered
/// the same scope.
fn verify_no_overlap(device_classes: &[DeviceClass]) -> ValidationResult {
    let mut scopes: HashMap<String, BTreeMap<&str, &str>> = HashMap::new();

    for dc in device_classes {
        let Some(selector) = &dc.device_selector else {
            continue;
        };
        let scope = serde_json::to_string(&dc.node_selector).unwrap_or_default();
        let owners = scopes.entry(scope).or_default();

        for path in selector.all_paths() {
            match owners.get(path.as_str()) {
                Some(owner) if *owner == dc.name => {
                    return Err(ValidationError::DuplicateDevicePath {
                        path: path.clone(),
                        device_class: dc.name.clone(),
                    });
                }
                Some(owner) => {
                    return Err(ValidationError::OverlappingDevicePath {
                        path: path.clone(),
                        first: owner.to_string(),
                        second: dc.name.clone(),
                    });
                }
                None => {
                    owners.insert(path.as_str(), dc.name.as_str());
                }
            }
        }
    }
    Ok(())
}

fn verify_filesystems(device_classes: &[DeviceClass]) -> ValidationResult {
    for dc in device_classes {
        if !SUPPORTED_FILESYSTEMS.contains(&dc.fstype.as_str()) {
            return Err(ValidationError::UnsupportedFilesystem {
                fstype: dc.fstype.clone(),
                device_class: dc.name.clone(),
            });
        }
    }
    Ok(())
}

fn verify_thin_pool_bounds(device_classes: &[DeviceClass]) -> ValidationResult {
    for dc in device_classes {
        let Some(tp) = &dc.thin_pool_config else {
            continue;
        };
        if !(10..=100).contains(&tp.size_percent) {
            return Err(ValidationError::SizePercentOutOfRange {
                device_class: dc.name.clone(),
                value: tp.size_percent,
            });
        }
        if !(1..=100).contains(&tp.overprovision_ratio) {
            return Err(ValidationError::OverprovisionRatioOutOfRange {
                device_class: dc.name.clone(),
                value: tp.overprovision_ratio,
            });
        }
    }
    Ok(())
}

// =============================================================================
// Update Checks
// =============================================================================

fn verify_thin_pool_unchanged(old: &DeviceClass, new: &DeviceClass) -> ValidationResult {
    let device_class = || new.name.clone();

    match (&old.thin_pool_config, &new.thin_pool_config) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(ValidationError::ThinPoolAdded {
            device_class: device_class(),
        }),
        (Some(_), None) => Err(ValidationError::ThinPoolRemoved {
            device_class: device_class(),
        }),
        (Some(before), Some(after)) => {
            let field = if before.name != after.name {
                Some("name")
            } else if before.size_percent != after.size_percent {
                Some("sizePercent")
            } else if before.overprovision_ratio != after.overprovision_ratio {
                Some("overprovisionRatio")
            } else {
                None
            };
            match field {
                Some(field) => Err(ValidationError::ThinPoolFieldChanged {
                    device_class: device_class(),
                    field,
                }),
                None => Ok(()),
            }
        }
    }
}

fn verify_paths_retained(old: &DeviceClass, new: &DeviceClass) -> ValidationResult {
    let Some(before) = &old.device_selector else {
        return Ok(());
    };
    let empty = Vec::new();
    let (paths, optional_paths) = match &new.device_selector {
        Some(after) => (&after.paths, &after.optional_paths),
        None => (&empty, &empty),
    };

    let removed = before
        .paths
        .iter()
        .find(|p| !paths.contains(p))
        .or_else(|| before.optional_paths.iter().find(|p| !optional_paths.contains(p)));

    match removed {
        Some(path) => Err(ValidationError::DevicePathRemoved {
            path: path.clone(),
            device_class: new.name.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DeviceSelector, LVMClusterSpec, Storage, ThinPoolConfig};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{
        NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    };
    use kube::core::ObjectMeta;

    const NAMESPACE: &str = "openshift-storage";

    fn cluster(device_classes: Vec<DeviceClass>) -> LVMCluster {
        LVMCluster {
            metadata: ObjectMeta {
                name: Some("my-lvmcluster".into()),
                namespace: Some(NAMESPACE.into()),
                ..Default::default()
            },
            spec: LVMClusterSpec {
                tolerations: vec![],
                storage: Storage { device_classes },
            },
            status: None,
        }
    }

    fn device_class(name: &str, paths: &[&str]) -> DeviceClass {
        DeviceClass {
            name: name.into(),
            device_selector: Some(DeviceSelector {
                paths: paths.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            }),
            thin_pool_config: Some(thin_pool()),
            fstype: "xfs".into(),
            ..Default::default()
        }
    }

    fn thin_pool() -> ThinPoolConfig {
        ThinPoolConfig {
            name: "thin-pool-1".into(),
            size_percent: 90,
            overprovision_ratio: 10,
            chunk_size_calculation_policy: Default::default(),
            chunk_size: None,
            metadata_size_calculation_policy: Default::default(),
            metadata_size: None,
        }
    }

    fn hostname_selector(host: &str) -> NodeSelector {
        NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: "kubernetes.io/hostname".into(),
                    operator: "In".into(),
                    values: Some(vec![host.into()]),
                }]),
                match_fields: None,
            }],
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    #[test]
    fn test_single_device_class_needs_no_default_flag() {
        let c = cluster(vec![device_class("vg1", &["/dev/sda"])]);
        assert_eq!(validate_create(&c, &[], NAMESPACE), Ok(()));
    }

    #[test]
    fn test_single_device_class_may_omit_selector() {
        let mut dc = device_class("vg1", &[]);
        dc.device_selector = None;
        assert_eq!(validate_spec(&cluster(vec![dc])), Ok(()));
    }

    #[test]
    fn test_no_device_classes_rejected() {
        let err = validate_spec(&cluster(vec![])).unwrap_err();
        assert_eq!(err, ValidationError::NoDeviceClasses);
        assert_eq!(err.code(), 422);
    }

    #[test]
    fn test_multiple_classes_without_default_rejected() {
        let c = cluster(vec![
            device_class("vg1", &["/dev/sda"]),
            device_class("vg2", &["/dev/sdb"]),
        ]);
        assert_matches!(validate_spec(&c), Err(ValidationError::NoDefaultDeviceClass));
    }

    #[test]
    fn test_multiple_defaults_rejected() {
        let mut a = device_class("vg1", &["/dev/sda"]);
        let mut b = device_class("vg2", &["/dev/sdb"]);
        a.default = true;
        b.default = true;
        let err = validate_spec(&cluster(vec![a, b])).unwrap_err();
        assert_eq!(err, ValidationError::MultipleDefaultDeviceClasses { count: 2 });
        assert!(!err.is_forbidden());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut a = device_class("vg1", &["/dev/sda"]);
        a.default = true;
        let b = device_class("vg1", &["/dev/sdb"]);
        assert_matches!(
            validate_spec(&cluster(vec![a, b])),
            Err(ValidationError::DuplicateDeviceClassName { name }) if name == "vg1"
        );
    }

    #[test]
    fn test_empty_device_selector_rejected() {
        let c = cluster(vec![device_class("vg1", &[])]);
        let err = validate_spec(&c).unwrap_err();
        assert!(err
            .to_string()
            .contains("either paths or optionalPaths must be specified"));
    }

    #[test]
    fn test_missing_selector_with_multiple_classes_rejected() {
        let mut a = device_class("vg1", &["/dev/sda"]);
        a.default = true;
        let mut b = device_class("vg2", &[]);
        b.device_selector = None;
        assert_matches!(
            validate_spec(&cluster(vec![a, b])),
            Err(ValidationError::MissingDeviceSelector { device_class }) if device_class == "vg2"
        );
    }

    #[test]
    fn test_relative_path_rejected() {
        let c = cluster(vec![device_class("vg1", &["sda"])]);
        assert_matches!(
            validate_spec(&c),
            Err(ValidationError::InvalidDevicePath { path, .. }) if path == "sda"
        );
    }

    #[test]
    fn test_duplicate_path_within_class_rejected() {
        let mut dc = device_class("vg1", &["/dev/sda"]);
        if let Some(selector) = dc.device_selector.as_mut() {
            selector.optional_paths = vec!["/dev/sda".into()];
        }
        let err = validate_spec(&cluster(vec![dc])).unwrap_err();
        assert!(err
            .to_string()
            .contains("device path /dev/sda is specified at multiple places in deviceClass vg1"));
    }

    #[test]
    fn test_overlapping_paths_name_both_classes() {
        let mut a = device_class("vg1", &["/dev/sda"]);
        a.default = true;
        let b = device_class("vg2", &["/dev/sdb", "/dev/sda"]);
        let err = validate_spec(&cluster(vec![a, b])).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("overlaps in two different deviceClasses"));
        assert!(message.contains("vg1"));
        assert!(message.contains("vg2"));
    }

    #[test]
    fn test_same_path_on_different_nodes_allowed() {
        let mut a = device_class("vg1", &["/dev/sda"]);
        a.default = true;
        a.node_selector = Some(hostname_selector("worker-0"));
        let mut b = device_class("vg2", &["/dev/sda"]);
        b.node_selector = Some(hostname_selector("worker-1"));
        assert_eq!(validate_spec(&cluster(vec![a, b])), Ok(()));
    }

    #[test]
    fn test_unsupported_filesystem_rejected() {
        let mut dc = device_class("vg1", &["/dev/sda"]);
        dc.fstype = "btrfs".into();
        let err = validate_spec(&cluster(vec![dc])).unwrap_err();
        assert!(err.to_string().contains("fstype 'btrfs'"));
    }

    #[test]
    fn test_thin_pool_bounds() {
        let mut dc = device_class("vg1", &["/dev/sda"]);
        if let Some(tp) = dc.thin_pool_config.as_mut() {
            tp.size_percent = 5;
        }
        assert_matches!(
            validate_spec(&cluster(vec![dc.clone()])),
            Err(ValidationError::SizePercentOutOfRange { value: 5, .. })
        );

        if let Some(tp) = dc.thin_pool_config.as_mut() {
            tp.size_percent = 90;
            tp.overprovision_ratio = 0;
        }
        assert_matches!(
            validate_spec(&cluster(vec![dc])),
            Err(ValidationError::OverprovisionRatioOutOfRange { value: 0, .. })
        );
    }

    #[test]
    fn test_second_cluster_forbidden() {
        let existing = cluster(vec![device_class("vg1", &["/dev/sda"])]);
        let mut c = existing.clone();
        c.metadata.name = Some("another".into());

        let err = validate_create(&c, &[existing], NAMESPACE).unwrap_err();
        assert!(err.is_forbidden());
        assert_eq!(err.code(), 403);
        assert!(err.to_string().contains("duplicate LVMClusters are not allowed"));
    }

    #[test]
    fn test_wrong_namespace_forbidden() {
        let mut c = cluster(vec![device_class("vg1", &["/dev/sda"])]);
        c.metadata.namespace = Some("default".into());

        let err = validate_create(&c, &[], NAMESPACE).unwrap_err();
        assert!(err.is_forbidden());
        assert_eq!(err.reason(), "Forbidden");
        assert!(err.to_string().contains("invalid namespace was supplied"));
    }

    // =========================================================================
    // Update
    // =========================================================================

    #[test]
    fn test_removing_path_rejected() {
        let old = cluster(vec![device_class("vg1", &["/dev/sda", "/dev/sdb"])]);
        let new = cluster(vec![device_class("vg1", &["/dev/sda"])]);

        let err = validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DevicePathRemoved {
                path: "/dev/sdb".into(),
                device_class: "vg1".into(),
            }
        );
    }

    #[test]
    fn test_appending_path_accepted() {
        let old = cluster(vec![device_class("vg1", &["/dev/sda"])]);
        let new = cluster(vec![device_class("vg1", &["/dev/sda", "/dev/sdb"])]);
        assert_eq!(validate_update(&old, &new), Ok(()));
    }

    #[test]
    fn test_moving_optional_path_to_required_rejected() {
        let mut old_dc = device_class("vg1", &["/dev/sda"]);
        if let Some(selector) = old_dc.device_selector.as_mut() {
            selector.optional_paths = vec!["/dev/sdb".into()];
        }
        let old = cluster(vec![old_dc]);
        let new = cluster(vec![device_class("vg1", &["/dev/sda", "/dev/sdb"])]);

        assert_matches!(
            validate_update(&old, &new),
            Err(ValidationError::DevicePathRemoved { path, .. }) if path == "/dev/sdb"
        );
    }

    #[test]
    fn test_size_percent_change_rejected() {
        let old = cluster(vec![device_class("vg1", &["/dev/sda"])]);
        let mut new = old.clone();
        if let Some(tp) = new.spec.storage.device_classes[0].thin_pool_config.as_mut() {
            tp.size_percent = 80;
        }

        let err = validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err,
            ValidationError::ThinPoolFieldChanged {
                device_class: "vg1".into(),
                field: "sizePercent",
            }
        );
    }

    #[test]
    fn test_thin_pool_presence_frozen() {
        let old = cluster(vec![device_class("vg1", &["/dev/sda"])]);
        let mut new = old.clone();
        new.spec.storage.device_classes[0].thin_pool_config = None;
        assert_matches!(
            validate_update(&old, &new),
            Err(ValidationError::ThinPoolRemoved { .. })
        );

        assert_matches!(
            validate_update(&new, &old),
            Err(ValidationError::ThinPoolAdded { .. })
        );
    }

    #[test]
    fn test_new_device_class_exempt_from_immutability() {
        let mut a = device_class("vg1", &["/dev/sda"]);
        let old = cluster(vec![a.clone()]);

        a.default = true;
        let mut b = device_class("vg2", &["/dev/sdb"]);
        b.thin_pool_config = None;
        let new = cluster(vec![a, b]);

        assert_eq!(validate_update(&old, &new), Ok(()));
    }

    #[test]
    fn test_update_runs_spec_checks_first() {
        let old = cluster(vec![device_class("vg1", &["/dev/sda", "/dev/sdb"])]);
        let new = cluster(vec![device_class("vg1", &["sda"])]);
        assert_matches!(
            validate_update(&old, &new),
            Err(ValidationError::InvalidDevicePath { .. })
        );
    }
}
