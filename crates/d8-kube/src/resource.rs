//! `DataExport` / `DataImport` objects.
//!
//! Both are handled as [`DynamicObject`]s; only the handful of spec fields
//! `d8` sets are written here.

use crate::{KubeContext, KubeError};
use d8_data::VolumeMode;
use kube::api::{DeleteParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Api;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

pub const GROUP: &str = "storage.deckhouse.io";
pub const VERSION: &str = "v1alpha1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Export,
    Import,
}

impl TransferKind {
    pub fn kind(self) -> &'static str {
        match self {
            TransferKind::Export => "DataExport",
            TransferKind::Import => "DataImport",
        }
    }

    pub fn api_resource(self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, self.kind()))
    }
}

/// Volume-like objects a `DataExport` can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    PersistentVolumeClaim,
    VolumeSnapshot,
    VirtualDisk,
    VirtualDiskSnapshot,
}

impl VolumeKind {
    pub fn k8s_kind(self) -> &'static str {
        match self {
            VolumeKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            VolumeKind::VolumeSnapshot => "VolumeSnapshot",
            VolumeKind::VirtualDisk => "VirtualDisk",
            VolumeKind::VirtualDiskSnapshot => "VirtualDiskSnapshot",
        }
    }

    pub fn short(self) -> &'static str {
        match self {
            VolumeKind::PersistentVolumeClaim => "pvc",
            VolumeKind::VolumeSnapshot => "vs",
            VolumeKind::VirtualDisk => "vd",
            VolumeKind::VirtualDiskSnapshot => "vds",
        }
    }
}

impl FromStr for VolumeKind {
    type Err = KubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pvc" | "persistentvolumeclaim" => Ok(VolumeKind::PersistentVolumeClaim),
            "vs" | "volumesnapshot" => Ok(VolumeKind::VolumeSnapshot),
            "vd" | "virtualdisk" => Ok(VolumeKind::VirtualDisk),
            "vds" | "virtualdisksnapshot" => Ok(VolumeKind::VirtualDiskSnapshot),
            _ => Err(KubeError::InvalidTarget(s.to_owned())),
        }
    }
}

/// `KIND/NAME` as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    pub kind: VolumeKind,
    pub name: String,
}

impl ExportTarget {
    /// Name of the throwaway `DataExport` created for a one-shot download.
    pub fn ephemeral_export_name(&self) -> String {
        format!("download-{}-{}", self.kind.short(), self.name)
    }
}

impl fmt::Display for ExportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.short(), self.name)
    }
}

impl FromStr for ExportTarget {
    type Err = KubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('/')
            .ok_or_else(|| KubeError::InvalidTarget(s.to_owned()))?;
        if name.is_empty() || name.contains('/') {
            return Err(KubeError::InvalidTarget(s.to_owned()));
        }
        let kind = kind
            .parse()
            .map_err(|_| KubeError::InvalidTarget(s.to_owned()))?;
        Ok(Self {
            kind,
            name: name.to_owned(),
        })
    }
}

/// The PVC a `DataImport` provisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportVolume {
    pub size: String,
    pub storage_class: Option<String>,
    pub access_mode: String,
    pub volume_mode: VolumeMode,
    pub wait_for_first_consumer: bool,
}

pub fn export_spec(target: &ExportTarget, ttl: &str, publish: bool) -> Value {
    json!({
        "spec": {
            "ttl": ttl,
            "publish": publish,
            "targetRef": {
                "kind": target.kind.k8s_kind(),
                "name": target.name,
            },
        }
    })
}

pub fn import_spec(name: &str, volume: &ImportVolume, ttl: &str, publish: bool) -> Value {
    let mut pvc_spec = json!({
        "accessModes": [volume.access_mode],
        "volumeMode": volume.volume_mode.to_string(),
        "resources": { "requests": { "storage": volume.size } },
    });
    if let Some(ref class) = volume.storage_class {
        pvc_spec["storageClassName"] = json!(class);
    }
    json!({
        "spec": {
            "ttl": ttl,
            "publish": publish,
            "waitForFirstConsumer": volume.wait_for_first_consumer,
            "targetRef": {
                "kind": "PersistentVolumeClaim",
                "pvcTemplate": {
                    "metadata": { "name": name },
                    "spec": pvc_spec,
                },
            },
        }
    })
}

impl KubeContext {
    fn transfer_api(&self, kind: TransferKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client(), namespace, &kind.api_resource())
    }

    /// Create a `DataExport` or `DataImport` whose body is `data` (a `{"spec": …}` object).
    pub fn create_transfer(
        &self,
        kind: TransferKind,
        namespace: &str,
        name: &str,
        data: Value,
    ) -> Result<(), KubeError> {
        let object = DynamicObject::new(name, &kind.api_resource())
            .within(namespace)
            .data(data);
        let api = self.transfer_api(kind, namespace);
        self.block_on(api.create(&PostParams::default(), &object))?;
        info!("created {} {namespace}/{name}", kind.kind());
        Ok(())
    }

    pub fn get_transfer(
        &self,
        kind: TransferKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, KubeError> {
        let api = self.transfer_api(kind, namespace);
        Ok(self.block_on(api.get_opt(name))?)
    }

    /// Delete the resource. Returns `false` when it did not exist.
    pub fn delete_transfer(
        &self,
        kind: TransferKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, KubeError> {
        let api = self.transfer_api(kind, namespace);
        match self.block_on(api.delete(name, &DeleteParams::default())) {
            Ok(_) => {
                info!("deleted {} {namespace}/{name}", kind.kind());
                Ok(true)
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                warn!("{} {namespace}/{name} not found", kind.kind());
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
