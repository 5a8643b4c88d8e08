use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    Bind,
    Tmpfs,
    /// A directory owned by the supervisor, keyed by volume name and bound into place.
    Named,
}

impl fmt::Display for MountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountType::Bind => "bind",
            MountType::Tmpfs => "tmpfs",
            MountType::Named => "named",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    Private,
    Rprivate,
    Shared,
    Rshared,
    Slave,
    Rslave,
    Unbindable,
    Runbindable,
}

impl Propagation {
    /// `r*` modes apply to the whole mount subtree.
    pub fn is_recursive(&self) -> bool {
        matches!(
            self,
            Propagation::Rprivate
                | Propagation::Rshared
                | Propagation::Rslave
                | Propagation::Runbindable
        )
    }
}

/// A filesystem attachment scoped to the lifetime of a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    /// Stable identity, preferred over the composite key when deduplicating.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub mount_type: MountType,
    #[serde(default)]
    pub source: String,
    pub target: String,
    /// Volume name for `named` mounts.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub propagation: Option<Propagation>,
    #[serde(default)]
    pub tmpfs_size_mb: Option<u64>,
    #[serde(default)]
    pub create_target: bool,
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
}

impl Mount {
    pub fn new(mount_type: MountType, target: impl Into<String>) -> Self {
        Mount {
            id: String::new(),
            mount_type,
            source: String::new(),
            target: target.into(),
            name: String::new(),
            read_only: false,
            recursive: false,
            propagation: None,
            tmpfs_size_mb: None,
            create_target: false,
            mode: None,
            uid: None,
            gid: None,
        }
    }

    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Mount {
            source: source.into(),
            ..Mount::new(MountType::Bind, target)
        }
    }

    pub fn tmpfs(target: impl Into<String>, size_mb: u64) -> Self {
        Mount {
            tmpfs_size_mb: Some(size_mb),
            ..Mount::new(MountType::Tmpfs, target)
        }
    }

    pub fn named(name: impl Into<String>, target: impl Into<String>) -> Self {
        Mount {
            name: name.into(),
            ..Mount::new(MountType::Named, target)
        }
    }

    /// The id when one is declared, otherwise `type|target|source|name`.
    pub fn dedup_key(&self) -> String {
        if !self.id.is_empty() {
            return self.id.clone();
        }
        format!(
            "{}|{}|{}|{}",
            self.mount_type, self.target, self.source, self.name
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.target.is_empty() {
            return Err(format!("{} mount requires a target", self.mount_type));
        }
        match self.mount_type {
            MountType::Bind if self.source.is_empty() => {
                Err(format!("bind mount on {} requires a source", self.target))
            }
            MountType::Named if self.name.is_empty() => {
                Err(format!("named mount on {} requires a volume name", self.target))
            }
            // The name becomes a single directory below the volumes dir.
            MountType::Named
                if self.name.contains('/')
                    || self.name.contains('\0')
                    || self.name == "."
                    || self.name == ".." =>
            {
                Err(format!(
                    "named mount on {}: invalid volume name {:?}",
                    self.target, self.name
                ))
            }
            _ => Ok(()),
        }
    }
}
