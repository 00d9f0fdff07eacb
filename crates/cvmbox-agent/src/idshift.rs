//! User-namespace ownership shifting for mounts and device nodes
//!
//! The inner container runs in a user namespace whose root maps to host uid
//! `offset`. Host paths handed to it must be owned by the shifted ids or they
//! show up as `nobody` inside.

use crate::config::{Device, Mount};
use crate::error::{AgentError, Result};
use crate::host::{FileKind, Filesystem, Mounter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Mode applied to every shifted mount source
pub const SHIFTED_MODE: u32 = 0o2755;

/// Owner a mount source should have inside a namespace shifted by `offset`
///
/// `/root` itself and anything under `/home/<user>` belong to the probed user,
/// everything else to the namespace root.
pub fn shifted_owner(source: &Path, uid: u32, gid: u32, offset: u32) -> Result<(u32, u32)> {
    let is_root_home = source == Path::new("/root");
    let is_user_home = source.starts_with("/home") && source.components().count() > 2;
    if !(is_root_home || is_user_home) {
        return Ok((offset, offset));
    }
    match (uid.checked_add(offset), gid.checked_add(offset)) {
        (Some(uid), Some(gid)) => Ok((uid, gid)),
        _ => Err(AgentError::Metadata(format!(
            "ids {uid}:{gid} do not fit a namespace shifted by {offset}"
        ))),
    }
}

/// Applies ownership shifting to host paths
pub struct NamespaceShifter {
    fs: Arc<dyn Filesystem>,
    mounter: Arc<dyn Mounter>,
    offset: u32,
    private_dirs: Vec<PathBuf>,
}

impl NamespaceShifter {
    pub fn new(
        fs: Arc<dyn Filesystem>,
        mounter: Arc<dyn Mounter>,
        offset: u32,
        private_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            fs,
            mounter,
            offset,
            private_dirs,
        }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Whether a mount source is owned by the container runtime and must be left alone
    pub fn is_private(&self, source: &Path) -> bool {
        self.private_dirs.iter().any(|dir| source.starts_with(dir))
    }

    /// Shift every non-private mount source for a container running as `(uid, gid)`
    pub fn shift_mounts(&self, mounts: &[Mount], uid: u32, gid: u32) -> Result<()> {
        for mount in mounts {
            if self.is_private(&mount.source) {
                tracing::debug!(source = %mount.source.display(), "skipping private mount");
                continue;
            }
            self.shift_mount(mount, uid, gid)?;
        }
        Ok(())
    }

    fn shift_mount(&self, mount: &Mount, uid: u32, gid: u32) -> Result<()> {
        let source = &mount.source;

        if mount.read_only {
            self.mounter
                .mount("", source, "", &["remount", "rw"])
                .map_err(|e| AgentError::io(source, e))?;
        }

        self.fs
            .chmod(source, SHIFTED_MODE)
            .map_err(|e| AgentError::io(source, e))?;

        let (owner_uid, owner_gid) = shifted_owner(source, uid, gid, self.offset)?;
        self.fs
            .chown(source, owner_uid, owner_gid)
            .map_err(|e| AgentError::io(source, e))?;

        tracing::info!(
            source = %source.display(),
            uid = owner_uid,
            gid = owner_gid,
            remounted = mount.read_only,
            "shifted mount"
        );
        Ok(())
    }

    /// Chown a device node to the namespace root
    pub fn shift_device(&self, path: &Path) -> Result<()> {
        self.fs
            .chown(path, self.offset, self.offset)
            .map_err(|e| AgentError::io(path, e))
    }

    /// Create a device node at its fixed host path if missing, then shift it
    pub fn provision_device(&self, device: &Device) -> Result<()> {
        let path = &device.host_path;
        match self.fs.stat(path) {
            Ok(stat) if stat.kind == FileKind::CharDevice => {
                tracing::debug!(path = %path.display(), "device node already exists");
            }
            Ok(stat) => {
                return Err(AgentError::Internal(format!(
                    "{} exists but is a {:?}, not a character device",
                    path.display(),
                    stat.kind
                )));
            }
            Err(_) => {
                if let Some(parent) = path.parent() {
                    self.fs
                        .create_dir_all(parent)
                        .map_err(|e| AgentError::io(parent, e))?;
                }
                self.fs
                    .mknod_char(path, device.major, device.minor, 0o666)
                    .map_err(|e| AgentError::io(path, e))?;
                tracing::info!(
                    path = %path.display(),
                    major = device.major,
                    minor = device.minor,
                    "created device node"
                );
            }
        }
        self.shift_device(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemFilesystem, MockMounter, MountCall};

    const OFFSET: u32 = 100_000;

    fn shifter(fs: Arc<MemFilesystem>, mounter: Arc<MockMounter>) -> NamespaceShifter {
        NamespaceShifter::new(
            fs,
            mounter,
            OFFSET,
            vec![PathBuf::from("/var/lib/sysbox"), PathBuf::from("/var/lib/cvmbox")],
        )
    }

    #[test]
    fn test_shifted_owner() {
        let owner = |path: &str, uid, gid| shifted_owner(Path::new(path), uid, gid, OFFSET).unwrap();

        assert_eq!(owner("/root", 0, 0), (100_000, 100_000));
        assert_eq!(owner("/home/coder", 1000, 1000), (101_000, 101_000));
        assert_eq!(owner("/home/coder/projects", 1000, 1001), (101_000, 101_001));
        assert_eq!(owner("/home", 1000, 1000), (OFFSET, OFFSET));
        assert_eq!(owner("/var/data", 1000, 1000), (OFFSET, OFFSET));
        assert_eq!(owner("/rootfs", 1000, 1000), (OFFSET, OFFSET));
    }

    #[test]
    fn test_paths_below_root_belong_to_namespace_root() {
        assert_eq!(
            shifted_owner(Path::new("/root/projects"), 1000, 1000, OFFSET).unwrap(),
            (OFFSET, OFFSET)
        );
    }

    #[test]
    fn test_shifted_owner_overflow_is_metadata_error() {
        let err = shifted_owner(Path::new("/root"), u32::MAX - 10, 0, OFFSET).unwrap_err();
        assert!(matches!(err, AgentError::Metadata(_)));

        // Non-home paths never add the probed ids
        assert_eq!(
            shifted_owner(Path::new("/data"), u32::MAX, u32::MAX, OFFSET).unwrap(),
            (OFFSET, OFFSET)
        );
    }

    #[test]
    fn test_shift_mounts_propagates_overflow() {
        let fs = Arc::new(MemFilesystem::new());
        fs.add_dir("/home/coder");
        let err = shifter(fs, Arc::new(MockMounter::new()))
            .shift_mounts(&[Mount::new("/home/coder", "/home/coder")], u32::MAX, 0)
            .unwrap_err();
        assert!(matches!(err, AgentError::Metadata(_)));
    }

    #[test]
    fn test_shift_mounts_skips_private_and_remounts_read_only() {
        let fs = Arc::new(MemFilesystem::new());
        fs.add_dir("/home/coder");
        fs.add_dir("/data");
        fs.add_dir("/var/lib/cvmbox/docker");
        let mounter = Arc::new(MockMounter::new());

        let mounts = vec![
            Mount::new("/home/coder", "/home/coder"),
            Mount::new("/data", "/mnt/data").read_only(),
            Mount::new("/var/lib/cvmbox/docker", "/var/lib/docker"),
        ];
        shifter(fs.clone(), mounter.clone())
            .shift_mounts(&mounts, 1000, 1000)
            .unwrap();

        assert_eq!(fs.owner("/home/coder"), Some((101_000, 101_000)));
        assert_eq!(fs.mode("/home/coder"), Some(SHIFTED_MODE));
        assert_eq!(fs.owner("/data"), Some((OFFSET, OFFSET)));
        assert_eq!(fs.owner("/var/lib/cvmbox/docker"), Some((0, 0)));
        assert_eq!(fs.mode("/var/lib/cvmbox/docker"), Some(0o755));

        assert_eq!(
            mounter.calls(),
            vec![MountCall::Mount {
                source: String::new(),
                target: PathBuf::from("/data"),
                fstype: String::new(),
                options: vec!["remount".to_string(), "rw".to_string()],
            }]
        );
    }

    #[test]
    fn test_shift_mounts_missing_source_fails() {
        let fs = Arc::new(MemFilesystem::new());
        let err = shifter(fs, Arc::new(MockMounter::new()))
            .shift_mounts(&[Mount::new("/nope", "/nope")], 0, 0)
            .unwrap_err();
        assert!(matches!(err, AgentError::Io { .. }));
    }

    #[test]
    fn test_provision_device_is_idempotent() {
        let fs = Arc::new(MemFilesystem::new());
        let shifter = shifter(fs.clone(), Arc::new(MockMounter::new()));

        shifter.provision_device(&Device::tun()).unwrap();
        shifter.provision_device(&Device::tun()).unwrap();

        let path = Device::tun().host_path;
        assert_eq!(fs.owner(&path), Some((OFFSET, OFFSET)));
        assert_eq!(
            fs.stat(&path).unwrap().kind,
            FileKind::CharDevice
        );
    }
}
