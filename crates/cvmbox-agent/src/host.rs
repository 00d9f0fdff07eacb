//! Host filesystem and mount table abstractions
//!
//! Every component that touches the host goes through [`Filesystem`] and
//! [`Mounter`], so the pipeline can run against [`MemFilesystem`] and
//! [`MockMounter`] in tests.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Kind of filesystem entry, as seen by `lstat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    CharDevice,
    Other,
}

/// Subset of `lstat` results the agent cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    /// Permission bits (without file type)
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Device number for device nodes
    pub rdev: u64,
}

/// Filesystem operations used by the agent
pub trait Filesystem: Send + Sync {
    /// Stat without following a trailing symlink
    fn stat(&self, path: &Path) -> io::Result<FileStat>;
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;
    /// Create a character device node
    fn mknod_char(&self, path: &Path, major: u64, minor: u64, mode: u32) -> io::Result<()>;
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
    /// Direct children of a directory
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    fn exists(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }

    /// Every entry below `root`, depth first. Symlinked directories are listed but not entered.
    fn walk(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut children = self.read_dir(&dir)?;
            children.sort();
            for child in children {
                if let Ok(stat) = self.stat(&child) {
                    if stat.kind == FileKind::Dir {
                        pending.push(child.clone());
                    }
                }
                found.push(child);
            }
        }
        Ok(found)
    }
}

/// [`Filesystem`] backed by the real host
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFilesystem;

impl Filesystem for OsFilesystem {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = std::fs::symlink_metadata(path)?;
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Dir
        } else if file_type.is_file() {
            FileKind::File
        } else if std::os::unix::fs::FileTypeExt::is_char_device(&file_type) {
            FileKind::CharDevice
        } else {
            FileKind::Other
        };
        Ok(FileStat {
            kind,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
        })
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(io::Error::from)
    }

    fn mknod_char(&self, path: &Path, major: u64, minor: u64, mode: u32) -> io::Result<()> {
        use nix::sys::stat::{makedev, mknod, Mode, SFlag};
        mknod(
            path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(mode),
            makedev(major, minor),
        )
        .map_err(io::Error::from)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }
}

#[derive(Debug, Clone)]
enum MemNode {
    File(Vec<u8>),
    Dir,
    Symlink(PathBuf),
    CharDevice { major: u64, minor: u64 },
}

#[derive(Debug, Clone)]
struct MemEntry {
    node: MemNode,
    mode: u32,
    uid: u32,
    gid: u32,
}

/// In-memory [`Filesystem`] for tests and dry runs
#[derive(Debug, Default)]
pub struct MemFilesystem {
    entries: Mutex<BTreeMap<PathBuf, MemEntry>>,
}

impl MemFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, path: &Path, node: MemNode, mode: u32) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for ancestor in path.ancestors().skip(1) {
            entries.entry(ancestor.to_path_buf()).or_insert(MemEntry {
                node: MemNode::Dir,
                mode: 0o755,
                uid: 0,
                gid: 0,
            });
        }
        entries.insert(
            path.to_path_buf(),
            MemEntry {
                node,
                mode,
                uid: 0,
                gid: 0,
            },
        );
    }

    pub fn add_file(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) {
        self.insert(
            path.as_ref(),
            MemNode::File(contents.as_ref().to_vec()),
            0o644,
        );
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        self.insert(path.as_ref(), MemNode::Dir, 0o755);
    }

    pub fn add_symlink(&self, path: impl AsRef<Path>, target: impl Into<PathBuf>) {
        self.insert(path.as_ref(), MemNode::Symlink(target.into()), 0o777);
    }

    pub fn add_char_device(&self, path: impl AsRef<Path>, major: u64, minor: u64) {
        self.insert(path.as_ref(), MemNode::CharDevice { major, minor }, 0o666);
    }

    /// Owner of an entry, if it exists
    pub fn owner(&self, path: impl AsRef<Path>) -> Option<(u32, u32)> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(path.as_ref()).map(|e| (e.uid, e.gid))
    }

    /// Permission bits of an entry, if it exists
    pub fn mode(&self, path: impl AsRef<Path>) -> Option<u32> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(path.as_ref()).map(|e| e.mode)
    }

    /// Contents of a regular file, if it exists
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(path.as_ref()).map(|e| &e.node) {
            Some(MemNode::File(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    fn with_entry<T>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut MemEntry) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(path) {
            Some(entry) => f(entry),
            None => Err(not_found(path)),
        }
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file or directory", path.display()),
    )
}

impl Filesystem for MemFilesystem {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        self.with_entry(path, |entry| {
            let (kind, rdev) = match &entry.node {
                MemNode::File(_) => (FileKind::File, 0),
                MemNode::Dir => (FileKind::Dir, 0),
                MemNode::Symlink(_) => (FileKind::Symlink, 0),
                MemNode::CharDevice { major, minor } => (
                    FileKind::CharDevice,
                    nix::sys::stat::makedev(*major, *minor),
                ),
            };
            Ok(FileStat {
                kind,
                mode: entry.mode,
                uid: entry.uid,
                gid: entry.gid,
                rdev,
            })
        })
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.with_entry(path, |entry| match &entry.node {
            MemNode::File(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: not a regular file", path.display()),
            )),
        })
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let exists = self.with_entry(path, |entry| {
            entry.node = MemNode::File(contents.to_vec());
            Ok(())
        });
        if exists.is_err() {
            self.add_file(path, contents);
        }
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        if !self.exists(path) {
            self.add_dir(path);
        }
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.with_entry(path, |entry| {
            entry.mode = mode;
            Ok(())
        })
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        self.with_entry(path, |entry| {
            entry.uid = uid;
            entry.gid = gid;
            Ok(())
        })
    }

    fn mknod_char(&self, path: &Path, major: u64, minor: u64, mode: u32) -> io::Result<()> {
        if self.exists(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{}: file exists", path.display()),
            ));
        }
        self.insert(path, MemNode::CharDevice { major, minor }, mode);
        Ok(())
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.with_entry(path, |entry| match &entry.node {
            MemNode::Symlink(target) => Ok(target.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: not a symlink", path.display()),
            )),
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(path).map(|e| &e.node) {
            Some(MemNode::Dir) => Ok(entries
                .keys()
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: not a directory", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }
}

/// One entry of the host mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Where it is mounted
    pub path: PathBuf,
    /// Mount source (device or filesystem name)
    pub source: String,
    pub fstype: String,
    pub options: Vec<String>,
}

impl MountPoint {
    pub fn new(path: impl Into<PathBuf>, fstype: impl Into<String>) -> Self {
        let fstype = fstype.into();
        Self {
            path: path.into(),
            source: fstype.clone(),
            fstype,
            options: vec!["rw".to_string()],
        }
    }
}

/// Mount table manipulation
pub trait Mounter: Send + Sync {
    fn list(&self) -> io::Result<Vec<MountPoint>>;
    /// Mount `source` at `target`. Options use mount(8) names (`remount`, `bind`, `ro`, `rw`, ...).
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[&str]) -> io::Result<()>;
    fn unmount(&self, target: &Path) -> io::Result<()>;
}

/// [`Mounter`] backed by `/proc/self/mountinfo` and mount(2)
#[derive(Debug, Clone)]
pub struct OsMounter {
    mountinfo: PathBuf,
}

impl Default for OsMounter {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
        }
    }
}

impl Mounter for OsMounter {
    fn list(&self) -> io::Result<Vec<MountPoint>> {
        let raw = std::fs::read_to_string(&self.mountinfo)?;
        Ok(parse_mountinfo(&raw))
    }

    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[&str]) -> io::Result<()> {
        use nix::mount::MsFlags;

        let mut flags = MsFlags::empty();
        let mut data = Vec::new();
        for option in options.iter().flat_map(|o| o.split(',')) {
            match option {
                "remount" => flags |= MsFlags::MS_REMOUNT,
                "bind" => flags |= MsFlags::MS_BIND,
                "ro" => flags |= MsFlags::MS_RDONLY,
                "rw" => {}
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                "" => {}
                other => data.push(other),
            }
        }
        let data = data.join(",");

        nix::mount::mount(
            (!source.is_empty()).then_some(source),
            target,
            (!fstype.is_empty()).then_some(fstype),
            flags,
            (!data.is_empty()).then_some(data.as_str()),
        )
        .map_err(io::Error::from)
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        nix::mount::umount2(target, nix::mount::MntFlags::empty()).map_err(io::Error::from)
    }
}

/// Parse `/proc/<pid>/mountinfo`
pub fn parse_mountinfo(raw: &str) -> Vec<MountPoint> {
    raw.lines()
        .filter_map(|line| {
            let (left, right) = line.split_once(" - ")?;
            let left: Vec<&str> = left.split_whitespace().collect();
            let right: Vec<&str> = right.split_whitespace().collect();
            if left.len() < 6 || right.len() < 2 {
                return None;
            }
            Some(MountPoint {
                path: PathBuf::from(unescape_mount_path(left[4])),
                source: right[1].to_string(),
                fstype: right[0].to_string(),
                options: left[5].split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Decode the octal escapes (`\040` etc.) the kernel uses in mount paths
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A recorded [`MockMounter`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount {
        source: String,
        target: PathBuf,
        fstype: String,
        options: Vec<String>,
    },
    Unmount(PathBuf),
}

/// In-memory [`Mounter`] that records calls
#[derive(Debug, Default)]
pub struct MockMounter {
    mounts: Mutex<Vec<MountPoint>>,
    calls: Mutex<Vec<MountCall>>,
}

impl MockMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mounts(mounts: Vec<MountPoint>) -> Self {
        Self {
            mounts: Mutex::new(mounts),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Mounter for MockMounter {
    fn list(&self) -> io::Result<Vec<MountPoint>> {
        Ok(self.mounts.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[&str]) -> io::Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MountCall::Mount {
                source: source.to_string(),
                target: target.to_path_buf(),
                fstype: fstype.to_string(),
                options: options.iter().map(|o| o.to_string()).collect(),
            });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MountCall::Unmount(target.to_path_buf()));
        self.mounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|m| m.path != target);
        Ok(())
    }
}
