//! `fuser::Filesystem` implementation on top of [`BucketFs`].
//!
//! Requests arrive on the fuser session thread and are answered by blocking
//! on the engine's async calls through a tokio runtime handle. Everything
//! except read-through misses and fsync completes from local state.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::path;
use common::{BucketFs, EntryKind, FsError, NamespaceEntry, SetAttr};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use tokio::runtime::Handle;
use tracing::{debug, info, trace};

use super::inode_table::InodeTable;

/// How long the kernel may cache attributes and entries.
const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;
/// Reported free inodes; the namespace has no fixed limit.
const FREE_FILES: u64 = 1 << 32;

// Linux renameat2 flags.
const RENAME_NOREPLACE: u32 = 1;
const RENAME_EXCHANGE: u32 = 2;

pub struct KernelBridge {
    fs: Arc<BucketFs>,
    runtime: Handle,
    inodes: InodeTable,
    destroyed: flume::Sender<()>,
}

impl KernelBridge {
    pub fn new(fs: Arc<BucketFs>, runtime: Handle, destroyed: flume::Sender<()>) -> Self {
        Self {
            fs,
            runtime,
            inodes: InodeTable::new(),
            destroyed,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, FsError> {
        self.inodes
            .get_path(ino)
            .map(str::to_string)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    /// Current entry behind `ino`. Fails if the path now holds a different
    /// entry (replaced or removed remotely).
    fn resolve(&self, ino: u64) -> Result<NamespaceEntry, FsError> {
        let path = self.path_of(ino)?;
        let entry = self.fs.getattr(&path)?;
        if ino != InodeTable::ROOT_INODE && entry.id != ino {
            return Err(FsError::NotFound(path));
        }
        Ok(entry)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, FsError> {
        let parent = self.path_of(parent)?;
        let name = name
            .to_str()
            .ok_or_else(|| FsError::InvalidPath(name.to_string_lossy().into_owned()))?;
        path::join(&parent, name)
    }

    fn file_attr(&mut self, entry: &NamespaceEntry) -> FileAttr {
        self.inodes.remember(entry.id, &entry.path);
        let attr = &entry.attr;
        let (kind, nlink) = match entry.kind {
            EntryKind::Directory => (FileType::Directory, 2),
            EntryKind::File => (FileType::RegularFile, 1),
        };
        FileAttr {
            ino: entry.id,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.ctime,
            kind,
            perm: (attr.mode & 0o7777) as u16,
            nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn reply_entry(&mut self, result: Result<NamespaceEntry, FsError>, reply: ReplyEntry) {
        match result {
            Ok(entry) => {
                let attr = self.file_attr(&entry);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }
}

fn errno(err: &FsError) -> c_int {
    match err {
        FsError::NotFound(_) => trace!(error = %err, "request failed"),
        _ => debug!(error = %err, "request failed"),
    }
    err.errno()
}

fn to_system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn creation_mode(mode: u32, umask: u32) -> u32 {
    mode & !umask & 0o7777
}

impl Filesystem for KernelBridge {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(bucket = %self.fs.config().bucket, "kernel session started");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("kernel session ended");
        let _ = self.destroyed.send(());
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.fs.getattr(&path));
        self.reply_entry(result, reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        self.inodes.forget(ino);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let result = match fh {
            Some(fh) => self
                .fs
                .handle_path(fh)
                .and_then(|path| self.fs.getattr(&path)),
            None => self.resolve(ino),
        };
        match result {
            Ok(entry) => {
                let attr = self.file_attr(&entry);
                reply.attr(&TTL, &attr);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            size,
            mode,
            uid,
            gid,
            atime: atime.map(to_system_time),
            mtime: mtime.map(to_system_time),
        };
        let path = match fh {
            Some(fh) => self.fs.handle_path(fh),
            None => self.path_of(ino),
        };
        let result = path.and_then(|path| self.runtime.block_on(self.fs.setattr(&path, changes)));
        match result {
            Ok(entry) => {
                let attr = self.file_attr(&entry);
                reply.attr(&TTL, &attr);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.fs.mkdir(&path, Some(creation_mode(mode, umask))));
        self.reply_entry(result, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.fs.unlink(&path)?;
            self.inodes.remove_tree(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.fs.rmdir(&path)?;
            self.inodes.remove_tree(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags & RENAME_EXCHANGE != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let paths = self
            .child_path(parent, name)
            .and_then(|from| Ok((from, self.child_path(newparent, newname)?)));
        let result = paths.and_then(|(from, to)| {
            if flags & RENAME_NOREPLACE != 0 && self.fs.getattr(&to).is_ok() {
                return Err(FsError::AlreadyExists(to));
            }
            self.fs.rename(&from, &to)?;
            self.inodes.rename(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let truncate = flags & libc::O_TRUNC != 0;
        let result = self
            .path_of(ino)
            .and_then(|path| self.runtime.block_on(self.fs.open(&path, truncate)));
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.fs.handle_path(fh).and_then(|path| {
            self.runtime
                .block_on(self.fs.read(&path, offset, size as usize))
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let result = self
            .fs
            .handle_path(fh)
            .and_then(|path| self.runtime.block_on(self.fs.write(&path, offset, data)));
        match result {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(errno(&err)),
        }
    }

    /// Called on every close. Uploads stay on their debounce timer; only
    /// fsync forces them out.
    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.handle_path(fh) {
            Ok(_) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let result = self
            .fs
            .handle_path(fh)
            .and_then(|path| self.runtime.block_on(self.fs.fsync(&path)));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.resolve(ino) {
            Ok(entry) if entry.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir = match self.path_of(ino) {
            Ok(dir) => dir,
            Err(err) => return reply.error(errno(&err)),
        };
        let children = match self.fs.readdir(&dir) {
            Ok(children) => children,
            Err(err) => return reply.error(errno(&err)),
        };
        let parent_ino = self
            .fs
            .getattr(path::parent(&dir))
            .map(|entry| entry.id)
            .unwrap_or(InodeTable::ROOT_INODE);

        let mut listing = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            if let Ok(child_path) = path::join(&dir, &child.name) {
                self.inodes.remember(child.id, &child_path);
            }
            let kind = match child.kind {
                EntryKind::Directory => FileType::Directory,
                EntryKind::File => FileType::RegularFile,
            };
            listing.push((child.id, kind, child.name));
        }

        let skip = usize::try_from(offset).unwrap_or(0);
        for (index, (entry_ino, kind, name)) in listing.into_iter().enumerate().skip(skip) {
            // Offset of the next entry; a full buffer ends this batch.
            if reply.add(entry_ino, (index + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.fs.statfs();
        reply.statfs(
            stats.blocks,
            stats.blocks_free,
            stats.blocks_free,
            stats.files,
            FREE_FILES,
            stats.block_size,
            stats.name_max,
            stats.block_size,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self
            .path_of(ino)
            .and_then(|path| self.fs.setxattr(&path, &name.to_string_lossy(), value));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let result = self
            .path_of(ino)
            .and_then(|path| self.fs.getxattr(&path, &name.to_string_lossy()));
        match result {
            Ok(value) => reply_xattr(&value, size, reply),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self.path_of(ino).and_then(|path| self.fs.listxattr(&path));
        match result {
            Ok(names) => {
                let mut packed = Vec::new();
                for name in names {
                    packed.extend_from_slice(name.as_bytes());
                    packed.push(0);
                }
                reply_xattr(&packed, size, reply);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .path_of(ino)
            .and_then(|path| self.fs.removexattr(&path, &name.to_string_lossy()));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.child_path(parent, name).and_then(|path| {
            let entry = self.fs.create(&path, Some(creation_mode(mode, umask)))?;
            let fh = self.runtime.block_on(self.fs.open(&path, false))?;
            Ok((entry, fh))
        });
        match result {
            Ok((entry, fh)) => {
                let attr = self.file_attr(&entry);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }
}

/// Size query (`size == 0`) or the value itself.
fn reply_xattr(value: &[u8], size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if value.len() > size as usize {
        reply.error(libc::ERANGE);
    } else {
        reply.data(value);
    }
}
