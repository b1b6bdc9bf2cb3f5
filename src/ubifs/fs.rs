//! Path-level access to a UBIFS volume: stat, directory listings, file contents.

use std::collections::HashSet;

use super::index::IndexTree;
use super::key::{Key, KeyHash, KeyKind};
use super::master::{self, ResolvedMaster, SUPERBLOCK_LNUM};
use super::node::{decode_at, Branch, DirEntry, FileType, Inode, Node, NodeBody, NodeType};
use super::{Location, BLOCK_SIZE, ROOT_INUM};
use crate::config::Config;
use crate::error::{Error, Result, Warning};
use crate::image::ImageSource;
use crate::trace::Trace;
use crate::ubi::Volume;

/// A directory entry found by [Ubifs::walk], with its path relative to the starting directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryPath {
    pub path: String,
    pub entry: DirEntry,
}

/// A mounted (read-only) view of the UBIFS filesystem in one volume.
///
/// Every operation takes the [Trace] it should charge its reads and report its warnings to;
/// [Ubifs::trace] makes one configured like the filesystem.
#[derive(Debug)]
pub struct Ubifs<'a, S> {
    volume: Volume<'a, S>,
    master: ResolvedMaster,
    config: Config,
    warnings: Vec<Warning>,
}

impl<'a, S: ImageSource> Ubifs<'a, S> {
    /// Read the superblock and master node of `volume`.
    pub fn open(volume: Volume<'a, S>, config: &Config) -> Result<Self> {
        let mut trace = Trace::from_config(config);
        let master = master::resolve(&volume, config, &mut trace)?;

        if let Ok(leb) = volume.resolve(SUPERBLOCK_LNUM) {
            if leb.capacity != master.superblock.leb_size {
                trace.warn(
                    Warning::new("superblock LEB size differs from the UBI volume")
                        .mismatch(master.superblock.leb_size.into(), leb.capacity.into()),
                );
            }
        }

        Ok(Self {
            volume,
            master,
            config: config.clone(),
            warnings: trace.take_warnings(),
        })
    }

    /// A fresh trace with the strictness and node budget of this filesystem's configuration
    pub fn trace(&self) -> Trace {
        Trace::from_config(&self.config)
    }

    /// Problems found while opening the filesystem
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn volume(&self) -> Volume<'a, S> {
        self.volume
    }

    pub fn master(&self) -> &ResolvedMaster {
        &self.master
    }

    pub fn key_hash(&self) -> KeyHash {
        self.master.key_hash
    }

    pub fn index(&self) -> IndexTree<'a, S> {
        IndexTree::new(self.volume, self.master.root, self.master.root_len)
    }

    /// Decode whatever node is at `loc`, wherever it is in the volume
    pub fn read_node(&self, loc: Location, trace: &mut Trace) -> Result<Node> {
        trace.visit()?;
        decode_at(&self.volume, loc)
    }

    pub fn inode(&self, inum: u32, trace: &mut Trace) -> Result<Inode> {
        let tree = self.index();
        let branch = tree
            .lookup(Key::inode(inum), trace)
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(format!("inode {inum}")),
                e => e,
            })?;

        let node = tree.read_leaf(&branch, trace)?;
        match node.body {
            NodeBody::Inode(inode) => Ok(inode),
            _ => Err(Error::structural(branch.loc, "inode key on a non-inode node")),
        }
    }

    /// Find the entry called `name` in directory `dir`.
    ///
    /// All entries sharing the name's hash are read, and the one whose stored name matches
    /// exactly wins. Damaged candidates are skipped with a warning.
    pub fn lookup_name(&self, dir: u32, name: &[u8], trace: &mut Trace) -> Result<Option<DirEntry>> {
        let tree = self.index();
        let key = Key::dir_entry(dir, self.key_hash().hash(name));

        let candidates = tree.lookup_all(key, trace)?;
        if candidates.len() > 1 {
            log::debug!("{} entries share key {key}", candidates.len());
        }

        for branch in candidates {
            match self.read_dent(&tree, &branch, trace) {
                Ok(dent) if dent.name == name => return Ok(Some(dent)),
                Ok(_) => (),
                Err(e) => trace.tolerate(e)?,
            }
        }
        Ok(None)
    }

    fn read_dent(&self, tree: &IndexTree<'a, S>, branch: &Branch, trace: &mut Trace) -> Result<DirEntry> {
        let node = tree.read_leaf(branch, trace)?;
        match node.body {
            NodeBody::DirEntry(dent) | NodeBody::XattrEntry(dent) => Ok(dent),
            _ => Err(Error::structural(branch.loc, "entry key on a non-entry node")),
        }
    }

    fn entry_inum(dent: &DirEntry, loc: Location) -> Result<u32> {
        u32::try_from(dent.inum).map_err(|_| Error::CorruptPayload {
            loc,
            detail: format!("entry target inode {} out of range", dent.inum),
        })
    }

    /// Resolve a `/`-separated path from the root directory. Empty components and `.` are
    /// ignored; symbolic links are not followed.
    pub fn stat(&self, path: &str, trace: &mut Trace) -> Result<Inode> {
        let mut stack = vec![self.inode(ROOT_INUM, trace)?];
        let mut walked = String::new();

        for component in path.split('/') {
            match component {
                "" | "." => continue,
                ".." => {
                    if stack.len() > 1 {
                        stack.pop();
                    }
                    continue;
                }
                _ => (),
            }

            let Some(current) = stack.last() else {
                break;
            };
            if !current.is_dir() {
                return Err(Error::NotADirectory(walked));
            }
            walked.push('/');
            walked.push_str(component);

            let dent = self
                .lookup_name(current.inum(), component.as_bytes(), trace)?
                .ok_or_else(|| Error::NotFound(walked.clone()))?;
            let inum = Self::entry_inum(&dent, Location::default())?;
            stack.push(self.inode(inum, trace)?);
        }

        stack
            .pop()
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn entries_of(&self, dir: u32, kind: KeyKind, trace: &mut Trace) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut it = self.index().entries(dir, kind, trace);
        while let Some(branch) = it.next() {
            let branch = branch?;
            let tree = it.tree();
            match self.read_dent(&tree, &branch, it.trace()) {
                Ok(dent) => entries.push(dent),
                Err(e) => it.trace().tolerate(e)?,
            }
        }
        Ok(entries)
    }

    /// The entries of directory `dir`, in key (hash) order
    pub fn list_dir(&self, dir: u32, trace: &mut Trace) -> Result<Vec<DirEntry>> {
        self.entries_of(dir, KeyKind::DirEntry, trace)
    }

    pub fn list(&self, path: &str, trace: &mut Trace) -> Result<Vec<DirEntry>> {
        let inode = self.stat(path, trace)?;
        if !inode.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        self.list_dir(inode.inum(), trace)
    }

    /// Extended attributes of an inode as `(name, value)` pairs
    pub fn xattrs(&self, inum: u32, trace: &mut Trace) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut attrs = Vec::new();
        for xent in self.entries_of(inum, KeyKind::XattrEntry, trace)? {
            let target = Self::entry_inum(&xent, Location::default())?;
            match self.inode(target, trace) {
                Ok(value) => attrs.push((xent.name, value.data)),
                Err(e) => trace.tolerate(e)?,
            }
        }
        Ok(attrs)
    }

    /// Assemble the contents of a file from its data nodes.
    ///
    /// Each block lands at `block * 4096`; missing blocks read as zeros. The result is exactly
    /// `inode.size` bytes long; data past the size is dropped and a file with too little data is
    /// zero-extended, with a warning in both cases.
    pub fn read_inode(&self, inode: &Inode, trace: &mut Trace) -> Result<Vec<u8>> {
        let size = usize::try_from(inode.size).map_err(|_| Error::CorruptPayload {
            loc: Location::default(),
            detail: format!("inode {} size {} too large", inode.inum(), inode.size),
        })?;

        let mut out = Vec::new();
        let mut it = self.index().entries(inode.inum(), KeyKind::Data, trace);
        while let Some(branch) = it.next() {
            let branch = branch?;
            let tree = it.tree();

            let block = match tree.read_leaf(&branch, it.trace()) {
                Ok(Node {
                    body: NodeBody::Data(block),
                    ..
                }) => block,
                Ok(_) => {
                    it.trace()
                        .tolerate(Error::structural(branch.loc, "data key on a non-data node"))?;
                    continue;
                }
                Err(e) => {
                    it.trace().tolerate(e)?;
                    continue;
                }
            };

            let mut contents = match block.contents() {
                Ok(x) => x,
                Err(e) => {
                    it.trace().tolerate(e)?;
                    continue;
                }
            };

            if contents.len() as u64 > BLOCK_SIZE {
                it.trace().warn(
                    Warning::new("data block larger than the block size")
                        .at(branch.loc)
                        .node_type(NodeType::Data)
                        .mismatch(BLOCK_SIZE, contents.len() as u64),
                );
                contents.truncate(BLOCK_SIZE as usize);
            }

            let start = u64::from(block.block()) * BLOCK_SIZE;
            if start >= inode.size {
                it.trace().warn(
                    Warning::new(format!(
                        "block {} lies beyond the end of inode {}",
                        block.block(),
                        inode.inum()
                    ))
                    .at(branch.loc)
                    .node_type(NodeType::Data)
                    .mismatch(inode.size, start + contents.len() as u64),
                );
                continue;
            }

            let start = start as usize;
            let end = (start + contents.len()).min(size);
            if out.len() < end {
                out.resize(end, 0);
            }
            out[start..end].copy_from_slice(&contents[..end - start]);
        }

        if out.len() < size {
            warn_short(trace, inode, out.len());
            out.resize(size, 0);
        }
        Ok(out)
    }

    /// The contents of the file at `path`; for a symbolic link, its target
    pub fn read(&self, path: &str, trace: &mut Trace) -> Result<Vec<u8>> {
        let inode = self.stat(path, trace)?;
        match inode.file_type() {
            Some(FileType::Directory) => Err(Error::IsADirectory(path.to_string())),
            Some(FileType::Symlink) => Ok(inode.data),
            _ => self.read_inode(&inode, trace),
        }
    }

    pub fn readlink(&self, path: &str, trace: &mut Trace) -> Result<Vec<u8>> {
        let inode = self.stat(path, trace)?;
        match inode.symlink() {
            Some(target) => Ok(target.to_vec()),
            None => Err(Error::NotASymlink(path.to_string())),
        }
    }

    /// Every entry below the directory at `path`, depth first, parents before children.
    ///
    /// A directory reachable more than once (which a sane filesystem never allows) is only
    /// descended into the first time.
    pub fn walk(&self, path: &str, trace: &mut Trace) -> Result<Vec<DirEntryPath>> {
        let top = self.stat(path, trace)?;
        if !top.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }

        let mut seen = HashSet::from([top.inum()]);
        let mut found = Vec::new();
        let mut pending = Vec::new();
        push_entries(&mut pending, "", self.list_dir(top.inum(), trace)?);

        while let Some((path, entry)) = pending.pop() {
            if entry.file_type == FileType::Directory {
                match u32::try_from(entry.inum) {
                    Ok(inum) if seen.insert(inum) => {
                        let children = self.list_dir(inum, trace)?;
                        push_entries(&mut pending, &path, children);
                    }
                    Ok(inum) => trace.warn(Warning::new(format!(
                        "{path}: directory inode {inum} already visited"
                    ))),
                    Err(_) => (),
                }
            }
            found.push(DirEntryPath { path, entry });
        }

        Ok(found)
    }
}

/// Queue `entries` so that popping yields them in listing order
fn push_entries(pending: &mut Vec<(String, DirEntry)>, prefix: &str, entries: Vec<DirEntry>) {
    for entry in entries.into_iter().rev() {
        let path = if prefix.is_empty() {
            entry.name_lossy().into_owned()
        } else {
            format!("{prefix}/{}", entry.name_lossy())
        };
        pending.push((path, entry));
    }
}

fn warn_short(trace: &mut Trace, inode: &Inode, have: usize) {
    trace.warn(
        Warning::new(format!(
            "inode {} has data for {have} bytes, zero-extending to its size",
            inode.inum()
        ))
        .node_type(NodeType::Inode)
        .mismatch(inode.size, have as u64),
    );
}
