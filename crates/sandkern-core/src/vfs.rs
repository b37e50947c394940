// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory virtual filesystem
//!
//! Entries live in an arena keyed by [`NodeId`]; directories keep an ordered
//! list of child ids. Kernel descriptors are kept in a separate table keyed by
//! [`HandleId`]. When both tables are needed the descriptor table is locked
//! first.
//!
//! Functional files never store bytes. A read installs a one-shot resolver on
//! the entry and suspends; the next write on that entry (or on a handle that
//! redirects to it) resolves the reader with its payload. A write that finds no
//! reader drops the bytes and reports 0.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use sandkern_proto::{
    AccessFlag, Attributes, ByteCount, EntryInfo, EntryType, OpenType, Operation, StatusFlag,
};
use serde::Serialize;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, trace};

use crate::error::{FsError, FsResult};

/// Kernel-level descriptor handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HandleId(pub u32);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct NodeId(u64);

const ROOT: NodeId = NodeId(0);

struct Node {
    name: String,
    attributes: Attributes,
    kind: NodeKind,
}

enum NodeKind {
    Directory {
        children: Vec<NodeId>,
    },
    File {
        data: Vec<u8>,
    },
    Functional {
        pending_read: Option<PendingRead>,
        /// Queues readers so at most one resolver is installed at a time
        reader_gate: Arc<AsyncMutex<()>>,
    },
}

/// Resolver of a suspended functional read and the handle it was issued on
struct PendingRead {
    owner: HandleId,
    resolver: oneshot::Sender<Vec<u8>>,
}

impl NodeKind {
    fn functional() -> Self {
        NodeKind::Functional {
            pending_read: None,
            reader_gate: Arc::new(AsyncMutex::new(())),
        }
    }

    fn entry_type(&self) -> EntryType {
        match self {
            NodeKind::Directory { .. } => EntryType::Directory,
            NodeKind::File { .. } => EntryType::File,
            NodeKind::Functional { .. } => EntryType::FunctionalFile,
        }
    }
}

struct NodeArena {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
}

impl NodeArena {
    fn new(root_attributes: Attributes) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT,
            Node {
                name: String::new(),
                attributes: root_attributes,
                kind: NodeKind::Directory {
                    children: Vec::new(),
                },
            },
        );
        Self { nodes, next_id: 1 }
    }

    fn node(&self, id: NodeId) -> FsResult<&Node> {
        self.nodes.get(&id).ok_or(FsError::NoSuchFileHandle)
    }

    fn node_mut(&mut self, id: NodeId) -> FsResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(FsError::NoSuchFileHandle)
    }

    fn insert(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    /// Create a node and append it to a directory's children
    fn insert_child(&mut self, parent: NodeId, node: Node) -> FsResult<NodeId> {
        if !matches!(self.node(parent)?.kind, NodeKind::Directory { .. }) {
            return Err(FsError::InvalidEntryType);
        }
        let id = self.insert(node);
        if let NodeKind::Directory { children } = &mut self.node_mut(parent)?.kind {
            children.push(id);
        }
        Ok(id)
    }

    fn child(&self, dir: NodeId, name: &str) -> FsResult<Option<NodeId>> {
        match &self.node(dir)?.kind {
            NodeKind::Directory { children } => Ok(children
                .iter()
                .copied()
                .find(|id| self.nodes.get(id).is_some_and(|n| n.name == name))),
            _ => Err(FsError::InvalidEntryType),
        }
    }

    fn resolve(&self, components: &[&str]) -> FsResult<NodeId> {
        let mut current = ROOT;
        for (index, name) in components.iter().enumerate() {
            match self.child(current, name)? {
                Some(id) => current = id,
                None if index + 1 == components.len() => return Err(FsError::NoSuchEntry),
                None => return Err(FsError::ParentDoesntExist),
            }
        }
        Ok(current)
    }

    /// Snapshot an entry, descending `depth` further directory levels
    fn info(&self, id: NodeId, depth: usize) -> FsResult<EntryInfo> {
        let node = self.node(id)?;
        let entries = match &node.kind {
            NodeKind::Directory { children } if depth > 0 => Some(
                children
                    .iter()
                    .map(|child| self.info(*child, depth - 1))
                    .collect::<FsResult<Vec<_>>>()?,
            ),
            _ => None,
        };
        Ok(EntryInfo {
            kind: node.kind.entry_type(),
            name: node.name.clone(),
            attributes: node.attributes,
            entries,
        })
    }
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

fn normalize(path: &str) -> String {
    format!("/{}", components(path).join("/"))
}

/// Options for [`Vfs::open`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub access: AccessFlag,
    pub status: StatusFlag,
    pub kind: OpenType,
    /// Skip the parent write check when creating an entry
    pub privileged: bool,
    pub duplicate_of: Option<HandleId>,
}

impl OpenOptions {
    pub fn new(access: AccessFlag, status: StatusFlag, kind: OpenType) -> Self {
        Self {
            access,
            status,
            kind,
            ..Self::default()
        }
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn duplicate_of(mut self, handle: HandleId) -> Self {
        self.duplicate_of = Some(handle);
        self
    }
}

/// Per-call modifiers for [`Vfs::read`] and [`Vfs::write`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoFlags {
    /// Bypass access checks
    pub privileged: bool,
    /// Deliver a functional write to the handle's own entry only
    pub forwarded: bool,
}

impl IoFlags {
    pub const PRIVILEGED: IoFlags = IoFlags {
        privileged: true,
        forwarded: false,
    };
}

struct FileDescriptor {
    handle: HandleId,
    path: String,
    node: NodeId,
    access: AccessFlag,
    status: StatusFlag,
    is_virtual: bool,
    duplicate_of: Option<HandleId>,
    io_gate: Arc<AsyncMutex<()>>,
}

/// Diagnostic view of an open descriptor
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DescriptorInfo {
    pub handle: HandleId,
    pub path: String,
    pub kind: EntryType,
    pub access: AccessFlag,
    pub status: StatusFlag,
    pub is_virtual: bool,
    pub duplicate_of: Option<HandleId>,
}

/// Everything read/write need after the access checks passed
struct IoTarget {
    node: NodeId,
    status: StatusFlag,
    io_gate: Arc<AsyncMutex<()>>,
    reader_gate: Option<Arc<AsyncMutex<()>>>,
}

pub struct Vfs {
    descriptors: Mutex<BTreeMap<HandleId, FileDescriptor>>,
    nodes: Mutex<NodeArena>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            descriptors: Mutex::new(BTreeMap::new()),
            nodes: Mutex::new(NodeArena::new(Attributes::ALL)),
        }
    }

    fn next_handle(descriptors: &BTreeMap<HandleId, FileDescriptor>) -> HandleId {
        descriptors
            .keys()
            .next_back()
            .map(|last| HandleId(last.0 + 1))
            .unwrap_or(HandleId(0))
    }

    /// Open a file or functional file, optionally creating it
    pub fn open(&self, path: &str, options: &OpenOptions) -> FsResult<HandleId> {
        let path = normalize(path);
        let mut descriptors = self.descriptors.lock().unwrap();
        let mut nodes = self.nodes.lock().unwrap();

        let is_virtual = options.kind == OpenType::Virtual;
        let node = if is_virtual {
            let name = components(&path).last().copied().unwrap_or_default().to_string();
            nodes.insert(Node {
                name,
                attributes: Attributes::READ_WRITE,
                kind: NodeKind::functional(),
            })
        } else {
            Self::open_entry(&mut nodes, &path, options)?
        };

        let handle = Self::next_handle(&descriptors);
        descriptors.insert(
            handle,
            FileDescriptor {
                handle,
                path: path.clone(),
                node,
                access: options.access,
                status: options.status,
                is_virtual,
                duplicate_of: options.duplicate_of,
                io_gate: Arc::new(AsyncMutex::new(())),
            },
        );
        debug!(%handle, %path, access = ?options.access, kind = ?options.kind, "opened descriptor");
        Ok(handle)
    }

    fn open_entry(nodes: &mut NodeArena, path: &str, options: &OpenOptions) -> FsResult<NodeId> {
        let parts = components(path);
        match nodes.resolve(&parts) {
            Ok(id) => {
                if matches!(nodes.node(id)?.kind, NodeKind::Directory { .. }) {
                    return Err(FsError::IsADirectory);
                }
                Ok(id)
            }
            Err(FsError::NoSuchEntry) if options.status == StatusFlag::Create => {
                let Some((name, parent_parts)) = parts.split_last() else {
                    return Err(FsError::IsADirectory);
                };
                let parent = nodes.resolve(parent_parts)?;
                let parent_attributes = nodes.node(parent)?.attributes;
                if !options.privileged && !parent_attributes.write {
                    return Err(FsError::OperationInaccessible(Operation::Create));
                }
                let kind = match options.kind {
                    OpenType::Functional => NodeKind::functional(),
                    _ => NodeKind::File { data: Vec::new() },
                };
                let id = nodes.insert_child(
                    parent,
                    Node {
                        name: name.to_string(),
                        attributes: parent_attributes,
                        kind,
                    },
                )?;
                trace!(%path, "created entry");
                Ok(id)
            }
            Err(err) => Err(err),
        }
    }

    /// Create a new handle mirroring `source`
    ///
    /// The duplicate shares the source's entry and path. A duplicate of a
    /// virtual handle that itself mirrors a producer keeps pointing at that
    /// producer, so the producer's writes still reach it after the
    /// intermediate handle is closed.
    pub fn open_duplicate(&self, source: HandleId) -> FsResult<HandleId> {
        let mut descriptors = self.descriptors.lock().unwrap();
        let original = descriptors.get(&source).ok_or(FsError::NoSuchFileHandle)?;
        let handle = Self::next_handle(&descriptors);
        let duplicate = FileDescriptor {
            handle,
            path: original.path.clone(),
            node: original.node,
            access: original.access,
            status: original.status,
            is_virtual: original.is_virtual,
            duplicate_of: match (original.is_virtual, original.duplicate_of) {
                (true, Some(producer)) => Some(producer),
                _ => Some(source),
            },
            io_gate: Arc::new(AsyncMutex::new(())),
        };
        debug!(%handle, %source, path = %duplicate.path, "duplicated descriptor");
        descriptors.insert(handle, duplicate);
        Ok(handle)
    }

    /// Close a handle; returns whether it existed
    pub fn close(&self, handle: HandleId) -> bool {
        let mut descriptors = self.descriptors.lock().unwrap();
        let Some(fd) = descriptors.remove(&handle) else {
            return false;
        };
        if fd.is_virtual && !descriptors.values().any(|other| other.node == fd.node) {
            // dropping the entry drops any pending resolver, waking its reader
            self.nodes.lock().unwrap().nodes.remove(&fd.node);
            trace!(%handle, "released virtual entry");
        } else if let Ok(Node {
            kind: NodeKind::Functional { pending_read, .. },
            ..
        }) = self.nodes.lock().unwrap().node_mut(fd.node)
        {
            // the entry outlives the handle, so wake a read issued through it
            if pending_read.as_ref().is_some_and(|pending| pending.owner == handle) {
                pending_read.take();
                trace!(%handle, "cancelled pending read");
            }
        }
        debug!(%handle, path = %fd.path, "closed descriptor");
        true
    }

    pub fn opendir(&self, path: &str) -> FsResult<HandleId> {
        let path = normalize(path);
        let mut descriptors = self.descriptors.lock().unwrap();
        let nodes = self.nodes.lock().unwrap();

        let id = nodes.resolve(&components(&path))?;
        let node = nodes.node(id)?;
        if !matches!(node.kind, NodeKind::Directory { .. }) {
            return Err(FsError::InvalidEntryType);
        }

        let handle = Self::next_handle(&descriptors);
        let access = AccessFlag::from_attributes(node.attributes);
        descriptors.insert(
            handle,
            FileDescriptor {
                handle,
                path: path.clone(),
                node: id,
                access,
                status: StatusFlag::Normal,
                is_virtual: false,
                duplicate_of: None,
                io_gate: Arc::new(AsyncMutex::new(())),
            },
        );
        debug!(%handle, %path, ?access, "opened directory");
        Ok(handle)
    }

    /// List a directory in insertion order, including one level of grandchildren
    pub fn readdir(&self, handle: HandleId) -> FsResult<Vec<EntryInfo>> {
        let descriptors = self.descriptors.lock().unwrap();
        let fd = descriptors.get(&handle).ok_or(FsError::NoSuchFileHandle)?;
        let nodes = self.nodes.lock().unwrap();
        match &nodes.node(fd.node)?.kind {
            NodeKind::Directory { children } => {
                children.iter().map(|child| nodes.info(*child, 1)).collect()
            }
            _ => Err(FsError::InvalidEntryType),
        }
    }

    /// Create a directory
    ///
    /// Non-recursive creation fails with `EntryExists` when the path resolves
    /// and with `ParentDoesntExist` when an intermediate segment is missing.
    /// Recursive creation leaves existing segments untouched. New segments
    /// take `attributes`, or their parent's attributes when `None`.
    pub fn mkdir(&self, path: &str, recursive: bool, attributes: Option<Attributes>) -> FsResult<()> {
        let parts = components(path);
        let mut nodes = self.nodes.lock().unwrap();

        if recursive {
            let mut current = ROOT;
            for name in &parts {
                current = match nodes.child(current, name)? {
                    Some(id) => id,
                    None => {
                        let inherited = nodes.node(current)?.attributes;
                        nodes.insert_child(current, Self::directory(name, attributes.unwrap_or(inherited)))?
                    }
                };
            }
            return match nodes.node(current)?.kind {
                NodeKind::Directory { .. } => Ok(()),
                _ => Err(FsError::EntryExists),
            };
        }

        match nodes.resolve(&parts) {
            Ok(_) => Err(FsError::EntryExists),
            Err(FsError::NoSuchEntry) => {
                let Some((name, parent_parts)) = parts.split_last() else {
                    return Err(FsError::EntryExists);
                };
                let parent = nodes.resolve(parent_parts)?;
                let inherited = nodes.node(parent)?.attributes;
                nodes.insert_child(parent, Self::directory(name, attributes.unwrap_or(inherited)))?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn directory(name: &str, attributes: Attributes) -> Node {
        Node {
            name: name.to_string(),
            attributes,
            kind: NodeKind::Directory {
                children: Vec::new(),
            },
        }
    }

    /// Entry metadata of a path without opening it
    pub fn stat(&self, path: &str) -> FsResult<EntryInfo> {
        let nodes = self.nodes.lock().unwrap();
        let id = nodes.resolve(&components(path))?;
        nodes.info(id, 0)
    }

    pub fn descriptor(&self, handle: HandleId) -> FsResult<DescriptorInfo> {
        let descriptors = self.descriptors.lock().unwrap();
        let fd = descriptors.get(&handle).ok_or(FsError::NoSuchFileHandle)?;
        let nodes = self.nodes.lock().unwrap();
        Ok(Self::describe(fd, &nodes))
    }

    pub fn open_handles(&self) -> Vec<DescriptorInfo> {
        let descriptors = self.descriptors.lock().unwrap();
        let nodes = self.nodes.lock().unwrap();
        descriptors.values().map(|fd| Self::describe(fd, &nodes)).collect()
    }

    fn describe(fd: &FileDescriptor, nodes: &NodeArena) -> DescriptorInfo {
        DescriptorInfo {
            handle: fd.handle,
            path: fd.path.clone(),
            kind: nodes
                .node(fd.node)
                .map(|n| n.kind.entry_type())
                .unwrap_or(EntryType::FunctionalFile),
            access: fd.access,
            status: fd.status,
            is_virtual: fd.is_virtual,
            duplicate_of: fd.duplicate_of,
        }
    }

    /// Whether a reader is currently suspended on the handle's entry
    pub fn has_pending_read(&self, handle: HandleId) -> FsResult<bool> {
        let descriptors = self.descriptors.lock().unwrap();
        let fd = descriptors.get(&handle).ok_or(FsError::NoSuchFileHandle)?;
        let nodes = self.nodes.lock().unwrap();
        Ok(matches!(
            nodes.node(fd.node)?.kind,
            NodeKind::Functional {
                pending_read: Some(_),
                ..
            }
        ))
    }

    fn io_target(&self, handle: HandleId, op: Operation, flags: IoFlags) -> FsResult<IoTarget> {
        let descriptors = self.descriptors.lock().unwrap();
        let fd = descriptors.get(&handle).ok_or(FsError::NoSuchFileHandle)?;
        let nodes = self.nodes.lock().unwrap();
        let node = nodes.node(fd.node)?;

        if matches!(node.kind, NodeKind::Directory { .. }) {
            return Err(FsError::IsADirectory);
        }
        if !flags.privileged {
            let allowed = match op {
                Operation::Read => fd.access.allows_read() && node.attributes.read,
                Operation::Write => fd.access.allows_write() && node.attributes.write,
                _ => false,
            };
            if !allowed {
                return Err(FsError::OperationInaccessible(op));
            }
        }

        Ok(IoTarget {
            node: fd.node,
            status: fd.status,
            io_gate: fd.io_gate.clone(),
            reader_gate: match &node.kind {
                NodeKind::Functional { reader_gate, .. } => Some(reader_gate.clone()),
                _ => None,
            },
        })
    }

    /// Read `count` bytes at `offset`
    ///
    /// Reads on a functional file suspend until a write delivers a payload.
    pub async fn read(
        &self,
        handle: HandleId,
        count: ByteCount,
        offset: u64,
        flags: IoFlags,
    ) -> FsResult<Vec<u8>> {
        let IoTarget {
            node,
            io_gate,
            reader_gate,
            ..
        } = self.io_target(handle, Operation::Read, flags)?;
        let _in_flight = io_gate.lock().await;

        if let Some(reader_gate) = reader_gate {
            return self.read_functional(handle, node, reader_gate, count).await;
        }

        let nodes = self.nodes.lock().unwrap();
        match &nodes.node(node)?.kind {
            NodeKind::File { data } => slice(data, count, offset),
            _ => Err(FsError::InvalidEntryType),
        }
    }

    async fn read_functional(
        &self,
        handle: HandleId,
        node: NodeId,
        reader_gate: Arc<AsyncMutex<()>>,
        count: ByteCount,
    ) -> FsResult<Vec<u8>> {
        let _queued = reader_gate.lock().await;
        let pending = {
            let descriptors = self.descriptors.lock().unwrap();
            // the handle may have been closed while this read was queued
            if !descriptors.contains_key(&handle) {
                return Err(FsError::NoSuchFileHandle);
            }
            let mut nodes = self.nodes.lock().unwrap();
            match &mut nodes.node_mut(node)?.kind {
                NodeKind::Functional { pending_read, .. } => {
                    let (tx, rx) = oneshot::channel();
                    *pending_read = Some(PendingRead {
                        owner: handle,
                        resolver: tx,
                    });
                    rx
                }
                _ => return Err(FsError::InvalidEntryType),
            }
        };

        let mut payload = pending.await.map_err(|_| FsError::NoSuchFileHandle)?;
        payload.truncate(count.within(payload.len()));
        Ok(payload)
    }

    /// Write `count` bytes of `buffer` at `offset`; returns the bytes written
    ///
    /// Writes on functional files never suspend and report the number of
    /// bytes handed to a reader.
    pub async fn write(
        &self,
        handle: HandleId,
        buffer: &[u8],
        count: ByteCount,
        offset: u64,
        flags: IoFlags,
    ) -> FsResult<usize> {
        let IoTarget {
            node,
            status,
            io_gate,
            reader_gate,
        } = self.io_target(handle, Operation::Write, flags)?;
        let payload = &buffer[..count.within(buffer.len())];

        if reader_gate.is_some() {
            return self.write_functional(handle, payload, flags);
        }

        let _in_flight = io_gate.lock().await;
        let mut nodes = self.nodes.lock().unwrap();
        match &mut nodes.node_mut(node)?.kind {
            NodeKind::File { data } => {
                let start = match status {
                    StatusFlag::Append => data.len(),
                    _ => usize::try_from(offset).map_err(|_| FsError::OutOfRange)?,
                };
                let end = start.checked_add(payload.len()).ok_or(FsError::OutOfRange)?;
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(payload);
                Ok(payload.len())
            }
            _ => Err(FsError::InvalidEntryType),
        }
    }

    /// Hand `payload` to exactly one pending reader
    ///
    /// Candidates are the handle's own entry, then (unless forwarded) the
    /// entries of other handles on the same non-virtual path or declaring
    /// themselves duplicates of this handle, in ascending handle order.
    fn write_functional(&self, handle: HandleId, payload: &[u8], flags: IoFlags) -> FsResult<usize> {
        let descriptors = self.descriptors.lock().unwrap();
        let own = descriptors.get(&handle).ok_or(FsError::NoSuchFileHandle)?;
        let mut candidates = vec![own.node];
        if !flags.forwarded {
            for fd in descriptors.values().filter(|fd| fd.handle != handle) {
                let same_path = !own.is_virtual && !fd.is_virtual && fd.path == own.path;
                if (same_path || fd.duplicate_of == Some(handle)) && !candidates.contains(&fd.node) {
                    candidates.push(fd.node);
                }
            }
        }

        let mut nodes = self.nodes.lock().unwrap();
        for id in candidates {
            let Ok(Node {
                kind: NodeKind::Functional { pending_read, .. },
                ..
            }) = nodes.node_mut(id)
            else {
                continue;
            };
            if let Some(reader) = pending_read.take() {
                if reader.resolver.send(payload.to_vec()).is_ok() {
                    trace!(%handle, bytes = payload.len(), "delivered functional write");
                    return Ok(payload.len());
                }
            }
        }
        trace!(%handle, "functional write dropped, no reader");
        Ok(0)
    }
}

fn slice(data: &[u8], count: ByteCount, offset: u64) -> FsResult<Vec<u8>> {
    let start = usize::try_from(offset).map_err(|_| FsError::OutOfRange)?;
    if start > data.len() {
        return Err(FsError::OutOfRange);
    }
    let end = match count {
        ByteCount::All => data.len(),
        ByteCount::Exactly(n) => start.checked_add(n).ok_or(FsError::OutOfRange)?,
    };
    if end > data.len() {
        return Err(FsError::OutOfRange);
    }
    Ok(data[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_vfs() -> Vfs {
        let vfs = Vfs::new();
        vfs.mkdir("/system", false, Some(Attributes::READ_EXECUTE)).unwrap();
        vfs.mkdir("/home", false, Some(Attributes::ALL)).unwrap();
        vfs
    }

    fn create(access: AccessFlag) -> OpenOptions {
        OpenOptions::new(access, StatusFlag::Create, OpenType::Normal)
    }

    fn normal(access: AccessFlag) -> OpenOptions {
        OpenOptions::new(access, StatusFlag::Normal, OpenType::Normal)
    }

    async fn wait_for_reader(vfs: &Vfs, handle: HandleId) {
        while !vfs.has_pending_read(handle).unwrap() {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn resolution_failures_are_classified() {
        let vfs = create_test_vfs();
        let h = vfs.open("/home/file", &create(AccessFlag::WriteOnly)).unwrap();
        vfs.close(h);

        assert_eq!(vfs.stat("/home/missing"), Err(FsError::NoSuchEntry));
        assert_eq!(vfs.stat("/home/a/b"), Err(FsError::ParentDoesntExist));
        assert_eq!(vfs.stat("/home/file/child"), Err(FsError::InvalidEntryType));
        assert_eq!(vfs.stat("home//file").unwrap().kind, EntryType::File);
        assert_eq!(vfs.stat("/home/file"), vfs.stat("/home/file"));
    }

    #[test]
    fn open_rejects_directories_and_missing_entries() {
        let vfs = create_test_vfs();
        assert_eq!(
            vfs.open("/home", &normal(AccessFlag::ReadOnly)),
            Err(FsError::IsADirectory)
        );
        assert_eq!(
            vfs.open("/home/none", &normal(AccessFlag::ReadOnly)),
            Err(FsError::NoSuchEntry)
        );
        assert_eq!(
            vfs.open("/home/x/y", &create(AccessFlag::ReadOnly)),
            Err(FsError::ParentDoesntExist)
        );
    }

    #[test]
    fn kernel_handles_are_max_plus_one() {
        let vfs = create_test_vfs();
        let handles: Vec<_> = (0..5)
            .map(|i| vfs.open(&format!("/home/f{i}"), &create(AccessFlag::ReadWrite)).unwrap())
            .collect();
        assert_eq!(handles, (0..5).map(HandleId).collect::<Vec<_>>());

        assert!(vfs.close(HandleId(3)));
        assert!(!vfs.close(HandleId(3)));
        let next = vfs.open("/home/f0", &normal(AccessFlag::ReadOnly)).unwrap();
        assert_eq!(next, HandleId(5));
    }

    #[tokio::test]
    async fn create_write_read_round_trip() {
        let vfs = create_test_vfs();
        let h = vfs.open("/home/note", &create(AccessFlag::WriteOnly)).unwrap();
        let n = vfs
            .write(h, b"hello kernel", ByteCount::All, 0, IoFlags::default())
            .await
            .unwrap();
        assert_eq!(n, 12);
        vfs.close(h);

        let h2 = vfs.open("/home/note", &normal(AccessFlag::ReadOnly)).unwrap();
        let data = vfs.read(h2, ByteCount::All, 0, IoFlags::default()).await.unwrap();
        assert_eq!(data, b"hello kernel");

        let part = vfs.read(h2, ByteCount::Exactly(6), 6, IoFlags::default()).await.unwrap();
        assert_eq!(part, b"kernel");
        assert_eq!(
            vfs.read(h2, ByteCount::Exactly(4), 10, IoFlags::default()).await,
            Err(FsError::OutOfRange)
        );
    }

    #[tokio::test]
    async fn writes_zero_extend_and_append() {
        let vfs = create_test_vfs();
        let h = vfs.open("/home/sparse", &create(AccessFlag::ReadWrite)).unwrap();
        vfs.write(h, b"ab", ByteCount::All, 3, IoFlags::default()).await.unwrap();
        assert_eq!(
            vfs.read(h, ByteCount::All, 0, IoFlags::default()).await.unwrap(),
            vec![0, 0, 0, b'a', b'b']
        );

        let a = vfs
            .open(
                "/home/sparse",
                &OpenOptions::new(AccessFlag::WriteOnly, StatusFlag::Append, OpenType::Normal),
            )
            .unwrap();
        vfs.write(a, b"xyz", ByteCount::Exactly(2), 0, IoFlags::default()).await.unwrap();
        assert_eq!(
            vfs.read(h, ByteCount::All, 0, IoFlags::default()).await.unwrap(),
            vec![0, 0, 0, b'a', b'b', b'x', b'y']
        );
    }

    #[tokio::test]
    async fn permissions_are_enforced() {
        let vfs = create_test_vfs();
        assert_eq!(
            vfs.open("/system/file", &create(AccessFlag::ReadWrite)),
            Err(FsError::OperationInaccessible(Operation::Create))
        );
        let h = vfs
            .open("/system/file", &create(AccessFlag::ReadWrite).privileged())
            .unwrap();
        // entry inherits read+execute from /system
        assert_eq!(
            vfs.write(h, b"x", ByteCount::All, 0, IoFlags::default()).await,
            Err(FsError::OperationInaccessible(Operation::Write))
        );
        vfs.write(h, b"x", ByteCount::All, 0, IoFlags::PRIVILEGED).await.unwrap();

        let w = vfs.open("/home/out", &create(AccessFlag::WriteOnly)).unwrap();
        assert_eq!(
            vfs.read(w, ByteCount::All, 0, IoFlags::default()).await,
            Err(FsError::OperationInaccessible(Operation::Read))
        );

        let d = vfs.opendir("/home").unwrap();
        assert_eq!(
            vfs.read(d, ByteCount::All, 0, IoFlags::PRIVILEGED).await,
            Err(FsError::IsADirectory)
        );
    }

    #[test]
    fn mkdir_recursive_is_idempotent() {
        let vfs = create_test_vfs();
        vfs.mkdir("/home/a/b/c", true, None).unwrap();
        vfs.mkdir("/home/a/b/c", true, None).unwrap();
        assert_eq!(vfs.mkdir("/home/a/b/c", false, None), Err(FsError::EntryExists));
        assert_eq!(vfs.mkdir("/home/q/r", false, None), Err(FsError::ParentDoesntExist));
        assert_eq!(vfs.stat("/home/a/b").unwrap().attributes, Attributes::ALL);

        vfs.mkdir("/system/config/net", true, None).unwrap();
        assert_eq!(
            vfs.stat("/system/config/net").unwrap().attributes,
            Attributes::READ_EXECUTE
        );
    }

    #[test]
    fn readdir_keeps_insertion_order_and_one_level_of_grandchildren() {
        let vfs = create_test_vfs();
        for name in ["zeta", "alpha", "mid"] {
            let h = vfs.open(&format!("/home/{name}"), &create(AccessFlag::ReadWrite)).unwrap();
            vfs.close(h);
        }
        vfs.mkdir("/home/dir/inner/deep", true, None).unwrap();

        let d = vfs.opendir("/home").unwrap();
        let listing = vfs.readdir(d).unwrap();
        let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "mid", "dir"]);

        let dir = &listing[3];
        let inner = &dir.entries.as_ref().unwrap()[0];
        assert_eq!(inner.name, "inner");
        assert_eq!(inner.entries, None);

        let f = vfs.open("/home/zeta", &normal(AccessFlag::ReadOnly)).unwrap();
        assert_eq!(vfs.readdir(f), Err(FsError::InvalidEntryType));
        assert_eq!(vfs.opendir("/home/zeta"), Err(FsError::InvalidEntryType));
    }

    #[tokio::test]
    async fn functional_read_waits_for_write() {
        let vfs = Arc::new(create_test_vfs());
        let reader = vfs
            .open(
                "/home/pipe",
                &OpenOptions::new(AccessFlag::ReadOnly, StatusFlag::Create, OpenType::Functional),
            )
            .unwrap();
        let writer = vfs.open("/home/pipe", &normal(AccessFlag::WriteOnly)).unwrap();

        let dropped = vfs
            .write(writer, b"lost", ByteCount::All, 0, IoFlags::default())
            .await
            .unwrap();
        assert_eq!(dropped, 0);

        let task = tokio::spawn({
            let vfs = vfs.clone();
            async move { vfs.read(reader, ByteCount::All, 0, IoFlags::default()).await }
        });
        wait_for_reader(&vfs, reader).await;

        let delivered = vfs
            .write(writer, b"payload!", ByteCount::Exactly(7), 0, IoFlags::default())
            .await
            .unwrap();
        assert_eq!(delivered, 7);
        assert_eq!(task.await.unwrap().unwrap(), b"payload");
        assert!(!vfs.has_pending_read(reader).unwrap());
    }

    #[tokio::test]
    async fn producer_write_reaches_exactly_one_mirror() {
        let vfs = Arc::new(create_test_vfs());
        let producer = vfs
            .open("/dev/input", &OpenOptions::new(AccessFlag::WriteOnly, StatusFlag::Normal, OpenType::Virtual))
            .unwrap();
        let mirror_options =
            OpenOptions::new(AccessFlag::ReadOnly, StatusFlag::Normal, OpenType::Virtual).duplicate_of(producer);
        let first = vfs.open("/dev/input", &mirror_options).unwrap();
        let second = vfs.open("/dev/input", &mirror_options).unwrap();

        let reads: Vec<_> = [first, second]
            .into_iter()
            .map(|h| {
                let vfs = vfs.clone();
                tokio::spawn(async move { vfs.read(h, ByteCount::All, 0, IoFlags::default()).await })
            })
            .collect();
        wait_for_reader(&vfs, first).await;
        wait_for_reader(&vfs, second).await;

        assert_eq!(
            vfs.write(producer, b"k", ByteCount::All, 0, IoFlags::default()).await.unwrap(),
            1
        );
        assert!(!vfs.has_pending_read(first).unwrap());
        assert!(vfs.has_pending_read(second).unwrap());

        // forwarded writes stay on the producer's own entry
        assert_eq!(
            vfs.write(producer, b"k", ByteCount::All, 0, IoFlags { forwarded: true, ..IoFlags::default() })
                .await
                .unwrap(),
            0
        );

        let mut reads = reads.into_iter();
        assert_eq!(reads.next().unwrap().await.unwrap().unwrap(), b"k");

        // releasing the last handle on a virtual entry wakes its reader
        vfs.close(second);
        assert_eq!(reads.next().unwrap().await.unwrap(), Err(FsError::NoSuchFileHandle));
    }

    #[tokio::test]
    async fn closing_a_handle_cancels_its_suspended_read() {
        let vfs = Arc::new(create_test_vfs());
        let functional = OpenOptions::new(AccessFlag::ReadOnly, StatusFlag::Create, OpenType::Functional);
        let stale = vfs.open("/home/pipe", &functional).unwrap();
        let live = vfs.open("/home/pipe", &functional).unwrap();
        let writer = vfs.open("/home/pipe", &normal(AccessFlag::WriteOnly)).unwrap();

        let spawn_read = |handle| {
            let vfs = vfs.clone();
            tokio::spawn(async move { vfs.read(handle, ByteCount::All, 0, IoFlags::default()).await })
        };
        let stale_read = spawn_read(stale);
        wait_for_reader(&vfs, stale).await;

        assert!(vfs.close(stale));
        assert_eq!(stale_read.await.unwrap(), Err(FsError::NoSuchFileHandle));
        assert!(!vfs.has_pending_read(live).unwrap());

        let live_read = spawn_read(live);
        wait_for_reader(&vfs, live).await;
        let delivered = vfs
            .write(writer, b"data", ByteCount::All, 0, IoFlags::default())
            .await
            .unwrap();
        assert_eq!(delivered, 4);
        assert_eq!(live_read.await.unwrap().unwrap(), b"data");
    }

    #[tokio::test]
    async fn closing_another_handle_keeps_the_pending_read() {
        let vfs = Arc::new(create_test_vfs());
        let functional = OpenOptions::new(AccessFlag::ReadOnly, StatusFlag::Create, OpenType::Functional);
        let reader = vfs.open("/home/pipe", &functional).unwrap();
        let bystander = vfs.open("/home/pipe", &functional).unwrap();
        let writer = vfs.open("/home/pipe", &normal(AccessFlag::WriteOnly)).unwrap();

        let read = tokio::spawn({
            let vfs = vfs.clone();
            async move { vfs.read(reader, ByteCount::All, 0, IoFlags::default()).await }
        });
        wait_for_reader(&vfs, reader).await;
        vfs.close(bystander);
        assert!(vfs.has_pending_read(reader).unwrap());

        vfs.write(writer, b"ok", ByteCount::All, 0, IoFlags::default()).await.unwrap();
        assert_eq!(read.await.unwrap().unwrap(), b"ok");
    }

    #[test]
    fn duplicates_share_path_and_record_source() {
        let vfs = create_test_vfs();
        let h = vfs.open("/home/shared", &create(AccessFlag::ReadWrite)).unwrap();
        let dup = vfs.open_duplicate(h).unwrap();
        assert_ne!(dup, h);

        let info = vfs.descriptor(dup).unwrap();
        assert_eq!(info.path, "/home/shared");
        assert_eq!(info.duplicate_of, Some(h));
        assert_eq!(vfs.open_handles().len(), 2);
        assert_eq!(vfs.open_duplicate(HandleId(42)), Err(FsError::NoSuchFileHandle));
    }
}
