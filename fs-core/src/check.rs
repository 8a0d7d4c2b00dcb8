//! Consistency checker
//!
//! Audits the bitmaps, the inode table and the directory tree against each
//! other and reports every disagreement. Nothing is repaired.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use crate::dir::{DOT, DOT_DOT};
use crate::error::{FsError, Result};
use crate::inode::{BlockId, Inode, InodeId, InodeTable};
use crate::ROOT_INODE;

/// Category of a consistency violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Block bit set but no live inode references the block
    BlockLeaked,
    /// Block referenced (or reserved) but its bit is clear
    BlockUnmarked,
    /// Block referenced by more than one inode or position
    BlockShared,
    /// Inode references a block outside the data region
    BlockOutOfRange,
    /// Inode bit set but the slot is empty
    InodeLeaked,
    /// Slot holds an inode but its bit is clear
    InodeUnmarked,
    /// Allocated inode that no directory entry reaches
    Orphan,
    /// Entry names an inode that is not allocated
    DanglingEntry,
    /// Recorded link count differs from the entries naming the inode
    LinkCount,
    /// Size does not match the number of referenced blocks
    SizeMismatch,
    /// Directory `.` missing or not pointing at itself
    BadSelfEntry,
    /// Directory `..` missing or not pointing at its parent
    BadParentEntry,
    /// Entry kind disagrees with the inode kind
    KindMismatch,
    /// Superblock free-block counter differs from the bitmap
    FreeBlockCount,
    /// Superblock free-inode counter differs from the bitmap
    FreeInodeCount,
    RootNotDirectory,
    /// Inode or directory content cannot be decoded
    InvalidInode,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::BlockLeaked => "block leaked",
            ViolationKind::BlockUnmarked => "block unmarked",
            ViolationKind::BlockShared => "block shared",
            ViolationKind::BlockOutOfRange => "block out of range",
            ViolationKind::InodeLeaked => "inode leaked",
            ViolationKind::InodeUnmarked => "inode unmarked",
            ViolationKind::Orphan => "orphan inode",
            ViolationKind::DanglingEntry => "dangling entry",
            ViolationKind::LinkCount => "wrong link count",
            ViolationKind::SizeMismatch => "size mismatch",
            ViolationKind::BadSelfEntry => "bad '.' entry",
            ViolationKind::BadParentEntry => "bad '..' entry",
            ViolationKind::KindMismatch => "kind mismatch",
            ViolationKind::FreeBlockCount => "free block count",
            ViolationKind::FreeInodeCount => "free inode count",
            ViolationKind::RootNotDirectory => "root is not a directory",
            ViolationKind::InvalidInode => "invalid inode",
        };
        f.write_str(name)
    }
}

/// One finding; `id` is the affected block or inode number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub id: u64,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.id, self.detail)
    }
}

/// Result of a full check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub violations: Vec<Violation>,
    /// Unreachable inodes kept alive only by open handles
    pub pending_delete: Vec<InodeId>,
    pub inodes_in_use: u64,
    /// Data blocks referenced by live inodes, indirect blocks included
    pub blocks_in_use: u64,
    pub directories: u64,
    pub files: u64,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Turn a dirty report into [`FsError::Corrupt`]
    pub fn ensure_clean(&self) -> Result<()> {
        match self.violations.first() {
            None => Ok(()),
            Some(first) => Err(FsError::Corrupt(format!(
                "{} violations, first: {}",
                self.violations.len(),
                first
            ))),
        }
    }

    /// Number of violations of `kind`
    pub fn count(&self, kind: ViolationKind) -> usize {
        self.violations.iter().filter(|v| v.kind == kind).count()
    }

    fn push(&mut self, kind: ViolationKind, id: u64, detail: impl Into<String>) {
        let violation = Violation {
            kind,
            id,
            detail: detail.into(),
        };
        log::warn!("CHECK: {}", violation);
        self.violations.push(violation);
    }
}

/// Read-only audit over an [`InodeTable`]
pub struct ConsistencyChecker<'a> {
    table: &'a InodeTable,
    report: CheckReport,
    live: BTreeMap<InodeId, Inode>,
    /// Referenced block → owning inode
    owners: HashMap<BlockId, InodeId>,
}

impl<'a> ConsistencyChecker<'a> {
    pub fn new(table: &'a InodeTable) -> Self {
        Self {
            table,
            report: CheckReport::default(),
            live: BTreeMap::new(),
            owners: HashMap::new(),
        }
    }

    /// Run every check and return the report
    pub fn run(mut self) -> Result<CheckReport> {
        log::info!("CHECK: Starting consistency check");
        self.check_counters();
        self.scan_inodes()?;
        self.collect_blocks()?;
        self.check_block_bitmap();
        self.walk_tree()?;

        self.report.inodes_in_use = self.live.len() as u64;
        self.report.blocks_in_use = self.owners.len() as u64;
        self.report.directories = self.live.values().filter(|i| i.is_dir()).count() as u64;
        self.report.files = self.report.inodes_in_use - self.report.directories;

        log::info!(
            "CHECK: Done - {} violations, {} inodes, {} blocks in use",
            self.report.violations.len(),
            self.report.inodes_in_use,
            self.report.blocks_in_use
        );
        Ok(self.report)
    }

    fn check_counters(&mut self) {
        let alloc = self.table.allocator();
        let layout = alloc.layout();

        let free_blocks = layout.block_count - alloc.block_bitmap().count_ones();
        if free_blocks != alloc.free_blocks() {
            self.report.push(
                ViolationKind::FreeBlockCount,
                alloc.free_blocks(),
                format!("superblock says {}, bitmap says {}", alloc.free_blocks(), free_blocks),
            );
        }
        let free_inodes = layout.inode_count - alloc.inode_bitmap().count_ones();
        if free_inodes != alloc.free_inodes() {
            self.report.push(
                ViolationKind::FreeInodeCount,
                alloc.free_inodes(),
                format!("superblock says {}, bitmap says {}", alloc.free_inodes(), free_inodes),
            );
        }
    }

    /// Compare every inode slot against its bitmap bit
    fn scan_inodes(&mut self) -> Result<()> {
        let alloc = self.table.allocator();
        for id in 1..alloc.layout().inode_count {
            let record = self.table.read_record(id)?;
            let marked = alloc.is_inode_allocated(id);

            match (marked, record.is_free()) {
                (true, true) => {
                    self.report
                        .push(ViolationKind::InodeLeaked, id, "bit set for an empty slot")
                }
                (false, false) => self.report.push(
                    ViolationKind::InodeUnmarked,
                    id,
                    "slot in use but bit clear",
                ),
                (true, false) => match self.table.get(id) {
                    Ok(inode) => {
                        self.live.insert(id, inode);
                    }
                    Err(FsError::Corrupt(detail)) => {
                        self.report.push(ViolationKind::InvalidInode, id, detail)
                    }
                    Err(e) => return Err(e),
                },
                (false, true) => {}
            }
        }
        Ok(())
    }

    fn claim(&mut self, block: BlockId, inode: InodeId) {
        if !self.table.layout().is_data_block(block) {
            self.report.push(
                ViolationKind::BlockOutOfRange,
                block,
                format!("referenced by inode {}", inode),
            );
        } else if let Some(&other) = self.owners.get(&block) {
            self.report.push(
                ViolationKind::BlockShared,
                block,
                format!("referenced by inodes {} and {}", other, inode),
            );
        } else {
            self.owners.insert(block, inode);
        }
    }

    /// Gather block references and check sizes
    fn collect_blocks(&mut self) -> Result<()> {
        let block_size = self.table.layout().block_size;
        let inodes: Vec<Inode> = self.live.values().cloned().collect();

        for inode in inodes {
            let mut content = inode.blocks.direct.clone();
            if let Some(indirect) = inode.blocks.indirect {
                let valid = self.table.layout().is_data_block(indirect);
                self.claim(indirect, inode.id);
                if valid {
                    content = self.table.data_blocks(&inode)?;
                }
            }
            for &block in &content {
                self.claim(block, inode.id);
            }

            let expected = inode.block_count(block_size);
            if expected != content.len() as u64 {
                self.report.push(
                    ViolationKind::SizeMismatch,
                    inode.id,
                    format!(
                        "size {} needs {} blocks, {} referenced",
                        inode.size,
                        expected,
                        content.len()
                    ),
                );
            }
        }
        Ok(())
    }

    /// A block bit must be set exactly for metadata and referenced blocks
    fn check_block_bitmap(&mut self) {
        let alloc = self.table.allocator();
        let layout = *alloc.layout();

        for block in 0..layout.block_count {
            let marked = alloc.is_block_allocated(block);
            let reserved = !layout.is_data_block(block);
            let used = reserved || self.owners.contains_key(&block);

            if marked && !used {
                self.report
                    .push(ViolationKind::BlockLeaked, block, "bit set but unreferenced");
            } else if !marked && used {
                let detail = match self.owners.get(&block) {
                    Some(owner) => format!("referenced by inode {} but bit clear", owner),
                    None => "reserved metadata block but bit clear".to_string(),
                };
                self.report.push(ViolationKind::BlockUnmarked, block, detail);
            }
        }
    }

    /// Breadth-first walk from the root counting references to every inode
    fn walk_tree(&mut self) -> Result<()> {
        match self.live.get(&ROOT_INODE) {
            Some(root) if root.is_dir() => {}
            _ => {
                self.report.push(
                    ViolationKind::RootNotDirectory,
                    ROOT_INODE,
                    "root inode is missing or not a directory",
                );
                return Ok(());
            }
        }

        let mut refs: HashMap<InodeId, u32> = HashMap::new();
        let mut visited: HashSet<InodeId> = HashSet::from([ROOT_INODE]);
        let mut queue = VecDeque::from([(ROOT_INODE, ROOT_INODE)]);

        while let Some((dir, parent)) = queue.pop_front() {
            let entries = match self.table.list_entries(dir) {
                Ok(entries) => entries,
                Err(FsError::Corrupt(detail)) => {
                    self.report.push(ViolationKind::InvalidInode, dir, detail);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match entries.iter().find(|e| e.name == DOT) {
                Some(e) if e.inode == dir => {}
                Some(e) => self.report.push(
                    ViolationKind::BadSelfEntry,
                    dir,
                    format!("'.' points to {}", e.inode),
                ),
                None => self.report.push(ViolationKind::BadSelfEntry, dir, "no '.' entry"),
            }
            match entries.iter().find(|e| e.name == DOT_DOT) {
                Some(e) if e.inode == parent => {}
                Some(e) => self.report.push(
                    ViolationKind::BadParentEntry,
                    dir,
                    format!("'..' points to {}, expected {}", e.inode, parent),
                ),
                None => self.report.push(ViolationKind::BadParentEntry, dir, "no '..' entry"),
            }

            for entry in &entries {
                *refs.entry(entry.inode).or_insert(0) += 1;
                if entry.is_special() {
                    continue;
                }

                let Some(target) = self.live.get(&entry.inode) else {
                    self.report.push(
                        ViolationKind::DanglingEntry,
                        entry.inode,
                        format!("'{}' in directory {} names a free inode", entry.name, dir),
                    );
                    continue;
                };
                if target.kind != entry.kind {
                    self.report.push(
                        ViolationKind::KindMismatch,
                        entry.inode,
                        format!("'{}' in directory {}", entry.name, dir),
                    );
                }
                if target.is_dir() && visited.insert(entry.inode) {
                    queue.push_back((entry.inode, dir));
                }
            }
        }

        let live: Vec<(InodeId, u16)> = self.live.iter().map(|(&id, i)| (id, i.links)).collect();
        for (id, links) in live {
            match refs.get(&id) {
                None if self.table.is_pinned(id) => self.report.pending_delete.push(id),
                None => self.report.push(
                    ViolationKind::Orphan,
                    id,
                    format!("unreachable from the root ({} links recorded)", links),
                ),
                Some(&count) if count != links as u32 => self.report.push(
                    ViolationKind::LinkCount,
                    id,
                    format!("{} links recorded, {} entries found", links, count),
                ),
                Some(_) => {}
            }
        }
        Ok(())
    }
}
