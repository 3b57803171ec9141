//! Workspace properties: identity, working folders and baseline folders.
//!
//! Unlike the two path tables this one is small and rarely written, so it
//! is persisted with bincode behind the usual magic/schema header.

use std::path::{Path, PathBuf};

use lws_baseline::BaselineFolder;
use lws_pathtree::{local_path, server_path, RecursionType};
use serde::{Deserialize, Serialize};

use crate::format::{TableReader, TableWriter};
use crate::slots::MetadataTable;
use crate::Result;

const MAGIC: u16 = 0x5750;
const SCHEMA: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkingFolderKind {
    Map,
    Cloak,
}

/// A server path mapped to (or cloaked from) a local folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingFolder {
    pub server_item: String,
    /// `None` for cloaks
    pub local_item: Option<PathBuf>,
    pub kind: WorkingFolderKind,
    pub depth: RecursionType,
}

impl WorkingFolder {
    pub fn map(server_item: impl Into<String>, local_item: impl Into<PathBuf>) -> Self {
        Self {
            server_item: server_item.into(),
            local_item: Some(local_item.into()),
            kind: WorkingFolderKind::Map,
            depth: RecursionType::Full,
        }
    }

    pub fn cloak(server_item: impl Into<String>) -> Self {
        Self {
            server_item: server_item.into(),
            local_item: None,
            kind: WorkingFolderKind::Cloak,
            depth: RecursionType::Full,
        }
    }

    pub fn is_cloaked(&self) -> bool {
        self.kind == WorkingFolderKind::Cloak
    }

    fn covers_server(&self, item: &str) -> bool {
        if !server_path::is_child(&self.server_item, item) {
            return false;
        }
        match self.depth {
            RecursionType::Full => true,
            RecursionType::OneLevel => {
                server_path::depth(item) <= server_path::depth(&self.server_item) + 1
            }
            RecursionType::None => server_path::equals(item, &self.server_item),
        }
    }
}

/// Outcome of translating a path through the working folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mapping<T> {
    Mapped(T),
    Cloaked,
    NotMapped,
}

impl<T> Mapping<T> {
    pub fn mapped(self) -> Option<T> {
        match self {
            Mapping::Mapped(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceProperties {
    pub name: String,
    pub owner: String,
    pub working_folders: Vec<WorkingFolder>,
    pub baseline_folders: Vec<BaselineFolder>,
    #[serde(skip)]
    dirty: bool,
}

impl WorkspaceProperties {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            dirty: true,
            ..Self::default()
        }
    }

    pub fn set_working_folders(&mut self, folders: Vec<WorkingFolder>) {
        self.working_folders = folders;
        self.dirty = true;
    }

    pub fn set_baseline_folders(&mut self, folders: Vec<BaselineFolder>) {
        if self.baseline_folders != folders {
            self.baseline_folders = folders;
            self.dirty = true;
        }
    }

    /// Translate a server path to its local path. The deepest working
    /// folder covering the item decides; a cloak there means cloaked.
    pub fn server_to_local(&self, server_item: &str) -> Mapping<PathBuf> {
        let best = self
            .working_folders
            .iter()
            .filter(|wf| wf.covers_server(server_item))
            .max_by_key(|wf| server_path::depth(&wf.server_item));
        match best {
            None => Mapping::NotMapped,
            Some(wf) if wf.is_cloaked() => Mapping::Cloaked,
            Some(wf) => match &wf.local_item {
                Some(local) => {
                    let relative = server_path::make_relative(server_item, &wf.server_item);
                    let mut out = local.clone();
                    for segment in relative.split('/').filter(|s| !s.is_empty()) {
                        out.push(segment);
                    }
                    Mapping::Mapped(out)
                }
                None => Mapping::Cloaked,
            },
        }
    }

    /// Translate a local path to its server path.
    pub fn local_to_server(&self, local_item: &Path) -> Mapping<String> {
        let best = self
            .working_folders
            .iter()
            .filter(|wf| !wf.is_cloaked())
            .filter_map(|wf| wf.local_item.as_deref().map(|l| (wf, l)))
            .filter(|(_, l)| local_path::is_child(l, local_item))
            .max_by_key(|(_, l)| l.components().count());
        let Some((wf, local_root)) = best else {
            return Mapping::NotMapped;
        };
        let mut server = wf.server_item.clone();
        let skip = local_root.components().count();
        for component in local_item.components().skip(skip) {
            server = server_path::combine(&server, &component.as_os_str().to_string_lossy());
        }
        match self.server_to_local(&server) {
            Mapping::Mapped(_) => Mapping::Mapped(server),
            Mapping::Cloaked => Mapping::Cloaked,
            Mapping::NotMapped => Mapping::NotMapped,
        }
    }

    /// Whether `server_item` is itself the root of a mapping.
    pub fn is_mapping_root(&self, server_item: &str) -> bool {
        self.working_folders
            .iter()
            .any(|wf| !wf.is_cloaked() && server_path::equals(&wf.server_item, server_item))
    }

    /// Whether a mapping root lies strictly beneath `server_item`.
    pub fn is_parent_of_mapping(&self, server_item: &str) -> bool {
        self.working_folders.iter().any(|wf| {
            !wf.is_cloaked()
                && server_path::is_child(server_item, &wf.server_item)
                && !server_path::equals(server_item, &wf.server_item)
        })
    }

    /// Whether `server_item` is a mapping root or lies beneath one.
    pub fn is_at_or_under_mapping_root(&self, server_item: &str) -> bool {
        self.working_folders
            .iter()
            .any(|wf| !wf.is_cloaked() && server_path::is_child(server_item, &wf.server_item))
    }
}

impl MetadataTable for WorkspaceProperties {
    const NAME: &'static str = "properties";

    fn decode(bytes: &[u8], path: &Path) -> Result<Self> {
        let mut r = TableReader::new(bytes, path);
        r.header(MAGIC, &[SCHEMA])?;
        let body = &bytes[3..];
        bincode::deserialize(body).map_err(|e| r.invalid(format!("bad properties body: {}", e)))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut w = TableWriter::new();
        w.u16(MAGIC);
        w.u8(SCHEMA);
        let mut bytes = w.into_bytes();
        bytes.extend(bincode::serialize(self)?);
        Ok(bytes)
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
}
