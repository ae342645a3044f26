use crate::error::{Result, UnlayerError};
use flate2::read::GzDecoder;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};

/// Member name suffix that marks a nested per-layer archive in `docker save` output
pub const LAYER_SUFFIX: &str = "layer.tar";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Symlink chains longer than this are treated as unresolvable
const MAX_LINK_DEPTH: usize = 8;

/// Compression applied around a tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Plain,
    Gzip,
}

impl Compression {
    /// Sniff the compression from the first bytes of the file.
    ///
    /// An empty file is not an archive and is rejected here, before tar
    /// gets a chance to read it as an empty entry list.
    fn detect(mut file: &File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "archive is empty"));
        }

        let mut magic = [0u8; 2];
        if len >= 2 {
            file.read_exact(&mut magic)?;
        }

        Ok(if magic == GZIP_MAGIC {
            Compression::Gzip
        } else {
            Compression::Plain
        })
    }
}

fn tar_archive<'a, R: Read + 'a>(reader: R, compression: Compression) -> Archive<Box<dyn Read + 'a>> {
    let reader = BufReader::new(reader);
    let reader: Box<dyn Read + 'a> = match compression {
        Compression::Plain => Box::new(reader),
        Compression::Gzip => Box::new(GzDecoder::new(reader)),
    };
    Archive::new(reader)
}

/// Open a tar file for reading, decompressing gzip transparently
pub fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let open_error = |source: io::Error| UnlayerError::ArchiveOpen {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(open_error)?;
    let compression = Compression::detect(&file).map_err(open_error)?;
    file.rewind().map_err(open_error)?;

    Ok(tar_archive(file, compression))
}

/// Entry type of an archive member, as far as layer discovery cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    File,
    Directory,
    Symlink,
    Hardlink,
    Other,
}

impl From<EntryType> for MemberKind {
    fn from(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Regular | EntryType::Continuous => MemberKind::File,
            EntryType::Directory => MemberKind::Directory,
            EntryType::Symlink => MemberKind::Symlink,
            EntryType::Link => MemberKind::Hardlink,
            _ => MemberKind::Other,
        }
    }
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberKind::File => "regular file",
            MemberKind::Directory => "directory",
            MemberKind::Symlink => "symlink",
            MemberKind::Hardlink => "hard link",
            MemberKind::Other => "special file",
        };
        f.write_str(name)
    }
}

/// One entry of the image archive listing
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveMember {
    /// Position of the entry in the archive
    pub index: usize,
    /// Path of the entry inside the archive
    pub path: String,
    /// Size of the entry data in bytes
    pub size: u64,
    pub kind: MemberKind,
    /// Target of a symlink or hardlink entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_name: Option<String>,
}

/// A member of the image archive holding one nested layer archive.
///
/// Newer `docker save` output stores `<id>/layer.tar` as a symlink into
/// `blobs/sha256/`. The member then carries the index of the regular entry
/// that actually holds the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerMember {
    /// Position of the entry in the image archive
    pub index: usize,
    /// Full path of the entry inside the image archive
    pub path: String,
    /// Size of the nested archive in bytes
    pub size: u64,
    pub kind: MemberKind,
    /// Entry whose data is the nested archive; `None` when the member is
    /// not a regular file and doesn't link to one inside the archive
    pub data_index: Option<usize>,
    /// In-archive path the member links to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl LayerMember {
    /// Everything before the file name, e.g. `abc123` for `abc123/layer.tar`
    pub fn parent_dir(&self) -> &Path {
        Path::new(&self.path).parent().unwrap_or_else(|| Path::new(""))
    }

    /// File name of the nested archive, e.g. `layer.tar`
    pub fn file_name(&self) -> Result<&str> {
        Path::new(&self.path)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UnlayerError::UnsafeMemberPath(self.path.clone()))
    }

    /// Error for a member whose bytes can't be located
    pub fn not_regular(&self) -> UnlayerError {
        UnlayerError::NotRegularFile {
            member: self.path.clone(),
            kind: self.kind,
        }
    }

    /// Directory under `output_root` that receives this layer.
    ///
    /// Root and `.` components are dropped. A `..` component rejects the
    /// member outright so nothing is ever written outside `output_root`.
    pub fn layer_dir(&self, output_root: &Path) -> Result<PathBuf> {
        let mut relative = PathBuf::new();
        for component in self.parent_dir().components() {
            match component {
                Component::Prefix(..) | Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(UnlayerError::UnsafeMemberPath(self.path.clone()));
                }
                Component::Normal(part) => relative.push(part),
            }
        }
        Ok(output_root.join(relative))
    }
}

/// An opened image archive and its member listing.
///
/// The file handle stays open for the lifetime of the value and is rewound
/// for every pass over the entries.
#[derive(Debug)]
pub struct ImageArchive {
    path: PathBuf,
    compression: Compression,
    file: File,
    members: Vec<ArchiveMember>,
}

impl ImageArchive {
    /// Open the archive and read its member listing
    pub fn open(path: &Path) -> Result<Self> {
        let open_error = |source: io::Error| UnlayerError::ArchiveOpen {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(open_error)?;
        let compression = Compression::detect(&file).map_err(open_error)?;

        let mut archive = ImageArchive {
            path: path.to_path_buf(),
            compression,
            file,
            members: Vec::new(),
        };
        archive.members = archive.list_members().map_err(open_error)?;

        debug!(
            "Opened {} ({:?}, {} members)",
            archive.path.display(),
            archive.compression,
            archive.members.len()
        );

        Ok(archive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn members(&self) -> &[ArchiveMember] {
        &self.members
    }

    /// Members whose name ends with `suffix`, in archive order.
    ///
    /// The match is a literal, case-sensitive suffix comparison. Symlink and
    /// hardlink members are resolved to the regular entry they point at.
    pub fn locate_layers(&self, suffix: &str) -> Vec<LayerMember> {
        // Later entries replace earlier ones with the same path, as on extraction
        let by_path: HashMap<PathBuf, usize> = self
            .members
            .iter()
            .filter_map(|member| Some((normalize(Path::new(&member.path))?, member.index)))
            .collect();

        self.members
            .iter()
            .filter(|member| member.path.ends_with(suffix))
            .map(|member| {
                let data = self.resolve_data(member, &by_path);
                LayerMember {
                    index: member.index,
                    path: member.path.clone(),
                    size: data.map_or(member.size, |data| data.size),
                    kind: member.kind,
                    data_index: data.map(|data| data.index),
                    link_target: data
                        .filter(|data| data.index != member.index)
                        .map(|data| data.path.clone()),
                }
            })
            .collect()
    }

    /// Follow links from `member` to the regular file holding its bytes
    fn resolve_data<'a>(
        &'a self,
        member: &'a ArchiveMember,
        by_path: &HashMap<PathBuf, usize>,
    ) -> Option<&'a ArchiveMember> {
        let mut current = member;
        for _ in 0..MAX_LINK_DEPTH {
            let base = match current.kind {
                MemberKind::File => return Some(current),
                // Symlinks are relative to their own directory, hardlinks to the archive root
                MemberKind::Symlink => Path::new(&current.path).parent().unwrap_or_else(|| Path::new("")),
                MemberKind::Hardlink => Path::new(""),
                MemberKind::Directory | MemberKind::Other => return None,
            };
            let target = normalize(&base.join(current.link_name.as_deref()?))?;
            current = self.members.get(*by_path.get(&target)?)?;
        }
        None
    }

    /// Stream the data of each layer member to `visit`, in one pass.
    ///
    /// `layers` must come from [`ImageArchive::locate_layers`] on this
    /// archive. Members are visited in the order their data appears; ones
    /// without a `data_index` are never visited. When several members link
    /// to the same entry its data is buffered once and handed to each.
    /// Returns `ArchiveRead` if the archive breaks mid-way, in which case
    /// the layers not yet visited were never handed to `visit`.
    pub fn for_each_layer<F>(&self, layers: &[LayerMember], mut visit: F) -> Result<()>
    where
        F: FnMut(&LayerMember, &mut dyn Read),
    {
        let read_error = |source: io::Error| UnlayerError::ArchiveRead {
            path: self.path.clone(),
            source,
        };

        let mut wanted: BTreeMap<usize, Vec<&LayerMember>> = BTreeMap::new();
        for layer in layers {
            if let Some(data_index) = layer.data_index {
                wanted.entry(data_index).or_default().push(layer);
            }
        }

        let mut archive = self.rewound().map_err(read_error)?;

        for (index, entry) in archive.entries().map_err(read_error)?.enumerate() {
            if wanted.is_empty() {
                break;
            }
            let mut entry = entry.map_err(read_error)?;
            let Some(readers) = wanted.remove(&index) else {
                continue;
            };

            if let [layer] = readers.as_slice() {
                visit(*layer, &mut entry);
            } else {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).map_err(read_error)?;
                for layer in readers {
                    visit(layer, &mut data.as_slice());
                }
            }
        }

        Ok(())
    }

    fn rewound(&self) -> io::Result<Archive<Box<dyn Read + '_>>> {
        let mut file = &self.file;
        file.rewind()?;
        Ok(tar_archive(file, self.compression))
    }

    fn list_members(&self) -> io::Result<Vec<ArchiveMember>> {
        let mut archive = self.rewound()?;
        let mut members = Vec::new();

        for (index, entry) in archive.entries()?.enumerate() {
            let entry = entry?;
            members.push(ArchiveMember {
                index,
                path: entry.path()?.to_string_lossy().into_owned(),
                size: entry.header().size()?,
                kind: entry.header().entry_type().into(),
                link_name: entry
                    .link_name()?
                    .map(|name| name.to_string_lossy().into_owned()),
            });
        }

        Ok(members)
    }
}

/// Resolve `.` and `..` lexically; `None` if the path climbs above the root
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Some(normalized)
}

/// Open `archive_path` and return its layer members
pub fn locate_layers(archive_path: &Path, suffix: &str) -> Result<Vec<LayerMember>> {
    Ok(ImageArchive::open(archive_path)?.locate_layers(suffix))
}
