//! Source objects and the content layer interface.
//!
//! The engine builds from [`SourceObject`]s, a closed sum over everything
//! that can produce artifacts: content records (pages and attachments),
//! assets (files and directories), and virtual sources generated during the
//! build (numbered pagination pages). The content database itself stays
//! behind the [`Pad`] trait; [`FsPad`] is the minimal filesystem-backed
//! implementation the engine and its tests run against.

use crate::{
    error::Result,
    Environment,
};
use path_slash::PathBufExt as _;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::PathBuf,
    sync::Arc,
};

/// The primary alternative. The engine carries alts through to the source
/// info index but resolves only the primary one itself.
pub const PRIMARY_ALT: &str = "_primary";

/// The file name of a record's data within its content directory.
pub const CONTENTS_FILENAME: &str = "contents.lr";

/// Classification of a source object, used by the build program registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Page,
    Attachment,
    AssetFile,
    AssetDirectory,
    Virtual,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Page => "page",
            SourceKind::Attachment => "attachment",
            SourceKind::AssetFile => "asset file",
            SourceKind::AssetDirectory => "asset directory",
            SourceKind::Virtual => "virtual",
        };
        f.write_str(name)
    }
}

/// Anything the engine can build from.
#[derive(Clone, Debug)]
pub enum SourceObject {
    Record(Record),
    Asset(Asset),
    Virtual(VirtualSource),
}

impl SourceObject {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceObject::Record(record) if record.is_attachment() => SourceKind::Attachment,
            SourceObject::Record(_) => SourceKind::Page,
            SourceObject::Asset(asset) if asset.is_directory => SourceKind::AssetDirectory,
            SourceObject::Asset(_) => SourceKind::AssetFile,
            SourceObject::Virtual(_) => SourceKind::Virtual,
        }
    }

    /// The stable identifier of this source.
    pub fn path(&self) -> String {
        match self {
            SourceObject::Record(record) => record.path.clone(),
            SourceObject::Asset(asset) => asset.artifact_name.clone(),
            SourceObject::Virtual(virt) => virt.path(),
        }
    }

    /// The URL path of this source, if it maps to one.
    pub fn url_path(&self) -> Option<String> {
        match self {
            SourceObject::Record(record) => Some(record.url_path.clone()),
            SourceObject::Asset(asset) => Some(asset.artifact_name.clone()),
            SourceObject::Virtual(virt) => Some(virt.url_path()),
        }
    }

    /// The filesystem paths whose changes should force a rebuild of this
    /// source.
    pub fn iter_source_filenames(&self) -> Vec<PathBuf> {
        match self {
            SourceObject::Record(record) => record.iter_source_filenames(),
            SourceObject::Asset(asset) => vec![asset.path.clone()],
            SourceObject::Virtual(virt) => virt.record.iter_source_filenames(),
        }
    }
}

/// Pagination settings of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaginationConfig {
    pub per_page: usize,
}

impl PaginationConfig {
    /// The number of pages needed for the given child count; always at
    /// least one.
    pub fn page_count(&self, children: usize) -> usize {
        children.div_ceil(self.per_page).max(1)
    }
}

/// A content record: a page or an attachment.
#[derive(Clone, Debug)]
pub struct Record {
    /// The stable content path, e.g. `/about`.
    pub path: String,
    pub alt: String,
    /// The record's own data file (`contents.lr`, or the `.lr` sidecar for
    /// attachments; the sidecar may not exist).
    pub source_filename: PathBuf,
    /// The attached file; `Some` makes this record an attachment.
    pub attachment_filename: Option<PathBuf>,
    /// The URL path; pages end with a trailing slash.
    pub url_path: String,
    /// Hidden records produce no artifacts.
    pub visible: bool,
    pub template: String,
    pub type_name: String,
    pub title_i18n: BTreeMap<String, String>,
    /// The raw record fields as parsed from the data file.
    pub fields: BTreeMap<String, String>,
    pub pagination: Option<PaginationConfig>,
}

impl Record {
    pub fn is_attachment(&self) -> bool {
        self.attachment_filename.is_some()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn iter_source_filenames(&self) -> Vec<PathBuf> {
        let mut rv = vec![self.source_filename.clone()];
        if let Some(attachment) = &self.attachment_filename {
            rv.push(attachment.clone());
        }
        rv
    }
}

/// A generated source without its own file: pagination page `N >= 2` of a
/// record.
#[derive(Clone, Debug)]
pub struct VirtualSource {
    pub record: Record,
    pub page_num: usize,
}

impl VirtualSource {
    /// The stable identifier, e.g. `/projects@2`.
    pub fn path(&self) -> String {
        format!("{}@{}", self.record.path, self.page_num)
    }

    /// The URL path of the numbered page, e.g. `/projects/page/2/`.
    pub fn url_path(&self) -> String {
        format!("{}page/{}/", self.record.url_path, self.page_num)
    }
}

/// A file or directory in the asset tree.
#[derive(Clone, Debug)]
pub struct Asset {
    pub name: String,
    /// The absolute filesystem path.
    pub path: PathBuf,
    /// The artifact name this asset maps to, e.g. `/static/app.js`.
    pub artifact_name: String,
    pub is_directory: bool,
}

/// The flat projection of a record kept in the source info index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub path: String,
    pub alt: String,
    /// The record's file in normalized source-path form.
    pub filename: String,
    pub type_name: String,
    pub title_i18n: BTreeMap<String, String>,
}

/// The read-only view of the content database the engine consumes.
pub trait Pad: fmt::Debug {
    /// The root record of the content tree, if the project has one.
    fn root(&self) -> Result<Option<SourceObject>>;

    /// The root of the asset tree.
    fn asset_root(&self) -> Result<SourceObject>;

    /// Resolves a record by its content path (`/`, `/about`, ...).
    fn get(&self, path: &str) -> Result<Option<SourceObject>>;

    /// The child pages of a record.
    fn children(&self, record: &Record) -> Result<Vec<SourceObject>>;

    /// The attachments of a record.
    fn attachments(&self, record: &Record) -> Result<Vec<SourceObject>>;
}

/// Returns the asset child of `parent` with the given name, or `None` for
/// uninteresting or unreadable entries.
///
/// The special sources `_htaccess` and `_htpasswd` map to their dotted
/// artifact counterparts.
pub fn get_asset(env: &Environment, parent: &Asset, name: &str) -> Option<Asset> {
    if env.is_uninteresting_source_name(name) {
        return None;
    }
    let path = parent.path.join(name);
    let md = fs::metadata(&path).ok()?;
    let out_name = match name {
        "_htaccess" => ".htaccess",
        "_htpasswd" => ".htpasswd",
        _ => name,
    };
    let artifact_name = if parent.artifact_name.ends_with('/') {
        format!("{}{out_name}", parent.artifact_name)
    } else {
        format!("{}/{out_name}", parent.artifact_name)
    };
    Some(Asset { name: name.to_string(), path, artifact_name, is_directory: md.is_dir() })
}

/// The children of an asset directory, sorted by name. Unreadable
/// directories yield nothing.
pub fn asset_children(env: &Environment, asset: &Asset) -> Vec<SourceObject> {
    let entries = match fs::read_dir(&asset.path) {
        Ok(entries) => entries,
        Err(err) => {
            trace!(dir = %asset.path.display(), %err, "unreadable asset directory");
            return Vec::new();
        }
    };
    let mut names: Vec<String> =
        entries.filter_map(|e| e.ok()).map(|e| e.file_name().to_string_lossy().into_owned()).collect();
    names.sort();
    names
        .iter()
        .filter_map(|name| get_asset(env, asset, name))
        .map(SourceObject::Asset)
        .collect()
}

/// Parses the simple `key: value` record format used by `contents.lr`
/// files. Lines that do not start a new field continue the previous value;
/// `---` lines separate blocks and are skipped.
pub(crate) fn parse_metaformat(text: &str) -> BTreeMap<String, String> {
    fn field_start(line: &str) -> Option<(String, String)> {
        let idx = line.find(':')?;
        let key = line[..idx].trim();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return None;
        }
        Some((key.to_string(), line[idx + 1..].trim_start().to_string()))
    }

    let mut fields = BTreeMap::new();
    let mut current: Option<(String, String)> = None;
    for line in text.lines() {
        if line.trim() == "---" {
            continue;
        }
        if let Some((key, value)) = field_start(line) {
            if let Some((prev, buf)) = current.take() {
                fields.insert(prev, buf.trim_end().to_string());
            }
            current = Some((key, value));
        } else if let Some((_, buf)) = current.as_mut() {
            buf.push('\n');
            buf.push_str(line);
        }
    }
    if let Some((prev, buf)) = current {
        fields.insert(prev, buf.trim_end().to_string());
    }
    fields
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "yes" | "true" | "1")
}

fn attachment_type(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "svg" | "webp" => "image",
        _ => "file",
    }
}

/// A content database reading records directly from the project's
/// `content/` directory.
///
/// Records are directories holding a `contents.lr` data file; every other
/// non-ignored file in a record directory is an attachment of that record.
#[derive(Clone, Debug)]
pub struct FsPad {
    env: Arc<Environment>,
}

impl FsPad {
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Loads the record stored in `content/<rel>`, `None` if there is no
    /// data file.
    fn load_record(&self, rel: &str) -> Result<Option<Record>> {
        let dir = if rel.is_empty() {
            self.env.content_path()
        } else {
            self.env.content_path().join(PathBuf::from_slash(rel))
        };
        let source_filename = dir.join(CONTENTS_FILENAME);
        let text = match fs::read_to_string(&source_filename) {
            Ok(text) => text,
            Err(_) => return Ok(None),
        };
        let fields = parse_metaformat(&text);

        let path = if rel.is_empty() { "/".to_string() } else { format!("/{rel}") };
        let url_path = if rel.is_empty() { "/".to_string() } else { format!("/{rel}/") };
        let pagination = fields
            .get("_per_page")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&per_page| per_page > 0)
            .map(|per_page| PaginationConfig { per_page });
        let mut title_i18n = BTreeMap::new();
        if let Some(title) = fields.get("title") {
            title_i18n.insert("en".to_string(), title.clone());
        }

        Ok(Some(Record {
            path,
            alt: PRIMARY_ALT.to_string(),
            source_filename,
            attachment_filename: None,
            url_path,
            visible: !fields.get("_hidden").map(|v| parse_bool(v)).unwrap_or(false),
            template: fields.get("_template").cloned().unwrap_or_else(|| "page.html".to_string()),
            type_name: fields.get("_model").cloned().unwrap_or_else(|| "page".to_string()),
            title_i18n,
            fields,
            pagination,
        }))
    }

    fn record_dir(&self, record: &Record) -> Option<PathBuf> {
        record.source_filename.parent().map(|p| p.to_path_buf())
    }

    fn load_attachment(&self, parent: &Record, name: &str) -> Option<Record> {
        let dir = self.record_dir(parent)?;
        let attachment_filename = dir.join(name);
        let source_filename = dir.join(format!("{name}.lr"));
        let fields = fs::read_to_string(&source_filename)
            .map(|text| parse_metaformat(&text))
            .unwrap_or_default();

        let path = if parent.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", parent.path)
        };
        let url_path = format!("{}{name}", parent.url_path);
        let mut title_i18n = BTreeMap::new();
        if let Some(title) = fields.get("title") {
            title_i18n.insert("en".to_string(), title.clone());
        }

        Some(Record {
            path,
            alt: PRIMARY_ALT.to_string(),
            source_filename,
            attachment_filename: Some(attachment_filename),
            url_path,
            visible: !fields.get("_hidden").map(|v| parse_bool(v)).unwrap_or(false),
            template: String::new(),
            type_name: attachment_type(name).to_string(),
            title_i18n,
            fields,
            pagination: None,
        })
    }
}

impl Pad for FsPad {
    fn root(&self) -> Result<Option<SourceObject>> {
        Ok(self.load_record("")?.map(SourceObject::Record))
    }

    fn asset_root(&self) -> Result<SourceObject> {
        Ok(SourceObject::Asset(Asset {
            name: String::new(),
            path: self.env.asset_path(),
            artifact_name: "/".to_string(),
            is_directory: true,
        }))
    }

    fn get(&self, path: &str) -> Result<Option<SourceObject>> {
        let rel = path.trim_matches('/');
        Ok(self.load_record(rel)?.map(SourceObject::Record))
    }

    fn children(&self, record: &Record) -> Result<Vec<SourceObject>> {
        if record.is_attachment() {
            return Ok(Vec::new());
        }
        let Some(dir) = self.record_dir(record) else { return Ok(Vec::new()) };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !self.env.is_uninteresting_source_name(name))
            .collect();
        names.sort();

        let mut rv = Vec::new();
        for name in names {
            let rel = if record.path == "/" {
                name.clone()
            } else {
                format!("{}/{name}", record.path.trim_start_matches('/'))
            };
            if let Some(child) = self.load_record(&rel)? {
                rv.push(SourceObject::Record(child));
            }
        }
        Ok(rv)
    }

    fn attachments(&self, record: &Record) -> Result<Vec<SourceObject>> {
        if record.is_attachment() {
            return Ok(Vec::new());
        }
        let Some(dir) = self.record_dir(record) else { return Ok(Vec::new()) };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| {
                name != CONTENTS_FILENAME
                    && !name.ends_with(".lr")
                    && !self.env.is_uninteresting_source_name(name)
            })
            .collect();
        names.sort();

        Ok(names
            .iter()
            .filter_map(|name| self.load_attachment(record, name))
            .map(SourceObject::Record)
            .collect())
    }
}
