//! Build programs for attachments and the asset tree.

use super::{BuildProgram, Declarations};
use crate::{
    artifact::{Artifact, STAGED_PREFIX},
    build::Builder,
    context::Context,
    error::{KilnError, Result},
    source::{self, Asset, SourceInfo, SourceObject},
    Record,
};
use serde::Deserialize;
use std::{
    fs, io,
    path::Path,
    process::{Command, Stdio},
};

fn copy_file_into(source: &Path, artifact: &mut Artifact<'_>) -> Result<()> {
    let mut src = fs::File::open(source).map_err(|err| KilnError::io(err, source))?;
    let mut dst = artifact.open_write(true)?;
    io::copy(&mut src, &mut dst).map_err(|err| KilnError::io(err, artifact.dst_filename()))?;
    Ok(())
}

/// Copies a record attachment byte for byte.
#[derive(Debug)]
pub struct AttachmentProgram {
    record: Record,
}

impl AttachmentProgram {
    pub fn new(record: Record) -> Self {
        Self { record }
    }

    fn attachment_filename(&self) -> Result<&Path> {
        self.record
            .attachment_filename
            .as_deref()
            .ok_or_else(|| KilnError::msg(format!("record {} has no attachment", self.record.path)))
    }
}

impl BuildProgram for AttachmentProgram {
    fn describe_source_record(&self, builder: &Builder<'_>) -> Result<Option<SourceInfo>> {
        let attachment = self.attachment_filename()?;
        if !attachment.exists() {
            return Ok(None);
        }
        Ok(Some(SourceInfo {
            path: self.record.path.clone(),
            alt: self.record.alt.clone(),
            filename: builder.to_source_filename(attachment)?,
            type_name: self.record.type_name.clone(),
            title_i18n: self.record.title_i18n.clone(),
        }))
    }

    fn produce_artifacts(&self, _builder: &Builder<'_>, decls: &mut Declarations) -> Result<()> {
        if self.record.visible {
            decls.declare_artifact(
                self.record.url_path.clone(),
                self.record.iter_source_filenames(),
            );
        }
        Ok(())
    }

    fn build_artifact(
        &self,
        _builder: &Builder<'_>,
        artifact: &mut Artifact<'_>,
        _ctx: &mut Context,
    ) -> Result<()> {
        copy_file_into(self.attachment_filename()?, artifact)
    }
}

/// Copies an asset file byte for byte.
#[derive(Debug)]
pub struct AssetFileProgram {
    asset: Asset,
}

impl AssetFileProgram {
    pub fn new(asset: Asset) -> Self {
        Self { asset }
    }
}

impl BuildProgram for AssetFileProgram {
    fn produce_artifacts(&self, _builder: &Builder<'_>, decls: &mut Declarations) -> Result<()> {
        decls.declare_artifact(self.asset.artifact_name.clone(), vec![self.asset.path.clone()]);
        Ok(())
    }

    fn build_artifact(
        &self,
        _builder: &Builder<'_>,
        artifact: &mut Artifact<'_>,
        _ctx: &mut Context,
    ) -> Result<()> {
        copy_file_into(&self.asset.path, artifact)
    }
}

/// Declares nothing itself; directory entries become child sources.
#[derive(Debug)]
pub struct AssetDirectoryProgram {
    asset: Asset,
}

impl AssetDirectoryProgram {
    pub fn new(asset: Asset) -> Self {
        Self { asset }
    }
}

impl BuildProgram for AssetDirectoryProgram {
    fn produce_artifacts(&self, _builder: &Builder<'_>, _decls: &mut Declarations) -> Result<()> {
        Ok(())
    }

    fn build_artifact(
        &self,
        _builder: &Builder<'_>,
        _artifact: &mut Artifact<'_>,
        _ctx: &mut Context,
    ) -> Result<()> {
        // never called: this program declares no artifacts
        Ok(())
    }

    fn iter_child_sources(&self, builder: &Builder<'_>) -> Result<Vec<SourceObject>> {
        Ok(source::asset_children(builder.env(), &self.asset))
    }
}

#[derive(Debug, Deserialize)]
struct SourceMap {
    #[serde(default)]
    sources: Vec<String>,
}

/// Compiles a `.less` stylesheet through the external `lessc` executable.
///
/// The compiler writes into a staged file in the destination directory and
/// emits a source map as a side channel; every file listed in the map is
/// recorded as a dependency so that `@import`ed stylesheets invalidate the
/// artifact. The map itself ships as a sub-artifact next to the css.
#[derive(Debug)]
pub struct LessAssetProgram {
    asset: Asset,
}

impl LessAssetProgram {
    pub fn new(asset: Asset) -> Self {
        Self { asset }
    }

    fn css_artifact_name(&self) -> String {
        let name = &self.asset.artifact_name;
        match name.strip_suffix(".less") {
            Some(stem) => format!("{stem}.css"),
            None => format!("{name}.css"),
        }
    }
}

impl BuildProgram for LessAssetProgram {
    fn produce_artifacts(&self, _builder: &Builder<'_>, decls: &mut Declarations) -> Result<()> {
        decls.declare_artifact(self.css_artifact_name(), vec![self.asset.path.clone()]);
        Ok(())
    }

    fn build_artifact(
        &self,
        builder: &Builder<'_>,
        artifact: &mut Artifact<'_>,
        ctx: &mut Context,
    ) -> Result<()> {
        artifact.ensure_dir()?;
        let dst_dir =
            artifact.dst_filename().parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

        // stage the compiler output in the destination directory so the
        // commit rename stays on one filesystem; the staged prefix makes
        // leftovers eligible for the next build's sweep
        let tmp = tempfile::Builder::new()
            .prefix(STAGED_PREFIX)
            .suffix(".css")
            .tempfile_in(&dst_dir)
            .map_err(|err| KilnError::io(err, &dst_dir))?;
        let (_file, css_path) = tmp.keep().map_err(|err| KilnError::io(err.error, &dst_dir))?;
        let map_path = css_path.with_extension("css.map");

        let mut cmd = Command::new(builder.env().lessc_executable());
        cmd.arg(format!("--source-map={}", map_path.display()))
            .arg(&self.asset.path)
            .arg(&css_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(?cmd, "compiling less stylesheet");
        let output =
            cmd.output().map_err(|err| KilnError::io(err, builder.env().lessc_executable()))?;
        if !output.status.success() {
            let _ = fs::remove_file(&css_path);
            let _ = fs::remove_file(&map_path);
            return Err(KilnError::LesscFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        // every file the compiler pulled in invalidates this artifact
        let map_base = map_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        for dep in source_map_sources(&map_path)? {
            ctx.record_dependency(map_base.join(dep));
        }
        artifact.replace_with_file(css_path);

        let map_artifact_name = format!("{}.map", self.css_artifact_name());
        let sources = vec![self.asset.path.clone()];
        let source_obj = Some(SourceObject::Asset(self.asset.clone()));
        ctx.add_sub_artifact(map_artifact_name, sources, source_obj, move |artifact, _ctx| {
            artifact.ensure_dir()?;
            artifact.replace_with_file(map_path);
            Ok(())
        });
        Ok(())
    }
}

fn source_map_sources(map_path: &Path) -> Result<Vec<String>> {
    let bytes = fs::read(map_path).map_err(|err| KilnError::io(err, map_path))?;
    let map: SourceMap = serde_json::from_slice(&bytes)?;
    Ok(map.sources)
}
