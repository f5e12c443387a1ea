//! The page build program.

use super::{BuildProgram, Declarations};
use crate::{
    artifact::Artifact,
    build::Builder,
    context::Context,
    error::{KilnError, Result},
    source::{SourceInfo, SourceObject, VirtualSource},
    Record,
};
use std::io::Write;

/// Builds pages: records with a URL that render through a template.
///
/// The same program handles a record's own page and its numbered
/// pagination pages; only the page number and the URL differ.
#[derive(Debug)]
pub struct PageProgram {
    record: Record,
    /// `None` for the record itself, `Some(n >= 2)` for a numbered page.
    page_num: Option<usize>,
}

impl PageProgram {
    pub fn for_record(record: Record) -> Self {
        Self { record, page_num: None }
    }

    pub fn for_page(virt: VirtualSource) -> Self {
        Self { record: virt.record, page_num: Some(virt.page_num) }
    }

    fn url_path(&self) -> String {
        match self.page_num {
            None => self.record.url_path.clone(),
            Some(n) => format!("{}page/{n}/", self.record.url_path),
        }
    }
}

impl BuildProgram for PageProgram {
    fn describe_source_record(&self, builder: &Builder<'_>) -> Result<Option<SourceInfo>> {
        // numbered pages do not own a source file
        if self.page_num.is_some() {
            return Ok(None);
        }
        if !self.record.source_filename.exists() {
            return Ok(None);
        }
        let filename =
            builder.to_source_filename(&self.record.source_filename)?;
        Ok(Some(SourceInfo {
            path: self.record.path.clone(),
            alt: self.record.alt.clone(),
            filename,
            type_name: self.record.type_name.clone(),
            title_i18n: self.record.title_i18n.clone(),
        }))
    }

    fn produce_artifacts(&self, _builder: &Builder<'_>, decls: &mut Declarations) -> Result<()> {
        if self.record.visible {
            // the trailing slash makes the state append index.html
            decls.declare_artifact(self.url_path(), self.record.iter_source_filenames());
        }
        Ok(())
    }

    fn build_artifact(
        &self,
        builder: &Builder<'_>,
        artifact: &mut Artifact<'_>,
        _ctx: &mut Context,
    ) -> Result<()> {
        let mut values = self.record.fields.clone();
        values.insert("_path".to_string(), self.record.path.clone());
        values.insert("_url".to_string(), self.url_path());
        if self.record.pagination.is_some() {
            values.insert("page_num".to_string(), self.page_num.unwrap_or(1).to_string());
        }
        let body = builder.env().render_template(&self.record.template, &values)?;

        let mut f = artifact.open_write(true)?;
        f.write_all(&body).map_err(|err| KilnError::io(err, artifact.dst_filename()))?;
        f.write_all(b"\n").map_err(|err| KilnError::io(err, artifact.dst_filename()))?;
        Ok(())
    }

    fn iter_child_sources(&self, builder: &Builder<'_>) -> Result<Vec<SourceObject>> {
        // numbered pages yield nothing; the record's page 1 fans them out
        if self.page_num.is_some() {
            return Ok(Vec::new());
        }
        let pad = builder.pad();
        let mut rv = pad.children(&self.record)?;
        if let Some(pagination) = self.record.pagination {
            let pages = pagination.page_count(rv.len());
            for page_num in 2..=pages {
                rv.push(SourceObject::Virtual(VirtualSource {
                    record: self.record.clone(),
                    page_num,
                }));
            }
        }
        rv.extend(pad.attachments(&self.record)?);
        Ok(rv)
    }
}
