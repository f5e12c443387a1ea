//! The template rendering hook.
//!
//! The engine does not ship a template language. Rendering goes through the
//! [`TemplateRenderer`] trait so that the real template engine can be
//! plugged in by the surrounding application. The one contract renderers
//! must honor is dependency reporting: every template file loaded during a
//! render must be recorded on the active build context (via
//! [`crate::context::record_dependency`]) so that template changes
//! invalidate the artifacts rendered with them.

use crate::{
    context,
    error::{KilnError, Result},
    Environment,
};
use std::{collections::BTreeMap, fmt, fs};

/// The values handed to a template render, keyed by field name.
pub type TemplateValues = BTreeMap<String, String>;

pub trait TemplateRenderer: fmt::Debug {
    /// Renders the named template with the given values and returns the
    /// produced bytes.
    fn render_template(
        &self,
        env: &Environment,
        name: &str,
        values: &TemplateValues,
    ) -> Result<Vec<u8>>;
}

/// A minimal renderer that reads templates from the project's `templates/`
/// directory and substitutes `{{ key }}` placeholders.
///
/// This is sufficient for tests and simple sites; real deployments install
/// a full template engine through [`crate::EnvironmentBuilder::renderer`].
#[derive(Debug, Default)]
pub struct FileTemplateRenderer {
    _priv: (),
}

impl TemplateRenderer for FileTemplateRenderer {
    fn render_template(
        &self,
        env: &Environment,
        name: &str,
        values: &TemplateValues,
    ) -> Result<Vec<u8>> {
        let path = env.template_path().join(name);
        context::record_dependency(&path);
        let mut out = fs::read_to_string(&path).map_err(|err| KilnError::io(err, &path))?;
        for (key, value) in values {
            out = out.replace(&format!("{{{{ {key} }}}}"), value);
        }
        Ok(out.into_bytes())
    }
}
