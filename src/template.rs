//! Per-recipient body rendering.
//!
//! Bodies use `{{ name }}` / `{{ email }}` variables. Unknown variables render
//! empty; only malformed syntax is an error.
use crate::model::Recipient;
use minijinja::{context, Environment};
use thiserror::Error;

const BODY: &str = "body";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("template error: {0}")]
pub struct TemplateError(pub String);

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        TemplateError(err.to_string())
    }
}

/// A campaign body compiled once and rendered for many recipients.
pub struct BodyTemplate {
    env: Environment<'static>,
    fallback_name: String,
}

impl BodyTemplate {
    pub fn compile(source: &str, fallback_name: &str) -> Result<Self, TemplateError> {
        let mut env = Environment::new();
        env.add_template_owned(BODY, source.to_owned())?;
        Ok(Self {
            env,
            fallback_name: fallback_name.to_owned(),
        })
    }

    pub fn render(&self, recipient: &Recipient) -> Result<String, TemplateError> {
        let name = match recipient.name.trim() {
            "" => self.fallback_name.as_str(),
            n => n,
        };
        let tmpl = self.env.get_template(BODY)?;
        Ok(tmpl.render(context! { name => name, email => &recipient.email })?)
    }
}
