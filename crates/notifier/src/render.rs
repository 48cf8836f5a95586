//! Message renderer — turns a log entry into html and text bodies.
//!
//! Templates are compiled once at start-up. The template context is a closed set of
//! variables plus the allow-listed `extra` map, and `current_year` comes from the
//! entry's `created_at`, so rendering the same entry twice yields identical output.

use std::collections::BTreeMap;

use chrono::Datelike;
use minijinja::Environment;
use serde::Serialize;

use mailroom_common::config::BrandConfig;
use mailroom_common::types::{DeliveryLogEntry, EmailKind};

use crate::error::TransportError;

const HTML_TEMPLATE: &str = "generic_email.html";
const TEXT_TEMPLATE: &str = "generic_email.txt";

/// Rendered bodies for one email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBody {
    pub html: String,
    pub text: String,
}

/// Per-message template variables.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateContext {
    pub subject: String,
    pub action: String,
    pub message: String,
    pub otp: Option<String>,
    pub link: Option<String>,
    pub link_text: Option<String>,
    pub current_year: i32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn from_entry(entry: &DeliveryLogEntry) -> Self {
        Self {
            subject: entry.subject.clone(),
            action: entry.action.clone(),
            message: entry.message.clone(),
            otp: entry.otp.clone(),
            link: entry.link.clone(),
            link_text: entry.link_text.clone(),
            current_year: entry.created_at.year(),
            extra: entry.extra_map(),
        }
    }
}

pub trait Renderer: Send + Sync {
    fn render(
        &self,
        kind: EmailKind,
        ctx: &TemplateContext,
    ) -> Result<RenderedBody, TransportError>;
}

/// Brand and social variables shared by every message.
#[derive(Debug, Serialize)]
struct BrandContext<'a> {
    brand_name: &'a str,
    brand_logo: &'a str,
    site_url: &'a str,
    support_email: &'a str,
    support_phone_number: &'a str,
    terms_of_service: &'a str,
    social_true: bool,
    fb_link: Option<&'a str>,
    ig_link: Option<&'a str>,
    x_link: Option<&'a str>,
    linkedin_link: Option<&'a str>,
    tiktok_link: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct FullContext<'a> {
    kind: String,
    #[serde(flatten)]
    message: &'a TemplateContext,
    #[serde(flatten)]
    brand: BrandContext<'a>,
}

/// minijinja-backed renderer using the bundled generic templates.
pub struct TemplateRenderer {
    env: Environment<'static>,
    brand: BrandConfig,
}

impl TemplateRenderer {
    /// Build a renderer with the bundled templates.
    pub fn new(brand: BrandConfig) -> Result<Self, TransportError> {
        Self::with_templates(
            brand,
            include_str!("../templates/generic_email.html"),
            include_str!("../templates/generic_email.txt"),
        )
    }

    /// Build a renderer from custom template sources.
    pub fn with_templates(
        brand: BrandConfig,
        html_source: &'static str,
        text_source: &'static str,
    ) -> Result<Self, TransportError> {
        let mut env = Environment::new();
        env.add_template(HTML_TEMPLATE, html_source)
            .map_err(|e| TransportError::Configuration(format!("HTML template error: {}", e)))?;
        env.add_template(TEXT_TEMPLATE, text_source)
            .map_err(|e| TransportError::Configuration(format!("Text template error: {}", e)))?;
        Ok(Self { env, brand })
    }

    fn brand_context(&self) -> BrandContext<'_> {
        let b = &self.brand;
        BrandContext {
            brand_name: &b.brand_name,
            brand_logo: &b.brand_logo,
            site_url: &b.site_url,
            support_email: &b.support_email,
            support_phone_number: &b.support_phone_number,
            terms_of_service: &b.terms_of_service,
            social_true: b.has_social_links(),
            fb_link: b.facebook_link.as_deref(),
            ig_link: b.instagram_link.as_deref(),
            x_link: b.twitter_link.as_deref(),
            linkedin_link: b.linkedin_link.as_deref(),
            tiktok_link: b.tiktok_link.as_deref(),
        }
    }

    fn render_one(&self, name: &str, ctx: &FullContext<'_>) -> Result<String, TransportError> {
        let tmpl = self
            .env
            .get_template(name)
            .map_err(|e| {
                TransportError::Configuration(format!("Template {} missing: {}", name, e))
            })?;
        tmpl.render(ctx).map_err(|e| {
            TransportError::Configuration(format!("Template {} render error: {}", name, e))
        })
    }
}

impl Renderer for TemplateRenderer {
    fn render(
        &self,
        kind: EmailKind,
        ctx: &TemplateContext,
    ) -> Result<RenderedBody, TransportError> {
        let full = FullContext {
            kind: kind.to_string(),
            message: ctx,
            brand: self.brand_context(),
        };
        Ok(RenderedBody {
            html: self.render_one(HTML_TEMPLATE, &full)?,
            text: self.render_one(TEXT_TEMPLATE, &full)?,
        })
    }
}
