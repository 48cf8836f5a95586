//! Email dispatch pipeline: validation, delivery log, rendering, SMTP transport,
//! queue health and bounded-retry scheduling.

pub mod attempt;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod render;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod validate;
pub mod worker;

use std::sync::Arc;

use mailroom_common::config::AppConfig;

use crate::attempt::Deliverer;
use crate::render::TemplateRenderer;
use crate::store::DeliveryLogStore;
use crate::transport::SmtpTransport;

/// Build the production deliverer: bundled templates and the configured SMTP relay.
pub fn smtp_deliverer(
    config: &AppConfig,
    store: Arc<dyn DeliveryLogStore>,
) -> anyhow::Result<Arc<Deliverer>> {
    let renderer = TemplateRenderer::new(config.brand.clone())?;
    let transport = SmtpTransport::from_config(&config.smtp, config.email_from.as_deref())?;
    Ok(Arc::new(Deliverer::new(
        store,
        Arc::new(renderer),
        Arc::new(transport),
    )))
}
