//! Renderer seam: turns a route into HTML plus metadata.

use async_trait::async_trait;
use thiserror::Error;

use super::entry::RenderOutput;

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("no page for route `{route}`")]
    NotFound { route: String },
    #[error("rendering `{route}` failed: {message}")]
    Failed { route: String, message: String },
}

impl RenderError {
    pub fn not_found(route: impl Into<String>) -> Self {
        Self::NotFound {
            route: route.into(),
        }
    }

    pub fn failed(route: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            route: route.into(),
            message: message.into(),
        }
    }
}

/// Produces the page for a route. Called inline on a miss and from
/// background workers on regeneration, so implementations must be shareable
/// across tasks. Any timeout policy belongs inside the implementation.
#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    async fn render(&self, route: &str) -> Result<RenderOutput, RenderError>;
}
