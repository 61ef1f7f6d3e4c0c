//! Filesystem renderer: serves pre-built HTML from a content directory.
//!
//! `/about` resolves to `<root>/about.html`, falling back to
//! `<root>/about/index.html`; `/` resolves to `<root>/index.html`. A sibling
//! `.json` file, when present, becomes the page metadata.

use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tracing::debug;

use crate::cache::{RenderError, RenderOutput, Renderer};

const INDEX_STEM: &str = "index";

#[derive(Debug, Clone)]
pub struct TemplateDirRenderer {
    root: PathBuf,
}

impl TemplateDirRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Candidate page stems for `route`, most specific first. `None` when the
    /// route tries to escape the content directory.
    fn candidates(&self, route: &str) -> Option<Vec<PathBuf>> {
        let path = route.split_once('?').map_or(route, |(path, _)| path);
        let relative = Path::new(path.trim_matches('/'));

        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return None;
        }

        if relative.as_os_str().is_empty() {
            return Some(vec![self.root.join(INDEX_STEM)]);
        }

        let direct = self.root.join(relative);
        let nested = direct.join(INDEX_STEM);
        Some(vec![direct, nested])
    }
}

#[async_trait]
impl Renderer for TemplateDirRenderer {
    async fn render(&self, route: &str) -> Result<RenderOutput, RenderError> {
        let candidates = self
            .candidates(route)
            .ok_or_else(|| RenderError::not_found(route))?;

        for stem in candidates {
            let html_path = with_suffix(&stem, "html");
            let rendering = match fs::read_to_string(&html_path).await {
                Ok(body) => body,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(RenderError::failed(
                        route,
                        format!("failed to read `{}`: {err}", html_path.display()),
                    ));
                }
            };

            let metadata = read_metadata(route, &with_suffix(&stem, "json")).await?;
            debug!(route, path = %html_path.display(), "page rendered from content directory");
            return Ok(RenderOutput::new(rendering, metadata));
        }

        Err(RenderError::not_found(route))
    }
}

/// `about` + `html` → `about.html`, keeping any dots already in the stem.
fn with_suffix(stem: &Path, extension: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

async fn read_metadata(route: &str, path: &Path) -> Result<Value, RenderError> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Value::Null),
        Err(err) => {
            return Err(RenderError::failed(
                route,
                format!("failed to read `{}`: {err}", path.display()),
            ));
        }
    };

    serde_json::from_slice(&raw).map_err(|err| {
        RenderError::failed(
            route,
            format!("invalid metadata in `{}`: {err}", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn content_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::write(root.join("index.html"), "<h1>home</h1>").await.expect("index");
        fs::write(root.join("about.html"), "<h1>about</h1>").await.expect("about");
        fs::write(root.join("about.json"), r#"{"title":"About"}"#)
            .await
            .expect("about meta");
        fs::create_dir_all(root.join("events")).await.expect("events dir");
        fs::write(root.join("events/index.html"), "<h1>events</h1>")
            .await
            .expect("events index");
        fs::write(root.join("broken.html"), "<h1>broken</h1>").await.expect("broken");
        fs::write(root.join("broken.json"), "{not json").await.expect("broken meta");
        dir
    }

    #[tokio::test]
    async fn renders_root_and_pages_with_metadata() {
        let dir = content_dir().await;
        let renderer = TemplateDirRenderer::new(dir.path());

        let home = renderer.render("/").await.expect("home");
        assert_eq!(home.rendering, "<h1>home</h1>");
        assert_eq!(home.metadata, Value::Null);

        let about = renderer.render("/about?ref=nav").await.expect("about");
        assert_eq!(about.rendering, "<h1>about</h1>");
        assert_eq!(about.metadata, json!({ "title": "About" }));
    }

    #[tokio::test]
    async fn falls_back_to_directory_index() {
        let dir = content_dir().await;
        let renderer = TemplateDirRenderer::new(dir.path());

        let events = renderer.render("/events/").await.expect("events");
        assert_eq!(events.rendering, "<h1>events</h1>");
    }

    #[tokio::test]
    async fn unknown_and_escaping_routes_are_not_found() {
        let dir = content_dir().await;
        let renderer = TemplateDirRenderer::new(dir.path().join("events"));

        for route in ["/nope", "/../about", "/events/../../index"] {
            let err = renderer.render(route).await.expect_err("not found");
            assert!(matches!(err, RenderError::NotFound { .. }), "{route}");
        }
    }

    #[tokio::test]
    async fn invalid_metadata_is_a_render_failure() {
        let dir = content_dir().await;
        let renderer = TemplateDirRenderer::new(dir.path());

        let err = renderer.render("/broken").await.expect_err("bad metadata");
        assert!(matches!(err, RenderError::Failed { .. }));
    }
}
