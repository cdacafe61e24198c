//! Maps intercepted requests to the resource class that picks their strategy.

use std::collections::HashSet;

use crate::config::Config;
use crate::net::{Destination, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  /// Listed in the static manifest: cache-first
  PrecachedStatic,
  /// Third-party CDN asset: stale-while-revalidate
  ExternalImmutable,
  /// Image: cache-first with placeholder fallback
  Image,
  /// Everything else: network-first
  Dynamic,
}

impl std::fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ResourceClass::PrecachedStatic => write!(f, "precached-static"),
      ResourceClass::ExternalImmutable => write!(f, "external-immutable"),
      ResourceClass::Image => write!(f, "image"),
      ResourceClass::Dynamic => write!(f, "dynamic"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Classifier {
  manifest: HashSet<String>,
  external: Vec<String>,
}

impl Classifier {
  pub fn new(manifest: &[String], external: &[String]) -> Self {
    Self {
      manifest: manifest.iter().cloned().collect(),
      external: external.to_vec(),
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(&config.static_manifest, &config.external_resources)
  }

  /// Classify a request; first match wins.
  ///
  /// Returns `None` for non-HTTP schemes, which are left to default handling.
  pub fn classify(&self, request: &Request) -> Option<ResourceClass> {
    if !request.is_http() {
      return None;
    }

    let path = request.url.path();
    if path == "/" || self.manifest.contains(path) {
      return Some(ResourceClass::PrecachedStatic);
    }

    let url = request.url.as_str();
    if self.external.iter().any(|prefix| url.starts_with(prefix)) {
      return Some(ResourceClass::ExternalImmutable);
    }

    if request.destination == Destination::Image {
      return Some(ResourceClass::Image);
    }

    Some(ResourceClass::Dynamic)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Url;

  fn classifier() -> Classifier {
    Classifier::new(
      &["/index.html".to_string(), "/app.js".to_string()],
      &["https://cdn.jsdelivr.net/npm/jsqr".to_string()],
    )
  }

  fn req(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_manifest_and_root_are_static() {
    let c = classifier();
    assert_eq!(c.classify(&req("https://app.test/")), Some(ResourceClass::PrecachedStatic));
    assert_eq!(
      c.classify(&req("https://app.test/app.js")),
      Some(ResourceClass::PrecachedStatic)
    );
    assert_eq!(
      c.classify(&req("https://app.test/app.js?v=2")),
      Some(ResourceClass::PrecachedStatic)
    );
  }

  #[test]
  fn test_path_must_match_exactly() {
    let c = classifier();
    assert_eq!(c.classify(&req("https://app.test/app.js.map")), Some(ResourceClass::Dynamic));
    assert_eq!(c.classify(&req("https://app.test/js/app.js")), Some(ResourceClass::Dynamic));
  }

  #[test]
  fn test_external_prefix() {
    let c = classifier();
    assert_eq!(
      c.classify(&req("https://cdn.jsdelivr.net/npm/jsqr@1.4.0/dist/jsQR.js")),
      Some(ResourceClass::ExternalImmutable)
    );
  }

  #[test]
  fn test_image_destination() {
    let c = classifier();
    let image = req("https://app.test/uploads/avatar.png").with_destination(Destination::Image);
    assert_eq!(c.classify(&image), Some(ResourceClass::Image));
    assert_eq!(
      c.classify(&req("https://app.test/uploads/avatar.png")),
      Some(ResourceClass::Dynamic)
    );
  }

  #[test]
  fn test_static_wins_over_image() {
    let c = Classifier::new(&["/logo.png".to_string()], &[]);
    let image = req("https://app.test/logo.png").with_destination(Destination::Image);
    assert_eq!(c.classify(&image), Some(ResourceClass::PrecachedStatic));
  }

  #[test]
  fn test_non_http_is_not_classified() {
    let c = classifier();
    assert_eq!(c.classify(&req("chrome-extension://abcdef/content.js")), None);
    assert_eq!(c.classify(&req("data:text/plain,hello")), None);
  }
}
