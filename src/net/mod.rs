//! Request/response model and the network capability.
//!
//! Strategies never talk to `reqwest` directly. They go through [`Network`],
//! so tests can swap in a scripted fake.

mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::collections::BTreeMap;
use std::str::FromStr;
use url::Url;

pub use http::HttpNetwork;

/// Declared destination of an intercepted request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  #[default]
  Other,
}

impl FromStr for Destination {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_lowercase().as_str() {
      "document" => Ok(Self::Document),
      "image" => Ok(Self::Image),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "font" => Ok(Self::Font),
      "" | "other" => Ok(Self::Other),
      other => Err(eyre!("Unknown request destination: {}", other)),
    }
  }
}

/// An outbound request intercepted from a controlled page.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  /// Top-level navigation (page load) rather than a subresource
  pub navigate: bool,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  /// Page that issued the request, if known
  pub client_id: Option<String>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      destination: Destination::Other,
      navigate: false,
      headers: BTreeMap::new(),
      body: None,
      client_id: None,
    }
  }

  /// A page navigation to `url`.
  pub fn navigation(url: Url) -> Self {
    Self {
      destination: Destination::Document,
      navigate: true,
      ..Self::get(url)
    }
  }

  /// A JSON POST, as used for deferred-mutation replay.
  pub fn post_json(url: Url, body: &serde_json::Value) -> Result<Self> {
    let body = serde_json::to_vec(body).map_err(|e| eyre!("Failed to serialize body: {}", e))?;
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Ok(Self {
      method: Method::POST,
      body: Some(body),
      headers,
      ..Self::get(url)
    })
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }

  /// Navigation or document request, eligible for the offline shell.
  pub fn is_navigation(&self) -> bool {
    self.navigate || self.destination == Destination::Document
  }
}

/// A response, live or cached. Header names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, value.to_string()).with_header("content-type", "application/json")
  }
}

/// The live network. `Err` means transport failure; any HTTP status is `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}
