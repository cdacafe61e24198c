//! Scripted network for tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use super::{Network, Request, Response};

type Responder = Arc<dyn Fn(&Request) -> std::result::Result<Response, String> + Send + Sync>;

#[derive(Default)]
pub struct MockNetwork {
  routes: Mutex<HashMap<String, Responder>>,
  gates: Mutex<HashMap<String, Arc<Semaphore>>>,
  requests: Mutex<Vec<Request>>,
}

impl MockNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Answer `url` with `response` from now on.
  pub fn respond(&self, url: &str, response: Response) {
    self.respond_with(url, move |_| Ok(response.clone()));
  }

  /// Fail `url` with a transport error from now on.
  pub fn fail(&self, url: &str) {
    self.respond_with(url, |_| Err("connection refused".to_string()));
  }

  /// Answer `url` by calling `responder` with each request.
  pub fn respond_with<F>(&self, url: &str, responder: F)
  where
    F: Fn(&Request) -> std::result::Result<Response, String> + Send + Sync + 'static,
  {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Arc::new(responder));
  }

  /// Block fetches of `url` until [`MockNetwork::release`] is called.
  pub fn hold(&self, url: &str) {
    self
      .gates
      .lock()
      .unwrap()
      .insert(url.to_string(), Arc::new(Semaphore::new(0)));
  }

  pub fn release(&self, url: &str) {
    if let Some(gate) = self.gates.lock().unwrap().remove(url) {
      gate.close();
    }
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn calls(&self) -> Vec<(Method, String)> {
    self
      .requests()
      .into_iter()
      .map(|r| (r.method, r.url.to_string()))
      .collect()
  }

  pub fn call_count(&self, url: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = request.url.to_string();
    self.requests.lock().unwrap().push(request.clone());

    let gate = self.gates.lock().unwrap().get(&url).cloned();
    if let Some(gate) = gate {
      // released gates are closed, which wakes every waiter
      let _ = gate.acquire().await;
    }

    let responder = self.routes.lock().unwrap().get(&url).cloned();
    match responder {
      Some(responder) => responder(request).map_err(|msg| eyre!("Failed to fetch {}: {}", url, msg)),
      None => Err(eyre!("Failed to fetch {}: no route", url)),
    }
  }
}
