use crate::net::Request;

/// Normalized identity of a request: `METHOD absolute-url`.
///
/// The fragment never takes part. The query is kept unless `ignore_query` is set.
pub fn request_key(request: &Request, ignore_query: bool) -> String {
  let mut url = request.url.clone();
  url.set_fragment(None);
  if ignore_query {
    url.set_query(None);
  }
  format!("{} {}", request.method.as_str(), url)
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::{Method, Url};

  fn req(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_key_includes_method_and_query() {
    assert_eq!(
      request_key(&req("https://app.test/api/items?page=2"), false),
      "GET https://app.test/api/items?page=2"
    );
    let post = req("https://app.test/api/items").with_method(Method::POST);
    assert_eq!(request_key(&post, false), "POST https://app.test/api/items");
  }

  #[test]
  fn test_key_strips_fragment_always() {
    assert_eq!(
      request_key(&req("https://app.test/index.html#top"), false),
      "GET https://app.test/index.html"
    );
  }

  #[test]
  fn test_key_strips_query_when_configured() {
    assert_eq!(
      request_key(&req("https://app.test/app.js?v=123"), true),
      "GET https://app.test/app.js"
    );
  }
}
