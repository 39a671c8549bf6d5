use std::future::Future;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};

use crate::config::NetworkConfig;
use crate::error::NetworkFailure;

use super::types::{Request, Response};

/// The network fetch primitive.
///
/// A completed exchange is `Ok` whatever its status; only transport failures are `Err`.
pub trait Fetch: Send + Sync + 'static {
  fn fetch(&self, request: &Request)
    -> impl Future<Output = Result<Response, NetworkFailure>> + Send;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(
      config
        .user_agent
        .clone()
        .unwrap_or_else(|| format!("shellcache/{}", env!("CARGO_PKG_VERSION"))),
    );

    // No timeout unless one is configured
    if let Some(secs) = config.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetch for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkFailure> {
    let url = request.url.to_string();

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| classify_error(&url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| classify_error(&url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

fn classify_error(url: &str, e: reqwest::Error) -> NetworkFailure {
  if e.is_timeout() {
    NetworkFailure::Timeout {
      url: url.to_string(),
    }
  } else if e.is_connect() {
    NetworkFailure::Connect {
      url: url.to_string(),
      message: e.to_string(),
    }
  } else {
    NetworkFailure::Other {
      url: url.to_string(),
      message: e.to_string(),
    }
  }
}
