//! Network reachability signal.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Boolean signal telling the resolver whether the online path is worth trying.
#[async_trait]
pub trait Reachability: Send + Sync {
  async fn is_online(&self) -> bool;
}

/// Reachability fixed by the caller, e.g. the `--offline` flag.
#[derive(Debug)]
pub struct StaticReachability {
  online: bool,
}

impl StaticReachability {
  pub fn new(online: bool) -> Self {
    Self { online }
  }
}

#[async_trait]
impl Reachability for StaticReachability {
  async fn is_online(&self) -> bool {
    self.online
  }
}

/// Probes the remote root with a short `HEAD` request.
pub struct ProbeReachability {
  client: Client,
  url: Url,
}

impl ProbeReachability {
  pub fn new(url: Url, timeout: Duration) -> reqwest::Result<Self> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self { client, url })
  }
}

#[async_trait]
impl Reachability for ProbeReachability {
  async fn is_online(&self) -> bool {
    match self.client.head(self.url.clone()).send().await {
      // Any HTTP answer means the host is reachable
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "Reachability probe failed");
        false
      }
    }
  }
}
