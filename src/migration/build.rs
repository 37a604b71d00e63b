//! Identity of the running build.

use serde::{Deserialize, Serialize};

/// Update id reported when running the originally installed build.
pub const EMBEDDED_UPDATE_ID: &str = "embedded";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIdentity {
  /// Hot-patch id, `None` for the embedded build
  pub update_id: Option<String>,
  pub app_version: String,
  /// Schema version this build migrates to
  pub schema_version: i64,
}

impl BuildIdentity {
  pub fn new(update_id: Option<String>, app_version: impl Into<String>, schema_version: i64) -> Self {
    Self {
      update_id,
      app_version: app_version.into(),
      schema_version,
    }
  }

  pub fn is_embedded(&self) -> bool {
    self.update_id.is_none()
  }

  pub fn current_update_id(&self) -> &str {
    self.update_id.as_deref().unwrap_or(EMBEDDED_UPDATE_ID)
  }
}
