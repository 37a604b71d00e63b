use color_eyre::{eyre::eyre, Result};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::attachments::{short_id, AttachmentIntegrityService};
use crate::cache::{HybridResolver, MemoryStorage};
use crate::cascade::{
  discover_quest, CascadeEngine, CascadeSummary, Category, DiscoveryOutcome, DiscoveryProgress,
};
use crate::commands::{AttachmentsCommand, Command, DegradedCommand};
use crate::config::Config;
use crate::error::LifecycleError;
use crate::ledger::DownloadProfileLedger;
use crate::local::{schema, LocalStore};
use crate::migration::{run_startup_migrations, FileKvStore, MigrationGuard, StartupMode};
use crate::model::RecordKey;
use crate::network::{ProbeReachability, Reachability, StaticReachability};
use crate::offload::{OffloadPlan, OffloadReport, QuestOffloader};
use crate::remote::rest::RestRemoteStore;
use crate::remote::RemoteStore;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Wired lifecycle components for one process.
pub struct App {
  local: Arc<LocalStore>,
  remote: Arc<dyn RemoteStore>,
  reachability: Arc<dyn Reachability>,
  guard: MigrationGuard,
  ledger: Arc<DownloadProfileLedger>,
  engine: CascadeEngine,
  offloader: QuestOffloader,
  attachments: AttachmentIntegrityService,
  profile_id: Option<String>,
}

impl App {
  pub fn new(config: &Config, offline: bool) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let local = Arc::new(LocalStore::open(&LocalStore::default_path(&data_dir))?);
    let kv = Arc::new(FileKvStore::new(FileKvStore::default_path(&data_dir)));
    let guard = MigrationGuard::new(kv, config.build_identity(schema::SCHEMA_VERSION))
      .with_threshold(config.migration.retry_threshold);

    let (api_key, offline) = match Config::get_api_key() {
      Ok(key) => (key, offline),
      Err(e) => {
        warn!(error = %e, "No API key, running offline");
        (String::new(), true)
      }
    };

    let remote = RestRemoteStore::new(
      config.remote.url.clone(),
      api_key,
      Config::get_access_token(),
      config.remote_timeout(),
    )?
    .with_schema(config.remote.schema.clone());

    let reachability: Arc<dyn Reachability> = if offline {
      Arc::new(StaticReachability::new(false))
    } else {
      Arc::new(
        ProbeReachability::new(config.remote.url.clone(), PROBE_TIMEOUT)
          .map_err(|e| eyre!("Failed to build reachability probe: {}", e))?,
      )
    };

    let resolver = HybridResolver::new(Arc::new(MemoryStorage::new()), Arc::clone(&reachability))
      .with_policy(config.staleness_policy());

    Ok(Self::from_parts(
      local,
      Arc::new(remote),
      reachability,
      guard,
      resolver,
      config.profile_id.clone(),
    ))
  }

  pub fn from_parts(
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    reachability: Arc<dyn Reachability>,
    guard: MigrationGuard,
    resolver: HybridResolver,
    profile_id: Option<String>,
  ) -> Self {
    let ledger = Arc::new(DownloadProfileLedger::new(
      Arc::clone(&remote),
      Arc::clone(&local),
      resolver,
    ));
    Self {
      engine: CascadeEngine::new(Arc::clone(&ledger)),
      offloader: QuestOffloader::new(Arc::clone(&local), Arc::clone(&remote)),
      attachments: AttachmentIntegrityService::new(Arc::clone(&local)),
      local,
      remote,
      reachability,
      guard,
      ledger,
      profile_id,
    }
  }

  fn profile(&self) -> Result<&str> {
    self
      .profile_id
      .as_deref()
      .ok_or_else(|| eyre!("No profile configured. Set profile_id or pass --profile."))
  }

  /// Run `command` and render its result for the terminal.
  ///
  /// The migration gate resolves first. `degraded` subcommands inspect the
  /// gate itself and skip it.
  pub async fn execute(&self, command: &Command) -> Result<String> {
    let mode = match command {
      Command::Degraded(_) => None,
      _ => Some(run_startup_migrations(&self.guard, &self.local, LocalStore::run_migrations)?),
    };
    debug!(?command, ?mode, "Executing command");

    if mode == Some(StartupMode::Degraded) && command.needs_local_store() {
      return Err(
        LifecycleError::MigrationFailure(
          "local store unavailable in degraded mode, see `questsync degraded status`".into(),
        )
        .into(),
      );
    }
    if command.needs_remote() && !self.reachability.is_online().await {
      return Err(LifecycleError::Network("remote store unreachable".into()).into());
    }

    match command {
      Command::Migrate => {
        let mut out = format!("Startup mode: {}\n", mode.unwrap_or(StartupMode::Normal));
        if mode == Some(StartupMode::Normal) {
          writeln!(out, "Schema version: {}", self.local.schema_version()?)?;
        }
        Ok(out)
      }
      Command::Discover { quest_id } => {
        let outcome = self.discover(quest_id).await?;
        Ok(render_discovery(&outcome)?)
      }
      Command::Download { quest_id } => {
        let profile = self.profile()?;
        let outcome = self.discover(quest_id).await?;
        let summary = self.engine.download(&outcome.ids, profile).await;
        render_cascade(&outcome, &summary)
      }
      Command::Undownload { quest_id } => {
        let profile = self.profile()?;
        let outcome = self.discover(quest_id).await?;
        let summary = self.engine.undownload(&outcome.ids, profile).await;
        render_cascade(&outcome, &summary)
      }
      Command::Offload {
        quest_id,
        force,
        dry_run,
      } => {
        let plan = self.offloader.verify(quest_id)?;
        if *dry_run {
          return render_plan(&plan);
        }
        let profile = self.profile()?;
        let report = self
          .offloader
          .offload(&plan, profile, *force, &|percent: u8, message: &str| {
            info!(percent, step = message, "Offload progress");
          })
          .await?;
        render_offload(&report)
      }
      Command::Status { table, key } => {
        let profile = self.profile()?;
        let record_key = RecordKey::parse(*table, key)?;
        let status = self.ledger.download_status(*table, &record_key, profile).await?;
        Ok(format!(
          "{} {}: {} (source: {}{})\n",
          table,
          record_key,
          if status.data { "wanted" } else { "not wanted" },
          status.source.as_str(),
          if status.is_cached() { ", cached" } else { "" }
        ))
      }
      Command::Attachments(sub) => self.attachments_command(sub),
      Command::Degraded(sub) => self.degraded_command(sub),
    }
  }

  async fn discover(&self, quest_id: &str) -> Result<DiscoveryOutcome> {
    let outcome = discover_quest(self.remote.as_ref(), quest_id, &|progress: &DiscoveryProgress| {
      debug!(%progress, "Discovery progress");
    })
    .await;
    if !outcome.should_proceed {
      return Err(LifecycleError::RootNotFound(quest_id.to_string()).into());
    }
    Ok(outcome)
  }

  fn attachments_command(&self, command: &AttachmentsCommand) -> Result<String> {
    let mut out = String::new();
    match command {
      AttachmentsCommand::Scan => {
        let corrupted = self.attachments.scan_corrupted()?;
        writeln!(out, "{} corrupted attachments", corrupted.len())?;
        for entry in &corrupted {
          writeln!(out, "{}", entry.attachment.id)?;
          for link in &entry.content_links {
            writeln!(
              out,
              "  content link {} on asset {}",
              link.id,
              link.asset_name.as_deref().unwrap_or(&link.asset_id)
            )?;
          }
        }
      }
      AttachmentsCommand::Count => {
        writeln!(out, "{}", self.attachments.corrupted_count()?)?;
      }
      AttachmentsCommand::Clean {
        attachment_id: Some(id),
      } => {
        // A healthy attachment is still playable; only orphaned ids may go
        if let Some(record) = self.attachments.get(id)? {
          if !record.is_corrupted() {
            return Err(eyre!("Attachment {} is not corrupted", short_id(id)));
          }
        }
        if self.attachments.cleanup_one(id)? {
          writeln!(out, "Cleaned {}", short_id(id))?;
        } else {
          writeln!(out, "Nothing to clean for {}", short_id(id))?;
        }
      }
      AttachmentsCommand::Clean {
        attachment_id: None,
      } => {
        let report = self.attachments.cleanup_all()?;
        writeln!(out, "Cleaned {} attachments", report.cleaned)?;
        for error in &report.errors {
          writeln!(out, "  error: {}", error)?;
        }
      }
    }
    Ok(out)
  }

  fn degraded_command(&self, command: &DegradedCommand) -> Result<String> {
    let state = match command {
      DegradedCommand::Status => self.guard.state()?,
      DegradedCommand::Clear => self.guard.clear_degraded_mode()?,
    };
    let build = self.guard.build();
    let mut out = String::new();
    writeln!(out, "degraded: {}", state.is_degraded)?;
    writeln!(out, "retry count: {}", state.retry_count)?;
    writeln!(out, "should retry: {}", self.guard.should_retry_migration()?)?;
    writeln!(
      out,
      "running build: {} {}",
      build.app_version,
      build.current_update_id()
    )?;
    if let (Some(version), Some(update_id)) = (&state.last_app_version, &state.last_update_id) {
      writeln!(out, "recorded build: {} {}", version, update_id)?;
    }
    if let Some(schema_version) = state.last_schema_version {
      writeln!(out, "last schema version: {}", schema_version)?;
    }
    if let Some(error) = &state.last_error {
      writeln!(out, "last error: {}", error)?;
    }
    Ok(out)
  }
}

fn render_discovery(outcome: &DiscoveryOutcome) -> Result<String, std::fmt::Error> {
  let mut out = String::new();
  for category in Category::ALL {
    let slot = outcome.progress.get(category);
    let marker = if slot.has_error { " (error)" } else { "" };
    writeln!(out, "{:<20} {}{}", category.label(), slot.count, marker)?;
  }
  writeln!(out, "{:<20} {}", "Total", outcome.total)?;
  Ok(out)
}

fn render_cascade(outcome: &DiscoveryOutcome, summary: &CascadeSummary) -> Result<String> {
  let mut out = String::new();
  if outcome.has_error {
    writeln!(out, "warning: discovery was incomplete, some records were not covered")?;
  }
  for table in &summary.tables {
    write!(
      out,
      "{:<24} {} updated, {} unchanged",
      table.table_name.to_string(),
      table.records_updated,
      table.records_unchanged
    )?;
    if table.records_failed() > 0 {
      write!(out, ", {} failed", table.records_failed())?;
    }
    writeln!(out)?;
  }
  writeln!(out, "{} records updated", summary.total_updated())?;
  for error in summary.errors() {
    writeln!(out, "  error: {}", error)?;
  }
  Ok(out)
}

fn render_plan(plan: &OffloadPlan) -> Result<String> {
  let mut out = String::new();
  for (table, ids) in plan.closure.tables() {
    writeln!(out, "{:<24} {}", table.to_string(), ids.len())?;
  }
  writeln!(out, "{:<24} {}", "attachments", plan.attachment_ids.len())?;
  writeln!(out, "shared assets kept: {}", plan.shared_assets.len())?;
  writeln!(out, "pending uploads: {}", plan.pending_uploads)?;
  writeln!(out, "estimated bytes freed: {}", plan.estimated_bytes)?;
  Ok(out)
}

fn render_offload(report: &OffloadReport) -> Result<String> {
  let mut out = String::new();
  for (table, count) in &report.deleted {
    writeln!(out, "{:<24} {} deleted", table, count)?;
  }
  if !report.remote_updated {
    writeln!(out, "warning: remote download list was not updated")?;
  }
  writeln!(out, "Offloaded {}", report.quest_id)?;
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::migration::{BuildIdentity, KeyValueStore, MemoryKvStore};
  use crate::remote::memory::MemoryRemoteStore;
  use crate::testing::{local_count, local_store, resolver, seed_local_quest, seed_remote_quest, PROFILE, QUEST};

  struct Harness {
    app: App,
    local: Arc<LocalStore>,
    remote: Arc<MemoryRemoteStore>,
    kv: Arc<MemoryKvStore>,
  }

  fn harness(local: LocalStore, online: bool) -> Harness {
    let local = Arc::new(local);
    let remote = Arc::new(MemoryRemoteStore::new());
    let kv = Arc::new(MemoryKvStore::new());
    let guard = MigrationGuard::new(
      Arc::clone(&kv) as Arc<dyn KeyValueStore>,
      BuildIdentity::new(None, "1.0.0", schema::SCHEMA_VERSION),
    );
    let app = App::from_parts(
      Arc::clone(&local),
      Arc::clone(&remote) as Arc<dyn RemoteStore>,
      Arc::new(StaticReachability::new(online)),
      guard,
      resolver(online),
      Some(PROFILE.to_string()),
    );
    Harness {
      app,
      local,
      remote,
      kv,
    }
  }

  fn downcast(err: &color_eyre::Report) -> Option<&LifecycleError> {
    err.downcast_ref::<LifecycleError>()
  }

  #[tokio::test]
  async fn test_commands_run_migrations_first() {
    let h = harness(LocalStore::open_in_memory().unwrap(), true);
    assert_eq!(h.local.schema_version().unwrap(), 0);

    let out = h
      .app
      .execute(&Command::Attachments(AttachmentsCommand::Count))
      .await
      .unwrap();
    assert_eq!(out.trim(), "0");
    assert_eq!(h.local.schema_version().unwrap(), schema::SCHEMA_VERSION);
  }

  #[tokio::test]
  async fn test_degraded_mode_refuses_local_commands() {
    let h = harness(LocalStore::open_in_memory().unwrap(), true);
    let failed = MigrationGuard::new(
      Arc::clone(&h.kv) as Arc<dyn KeyValueStore>,
      BuildIdentity::new(None, "1.0.0", schema::SCHEMA_VERSION),
    );
    failed.record_failure("boom").unwrap();

    let err = h
      .app
      .execute(&Command::Attachments(AttachmentsCommand::Count))
      .await
      .unwrap_err();
    assert!(matches!(downcast(&err), Some(LifecycleError::MigrationFailure(_))));
    // The store was never touched
    assert_eq!(h.local.schema_version().unwrap(), 0);

    let status = h
      .app
      .execute(&Command::Degraded(DegradedCommand::Status))
      .await
      .unwrap();
    assert!(status.contains("degraded: true"));
    assert!(status.contains("should retry: false"));

    let cleared = h
      .app
      .execute(&Command::Degraded(DegradedCommand::Clear))
      .await
      .unwrap();
    assert!(cleared.contains("degraded: false"));

    let out = h.app.execute(&Command::Migrate).await.unwrap();
    assert!(out.contains("Startup mode: normal"));
  }

  #[tokio::test]
  async fn test_download_reports_summary() {
    let h = harness(local_store(), true);
    seed_remote_quest(&h.remote);

    let out = h
      .app
      .execute(&Command::Download {
        quest_id: QUEST.into(),
      })
      .await
      .unwrap();
    assert!(out.contains("17 records updated"));
    assert_eq!(h.remote.rows_with_profile(PROFILE), 17);
  }

  #[tokio::test]
  async fn test_download_of_missing_quest() {
    let h = harness(local_store(), true);
    let err = h
      .app
      .execute(&Command::Download {
        quest_id: "missing".into(),
      })
      .await
      .unwrap_err();
    assert!(matches!(downcast(&err), Some(LifecycleError::RootNotFound(_))));
  }

  #[tokio::test]
  async fn test_remote_commands_need_connectivity() {
    let h = harness(local_store(), false);
    seed_remote_quest(&h.remote);
    let err = h
      .app
      .execute(&Command::Discover {
        quest_id: QUEST.into(),
      })
      .await
      .unwrap_err();
    assert!(matches!(downcast(&err), Some(LifecycleError::Network(_))));
    assert!(h.remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_clean_refuses_healthy_attachment() {
    let local = local_store();
    seed_local_quest(&local);
    local
      .with_conn(|conn| {
        conn.execute(
          "INSERT INTO attachments (id, local_uri, state) VALUES ('att-bad', 'blob:http://x/1', 3)",
          [],
        )
      })
      .unwrap();
    let h = harness(local, true);

    let clean = |id: &str| {
      Command::Attachments(AttachmentsCommand::Clean {
        attachment_id: Some(id.to_string()),
      })
    };
    assert!(h.app.execute(&clean("att-c1")).await.is_err());
    assert_eq!(local_count(&h.local, "attachments"), 4);

    let out = h.app.execute(&clean("att-bad")).await.unwrap();
    assert!(out.contains("Cleaned att-bad"));
    assert_eq!(local_count(&h.local, "attachments"), 3);
  }

  #[tokio::test]
  async fn test_offload_dry_run_then_offload() {
    let local = local_store();
    seed_local_quest(&local);
    let h = harness(local, true);

    let plan = h
      .app
      .execute(&Command::Offload {
        quest_id: QUEST.into(),
        force: false,
        dry_run: true,
      })
      .await
      .unwrap();
    assert!(plan.contains("pending uploads: 0"));
    assert_eq!(local_count(&h.local, "quest"), 1);

    let out = h
      .app
      .execute(&Command::Offload {
        quest_id: QUEST.into(),
        force: false,
        dry_run: false,
      })
      .await
      .unwrap();
    assert!(out.contains("Offloaded q1"));
    assert_eq!(local_count(&h.local, "quest"), 0);
  }
}
