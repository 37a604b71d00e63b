//! CLI subcommands.

use clap::Subcommand;

use crate::model::TableName;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Run pending local schema migrations
  Migrate,

  /// List everything a quest download would cover
  #[command(visible_alias = "d")]
  Discover { quest_id: String },

  /// Mark a quest and its dependencies as wanted by the profile
  #[command(visible_alias = "dl")]
  Download { quest_id: String },

  /// Remove the profile from a quest and its dependencies
  #[command(visible_alias = "undl")]
  Undownload { quest_id: String },

  /// Delete a quest's local data
  Offload {
    quest_id: String,
    /// Offload even when local changes have not been uploaded
    #[arg(long)]
    force: bool,
    /// Only print what would be deleted
    #[arg(long)]
    dry_run: bool,
  },

  /// Whether the profile wants a record cached
  Status {
    table: TableName,
    /// Record id, or `key1|key2` for link tables
    key: String,
  },

  /// Inspect and repair attachment references
  #[command(subcommand)]
  Attachments(AttachmentsCommand),

  /// Inspect or reset the migration gate
  #[command(subcommand)]
  Degraded(DegradedCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum AttachmentsCommand {
  /// List corrupted attachments and the content links using them
  Scan,
  /// Number of corrupted attachments
  Count,
  /// Remove one corrupted attachment, or all when no id is given
  Clean { attachment_id: Option<String> },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DegradedCommand {
  /// Show the persisted migration state
  Status,
  /// Leave degraded mode so the next launch retries
  Clear,
}

impl Command {
  /// Whether the command reads or writes the local replica.
  ///
  /// These are refused while the migration gate reports degraded mode.
  pub fn needs_local_store(&self) -> bool {
    matches!(
      self,
      Command::Offload { .. } | Command::Status { .. } | Command::Attachments(_)
    )
  }

  /// Whether the command can only run against the remote store.
  pub fn needs_remote(&self) -> bool {
    matches!(
      self,
      Command::Discover { .. } | Command::Download { .. } | Command::Undownload { .. }
    )
  }
}
