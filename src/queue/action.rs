use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A mutating operation together with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Action {
  UploadImage {
    /// Local file to upload
    path: PathBuf,
    #[serde(default)]
    album_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
  },
  CreateAlbum {
    name: String,
    #[serde(default)]
    description: Option<String>,
  },
  DeleteImage {
    image_id: String,
  },
  UpdateMetadata {
    image_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
  },
  CreatePlaylist {
    name: String,
    #[serde(default)]
    image_ids: Vec<String>,
  },
}

impl Action {
  /// Discriminator string, as it appears in storage.
  pub fn kind(&self) -> &'static str {
    match self {
      Action::UploadImage { .. } => "upload-image",
      Action::CreateAlbum { .. } => "create-album",
      Action::DeleteImage { .. } => "delete-image",
      Action::UpdateMetadata { .. } => "update-metadata",
      Action::CreatePlaylist { .. } => "create-playlist",
    }
  }

  /// Build an action from a discriminator and a JSON payload.
  pub fn from_parts(kind: &str, payload: serde_json::Value) -> serde_json::Result<Self> {
    serde_json::from_value(serde_json::json!({ "type": kind, "payload": payload }))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl std::fmt::Display for ActionStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      ActionStatus::Pending => "pending",
      ActionStatus::Processing => "processing",
      ActionStatus::Completed => "completed",
      ActionStatus::Failed => "failed",
    };
    f.write_str(s)
  }
}

/// A queued mutation and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAction {
  pub id: String,
  pub action: Action,
  pub status: ActionStatus,
  pub retries: u32,
  pub max_retries: u32,
  /// Creation time, also the queue order
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl OfflineAction {
  pub fn new(action: Action, max_retries: u32) -> Self {
    let timestamp = Utc::now();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Self {
      id: format!(
        "{}-{}-{}",
        action.kind(),
        timestamp.timestamp_millis(),
        &suffix[..9]
      ),
      action,
      status: ActionStatus::Pending,
      retries: 0,
      max_retries,
      timestamp,
      last_error: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_id_carries_kind_and_is_unique() {
    let a = OfflineAction::new(Action::DeleteImage { image_id: "1".into() }, 3);
    let b = OfflineAction::new(Action::DeleteImage { image_id: "1".into() }, 3);
    assert!(a.id.starts_with("delete-image-"));
    assert_ne!(a.id, b.id);
    assert_eq!(a.status, ActionStatus::Pending);
    assert_eq!(a.retries, 0);
  }

  #[test]
  fn test_serialized_shape() {
    let action = OfflineAction::new(
      Action::CreateAlbum {
        name: "Holidays".into(),
        description: None,
      },
      3,
    );
    let json = serde_json::to_value(&action).unwrap();
    assert_eq!(json["action"]["type"], "create-album");
    assert_eq!(json["action"]["payload"]["name"], "Holidays");
    assert_eq!(json["status"], "pending");
    assert_eq!(json["maxRetries"], 3);
    assert!(json.get("lastError").is_none());

    let back: OfflineAction = serde_json::from_value(json).unwrap();
    assert_eq!(back, action);
  }

  #[test]
  fn test_from_parts() {
    let action = Action::from_parts(
      "update-metadata",
      serde_json::json!({ "image_id": "42", "title": "Sunset" }),
    )
    .unwrap();
    assert_eq!(
      action,
      Action::UpdateMetadata {
        image_id: "42".into(),
        title: Some("Sunset".into()),
        caption: None,
        tags: None,
      }
    );

    assert!(Action::from_parts("launch-rocket", serde_json::json!({})).is_err());
    assert!(Action::from_parts("delete-image", serde_json::json!({})).is_err());
  }
}
