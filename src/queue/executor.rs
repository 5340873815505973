//! Executes queued actions against the slideshow backend.

use async_trait::async_trait;
use serde_json::json;
use url::Url;

use super::action::{Action, OfflineAction};
use crate::error::ActionError;
use crate::http::mime_for_path;

/// Anything able to carry out a queued action.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
  async fn execute(&self, action: &OfflineAction) -> Result<(), ActionError>;
}

/// Executor that maps each action onto a REST call.
#[derive(Clone)]
pub struct HttpExecutor {
  client: reqwest::Client,
  origin: Url,
  token: Option<String>,
}

impl HttpExecutor {
  pub fn new(client: reqwest::Client, origin: Url, token: Option<String>) -> Self {
    Self {
      client,
      origin,
      token,
    }
  }

  fn endpoint(&self, path: &str) -> Result<Url, ActionError> {
    self
      .origin
      .join(path)
      .map_err(|e| ActionError::InvalidAction(format!("invalid endpoint {}: {}", path, e)))
  }

  /// `/api/images/{id}` with the id kept as a single encoded path segment.
  fn image_endpoint(&self, image_id: &str) -> Result<Url, ActionError> {
    if image_id.is_empty() || image_id == "." || image_id == ".." {
      return Err(ActionError::InvalidAction(format!(
        "invalid image id '{}'",
        image_id
      )));
    }

    let mut url = self.endpoint("/api/images/")?;
    url
      .path_segments_mut()
      .map_err(|_| ActionError::InvalidAction(format!("origin {} cannot take a path", self.origin)))?
      .pop_if_empty()
      .push(image_id);
    Ok(url)
  }

  /// Build the request for an action.
  async fn request_for(&self, action: &Action) -> Result<reqwest::RequestBuilder, ActionError> {
    let builder = match action {
      Action::UploadImage {
        path,
        album_id,
        title,
      } => {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
          .file_name()
          .map(|n| n.to_string_lossy().into_owned())
          .unwrap_or_else(|| "upload".to_string());

        let mut url = self.endpoint("/api/images")?;
        {
          let mut query = url.query_pairs_mut();
          query.append_pair("filename", &file_name);
          if let Some(album_id) = album_id {
            query.append_pair("album_id", album_id);
          }
          if let Some(title) = title {
            query.append_pair("title", title);
          }
        }

        self
          .client
          .post(url)
          .header(reqwest::header::CONTENT_TYPE, mime_for_path(&file_name))
          .body(bytes)
      }
      Action::CreateAlbum { name, description } => self
        .client
        .post(self.endpoint("/api/albums")?)
        .json(&json!({ "name": name, "description": description })),
      Action::DeleteImage { image_id } => self
        .client
        .delete(self.image_endpoint(image_id)?),
      Action::UpdateMetadata {
        image_id,
        title,
        caption,
        tags,
      } => self
        .client
        .patch(self.image_endpoint(image_id)?)
        .json(&json!({ "title": title, "caption": caption, "tags": tags })),
      Action::CreatePlaylist { name, image_ids } => self
        .client
        .post(self.endpoint("/api/playlists")?)
        .json(&json!({ "name": name, "imageIds": image_ids })),
    };

    Ok(match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    })
  }
}

#[async_trait]
impl ActionExecutor for HttpExecutor {
  async fn execute(&self, action: &OfflineAction) -> Result<(), ActionError> {
    let response = self.request_for(&action.action).await?.send().await?;

    let status = response.status();
    if !status.is_success() {
      return Err(ActionError::Rejected {
        status: status.as_u16(),
      });
    }

    tracing::debug!(id = %action.id, kind = action.action.kind(), "action delivered");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn executor() -> HttpExecutor {
    HttpExecutor::new(
      reqwest::Client::new(),
      Url::parse("https://app.test").unwrap(),
      Some("secret".into()),
    )
  }

  async fn built(action: Action) -> reqwest::Request {
    executor().request_for(&action).await.unwrap().build().unwrap()
  }

  #[tokio::test]
  async fn test_image_id_cannot_leave_images_path() {
    let request = built(Action::DeleteImage {
      image_id: "../albums/7".into(),
    })
    .await;
    assert_eq!(*request.method(), reqwest::Method::DELETE);
    assert_eq!(request.url().path(), "/api/images/..%2Falbums%2F7");
    assert_eq!(request.url().host_str(), Some("app.test"));

    let request = built(Action::UpdateMetadata {
      image_id: "../../albums/7".into(),
      title: Some("t".into()),
      caption: None,
      tags: None,
    })
    .await;
    assert_eq!(*request.method(), reqwest::Method::PATCH);
    assert!(request.url().path().starts_with("/api/images/"));
    assert!(!request.url().path().contains("/albums/"));
  }

  #[tokio::test]
  async fn test_image_id_cannot_add_query() {
    let request = built(Action::DeleteImage {
      image_id: "5?force=true".into(),
    })
    .await;
    assert_eq!(request.url().path(), "/api/images/5%3Fforce=true");
    assert_eq!(request.url().query(), None);
  }

  #[tokio::test]
  async fn test_plain_image_id_and_auth() {
    let request = built(Action::DeleteImage {
      image_id: "12".into(),
    })
    .await;
    assert_eq!(request.url().as_str(), "https://app.test/api/images/12");
    assert_eq!(request.headers()[reqwest::header::AUTHORIZATION], "Bearer secret");
  }

  #[tokio::test]
  async fn test_dot_segment_id_is_invalid_action() {
    for id in ["", ".", ".."] {
      let action = OfflineAction::new(
        Action::DeleteImage {
          image_id: id.into(),
        },
        3,
      );
      let result = executor().execute(&action).await;
      assert!(matches!(result, Err(ActionError::InvalidAction(_))), "{:?}", id);
    }
  }

  #[tokio::test]
  async fn test_upload_of_missing_file_is_io_error() {
    let executor = HttpExecutor::new(
      reqwest::Client::new(),
      Url::parse("http://localhost:9").unwrap(),
      None,
    );
    let action = OfflineAction::new(
      Action::UploadImage {
        path: "/nonexistent/photo.jpg".into(),
        album_id: None,
        title: None,
      },
      3,
    );

    let result = executor.execute(&action).await;
    assert!(matches!(result, Err(ActionError::Io(_))));
  }
}
