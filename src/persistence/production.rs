use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{ProductionStore, SyncOutcome};
use crate::error::StoreError;
use crate::story::Story;

/// Production story store reached over HTTP.
///
/// Each story is `PUT` to `{base_url}/stories/{fingerprint}`, so repeating a
/// sync is an idempotent upsert. `409 Conflict` means the store already holds
/// the fingerprint.
pub struct HttpProductionStore {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpProductionStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn story_url(&self, fingerprint: &str) -> String {
        format!("{}/stories/{fingerprint}", self.base_url)
    }
}

impl ProductionStore for HttpProductionStore {
    async fn upsert_story(&self, story: &Story) -> Result<SyncOutcome, StoreError> {
        let mut request = self.client.put(self.story_url(&story.fingerprint)).json(story);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            debug!(fingerprint = %story.fingerprint, "production already has story");
            return Ok(SyncOutcome::AlreadySynced);
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(StoreError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        Ok(SyncOutcome::Synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn put_with_bearer_token_syncs() {
        let server = MockServer::start().await;
        let story = test_support::stories("e1", 1, 10).remove(0);

        Mock::given(method("PUT"))
            .and(path(format!("/api/stories/{}", story.fingerprint)))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpProductionStore::new(format!("{}/api/", server.uri()), "secret").unwrap();
        assert_eq!(store.upsert_story(&story).await.unwrap(), SyncOutcome::Synced);
    }

    #[tokio::test]
    async fn conflict_counts_as_already_synced() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let store = HttpProductionStore::new(server.uri(), "").unwrap();
        let story = test_support::stories("e1", 1, 10).remove(0);
        assert_eq!(
            store.upsert_story(&story).await.unwrap(),
            SyncOutcome::AlreadySynced
        );
    }

    #[tokio::test]
    async fn server_error_is_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(422).set_body_string("missing belt_levels"))
            .mount(&server)
            .await;

        let store = HttpProductionStore::new(server.uri(), "t").unwrap();
        let story = test_support::stories("e1", 1, 10).remove(0);
        match store.upsert_story(&story).await.unwrap_err() {
            StoreError::Remote { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "missing belt_levels");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }
}
