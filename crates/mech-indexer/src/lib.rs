// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-indexer
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! GraphQL client over the chain indexer. Four entity types are consumed
//! (`requests`, `jobDefinitions`, `artifacts`, `messages`), all through
//! `items`-wrapped list queries with `where` + `orderBy` + `limit`, plus
//! the create-artifact side-effect used to persist extracted artifacts.

use alloy_primitives::Address;
use mech_core::{ArtifactRef, Request, RequestId};
use mech_retry::BackoffPolicy;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Per-query timeout.
const GRAPHQL_TIMEOUT: Duration = Duration::from_secs(10);

/// Indexer failures.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// Transport failure (timeout, connect, 5xx after retries).
    #[error("indexer transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The query was rejected by the GraphQL layer.
    #[error("graphql errors: {0:?}")]
    Graphql(Vec<String>),
    /// The response shape did not match the expected entity.
    #[error("indexer decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl IndexerError {
    /// `true` when a retry with backoff may help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            IndexerError::Transport(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A request as the indexer sees it: the on-chain record plus the job
/// definition the metadata resolved to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// The mirrored on-chain request.
    #[serde(flatten)]
    pub request: Request,
    /// Job definition id, when the indexer has resolved the metadata.
    #[serde(default)]
    pub job_definition_id: Option<String>,
    /// Enabled tools from the resolved metadata; the claim loop's
    /// credential gate reads these without touching the store.
    #[serde(default)]
    pub enabled_tools: Vec<String>,
}

/// A job definition entity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinitionRecord {
    /// Stable definition id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Workstream the definition belongs to.
    #[serde(default)]
    pub workstream_id: Option<String>,
    /// Request that dispatched this definition, for children.
    #[serde(default)]
    pub source_request_id: Option<RequestId>,
    /// Parent definition, when known.
    #[serde(default)]
    pub parent_job_definition_id: Option<String>,
    /// Branch the definition works on, for coding jobs.
    #[serde(default)]
    pub branch_name: Option<String>,
}

/// An artifact entity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    /// Content id of the artifact payload.
    pub cid: String,
    /// Publication topic.
    pub topic: String,
    /// Artifact type tag (e.g. `MEASUREMENT`).
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Workstream scope.
    #[serde(default)]
    pub workstream_id: Option<String>,
    /// Job definition scope.
    #[serde(default)]
    pub job_definition_id: Option<String>,
    /// Publication timestamp (seconds).
    #[serde(default)]
    pub created_at: i64,
}

/// A message entity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Message id.
    pub id: String,
    /// Job definition the message is attached to.
    #[serde(default)]
    pub job_definition_id: Option<String>,
    /// Message body.
    #[serde(default)]
    pub content: String,
    /// Creation timestamp (seconds).
    #[serde(default)]
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Items<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// The indexer client.
#[derive(Debug, Clone)]
pub struct IndexerClient {
    url: String,
    client: reqwest::Client,
    policy: BackoffPolicy,
}

impl IndexerClient {
    /// Build a client for the GraphQL endpoint.
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(GRAPHQL_TIMEOUT)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
            policy: BackoffPolicy::gateway(),
        })
    }

    /// Override the retry policy (tests).
    #[must_use]
    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn query(&self, query: &str, variables: Value) -> Result<Value, IndexerError> {
        let body = json!({"query": query, "variables": variables});
        let response: GraphqlResponse = mech_retry::retry(
            &self.policy,
            "indexer.query",
            IndexerError::is_transient,
            || async {
                let resp = self
                    .client
                    .post(&self.url)
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<_, IndexerError>(resp.json().await?)
            },
        )
        .await?;

        if let Some(errors) = response.errors
            && !errors.is_empty()
        {
            return Err(IndexerError::Graphql(
                errors.into_iter().map(|e| e.message).collect(),
            ));
        }
        Ok(response.data.unwrap_or(Value::Null))
    }

    async fn list<T: DeserializeOwned>(
        &self,
        entity: &str,
        query: &str,
        variables: Value,
    ) -> Result<Vec<T>, IndexerError> {
        let data = self.query(query, variables).await?;
        let wrapped: Items<T> = serde_json::from_value(
            data.get(entity).cloned().unwrap_or(json!({"items": []})),
        )?;
        Ok(wrapped.items)
    }

    // ── requests ───────────────────────────────────────────────────────

    /// Undelivered requests directed at `mech`, oldest first.
    pub async fn undelivered_requests(
        &self,
        mech: Address,
        limit: u32,
    ) -> Result<Vec<RequestRecord>, IndexerError> {
        const QUERY: &str = r#"
            query UndeliveredRequests($mech: String!, $limit: Int!) {
              requests(
                where: { mech: $mech, delivered: false }
                orderBy: "blockTimestamp"
                orderDirection: "asc"
                limit: $limit
              ) {
                items {
                  id requester mech data workstreamId dependencies delivered
                  blockTimestamp jobDefinitionId enabledTools
                }
              }
            }"#;
        let records = self
            .list("requests", QUERY, json!({"mech": mech, "limit": limit}))
            .await?;
        debug!(target: "mech.indexer", count = records.len(), "undelivered requests");
        Ok(records)
    }

    /// A batch of requests by id (dependency checks).
    pub async fn requests_by_ids(
        &self,
        ids: &[RequestId],
    ) -> Result<Vec<RequestRecord>, IndexerError> {
        const QUERY: &str = r#"
            query RequestsByIds($ids: [String!]!) {
              requests(where: { id_in: $ids }, limit: 1000) {
                items {
                  id requester mech data workstreamId dependencies delivered
                  blockTimestamp jobDefinitionId enabledTools
                }
              }
            }"#;
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.list("requests", QUERY, json!({"ids": ids})).await
    }

    /// Runs of one job definition, oldest first.
    pub async fn requests_for_definition(
        &self,
        job_definition_id: &str,
    ) -> Result<Vec<RequestRecord>, IndexerError> {
        const QUERY: &str = r#"
            query RequestsForDefinition($jobDefinitionId: String!) {
              requests(
                where: { jobDefinitionId: $jobDefinitionId }
                orderBy: "blockTimestamp"
                orderDirection: "asc"
                limit: 100
              ) {
                items {
                  id requester mech data workstreamId dependencies delivered
                  blockTimestamp jobDefinitionId enabledTools
                }
              }
            }"#;
        self.list(
            "requests",
            QUERY,
            json!({"jobDefinitionId": job_definition_id}),
        )
        .await
    }

    // ── jobDefinitions ─────────────────────────────────────────────────

    /// One job definition by id.
    pub async fn job_definition(
        &self,
        id: &str,
    ) -> Result<Option<JobDefinitionRecord>, IndexerError> {
        const QUERY: &str = r#"
            query JobDefinition($id: String!) {
              jobDefinitions(where: { id: $id }, limit: 1) {
                items {
                  id name workstreamId sourceRequestId parentJobDefinitionId branchName
                }
              }
            }"#;
        Ok(self
            .list("jobDefinitions", QUERY, json!({"id": id}))
            .await?
            .into_iter()
            .next())
    }

    /// Children of a definition (hierarchy edges).
    pub async fn child_definitions(
        &self,
        parent_job_definition_id: &str,
    ) -> Result<Vec<JobDefinitionRecord>, IndexerError> {
        const QUERY: &str = r#"
            query ChildDefinitions($parent: String!) {
              jobDefinitions(where: { parentJobDefinitionId: $parent }, limit: 100) {
                items {
                  id name workstreamId sourceRequestId parentJobDefinitionId branchName
                }
              }
            }"#;
        self.list(
            "jobDefinitions",
            QUERY,
            json!({"parent": parent_job_definition_id}),
        )
        .await
    }

    // ── artifacts ──────────────────────────────────────────────────────

    /// Artifacts in a workstream, newest first, optionally filtered by type.
    pub async fn artifacts(
        &self,
        workstream_id: &str,
        kind: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ArtifactRecord>, IndexerError> {
        const QUERY: &str = r#"
            query Artifacts($where: ArtifactFilter!, $limit: Int!) {
              artifacts(
                where: $where
                orderBy: "createdAt"
                orderDirection: "desc"
                limit: $limit
              ) {
                items {
                  cid topic type name workstreamId jobDefinitionId createdAt
                }
              }
            }"#;
        let mut where_clause = json!({"workstreamId": workstream_id});
        if let Some(kind) = kind {
            where_clause["type"] = json!(kind);
        }
        self.list(
            "artifacts",
            QUERY,
            json!({"where": where_clause, "limit": limit}),
        )
        .await
    }

    /// Artifacts attached to one job definition, newest first.
    pub async fn artifacts_for_definition(
        &self,
        job_definition_id: &str,
    ) -> Result<Vec<ArtifactRecord>, IndexerError> {
        const QUERY: &str = r#"
            query DefinitionArtifacts($jobDefinitionId: String!) {
              artifacts(
                where: { jobDefinitionId: $jobDefinitionId }
                orderBy: "createdAt"
                orderDirection: "desc"
                limit: 100
              ) {
                items {
                  cid topic type name workstreamId jobDefinitionId createdAt
                }
              }
            }"#;
        self.list(
            "artifacts",
            QUERY,
            json!({"jobDefinitionId": job_definition_id}),
        )
        .await
    }

    /// Persist an extracted artifact. Callers treat failures as non-fatal.
    pub async fn create_artifact(
        &self,
        artifact: &ArtifactRef,
        workstream_id: Option<&str>,
        job_definition_id: Option<&str>,
    ) -> Result<(), IndexerError> {
        const MUTATION: &str = r#"
            mutation CreateArtifact($input: CreateArtifactInput!) {
              createArtifact(input: $input) { cid }
            }"#;
        let input = json!({
            "cid": artifact.cid,
            "topic": artifact.topic,
            "type": artifact.kind,
            "name": artifact.name,
            "tags": artifact.tags,
            "workstreamId": workstream_id,
            "jobDefinitionId": job_definition_id,
        });
        self.query(MUTATION, json!({"input": input})).await?;
        Ok(())
    }

    // ── messages ───────────────────────────────────────────────────────

    /// Messages attached to one job definition, oldest first.
    pub async fn messages_for_definition(
        &self,
        job_definition_id: &str,
    ) -> Result<Vec<MessageRecord>, IndexerError> {
        const QUERY: &str = r#"
            query DefinitionMessages($jobDefinitionId: String!) {
              messages(
                where: { jobDefinitionId: $jobDefinitionId }
                orderBy: "createdAt"
                orderDirection: "asc"
                limit: 100
              ) {
                items { id jobDefinitionId content createdAt }
              }
            }"#;
        self.list(
            "messages",
            QUERY,
            json!({"jobDefinitionId": job_definition_id}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 2,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(1),
            jitter: 0.0,
        }
    }

    fn graphql(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"data": data}))
    }

    fn request_item(id_byte: &str, delivered: bool) -> Value {
        json!({
            "id": format!("0x{}", id_byte.repeat(32)),
            "requester": format!("0x{}", "aa".repeat(20)),
            "mech": format!("0x{}", "bb".repeat(20)),
            "data": format!("0x{}", "cc".repeat(32)),
            "delivered": delivered,
            "blockTimestamp": 1700000000i64,
            "jobDefinitionId": "jd-1",
        })
    }

    #[tokio::test]
    async fn undelivered_requests_decode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(graphql(json!({
                "requests": {"items": [request_item("01", false)]}
            })))
            .mount(&server)
            .await;

        let client = IndexerClient::new(server.uri()).unwrap().with_policy(fast());
        let records = client
            .undelivered_requests(Address::repeat_byte(0xbb), 50)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].request.delivered);
        assert_eq!(records[0].job_definition_id.as_deref(), Some("jd-1"));
        assert!(records[0].request.dependencies.is_empty());
    }

    #[tokio::test]
    async fn graphql_errors_are_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{"message": "unknown field"}]
            })))
            .mount(&server)
            .await;

        let client = IndexerClient::new(server.uri()).unwrap().with_policy(fast());
        let err = client.job_definition("jd-1").await.unwrap_err();
        assert!(matches!(err, IndexerError::Graphql(ref msgs) if msgs[0] == "unknown field"));
    }

    #[tokio::test]
    async fn missing_entity_is_empty_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(graphql(json!({})))
            .mount(&server)
            .await;

        let client = IndexerClient::new(server.uri()).unwrap().with_policy(fast());
        let artifacts = client.artifacts("ws-1", Some("MEASUREMENT"), 10).await.unwrap();
        assert!(artifacts.is_empty());
    }

    #[tokio::test]
    async fn transient_5xx_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(graphql(json!({
                "jobDefinitions": {"items": [{"id": "jd-9"}]}
            })))
            .mount(&server)
            .await;

        let client = IndexerClient::new(server.uri()).unwrap().with_policy(fast());
        let def = client.job_definition("jd-9").await.unwrap().unwrap();
        assert_eq!(def.id, "jd-9");
    }

    #[tokio::test]
    async fn create_artifact_posts_mutation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("createArtifact"))
            .respond_with(graphql(json!({"createArtifact": {"cid": "bafy"}})))
            .mount(&server)
            .await;

        let client = IndexerClient::new(server.uri()).unwrap().with_policy(fast());
        let artifact = ArtifactRef {
            cid: "bafy".into(),
            topic: "T".into(),
            name: None,
            kind: Some("MEASUREMENT".into()),
            tags: vec![],
        };
        client
            .create_artifact(&artifact, Some("ws-1"), Some("jd-1"))
            .await
            .unwrap();
    }
}
