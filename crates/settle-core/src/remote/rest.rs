//! PostgREST-style HTTP backend

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::{RemoteError, RemoteQuery, RemoteResult, RemoteService};
use crate::config::RemoteConfig;
use crate::error::Result;
use crate::models::EntityKind;
use crate::util::compact_text;

/// REST client for `<base>/rest/v1/<collection>` endpoints
#[derive(Clone)]
pub struct RestRemote {
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for RestRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RestRemote")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl RestRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let mut config = config.clone();
        config.normalize();
        let base_url = config.base_url()?.to_string();
        let api_key = config.api_key.clone().ok_or_else(|| {
            crate::Error::InvalidInput("api_key is required for the REST backend".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|error| RemoteError::Network(error.to_string()))?;

        Ok(Self {
            base_url,
            api_key,
            access_token: config.access_token,
            client,
        })
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}/rest/v1/{}", self.base_url, kind.collection())
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        builder
            .header("apikey", &self.api_key)
            .header("Accept", "application/json")
            .bearer_auth(token)
    }

    async fn send(&self, builder: RequestBuilder) -> RemoteResult<Response> {
        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|error| RemoteError::Network(error.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message: parse_api_error(status, &body),
        })
    }

    async fn rows(&self, builder: RequestBuilder) -> RemoteResult<Vec<Value>> {
        let response = self.send(builder).await?;
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|error| RemoteError::InvalidResponse(error.to_string()))
    }

    async fn single_row(&self, builder: RequestBuilder, id: &str) -> RemoteResult<Value> {
        self.rows(builder)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }
}

fn id_filter(id: &str) -> [(&'static str, String); 1] {
    [("id", format!("eq.{id}"))]
}

fn filter_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn query_params(query: &RemoteQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    for (field, value) in &query.filter {
        params.push((field.clone(), format!("eq.{}", filter_value(value))));
    }
    if let Some(order_by) = &query.order_by {
        let direction = if query.descending { "desc" } else { "asc" };
        params.push(("order".to_string(), format!("{order_by}.{direction}")));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    error: Option<String>,
    hint: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error).or(payload.hint) {
            return compact_text(&message);
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        compact_text(trimmed)
    }
}

#[async_trait]
impl RemoteService for RestRemote {
    async fn insert(&self, kind: EntityKind, record: Value) -> RemoteResult<Value> {
        let builder = self
            .client
            .post(self.collection_url(kind))
            .header("Prefer", "return=representation")
            .json(&record);
        self.rows(builder)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidResponse("insert returned no rows".to_string()))
    }

    async fn update(&self, kind: EntityKind, id: &str, patch: Value) -> RemoteResult<Value> {
        let builder = self
            .client
            .patch(self.collection_url(kind))
            .query(&id_filter(id))
            .header("Prefer", "return=representation")
            .json(&patch);
        self.single_row(builder, id).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> RemoteResult<()> {
        let builder = self
            .client
            .delete(self.collection_url(kind))
            .query(&id_filter(id))
            .header("Prefer", "return=representation");
        self.single_row(builder, id).await.map(|_| ())
    }

    async fn get_one(&self, kind: EntityKind, id: &str) -> RemoteResult<Option<Value>> {
        let builder = self
            .client
            .get(self.collection_url(kind))
            .query(&[("select", "*".to_string())])
            .query(&id_filter(id));
        Ok(self.rows(builder).await?.into_iter().next())
    }

    async fn query(&self, kind: EntityKind, query: &RemoteQuery) -> RemoteResult<Vec<Value>> {
        let builder = self
            .client
            .get(self.collection_url(kind))
            .query(&query_params(query));
        self.rows(builder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn remote(url: String) -> RestRemote {
        RestRemote::new(&RemoteConfig {
            api_base_url: Some(url),
            api_key: Some("anon-key".into()),
            access_token: Some("user-token".into()),
            request_timeout_secs: Some(5),
        })
        .unwrap()
    }

    #[test]
    fn new_requires_http_base_url() {
        let config = RemoteConfig {
            api_base_url: Some("example.com".into()),
            api_key: Some("key".into()),
            ..RemoteConfig::default()
        };
        assert!(RestRemote::new(&config).is_err());
    }

    #[test]
    fn debug_redacts_key() {
        let remote = remote("http://localhost".into());
        let debug = format!("{remote:?}");
        assert!(!debug.contains("anon-key"));
    }

    #[test]
    fn query_params_encode_filter_order_and_limit() {
        let query = RemoteQuery::recent(25).with_filter("group_id", json!("g1"));
        assert_eq!(
            query_params(&query),
            vec![
                ("select".to_string(), "*".to_string()),
                ("group_id".to_string(), "eq.g1".to_string()),
                ("order".to_string(), "updated_at.desc".to_string()),
                ("limit".to_string(), "25".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn insert_returns_server_record() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/rest/v1/expenses")
            .match_header("apikey", "anon-key")
            .match_header("authorization", "Bearer user-token")
            .match_header("prefer", "return=representation")
            .match_body(Matcher::PartialJson(json!({"description": "Lunch"})))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":"srv-1","description":"Lunch","amount":20}]"#)
            .create_async()
            .await;

        let record = remote(server.url())
            .insert(
                EntityKind::Expenses,
                json!({"description": "Lunch", "amount": 20}),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(record["id"], json!("srv-1"));
    }

    #[tokio::test]
    async fn update_of_missing_record_is_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("PATCH", "/rest/v1/expenses")
            .match_query(Matcher::UrlEncoded("id".into(), "eq.gone".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let error = remote(server.url())
            .update(EntityKind::Expenses, "gone", json!({"amount": 5}))
            .await
            .unwrap_err();
        assert_eq!(error, RemoteError::NotFound("gone".into()));
    }

    #[tokio::test]
    async fn rejection_carries_status_and_message() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/rest/v1/groups")
            .with_status(422)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"name is required"}"#)
            .create_async()
            .await;

        let error = remote(server.url())
            .insert(EntityKind::Groups, json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            error,
            RemoteError::Rejected {
                status: 422,
                message: "name is required".into()
            }
        );
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn get_one_returns_none_for_empty_result() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/rest/v1/users")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("select".into(), "*".into()),
                Matcher::UrlEncoded("id".into(), "eq.u1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let record = remote(server.url())
            .get_one(EntityKind::Users, "u1")
            .await
            .unwrap();
        assert_eq!(record, None);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/rest/v1/groups")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let error = remote(server.url())
            .query(EntityKind::Groups, &RemoteQuery::recent(10))
            .await
            .unwrap_err();
        assert!(error.is_transient());
        assert_eq!(
            error,
            RemoteError::Rejected {
                status: 503,
                message: "HTTP 503".into()
            }
        );
    }
}
