//! Chroma server backend over the `/api/v1` REST API.
//!
//! Collections are addressed by name for lookup/creation/deletion and by id
//! for data operations, matching how the server routes them. Collections
//! are created with cosine distance so query distances are `1 - cosine`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::{classify_store_status, classify_transport, Service, SyncError};
use crate::models::{CollectionDump, CollectionHandle, EntryBatch, Embedding, Metadata, QueryMatch};

use super::VectorStore;

pub struct ChromaStore {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CollectionBody {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct QueryBody {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Metadata>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f32>>>,
}

#[derive(Deserialize)]
struct GetBody {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<Metadata>>>,
    #[serde(default)]
    embeddings: Option<Vec<Embedding>>,
}

impl ChromaStore {
    pub fn new(url: &str, timeout_secs: u64) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| SyncError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, SyncError> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(Service::VectorStore, &e))?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_store_status(status.as_u16(), &body))
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, SyncError> {
        response
            .json()
            .await
            .map_err(|e| classify_transport(Service::VectorStore, &e))
    }
}

#[async_trait]
impl VectorStore for ChromaStore {
    fn backend(&self) -> &str {
        "chroma"
    }

    async fn heartbeat(&self) -> Result<(), SyncError> {
        self.send(self.client.get(self.url("/heartbeat"))).await?;
        Ok(())
    }

    async fn get_collection(&self, name: &str) -> Result<Option<CollectionHandle>, SyncError> {
        let result = self
            .send(self.client.get(self.url(&format!("/collections/{}", name))))
            .await;
        match result {
            Ok(response) => {
                let body: CollectionBody = Self::json(response).await?;
                Ok(Some(CollectionHandle {
                    id: body.id,
                    name: body.name,
                }))
            }
            Err(SyncError::Store(msg))
                if msg.starts_with("HTTP 404") || msg.contains("does not exist") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_or_create_collection(&self, name: &str) -> Result<CollectionHandle, SyncError> {
        let response = self
            .send(self.client.post(self.url("/collections")).json(&json!({
                "name": name,
                "get_or_create": true,
                "metadata": { "hnsw:space": "cosine" },
            })))
            .await?;
        let body: CollectionBody = Self::json(response).await?;
        Ok(CollectionHandle {
            id: body.id,
            name: body.name,
        })
    }

    async fn delete_collection(&self, name: &str) -> Result<(), SyncError> {
        self.send(self.client.delete(self.url(&format!("/collections/{}", name))))
            .await?;
        Ok(())
    }

    async fn add(&self, collection: &CollectionHandle, batch: &EntryBatch) -> Result<(), SyncError> {
        self.send(
            self.client
                .post(self.url(&format!("/collections/{}/add", collection.id)))
                .json(&json!({
                    "ids": batch.ids,
                    "documents": batch.documents,
                    "metadatas": batch.metadatas,
                    "embeddings": batch.embeddings,
                })),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: &CollectionHandle, ids: &[String]) -> Result<(), SyncError> {
        self.send(
            self.client
                .post(self.url(&format!("/collections/{}/delete", collection.id)))
                .json(&json!({ "ids": ids })),
        )
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &CollectionHandle,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<QueryMatch>, SyncError> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{}/query", collection.id)))
                    .json(&json!({
                        "query_embeddings": [embedding],
                        "n_results": k,
                        "include": ["documents", "metadatas", "distances"],
                    })),
            )
            .await?;
        let body: QueryBody = Self::json(response).await?;

        let ids = body.ids.into_iter().next().unwrap_or_default();
        let documents = body.documents.and_then(|d| d.into_iter().next()).unwrap_or_default();
        let metadatas = body.metadatas.and_then(|m| m.into_iter().next()).unwrap_or_default();
        let distances = body.distances.and_then(|d| d.into_iter().next()).unwrap_or_default();

        Ok(ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| QueryMatch {
                id,
                document: documents.get(i).cloned().flatten().unwrap_or_default(),
                metadata: metadatas.get(i).cloned().flatten().unwrap_or_default(),
                distance: distances.get(i).copied().unwrap_or(f32::MAX),
            })
            .collect())
    }

    async fn count(&self, collection: &CollectionHandle) -> Result<usize, SyncError> {
        let response = self
            .send(self.client.get(self.url(&format!("/collections/{}/count", collection.id))))
            .await?;
        Self::json(response).await
    }

    async fn get_all(
        &self,
        collection: &CollectionHandle,
        include_embeddings: bool,
    ) -> Result<CollectionDump, SyncError> {
        let mut include = vec!["documents", "metadatas"];
        if include_embeddings {
            include.push("embeddings");
        }
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{}/get", collection.id)))
                    .json(&json!({ "include": include })),
            )
            .await?;
        let body: GetBody = Self::json(response).await?;

        Ok(CollectionDump {
            documents: body
                .documents
                .unwrap_or_default()
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect(),
            metadatas: body
                .metadatas
                .unwrap_or_default()
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect(),
            ids: body.ids,
            embeddings: if include_embeddings { body.embeddings } else { None },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let store = ChromaStore::new("http://chroma:8000/", 5).unwrap();
        assert_eq!(store.url("/heartbeat"), "http://chroma:8000/api/v1/heartbeat");
    }

    #[test]
    fn test_query_body_parses_nested_columns() {
        let raw = r#"{
            "ids": [["doc_1", "doc_0"]],
            "documents": [["Flag left.", null]],
            "metadatas": [[{"source": "feet.txt"}, null]],
            "distances": [[0.12, 0.4]]
        }"#;
        let body: QueryBody = serde_json::from_str(raw).unwrap();
        assert_eq!(body.ids[0], vec!["doc_1", "doc_0"]);
        let docs = body.documents.unwrap();
        assert_eq!(docs[0][1], None);
        assert_eq!(body.distances.unwrap()[0][0], 0.12);
    }

    #[test]
    fn test_get_body_without_embeddings() {
        let raw = r#"{"ids": ["a"], "documents": ["x"], "metadatas": [{}], "embeddings": null}"#;
        let body: GetBody = serde_json::from_str(raw).unwrap();
        assert!(body.embeddings.is_none());
        assert_eq!(body.ids, vec!["a"]);
    }
}
