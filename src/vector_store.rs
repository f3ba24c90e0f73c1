// src/vector_store.rs
use qdrant_client::qdrant::{
    CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance,
    FieldType, PointStruct, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use uuid::Uuid;

/// Embedding width of text-embedding-3-small.
const EMBEDDING_DIMENSIONS: u64 = 1536;

/// Passage index scoped by file. Each file's pages live under its own
/// namespace (a `file_id` payload filter), so one document's passages
/// never leak into another's retrieval.
#[derive(Clone)]
pub struct VectorStore {
    client: Qdrant,
    collection_name: String,
}

/// One page of extracted document text, as indexed.
#[derive(Debug, Clone)]
pub struct PagePassage {
    pub page: u32,
    pub text: String,
}

/// A passage returned by similarity search.
#[derive(Debug, Clone)]
pub struct RetrievedPassage {
    pub page: u32,
    pub text: String,
    pub score: f32,
}

impl VectorStore {
    pub fn new(
        url: String,
        api_key: Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut client_builder = Qdrant::from_url(&url);

        if let Some(key) = api_key {
            client_builder = client_builder.api_key(key);
        }

        let client = client_builder.build()?;

        Ok(Self {
            client,
            collection_name: "doku".to_string(),
        })
    }

    pub async fn create_collection(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!("Creating Qdrant collection: {}", self.collection_name);

        let result = self
            .client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                    VectorParamsBuilder::new(EMBEDDING_DIMENSIONS, Distance::Cosine),
                ),
            )
            .await;

        match result {
            Ok(_) => {
                tracing::info!("Successfully created Qdrant collection: {}", self.collection_name);
                self.create_payload_indexes().await?;
                Ok(())
            }
            Err(e) => {
                let error_msg = e.to_string();
                if error_msg.contains("already exists") {
                    tracing::debug!(
                        "Qdrant collection '{}' already exists, ensuring indexes exist",
                        self.collection_name
                    );
                    self.create_payload_indexes().await?;
                } else {
                    tracing::warn!(
                        "Failed to create Qdrant collection '{}': {}",
                        self.collection_name,
                        e
                    );
                }
                Ok(())
            }
        }
    }

    async fn create_payload_indexes(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // file_id is the namespace key; every search filters on it.
        let file_id_index = self
            .client
            .create_field_index(
                CreateFieldIndexCollectionBuilder::new(
                    &self.collection_name,
                    "file_id",
                    FieldType::Keyword,
                )
                .wait(true),
            )
            .await;

        match file_id_index {
            Ok(_) => tracing::info!("Created file_id index successfully"),
            Err(e) => {
                if e.to_string().contains("already exists") {
                    tracing::debug!("file_id index already exists, skipping");
                } else {
                    tracing::warn!("Failed to create file_id index: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Upserts one page per point under the file's namespace.
    pub async fn index_pages(
        &self,
        file_id: &str,
        pages: Vec<(PagePassage, Vec<f32>)>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let points: Vec<PointStruct> = pages
            .into_iter()
            .map(|(passage, embedding)| {
                let payload: Payload = json!({
                    "file_id": file_id,
                    "page": passage.page,
                    "text": passage.text,
                })
                .try_into()
                .unwrap();

                PointStruct::new(Uuid::new_v4().to_string(), embedding, payload)
            })
            .collect();

        let point_count = points.len();
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await?;

        tracing::debug!("Indexed {} page(s) for file {}", point_count, file_id);
        Ok(())
    }

    /// Nearest-neighbor search within one file's namespace.
    pub async fn search(
        &self,
        file_id: &str,
        query_embedding: Vec<f32>,
        limit: u64,
    ) -> Result<Vec<RetrievedPassage>, Box<dyn std::error::Error + Send + Sync>> {
        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, query_embedding, limit)
                    .filter(file_filter(file_id))
                    .with_payload(true),
            )
            .await?;

        let mut passages = Vec::new();
        for scored_point in search_result.result {
            let payload = scored_point.payload;

            let text = payload
                .get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_default();
            let page = payload
                .get("page")
                .and_then(|v| v.as_integer())
                .unwrap_or(0) as u32;

            passages.push(RetrievedPassage {
                page,
                text,
                score: scored_point.score,
            });
        }

        Ok(passages)
    }

    /// Drops every point in a file's namespace (file deletion).
    pub async fn delete_namespace(
        &self,
        file_id: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(file_filter(file_id))
                    .wait(true),
            )
            .await?;

        tracing::debug!("Deleted vector namespace for file {}", file_id);
        Ok(())
    }
}

fn file_filter(file_id: &str) -> qdrant_client::qdrant::Filter {
    qdrant_client::qdrant::Filter {
        must: vec![qdrant_client::qdrant::Condition {
            condition_one_of: Some(qdrant_client::qdrant::condition::ConditionOneOf::Field(
                qdrant_client::qdrant::FieldCondition {
                    key: "file_id".to_string(),
                    r#match: Some(qdrant_client::qdrant::Match {
                        match_value: Some(qdrant_client::qdrant::r#match::MatchValue::Keyword(
                            file_id.to_string(),
                        )),
                    }),
                    ..Default::default()
                },
            )),
        }],
        ..Default::default()
    }
}
