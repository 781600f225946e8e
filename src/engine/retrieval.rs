//! Retrieval pipeline: query generation, document search, relevance grading.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::error::EngineResult;
use crate::engine::graph::BoxFuture;
use crate::engine::message::Message;
use crate::engine::model::{generate_structured, ChatModel, ChatRequest, StructuredSchema};

/// Queries generated per enabled source.
pub const MAX_QUERIES_PER_SOURCE: usize = 3;

/// A unit of retrieved context, shape-compatible with the stored form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub page_content: String,
    pub metadata: serde_json::Value,
}

impl RetrievedDocument {
    pub fn new(page_content: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            page_content: page_content.into(),
            metadata,
        }
    }
}

/// Searches the caller's project documents.
pub trait Retriever: Send + Sync {
    fn search(&self, query: &str) -> BoxFuture<'_, EngineResult<Vec<RetrievedDocument>>>;
}

/// Searches the open web.
pub trait WebSearcher: Send + Sync {
    fn search(&self, query: &str) -> BoxFuture<'_, EngineResult<Vec<RetrievedDocument>>>;
}

#[derive(Debug, Deserialize)]
struct QuerySet {
    queries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RelevanceGrade {
    relevant: bool,
}

fn query_schema() -> StructuredSchema {
    StructuredSchema::new(
        "search_queries",
        serde_json::json!({
            "type": "object",
            "properties": {
                "queries": {
                    "type": "array",
                    "items": {"type": "string"},
                    "minItems": 1,
                    "maxItems": MAX_QUERIES_PER_SOURCE
                }
            },
            "required": ["queries"]
        }),
    )
}

fn grade_schema() -> StructuredSchema {
    StructuredSchema::new(
        "relevance_grade",
        serde_json::json!({
            "type": "object",
            "properties": {"relevant": {"type": "boolean"}},
            "required": ["relevant"]
        }),
    )
}

/// Either search backend, viewed uniformly while running queries.
enum Source<'a> {
    Project(&'a dyn Retriever),
    Web(&'a dyn WebSearcher),
}

impl Source<'_> {
    fn search(&self, query: &str) -> BoxFuture<'_, EngineResult<Vec<RetrievedDocument>>> {
        match self {
            Source::Project(retriever) => retriever.search(query),
            Source::Web(web_searcher) => web_searcher.search(query),
        }
    }
}

/// The retrieve phase. Every sub-task is fallible in isolation: a failed or
/// timed-out query contributes nothing instead of failing the run.
pub struct RetrievalPipeline {
    model: Arc<dyn ChatModel>,
    retriever: Option<Arc<dyn Retriever>>,
    web_searcher: Option<Arc<dyn WebSearcher>>,
    timeout: Duration,
}

impl RetrievalPipeline {
    pub fn new(model: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self {
            model,
            retriever: None,
            web_searcher: None,
            timeout,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_web_searcher(mut self, web_searcher: Arc<dyn WebSearcher>) -> Self {
        self.web_searcher = Some(web_searcher);
        self
    }

    /// Generates 1..=3 search queries for one source from the conversation.
    async fn generate_queries(&self, question: &str, source: &str) -> Vec<String> {
        let request = ChatRequest::new(vec![
            Message::system(format!(
                "Generate up to {} focused {} search queries for the user's question. \
                 Fewer is better when one query suffices.",
                MAX_QUERIES_PER_SOURCE, source
            )),
            Message::user(question),
        ]);
        match generate_structured::<QuerySet>(self.model.as_ref(), request, query_schema()).await {
            Ok(set) => {
                let mut queries = set.queries;
                queries.truncate(MAX_QUERIES_PER_SOURCE);
                queries
            }
            Err(err) => {
                tracing::warn!(source, error = %err, "query generation failed, falling back to raw question");
                vec![question.to_string()]
            }
        }
    }

    /// Binary relevance check. A failed grade drops the document.
    async fn grade(&self, question: &str, document: &RetrievedDocument) -> bool {
        let request = ChatRequest::new(vec![
            Message::system(
                "Grade whether the document is relevant to the question. \
                 Answer with a single boolean field.",
            ),
            Message::user(format!(
                "Question: {}\n\nDocument: {}",
                question, document.page_content
            )),
        ]);
        match generate_structured::<RelevanceGrade>(self.model.as_ref(), request, grade_schema())
            .await
        {
            Ok(grade) => grade.relevant,
            Err(err) => {
                tracing::warn!(error = %err, "document grading failed, dropping document");
                false
            }
        }
    }

    async fn run_queries(
        &self,
        queries: &[String],
        source: Source<'_>,
    ) -> Vec<RetrievedDocument> {
        let futures: Vec<_> = queries
            .iter()
            .map(|query| tokio::time::timeout(self.timeout, source.search(query)))
            .collect();
        let results = futures_util::future::join_all(futures).await;

        let mut documents = Vec::new();
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(Ok(found)) => documents.extend(found),
                Ok(Err(err)) => {
                    tracing::warn!(query = %query, error = %err, "search query failed");
                }
                Err(_) => {
                    tracing::warn!(query = %query, "search query timed out");
                }
            }
        }
        documents
    }

    /// Full retrieve phase: per-source query generation, concurrent search,
    /// then concurrent relevance grading, every sub-task under the timeout.
    /// Returns only graded-relevant documents, in search-result order.
    pub async fn retrieve(&self, question: &str) -> Vec<RetrievedDocument> {
        let mut candidates = Vec::new();

        if let Some(retriever) = &self.retriever {
            let queries = self.generate_queries(question, "project document").await;
            tracing::debug!(count = queries.len(), "running project retrieval queries");
            candidates.extend(
                self.run_queries(&queries, Source::Project(retriever.as_ref()))
                    .await,
            );
        }

        if let Some(web_searcher) = &self.web_searcher {
            let queries = self.generate_queries(question, "web").await;
            tracing::debug!(count = queries.len(), "running web search queries");
            candidates.extend(
                self.run_queries(&queries, Source::Web(web_searcher.as_ref()))
                    .await,
            );
        }

        let grades = {
            let futures: Vec<_> = candidates
                .iter()
                .map(|document| tokio::time::timeout(self.timeout, self.grade(question, document)))
                .collect();
            futures_util::future::join_all(futures).await
        };

        let mut relevant = Vec::new();
        for (document, graded) in candidates.into_iter().zip(grades) {
            match graded {
                Ok(true) => relevant.push(document),
                Ok(false) => {}
                Err(_) => {
                    tracing::warn!("document grading timed out, dropping document");
                }
            }
        }
        relevant
    }
}
