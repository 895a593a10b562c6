use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::Span;

/// One partner's price for a resource and range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Offer {
    pub source: String,
    pub resource_id: Ulid,
    pub span: Span,
    pub total_cents: i64,
    pub currency: String,
}

#[derive(Debug)]
pub struct SourceError(pub String);

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "partner source error: {}", self.0)
    }
}

impl std::error::Error for SourceError {}

/// An upstream inventory/pricing partner.
#[async_trait]
pub trait PartnerSource: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, resource_id: Ulid, span: Span) -> Result<Vec<Offer>, SourceError>;
}

/// Fixed-offer source for development and tests.
pub struct StaticSource {
    name: String,
    offers: Vec<Offer>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, offers: Vec<Offer>) -> Self {
        Self {
            name: name.into(),
            offers,
        }
    }
}

#[async_trait]
impl PartnerSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, resource_id: Ulid, span: Span) -> Result<Vec<Offer>, SourceError> {
        Ok(self
            .offers
            .iter()
            .filter(|o| o.resource_id == resource_id && o.span.overlaps(&span))
            .cloned()
            .collect())
    }
}

/// Query every source concurrently and merge the answers: failed or slow
/// sources are logged and skipped, offers whose range the local ledger
/// already claims are filtered out, duplicates collapse, and the rest sort
/// by price then start.
pub async fn aggregate(
    engine: &Engine,
    sources: &[Arc<dyn PartnerSource>],
    resource_id: Ulid,
    span: Span,
    source_timeout: Duration,
) -> Vec<Offer> {
    let lookups = sources.iter().map(|source| {
        let source = source.clone();
        async move {
            let name = source.name().to_string();
            match tokio::time::timeout(source_timeout, source.search(resource_id, span)).await {
                Ok(Ok(offers)) => offers,
                Ok(Err(e)) => {
                    tracing::warn!("search source {name} failed: {e}");
                    Vec::new()
                }
                Err(_) => {
                    tracing::warn!("search source {name} timed out");
                    Vec::new()
                }
            }
        }
    });

    let mut offers: Vec<Offer> = futures::future::join_all(lookups)
        .await
        .into_iter()
        .flatten()
        .collect();

    let mut filtered = Vec::with_capacity(offers.len());
    for offer in offers.drain(..) {
        let free = engine
            .is_available(offer.resource_id, offer.span.start, offer.span.end)
            .await
            .unwrap_or(false);
        if free {
            filtered.push(offer);
        }
    }

    filtered.sort_by(|a, b| {
        (a.total_cents, a.span.start, a.source.as_str())
            .cmp(&(b.total_cents, b.span.start, b.source.as_str()))
    });
    filtered.dedup_by(|a, b| a.source == b.source && a.span == b.span && a.resource_id == b.resource_id);
    filtered
}
