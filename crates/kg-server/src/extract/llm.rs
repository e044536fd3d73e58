//! LLM-driven extractor.
//!
//! Three stages, each behind the relevant throttle:
//! 1. per-chunk atomic-fact extraction (chat),
//! 2. per-fact entity/relation extraction (chat),
//! 3. embeddings for entities that do not have one yet (embeddings).
//!
//! Chunk and fact fan-out uses a `JoinSet`; effective parallelism is set by
//! the throttle's `max_in_flight`, not by the spawn count. Results merge in
//! input order so repeated runs shape the graph deterministically.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::kg::{Entity, EntityRef, KnowledgeGraph, Relationship, FALLBACK_PREDICATE};
use crate::llm::{estimate_tokens, ChatClient, EmbeddingsClient};
use crate::throttle::{CallError, Throttle};

use super::ExtractError;

const EMBED_BATCH_SIZE: usize = 64;

const FACTS_SYSTEM: &str = "\
You are an atomic-fact extractor. Given a paragraph and its observation_date:
- List each self-contained factual statement the paragraph explicitly makes.
- Keep proper nouns exactly as written; never translate or rephrase them.
- Do not add information the paragraph does not state.
- Resolve relative time expressions (\"last year\", \"next month\") against
  observation_date into absolute dates.
Respond with JSON only: {\"atomic_facts\": [\"...\"]}";

const TRIPLES_SYSTEM: &str = "\
You are a knowledge-graph triple extractor. Given one atomic fact:
- List the named entities with a short lowercase type label
  (person, organization, location, event, concept, ...).
- List binary relations between those entities; predicates are short
  snake_case verbs. Optional t_start / t_end are ISO dates when the fact
  states when the relation begins or ends.
Respond with JSON only:
{\"entities\": [{\"name\": \"...\", \"label\": \"...\"}],
 \"relations\": [{\"source\": \"...\", \"predicate\": \"...\", \"target\": \"...\",
                \"t_start\": null, \"t_end\": null}]}";

#[derive(Debug, Clone)]
pub struct LlmExtractor {
    chat: ChatClient,
    embeddings: EmbeddingsClient,
    chat_throttle: Throttle,
    embeddings_throttle: Throttle,
}

impl LlmExtractor {
    pub fn new(
        chat: ChatClient,
        embeddings: EmbeddingsClient,
        chat_throttle: Throttle,
        embeddings_throttle: Throttle,
    ) -> Self {
        Self { chat, embeddings, chat_throttle, embeddings_throttle }
    }

    pub async fn build(
        &self,
        chunks: &[String],
        base: Option<KnowledgeGraph>,
        obs_timestamp: &str,
        cancel: &CancellationToken,
    ) -> Result<KnowledgeGraph, ExtractError> {
        let contexts: Vec<String> = chunks
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if contexts.is_empty() {
            return Err(ExtractError::Empty("no non-empty text chunks".into()));
        }

        let facts = self.extract_atomic_facts(&contexts, obs_timestamp, cancel).await?;
        if facts.is_empty() {
            return Err(ExtractError::Empty("no atomic facts extracted".into()));
        }
        debug!(chunks = contexts.len(), facts = facts.len(), "atomic facts extracted");

        let mut graph = base.unwrap_or_default();
        self.extract_triples(&facts, obs_timestamp, &mut graph, cancel).await?;
        if graph.is_empty() {
            return Err(ExtractError::Empty("no entities or relations extracted".into()));
        }

        self.embed_new_entities(&mut graph, cancel).await?;
        Ok(graph)
    }

    async fn extract_atomic_facts(
        &self,
        contexts: &[String],
        obs_timestamp: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ExtractError> {
        let mut set: JoinSet<Result<(usize, Vec<String>), ExtractError>> = JoinSet::new();
        for (idx, context) in contexts.iter().enumerate() {
            let chat = self.chat.clone();
            let throttle = self.chat_throttle.clone();
            let cancel = cancel.clone();
            let prompt = format!("observation_date: {obs_timestamp}\n\nparagraph:\n{context}");
            set.spawn(async move {
                let estimate = estimate_tokens(FACTS_SYSTEM) + estimate_tokens(&prompt);
                let response = throttle
                    .call(estimate, &cancel, || {
                        let chat = chat.clone();
                        let prompt = prompt.clone();
                        async move { chat.complete(Some(FACTS_SYSTEM), &prompt).await }
                    })
                    .await?;
                match parse_json_block::<FactsBlock>(&response.text) {
                    Ok(block) => Ok((idx, block.atomic_facts)),
                    Err(e) => {
                        // One malformed reply loses one chunk, not the build.
                        warn!(chunk = idx, error = %e, "unparseable atomic-fact reply, skipping chunk");
                        Ok((idx, vec![]))
                    }
                }
            });
        }

        let mut per_chunk = collect_ordered(set).await?;
        per_chunk.sort_by_key(|(idx, _)| *idx);
        Ok(per_chunk
            .into_iter()
            .flat_map(|(_, facts)| facts)
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect())
    }

    async fn extract_triples(
        &self,
        facts: &[String],
        obs_timestamp: &str,
        graph: &mut KnowledgeGraph,
        cancel: &CancellationToken,
    ) -> Result<(), ExtractError> {
        let mut set: JoinSet<Result<(usize, Option<TripleBlock>), ExtractError>> = JoinSet::new();
        for (idx, fact) in facts.iter().enumerate() {
            let chat = self.chat.clone();
            let throttle = self.chat_throttle.clone();
            let cancel = cancel.clone();
            let fact = fact.clone();
            set.spawn(async move {
                let estimate = estimate_tokens(TRIPLES_SYSTEM) + estimate_tokens(&fact);
                let response = throttle
                    .call(estimate, &cancel, || {
                        let chat = chat.clone();
                        let fact = fact.clone();
                        async move { chat.complete(Some(TRIPLES_SYSTEM), &fact).await }
                    })
                    .await?;
                match parse_json_block::<TripleBlock>(&response.text) {
                    Ok(block) => Ok((idx, Some(block))),
                    Err(e) => {
                        warn!(fact = idx, error = %e, "unparseable triple reply, skipping fact");
                        Ok((idx, None))
                    }
                }
            });
        }

        let mut blocks = collect_ordered(set).await?;
        blocks.sort_by_key(|(idx, _)| *idx);

        for (idx, block) in blocks {
            let Some(block) = block else { continue };
            let fact = &facts[idx];

            for entity in &block.entities {
                let name = entity.name.trim();
                if name.is_empty() {
                    continue;
                }
                graph.upsert_entity(Entity {
                    label: normalize_label(&entity.label),
                    name: name.to_string(),
                    embeddings: None,
                });
            }

            for relation in block.relations {
                let source = relation.source.trim();
                let target = relation.target.trim();
                if source.is_empty() || target.is_empty() {
                    continue;
                }
                let predicate = {
                    let p = relation.predicate.trim();
                    if p.is_empty() {
                        FALLBACK_PREDICATE.to_string()
                    } else {
                        p.to_string()
                    }
                };
                let source_ref = resolve_ref(&block.entities, graph, source);
                let target_ref = resolve_ref(&block.entities, graph, target);
                // Endpoints may be mentioned only in the relation list.
                graph.upsert_entity(Entity {
                    label: source_ref.label.clone(),
                    name: source_ref.name.clone(),
                    embeddings: None,
                });
                graph.upsert_entity(Entity {
                    label: target_ref.label.clone(),
                    name: target_ref.name.clone(),
                    embeddings: None,
                });
                graph.upsert_relationship(Relationship {
                    source: source_ref,
                    target: target_ref,
                    predicate,
                    atomic_facts: vec![fact.clone()],
                    t_obs: vec![obs_timestamp.to_string()],
                    t_start: relation.t_start.into_iter().collect(),
                    t_end: relation.t_end.into_iter().collect(),
                    embeddings: None,
                });
            }
        }
        Ok(())
    }

    async fn embed_new_entities(
        &self,
        graph: &mut KnowledgeGraph,
        cancel: &CancellationToken,
    ) -> Result<(), ExtractError> {
        let pending: Vec<String> = graph
            .entities
            .iter()
            .filter(|e| e.embeddings.is_none())
            .map(|e| e.name.clone())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "embedding new entities");

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(pending.len());
        for batch in pending.chunks(EMBED_BATCH_SIZE) {
            let batch_owned: Vec<String> = batch.to_vec();
            let estimate: u64 = batch_owned.iter().map(|t| estimate_tokens(t)).sum();
            let response = self
                .embeddings_throttle
                .call(estimate, cancel, || {
                    let client = self.embeddings.clone();
                    let batch = batch_owned.clone();
                    async move { client.embed(&batch).await }
                })
                .await?;
            vectors.extend(response.vectors);
        }

        let mut it = vectors.into_iter();
        for entity in graph.entities.iter_mut().filter(|e| e.embeddings.is_none()) {
            entity.embeddings = it.next();
        }
        Ok(())
    }
}

/// Pick the label a relation endpoint was declared with, falling back to an
/// already-known graph entity of the same name, then to `unknown`.
fn resolve_ref(entities: &[TripleEntity], graph: &KnowledgeGraph, name: &str) -> EntityRef {
    if let Some(e) = entities.iter().find(|e| e.name.trim() == name) {
        return EntityRef::new(normalize_label(&e.label), name);
    }
    if let Some(e) = graph.entities.iter().find(|e| e.name == name) {
        return EntityRef::new(e.label.clone(), name);
    }
    EntityRef::new("unknown", name)
}

fn normalize_label(label: &str) -> String {
    let label = label.trim().to_lowercase();
    if label.is_empty() {
        "unknown".to_string()
    } else {
        label
    }
}

async fn collect_ordered<T: Send + 'static>(
    mut set: JoinSet<Result<T, ExtractError>>,
) -> Result<Vec<T>, ExtractError> {
    let mut out = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(item)) => out.push(item),
            Ok(Err(e)) => {
                set.abort_all();
                return Err(e);
            }
            Err(e) => {
                set.abort_all();
                return Err(ExtractError::Call(CallError::Upstream(
                    crate::llm::ProviderError::Transport(format!("extraction task panicked: {e}")),
                )));
            }
        }
    }
    Ok(out)
}

/// Parse the first JSON object out of a chat reply, tolerating markdown
/// fences and prose around it.
fn parse_json_block<T: DeserializeOwned>(text: &str) -> Result<T, ExtractError> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<T>(trimmed) {
        return Ok(v);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            return serde_json::from_str::<T>(&trimmed[start..=end])
                .map_err(|e| ExtractError::Parse(format!("invalid JSON in reply: {e}")));
        }
    }
    Err(ExtractError::Parse("no JSON object in reply".into()))
}

// ── Reply shapes ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FactsBlock {
    #[serde(default)]
    atomic_facts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TripleBlock {
    #[serde(default)]
    entities: Vec<TripleEntity>,
    #[serde(default)]
    relations: Vec<TripleRelation>,
}

#[derive(Debug, Deserialize)]
struct TripleEntity {
    name: String,
    #[serde(default)]
    label: String,
}

#[derive(Debug, Deserialize)]
struct TripleRelation {
    source: String,
    #[serde(default)]
    predicate: String,
    target: String,
    #[serde(default)]
    t_start: Option<String>,
    #[serde(default)]
    t_end: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ConcurrencyConfig, RateLimitConfig, RetryConfig};
    use crate::llm::providers::dummy::{DummyChat, DummyEmbeddings};

    fn unthrottled() -> Throttle {
        Throttle::new(
            ConcurrencyConfig { max_in_flight: 0 },
            RateLimitConfig { rpm: 0, tpm: 0 },
            &RetryConfig {
                max_retries: 0,
                initial_backoff_s: 0.1,
                max_backoff_s: 1.0,
                backoff_multiplier: 2.0,
            },
        )
    }

    fn extractor(replies: Vec<String>) -> LlmExtractor {
        LlmExtractor::new(
            ChatClient::Dummy(DummyChat::with_replies(replies)),
            EmbeddingsClient::Dummy(DummyEmbeddings),
            unthrottled(),
            unthrottled(),
        )
    }

    #[test]
    fn parse_json_block_handles_fences_and_prose() {
        let fenced = "```json\n{\"atomic_facts\": [\"a\"]}\n```";
        let block: FactsBlock = parse_json_block(fenced).unwrap();
        assert_eq!(block.atomic_facts, vec!["a"]);

        let prose = "Sure, here you go: {\"atomic_facts\": []} hope that helps";
        let block: FactsBlock = parse_json_block(prose).unwrap();
        assert!(block.atomic_facts.is_empty());

        assert!(parse_json_block::<FactsBlock>("no json here").is_err());
    }

    #[tokio::test]
    async fn build_produces_entities_relations_and_embeddings() {
        // One chunk → one facts call; one fact → one triples call.
        let e = extractor(vec![
            r#"{"atomic_facts": ["Alice knows Bob."]}"#.to_string(),
            r#"{"entities": [{"name": "Alice", "label": "person"}, {"name": "Bob", "label": "person"}],
                "relations": [{"source": "Alice", "predicate": "knows", "target": "Bob"}]}"#
                .to_string(),
        ]);
        let cancel = CancellationToken::new();
        let graph = e
            .build(&["Alice knows Bob.".to_string()], None, "2024-01-01T00:00:00Z", &cancel)
            .await
            .unwrap();

        assert_eq!(graph.entities.len(), 2);
        assert_eq!(graph.relationships.len(), 1);
        assert_eq!(graph.relationships[0].predicate, "knows");
        assert_eq!(graph.relationships[0].atomic_facts, vec!["Alice knows Bob."]);
        assert_eq!(graph.relationships[0].t_obs, vec!["2024-01-01T00:00:00Z"]);
        assert!(graph.entities.iter().all(|e| e.embeddings.is_some()));
    }

    #[tokio::test]
    async fn build_merges_into_base_graph() {
        let e = extractor(vec![
            r#"{"atomic_facts": ["Bob lives in Paris."]}"#.to_string(),
            r#"{"entities": [{"name": "Bob", "label": "person"}, {"name": "Paris", "label": "location"}],
                "relations": [{"source": "Bob", "predicate": "lives_in", "target": "Paris"}]}"#
                .to_string(),
        ]);
        let mut base = KnowledgeGraph::default();
        base.upsert_entity(Entity { label: "person".into(), name: "Alice".into(), embeddings: Some(vec![0.0]) });

        let cancel = CancellationToken::new();
        let graph = e
            .build(&["Bob lives in Paris.".to_string()], Some(base), "2024-01-01T00:00:00Z", &cancel)
            .await
            .unwrap();

        assert_eq!(graph.entities.len(), 3);
        assert_eq!(graph.relationships.len(), 1);
    }

    #[tokio::test]
    async fn empty_chunks_fail_fast() {
        let e = extractor(vec![]);
        let cancel = CancellationToken::new();
        let err = e
            .build(&["   ".to_string()], None, "2024-01-01T00:00:00Z", &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no non-empty text chunks"));
    }

    #[tokio::test]
    async fn no_extractable_facts_fail_the_build() {
        let e = extractor(vec![r#"{"atomic_facts": []}"#.to_string()]);
        let cancel = CancellationToken::new();
        let err = e
            .build(&["noise".to_string()], None, "2024-01-01T00:00:00Z", &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no atomic facts"));
    }

    #[tokio::test]
    async fn relation_endpoint_not_in_entity_list_gets_unknown_label() {
        let e = extractor(vec![
            r#"{"atomic_facts": ["Alice admires the Eiffel Tower."]}"#.to_string(),
            r#"{"entities": [{"name": "Alice", "label": "person"}],
                "relations": [{"source": "Alice", "predicate": "admires", "target": "Eiffel Tower"}]}"#
                .to_string(),
        ]);
        let cancel = CancellationToken::new();
        let graph = e
            .build(&["Alice admires the Eiffel Tower.".to_string()], None, "2024-01-01T00:00:00Z", &cancel)
            .await
            .unwrap();
        let tower = graph.entities.iter().find(|e| e.name == "Eiffel Tower").unwrap();
        assert_eq!(tower.label, "unknown");
    }
}
