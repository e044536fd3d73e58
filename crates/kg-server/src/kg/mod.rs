//! Knowledge-graph model types shared by the extractor and the graph store.
//!
//! An entity is identified by (`label`, `name`) within one graph; a
//! relationship by (source, `predicate`, target). Property bags stay small
//! and typed — embeddings on both, fact provenance on relationships.

use serde::{Deserialize, Serialize};

/// Predicate used when the extractor produced an empty relation name.
pub const FALLBACK_PREDICATE: &str = "related_to";

/// Identity of an entity within one graph version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub label: String,
    pub name: String,
}

impl EntityRef {
    pub fn new(label: impl Into<String>, name: impl Into<String>) -> Self {
        Self { label: label.into(), name: name.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub label: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<f32>>,
}

impl Entity {
    pub fn key(&self) -> EntityRef {
        EntityRef::new(self.label.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub source: EntityRef,
    pub target: EntityRef,
    pub predicate: String,
    #[serde(default)]
    pub atomic_facts: Vec<String>,
    /// Observation timestamps (RFC 3339) for the facts backing this edge.
    #[serde(default)]
    pub t_obs: Vec<String>,
    #[serde(default)]
    pub t_start: Vec<String>,
    #[serde(default)]
    pub t_end: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<f32>>,
}

/// One complete graph, as produced by the extractor and persisted per
/// version. Not deduplicated by construction — use [`KnowledgeGraph::upsert_entity`]
/// and [`KnowledgeGraph::upsert_relationship`] to build it merge-safely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl KnowledgeGraph {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    /// Insert or update an entity; existing embeddings are kept unless the
    /// incoming entity carries its own.
    pub fn upsert_entity(&mut self, entity: Entity) {
        if let Some(existing) = self
            .entities
            .iter_mut()
            .find(|e| e.label == entity.label && e.name == entity.name)
        {
            if entity.embeddings.is_some() {
                existing.embeddings = entity.embeddings;
            }
        } else {
            self.entities.push(entity);
        }
    }

    /// Insert or merge a relationship by (source, predicate, target);
    /// fact lists append, timestamps accumulate.
    pub fn upsert_relationship(&mut self, rel: Relationship) {
        if let Some(existing) = self.relationships.iter_mut().find(|r| {
            r.source == rel.source && r.target == rel.target && r.predicate == rel.predicate
        }) {
            for fact in rel.atomic_facts {
                if !existing.atomic_facts.contains(&fact) {
                    existing.atomic_facts.push(fact);
                }
            }
            existing.t_obs.extend(rel.t_obs);
            existing.t_start.extend(rel.t_start);
            existing.t_end.extend(rel.t_end);
            if rel.embeddings.is_some() {
                existing.embeddings = rel.embeddings;
            }
        } else {
            self.relationships.push(rel);
        }
    }
}
