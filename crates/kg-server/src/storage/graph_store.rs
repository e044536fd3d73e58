//! Neo4j-backed versioned graph store.
//!
//! Every entity node and `REL` relationship carries `kg_version`; readers
//! always filter on it and writers always tag with it — that property is the
//! whole isolation mechanism between versions.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::kg::{Entity, EntityRef, KnowledgeGraph, Relationship, FALLBACK_PREDICATE};
use crate::storage::cypher::{as_u64, opt_string, CypherClient};
use crate::storage::{EdgeView, GraphSlice, GraphStats, NodeView, QueryLimits, StoreError};

const WRITE_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct Neo4jGraphStore {
    client: Arc<CypherClient>,
}

impl Neo4jGraphStore {
    pub fn new(client: Arc<CypherClient>) -> Self {
        Self { client }
    }

    pub async fn write_graph(&self, version: &str, graph: &KnowledgeGraph) -> Result<(), StoreError> {
        let node_rows: Vec<Value> = graph
            .entities
            .iter()
            .map(|e| {
                json!({
                    "kg_version": version,
                    "entity_label": e.label,
                    "name": e.name,
                    "props": {
                        "kg_version": version,
                        "entity_label": e.label,
                        "name": e.name,
                        "embeddings": e.embeddings,
                    },
                })
            })
            .collect();

        let rel_rows: Vec<Value> = graph
            .relationships
            .iter()
            .map(|r| {
                let predicate = if r.predicate.is_empty() {
                    FALLBACK_PREDICATE
                } else {
                    r.predicate.as_str()
                };
                json!({
                    "kg_version": version,
                    "start_label": r.source.label,
                    "start_name": r.source.name,
                    "end_label": r.target.label,
                    "end_name": r.target.name,
                    "predicate": predicate,
                    "props": {
                        "kg_version": version,
                        "predicate": predicate,
                        "atomic_facts": r.atomic_facts,
                        "t_obs": r.t_obs,
                        "t_start": r.t_start,
                        "t_end": r.t_end,
                        "embeddings": r.embeddings,
                    },
                })
            })
            .collect();

        let node_query = r#"
UNWIND $rows AS row
MERGE (e:Entity {kg_version: row.kg_version, entity_label: row.entity_label, name: row.name})
SET e += row.props
RETURN count(e) AS n
"#;
        let rel_query = r#"
UNWIND $rows AS row
MATCH (s:Entity {kg_version: row.kg_version, entity_label: row.start_label, name: row.start_name})
MATCH (t:Entity {kg_version: row.kg_version, entity_label: row.end_label, name: row.end_name})
MERGE (s)-[r:REL {kg_version: row.kg_version, predicate: row.predicate}]->(t)
SET r += row.props
RETURN count(r) AS n
"#;

        for batch in node_rows.chunks(WRITE_BATCH_SIZE) {
            self.client.run(node_query, json!({ "rows": batch })).await?;
        }
        for batch in rel_rows.chunks(WRITE_BATCH_SIZE) {
            self.client.run(rel_query, json!({ "rows": batch })).await?;
        }

        debug!(
            version,
            nodes = graph.entities.len(),
            edges = graph.relationships.len(),
            "graph written"
        );
        Ok(())
    }

    pub async fn load_graph(&self, version: &str) -> Result<KnowledgeGraph, StoreError> {
        let nodes = self
            .client
            .run("MATCH (e:Entity {kg_version: $v}) RETURN e", json!({ "v": version }))
            .await?;

        let mut graph = KnowledgeGraph::default();
        for i in 0..nodes.rows.len() {
            if let Some(obj) = nodes.get(i, "e").and_then(Value::as_object) {
                graph.upsert_entity(entity_from_props(obj));
            }
        }
        let known: HashSet<EntityRef> = graph.entities.iter().map(Entity::key).collect();

        let rels = self
            .client
            .run(
                r#"
MATCH (s:Entity {kg_version: $v})-[r:REL {kg_version: $v}]->(t:Entity {kg_version: $v})
RETURN s, properties(r) AS rp, t
"#,
                json!({ "v": version }),
            )
            .await?;

        for i in 0..rels.rows.len() {
            let (Some(sp), Some(rp), Some(tp)) = (
                rels.get(i, "s").and_then(Value::as_object),
                rels.get(i, "rp").and_then(Value::as_object),
                rels.get(i, "t").and_then(Value::as_object),
            ) else {
                continue;
            };
            let source = entity_ref_from_props(sp);
            let target = entity_ref_from_props(tp);
            if !known.contains(&source) || !known.contains(&target) {
                continue;
            }
            graph.upsert_relationship(relationship_from_props(source, target, rp));
        }

        Ok(graph)
    }

    pub async fn delete_version(&self, version: &str) -> Result<(), StoreError> {
        self.client
            .run(
                "MATCH (e:Entity {kg_version: $v}) DETACH DELETE e",
                json!({ "v": version }),
            )
            .await?;
        debug!(version, "version deleted");
        Ok(())
    }

    pub async fn entity_types(&self, version: &str) -> Result<Vec<String>, StoreError> {
        let result = self
            .client
            .run(
                r#"
MATCH (e:Entity {kg_version: $v})
RETURN DISTINCT e.entity_label AS t
ORDER BY t
"#,
                json!({ "v": version }),
            )
            .await?;
        Ok((0..result.rows.len())
            .filter_map(|i| opt_string(result.get(i, "t")))
            .collect())
    }

    pub async fn relation_types(&self, version: &str) -> Result<Vec<String>, StoreError> {
        let result = self
            .client
            .run(
                r#"
MATCH ()-[r:REL {kg_version: $v}]->()
RETURN DISTINCT r.predicate AS t
ORDER BY t
"#,
                json!({ "v": version }),
            )
            .await?;
        Ok((0..result.rows.len())
            .filter_map(|i| opt_string(result.get(i, "t")))
            .collect())
    }

    pub async fn stats(&self, version: &str) -> Result<GraphStats, StoreError> {
        let mut results = self
            .client
            .run_many(vec![
                (
                    "MATCH (e:Entity {kg_version: $v}) RETURN count(e) AS n, count(DISTINCT e.entity_label) AS t"
                        .to_string(),
                    json!({ "v": version }),
                ),
                (
                    "MATCH ()-[r:REL {kg_version: $v}]->() RETURN count(r) AS n".to_string(),
                    json!({ "v": version }),
                ),
            ])
            .await?;

        let rel = results.pop().unwrap_or_default();
        let ent = results.pop().unwrap_or_default();
        Ok(GraphStats {
            entity_count: as_u64(ent.get(0, "n")),
            node_type_count: as_u64(ent.get(0, "t")),
            relation_count: as_u64(rel.get(0, "n")),
        })
    }

    /// Keyword subgraph or bounded full-graph slice.
    ///
    /// Seed matching is case-insensitive substring on `name` (an upgrade
    /// from the case-sensitive minimum, mirrored by the in-memory backend).
    pub async fn query(
        &self,
        version: &str,
        q: Option<&str>,
        limits: &QueryLimits,
    ) -> Result<GraphSlice, StoreError> {
        let q = q.map(str::trim).filter(|s| !s.is_empty());
        let mut acc = SliceAccumulator::new(limits.include_properties);

        match q {
            Some(q) => {
                let seeds = self
                    .client
                    .run(
                        r#"
MATCH (s:Entity {kg_version: $v})
WHERE toLower(s.name) CONTAINS toLower($q)
RETURN s
LIMIT $seed_limit
"#,
                        json!({ "v": version, "q": q, "seed_limit": limits.max_seed_nodes }),
                    )
                    .await?;

                for i in 0..seeds.rows.len() {
                    if let Some(obj) = seeds.get(i, "s").and_then(Value::as_object) {
                        acc.add_node(obj);
                    }
                }

                if limits.depth > 0 && limits.limit_edges > 0 && !seeds.rows.is_empty() {
                    // Variable-length bounds cannot be parameterized; depth
                    // is a validated integer interpolated into the pattern.
                    let expand = format!(
                        r#"
MATCH (s:Entity {{kg_version: $v}})
WHERE toLower(s.name) CONTAINS toLower($q)
WITH s LIMIT $seed_limit
MATCH (s)-[rels:REL*1..{depth}]-(n:Entity {{kg_version: $v}})
WHERE ALL(r IN rels WHERE r.kg_version = $v)
UNWIND rels AS r
WITH DISTINCT r
LIMIT $limit_edges
MATCH (a)-[r]->(b)
RETURN a AS s, properties(r) AS rp, b AS t
"#,
                        depth = limits.depth
                    );
                    let rows = self
                        .client
                        .run(
                            &expand,
                            json!({
                                "v": version,
                                "q": q,
                                "seed_limit": limits.max_seed_nodes,
                                "limit_edges": limits.limit_edges + 1,
                            }),
                        )
                        .await?;
                    acc.add_edge_rows(&rows);
                }
            }
            None => {
                if limits.limit_edges > 0 {
                    let rows = self
                        .client
                        .run(
                            r#"
MATCH (s:Entity {kg_version: $v})-[r:REL {kg_version: $v}]->(t:Entity {kg_version: $v})
RETURN s, properties(r) AS rp, t
LIMIT $limit_edges
"#,
                            json!({ "v": version, "limit_edges": limits.limit_edges + 1 }),
                        )
                        .await?;
                    acc.add_edge_rows(&rows);
                }

                if acc.nodes.is_empty() {
                    let rows = self
                        .client
                        .run(
                            "MATCH (e:Entity {kg_version: $v}) RETURN e LIMIT $limit_nodes",
                            json!({ "v": version, "limit_nodes": limits.limit_nodes + 1 }),
                        )
                        .await?;
                    for i in 0..rows.rows.len() {
                        if let Some(obj) = rows.get(i, "e").and_then(Value::as_object) {
                            acc.add_node(obj);
                        }
                    }
                }
            }
        }

        Ok(acc.finish(limits.limit_nodes, limits.limit_edges))
    }
}

// ── Slice accumulation ────────────────────────────────────────────────────────

/// Collects deduplicated nodes/edges in first-seen order, then clamps to the
/// limits and drops edges whose endpoints were clamped away.
pub(crate) struct SliceAccumulator {
    include_properties: bool,
    pub(crate) nodes: Vec<NodeView>,
    node_ids: HashSet<String>,
    pub(crate) edges: Vec<EdgeView>,
    edge_ids: HashSet<String>,
}

impl SliceAccumulator {
    pub(crate) fn new(include_properties: bool) -> Self {
        Self {
            include_properties,
            nodes: Vec::new(),
            node_ids: HashSet::new(),
            edges: Vec::new(),
            edge_ids: HashSet::new(),
        }
    }

    pub(crate) fn add_node(&mut self, props: &Map<String, Value>) {
        let label = str_prop(props, "entity_label");
        let name = str_prop(props, "name");
        let id = format!("{label}:{name}");
        if !self.node_ids.insert(id.clone()) {
            return;
        }
        self.nodes.push(NodeView {
            id,
            types: vec!["Entity".to_string(), label],
            name: if name.is_empty() { None } else { Some(name) },
            properties: self.include_properties.then(|| clean_props(props)),
        });
    }

    pub(crate) fn add_edge(
        &mut self,
        sp: &Map<String, Value>,
        rp: &Map<String, Value>,
        tp: &Map<String, Value>,
    ) {
        self.add_node(sp);
        self.add_node(tp);

        let source = format!("{}:{}", str_prop(sp, "entity_label"), str_prop(sp, "name"));
        let target = format!("{}:{}", str_prop(tp, "entity_label"), str_prop(tp, "name"));
        let predicate = {
            let p = str_prop(rp, "predicate");
            if p.is_empty() {
                FALLBACK_PREDICATE.to_string()
            } else {
                p
            }
        };
        let id = format!("{source}->{predicate}->{target}");
        if !self.edge_ids.insert(id.clone()) {
            return;
        }
        self.edges.push(EdgeView {
            id,
            edge_type: predicate,
            source,
            target,
            properties: self.include_properties.then(|| clean_props(rp)),
        });
    }

    fn add_edge_rows(&mut self, rows: &crate::storage::cypher::QueryResult) {
        for i in 0..rows.rows.len() {
            let (Some(sp), Some(rp), Some(tp)) = (
                rows.get(i, "s").and_then(Value::as_object),
                rows.get(i, "rp").and_then(Value::as_object),
                rows.get(i, "t").and_then(Value::as_object),
            ) else {
                continue;
            };
            self.add_edge(sp, rp, tp);
        }
    }

    pub(crate) fn finish(mut self, limit_nodes: usize, limit_edges: usize) -> GraphSlice {
        let mut truncated = false;
        if self.nodes.len() > limit_nodes {
            truncated = true;
            self.nodes.truncate(limit_nodes);
        }
        if self.edges.len() > limit_edges {
            truncated = true;
            self.edges.truncate(limit_edges);
        }

        let kept: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        let edges = self
            .edges
            .into_iter()
            .filter(|e| kept.contains(e.source.as_str()) && kept.contains(e.target.as_str()))
            .collect();

        GraphSlice { nodes: self.nodes, edges, truncated }
    }
}

// ── Property conversion ───────────────────────────────────────────────────────

fn str_prop(props: &Map<String, Value>, key: &str) -> String {
    props
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_list(props: &Map<String, Value>, key: &str) -> Vec<String> {
    props
        .get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn float_list(props: &Map<String, Value>, key: &str) -> Option<Vec<f32>> {
    props.get(key).and_then(Value::as_array).map(|a| {
        a.iter()
            .filter_map(Value::as_f64)
            .map(|f| f as f32)
            .collect()
    })
}

/// Response property bag: everything except internals.
fn clean_props(props: &Map<String, Value>) -> Map<String, Value> {
    props
        .iter()
        .filter(|(k, _)| k.as_str() != "embeddings" && k.as_str() != "kg_version")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn entity_ref_from_props(props: &Map<String, Value>) -> EntityRef {
    EntityRef::new(str_prop(props, "entity_label"), str_prop(props, "name"))
}

fn entity_from_props(props: &Map<String, Value>) -> Entity {
    Entity {
        label: str_prop(props, "entity_label"),
        name: str_prop(props, "name"),
        embeddings: float_list(props, "embeddings"),
    }
}

fn relationship_from_props(
    source: EntityRef,
    target: EntityRef,
    props: &Map<String, Value>,
) -> Relationship {
    let predicate = {
        let p = str_prop(props, "predicate");
        if p.is_empty() {
            FALLBACK_PREDICATE.to_string()
        } else {
            p
        }
    };
    Relationship {
        source,
        target,
        predicate,
        atomic_facts: string_list(props, "atomic_facts"),
        t_obs: string_list(props, "t_obs"),
        t_start: string_list(props, "t_start"),
        t_end: string_list(props, "t_end"),
        embeddings: float_list(props, "embeddings"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(label: &str, name: &str) -> Map<String, Value> {
        let v = json!({ "entity_label": label, "name": name, "kg_version": "1", "embeddings": [0.1] });
        v.as_object().unwrap().clone()
    }

    #[test]
    fn accumulator_dedups_nodes_and_edges() {
        let mut acc = SliceAccumulator::new(false);
        let a = props("person", "Alice");
        let b = props("person", "Bob");
        let rp = json!({ "predicate": "knows", "kg_version": "1" });
        let rp = rp.as_object().unwrap();

        acc.add_edge(&a, rp, &b);
        acc.add_edge(&a, rp, &b);
        let slice = acc.finish(10, 10);
        assert_eq!(slice.nodes.len(), 2);
        assert_eq!(slice.edges.len(), 1);
        assert!(!slice.truncated);
        assert_eq!(slice.edges[0].id, "person:Alice->knows->person:Bob");
    }

    #[test]
    fn finish_truncates_and_drops_dangling_edges() {
        let mut acc = SliceAccumulator::new(false);
        let a = props("person", "Alice");
        let b = props("person", "Bob");
        let c = props("person", "Carol");
        let rp = json!({ "predicate": "knows" });
        let rp = rp.as_object().unwrap();

        acc.add_edge(&a, rp, &b);
        acc.add_edge(&b, rp, &c);
        let slice = acc.finish(2, 10);
        assert!(slice.truncated);
        assert_eq!(slice.nodes.len(), 2);
        // Bob->Carol lost its target node, so only Alice->Bob remains.
        assert_eq!(slice.edges.len(), 1);
    }

    #[test]
    fn clean_props_strips_internals() {
        let p = props("person", "Alice");
        let cleaned = clean_props(&p);
        assert!(cleaned.contains_key("name"));
        assert!(!cleaned.contains_key("kg_version"));
        assert!(!cleaned.contains_key("embeddings"));
    }

    #[test]
    fn relationship_falls_back_to_default_predicate() {
        let rp = json!({ "predicate": "" });
        let r = relationship_from_props(
            EntityRef::new("a", "x"),
            EntityRef::new("b", "y"),
            rp.as_object().unwrap(),
        );
        assert_eq!(r.predicate, FALLBACK_PREDICATE);
    }
}
