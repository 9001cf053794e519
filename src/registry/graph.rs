use super::{Registry, TypeMetadata, type_key};
use crate::core::{ErrorCode, FieldKind, FieldOptions, PersistError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// A relationship field, derived from a registered field map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub source_type: String,
    pub field_name: String,
    pub target_type: String,
    pub kind: FieldKind,
    pub options: FieldOptions,
}

fn relationships_of(meta: &TypeMetadata) -> Vec<Relationship> {
    meta.fields
        .relationship_fields()
        .filter_map(|(field, def)| {
            let target = def.options.related.clone()?;
            Some(Relationship {
                source_type: meta.name.clone(),
                field_name: field.to_string(),
                target_type: target,
                kind: def.kind,
                options: def.options.clone(),
            })
        })
        .collect()
}

/// Foreign-key edges between registered types, self-edges excluded.
fn edges(types: &BTreeMap<String, Arc<TypeMetadata>>) -> BTreeMap<String, BTreeSet<String>> {
    types
        .values()
        .map(|meta| {
            let targets = relationships_of(meta)
                .into_iter()
                .filter(|rel| rel.kind == FieldKind::ForeignKey)
                .filter_map(|rel| types.get(&type_key(&rel.target_type)))
                .filter(|target| target.name != meta.name)
                .map(|target| target.name.clone())
                .collect();
            (meta.name.clone(), targets)
        })
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Depth-first topological order, dependencies first.
pub(super) fn initialization_order(
    types: &BTreeMap<String, Arc<TypeMetadata>>,
) -> Result<Vec<String>> {
    let graph = edges(types);
    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut order = Vec::with_capacity(graph.len());
    let mut path = Vec::new();

    for node in graph.keys() {
        visit(node, &graph, &mut marks, &mut path, &mut order)?;
    }
    Ok(order)
}

fn visit(
    node: &str,
    graph: &BTreeMap<String, BTreeSet<String>>,
    marks: &mut HashMap<String, Mark>,
    path: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    match marks.get(node) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::InProgress) => {
            let start = path.iter().position(|n| n == node).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].to_vec();
            cycle.push(node.to_string());
            return Err(PersistError::configuration(
                ErrorCode::CircularDependency,
                format!(
                    "Circular dependency detected involving '{}': {}",
                    node,
                    cycle.join(" -> ")
                ),
            )
            .with_detail("type_name", node)
            .with_detail("cycle", &cycle));
        }
        None => {}
    }

    marks.insert(node.to_string(), Mark::InProgress);
    path.push(node.to_string());
    if let Some(targets) = graph.get(node) {
        for target in targets {
            visit(target, graph, marks, path, order)?;
        }
    }
    path.pop();
    marks.insert(node.to_string(), Mark::Done);
    order.push(node.to_string());
    Ok(())
}

impl Registry {
    /// Each type mapped to the registered types its foreign keys point at.
    pub fn dependency_graph(&self) -> BTreeMap<String, BTreeSet<String>> {
        match self.types.read() {
            Ok(types) => edges(&types),
            Err(_) => BTreeMap::new(),
        }
    }

    /// Registered types ordered so every dependency precedes its dependents.
    pub fn initialization_order(&self) -> Result<Vec<String>> {
        let types = self.types.read()?;
        initialization_order(&types)
    }

    /// Relationships declared on `type_name`. Unknown types yield nothing.
    pub fn relationships(&self, type_name: &str) -> Vec<Relationship> {
        self.get(type_name)
            .map(|meta| relationships_of(&meta))
            .unwrap_or_default()
    }

    /// Relationships on any registered type that target `type_name`.
    pub fn inverse_relationships(&self, type_name: &str) -> Vec<Relationship> {
        let Ok(types) = self.types.read() else {
            return Vec::new();
        };
        let key = type_key(type_name);
        types
            .values()
            .flat_map(|meta| relationships_of(meta))
            .filter(|rel| type_key(&rel.target_type) == key)
            .collect()
    }

    /// The relationship behind `type_name.field`, or a configuration error
    /// describing what is missing.
    pub fn relationship(&self, type_name: &str, field: &str) -> Result<Relationship> {
        let meta = self.require(type_name)?;
        relationships_of(&meta)
            .into_iter()
            .find(|rel| rel.field_name == field)
            .ok_or_else(|| {
                PersistError::configuration(
                    ErrorCode::UnknownRelationship,
                    format!("'{}.{}' is not a relationship field", meta.name, field),
                )
                .with_detail("type_name", &meta.name)
                .with_detail("field", field)
            })
    }

    /// The foreign key on `target` that points back at `source`.
    pub fn inverse_foreign_key(&self, source: &str, target: &str) -> Option<Relationship> {
        let source_key = type_key(source);
        self.relationships(target)
            .into_iter()
            .find(|rel| {
                rel.kind == FieldKind::ForeignKey && type_key(&rel.target_type) == source_key
            })
    }
}

#[cfg(test)]
mod tests {
    use crate::core::FieldDef;
    use crate::registry::{Registry, TypeDescriptor};

    fn fk(name: &str, field: &str, target: &str) -> TypeDescriptor {
        TypeDescriptor::new(name).field(field, FieldDef::foreign_key(target))
    }

    #[test]
    fn acyclic_chain_orders_dependencies_first() {
        let registry = Registry::new();
        registry.register(fk("X", "y", "Y")).expect("x");
        registry.register(fk("Y", "z", "Z")).expect("y");
        registry.register(TypeDescriptor::new("Z")).expect("z");

        assert_eq!(
            registry.initialization_order().expect("order"),
            vec!["Z", "Y", "X"]
        );
    }

    #[test]
    fn cycle_is_rejected_and_rolled_back() {
        let registry = Registry::new();
        registry.register(fk("X", "y", "Y")).expect("x");
        let err = registry.register(fk("Y", "x", "X")).unwrap_err();

        assert_eq!(err.code(), crate::core::ErrorCode::CircularDependency);
        assert!(err.message().contains("'X'") || err.message().contains("'Y'"));
        assert!(!registry.is_registered("Y"));
        assert!(registry.initialization_order().is_ok());
    }

    #[test]
    fn edges_ignore_unregistered_targets_and_self_references() {
        let registry = Registry::new();
        registry
            .register(
                TypeDescriptor::new("Node")
                    .field("parent", FieldDef::foreign_key("Node"))
                    .field("owner", FieldDef::foreign_key("Ghost")),
            )
            .expect("node");
        let graph = registry.dependency_graph();
        assert!(graph["Node"].is_empty());
        assert_eq!(registry.initialization_order().expect("order"), vec!["Node"]);
    }

    #[test]
    fn relationships_and_inverses() {
        let registry = Registry::new();
        registry
            .register(
                TypeDescriptor::new("Author")
                    .field("books", FieldDef::one_to_many("Book"))
                    .field("name", FieldDef::text()),
            )
            .expect("author");
        registry
            .register(fk("Book", "author", "Author"))
            .expect("book");

        assert_eq!(registry.relationships("Author").len(), 1);
        assert!(registry.relationships("Nobody").is_empty());

        let inverse = registry.inverse_relationships("author");
        assert_eq!(inverse.len(), 1);
        assert_eq!(inverse[0].source_type, "Book");

        let back = registry.inverse_foreign_key("Author", "Book").expect("inverse");
        assert_eq!(back.field_name, "author");

        let err = registry.relationship("Author", "name").unwrap_err();
        assert_eq!(err.code(), crate::core::ErrorCode::UnknownRelationship);
    }
}
