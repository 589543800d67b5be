//! Entity definitions and the dependency graph
//!
//! A [`Registry`] is the validated set of entity definitions for one
//! pipeline: every entity's attributes, primary key, and parent edges.
//! Construction goes through [`RegistryBuilder`], which rejects bad graphs
//! (unknown parents, uncovered foreign keys, cycles) up front so the rest
//! of the engine can assume a well-formed acyclic schema.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{Error, RegistryError, Result};
use crate::key::AttrType;

/// Role an entity plays in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Rows entered by operators or ingest tooling
    Manual,
    /// Small reference tables (methods, models)
    Lookup,
    /// Rows computed by reading external acquisition files
    Imported,
    /// Rows computed purely from upstream database state
    Computed,
    /// Detail rows owned by a master entity, written atomically with it
    Part,
}

impl EntityKind {
    /// Whether the populate scheduler is allowed to fill this entity
    pub fn is_auto(&self) -> bool {
        matches!(self, EntityKind::Imported | EntityKind::Computed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Manual => "manual",
            EntityKind::Lookup => "lookup",
            EntityKind::Imported => "imported",
            EntityKind::Computed => "computed",
            EntityKind::Part => "part",
        }
    }
}

/// How a child depends on a parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Parent key is embedded in the child's primary key; deleting the
    /// parent cascades into the child
    Primary,
    /// Parent key appears as ordinary attributes; deletion is restricted
    Secondary,
}

/// One declared attribute
#[derive(Debug, Clone)]
pub struct AttributeDef {
    pub name: String,
    pub ty: AttrType,
    pub nullable: bool,
}

/// One dependency edge to a parent entity
#[derive(Debug, Clone)]
pub struct ParentEdge {
    pub parent: String,
    pub kind: EdgeKind,
}

/// Definition of a single entity (one table once materialized)
#[derive(Debug, Clone)]
pub struct EntityDef {
    name: String,
    kind: EntityKind,
    key: Vec<AttributeDef>,
    attributes: Vec<AttributeDef>,
    parents: Vec<ParentEdge>,
    master: Option<String>,
}

impl EntityDef {
    fn new(name: impl Into<String>, kind: EntityKind) -> Self {
        EntityDef {
            name: name.into(),
            kind,
            key: Vec::new(),
            attributes: Vec::new(),
            parents: Vec::new(),
            master: None,
        }
    }

    pub fn manual(name: impl Into<String>) -> Self {
        EntityDef::new(name, EntityKind::Manual)
    }

    pub fn lookup(name: impl Into<String>) -> Self {
        EntityDef::new(name, EntityKind::Lookup)
    }

    pub fn imported(name: impl Into<String>) -> Self {
        EntityDef::new(name, EntityKind::Imported)
    }

    pub fn computed(name: impl Into<String>) -> Self {
        EntityDef::new(name, EntityKind::Computed)
    }

    /// Part entity owned by `master`. The primary edge to the master is
    /// implied and added here.
    pub fn part(name: impl Into<String>, master: impl Into<String>) -> Self {
        let master = master.into();
        let mut def = EntityDef::new(name, EntityKind::Part);
        def.parents.push(ParentEdge {
            parent: master.clone(),
            kind: EdgeKind::Primary,
        });
        def.master = Some(master);
        def
    }

    /// Append a primary-key attribute. Key attributes are never nullable.
    pub fn key_attr(mut self, name: impl Into<String>, ty: AttrType) -> Self {
        self.key.push(AttributeDef {
            name: name.into(),
            ty,
            nullable: false,
        });
        self
    }

    /// Append a required secondary attribute
    pub fn attr(mut self, name: impl Into<String>, ty: AttrType) -> Self {
        self.attributes.push(AttributeDef {
            name: name.into(),
            ty,
            nullable: false,
        });
        self
    }

    /// Append a nullable secondary attribute
    pub fn nullable_attr(mut self, name: impl Into<String>, ty: AttrType) -> Self {
        self.attributes.push(AttributeDef {
            name: name.into(),
            ty,
            nullable: true,
        });
        self
    }

    /// Declare a dependency edge to a parent entity
    pub fn parent(mut self, name: impl Into<String>, kind: EdgeKind) -> Self {
        self.parents.push(ParentEdge {
            parent: name.into(),
            kind,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn key(&self) -> &[AttributeDef] {
        &self.key
    }

    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    pub fn parents(&self) -> &[ParentEdge] {
        &self.parents
    }

    pub fn primary_parents(&self) -> impl Iterator<Item = &ParentEdge> {
        self.parents.iter().filter(|e| e.kind == EdgeKind::Primary)
    }

    pub fn master(&self) -> Option<&str> {
        self.master.as_deref()
    }

    /// Key and secondary attributes in declaration order
    pub fn all_attributes(&self) -> impl Iterator<Item = &AttributeDef> {
        self.key.iter().chain(self.attributes.iter())
    }

    pub fn key_attr_names(&self) -> Vec<&str> {
        self.key.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.all_attributes().find(|a| a.name == name)
    }

    pub fn is_key_attr(&self, name: &str) -> bool {
        self.key.iter().any(|a| a.name == name)
    }
}

/// Validated entity set with a fixed topological order
#[derive(Debug, Clone)]
pub struct Registry {
    entities: Vec<EntityDef>,
    by_name: HashMap<String, usize>,
    topo: Vec<String>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            entities: Vec::new(),
        }
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.by_name.get(name).map(|&i| &self.entities[i])
    }

    pub fn expect_entity(&self, name: &str) -> Result<&EntityDef> {
        self.entity(name)
            .ok_or_else(|| Error::Registry(RegistryError::UnknownEntity(name.to_string())))
    }

    /// Direct parents of an entity
    pub fn parents_of(&self, name: &str) -> Result<&[ParentEdge]> {
        Ok(self.expect_entity(name)?.parents())
    }

    /// Direct children of an entity, in registration order
    pub fn children_of(&self, name: &str) -> Vec<&EntityDef> {
        self.entities
            .iter()
            .filter(|e| e.parents.iter().any(|p| p.parent == name))
            .collect()
    }

    /// Part entities owned by a master, in registration order
    pub fn parts_of(&self, master: &str) -> Vec<&EntityDef> {
        self.entities
            .iter()
            .filter(|e| e.master.as_deref() == Some(master))
            .collect()
    }

    /// Every-parent-before-every-child ordering over all entities
    pub fn topological_order(&self) -> &[String] {
        &self.topo
    }

    /// Entities in topological order
    pub fn entities_in_order(&self) -> impl Iterator<Item = &EntityDef> {
        self.topo.iter().filter_map(|name| self.entity(name))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Collects entity definitions and validates them into a [`Registry`]
pub struct RegistryBuilder {
    entities: Vec<EntityDef>,
}

/// Table names the engine itself claims within a schema prefix
const RESERVED_NAMES: &[&str] = &["jobs", "sequences"];

impl RegistryBuilder {
    pub fn entity(mut self, def: EntityDef) -> Self {
        self.entities.push(def);
        self
    }

    pub fn build(self) -> Result<Registry> {
        let entities = self.entities;

        let mut by_name: HashMap<String, usize> = HashMap::new();
        for (i, def) in entities.iter().enumerate() {
            if !is_valid_identifier(&def.name) {
                return Err(RegistryError::InvalidName(def.name.clone()).into());
            }
            if RESERVED_NAMES.contains(&def.name.as_str()) {
                return Err(RegistryError::ReservedName(def.name.clone()).into());
            }
            if by_name.insert(def.name.clone(), i).is_some() {
                return Err(RegistryError::DuplicateEntity(def.name.clone()).into());
            }
        }

        for def in &entities {
            validate_attributes(def)?;
            validate_parents(def, &by_name, &entities)?;
            validate_coverage(def, &by_name, &entities)?;
            if def.kind.is_auto() {
                validate_key_source(def, &by_name, &entities)?;
            }
        }

        let topo = topological_sort(&entities, &by_name)?;

        Ok(Registry {
            entities,
            by_name,
            topo,
        })
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn validate_attributes(def: &EntityDef) -> Result<()> {
    if def.key.is_empty() {
        return Err(RegistryError::EmptyKey(def.name.clone()).into());
    }
    let mut seen: HashSet<&str> = HashSet::new();
    for attr in def.all_attributes() {
        if !is_valid_identifier(&attr.name) {
            return Err(RegistryError::InvalidName(attr.name.clone()).into());
        }
        if !seen.insert(&attr.name) {
            return Err(RegistryError::DuplicateAttribute {
                entity: def.name.clone(),
                attribute: attr.name.clone(),
            }
            .into());
        }
    }
    Ok(())
}

fn validate_parents(
    def: &EntityDef,
    by_name: &HashMap<String, usize>,
    entities: &[EntityDef],
) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for edge in &def.parents {
        if edge.parent == def.name || !by_name.contains_key(&edge.parent) {
            return Err(RegistryError::UnknownParent {
                child: def.name.clone(),
                parent: edge.parent.clone(),
            }
            .into());
        }
        if !seen.insert(&edge.parent) {
            return Err(RegistryError::DuplicateParent {
                child: def.name.clone(),
                parent: edge.parent.clone(),
            }
            .into());
        }
    }

    if let Some(master) = &def.master {
        let master_def = &entities[by_name[master]];
        if master_def.kind == EntityKind::Part {
            return Err(RegistryError::InvalidMaster {
                part: def.name.clone(),
                master: master.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Every parent key attribute must exist on the child with the same type:
/// in the child's key for primary edges, anywhere for secondary edges.
fn validate_coverage(
    def: &EntityDef,
    by_name: &HashMap<String, usize>,
    entities: &[EntityDef],
) -> Result<()> {
    for edge in &def.parents {
        let parent = &entities[by_name[&edge.parent]];
        for parent_attr in parent.key() {
            let found = match edge.kind {
                EdgeKind::Primary => def
                    .key
                    .iter()
                    .find(|a| a.name == parent_attr.name)
                    .map(|a| a.ty),
                EdgeKind::Secondary => def.attribute(&parent_attr.name).map(|a| a.ty),
            };
            if found != Some(parent_attr.ty) {
                return Err(RegistryError::KeyNotCovered {
                    child: def.name.clone(),
                    parent: edge.parent.clone(),
                    attribute: parent_attr.name.clone(),
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Auto-populated entities are enumerated by joining their primary parents,
/// so their key must be exactly the union of those parents' keys.
fn validate_key_source(
    def: &EntityDef,
    by_name: &HashMap<String, usize>,
    entities: &[EntityDef],
) -> Result<()> {
    let mut union: HashSet<&str> = HashSet::new();
    let mut has_primary = false;
    for edge in def.primary_parents() {
        has_primary = true;
        let parent = &entities[by_name[&edge.parent]];
        for attr in parent.key() {
            union.insert(&attr.name);
        }
    }
    if !has_primary {
        return Err(RegistryError::NoPrimaryParents(def.name.clone()).into());
    }

    for attr in def.key() {
        if !union.contains(attr.name.as_str()) {
            return Err(RegistryError::KeySourceMismatch {
                entity: def.name.clone(),
                attribute: attr.name.clone(),
            }
            .into());
        }
    }
    for name in union {
        if !def.is_key_attr(name) {
            return Err(RegistryError::KeySourceMismatch {
                entity: def.name.clone(),
                attribute: name.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Kahn's algorithm; FIFO seeded in registration order keeps the result
/// deterministic across runs.
fn topological_sort(
    entities: &[EntityDef],
    by_name: &HashMap<String, usize>,
) -> Result<Vec<String>> {
    let n = entities.len();
    let mut indegree = vec![0usize; n];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, def) in entities.iter().enumerate() {
        for edge in &def.parents {
            let p = by_name[&edge.parent];
            children[p].push(i);
            indegree[i] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = queue.pop_front() {
        order.push(entities[i].name.clone());
        for &c in &children[i] {
            indegree[c] -= 1;
            if indegree[c] == 0 {
                queue.push_back(c);
            }
        }
    }

    if order.len() < n {
        let stuck = entities
            .iter()
            .enumerate()
            .find(|(i, _)| indegree[*i] > 0)
            .map(|(_, d)| d.name.clone())
            .unwrap_or_default();
        return Err(RegistryError::DependencyCycle(stuck).into());
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_registry() -> Registry {
        Registry::builder()
            .entity(EntityDef::manual("session").key_attr("subject", AttrType::Text))
            .entity(
                EntityDef::imported("recording")
                    .parent("session", EdgeKind::Primary)
                    .key_attr("subject", AttrType::Text)
                    .attr("sampling_rate", AttrType::Real),
            )
            .entity(
                EntityDef::computed("analysis")
                    .parent("recording", EdgeKind::Primary)
                    .key_attr("subject", AttrType::Text),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let reg = chain_registry();
        let order = reg.topological_order();
        let pos = |n: &str| order.iter().position(|e| e == n).unwrap();
        assert!(pos("session") < pos("recording"));
        assert!(pos("recording") < pos("analysis"));
    }

    #[test]
    fn test_parents_and_children() {
        let reg = chain_registry();
        let parents = reg.parents_of("analysis").unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].parent, "recording");

        let children = reg.children_of("session");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "recording");
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = Registry::builder()
            .entity(
                EntityDef::manual("a")
                    .key_attr("id", AttrType::Int)
                    .parent("b", EdgeKind::Secondary),
            )
            .entity(
                EntityDef::manual("b")
                    .key_attr("id", AttrType::Int)
                    .parent("a", EdgeKind::Secondary),
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let err = Registry::builder()
            .entity(
                EntityDef::imported("recording")
                    .parent("session", EdgeKind::Primary)
                    .key_attr("subject", AttrType::Text),
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::UnknownParent { .. })
        ));
    }

    #[test]
    fn test_duplicate_entity_is_rejected() {
        let err = Registry::builder()
            .entity(EntityDef::manual("session").key_attr("id", AttrType::Int))
            .entity(EntityDef::manual("session").key_attr("id", AttrType::Int))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::DuplicateEntity(_))
        ));
    }

    #[test]
    fn test_reserved_name_is_rejected() {
        let err = Registry::builder()
            .entity(EntityDef::manual("jobs").key_attr("id", AttrType::Int))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::ReservedName(_))
        ));
    }

    #[test]
    fn test_primary_edge_requires_key_coverage() {
        // child key misses the parent's "subject" attribute
        let err = Registry::builder()
            .entity(EntityDef::manual("session").key_attr("subject", AttrType::Text))
            .entity(
                EntityDef::imported("recording")
                    .parent("session", EdgeKind::Primary)
                    .key_attr("recording_id", AttrType::Int),
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::KeyNotCovered { .. })
                | Error::Registry(RegistryError::KeySourceMismatch { .. })
        ));
    }

    #[test]
    fn test_key_type_mismatch_is_rejected() {
        let err = Registry::builder()
            .entity(EntityDef::manual("session").key_attr("subject", AttrType::Text))
            .entity(
                EntityDef::imported("recording")
                    .parent("session", EdgeKind::Primary)
                    .key_attr("subject", AttrType::Int),
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::KeyNotCovered { .. })
        ));
    }

    #[test]
    fn test_auto_entity_key_must_match_parent_union() {
        // extra key attribute not provided by any primary parent
        let err = Registry::builder()
            .entity(EntityDef::manual("session").key_attr("subject", AttrType::Text))
            .entity(
                EntityDef::computed("analysis")
                    .parent("session", EdgeKind::Primary)
                    .key_attr("subject", AttrType::Text)
                    .key_attr("analysis_id", AttrType::Int),
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::KeySourceMismatch { .. })
        ));
    }

    #[test]
    fn test_auto_entity_needs_primary_parent() {
        let err = Registry::builder()
            .entity(EntityDef::manual("session").key_attr("subject", AttrType::Text))
            .entity(
                EntityDef::computed("analysis")
                    .parent("session", EdgeKind::Secondary)
                    .key_attr("subject", AttrType::Text)
                    .attr("subject_note", AttrType::Text),
            )
            .build()
            .unwrap_err();
        // secondary edge alone cannot enumerate keys
        assert!(matches!(
            err,
            Error::Registry(RegistryError::NoPrimaryParents(_))
        ));
    }

    #[test]
    fn test_part_gets_implicit_master_edge() {
        let reg = Registry::builder()
            .entity(EntityDef::manual("session").key_attr("subject", AttrType::Text))
            .entity(
                EntityDef::part("session_directory", "session")
                    .key_attr("subject", AttrType::Text)
                    .attr("session_dir", AttrType::Text),
            )
            .build()
            .unwrap();

        let part = reg.entity("session_directory").unwrap();
        assert_eq!(part.master(), Some("session"));
        assert_eq!(part.parents()[0].parent, "session");
        assert_eq!(part.parents()[0].kind, EdgeKind::Primary);
        assert_eq!(reg.parts_of("session")[0].name(), "session_directory");
    }

    #[test]
    fn test_part_of_part_is_rejected() {
        let err = Registry::builder()
            .entity(EntityDef::manual("session").key_attr("subject", AttrType::Text))
            .entity(
                EntityDef::part("inner", "session").key_attr("subject", AttrType::Text),
            )
            .entity(
                EntityDef::part("nested", "inner").key_attr("subject", AttrType::Text),
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::InvalidMaster { .. })
        ));
    }

    #[test]
    fn test_secondary_edge_covered_by_secondary_attr() {
        let reg = Registry::builder()
            .entity(EntityDef::lookup("probe").key_attr("probe", AttrType::Text))
            .entity(
                EntityDef::manual("probe_insertion")
                    .parent("probe", EdgeKind::Secondary)
                    .key_attr("insertion_number", AttrType::Int)
                    .attr("probe", AttrType::Text),
            )
            .build()
            .unwrap();
        assert_eq!(reg.len(), 2);
        let order = reg.topological_order();
        assert_eq!(order[0], "probe");
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let err = Registry::builder()
            .entity(EntityDef::manual("Bad-Name").key_attr("id", AttrType::Int))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::InvalidName(_))
        ));
    }
}
