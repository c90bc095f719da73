//! Query plans: fetch nodes, the selection sets they carry, and the GraphQL
//! documents sent to subgraphs.

use graphql_parser::query::Value as GraphQLValue;
use serde_json::{Map, Value};
use std::fmt::{self, Write};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
        }
    }
}

/// One step of a response path; `Flatten` stands for every item of a list.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathStep {
    Key(String),
    Flatten,
}

pub fn display_path(path: &[PathStep]) -> String {
    if path.is_empty() {
        return "<root>".to_string();
    }
    path.iter()
        .map(|step| match step {
            PathStep::Key(key) => key.as_str(),
            PathStep::Flatten => "@",
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSelection {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<(String, GraphQLValue<'static, String>)>,
    pub selection_set: SelectionSet,
}

impl FieldSelection {
    pub fn new(name: impl Into<String>) -> Self {
        FieldSelection {
            alias: None,
            name: name.into(),
            arguments: Vec::new(),
            selection_set: SelectionSet::default(),
        }
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InlineFragment {
    pub type_condition: Option<String>,
    pub selection_set: SelectionSet,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Field(FieldSelection),
    InlineFragment(InlineFragment),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectionSet {
    pub items: Vec<Selection>,
}

impl SelectionSet {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldSelection> {
        self.items.iter().filter_map(|item| match item {
            Selection::Field(field) => Some(field),
            Selection::InlineFragment(_) => None,
        })
    }

    pub fn has_typename(&self) -> bool {
        self.fields()
            .any(|field| field.name == "__typename" && field.alias.is_none())
    }

    pub fn add_typename(&mut self) {
        if !self.has_typename() {
            self.items
                .push(Selection::Field(FieldSelection::new("__typename")));
        }
    }

    /// Ensures a plain argument-less `field` is selected and returns the
    /// response key under which it will appear. A private alias is used when
    /// the client already took `field` as response key for something else.
    pub fn require_field(&mut self, field: &str) -> String {
        let mut taken = false;
        for existing in self.fields() {
            if existing.response_key() == field {
                if existing.name == field && existing.arguments.is_empty() {
                    return field.to_string();
                }
                taken = true;
            }
        }

        let mut selection = FieldSelection::new(field);
        if taken {
            selection.alias = Some(format!("__key_{field}"));
        }
        let response_key = selection.response_key().to_string();
        if !self.fields().any(|f| f.response_key() == response_key) {
            self.items.push(Selection::Field(selection));
        }
        response_key
    }

    /// Names of the variables referenced by arguments, in first-use order.
    pub fn variable_usages(&self) -> Vec<String> {
        let mut usages = Vec::new();
        self.collect_variables(&mut usages);
        usages
    }

    fn collect_variables(&self, usages: &mut Vec<String>) {
        for item in &self.items {
            match item {
                Selection::Field(field) => {
                    for (_, value) in &field.arguments {
                        collect_value_variables(value, usages);
                    }
                    field.selection_set.collect_variables(usages);
                }
                Selection::InlineFragment(fragment) => {
                    fragment.selection_set.collect_variables(usages)
                }
            }
        }
    }
}

fn collect_value_variables(value: &GraphQLValue<'static, String>, usages: &mut Vec<String>) {
    match value {
        GraphQLValue::Variable(name) => {
            if !usages.contains(name) {
                usages.push(name.clone());
            }
        }
        GraphQLValue::List(items) => {
            for item in items {
                collect_value_variables(item, usages);
            }
        }
        GraphQLValue::Object(fields) => {
            for item in fields.values() {
                collect_value_variables(item, usages);
            }
        }
        _ => {}
    }
}

impl fmt::Display for SelectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for item in &self.items {
            f.write_char(' ')?;
            match item {
                Selection::Field(field) => {
                    if let Some(alias) = &field.alias {
                        write!(f, "{alias}: ")?;
                    }
                    f.write_str(&field.name)?;
                    if !field.arguments.is_empty() {
                        f.write_char('(')?;
                        for (i, (name, value)) in field.arguments.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "{name}: {value}")?;
                        }
                        f.write_char(')')?;
                    }
                    if !field.selection_set.is_empty() {
                        write!(f, " {}", field.selection_set)?;
                    }
                }
                Selection::InlineFragment(fragment) => {
                    f.write_str("...")?;
                    if let Some(condition) = &fragment.type_condition {
                        write!(f, " on {condition}")?;
                    }
                    write!(f, " {}", fragment.selection_set)?;
                }
            }
        }
        f.write_str(" }")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyField {
    pub name: String,
    /// Where the key value sits in the parent object of the merged response.
    pub response_key: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchKind {
    /// Fields of a root operation type.
    Root,
    /// An `_entities` fetch enriching the objects at the node's path.
    Entity {
        type_name: String,
        requires: Vec<KeyField>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchNode {
    pub id: usize,
    pub service_name: String,
    pub kind: FetchKind,
    /// Response path of the subtree this node fills.
    pub path: Vec<PathStep>,
    pub selection_set: SelectionSet,
    /// The operation document sent to the subgraph.
    pub operation: String,
    pub operation_name: Option<String>,
    pub variable_usages: Vec<String>,
    /// Nodes that must complete before this one may start.
    pub depends_on: Vec<usize>,
}

impl FetchNode {
    pub fn is_entity_fetch(&self) -> bool {
        matches!(self.kind, FetchKind::Entity { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    pub kind: OperationKind,
    pub root_type: String,
    /// The client selection after fragment expansion and `@skip`/`@include`,
    /// used to shape the final response.
    pub response_shape: SelectionSet,
    pub nodes: Vec<FetchNode>,
    pub variables: Map<String, Value>,
}

impl QueryPlan {
    pub fn node(&self, id: usize) -> Option<&FetchNode> {
        self.nodes.get(id)
    }

    /// Human readable rendering used in debug logs and tests.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            let _ = write!(
                out,
                "[{}] {} @ {}",
                node.id,
                node.service_name,
                display_path(&node.path)
            );
            if !node.depends_on.is_empty() {
                let deps: Vec<String> = node.depends_on.iter().map(usize::to_string).collect();
                let _ = write!(out, " after {}", deps.join(","));
            }
            let _ = writeln!(out, ": {}", node.operation);
        }
        out
    }
}
