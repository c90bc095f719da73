//! Splits a client operation into fetch nodes against individual subgraphs.
//!
//! Root fields are assigned to the subgraph that owns them. While walking a
//! subgraph's selection, any field the subgraph cannot resolve itself moves
//! into an `_entities` fetch against its owner, sequenced after the node that
//! produces the entity's key.

use async_trait::async_trait;
use graphql_parser::query::{
    self, Definition, Directive, FragmentDefinition, OperationDefinition, TypeCondition,
    VariableDefinition,
};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::query_plan::{
    FetchKind, FetchNode, FieldSelection, InlineFragment, KeyField, OperationKind, PathStep,
    QueryPlan, Selection, SelectionSet,
};
use crate::supergraph::{FieldDefinition, SupergraphSchema, TypeRef};
use crate::{GraphQLRequest, PlanningError};

#[async_trait]
pub trait QueryPlanner {
    async fn plan_query(
        &self,
        schema: &SupergraphSchema,
        request: &GraphQLRequest,
    ) -> Result<QueryPlan, PlanningError>;
}

#[derive(Default)]
pub struct FederatedQueryPlanner;

impl FederatedQueryPlanner {
    pub fn new() -> Self {
        FederatedQueryPlanner
    }

    pub fn plan(
        &self,
        schema: &SupergraphSchema,
        request: &GraphQLRequest,
    ) -> Result<QueryPlan, PlanningError> {
        let document = query::parse_query::<String>(&request.query)
            .map_err(|e| PlanningError::Parse(e.to_string()))?;

        let mut fragments = HashMap::new();
        let mut operations = Vec::new();
        for definition in &document.definitions {
            match definition {
                Definition::Operation(operation) => operations.push(operation),
                Definition::Fragment(fragment) => {
                    fragments.insert(fragment.name.as_str(), fragment);
                }
            }
        }

        let operation = select_operation(&operations, request.operation_name.as_deref())?;
        let (kind, name, variable_definitions, selection_set) = match operation {
            OperationDefinition::SelectionSet(set) => (OperationKind::Query, None, &[][..], set),
            OperationDefinition::Query(q) => (
                OperationKind::Query,
                q.name.as_deref(),
                &q.variable_definitions[..],
                &q.selection_set,
            ),
            OperationDefinition::Mutation(m) => (
                OperationKind::Mutation,
                m.name.as_deref(),
                &m.variable_definitions[..],
                &m.selection_set,
            ),
            OperationDefinition::Subscription(_) => {
                return Err(PlanningError::UnsupportedOperation("subscription"));
            }
        };

        let root_type = match kind {
            OperationKind::Query => schema.query_type.clone(),
            OperationKind::Mutation => schema
                .mutation_type
                .clone()
                .ok_or(PlanningError::UnsupportedOperation("mutation"))?,
        };

        let variables = request.variables.clone().unwrap_or_default();
        let mut condition_variables = variables.clone();
        for definition in variable_definitions {
            if let (false, Some(default)) = (
                condition_variables.contains_key(&definition.name),
                &definition.default_value,
            ) {
                condition_variables.insert(definition.name.clone(), to_json(default));
            }
        }

        let normalizer = Normalizer {
            schema,
            fragments,
            variables: &condition_variables,
        };
        let response_shape = normalizer.normalize(selection_set, &root_type, &mut Vec::new())?;

        let mut builder = PlanBuilder {
            schema,
            nodes: Vec::new(),
        };
        builder.build_root(kind, &root_type, &response_shape)?;

        let nodes = builder
            .nodes
            .into_iter()
            .enumerate()
            .map(|(id, draft)| draft.finish(id, kind, name, variable_definitions))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(QueryPlan {
            kind,
            root_type,
            response_shape,
            nodes,
            variables,
        })
    }
}

#[async_trait]
impl QueryPlanner for FederatedQueryPlanner {
    async fn plan_query(
        &self,
        schema: &SupergraphSchema,
        request: &GraphQLRequest,
    ) -> Result<QueryPlan, PlanningError> {
        self.plan(schema, request)
    }
}

fn select_operation<'o, 'd>(
    operations: &[&'o OperationDefinition<'d, String>],
    operation_name: Option<&str>,
) -> Result<&'o OperationDefinition<'d, String>, PlanningError> {
    match operation_name {
        Some(wanted) => operations
            .iter()
            .find(|op| operation_name_of(op) == Some(wanted))
            .copied()
            .ok_or_else(|| PlanningError::UnknownOperation(wanted.to_string())),
        None => match operations {
            [] => Err(PlanningError::NoOperation),
            [operation] => Ok(operation),
            _ => Err(PlanningError::OperationNameRequired),
        },
    }
}

fn operation_name_of<'o>(operation: &'o OperationDefinition<'_, String>) -> Option<&'o str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

/// Converts a GraphQL literal to JSON, used for default variable values.
fn to_json(value: &query::Value<'_, String>) -> Value {
    match value {
        query::Value::Variable(_) | query::Value::Null => Value::Null,
        query::Value::Int(number) => number.as_i64().map(Value::from).unwrap_or(Value::Null),
        query::Value::Float(float) => Value::from(*float),
        query::Value::String(string) => Value::String(string.clone()),
        query::Value::Boolean(boolean) => Value::Bool(*boolean),
        query::Value::Enum(name) => Value::String(name.clone()),
        query::Value::List(items) => Value::Array(items.iter().map(to_json).collect()),
        query::Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), to_json(value)))
                .collect(),
        ),
    }
}

/// Validates the client selection against the supergraph, expands fragment
/// spreads, applies `@skip`/`@include` and merges fields sharing a response
/// key.
struct Normalizer<'a, 'd> {
    schema: &'a SupergraphSchema,
    fragments: HashMap<&'a str, &'a FragmentDefinition<'d, String>>,
    variables: &'a Map<String, Value>,
}

impl<'d> Normalizer<'_, 'd> {
    fn normalize(
        &self,
        set: &query::SelectionSet<'d, String>,
        parent: &str,
        spreading: &mut Vec<String>,
    ) -> Result<SelectionSet, PlanningError> {
        let mut out = SelectionSet::default();
        self.collect(set, parent, spreading, &mut out)?;
        Ok(out)
    }

    fn collect(
        &self,
        set: &query::SelectionSet<'d, String>,
        parent: &str,
        spreading: &mut Vec<String>,
        out: &mut SelectionSet,
    ) -> Result<(), PlanningError> {
        for item in &set.items {
            match item {
                query::Selection::Field(field) => {
                    if self.included(&field.directives) {
                        let selection = self.field(field, parent, spreading)?;
                        merge_field(out, selection)?;
                    }
                }
                query::Selection::FragmentSpread(spread) => {
                    if !self.included(&spread.directives) {
                        continue;
                    }
                    let name = spread.fragment_name.as_str();
                    let fragment = self
                        .fragments
                        .get(name)
                        .ok_or_else(|| PlanningError::UnknownFragment(name.to_string()))?;
                    if spreading.iter().any(|s| s == name) {
                        return Err(PlanningError::FragmentCycle(name.to_string()));
                    }
                    let TypeCondition::On(condition) = &fragment.type_condition;
                    spreading.push(name.to_string());
                    self.fragment(Some(condition), &fragment.selection_set, parent, spreading, out)?;
                    spreading.pop();
                }
                query::Selection::InlineFragment(inline) => {
                    if !self.included(&inline.directives) {
                        continue;
                    }
                    let condition = inline
                        .type_condition
                        .as_ref()
                        .map(|TypeCondition::On(condition)| condition.as_str());
                    self.fragment(condition, &inline.selection_set, parent, spreading, out)?;
                }
            }
        }
        Ok(())
    }

    fn fragment(
        &self,
        condition: Option<&str>,
        set: &query::SelectionSet<'d, String>,
        parent: &str,
        spreading: &mut Vec<String>,
        out: &mut SelectionSet,
    ) -> Result<(), PlanningError> {
        let Some(condition) = condition else {
            return self.collect(set, parent, spreading, out);
        };
        if self.schema.get_type(condition).is_none() {
            return Err(PlanningError::UnknownType(condition.to_string()));
        }

        if self.schema.is_abstract(parent) && condition != parent {
            let selection_set = self.normalize(set, condition, spreading)?;
            out.items.push(Selection::InlineFragment(InlineFragment {
                type_condition: Some(condition.to_string()),
                selection_set,
            }));
            Ok(())
        } else if self.schema.type_condition_matches(condition, parent) {
            self.collect(set, parent, spreading, out)
        } else {
            // An object type never matches a different object type.
            Ok(())
        }
    }

    fn field(
        &self,
        field: &query::Field<'d, String>,
        parent: &str,
        spreading: &mut Vec<String>,
    ) -> Result<FieldSelection, PlanningError> {
        let mut selection = FieldSelection {
            alias: field.alias.clone(),
            name: field.name.clone(),
            arguments: field
                .arguments
                .iter()
                .map(|(name, value)| (name.clone(), value.into_static()))
                .collect(),
            selection_set: SelectionSet::default(),
        };
        if field.name == "__typename" {
            return Ok(selection);
        }

        let definition =
            self.schema
                .field(parent, &field.name)
                .ok_or_else(|| PlanningError::UnknownField {
                    type_name: parent.to_string(),
                    field: field.name.clone(),
                })?;
        let named = definition.ty.named_type();
        if self.schema.is_composite(named) {
            selection.selection_set = self.normalize(&field.selection_set, named, spreading)?;
        }
        Ok(selection)
    }

    fn included(&self, directives: &[Directive<'d, String>]) -> bool {
        directives.iter().all(|directive| {
            let condition = directive
                .arguments
                .iter()
                .find(|(name, _)| name == "if")
                .map(|(_, value)| match value {
                    query::Value::Boolean(b) => *b,
                    query::Value::Variable(name) => self
                        .variables
                        .get(name)
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    _ => false,
                });
            match directive.name.as_str() {
                "skip" => !condition.unwrap_or(false),
                "include" => condition.unwrap_or(true),
                _ => true,
            }
        })
    }
}

/// Merges `selection` into a field of `out` with the same response key.
/// Fields sharing a response key must select the same field with the same
/// arguments.
fn merge_field(out: &mut SelectionSet, selection: FieldSelection) -> Result<(), PlanningError> {
    for item in out.items.iter_mut() {
        let Selection::Field(existing) = item else {
            continue;
        };
        if existing.response_key() != selection.response_key() {
            continue;
        }
        if existing.name != selection.name
            || !same_arguments(&existing.arguments, &selection.arguments)
        {
            return Err(PlanningError::FieldConflict {
                response_key: selection.response_key().to_string(),
                first: existing.name.clone(),
                second: selection.name.clone(),
            });
        }
        for child in selection.selection_set.items {
            match child {
                Selection::Field(field) => merge_field(&mut existing.selection_set, field)?,
                fragment => existing.selection_set.items.push(fragment),
            }
        }
        return Ok(());
    }
    out.items.push(Selection::Field(selection));
    Ok(())
}

fn same_arguments<T: PartialEq>(first: &[(String, T)], second: &[(String, T)]) -> bool {
    first.len() == second.len() && first.iter().all(|argument| second.contains(argument))
}

struct NodeDraft {
    service: String,
    kind: FetchKind,
    path: Vec<PathStep>,
    selection_set: SelectionSet,
    depends_on: Vec<usize>,
}

impl NodeDraft {
    fn finish(
        self,
        id: usize,
        kind: OperationKind,
        operation_name: Option<&str>,
        variable_definitions: &[VariableDefinition<'_, String>],
    ) -> Result<FetchNode, PlanningError> {
        let variable_usages = self.selection_set.variable_usages();
        let mut declarations = Vec::new();
        if self.kind != FetchKind::Root {
            declarations.push("$representations: [_Any!]!".to_string());
        }
        for usage in &variable_usages {
            let definition = variable_definitions
                .iter()
                .find(|definition| &definition.name == usage)
                .ok_or_else(|| PlanningError::UndefinedVariable(usage.clone()))?;
            let mut declaration = format!(
                "${}: {}",
                definition.name,
                TypeRef::from(&definition.var_type)
            );
            if let Some(default) = &definition.default_value {
                declaration.push_str(&format!(" = {default}"));
            }
            declarations.push(declaration);
        }

        let operation_name = operation_name.map(|name| format!("{name}__{}__{id}", self.service));
        let mut header = match self.kind {
            FetchKind::Root => kind.as_str().to_string(),
            FetchKind::Entity { .. } => OperationKind::Query.as_str().to_string(),
        };
        if let Some(name) = &operation_name {
            header.push(' ');
            header.push_str(name);
        }
        if !declarations.is_empty() {
            header.push_str(&format!("({})", declarations.join(", ")));
        }

        let operation = match &self.kind {
            FetchKind::Root => format!("{header} {}", self.selection_set),
            FetchKind::Entity { type_name, .. } => format!(
                "{header} {{ _entities(representations: $representations) {{ ... on {type_name} {} }} }}",
                self.selection_set
            ),
        };

        Ok(FetchNode {
            id,
            service_name: self.service,
            kind: self.kind,
            path: self.path,
            selection_set: self.selection_set,
            operation,
            operation_name,
            variable_usages,
            depends_on: self.depends_on,
        })
    }
}

struct PlanBuilder<'s> {
    schema: &'s SupergraphSchema,
    nodes: Vec<NodeDraft>,
}

impl<'s> PlanBuilder<'s> {
    fn push_node(
        &mut self,
        service: &str,
        kind: FetchKind,
        path: &[PathStep],
        depends_on: Vec<usize>,
    ) -> usize {
        self.nodes.push(NodeDraft {
            service: service.to_string(),
            kind,
            path: path.to_vec(),
            selection_set: SelectionSet::default(),
            depends_on,
        });
        self.nodes.len() - 1
    }

    fn owner<'f>(
        &self,
        type_name: &str,
        field: &'f FieldDefinition,
    ) -> Result<&'f str, PlanningError> {
        field
            .resolvers
            .first()
            .map(String::as_str)
            .ok_or_else(|| PlanningError::NoOwningSubgraph {
                type_name: type_name.to_string(),
                field: field.name.clone(),
            })
    }

    fn definition(&self, type_name: &str, field: &str) -> Result<&'s FieldDefinition, PlanningError> {
        self.schema
            .field(type_name, field)
            .ok_or_else(|| PlanningError::UnknownField {
                type_name: type_name.to_string(),
                field: field.to_string(),
            })
    }

    fn build_root(
        &mut self,
        kind: OperationKind,
        root_type: &str,
        shape: &SelectionSet,
    ) -> Result<(), PlanningError> {
        // Root fields grouped per owning subgraph. Queries merge every field
        // of a subgraph into one node; mutations only merge adjacent fields
        // so they keep running in document order.
        let mut groups: Vec<(String, SelectionSet)> = Vec::new();
        for field in shape.fields().filter(|f| f.name != "__typename") {
            let owner = self
                .owner(root_type, self.definition(root_type, &field.name)?)?
                .to_string();
            let existing = match kind {
                OperationKind::Query => groups.iter_mut().find(|(service, _)| *service == owner),
                OperationKind::Mutation => groups.last_mut().filter(|(service, _)| *service == owner),
            };
            match existing {
                Some((_, set)) => set.items.push(Selection::Field(field.clone())),
                None => groups.push((
                    owner,
                    SelectionSet {
                        items: vec![Selection::Field(field.clone())],
                    },
                )),
            }
        }

        let mut previous = None;
        for (service, set) in groups {
            let depends_on = match (kind, previous) {
                (OperationKind::Mutation, Some(id)) => vec![id],
                _ => Vec::new(),
            };
            let id = self.push_node(&service, FetchKind::Root, &[], depends_on);
            let selection_set = self.build_selection_set(id, &service, root_type, &set, &[])?;
            self.nodes[id].selection_set = selection_set;
            previous = Some(id);
        }
        Ok(())
    }

    fn build_selection_set(
        &mut self,
        node: usize,
        service: &str,
        parent_type: &str,
        set: &SelectionSet,
        path: &[PathStep],
    ) -> Result<SelectionSet, PlanningError> {
        let mut out = SelectionSet::default();
        let mut remote: IndexMap<String, SelectionSet> = IndexMap::new();

        for item in &set.items {
            match item {
                Selection::Field(field) if field.name == "__typename" => {
                    out.items.push(item.clone());
                }
                Selection::Field(field) => {
                    let definition = self.definition(parent_type, &field.name)?;
                    if self.schema.can_resolve(parent_type, &field.name, service) {
                        let selection = self.build_field(node, service, definition, field, path)?;
                        out.items.push(Selection::Field(selection));
                    } else {
                        let target = self.owner(parent_type, definition)?.to_string();
                        remote.entry(target).or_default().items.push(item.clone());
                    }
                }
                Selection::InlineFragment(fragment) => {
                    let condition = fragment
                        .type_condition
                        .clone()
                        .unwrap_or_else(|| parent_type.to_string());
                    let selection_set = self.build_selection_set(
                        node,
                        service,
                        &condition,
                        &fragment.selection_set,
                        path,
                    )?;
                    out.items.push(Selection::InlineFragment(InlineFragment {
                        type_condition: Some(condition),
                        selection_set,
                    }));
                }
            }
        }

        for (target, fields) in remote {
            let mut visiting = vec![service.to_string()];
            let entity = self.entity_node(
                node,
                service,
                parent_type,
                &target,
                path,
                &mut out,
                &mut visiting,
            )?;
            let selection_set =
                self.build_selection_set(entity, &target, parent_type, &fields, path)?;
            self.nodes[entity]
                .selection_set
                .items
                .extend(selection_set.items);
        }

        Ok(out)
    }

    fn build_field(
        &mut self,
        node: usize,
        service: &str,
        definition: &FieldDefinition,
        field: &FieldSelection,
        path: &[PathStep],
    ) -> Result<FieldSelection, PlanningError> {
        let mut selection = FieldSelection {
            selection_set: SelectionSet::default(),
            ..field.clone()
        };
        if field.selection_set.is_empty() {
            return Ok(selection);
        }

        let named = definition.ty.named_type();
        let mut child_path = path.to_vec();
        child_path.push(PathStep::Key(field.response_key().to_string()));
        child_path.extend(std::iter::repeat_n(PathStep::Flatten, definition.ty.list_depth()));

        let mut selection_set =
            self.build_selection_set(node, service, named, &field.selection_set, &child_path)?;
        if self.schema.is_abstract(named) {
            selection_set.add_typename();
        }
        selection.selection_set = selection_set;
        Ok(selection)
    }

    /// Finds or creates the `_entities` node fetching `entity` objects at
    /// `path` from `target`, on behalf of the node `parent` built by
    /// `service`. Key fields the parent can resolve are added to
    /// `parent_set`; others are fetched by further entity nodes first.
    #[allow(clippy::too_many_arguments)]
    fn entity_node(
        &mut self,
        parent: usize,
        service: &str,
        entity: &str,
        target: &str,
        path: &[PathStep],
        parent_set: &mut SelectionSet,
        visiting: &mut Vec<String>,
    ) -> Result<usize, PlanningError> {
        let existing = self.nodes.iter().position(|draft| {
            draft.service == target
                && draft.path == path
                && matches!(&draft.kind, FetchKind::Entity { type_name, .. } if type_name == entity)
        });
        if let Some(id) = existing {
            return Ok(id);
        }

        if visiting.iter().any(|s| s == target) {
            let mut subgraphs = visiting.clone();
            subgraphs.push(target.to_string());
            return Err(PlanningError::CyclicKeyDependency {
                type_name: entity.to_string(),
                subgraphs,
            });
        }

        let unsatisfiable = || PlanningError::UnsatisfiableKey {
            type_name: entity.to_string(),
            subgraph: target.to_string(),
        };
        let schema = self.schema;
        let ty = schema.get_type(entity).ok_or_else(unsatisfiable)?;
        let resolvable_by =
            |field: &str, subgraph: &str| schema.can_resolve(entity, field, subgraph);

        let keys: Vec<_> = ty.resolvable_keys(target).collect();
        let key = keys
            .iter()
            .find(|key| key.fields.iter().all(|field| resolvable_by(field, service)))
            .or(keys.first())
            .ok_or_else(unsatisfiable)?;

        parent_set.add_typename();
        visiting.push(target.to_string());
        let mut requires = Vec::new();
        let mut depends_on = vec![parent];
        for field in &key.fields {
            if resolvable_by(field, service) {
                let response_key = parent_set.require_field(field);
                requires.push(KeyField {
                    name: field.clone(),
                    response_key,
                });
                continue;
            }

            let provider = schema
                .field(entity, field)
                .and_then(|definition| definition.resolvers.iter().find(|s| *s != target))
                .ok_or_else(unsatisfiable)?;
            let provider_node = self.entity_node(
                parent, service, entity, provider, path, parent_set, visiting,
            )?;
            let response_key = self.nodes[provider_node].selection_set.require_field(field);
            requires.push(KeyField {
                name: field.clone(),
                response_key,
            });
            if !depends_on.contains(&provider_node) {
                depends_on.push(provider_node);
            }
        }
        visiting.pop();

        let kind = FetchKind::Entity {
            type_name: entity.to_string(),
            requires,
        };
        Ok(self.push_node(target, kind, path, depends_on))
    }
}
