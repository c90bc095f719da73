//! Shapes the merged subgraph data into the response the client asked for.
//!
//! Subgraph results carry fields the planner added for its own use (entity
//! keys, `__typename`, private key aliases) and arrive in fetch order. The
//! client selection is replayed over the merged tree so the response holds
//! exactly the requested fields, in query order, with GraphQL null
//! propagation applied to non-null fields. Nulls left by a failed fetch stay
//! where they are so the data of other subgraphs survives.

use serde_json::{Map, Value};

use crate::query_executor::ExecutionResult;
use crate::query_plan::{QueryPlan, Selection, SelectionSet};
use crate::supergraph::{SupergraphSchema, TypeRef};
use crate::{GraphQLError, GraphQLResponse, PathElement};

pub fn format_response(
    schema: &SupergraphSchema,
    plan: &QueryPlan,
    result: ExecutionResult,
) -> GraphQLResponse {
    let mut shaper = Shaper {
        schema,
        errors: result.errors,
        failed_paths: result.failed_paths,
        path: Vec::new(),
    };
    let root = match &result.data {
        Value::Object(root) => root.clone(),
        _ => Map::new(),
    };
    let data = shaper
        .shape_object(&plan.root_type, &plan.response_shape, &root)
        .map(Value::Object)
        .unwrap_or(Value::Null);

    GraphQLResponse {
        data: Some(data),
        errors: shaper.errors,
    }
}

struct Shaper<'s> {
    schema: &'s SupergraphSchema,
    errors: Vec<GraphQLError>,
    failed_paths: Vec<Vec<PathElement>>,
    path: Vec<PathElement>,
}

impl Shaper<'_> {
    /// `None` when a non-null field below came back null, meaning the
    /// object itself must be null.
    fn shape_object(
        &mut self,
        type_name: &str,
        set: &SelectionSet,
        source: &Map<String, Value>,
    ) -> Option<Map<String, Value>> {
        let mut out = Map::new();
        self.shape_into(type_name, set, source, &mut out)?;
        Some(out)
    }

    fn shape_into(
        &mut self,
        type_name: &str,
        set: &SelectionSet,
        source: &Map<String, Value>,
        out: &mut Map<String, Value>,
    ) -> Option<()> {
        let schema = self.schema;
        for item in &set.items {
            match item {
                Selection::Field(field) => {
                    let key = field.response_key();
                    if field.name == "__typename" {
                        let typename = source
                            .get(key)
                            .or_else(|| source.get("__typename"))
                            .cloned()
                            .unwrap_or_else(|| Value::from(type_name));
                        out.insert(key.to_string(), typename);
                        continue;
                    }

                    let Some(definition) = schema.field(type_name, &field.name) else {
                        continue;
                    };
                    let value = source.get(key).cloned().unwrap_or(Value::Null);

                    self.path.push(PathElement::Key(key.to_string()));
                    let completed = self.complete(
                        &definition.ty,
                        value,
                        &field.selection_set,
                        &format!("{type_name}.{}", field.name),
                    );
                    self.path.pop();

                    out.insert(key.to_string(), completed?);
                }
                Selection::InlineFragment(fragment) => {
                    let runtime_type = source
                        .get("__typename")
                        .and_then(Value::as_str)
                        .unwrap_or(type_name);
                    let condition = fragment.type_condition.as_deref().unwrap_or(type_name);
                    if schema.type_condition_matches(condition, runtime_type) {
                        self.shape_into(condition, &fragment.selection_set, source, out)?;
                    }
                }
            }
        }
        Some(())
    }

    fn complete(
        &mut self,
        ty: &TypeRef,
        value: Value,
        set: &SelectionSet,
        coordinate: &str,
    ) -> Option<Value> {
        match ty {
            TypeRef::NonNull(inner) => match self.complete_nullable(inner, value, set, coordinate) {
                Value::Null if self.inside_failed_fetch() => Some(Value::Null),
                Value::Null => {
                    self.report_null(coordinate);
                    None
                }
                value => Some(value),
            },
            _ => Some(self.complete_nullable(ty, value, set, coordinate)),
        }
    }

    fn complete_nullable(
        &mut self,
        ty: &TypeRef,
        value: Value,
        set: &SelectionSet,
        coordinate: &str,
    ) -> Value {
        match (ty, value) {
            (_, Value::Null) => Value::Null,
            (TypeRef::NonNull(inner), value) => self
                .complete(inner, value, set, coordinate)
                .unwrap_or(Value::Null),
            (TypeRef::List(inner), Value::Array(items)) => {
                let mut completed = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    self.path.push(PathElement::Index(index));
                    let item = self.complete(inner, item, set, coordinate);
                    self.path.pop();
                    match item {
                        Some(item) => completed.push(item),
                        None => return Value::Null,
                    }
                }
                Value::Array(completed)
            }
            (TypeRef::List(_), _) => Value::Null,
            (TypeRef::Named(name), Value::Object(object)) if self.schema.is_composite(name) => {
                let runtime_type = object
                    .get("__typename")
                    .and_then(Value::as_str)
                    .filter(|_| self.schema.is_abstract(name))
                    .unwrap_or(name)
                    .to_string();
                self.shape_object(&runtime_type, set, &object)
                    .map(Value::Object)
                    .unwrap_or(Value::Null)
            }
            (TypeRef::Named(name), _) if self.schema.is_composite(name) => Value::Null,
            (TypeRef::Named(_), value) => value,
        }
    }

    fn inside_failed_fetch(&self) -> bool {
        self.failed_paths
            .iter()
            .any(|failed| self.path.starts_with(failed))
    }

    /// Records a null in a non-null position unless an error at or above
    /// this path already explains it.
    fn report_null(&mut self, coordinate: &str) {
        let explained = self.errors.iter().any(|error| {
            error
                .path
                .as_ref()
                .is_some_and(|path| self.path.starts_with(path) || path.starts_with(&self.path))
        });
        if !explained {
            self.errors.push(
                GraphQLError::new(format!(
                    "cannot return null for non-nullable field {coordinate}"
                ))
                .with_path(self.path.clone()),
            );
        }
    }
}
