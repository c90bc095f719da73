use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::query_plan::{FetchKind, FetchNode, PathStep, QueryPlan};
use crate::supergraph::SupergraphSchema;
use crate::{GraphQLError, GraphQLRequest, GraphQLResponse, PathElement, SubgraphTransportError};

pub const DEFAULT_SUBGRAPH_TIMEOUT: Duration = Duration::from_secs(30);

/// The merged response tree before it is shaped for the client, plus every
/// error raised while fetching it.
#[derive(Debug, PartialEq)]
pub struct ExecutionResult {
    pub data: Value,
    pub errors: Vec<GraphQLError>,
    /// Fields set to null because the fetch responsible for them failed.
    pub failed_paths: Vec<Vec<PathElement>>,
}

impl Default for ExecutionResult {
    fn default() -> Self {
        ExecutionResult {
            data: Value::Object(Map::new()),
            errors: Vec::new(),
            failed_paths: Vec::new(),
        }
    }
}

#[async_trait]
pub trait QueryExecutor {
    async fn execute_plan(&self, plan: &QueryPlan, schema: &SupergraphSchema) -> ExecutionResult;
}

pub struct HttpQueryExecutor {
    client: reqwest::Client,
    timeout: Duration,
    subgraph_timeouts: HashMap<String, Duration>,
}

impl Default for HttpQueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpQueryExecutor {
    pub fn new() -> Self {
        HttpQueryExecutor {
            client: reqwest::Client::new(),
            timeout: DEFAULT_SUBGRAPH_TIMEOUT,
            subgraph_timeouts: HashMap::new(),
        }
    }

    /// Timeout applied to every fetch node without a subgraph override.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_subgraph_timeout(mut self, subgraph: impl Into<String>, timeout: Duration) -> Self {
        self.subgraph_timeouts.insert(subgraph.into(), timeout);
        self
    }

    fn timeout_for(&self, subgraph: &str) -> Duration {
        self.subgraph_timeouts
            .get(subgraph)
            .copied()
            .unwrap_or(self.timeout)
    }

    async fn run<'p>(&self, fetch: PreparedFetch<'p>) -> (PreparedFetch<'p>, FetchOutcome) {
        tracing::debug!(
            service = %fetch.node.service_name,
            node = fetch.node.id,
            targets = fetch.targets.len(),
            "sending subgraph request"
        );
        let service = &fetch.node.service_name;
        let outcome = post_graphql(
            &self.client,
            service,
            &fetch.url,
            &fetch.request,
            self.timeout_for(service),
        )
        .await;
        (fetch, outcome)
    }
}

/// Posts one GraphQL request to a subgraph, bounded by `timeout`.
pub(crate) async fn post_graphql(
    client: &reqwest::Client,
    service: &str,
    url: &str,
    request: &GraphQLRequest,
    timeout: Duration,
) -> Result<GraphQLResponse, SubgraphTransportError> {
    let send = async {
        let response = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|source| SubgraphTransportError::Request {
                service: service.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SubgraphTransportError::Status {
                service: service.to_string(),
                status,
            });
        }

        response.json::<GraphQLResponse>().await.map_err(|e| {
            SubgraphTransportError::InvalidResponse {
                service: service.to_string(),
                reason: e.to_string(),
            }
        })
    };

    tokio::time::timeout(timeout, send)
        .await
        .map_err(|_| SubgraphTransportError::Timeout {
            service: service.to_string(),
            timeout,
        })?
}

type FetchOutcome = Result<GraphQLResponse, SubgraphTransportError>;

/// A node ready to be sent: its request and the concrete paths of the
/// objects its result fills.
struct PreparedFetch<'p> {
    node: &'p FetchNode,
    url: String,
    request: GraphQLRequest,
    targets: Vec<Vec<PathElement>>,
}

enum Prepared<'p> {
    Send(PreparedFetch<'p>),
    /// Nothing to fetch, e.g. every parent object came back null.
    Skip,
    Failed(GraphQLError),
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute_plan(&self, plan: &QueryPlan, schema: &SupergraphSchema) -> ExecutionResult {
        let mut result = ExecutionResult::default();
        let mut started = vec![false; plan.nodes.len()];
        let mut done = vec![false; plan.nodes.len()];
        let mut in_flight = FuturesUnordered::new();

        loop {
            // Nodes that finish without a request may unblock others
            // immediately, so keep scanning until nothing new starts.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for node in &plan.nodes {
                    if started[node.id] || !node.depends_on.iter().all(|dep| done[*dep]) {
                        continue;
                    }
                    started[node.id] = true;
                    match prepare(node, plan, schema, &result.data) {
                        Prepared::Send(fetch) => in_flight.push(self.run(fetch)),
                        Prepared::Skip => {
                            tracing::debug!(node = node.id, "no representations, skipping node");
                            done[node.id] = true;
                            progressed = true;
                        }
                        Prepared::Failed(error) => {
                            result.errors.push(error);
                            done[node.id] = true;
                            progressed = true;
                        }
                    }
                }
            }

            let Some((fetch, outcome)) = in_flight.next().await else {
                break;
            };
            done[fetch.node.id] = true;
            apply(&fetch, outcome, &mut result);
        }

        result
    }
}

fn prepare<'p>(
    node: &'p FetchNode,
    plan: &QueryPlan,
    schema: &SupergraphSchema,
    data: &Value,
) -> Prepared<'p> {
    let Some(url) = schema.subgraph_url(&node.service_name) else {
        return Prepared::Failed(
            GraphQLError::new(format!("unknown subgraph `{}`", node.service_name))
                .with_service(&node.service_name),
        );
    };

    let mut variables = Map::new();
    for usage in &node.variable_usages {
        if let Some(value) = plan.variables.get(usage) {
            variables.insert(usage.clone(), value.clone());
        }
    }

    let targets = match &node.kind {
        FetchKind::Root => vec![Vec::new()],
        FetchKind::Entity {
            type_name,
            requires,
        } => {
            let mut objects = Vec::new();
            collect_objects(data, &node.path, &mut Vec::new(), &mut objects);

            let mut targets = Vec::new();
            let mut representations = Vec::new();
            'objects: for (path, object) in objects {
                let typename = object
                    .get("__typename")
                    .and_then(Value::as_str)
                    .unwrap_or(type_name);
                if !schema.type_condition_matches(type_name, typename) {
                    continue;
                }
                let mut representation = Map::new();
                representation.insert("__typename".to_string(), Value::from(typename));
                for key in requires {
                    match object.get(&key.response_key) {
                        Some(Value::Null) | None => continue 'objects,
                        Some(value) => {
                            representation.insert(key.name.clone(), value.clone());
                        }
                    }
                }
                targets.push(path);
                representations.push(Value::Object(representation));
            }

            if representations.is_empty() {
                return Prepared::Skip;
            }
            variables.insert(
                "representations".to_string(),
                Value::Array(representations),
            );
            targets
        }
    };

    Prepared::Send(PreparedFetch {
        node,
        url: url.to_string(),
        request: GraphQLRequest {
            query: node.operation.clone(),
            variables: Some(variables),
            operation_name: node.operation_name.clone(),
        },
        targets,
    })
}

fn apply(fetch: &PreparedFetch<'_>, outcome: FetchOutcome, result: &mut ExecutionResult) {
    let node = fetch.node;
    let response = match outcome {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!(service = error.service(), node = node.id, %error, "subgraph fetch failed");
            result.errors.push(
                GraphQLError::new(error.to_string())
                    .with_path(failure_path(fetch))
                    .with_service(&node.service_name),
            );
            null_subtree(fetch, result);
            return;
        }
    };

    for error in response.errors {
        let path = error
            .path
            .clone()
            .map(|path| remap_error_path(path, node, &fetch.targets));
        let mut error = error.with_service(&node.service_name);
        error.path = path;
        result.errors.push(error);
    }

    match (&node.kind, response.data) {
        (FetchKind::Root, Some(Value::Object(data))) => {
            if let Value::Object(root) = &mut result.data {
                merge_object(root, data);
            }
        }
        (FetchKind::Entity { .. }, Some(Value::Object(mut data))) => {
            let Some(Value::Array(entities)) = data.remove("_entities") else {
                null_subtree(fetch, result);
                return;
            };
            for (target, entity) in fetch.targets.iter().zip(entities) {
                if let (Some(object), Value::Object(entity)) =
                    (object_at_mut(&mut result.data, target), entity)
                {
                    merge_object(object, entity);
                }
            }
        }
        _ => null_subtree(fetch, result),
    }
}

/// Collects the objects found at `steps`, with their concrete path. Null
/// values and non-objects are skipped.
fn collect_objects<'v>(
    value: &'v Value,
    steps: &[PathStep],
    current: &mut Vec<PathElement>,
    out: &mut Vec<(Vec<PathElement>, &'v Map<String, Value>)>,
) {
    match steps.split_first() {
        None => {
            if let Value::Object(object) = value {
                out.push((current.clone(), object));
            }
        }
        Some((PathStep::Key(key), rest)) => {
            if let Some(child) = value.get(key) {
                current.push(PathElement::Key(key.clone()));
                collect_objects(child, rest, current, out);
                current.pop();
            }
        }
        Some((PathStep::Flatten, rest)) => {
            if let Value::Array(items) = value {
                for (index, item) in items.iter().enumerate() {
                    current.push(PathElement::Index(index));
                    collect_objects(item, rest, current, out);
                    current.pop();
                }
            }
        }
    }
}

fn object_at_mut<'v>(
    value: &'v mut Value,
    path: &[PathElement],
) -> Option<&'v mut Map<String, Value>> {
    let mut current = value;
    for element in path {
        current = match element {
            PathElement::Key(key) => current.get_mut(key.as_str())?,
            PathElement::Index(index) => current.get_mut(*index)?,
        };
    }
    current.as_object_mut()
}

fn merge_object(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match target.get_mut(&key) {
            Some(existing) => merge_value(existing, value),
            None => {
                target.insert(key, value);
            }
        }
    }
}

fn merge_value(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => merge_object(target, source),
        (Value::Array(target), Value::Array(source)) if target.len() == source.len() => {
            for (item, incoming) in target.iter_mut().zip(source) {
                merge_value(item, incoming);
            }
        }
        // Already resolved values win over a null from another node.
        (target, Value::Null) if !target.is_null() => {}
        (target, source) => *target = source,
    }
}

/// Rewrites `["_entities", i, ...]` into the client path of the i-th
/// representation. Root fetch paths already match the client's.
fn remap_error_path(
    path: Vec<PathElement>,
    node: &FetchNode,
    targets: &[Vec<PathElement>],
) -> Vec<PathElement> {
    if !node.is_entity_fetch() {
        return path;
    }
    let remapped = match path.as_slice() {
        [PathElement::Key(entities), PathElement::Index(index), rest @ ..]
            if entities == "_entities" =>
        {
            targets
                .get(*index)
                .map(|target| target.iter().chain(rest).cloned().collect())
        }
        _ => None,
    };
    remapped.unwrap_or(path)
}

/// Path reported for a failed node: its first root field, its single
/// target, or the path prefix shared by all its targets.
fn failure_path(fetch: &PreparedFetch<'_>) -> Vec<PathElement> {
    match &fetch.node.kind {
        FetchKind::Root => fetch
            .node
            .selection_set
            .fields()
            .next()
            .map(|field| vec![PathElement::Key(field.response_key().to_string())])
            .unwrap_or_default(),
        FetchKind::Entity { .. } => match fetch.targets.as_slice() {
            [single] => single.clone(),
            _ => fetch
                .node
                .path
                .iter()
                .map_while(|step| match step {
                    PathStep::Key(key) => Some(PathElement::Key(key.clone())),
                    PathStep::Flatten => None,
                })
                .collect(),
        },
    }
}

/// Sets every field the node was responsible for to null, leaving fields
/// other nodes already resolved untouched. The nulled paths are recorded so
/// they do not propagate past their own position.
fn null_subtree(fetch: &PreparedFetch<'_>, result: &mut ExecutionResult) {
    for target in &fetch.targets {
        let Some(object) = object_at_mut(&mut result.data, target) else {
            continue;
        };
        for field in fetch.node.selection_set.fields() {
            let key = field.response_key();
            let value = object.entry(key.to_string()).or_insert(Value::Null);
            if value.is_null() {
                let mut path = target.clone();
                path.push(PathElement::Key(key.to_string()));
                result.failed_paths.push(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_plan::{KeyField, SelectionSet};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entity_node(path: Vec<PathStep>) -> FetchNode {
        FetchNode {
            id: 1,
            service_name: "managers".to_string(),
            kind: FetchKind::Entity {
                type_name: "Customer".to_string(),
                requires: vec![KeyField {
                    name: "id".to_string(),
                    response_key: "id".to_string(),
                }],
            },
            path,
            selection_set: SelectionSet::default(),
            operation: String::new(),
            operation_name: None,
            variable_usages: Vec::new(),
            depends_on: vec![0],
        }
    }

    #[test]
    fn collects_objects_through_lists() {
        let data = json!({
            "customers": [
                { "id": "1" },
                null,
                { "id": "3" }
            ]
        });
        let mut out = Vec::new();
        collect_objects(
            &data,
            &[PathStep::Key("customers".to_string()), PathStep::Flatten],
            &mut Vec::new(),
            &mut out,
        );

        let paths: Vec<_> = out.iter().map(|(path, _)| path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                vec![PathElement::from("customers"), PathElement::from(0)],
                vec![PathElement::from("customers"), PathElement::from(2)],
            ]
        );
    }

    #[test]
    fn deep_merge_keeps_resolved_values() {
        let mut data = json!({
            "customer": { "id": "1", "name": "Luke", "manager": null }
        });
        merge_value(
            &mut data,
            json!({ "customer": { "id": null, "manager": { "name": "Leia" } } }),
        );

        assert_eq!(
            data,
            json!({ "customer": { "id": "1", "name": "Luke", "manager": { "name": "Leia" } } })
        );
    }

    #[test]
    fn entity_error_paths_point_at_client_paths() {
        let node = entity_node(vec![
            PathStep::Key("customers".to_string()),
            PathStep::Flatten,
        ]);
        let targets = vec![
            vec![PathElement::from("customers"), PathElement::from(0)],
            vec![PathElement::from("customers"), PathElement::from(2)],
        ];

        let path = remap_error_path(
            vec!["_entities".into(), 1.into(), "manager".into()],
            &node,
            &targets,
        );

        assert_eq!(
            path,
            vec![
                PathElement::from("customers"),
                PathElement::from(2),
                PathElement::from("manager")
            ]
        );
    }

    #[test]
    fn failed_fetch_nulls_and_records_its_fields() {
        let mut node = entity_node(vec![
            PathStep::Key("customers".to_string()),
            PathStep::Flatten,
        ]);
        node.selection_set
            .items
            .push(crate::query_plan::Selection::Field(
                crate::query_plan::FieldSelection::new("manager"),
            ));
        let fetch = PreparedFetch {
            node: &node,
            url: "http://managers.svc/graphql".to_string(),
            request: GraphQLRequest::new(""),
            targets: vec![
                vec![PathElement::from("customers"), PathElement::from(0)],
                vec![PathElement::from("customers"), PathElement::from(1)],
            ],
        };
        let mut result = ExecutionResult {
            data: json!({
                "customers": [{ "id": "1" }, { "id": "2", "manager": { "name": "Leia" } }]
            }),
            ..Default::default()
        };

        apply(
            &fetch,
            Err(SubgraphTransportError::Timeout {
                service: "managers".to_string(),
                timeout: Duration::from_millis(10),
            }),
            &mut result,
        );

        assert_eq!(
            result.data,
            json!({
                "customers": [
                    { "id": "1", "manager": null },
                    { "id": "2", "manager": { "name": "Leia" } }
                ]
            })
        );
        assert_eq!(
            result.failed_paths,
            vec![vec![
                PathElement::from("customers"),
                PathElement::from(0),
                PathElement::from("manager")
            ]]
        );
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            result.errors[0].extensions.service_name.as_deref(),
            Some("managers")
        );
    }

    #[test]
    fn representations_skip_unusable_objects() {
        let schema = SupergraphSchema {
            subgraphs: vec![crate::supergraph::SubgraphEndpoint {
                name: "managers".to_string(),
                url: "http://managers.svc/graphql".to_string(),
            }],
            query_type: "Query".to_string(),
            mutation_type: None,
            types: Default::default(),
        };
        let plan = QueryPlan {
            kind: crate::query_plan::OperationKind::Query,
            root_type: "Query".to_string(),
            response_shape: SelectionSet::default(),
            nodes: vec![],
            variables: Map::new(),
        };
        let node = entity_node(vec![
            PathStep::Key("customers".to_string()),
            PathStep::Flatten,
        ]);
        let data = json!({
            "customers": [
                { "__typename": "Customer", "id": "1" },
                { "__typename": "Customer", "id": null },
                { "__typename": "Room", "id": "7" },
                { "__typename": "Customer", "id": "4" }
            ]
        });

        let Prepared::Send(fetch) = prepare(&node, &plan, &schema, &data) else {
            panic!("expected a request");
        };

        assert_eq!(
            fetch.request.variables,
            Some(
                json!({
                    "representations": [
                        { "__typename": "Customer", "id": "1" },
                        { "__typename": "Customer", "id": "4" }
                    ]
                })
                .as_object()
                .cloned()
                .unwrap()
            )
        );
        assert_eq!(fetch.targets.len(), 2);

        let empty = json!({ "customers": [] });
        assert!(matches!(
            prepare(&node, &plan, &schema, &empty),
            Prepared::Skip
        ));
    }
}
