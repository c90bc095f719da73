pub mod config;
pub mod error;
pub mod federation_gateway;
pub mod introspection;
pub mod query_executor;
pub mod query_plan;
pub mod query_planner;
pub mod response_formatter;
pub mod schema_composer;
pub mod schema_registry;
pub mod server;
pub mod supergraph;

pub use config::GatewayConfig;
pub use error::{
    CompositionConflict, CompositionError, GatewayError, MalformedRequestError, PlanningError,
    RegistryError, SubgraphTransportError,
};
pub use federation_gateway::FederationGateway;
pub use query_executor::HttpQueryExecutor;
pub use query_plan::{FetchNode, QueryPlan};
pub use query_planner::FederatedQueryPlanner;
pub use schema_composer::compose;
pub use schema_registry::InMemorySchemaRegistry;
pub use supergraph::SupergraphSchema;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A GraphQL service contributing part of the supergraph.
///
/// Built through [`Subgraph::new`], which validates the name and url; the
/// fields are private so a registered subgraph cannot change afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Subgraph {
    name: String,
    url: String,
    schema: String,
}

impl Subgraph {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        schema: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        let url = url.into();

        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(RegistryError::InvalidName(name));
        }

        let parsed = reqwest::Url::parse(&url).map_err(|e| RegistryError::InvalidUrl {
            name: name.clone(),
            url: url.clone(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(RegistryError::InvalidUrl {
                name,
                url,
                reason: format!("unsupported scheme `{}`", parsed.scheme()),
            });
        }

        Ok(Subgraph {
            name,
            url,
            schema: schema.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The subgraph's SDL, including its federation directives.
    pub fn schema(&self) -> &str {
        &self.schema
    }
}

/// The body of a GraphQL-over-HTTP request, both inbound and outbound.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        GraphQLRequest {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_operation_name(mut self, operation_name: impl Into<String>) -> Self {
        self.operation_name = Some(operation_name.into());
        self
    }
}

/// The standard `{data, errors}` response shape.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct GraphQLResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        GraphQLResponse { data: None, errors }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathElement>>,
    #[serde(default, skip_serializing_if = "ErrorExtensions::is_empty")]
    pub extensions: ErrorExtensions,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: None,
            extensions: ErrorExtensions::default(),
        }
    }

    pub fn with_path(mut self, path: Vec<PathElement>) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_service(mut self, service_name: impl Into<String>) -> Self {
        self.extensions.service_name = Some(service_name.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.extensions.code = Some(code.into());
        self
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorExtensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorExtensions {
    fn is_empty(&self) -> bool {
        self.service_name.is_none() && self.code.is_none()
    }
}

/// One step of a concrete response path: an object key or a list index.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum PathElement {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Index(index) => write!(f, "{index}"),
            PathElement::Key(key) => f.write_str(key),
        }
    }
}

impl From<&str> for PathElement {
    fn from(key: &str) -> Self {
        PathElement::Key(key.to_string())
    }
}

impl From<usize> for PathElement {
    fn from(index: usize) -> Self {
        PathElement::Index(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn subgraph_rejects_bad_names_and_urls() {
        assert_eq!(
            Subgraph::new("", "http://localhost:4001", ""),
            Err(RegistryError::InvalidName(String::new()))
        );
        assert!(matches!(
            Subgraph::new("customers", "localhost:4001", ""),
            Err(RegistryError::InvalidUrl { .. })
        ));
        assert!(matches!(
            Subgraph::new("customers", "ftp://localhost:4001", ""),
            Err(RegistryError::InvalidUrl { .. })
        ));

        let subgraph = Subgraph::new("customers", "http://localhost:4001", "type Query { a: Int }")
            .unwrap();
        assert_eq!(subgraph.name(), "customers");
        assert_eq!(subgraph.url(), "http://localhost:4001");
    }

    #[test]
    fn request_uses_camel_case_operation_name() {
        let request: GraphQLRequest = serde_json::from_value(json!({
            "query": "query Rooms { rooms { id } }",
            "operationName": "Rooms"
        }))
        .unwrap();
        assert_eq!(request.operation_name.as_deref(), Some("Rooms"));
        assert_eq!(request.variables, None);
    }

    #[test]
    fn error_serializes_service_name_and_mixed_path() {
        let error = GraphQLError::new("boom")
            .with_path(vec!["customers".into(), 0.into(), "manager".into()])
            .with_service("managers");

        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({
                "message": "boom",
                "path": ["customers", 0, "manager"],
                "extensions": { "serviceName": "managers" }
            })
        );
        assert_eq!(
            serde_json::to_value(GraphQLResponse::default()).unwrap(),
            json!({})
        );
    }
}
