use std::{fmt, time::Duration};

use crate::GraphQLError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a subgraph named `{0}` is already registered")]
    DuplicateName(String),
    #[error("invalid subgraph name `{0}`: use letters, digits, `_` or `-`")]
    InvalidName(String),
    #[error("invalid url `{url}` for subgraph `{name}`: {reason}")]
    InvalidUrl {
        name: String,
        url: String,
        reason: String,
    },
    #[error("cannot register `{0}`: composition has already started")]
    Sealed(String),
}

/// Every conflict found while composing, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct CompositionError {
    pub conflicts: Vec<CompositionConflict>,
}

impl fmt::Display for CompositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "supergraph composition failed with {} conflict(s):",
            self.conflicts.len()
        )?;
        for conflict in &self.conflicts {
            write!(f, "\n  - {conflict}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositionConflict {
    #[error("subgraph `{subgraph}` has an invalid schema: {message}")]
    InvalidSchema { subgraph: String, message: String },
    #[error("no subgraph defines a Query root type")]
    NoQueryType,
    #[error("type `{type_name}` is a {first} in `{first_subgraph}` but a {second} in `{second_subgraph}`")]
    TypeKindMismatch {
        type_name: String,
        first: &'static str,
        first_subgraph: String,
        second: &'static str,
        second_subgraph: String,
    },
    #[error("field `{type_name}.{field}` is defined by several subgraphs: {}", .subgraphs.join(", "))]
    FieldOwnership {
        type_name: String,
        field: String,
        subgraphs: Vec<String>,
    },
    #[error("field `{type_name}.{field}` has type `{expected}` but `{subgraph}` declares `{found}`")]
    FieldTypeMismatch {
        type_name: String,
        field: String,
        expected: String,
        subgraph: String,
        found: String,
    },
    #[error("subgraph `{subgraph}` extends entity `{type_name}` without a @key")]
    MissingKey { type_name: String, subgraph: String },
    #[error("subgraph `{subgraph}` declares key field `{field}` on `{type_name}` but does not define it")]
    MissingKeyField {
        type_name: String,
        subgraph: String,
        field: String,
    },
    #[error("subgraph `{subgraph}` uses a nested key `{fields}` on `{type_name}`, only flat keys are supported")]
    NestedKey {
        type_name: String,
        subgraph: String,
        fields: String,
    },
    #[error("field `{type_name}.{field}` is @external in every subgraph that declares it")]
    UnresolvableField { type_name: String, field: String },
    #[error("type `{type_name}` is defined differently in `{first_subgraph}` and `{second_subgraph}`")]
    DefinitionMismatch {
        type_name: String,
        first_subgraph: String,
        second_subgraph: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    #[error("failed to parse query: {0}")]
    Parse(String),
    #[error("the document contains no operation")]
    NoOperation,
    #[error("unknown operation named `{0}`")]
    UnknownOperation(String),
    #[error("the document contains several operations, an operationName is required")]
    OperationNameRequired,
    #[error("{0} operations are not supported")]
    UnsupportedOperation(&'static str),
    #[error("unknown fragment `{0}`")]
    UnknownFragment(String),
    #[error("fragment `{0}` spreads itself")]
    FragmentCycle(String),
    #[error("unknown type `{0}`")]
    UnknownType(String),
    #[error("cannot query field `{field}` on type `{type_name}`")]
    UnknownField { type_name: String, field: String },
    #[error("fields `{first}` and `{second}` conflict under response key `{response_key}`: they differ in name or arguments")]
    FieldConflict {
        response_key: String,
        first: String,
        second: String,
    },
    #[error("no subgraph can resolve field `{type_name}.{field}`")]
    NoOwningSubgraph { type_name: String, field: String },
    #[error("subgraph `{subgraph}` has no usable key to resolve entity `{type_name}`")]
    UnsatisfiableKey { type_name: String, subgraph: String },
    #[error("cyclic key dependency on `{type_name}` between subgraphs {}", .subgraphs.join(" -> "))]
    CyclicKeyDependency {
        type_name: String,
        subgraphs: Vec<String>,
    },
    #[error("variable `${0}` is used but not defined by the operation")]
    UndefinedVariable(String),
    #[error("the gateway has no composed supergraph yet")]
    NotComposed,
}

impl From<PlanningError> for GraphQLError {
    fn from(error: PlanningError) -> Self {
        let code = match error {
            PlanningError::Parse(_) => "GRAPHQL_PARSE_FAILED",
            PlanningError::NotComposed => "INTERNAL_SERVER_ERROR",
            PlanningError::CyclicKeyDependency { .. } | PlanningError::UnsatisfiableKey { .. } => {
                "QUERY_PLANNING_FAILED"
            }
            _ => "GRAPHQL_VALIDATION_FAILED",
        };
        GraphQLError::new(error.to_string()).with_code(code)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubgraphTransportError {
    #[error("request to subgraph `{service}` timed out after {}ms", .timeout.as_millis())]
    Timeout { service: String, timeout: Duration },
    #[error("request to subgraph `{service}` failed: {source}")]
    Request {
        service: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("subgraph `{service}` answered with HTTP status {status}")]
    Status {
        service: String,
        status: http::StatusCode,
    },
    #[error("subgraph `{service}` returned an invalid response: {reason}")]
    InvalidResponse { service: String, reason: String },
}

impl SubgraphTransportError {
    pub fn service(&self) -> &str {
        match self {
            SubgraphTransportError::Timeout { service, .. }
            | SubgraphTransportError::Request { service, .. }
            | SubgraphTransportError::Status { service, .. }
            | SubgraphTransportError::InvalidResponse { service, .. } => service,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedRequestError {
    #[error("failed to read request body: {0}")]
    Body(String),
    #[error("invalid JSON request: {0}")]
    InvalidJson(String),
    #[error("the request does not contain a query")]
    EmptyQuery,
}

impl From<MalformedRequestError> for GraphQLError {
    fn from(error: MalformedRequestError) -> Self {
        GraphQLError::new(error.to_string()).with_code("BAD_REQUEST")
    }
}

/// Startup and refresh failures; these never happen while serving a request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Config(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Composition(#[from] CompositionError),
    #[error("failed to introspect subgraph: {0}")]
    Introspection(#[from] SubgraphTransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition_error_lists_every_conflict() {
        let error = CompositionError {
            conflicts: vec![
                CompositionConflict::NoQueryType,
                CompositionConflict::MissingKey {
                    type_name: "Customer".to_string(),
                    subgraph: "managers".to_string(),
                },
            ],
        };

        let message = error.to_string();
        assert!(message.starts_with("supergraph composition failed with 2 conflict(s):"));
        assert!(message.contains("no subgraph defines a Query root type"));
        assert!(message.contains("subgraph `managers` extends entity `Customer` without a @key"));
    }

    #[test]
    fn planning_error_becomes_graphql_error() {
        let error: GraphQLError = PlanningError::CyclicKeyDependency {
            type_name: "Account".to_string(),
            subgraphs: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        }
        .into();

        assert_eq!(
            error.message,
            "cyclic key dependency on `Account` between subgraphs a -> b -> a"
        );
        assert_eq!(error.extensions.code.as_deref(), Some("QUERY_PLANNING_FAILED"));
        assert!(error.path.is_none());
    }
}
