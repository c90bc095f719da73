use std::{fs, sync::Arc};
use tokio::sync::RwLock;

use crate::{
    GatewayConfig, GatewayError, GraphQLRequest, GraphQLResponse, PlanningError, RegistryError,
    Subgraph, SupergraphSchema,
    error::CompositionError,
    introspection::fetch_subgraph_sdl,
    query_executor::QueryExecutor,
    query_planner::QueryPlanner,
    response_formatter::format_response,
    schema_composer::compose,
    schema_registry::{InMemorySchemaRegistry, SchemaRegistry},
};

pub struct FederationGateway {
    schema_registry: RwLock<Box<dyn SchemaRegistry + Send + Sync>>,
    /// The snapshot requests plan against; replaced whole on refresh.
    supergraph: RwLock<Option<Arc<SupergraphSchema>>>,
    query_planner: Box<dyn QueryPlanner + Send + Sync>,
    query_executor: Box<dyn QueryExecutor + Send + Sync>,
}

impl FederationGateway {
    pub fn new(
        schema_registry: Box<dyn SchemaRegistry + Send + Sync>,
        query_planner: Box<dyn QueryPlanner + Send + Sync>,
        query_executor: Box<dyn QueryExecutor + Send + Sync>,
    ) -> Self {
        FederationGateway {
            schema_registry: RwLock::new(schema_registry),
            supergraph: RwLock::new(None),
            query_planner,
            query_executor,
        }
    }

    pub async fn process_request(&self, request: GraphQLRequest) -> GraphQLResponse {
        tracing::debug!(operation_name = ?request.operation_name, "processing request");

        let Some(schema) = self.supergraph().await else {
            return GraphQLResponse::from_errors(vec![PlanningError::NotComposed.into()]);
        };

        let plan = match self.query_planner.plan_query(&schema, &request).await {
            Ok(plan) => plan,
            Err(error) => {
                tracing::debug!(%error, "query planning failed");
                return GraphQLResponse::from_errors(vec![error.into()]);
            }
        };
        tracing::trace!(plan = %plan.describe(), "planned query");

        let result = self.query_executor.execute_plan(&plan, &schema).await;
        format_response(&schema, &plan, result)
    }

    pub async fn register_service(&self, subgraph: Subgraph) -> Result<(), RegistryError> {
        let mut schema_registry = self.schema_registry.write().await;
        schema_registry.register_service(subgraph).await
    }

    /// The current supergraph; in-flight requests keep the snapshot they
    /// started with.
    pub async fn supergraph(&self) -> Option<Arc<SupergraphSchema>> {
        self.supergraph.read().await.clone()
    }

    /// Seals the registry and composes everything registered so far.
    pub async fn compose(&self) -> Result<Arc<SupergraphSchema>, CompositionError> {
        let subgraphs = {
            let mut schema_registry = self.schema_registry.write().await;
            schema_registry.seal().await;
            schema_registry.get_all().await
        };

        let supergraph = Arc::new(compose(&subgraphs)?);
        *self.supergraph.write().await = Some(Arc::clone(&supergraph));
        tracing::info!(
            subgraphs = subgraphs.len(),
            types = supergraph.types.len(),
            "composed supergraph"
        );
        Ok(supergraph)
    }

    /// Composes `subgraphs` into a fresh registry and swaps it in. On any
    /// error the previous registry and supergraph stay active.
    pub async fn refresh(
        &self,
        subgraphs: Vec<Subgraph>,
    ) -> Result<Arc<SupergraphSchema>, GatewayError> {
        let mut registry = InMemorySchemaRegistry::new();
        for subgraph in subgraphs {
            registry.register_service(subgraph).await?;
        }
        registry.seal().await;

        let supergraph = Arc::new(compose(&registry.get_all().await)?);

        let mut schema_registry = self.schema_registry.write().await;
        let mut current = self.supergraph.write().await;
        *schema_registry = Box::new(registry);
        *current = Some(Arc::clone(&supergraph));
        tracing::info!(types = supergraph.types.len(), "refreshed supergraph");
        Ok(supergraph)
    }

    /// Registers every configured subgraph and composes them.
    pub async fn load_schemas(&self, config: &GatewayConfig) -> Result<(), GatewayError> {
        for subgraph in resolve_subgraphs(config).await? {
            self.register_service(subgraph).await?;
        }
        self.compose().await?;
        Ok(())
    }

    /// Re-reads the configured subgraphs and refreshes the supergraph.
    pub async fn reload(&self, config: &GatewayConfig) -> Result<(), GatewayError> {
        let subgraphs = resolve_subgraphs(config).await?;
        self.refresh(subgraphs).await?;
        Ok(())
    }
}

/// Builds the configured subgraphs, reading schema files or introspecting
/// subgraphs that have none.
pub async fn resolve_subgraphs(config: &GatewayConfig) -> Result<Vec<Subgraph>, GatewayError> {
    let client = reqwest::Client::new();
    let mut subgraphs = Vec::with_capacity(config.subgraphs.len());

    for (name, subgraph_config) in &config.subgraphs {
        let schema = match config.schema_path(subgraph_config) {
            Some(path) => {
                tracing::debug!(subgraph = %name, path = %path.display(), "reading schema file");
                fs::read_to_string(&path).map_err(|source| GatewayError::Io {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => {
                fetch_subgraph_sdl(
                    &client,
                    name,
                    &subgraph_config.routing_url,
                    config.timeout_for(name),
                )
                .await?
            }
        };

        subgraphs.push(Subgraph::new(
            name.as_str(),
            subgraph_config.routing_url.as_str(),
            schema,
        )?);
    }
    Ok(subgraphs)
}
