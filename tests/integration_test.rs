use concierge::{
    FederatedQueryPlanner, FederationGateway, GatewayConfig, GraphQLRequest, HttpQueryExecutor,
    InMemorySchemaRegistry, RegistryError, Subgraph, server,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use wiremock::matchers::{body_string_contains, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Test fixture: the three hotel subgraphs, each backed by a mock server
struct TestFixture {
    gateway: FederationGateway,
    customers: MockServer,
    managers: MockServer,
    rooms: MockServer,
}

impl TestFixture {
    async fn setup() -> Self {
        Self::with_timeout(Duration::from_secs(5)).await
    }

    async fn with_timeout(timeout: Duration) -> Self {
        let customers = MockServer::start().await;
        let managers = MockServer::start().await;
        let rooms = MockServer::start().await;

        let gateway = FederationGateway::new(
            Box::new(InMemorySchemaRegistry::new()),
            Box::new(FederatedQueryPlanner::new()),
            Box::new(HttpQueryExecutor::new().with_timeout(timeout)),
        );

        for (name, server) in [
            ("customers", &customers),
            ("managers", &managers),
            ("rooms", &rooms),
        ] {
            let schema = fs::read_to_string(Path::new("schemas").join(format!("{name}.graphql")))
                .expect("Could not read subgraph schema");
            gateway
                .register_service(Subgraph::new(name, server.uri(), schema).unwrap())
                .await
                .unwrap();
        }
        gateway.compose().await.unwrap();

        Self {
            gateway,
            customers,
            managers,
            rooms,
        }
    }

    // Helper method to execute GraphQL queries
    async fn execute_query(&self, query: &str, variables: Option<Value>) -> Value {
        let mut request = GraphQLRequest::new(query);
        if let Some(Value::Object(variables)) = variables {
            request = request.with_variables(variables);
        }
        serde_json::to_value(self.gateway.process_request(request).await).unwrap()
    }
}

fn reply(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

async fn received_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| request.body_json::<Value>().unwrap())
        .collect()
}

#[tokio::test]
async fn test_entity_fields_are_fetched_after_their_key() {
    let fixture = TestFixture::setup().await;
    Mock::given(method("POST"))
        .respond_with(reply(json!({
            "data": {
                "customer": { "name": "Luke Skywalker", "__typename": "Customer", "id": "1000" }
            }
        })))
        .expect(1)
        .mount(&fixture.customers)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("_entities"))
        .respond_with(reply(json!({
            "data": { "_entities": [{ "manager": { "name": "Obi-Wan Kenobi" } }] }
        })))
        .expect(1)
        .mount(&fixture.managers)
        .await;

    let result = fixture
        .execute_query(
            "query($id: ID!) { customer(id: $id) { name manager { name } } }",
            Some(json!({ "id": "1000" })),
        )
        .await;

    assert_eq!(
        result,
        json!({
            "data": {
                "customer": { "name": "Luke Skywalker", "manager": { "name": "Obi-Wan Kenobi" } }
            }
        })
    );
    assert_eq!(
        received_bodies(&fixture.customers).await,
        vec![json!({
            "query": "query($id: ID!) { customer(id: $id) { name __typename id } }",
            "variables": { "id": "1000" }
        })]
    );
    assert_eq!(
        received_bodies(&fixture.managers).await[0]["variables"],
        json!({ "representations": [{ "__typename": "Customer", "id": "1000" }] })
    );
}

#[tokio::test]
async fn test_timeout_keeps_sibling_data() {
    let fixture = TestFixture::with_timeout(Duration::from_millis(200)).await;
    Mock::given(method("POST"))
        .respond_with(
            reply(json!({ "data": { "customer": { "name": "Luke Skywalker" } } }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&fixture.customers)
        .await;
    Mock::given(method("POST"))
        .respond_with(reply(json!({ "data": { "managers": [{ "name": "Yoda" }] } })))
        .mount(&fixture.managers)
        .await;
    Mock::given(method("POST"))
        .respond_with(reply(json!({ "data": { "rooms": [{ "name": "Blue" }] } })))
        .mount(&fixture.rooms)
        .await;

    let result = fixture
        .execute_query(
            r#"{ customer(id: "1000") { name } rooms { name } managers { name } }"#,
            None,
        )
        .await;

    assert_eq!(
        result["data"],
        json!({
            "customer": null,
            "rooms": [{ "name": "Blue" }],
            "managers": [{ "name": "Yoda" }]
        })
    );
    let errors = result["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["path"], json!(["customer"]));
    assert_eq!(errors[0]["extensions"]["serviceName"], "customers");
}

#[tokio::test]
async fn test_timeout_of_non_null_field_keeps_sibling_data() {
    let fixture = TestFixture::with_timeout(Duration::from_millis(200)).await;
    Mock::given(method("POST"))
        .respond_with(reply(json!({ "data": { "customers": [{ "name": "Luke Skywalker" }] } })))
        .mount(&fixture.customers)
        .await;
    Mock::given(method("POST"))
        .respond_with(reply(json!({ "data": { "managers": [{ "name": "Yoda" }] } })))
        .mount(&fixture.managers)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            reply(json!({ "data": { "rooms": [{ "name": "Blue" }] } }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&fixture.rooms)
        .await;

    let result = fixture
        .execute_query("{ customers { name } managers { name } rooms { name } }", None)
        .await;

    assert_eq!(
        result,
        json!({
            "data": {
                "customers": [{ "name": "Luke Skywalker" }],
                "managers": [{ "name": "Yoda" }],
                "rooms": null
            },
            "errors": [{
                "message": "request to subgraph `rooms` timed out after 200ms",
                "path": ["rooms"],
                "extensions": { "serviceName": "rooms" }
            }]
        })
    );
}

#[tokio::test]
async fn test_independent_fetches_run_concurrently() {
    let fixture = TestFixture::setup().await;
    let delay = Duration::from_millis(300);
    for (server, data) in [
        (&fixture.customers, json!({ "customers": [{ "name": "Luke Skywalker" }] })),
        (&fixture.managers, json!({ "managers": [{ "name": "Yoda" }] })),
        (&fixture.rooms, json!({ "rooms": [{ "name": "Blue" }] })),
    ] {
        Mock::given(method("POST"))
            .respond_with(reply(json!({ "data": data })).set_delay(delay))
            .expect(1)
            .mount(server)
            .await;
    }

    let started = tokio::time::Instant::now();
    let result = fixture
        .execute_query("{ customers { name } managers { name } rooms { name } }", None)
        .await;
    let elapsed = started.elapsed();

    assert_eq!(
        result,
        json!({
            "data": {
                "customers": [{ "name": "Luke Skywalker" }],
                "managers": [{ "name": "Yoda" }],
                "rooms": [{ "name": "Blue" }]
            }
        })
    );
    assert!(
        elapsed < delay * 2,
        "three {delay:?} fetches took {elapsed:?}"
    );
}

#[tokio::test]
async fn test_entity_errors_point_at_client_paths() {
    let fixture = TestFixture::setup().await;
    Mock::given(method("POST"))
        .respond_with(reply(json!({
            "data": {
                "customers": [
                    { "name": "Luke Skywalker", "__typename": "Customer", "id": "1000" },
                    { "name": "Han Solo", "__typename": "Customer", "id": "1002" }
                ]
            }
        })))
        .mount(&fixture.customers)
        .await;
    Mock::given(method("POST"))
        .respond_with(reply(json!({
            "data": { "_entities": [{ "manager": { "name": "Obi-Wan Kenobi" } }, { "manager": null }] },
            "errors": [{ "message": "manager unavailable", "path": ["_entities", 1, "manager"] }]
        })))
        .mount(&fixture.managers)
        .await;

    let result = fixture
        .execute_query("{ customers { name manager { name } } }", None)
        .await;

    assert_eq!(
        result,
        json!({
            "data": {
                "customers": [
                    { "name": "Luke Skywalker", "manager": { "name": "Obi-Wan Kenobi" } },
                    { "name": "Han Solo", "manager": null }
                ]
            },
            "errors": [{
                "message": "manager unavailable",
                "path": ["customers", 1, "manager"],
                "extensions": { "serviceName": "managers" }
            }]
        })
    );
}

#[tokio::test]
async fn test_cyclic_keys_are_rejected_before_any_fetch() {
    let entry = MockServer::start().await;
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    for server in [&entry, &alpha, &beta] {
        Mock::given(method("POST"))
            .respond_with(reply(json!({ "data": {} })))
            .expect(0)
            .mount(server)
            .await;
    }

    let gateway = FederationGateway::new(
        Box::new(InMemorySchemaRegistry::new()),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(HttpQueryExecutor::new()),
    );
    let subgraphs = [
        (
            "entry",
            &entry,
            r#"type Query { account: Account }
               type Account @key(fields: "code") { code: ID! }"#,
        ),
        (
            "alpha",
            &alpha,
            r#"type Account @key(fields: "betaId") { betaId: ID! @external alphaId: ID! balance: Int }"#,
        ),
        (
            "beta",
            &beta,
            r#"type Account @key(fields: "alphaId") { alphaId: ID! @external betaId: ID! owner: String }"#,
        ),
    ];
    for (name, server, sdl) in subgraphs {
        gateway
            .register_service(Subgraph::new(name, server.uri(), sdl).unwrap())
            .await
            .unwrap();
    }
    gateway.compose().await.unwrap();

    let response = gateway
        .process_request(GraphQLRequest::new("{ account { balance } }"))
        .await;

    assert_eq!(response.data, None);
    assert_eq!(
        response.errors[0].message,
        "cyclic key dependency on `Account` between subgraphs entry -> alpha -> beta -> alpha"
    );
    assert_eq!(
        response.errors[0].extensions.code.as_deref(),
        Some("QUERY_PLANNING_FAILED")
    );
}

#[tokio::test]
async fn test_duplicate_subgraph_names_are_rejected() {
    let fixture = TestFixture::setup().await;

    let result = fixture
        .gateway
        .register_service(
            Subgraph::new("rooms", fixture.rooms.uri(), "type Query { rooms: [String] }").unwrap(),
        )
        .await;

    // The registry is sealed once composed; a fresh gateway reports the duplicate.
    assert_eq!(result, Err(RegistryError::Sealed("rooms".to_string())));

    let gateway = FederationGateway::new(
        Box::new(InMemorySchemaRegistry::new()),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(HttpQueryExecutor::new()),
    );
    let rooms = Subgraph::new("rooms", fixture.rooms.uri(), "type Query { rooms: [String] }")
        .unwrap();
    gateway.register_service(rooms.clone()).await.unwrap();
    assert_eq!(
        gateway.register_service(rooms).await,
        Err(RegistryError::DuplicateName("rooms".to_string()))
    );
}

#[tokio::test]
async fn test_bundled_configuration_composes() {
    let config = GatewayConfig::from_file("schemas/supergraph.yaml").unwrap();
    let gateway = FederationGateway::new(
        Box::new(InMemorySchemaRegistry::new()),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(HttpQueryExecutor::new()),
    );

    gateway.load_schemas(&config).await.unwrap();

    let supergraph = gateway.supergraph().await.unwrap();
    let names: Vec<_> = supergraph.subgraphs.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["customers", "managers", "rooms"]);
    assert_eq!(
        supergraph.field("Customer", "manager").unwrap().resolvers,
        vec!["managers"]
    );
    assert!(supergraph.mutation_type.is_some());
    assert!(supergraph.to_sdl().contains("enum join__Graph"));
}

#[tokio::test]
async fn test_schemas_are_introspected_without_schema_files() {
    let customers = MockServer::start().await;
    let rooms = MockServer::start().await;
    Mock::given(body_string_contains("_service"))
        .respond_with(reply(json!({
            "data": { "_service": { "sdl": fs::read_to_string("schemas/rooms.graphql").unwrap() } }
        })))
        .mount(&rooms)
        .await;
    Mock::given(body_string_contains("rooms {"))
        .respond_with(reply(json!({ "data": { "rooms": [{ "id": "1", "name": "Blue" }] } })))
        .mount(&rooms)
        .await;

    let config = GatewayConfig::from_yaml(
        &format!(
            r#"
subgraphs:
  customers:
    routing_url: {}
    schema:
      file: customers.graphql
  rooms:
    routing_url: {}
"#,
            customers.uri(),
            rooms.uri()
        ),
        "schemas",
    )
    .unwrap();

    let gateway = FederationGateway::new(
        Box::new(InMemorySchemaRegistry::new()),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(HttpQueryExecutor::new()),
    );
    gateway.load_schemas(&config).await.unwrap();

    let supergraph = gateway.supergraph().await.unwrap();
    assert_eq!(
        supergraph.field("Query", "rooms").unwrap().resolvers,
        vec!["rooms"]
    );

    let response = gateway
        .process_request(GraphQLRequest::new("{ rooms { name } }"))
        .await;
    assert_eq!(response.data, Some(json!({ "rooms": [{ "name": "Blue" }] })));
}

#[tokio::test]
async fn test_gateway_serves_http() {
    let fixture = TestFixture::setup().await;
    Mock::given(method("POST"))
        .respond_with(reply(json!({ "data": { "rooms": [{ "name": "Blue" }, { "name": "Red" }] } })))
        .mount(&fixture.rooms)
        .await;
    let TestFixture { gateway, rooms, .. } = fixture;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(server::serve(
        listener,
        Arc::new(gateway),
        "/graphql",
        async {
            let _ = shutdown_rx.await;
        },
    ));

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/graphql");

    let malformed = client.post(&url).body("{ not json").send().await.unwrap();
    assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = malformed.json().await.unwrap();
    assert_eq!(body["errors"][0]["extensions"]["code"], "BAD_REQUEST");

    let response = client
        .post(&url)
        .json(&json!({ "query": "query Rooms { rooms { name } }", "operationName": "Rooms" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({ "data": { "rooms": [{ "name": "Blue" }, { "name": "Red" }] } })
    );
    assert_eq!(
        received_bodies(&rooms).await[0]["operationName"],
        "Rooms__rooms__0"
    );

    let invalid = client
        .post(&url)
        .json(&json!({ "query": "{ rooms { size } }" }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), reqwest::StatusCode::OK);
    let body: Value = invalid.json().await.unwrap();
    assert!(body.get("data").is_none());
    assert_eq!(
        body["errors"][0]["extensions"]["code"],
        "GRAPHQL_VALIDATION_FAILED"
    );

    shutdown_tx.send(()).unwrap();
    server.await.unwrap();
}
