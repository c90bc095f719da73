use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::{FederationGateway, GraphQLRequest, GraphQLResponse, MalformedRequestError};

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

const GRAPHIQL_HTML: &str = r#"
<!DOCTYPE html>
<html>
<head>
  <title>GraphiQL - Concierge Federation Gateway</title>
  <link href="https://unpkg.com/graphiql@1.5.0/graphiql.min.css" rel="stylesheet" />
  <style>
    body { margin: 0; padding: 0; height: 100vh; }
    #graphiql { height: 100vh; }
  </style>
</head>
<body>
  <div id="graphiql"></div>

  <script src="https://unpkg.com/react@17.0.2/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@17.0.2/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/graphiql@1.5.0/graphiql.min.js"></script>
  <script>
    function graphQLFetcher(graphQLParams) {
      return fetch('{{GRAPHQL_PATH}}', {
        method: 'post',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify(graphQLParams),
      }).then(response => response.json());
    }

    ReactDOM.render(
      React.createElement(GraphiQL, { fetcher: graphQLFetcher }),
      document.getElementById('graphiql')
    );
  </script>
</body>
</html>
"#;

/// Routes one HTTP request. Never fails: every problem becomes a response.
pub async fn handle_request<B>(
    req: Request<B>,
    gateway: Arc<FederationGateway>,
    graphql_path: Arc<str>,
) -> Result<Response<ResponseBody>, Infallible>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let result = match (&method, path.as_str()) {
        (&Method::POST, path) if path == &*graphql_path => {
            match read_graphql_request(req).await {
                Ok(graphql_req) => {
                    let response = gateway.process_request(graphql_req).await;
                    json_response(StatusCode::OK, &response)
                }
                Err(error) => {
                    tracing::debug!(%error, "rejecting malformed request");
                    json_response(
                        StatusCode::BAD_REQUEST,
                        &GraphQLResponse::from_errors(vec![error.into()]),
                    )
                }
            }
        }

        (&Method::GET, "/graphiql") => Response::builder()
            .header("Content-Type", "text/html")
            .header("Access-Control-Allow-Origin", "*")
            .body(full(GRAPHIQL_HTML.replace("{{GRAPHQL_PATH}}", &graphql_path)))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::GET, "/") => Response::builder()
            .status(StatusCode::FOUND)
            .header("Location", "/graphiql")
            .header("Access-Control-Allow-Origin", "*")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::GET, "/health") => {
            json_response(StatusCode::OK, &serde_json::json!({ "status": "UP" }))
        }

        (&Method::OPTIONS, _) => Response::builder()
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("Access-Control-Allow-Origin", "*")
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(result)
}

async fn read_graphql_request<B>(req: Request<B>) -> Result<GraphQLRequest, MalformedRequestError>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body_bytes = req
        .collect()
        .await
        .map_err(|e| MalformedRequestError::Body(e.to_string()))?
        .to_bytes();

    let graphql_req = serde_json::from_slice::<GraphQLRequest>(&body_bytes)
        .map_err(|e| MalformedRequestError::InvalidJson(e.to_string()))?;
    if graphql_req.query.trim().is_empty() {
        return Err(MalformedRequestError::EmptyQuery);
    }
    Ok(graphql_req)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<ResponseBody> {
    let Ok(json) = serde_json::to_vec(body) else {
        return internal_server_error();
    };
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(full(json))
        .unwrap_or_else(|_| internal_server_error())
}

// Create a standard internal server error response
fn internal_server_error() -> Response<ResponseBody> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

/// Accepts connections until `shutdown` resolves. Each connection runs on
/// its own task; dropping a connection drops its in-flight requests.
pub async fn serve<F>(
    listener: TcpListener,
    gateway: Arc<FederationGateway>,
    graphql_path: &str,
    shutdown: F,
)
where
    F: Future<Output = ()>,
{
    let graphql_path: Arc<str> = Arc::from(graphql_path);
    tokio::pin!(shutdown);

    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(%error, "failed to accept connection");
                    continue;
                }
            },
            () = &mut shutdown => {
                tracing::info!("shutting down gateway server");
                return;
            }
        };
        let io = TokioIo::new(stream);

        let gateway = Arc::clone(&gateway);
        let graphql_path = Arc::clone(&graphql_path);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                handle_request(req, Arc::clone(&gateway), Arc::clone(&graphql_path))
            });

            match hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                Ok(()) => tracing::trace!(%remote_addr, "connection closed"),
                Err(error) => tracing::debug!(%remote_addr, %error, "error serving connection"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FederatedQueryPlanner, HttpQueryExecutor, InMemorySchemaRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    fn gateway() -> Arc<FederationGateway> {
        Arc::new(FederationGateway::new(
            Box::new(InMemorySchemaRegistry::new()),
            Box::new(FederatedQueryPlanner::new()),
            Box::new(HttpQueryExecutor::new()),
        ))
    }

    async fn send(method: Method, uri: &str, body: &str) -> (StatusCode, Bytes) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let response = handle_request(req, gateway(), Arc::from("/graphql"))
            .await
            .unwrap();
        let status = response.status();
        (status, response.into_body().collect().await.unwrap().to_bytes())
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let (status, body) = send(Method::POST, "/graphql", "{ not json").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["errors"][0]["extensions"]["code"], "BAD_REQUEST");
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn empty_query_is_a_bad_request() {
        let (status, _) = send(Method::POST, "/graphql", r#"{ "query": "  " }"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_and_unknown_routes() {
        let (status, body) = send(Method::GET, "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            serde_json::from_slice::<Value>(&body).unwrap(),
            json!({ "status": "UP" })
        );

        let (status, _) = send(Method::GET, "/graphql/extra", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(Method::GET, "/", "").await;
        assert_eq!(status, StatusCode::FOUND);
    }
}
