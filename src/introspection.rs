use serde_json::Value;
use std::time::Duration;

use crate::query_executor::post_graphql;
use crate::{GraphQLRequest, GraphQLResponse, SubgraphTransportError};

const SERVICE_SDL_QUERY: &str = "query __ServiceSdl { _service { sdl } }";

/// Asks a subgraph for its federation SDL through `_service { sdl }`.
pub async fn fetch_subgraph_sdl(
    client: &reqwest::Client,
    name: &str,
    url: &str,
    timeout: Duration,
) -> Result<String, SubgraphTransportError> {
    tracing::info!(subgraph = name, url, "introspecting subgraph schema");

    let request = GraphQLRequest::new(SERVICE_SDL_QUERY).with_operation_name("__ServiceSdl");
    let response = post_graphql(client, name, url, &request, timeout).await?;

    sdl_from_response(name, response)
}

fn sdl_from_response(
    name: &str,
    response: GraphQLResponse,
) -> Result<String, SubgraphTransportError> {
    let sdl = response
        .data
        .as_ref()
        .and_then(|data| data.pointer("/_service/sdl"))
        .and_then(Value::as_str);

    match sdl {
        Some(sdl) => Ok(sdl.to_string()),
        None => {
            let reason = response
                .errors
                .first()
                .map(|error| error.message.clone())
                .unwrap_or_else(|| "missing `_service.sdl` in response".to_string());
            Err(SubgraphTransportError::InvalidResponse {
                service: name.to_string(),
                reason,
            })
        }
    }
}
