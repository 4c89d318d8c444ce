//! The HTTP façade.
//!
//! Client-facing key operations and cluster management share one listener
//! with the inter-node Raft RPC endpoints:
//!
//! - `GET /key/{key}` reads a key, optionally through a leader read barrier
//!   (`?consistent=true`).
//! - `POST /key` applies a JSON object of key/value pairs as Set commands.
//! - `DELETE /key/{key}` applies a Delete command.
//! - `POST /join` admits a node as a learner and promotes it to voter.
//! - `GET /metrics` exposes the engine's metrics payload.
//! - `POST /raft/{vote,append,snapshot}` carry the inter-node RPCs.
//!
//! Requests requiring the leader answer `503` with a [`NotLeader`] body
//! carrying the leader's id and address when known, so callers can retry
//! against the right node.

use std::collections::BTreeMap;
use std::sync::Arc;

use actix_web::delete;
use actix_web::get;
use actix_web::post;
use actix_web::web;
use actix_web::App;
use actix_web::HttpResponse;
use actix_web::HttpServer;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::kv::Command;
use crate::node::Node;
use crate::raft::AppendEntriesRequest;
use crate::raft::ClientWriteRequest;
use crate::raft::InstallSnapshotRequest;
use crate::raft::VoteRequest;
use crate::NodeId;

/// Payload limit for JSON bodies. Snapshot chunks dominate; leave headroom
/// over the configured chunk size.
const JSON_PAYLOAD_LIMIT: usize = 32 * 1024 * 1024;

/// The body of a `POST /join` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    /// The id of the joining node.
    pub id: NodeId,
    /// The address the joining node advertises.
    pub addr: String,
}

/// The `503` body returned when a request requires the leader but this node
/// is not it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotLeader {
    pub error: String,
    /// The current leader's id, when this node knows it.
    pub leader_id: Option<NodeId>,
    /// The current leader's advertised address, when known.
    pub leader_addr: Option<String>,
}

/// Serve the façade for `node` on `api_addr` until stopped.
pub async fn serve(node: Arc<Node>, api_addr: String) -> Result<()> {
    let data = web::Data::new(node);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .app_data(web::JsonConfig::default().limit(JSON_PAYLOAD_LIMIT))
            .configure(routes)
    })
    .bind(api_addr.as_str())?
    .run()
    .await?;
    Ok(())
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(read_key)
        .service(write_keys)
        .service(delete_key)
        .service(join)
        .service(metrics)
        .service(raft_vote)
        .service(raft_append)
        .service(raft_snapshot);
}

/// Build the `503` response for a request that must go to the leader,
/// resolving the leader's address from the transport directory when only
/// its id is known.
async fn not_leader(node: &Node, leader_id: Option<NodeId>, leader_addr: Option<String>) -> HttpResponse {
    let leader_addr = match (leader_addr, leader_id) {
        (Some(addr), _) => Some(addr),
        (None, Some(id)) => node.network.addr_of(id).await,
        (None, None) => None,
    };
    HttpResponse::ServiceUnavailable().json(NotLeader {
        error: "not leader".to_string(),
        leader_id,
        leader_addr,
    })
}

fn internal_error(err: impl std::fmt::Display) -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": err.to_string() }))
}

async fn write_error_response(node: &Node, err: ClientWriteError) -> HttpResponse {
    match err {
        ClientWriteError::ForwardToLeader(_cmd, leader_id, leader_addr) => {
            not_leader(node, leader_id, leader_addr).await
        }
        ClientWriteError::RaftError(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ReadOptions {
    /// Run a leader read barrier before serving the value.
    #[serde(default)]
    consistent: bool,
}

#[get("/key/{key}")]
async fn read_key(
    node: web::Data<Arc<Node>>,
    key: web::Path<String>,
    opts: web::Query<ReadOptions>,
) -> HttpResponse {
    if opts.consistent {
        if let Err(err) = node.raft.client_read().await {
            return match err {
                ClientReadError::ForwardToLeader(leader_id, leader_addr) => {
                    not_leader(&node, leader_id, leader_addr).await
                }
                ClientReadError::RaftError(err) => internal_error(err),
            };
        }
    }
    match node.store.read(&key).await {
        Some(value) => HttpResponse::Ok().json(json!({ "key": key.as_str(), "value": value })),
        None => HttpResponse::NotFound().json(json!({ "error": format!("key not found: {}", key) })),
    }
}

#[post("/key")]
async fn write_keys(node: web::Data<Arc<Node>>, body: web::Json<BTreeMap<String, String>>) -> HttpResponse {
    for (key, value) in body.into_inner() {
        let req = ClientWriteRequest::new(Command::Set { key, value });
        if let Err(err) = node.raft.client_write(req).await {
            return write_error_response(&node, err).await;
        }
    }
    HttpResponse::Ok().finish()
}

#[delete("/key/{key}")]
async fn delete_key(node: web::Data<Arc<Node>>, key: web::Path<String>) -> HttpResponse {
    let req = ClientWriteRequest::new(Command::Delete { key: key.into_inner() });
    match node.raft.client_write(req).await {
        Ok(_) => HttpResponse::Ok().finish(),
        Err(err) => write_error_response(&node, err).await,
    }
}

/// Admit a node: record its address, sync it as a learner, then promote it
/// to voter. Safe to repeat; re-joining an existing member is a no-op.
#[post("/join")]
async fn join(node: web::Data<Arc<Node>>, req: web::Json<JoinRequest>) -> HttpResponse {
    let JoinRequest { id, addr } = req.into_inner();
    node.network.upsert_route(id, addr.clone()).await;

    // Blocks until the learner has caught up to within the lag threshold.
    if let Err(err) = node.raft.add_non_voter(id, addr).await {
        return change_config_error_response(&node, err).await;
    }

    let mut members = node.raft.metrics().borrow().membership_config.members.clone();
    if members.contains(&id) {
        return HttpResponse::Ok().finish();
    }
    members.insert(id);
    match node.raft.change_membership(members).await {
        Ok(()) | Err(ChangeConfigError::Noop) => HttpResponse::Ok().finish(),
        Err(err) => change_config_error_response(&node, err).await,
    }
}

async fn change_config_error_response(node: &Node, err: ChangeConfigError) -> HttpResponse {
    match err {
        ChangeConfigError::NodeNotLeader(leader_id, leader_addr) => not_leader(node, leader_id, leader_addr).await,
        ChangeConfigError::ConfigChangeInProgress => {
            HttpResponse::Conflict().json(json!({ "error": "a config change is already in progress" }))
        }
        ChangeConfigError::InoperableConfig => {
            HttpResponse::BadRequest().json(json!({ "error": "the requested config is not operable" }))
        }
        ChangeConfigError::Noop => HttpResponse::Ok().finish(),
        ChangeConfigError::RaftError(err) => internal_error(err),
    }
}

#[get("/metrics")]
async fn metrics(node: web::Data<Arc<Node>>) -> HttpResponse {
    let metrics = node.raft.metrics().borrow().clone();
    HttpResponse::Ok().json(metrics)
}

#[post("/raft/vote")]
async fn raft_vote(node: web::Data<Arc<Node>>, req: web::Json<VoteRequest>) -> HttpResponse {
    match node.raft.vote(req.into_inner()).await {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(err) => internal_error(err),
    }
}

#[post("/raft/append")]
async fn raft_append(node: web::Data<Arc<Node>>, req: web::Json<AppendEntriesRequest>) -> HttpResponse {
    match node.raft.append_entries(req.into_inner()).await {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(err) => internal_error(err),
    }
}

#[post("/raft/snapshot")]
async fn raft_snapshot(node: web::Data<Arc<Node>>, req: web::Json<InstallSnapshotRequest>) -> HttpResponse {
    match node.raft.install_snapshot(req.into_inner()).await {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(err) => internal_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;
    use actix_web::test;
    use std::time::Duration;

    async fn leader_node() -> Arc<Node> {
        let node = Node::open(true, 1, "127.0.0.1:21001".to_string(), None)
            .await
            .unwrap();
        node.raft
            .wait(Some(Duration::from_secs(5)))
            .state(State::Leader, "api test node to become leader")
            .await
            .unwrap();
        node
    }

    #[actix_web::test]
    async fn set_then_get_roundtrip() {
        let node = leader_node().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(node.clone()))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/key")
            .set_json(maplit::btreemap! { "city".to_string() => "osaka".to_string() })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::get().uri("/key/city?consistent=true").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["value"], "osaka");
    }

    #[actix_web::test]
    async fn missing_key_is_not_found() {
        let node = leader_node().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(node.clone()))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/key/absent").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn delete_removes_a_key() {
        let node = leader_node().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(node.clone()))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/key")
            .set_json(maplit::btreemap! { "gone".to_string() => "soon".to_string() })
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::delete().uri("/key/gone").to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::get().uri("/key/gone").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }
}
