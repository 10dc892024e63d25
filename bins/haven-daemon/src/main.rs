mod config;

use bytes::Bytes;
use config::HavenConfig;
use haven_core::config::CoreConfig;
use haven_core::error::CoreError;
use haven_core::objects::MemoryObjects;
use haven_core::threads::MemoryThreads;
use haven_core::time::SystemClock;
use haven_core::transport::MemoryCafe;
use haven_core::Node;
use haven_store::{KeyProvider, StaticKey};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{info, LevelFilter};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config: {0}")]
    Config(String),
    #[error("core")]
    Core,
    #[error("bind")]
    Bind,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("haven.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path).map_err(|err| DaemonError::Config(err.to_string()))?;
    init_logging(&cfg);
    let (node, cafe_id) = init_node(&cfg).await?;
    node.start().await;
    info!("node is started");
    info!("account address: {}", node.address());
    info!("local cafe available: {}", cafe_id);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = start_control_server(&cfg, node.clone(), cafe_id, shutdown_rx).await?;
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let _ = ctrl_c.as_mut().await;
    info!("stopping node...");
    let _ = shutdown_tx.send(());
    let _ = server.await;
    node.stop().await;
    info!("node is stopped");
    Ok(())
}

fn init_logging(cfg: &HavenConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

async fn init_node(cfg: &HavenConfig) -> Result<(Arc<Node>, String), DaemonError> {
    let core_cfg = CoreConfig {
        storage_path: cfg.data_dir.join("core").display().to_string(),
        namespace: cfg.node.namespace.clone(),
        dispatch_interval_ms: cfg.node.dispatch_interval_ms,
        polling_interval_ms: cfg.node.polling_interval_ms,
    };
    let clock = Arc::new(SystemClock);
    let cafe = MemoryCafe::new(clock.clone());
    let cafe_id = cafe.add_cafe(&cfg.cafe.token).await;
    let key_provider: Arc<dyn KeyProvider> = Arc::new(StaticKey(vec![2u8; 32]));
    let node = Node::init(
        core_cfg,
        cfg.policy.clone(),
        key_provider,
        clock,
        Arc::new(cafe),
        Arc::new(MemoryObjects::new()),
        Arc::new(MemoryThreads::new()),
    )
    .await
    .map_err(|_| DaemonError::Core)?;
    Ok((node, cafe_id))
}

async fn start_control_server(
    cfg: &HavenConfig,
    node: Arc<Node>,
    cafe_id: String,
    shutdown: oneshot::Receiver<()>,
) -> Result<JoinHandle<()>, DaemonError> {
    let addr = cfg
        .api
        .socket_addr()
        .map_err(|err| DaemonError::Config(err.to_string()))?;
    let listener = TcpListener::bind(addr).await.map_err(|_| DaemonError::Bind)?;
    info!("control api on {}", addr);
    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let node = node.clone();
                            let cafe_id = cafe_id.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let node = node.clone();
                                    let cafe_id = cafe_id.clone();
                                    async move { handle_request(node, cafe_id, req).await }
                                });
                                let _ = http1::Builder::new().serve_connection(io, service).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    });
    Ok(handle)
}

#[derive(Deserialize)]
struct AddCafeBody {
    id: String,
    token: String,
}

async fn handle_request(
    node: Arc<Node>,
    cafe_id: String,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();
    match (method.as_str(), path.as_str()) {
        ("GET", "/api/v1/health") => Ok(json_response(
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "address": node.address(),
                "cafe": cafe_id,
            }),
        )),
        ("GET", "/api/v1/cafes") => match node.cafe_sessions().await {
            Ok(sessions) => Ok(json_response(
                StatusCode::OK,
                serde_json::to_value(sessions).unwrap_or_default(),
            )),
            Err(err) => Ok(error_response(&err)),
        },
        ("POST", "/api/v1/cafes") => {
            let body = req.into_body().collect().await?.to_bytes();
            let Ok(body) = serde_json::from_slice::<AddCafeBody>(&body) else {
                return Ok(json_response(
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({"error": "bad body"}),
                ));
            };
            match node.cafe_register(&body.id, &body.token).await {
                Ok(session) => Ok(json_response(
                    StatusCode::CREATED,
                    serde_json::to_value(session).unwrap_or_default(),
                )),
                Err(err) => Ok(error_response(&err)),
            }
        }
        ("POST", "/api/v1/cafes/messages") => match node.check_mail().await {
            Ok(()) => Ok(json_response(
                StatusCode::OK,
                serde_json::json!({"status": "checked"}),
            )),
            Err(err) => Ok(error_response(&err)),
        },
        ("GET", _) if path.starts_with("/api/v1/cafes/") => {
            let id = path.trim_start_matches("/api/v1/cafes/");
            match node.cafe_session(id).await {
                Ok(Some(session)) => Ok(json_response(
                    StatusCode::OK,
                    serde_json::to_value(session).unwrap_or_default(),
                )),
                Ok(None) => Ok(json_response(
                    StatusCode::NOT_FOUND,
                    serde_json::json!({"error": "no such cafe"}),
                )),
                Err(err) => Ok(error_response(&err)),
            }
        }
        ("DELETE", _) if path.starts_with("/api/v1/cafes/") => {
            let id = path.trim_start_matches("/api/v1/cafes/");
            match node.cafe_deregister(id).await {
                Ok(()) => Ok(json_response(
                    StatusCode::OK,
                    serde_json::json!({"status": "removed"}),
                )),
                Err(err) => Ok(error_response(&err)),
            }
        }
        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({"error": "not found"}),
        )),
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::from(body.to_string()))
        .unwrap_or_default()
}

fn error_response(err: &CoreError) -> Response<Full<Bytes>> {
    let status = match err {
        CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
        CoreError::NotFound => StatusCode::NOT_FOUND,
        CoreError::Cafe { code, .. } if *code == 401 || *code == 403 => StatusCode::UNAUTHORIZED,
        CoreError::Transport(_) => StatusCode::BAD_GATEWAY,
        CoreError::Malformed(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(status, serde_json::json!({"error": err.to_string()}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::policy::Policy;
    use tempfile::tempdir;

    #[test]
    fn config_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("haven.toml");
        let cfg = format!(
            r#"
data_dir = "{dir}"

[node]
namespace = "alice"
dispatch_interval_ms = 250
polling_interval_ms = 60000

[cafe]
token = "sekrit"

[api]
bind_addr = "127.0.0.1:9041"

[logging]
level = "debug"
"#,
            dir = dir.path().display()
        );
        std::fs::write(&path, cfg).unwrap();
        let loaded = config::load_config(&path).unwrap();
        assert_eq!(loaded.node.namespace, "alice");
        assert_eq!(loaded.cafe.token, "sekrit");
        assert_eq!(loaded.api.bind_addr, "127.0.0.1:9041");
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("haven.toml");
        let cfg = format!(
            r#"
data_dir = "{dir}"
surprise = true

[logging]
level = "info"
"#,
            dir = dir.path().display()
        );
        std::fs::write(&path, cfg).unwrap();
        assert!(config::load_config(&path).is_err());
    }

    #[test]
    fn config_rejects_bad_bind_addr() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("haven.toml");
        let cfg = format!(
            r#"
data_dir = "{dir}"

[api]
bind_addr = "not-an-addr"

[logging]
level = "info"
"#,
            dir = dir.path().display()
        );
        std::fs::write(&path, cfg).unwrap();
        assert!(config::load_config(&path).is_err());
    }

    #[tokio::test]
    async fn daemon_node_starts_and_stops() {
        let dir = tempdir().unwrap();
        let cfg = HavenConfig {
            data_dir: dir.path().to_path_buf(),
            node: config::NodeConfig::default(),
            policy: Policy::default(),
            cafe: config::CafeConfig::default(),
            api: config::ApiConfig::default(),
            logging: config::LoggingConfig {
                level: "info".to_string(),
            },
        };
        let (node, cafe_id) = init_node(&cfg).await.expect("node");
        assert!(!cafe_id.is_empty());
        node.start().await;
        node.stop().await;
    }
}
