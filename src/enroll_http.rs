use crate::error::GatewayError;
use crate::service::{JoinRequest, PeerService};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use uuid::Uuid;

/// Largest accepted request body
pub const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Running API server
pub struct ApiServer {
    server: Arc<Server>,
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ApiServer {
    /// Address the server is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests and join the workers
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for _ in &self.workers {
            self.server.unblock();
        }
        for w in self.workers {
            let _ = w.join();
        }
        info!("api server on {} stopped", self.addr);
    }
}

/**
 * @brief Bind the API server and start its worker threads.
 * @param bind Listen address, port 0 picks a free port.
 * @param service Registration service shared by all workers.
 * @param output_dir Root directory of built client artifacts.
 * @param workers Number of request threads.
 * @return Handle of the running server.
 */
pub fn spawn_api_server(
    bind: SocketAddr,
    service: Arc<PeerService>,
    output_dir: PathBuf,
    workers: usize,
) -> io::Result<ApiServer> {
    let server = Server::http(bind).map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))?;
    let addr = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "api server is not bound to an IP socket"))?;
    let server = Arc::new(server);
    let shutdown = Arc::new(AtomicBool::new(false));
    let output_dir = Arc::new(output_dir);

    let handles = (0..workers.max(1))
        .map(|i| {
            let server = Arc::clone(&server);
            let shutdown = Arc::clone(&shutdown);
            let service = Arc::clone(&service);
            let output_dir = Arc::clone(&output_dir);
            thread::Builder::new()
                .name(format!("api-{i}"))
                .spawn(move || loop {
                    match server.recv() {
                        Ok(req) => handle(req, &service, &output_dir),
                        Err(e) if shutdown.load(Ordering::SeqCst) => {
                            debug!("api worker {i} exiting: {e}");
                            break;
                        }
                        Err(e) => warn!("api worker {i}: receive failed: {e}"),
                    }
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                })
        })
        .collect::<io::Result<Vec<_>>>()?;

    info!("api server listening on http://{addr}");
    Ok(ApiServer {
        server,
        addr,
        shutdown,
        workers: handles,
    })
}

enum Reply {
    Json(u16, serde_json::Value),
    Text(u16, String),
    File(File, String),
}

impl Reply {
    fn json<T: Serialize>(status: u16, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(v) => Self::Json(status, v),
            Err(e) => {
                error!("failed to encode response: {e}");
                Self::Text(500, "Internal server error".into())
            }
        }
    }

    fn error(err: &GatewayError) -> Self {
        let status = err.status_code();
        if status >= 500 {
            error!("request failed: {err}");
        } else {
            debug!("request rejected: {err}");
        }
        let mut body = serde_json::json!({ "error": err.to_string() });
        if let GatewayError::BuildFailed { peer_id, assigned_ip, .. } = err {
            body["id"] = serde_json::json!(peer_id);
            body["assigned_ip"] = serde_json::json!(assigned_ip);
        }
        Self::Json(status, body)
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn handle(mut req: Request, service: &PeerService, output_dir: &Path) {
    let method = req.method().clone();
    let url = req.url().to_string();
    let path = url.split('?').next().unwrap_or("").to_string();
    debug!("{method} {path} from {:?}", req.remote_addr());

    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    let reply = match (&method, segments.as_slice()) {
        (Method::Get | Method::Head, []) => Reply::Text(200, "wg-gateway".into()),
        (Method::Post, ["peer"]) => post_peer(&mut req, service),
        (Method::Get, ["peer", id]) => get_peer(service, id),
        (Method::Get, ["peers"]) => match service.list_peers() {
            Ok(peers) => Reply::json(200, &peers),
            Err(e) => Reply::error(&e.into()),
        },
        (Method::Get, ["subnet"]) => match service.subnet_summary() {
            Ok(summary) => Reply::json(200, &summary),
            Err(e) => Reply::error(&e),
        },
        (Method::Get, ["downloads", build_id, filename]) => download(output_dir, build_id, filename),
        (_, ["peer"] | ["peer", _] | ["peers"] | ["subnet"] | ["downloads", _, _]) => {
            Reply::Text(405, "Method not allowed".into())
        }
        _ => Reply::Text(404, "Not Found".into()),
    };
    respond(req, reply);
}

fn post_peer(req: &mut Request, service: &PeerService) -> Reply {
    let mut body = String::new();
    if let Err(e) = req.as_reader().take(MAX_BODY_BYTES).read_to_string(&mut body) {
        return Reply::error(&GatewayError::BadRequest(format!("unreadable body: {e}")));
    }
    let request: JoinRequest = match serde_json::from_str(&body) {
        Ok(r) => r,
        Err(e) => return Reply::error(&GatewayError::BadRequest(format!("invalid request: {e}"))),
    };
    match service.register(request) {
        Ok(outcome) => Reply::json(200, &outcome),
        Err(e) => Reply::error(&e),
    }
}

fn get_peer(service: &PeerService, id: &str) -> Reply {
    let Ok(id) = Uuid::parse_str(id) else {
        return Reply::Text(400, "Invalid ID format".into());
    };
    match service.get_peer(id) {
        Ok(peer) => Reply::json(200, &peer),
        Err(e) => Reply::error(&e.into()),
    }
}

fn is_plain_component(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\'])
}

fn download(output_dir: &Path, build_id: &str, filename: &str) -> Reply {
    if !is_plain_component(build_id) || !is_plain_component(filename) {
        return Reply::Text(404, "File not found".into());
    }
    let real_path = output_dir.join(build_id).join(filename);
    info!("serving file {}", real_path.display());
    match fs::metadata(&real_path) {
        Ok(meta) if meta.is_file() => match File::open(&real_path) {
            Ok(file) => Reply::File(file, filename.to_string()),
            Err(e) => Reply::error(&GatewayError::Io(e)),
        },
        _ => Reply::Text(404, "File not found".into()),
    }
}

fn body_response(status: u16, content_type: &str, body: String) -> Response<Cursor<Vec<u8>>> {
    let len = body.len();
    let headers = header("Content-Type", content_type).into_iter().collect();
    Response::new(StatusCode(status), headers, Cursor::new(body.into_bytes()), Some(len), None)
}

fn respond(req: Request, reply: Reply) {
    let result = match reply {
        Reply::Json(status, body) => req.respond(body_response(status, "application/json", body.to_string())),
        Reply::Text(status, body) => req.respond(body_response(status, "text/plain; charset=utf-8", body)),
        Reply::File(file, name) => {
            let mut resp = Response::from_file(file);
            if let Some(h) = header("Content-Type", "application/octet-stream") {
                resp.add_header(h);
            }
            if let Some(h) = header("Content-Disposition", &format!("attachment; filename={name}")) {
                resp.add_header(h);
            }
            req.respond(resp)
        }
    };
    if let Err(e) = result {
        warn!("failed to send response: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_components() {
        assert!(is_plain_component("1700000000000000000"));
        assert!(is_plain_component("gateway-client.exe"));
        assert!(!is_plain_component(".."));
        assert!(!is_plain_component("."));
        assert!(!is_plain_component(""));
        assert!(!is_plain_component("a\\b"));
    }

    #[test]
    fn build_failure_reply_carries_peer() {
        let err = GatewayError::BuildFailed {
            peer_id: Uuid::nil(),
            assigned_ip: std::net::Ipv4Addr::new(10, 0, 0, 3),
            source: crate::error::ArtifactError::CompilationFailed("exit 101".into()),
        };
        match Reply::error(&err) {
            Reply::Json(500, body) => {
                assert_eq!(body["assigned_ip"], "10.0.0.3");
                assert_eq!(body["id"], Uuid::nil().to_string());
            }
            _ => panic!("expected json 500"),
        }
    }
}
