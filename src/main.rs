use std::env;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, pkcs8_private_keys};
use warp::http::StatusCode;
use warp::Filter;

use chatline::{ChatServer, MessageStore, SqliteStore};

fn load_tls_config(cert_path: &str, key_path: &str) -> Option<rustls::ServerConfig> {
    let cert_file = match File::open(cert_path) {
        Ok(file) => file,
        Err(e) => {
            error!("failed to open certificate file {}: {}", cert_path, e);
            return None;
        }
    };
    let key_file = match File::open(key_path) {
        Ok(file) => file,
        Err(e) => {
            error!("failed to open private key file {}: {}", key_path, e);
            return None;
        }
    };

    let cert_chain: Vec<CertificateDer<'_>> =
        match certs(&mut BufReader::new(cert_file)).collect::<Result<_, _>>() {
            Ok(cert_chain) => cert_chain,
            Err(e) => {
                error!("failed to parse certificate: {}", e);
                return None;
            }
        };
    if cert_chain.is_empty() {
        error!("no certificates found in {}", cert_path);
        return None;
    }

    let key = match pkcs8_private_keys(&mut BufReader::new(key_file)).next() {
        Some(Ok(key)) => PrivateKeyDer::from(key),
        Some(Err(e)) => {
            error!("failed to parse private key: {}", e);
            return None;
        }
        None => {
            error!("no PKCS#8 private key found in {}", key_path);
            return None;
        }
    };

    match rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
    {
        Ok(config) => Some(config),
        Err(e) => {
            error!("failed to create TLS config: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let addr: SocketAddr = match env::var("CHATLINE_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:2052".to_string())
        .parse()
    {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid CHATLINE_ADDR: {}", e);
            std::process::exit(1);
        }
    };
    let database_url = env::var("CHATLINE_DB").unwrap_or_else(|_| "sqlite:chatline.db".to_string());

    let store = match SqliteStore::new(&database_url).await {
        Ok(store) => store,
        Err(e) => {
            error!("failed to open message store: {}", e);
            std::process::exit(1);
        }
    };

    let server = Arc::new(ChatServer::new(Arc::new(store)));

    let ws_server = server.clone();
    let ws_route = warp::path("ws").and(warp::ws()).map(move |ws: warp::ws::Ws| {
        let server = ws_server.clone();
        ws.on_upgrade(move |socket| {
            let server = server.clone();
            async move {
                server.handle_connection(socket).await;
            }
        })
    });

    // Read-only conversation history for the pair, both directions,
    // ascending timestamp.
    let history_server = server.clone();
    let history_route = warp::path!("history" / String / String).and_then(
        move |user_a: String, user_b: String| {
            let server = history_server.clone();
            async move {
                match server.store().between(&user_a, &user_b).await {
                    Ok(messages) => Ok::<_, warp::Rejection>(warp::reply::with_status(
                        warp::reply::json(&messages),
                        StatusCode::OK,
                    )),
                    Err(e) => {
                        error!("history query for {}/{} failed: {}", user_a, user_b, e);
                        Ok(warp::reply::with_status(
                            warp::reply::json(&serde_json::json!({
                                "error": "history unavailable"
                            })),
                            StatusCode::INTERNAL_SERVER_ERROR,
                        ))
                    }
                }
            }
        },
    );

    let routes = ws_route
        .or(history_route)
        .with(warp::cors().allow_any_origin());

    let tls = match (env::var("CHATLINE_TLS_CERT"), env::var("CHATLINE_TLS_KEY")) {
        (Ok(cert_path), Ok(key_path)) => {
            load_tls_config(&cert_path, &key_path).map(|_| (cert_path, key_path))
        }
        _ => None,
    };

    match tls {
        Some((cert_path, key_path)) => {
            info!("listening on {} (wss)", addr);
            warp::serve(routes)
                .tls()
                .cert_path(cert_path)
                .key_path(key_path)
                .run(addr)
                .await;
        }
        None => {
            warn!("TLS not configured, serving plaintext on {}", addr);
            warp::serve(routes).run(addr).await;
        }
    }
}
