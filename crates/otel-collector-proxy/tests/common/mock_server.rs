// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock OTLP collector that records what it receives and answers with scripted statuses

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("Mock server received invalid JSON")
    }
}

#[derive(Clone)]
pub struct MockServer {
    pub addr: SocketAddr,
    pub received_requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    gate: Arc<Semaphore>,
}

impl MockServer {
    /// Start a mock collector that always answers 200
    pub async fn start() -> Self {
        Self::start_with_script(vec![200]).await
    }

    /// Start a mock collector that always answers with `status`
    pub async fn start_with_status(status: u16) -> Self {
        Self::start_with_script(vec![status]).await
    }

    /// Answers with the scripted statuses in order, then repeats the last one
    pub async fn start_with_script(statuses: Vec<u16>) -> Self {
        let server = Self::start_held(statuses).await;
        server.release();
        server
    }

    /// Records requests as they arrive but holds every answer until [`MockServer::release`]
    pub async fn start_held(statuses: Vec<u16>) -> Self {
        let gate = Arc::new(Semaphore::new(0));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock server");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let received_requests = Arc::new(Mutex::new(Vec::new()));
        let requests_clone = received_requests.clone();
        let script = Arc::new(Mutex::new(VecDeque::from(statuses)));
        let gate_clone = gate.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let io = TokioIo::new(stream);
                let requests = requests_clone.clone();
                let script = script.clone();
                let gate = gate_clone.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let script = script.clone();
                        let gate = gate.clone();
                        async move {
                            let method = req.method().to_string();
                            let path = req.uri().path().to_string();
                            let headers: Vec<(String, String)> = req
                                .headers()
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                                .collect();

                            let body_bytes = req
                                .into_body()
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes().to_vec())
                                .unwrap_or_default();

                            requests.lock().unwrap().push(ReceivedRequest {
                                method,
                                path,
                                headers,
                                body: body_bytes,
                            });

                            // a closed gate lets everything through
                            let _ = gate.acquire().await;

                            let status = {
                                let mut script = script.lock().unwrap();
                                if script.len() > 1 {
                                    script.pop_front().unwrap_or(200)
                                } else {
                                    script.front().copied().unwrap_or(200)
                                }
                            };

                            Ok::<_, hyper::http::Error>(
                                Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from_static(b"{}")))
                                    .unwrap(),
                            )
                        }
                    });

                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        MockServer {
            addr,
            received_requests,
            gate,
        }
    }

    /// Lets held answers, and every later one, go out
    pub fn release(&self) {
        self.gate.close();
    }

    /// Get the base URL of the mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get all received requests
    #[allow(dead_code)]
    pub fn get_requests(&self) -> Vec<ReceivedRequest> {
        self.received_requests.lock().unwrap().clone()
    }

    /// Get requests matching a path
    #[allow(dead_code)]
    pub fn get_requests_for_path(&self, path: &str) -> Vec<ReceivedRequest> {
        self.received_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.path == path)
            .cloned()
            .collect()
    }

    #[allow(dead_code)]
    pub fn request_count(&self) -> usize {
        self.received_requests.lock().unwrap().len()
    }
}
