// Shared fixtures for integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use keyrelay::http_client::{HttpClientError, UpstreamConnector, UpstreamIo};
use keyrelay::rotation::{derive_key_id, KeyEntry, KeyStatus, RotationState};

pub const ALPHA: &str = "sk-ant-oat01-alpha-token";
pub const BRAVO: &str = "sk-ant-oat01-bravo-token";
pub const CHARLIE: &str = "sk-ant-oat01-charlie-token";
pub const DEAD: &str = "sk-ant-oat01-dead-token";
pub const STRANGER: &str = "sk-ant-REDACTED";

/// Upstream that answers each new connection with the next canned response
#[derive(Default)]
pub struct ScriptedUpstream {
    responses: Mutex<VecDeque<Vec<u8>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedUpstream {
    pub fn new(responses: &[&[u8]]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_vec()).collect()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for ScriptedUpstream {
    async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn UpstreamIo>, HttpClientError> {
        let response = self.responses.lock().unwrap().pop_front().ok_or_else(|| {
            HttpClientError::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no scripted response left",
            ))
        })?;

        let (proxy_side, server_side) = tokio::io::duplex(64 * 1024);
        let requests = Arc::clone(&self.requests);

        tokio::spawn(async move {
            let mut server = BufReader::new(server_side);
            let mut request = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if server.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
                request.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut body = vec![0u8; content_length];
            server.read_exact(&mut body).await.unwrap();
            request.push_str(&String::from_utf8_lossy(&body));
            requests.lock().unwrap().push(request);

            let mut server = server.into_inner();
            server.write_all(&response).await.unwrap();
            server.shutdown().await.unwrap();
        });

        Ok(Box::new(proxy_side))
    }
}

pub fn state_with(keys: &[(&str, KeyStatus)], active: &str) -> RotationState {
    let mut state = RotationState::default();
    for (token, status) in keys {
        state.insert_key(KeyEntry::new(*token).with_status(*status));
    }
    state.active_key_id = Some(derive_key_id(active));
    state
}
