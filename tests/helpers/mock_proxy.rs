use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// A minimal HTTP proxy that answers `CONNECT` and records request heads.
pub struct MockProxy {
    port: u16,
    requests: Arc<Mutex<Vec<Vec<String>>>>,
    handle: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl MockProxy {
    /// Start a proxy on a random loopback port.
    ///
    /// With `required_auth` set, a `CONNECT` without that exact
    /// `Proxy-Authorization` value gets a 407 on the same connection.
    pub async fn start(required_auth: Option<String>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            Arc::clone(&recorded),
                            required_auth.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            port,
            requests,
            handle,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Request heads received so far, one `Vec` of lines per request.
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockProxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    requests: Arc<Mutex<Vec<Vec<String>>>>,
    required_auth: Option<String>,
) {
    let mut stream = BufReader::new(stream);
    loop {
        let mut head = Vec::new();
        loop {
            let mut line = String::new();
            match stream.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let line = line.trim_end().to_string();
            if line.is_empty() {
                break;
            }
            head.push(line);
        }
        requests.lock().unwrap().push(head.clone());

        let authorized = match &required_auth {
            None => true,
            Some(expected) => head
                .iter()
                .any(|l| l == &format!("Proxy-Authorization: {}", expected)),
        };
        if !authorized {
            let _ = stream
                .get_mut()
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"mock\"\r\n\
                      Content-Length: 0\r\n\r\n",
                )
                .await;
            continue;
        }

        let _ = stream
            .get_mut()
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await;
        // Tunnel open: hold the socket until the client goes away.
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
        return;
    }
}
