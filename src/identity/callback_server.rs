//! Loopback HTTP server for the interactive sign-in redirect.
//!
//! Accepts a single `GET /callback?...` request, shows the user a short
//! result page and hands the full callback URL back to the caller.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::AuthError;

/// Result from the callback server.
#[derive(Debug)]
pub enum CallbackResult {
    /// Received a callback; holds the full URL including query parameters.
    Success(String),
    /// The waiting side went away before a callback arrived.
    Cancelled,
    Error(String),
}

/// Bind the loopback listener. Port 0 picks a free port.
pub fn bind(port: u16) -> Result<TcpListener, AuthError> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).map_err(|e| {
        error!("Failed to bind callback server to {}: {}", addr, e);
        AuthError::CallbackServer(format!("Failed to start server on {}: {}", addr, e))
    })?;

    // Non-blocking so cancellation is noticed between connections
    listener
        .set_nonblocking(true)
        .map_err(|e| AuthError::CallbackServer(format!("Server configuration error: {}", e)))?;

    Ok(listener)
}

/// Wait for a single OAuth callback on `listener`.
///
/// Blocks until a callback arrives, the sender side of `cancel_rx` is used or
/// dropped, or accepting fails. There is no timeout.
pub fn wait_for_callback(listener: TcpListener, cancel_rx: mpsc::Receiver<()>) -> CallbackResult {
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => return CallbackResult::Error(format!("Server configuration error: {}", e)),
    };

    info!("OAuth callback server listening on 127.0.0.1:{}", port);

    loop {
        match cancel_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => {
                info!("Callback server cancelled");
                return CallbackResult::Cancelled;
            }
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match listener.accept() {
            Ok((stream, peer_addr)) => {
                debug!("Connection from {}", peer_addr);
                if let Some(url) = handle_connection(stream, port) {
                    info!("OAuth callback received");
                    return CallbackResult::Success(url);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                return CallbackResult::Error(format!("Connection error: {}", e));
            }
        }
    }
}

/// Returns the callback URL if this request was the OAuth redirect.
fn handle_connection(mut stream: TcpStream, port: u16) -> Option<String> {
    // Accepted sockets inherit non-blocking mode on some platforms
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

    let mut buffer = [0; 4096];
    let bytes_read = match stream.read(&mut buffer) {
        Ok(n) => n,
        Err(e) => {
            debug!("Failed to read request: {}", e);
            return None;
        }
    };

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let request_line = request.lines().next()?;
    debug!("Received request: {}", request_line);

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        send_response(&mut stream, "400 Bad Request", "text/plain", "Bad Request");
        return None;
    };

    if method != "GET" {
        send_response(&mut stream, "405 Method Not Allowed", "text/plain", "Method Not Allowed");
        return None;
    }

    if !path.starts_with("/callback") {
        send_response(&mut stream, "404 Not Found", "text/plain", "Not Found");
        return None;
    }

    let url = format!("http://localhost:{}{}", port, path);

    // Error callbacks still end the wait so the caller can report them
    if path.contains("error=") {
        send_response(&mut stream, "200 OK", "text/html; charset=utf-8", &result_page(false, &error_description(path)));
        return Some(url);
    }

    if !path.contains("code=") {
        send_response(&mut stream, "400 Bad Request", "text/plain", "Missing authorization code");
        return None;
    }

    send_response(
        &mut stream,
        "200 OK",
        "text/html; charset=utf-8",
        &result_page(true, "You are signed in. You can close this tab and return to the terminal."),
    );
    Some(url)
}

fn error_description(path: &str) -> String {
    match path.find("error_description=") {
        Some(start) => {
            let start = start + "error_description=".len();
            let end = path[start..].find('&').map(|i| start + i).unwrap_or(path.len());
            urlencoding::decode(&path[start..end].replace('+', " "))
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| "Authentication failed".to_string())
        }
        None => "Authentication was cancelled or failed.".to_string(),
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn result_page(success: bool, message: &str) -> String {
    let (title, color) = if success {
        ("Authentication Successful", "#10B981")
    } else {
        ("Authentication Failed", "#EF4444")
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{title}</title>
    <style>
        body {{ font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; display: flex; justify-content: center; padding-top: 15vh; background: #F3F4F6; }}
        .card {{ background: white; padding: 2.5rem; border-radius: 0.75rem; border-top: 6px solid {color}; max-width: 420px; text-align: center; }}
        h1 {{ color: #1F2937; font-size: 1.4rem; }}
        p {{ color: #6B7280; }}
    </style>
</head>
<body>
    <div class="card">
        <h1>{title}</h1>
        <p>{message}</p>
        <p>graphbroker</p>
    </div>
</body>
</html>"#,
        title = title,
        color = color,
        message = html_escape(message),
    )
}

fn send_response(stream: &mut TcpStream, status: &str, content_type: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );

    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}
