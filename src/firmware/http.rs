//! Minimal HTTP surface for local UIs, written directly against TCP
//! sockets. Deliberately framework-free, matching the controller's embedded
//! origins: fixed-size buffers, one task per connection, five routes.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::contracts::envelope::now_unix;
use crate::contracts::movement::validate_channel;
use crate::error::{Result, TarsError};
use crate::firmware::bridge::FirmwareBridge;
use crate::firmware::{FirmwareError, ServoController};

/// Request head + body ceiling; anything larger is refused.
const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Calibration/control page served at `/`.
const INDEX_HTML: &str = "<!doctype html>\n<html><head><title>TARS servo controller</title></head>\n<body>\n<h1>TARS servo controller</h1>\n<p>POST /control with {\"type\": \"single\"|\"multiple\"|\"preset\"|\"speed\"}.</p>\n<p>POST /emergency floats all servos; POST /resume re-seats them at neutral.</p>\n<p>GET /status for positions, memory, and uptime.</p>\n</body></html>\n";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PulseTarget {
    channel: u8,
    pulse: u16,
}

/// Body of `POST /control`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
enum ControlRequest {
    Single {
        channel: u8,
        pulse: u16,
        #[serde(default)]
        speed: Option<f32>,
    },
    Multiple {
        targets: Vec<PulseTarget>,
        #[serde(default)]
        speed: Option<f32>,
    },
    Preset {
        name: String,
    },
    Speed {
        value: f32,
    },
}

enum Reply {
    Json(u16, Value),
    Html(&'static str),
}

/// The firmware's local HTTP server.
pub struct HttpSurface {
    controller: Arc<ServoController>,
    bridge: Option<Arc<FirmwareBridge>>,
}

impl HttpSurface {
    pub fn new(controller: Arc<ServoController>) -> Arc<Self> {
        Arc::new(Self {
            controller,
            bridge: None,
        })
    }

    /// Route emergency stops through the bridge so the bus sees the state
    /// transition too.
    pub fn with_bridge(controller: Arc<ServoController>, bridge: Arc<FirmwareBridge>) -> Arc<Self> {
        Arc::new(Self {
            controller,
            bridge: Some(bridge),
        })
    }

    /// Bind and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Fails when the port cannot be bound.
    pub async fn serve(self: Arc<Self>, port: u16, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(TarsError::Io)?;
        info!(port, "http surface listening");
        loop {
            let (stream, peer) = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            debug!(%peer, "connection");
            let surface = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = surface.handle_connection(stream).await {
                    debug!(error = %e, "connection error");
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut buf = vec![0u8; MAX_REQUEST_BYTES];
        let mut filled = 0usize;

        // Read until the end of headers, bounded by the fixed buffer.
        let head_end = loop {
            if filled == buf.len() {
                return write_reply(
                    &mut stream,
                    &error_reply(400, "request too large", "overflow"),
                )
                .await;
            }
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Ok(());
            }
            filled += n;
            if let Some(pos) = find_header_end(&buf[..filled]) {
                break pos;
            }
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_owned();
        let path = parts.next().unwrap_or_default().to_owned();

        let content_length = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .next()
            .unwrap_or(0);

        if head_end + 4 + content_length > buf.len() {
            return write_reply(
                &mut stream,
                &error_reply(400, "request body too large", "overflow"),
            )
            .await;
        }
        while filled < head_end + 4 + content_length {
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let body = &buf[head_end + 4..(head_end + 4 + content_length).min(filled)];

        let reply = self.route(&method, &path, body).await;
        write_reply(&mut stream, &reply).await
    }

    async fn route(&self, method: &str, path: &str, body: &[u8]) -> Reply {
        match (method, path) {
            ("GET", "/") => Reply::Html(INDEX_HTML),
            ("GET", "/status") => self.status_reply(),
            ("POST", "/control") => self.control(body).await,
            ("POST", "/emergency") => {
                match &self.bridge {
                    Some(bridge) => bridge.emergency_stop().await,
                    None => self.controller.emergency_stop_all().await,
                }
                ok_reply(json!({"stopped": true}))
            }
            ("POST", "/resume") => match self.controller.resume().await {
                Ok(()) => ok_reply(json!({"resumed": true})),
                Err(e) => firmware_error_reply(&e),
            },
            _ => error_reply(404, "no such route", "not_found"),
        }
    }

    fn status_reply(&self) -> Reply {
        let status = self.controller.status();
        // The PWM driver counts as healthy while any channel is still
        // writable; all-disabled means the device itself is gone.
        let pca9685_ok = status.disabled_channels.len() < status.positions.len();
        ok_reply(json!({
            "status": {
                "positions": status.positions,
                "moving": status.moving,
                "emergency": status.emergency,
                "disabled_channels": status.disabled_channels,
                "pca9685": pca9685_ok,
                "memory_pressure": self.controller.is_memory_pressure(),
                "default_speed": self.controller.default_speed(),
                "uptime_s": self.controller.uptime().as_secs_f64(),
            }
        }))
    }

    async fn control(&self, body: &[u8]) -> Reply {
        let request: ControlRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return error_reply(400, "invalid control body", &e.to_string()),
        };
        let result = match request {
            ControlRequest::Single {
                channel,
                pulse,
                speed,
            } => {
                let speed = speed.unwrap_or_else(|| self.controller.default_speed());
                self.controller
                    .move_servo_smooth(channel, pulse, speed)
                    .await
            }
            ControlRequest::Multiple { targets, speed } => {
                let speed = speed.unwrap_or_else(|| self.controller.default_speed());
                let pairs: Vec<(u8, u16)> =
                    targets.iter().map(|t| (t.channel, t.pulse)).collect();
                match pairs.iter().try_for_each(|(ch, _)| validate_channel(*ch)) {
                    Ok(()) => self.controller.move_multiple(&pairs, speed).await,
                    Err(e) => Err(FirmwareError::Contract(e)),
                }
            }
            ControlRequest::Preset { name } => self.controller.execute_preset(&name).await,
            ControlRequest::Speed { value } => self.controller.set_default_speed(value),
        };
        match result {
            Ok(()) => ok_reply(json!({"applied": true})),
            Err(e) => firmware_error_reply(&e),
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn ok_reply(mut extra: Value) -> Reply {
    if let Some(map) = extra.as_object_mut() {
        map.insert("success".to_owned(), Value::Bool(true));
        map.insert("server_timestamp".to_owned(), json!(now_unix()));
    }
    Reply::Json(200, extra)
}

fn error_reply(status: u16, message: &str, error: &str) -> Reply {
    Reply::Json(
        status,
        json!({
            "success": false,
            "message": message,
            "error": error,
            "server_timestamp": now_unix(),
        }),
    )
}

fn firmware_error_reply(e: &FirmwareError) -> Reply {
    error!(error = %e, "control request failed");
    error_reply(e.http_status(), "control request failed", &e.to_string())
}

async fn write_reply(stream: &mut TcpStream, reply: &Reply) -> std::io::Result<()> {
    let (status, content_type, body) = match reply {
        Reply::Json(status, value) => (*status, "application/json", value.to_string()),
        Reply::Html(html) => (200, "text/html; charset=utf-8", (*html).to_owned()),
    };
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        503 => "Service Unavailable",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::pwm::{PwmBackend, RecordingPwm};
    use crate::movement::ServoCalibration;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    async fn start_surface() -> (u16, Arc<ServoController>, CancellationToken) {
        let pwm = Arc::new(RecordingPwm::new());
        let controller =
            ServoController::new(pwm as Arc<dyn PwmBackend>, ServoCalibration::default());
        let surface = HttpSurface::new(Arc::clone(&controller));
        // Bind on an ephemeral port by probing: bind ourselves, free, reuse.
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = surface.serve(port, cancel).await;
            });
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        (port, controller, cancel)
    }

    async fn request(port: u16, raw: &str) -> (u16, String) {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let status: u16 = response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let body = response
            .split("\r\n\r\n")
            .nth(1)
            .unwrap_or_default()
            .to_owned();
        (status, body)
    }

    fn post(path: &str, body: &str) -> String {
        format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn status_route_reports_positions() {
        let (port, _controller, cancel) = start_surface().await;
        let (status, body) = request(port, "GET /status HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(status, 200);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["status"]["positions"].as_array().unwrap().len(), 9);
        cancel.cancel();
    }

    #[tokio::test]
    async fn control_single_moves_and_validates() {
        let (port, controller, cancel) = start_surface().await;
        let (status, _) = request(
            port,
            &post("/control", r#"{"type":"single","channel":0,"pulse":300,"speed":1.0}"#),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(controller.status().positions[0], 300);

        // Out-of-range pulse: rejected, shaped error body.
        let (status, body) = request(
            port,
            &post("/control", r#"{"type":"single","channel":0,"pulse":599}"#),
        )
        .await;
        assert_eq!(status, 400);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["server_timestamp"].is_number());
        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_route_is_404_and_unknown_preset_too() {
        let (port, _controller, cancel) = start_surface().await;
        let (status, _) = request(port, "GET /nope HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(status, 404);
        let (status, _) = request(
            port,
            &post("/control", r#"{"type":"preset","name":"moonwalk"}"#),
        )
        .await;
        assert_eq!(status, 404);
        cancel.cancel();
    }

    #[tokio::test]
    async fn emergency_route_floats_everything() {
        let (port, controller, cancel) = start_surface().await;
        controller.move_servo_smooth(1, 300, 1.0).await.unwrap();
        let (status, _) = request(port, &post("/emergency", "")).await;
        assert_eq!(status, 200);
        let s = controller.status();
        assert!(s.emergency);
        assert!(s.positions.iter().all(|p| *p == 0));
        cancel.cancel();
    }

    #[tokio::test]
    async fn speed_route_updates_default() {
        let (port, controller, cancel) = start_surface().await;
        let (status, _) = request(port, &post("/control", r#"{"type":"speed","value":0.8}"#)).await;
        assert_eq!(status, 200);
        assert!((controller.default_speed() - 0.8).abs() < 1e-6);
        // Out-of-range speed rejected.
        let (status, _) = request(port, &post("/control", r#"{"type":"speed","value":1.5}"#)).await;
        assert_eq!(status, 400);
        cancel.cancel();
    }
}
