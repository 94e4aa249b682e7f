use crate::portal::PortalEndpoints;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn form(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn has_cookie(&self, pair: &str) -> bool {
        self.header("cookie")
            .map(|cookies| cookies.split(';').any(|c| c.trim() == pair))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl FakeResponse {
    pub fn ok(body: &str) -> Self {
        Self::status(200, body).with_header("Content-Type", "text/html")
    }

    pub fn json(value: Value) -> Self {
        Self::status(200, &value.to_string()).with_header("Content-Type", "application/json")
    }

    pub fn redirect(location: &str) -> Self {
        Self::status(302, "").with_header("Location", location)
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

type Handler = dyn Fn(&RecordedRequest, &str) -> FakeResponse + Send + Sync;

pub(crate) struct FakeServer {
    base: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest, &str) -> FakeResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake portal");
        let addr = listener.local_addr().expect("fake portal address");
        let base = format!("http://{addr}");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let task = {
            let base = base.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let base = base.clone();
                    let requests = requests.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        serve(stream, &base, &requests, handler.as_ref()).await;
                    });
                }
            })
        };

        Self {
            base,
            requests,
            task,
        }
    }

    pub fn endpoints(&self) -> PortalEndpoints {
        PortalEndpoints {
            login_base: format!("{}/identity", self.base),
            account_base: self.base.clone(),
            redirect_uri: format!("{}/login-redirect", self.base),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    base: &str,
    requests: &Mutex<Vec<RecordedRequest>>,
    handler: &Handler,
) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    let response = handler(&request, base);
    requests.lock().expect("requests lock").push(request);

    let mut raw = format!("HTTP/1.1 {} Fake\r\n", response.status);
    for (name, value) in &response.headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.body.len(),
        response.body
    ));
    let _ = stream.write_all(raw.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();
    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(header_end + content_length);
    let body = String::from_utf8_lossy(&buf[header_end..body_end]).to_string();

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target, String::new()),
    };
    Some(RecordedRequest {
        method,
        path,
        query,
        headers,
        body,
    })
}

pub(crate) fn usage_day_json() -> Value {
    json!({
        "IsError": false,
        "IsDataAvailable": true,
        "IsConsumptionAvailable": true,
        "TargetUsage": 0.0,
        "AverageUsage": 0.0,
        "ActualUsage": 15.0,
        "MyUsage": "NA",
        "AverageUsagePerPerson": 0.0,
        "IsMO365Customer": false,
        "IsMOPartialCustomer": false,
        "IsMOCompleteCustomer": false,
        "IsExtraMonthConsumptionMessage": false,
        "Lines": [
            {"Label": "01:00", "Usage": 10.0, "Read": 1010.0, "IsEstimated": false, "MeterSerialNumberHis": "SN1"},
            {"Label": "02:00", "Usage": 5.0, "Read": 1015.0, "IsEstimated": false, "MeterSerialNumberHis": "SN1"}
        ],
        "AlertsValues": {}
    })
}

/// Answers every request of a successful login and usage query.
pub(crate) fn happy_portal(req: &RecordedRequest, base: &str) -> FakeResponse {
    let path = req.path.as_str();
    if path.ends_with("/oauth2/v2.0/authorize") {
        return FakeResponse::ok("<html>sign in</html>")
            .with_header("Set-Cookie", "x-ms-cpim-trans=TRANS123; Path=/")
            .with_header("Set-Cookie", "x-ms-cpim-csrf=CSRF456; Path=/");
    }
    if path.ends_with("/SelfAsserted") {
        return FakeResponse::json(json!({ "status": "200" }));
    }
    if path.ends_with("/api/CombinedSigninAndSignup/confirmed") {
        return FakeResponse::redirect(&format!(
            "{base}/login-redirect#code=AUTHCODE&client_info=eyJ1"
        ));
    }
    if path.ends_with("/oauth2/v2.0/token") {
        return match req.form("grant_type").as_deref() {
            Some("authorization_code") => FakeResponse::json(json!({
                "access_token": "access-1",
                "id_token": "id-1",
                "refresh_token": "refresh-1",
                "token_type": "Bearer",
                "expires_in": 3600
            })),
            Some("refresh_token") => FakeResponse::json(json!({
                "access_token": "access-2",
                "refresh_token": "refresh-2",
                "token_type": "Bearer"
            })),
            _ => FakeResponse::status(400, "unsupported grant"),
        };
    }
    match (req.method.as_str(), path) {
        ("GET", "/login-redirect") => FakeResponse::ok("<html>redirected</html>"),
        ("GET", "/mydashboard") | ("GET", "/mydashboard/my-meters-usage") => {
            FakeResponse::ok("<html>dashboard</html>")
        }
        ("GET", "/twservice/Account/SignIn") => FakeResponse::redirect(&format!(
            "{base}/signin-oidc?client_id=abc&state=StateProperties%3dXYZ%3d&nonce=n1"
        )),
        ("GET", "/signin-oidc") => FakeResponse::ok(
            "<form method='post'><input type='hidden' id='id_token' value='ID.TOKEN.VALUE'/></form>",
        ),
        ("POST", "/login") => FakeResponse::ok("<html>welcome</html>"),
        ("GET", "/ajax/waterMeter/getSmartWaterMeterConsumptions") => {
            if req.has_cookie("b2cAuthenticated=true") {
                FakeResponse::json(usage_day_json())
            } else {
                FakeResponse::status(401, "not signed in")
            }
        }
        _ => FakeResponse::status(404, "not found"),
    }
}
