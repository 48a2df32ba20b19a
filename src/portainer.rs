use std::io::Write as _;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cmd;
use crate::error::{DeployError, DeployResult};
use crate::ssh;

pub const PORTAINER_IMAGE: &str = "portainer/portainer-ce:latest";
pub const PORTAINER_CONTAINER: &str = "portainer";
pub const PROXY_NETWORK: &str = "caddy";

const TOKEN_KEYS: [&str; 6] = [
    "Webhook",
    "webhook",
    "token",
    "Token",
    "webhookToken",
    "WebhookToken",
];
const ERROR_DETAIL_LEN: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn json(&self) -> DeployResult<Value> {
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Single-line, truncated body for error messages.
    #[must_use]
    pub fn detail(&self) -> String {
        self.body
            .trim()
            .replace('\n', " ")
            .chars()
            .take(ERROR_DETAIL_LEN)
            .collect()
    }
}

/// Split curl output produced with `-w "\n%{http_code}"`.
pub fn parse_curl_output(out: &str) -> DeployResult<HttpResponse> {
    let (body, code) = out.rsplit_once('\n').unwrap_or(("", out));
    let status = code
        .trim()
        .parse()
        .map_err(|_| DeployError::Portainer(format!("could not read HTTP status from curl output: {code}")))?;
    Ok(HttpResponse {
        status,
        body: body.to_string(),
    })
}

fn curl_base(method: &str, insecure: bool) -> Vec<String> {
    let mut args: Vec<String> = ["-sS", "-X", method, "-o", "-", "-w", "\n%{http_code}", "--max-time", "30"]
        .into_iter()
        .map(String::from)
        .collect();
    if insecure {
        args.push("-k".into());
    }
    args
}

/// `user@host` or `host` to the bare hostname.
#[must_use]
pub fn ssh_hostname(host: &str) -> &str {
    host.split_once('@').map_or(host, |(_, h)| h).trim()
}

/// First non-blank webhook token anywhere in a response payload.
/// Known keys of an object are checked before its nested values.
#[must_use]
pub fn extract_webhook_token(payload: &Value) -> Option<String> {
    match payload {
        Value::Object(map) => TOKEN_KEYS
            .iter()
            .filter_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .find(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| map.values().find_map(extract_webhook_token)),
        Value::Array(items) => items.iter().find_map(extract_webhook_token),
        _ => None,
    }
}

/// First non-blank of the given spellings, accepting numbers.
fn field(value: &Value, keys: [&str; 2]) -> String {
    keys.iter()
        .map(|k| match value.get(*k) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        })
        .find(|v| !v.is_empty())
        .unwrap_or_default()
}

/// Prefer the local Docker endpoint (named `local` or on a
/// `unix://` socket), else the first one listed.
#[must_use]
pub fn select_endpoint(endpoints: &[Value]) -> Option<String> {
    let local = endpoints.iter().filter(|e| e.is_object()).find_map(|e| {
        let name = field(e, ["Name", "name"]).to_lowercase();
        let url = field(e, ["URL", "url"]).to_lowercase();
        let id = field(e, ["Id", "id"]);
        (name == "local" || url.starts_with("unix://"))
            .then_some(id)
            .filter(|id| !id.is_empty())
    });
    local
        .or_else(|| endpoints.first().map(|e| field(e, ["Id", "id"])))
        .filter(|id| !id.is_empty())
}

/// `(stack id, endpoint id)` of every stack named `name` on
/// `endpoint`.
#[must_use]
pub fn matching_stacks(stacks: &[Value], name: &str, endpoint: &str) -> Vec<(String, String)> {
    stacks
        .iter()
        .filter(|s| s.is_object() && field(s, ["Name", "name"]) == name)
        .filter(|s| field(s, ["EndpointId", "endpointId"]) == endpoint)
        .map(|s| (field(s, ["Id", "id"]), field(s, ["EndpointId", "endpointId"])))
        .filter(|(id, _)| !id.is_empty())
        .collect()
}

/// Webhook URLs for a token, newest API layout first.
#[must_use]
pub fn webhook_urls(host: &str, https_port: u16, token: &str) -> Vec<String> {
    let hostname = ssh_hostname(host);
    let token = token.trim();
    vec![
        format!("https://{hostname}:{https_port}/api/stacks/webhooks/{token}"),
        format!("https://{hostname}:{https_port}/api/webhooks/{token}"),
    ]
}

/// POST to each URL in turn. Success stops, a 404 moves on to the
/// next URL, anything else fails immediately.
pub fn trigger_webhook(urls: &[String], insecure: bool, has_api_auth: bool) -> DeployResult<()> {
    let mut saw_404 = false;
    let mut last_error = String::new();
    for url in urls {
        let mut args = curl_base("POST", insecure);
        args.push(url.clone());
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let response = match cmd::run("curl", &refs).and_then(|out| parse_curl_output(&out)) {
            Ok(r) => r,
            Err(e) => {
                warn!("webhook request to {url} failed: {e}");
                last_error = e.to_string();
                continue;
            }
        };
        if response.is_success() {
            info!("triggered Portainer webhook");
            return Ok(());
        }
        if response.status == 404 {
            debug!("webhook 404 at {url}");
            saw_404 = true;
            last_error = format!("HTTP 404 from {url}");
            continue;
        }
        return Err(DeployError::Portainer(format!(
            "webhook trigger failed ({}) at {url}: {}",
            response.status,
            response.detail()
        )));
    }

    let message = if saw_404 && !has_api_auth {
        "webhook returned 404 for all known endpoints and no Portainer API auth is configured. \
         Set PORTAINER_ACCESS_TOKEN in .env.deploy.secrets so the stack webhook can be resolved"
            .to_string()
    } else if saw_404 {
        "webhook returned 404 for all known endpoints even after API-assisted resolution. \
         Verify PORTAINER_STACK_NAME/PORTAINER_ENDPOINT_ID and that the stack exists"
            .to_string()
    } else if last_error.is_empty() {
        "webhook trigger failed".to_string()
    } else {
        last_error
    };
    Err(DeployError::Portainer(message))
}

/// Authenticated Portainer API client.
pub struct PortainerClient {
    base_url: String,
    access_token: String,
    insecure: bool,
}

impl PortainerClient {
    #[must_use]
    pub fn new(host: &str, https_port: u16, access_token: &str) -> Self {
        Self {
            base_url: format!("https://{}:{https_port}", ssh_hostname(host)),
            access_token: access_token.trim().to_string(),
            insecure: false,
        }
    }

    #[must_use]
    pub const fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: &str, path: &str, body: Option<&Value>) -> DeployResult<HttpResponse> {
        let mut args = curl_base(method, self.insecure);
        args.extend(["-H".to_string(), "@-".to_string()]);

        let body_file = match body {
            Some(payload) => {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(serde_json::to_string(payload)?.as_bytes())?;
                file.flush()?;
                args.extend([
                    "-H".to_string(),
                    "Content-Type: application/json".to_string(),
                    "--data-binary".to_string(),
                    format!("@{}", file.path().display()),
                ]);
                Some(file)
            }
            None => None,
        };
        args.push(format!("{}{path}", self.base_url));

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let headers = format!("X-API-Key: {}\n", self.access_token);
        let out = cmd::run_with_stdin("curl", &refs, headers.as_bytes())?;
        drop(body_file);
        parse_curl_output(&out)
    }

    fn get_list(&self, path: &str) -> DeployResult<Vec<Value>> {
        let response = self.request("GET", path, None)?;
        if !response.is_success() {
            return Err(DeployError::Portainer(format!(
                "GET {path} failed ({}): {}",
                response.status,
                response.detail()
            )));
        }
        match response.json()? {
            Value::Array(items) => Ok(items),
            _ => Err(DeployError::Portainer(format!("unexpected {path} response format"))),
        }
    }

    pub fn stacks(&self) -> DeployResult<Vec<Value>> {
        self.get_list("/api/stacks")
    }

    pub fn endpoints(&self) -> DeployResult<Vec<Value>> {
        self.get_list("/api/endpoints")
    }

    /// Delete a stack. Already gone is fine.
    pub fn delete_stack(&self, stack_id: &str, endpoint_id: &str) -> DeployResult<()> {
        let response = self.request(
            "DELETE",
            &format!("/api/stacks/{stack_id}?endpointId={endpoint_id}"),
            None,
        )?;
        if response.is_success() || response.status == 404 {
            Ok(())
        } else {
            Err(DeployError::Portainer(format!(
                "failed to remove stack {stack_id}: {} {}",
                response.status,
                response.detail()
            )))
        }
    }

    pub fn create_stack(&self, name: &str, content: &str, endpoint_id: &str) -> DeployResult<Value> {
        let payload = json!({
            "Name": name,
            "StackFileContent": content,
            "Env": [],
            "FromAppTemplate": false,
        });
        let response = self.request(
            "POST",
            &format!("/api/stacks/create/standalone/string?endpointId={endpoint_id}"),
            Some(&payload),
        )?;
        if !response.is_success() {
            return Err(DeployError::Portainer(format!(
                "failed to create stack '{name}': {} {}",
                response.status,
                response.detail()
            )));
        }
        response.json()
    }

    /// Ask Portainer for a webhook on an existing stack.
    pub fn create_webhook(&self, stack_id: &str, endpoint_id: &str) -> DeployResult<Option<String>> {
        let response = self.request(
            "POST",
            &format!("/api/stacks/{stack_id}/webhooks?endpointId={endpoint_id}"),
            None,
        )?;
        if !response.is_success() {
            debug!("webhook creation returned {}", response.status);
            return Ok(None);
        }
        Ok(extract_webhook_token(&response.json()?))
    }

    /// Replace the stack `name` with `content` and return its
    /// webhook token when Portainer hands one out.
    ///
    /// `remove_container` is called for every `container_name` in
    /// the stack so leftovers from earlier deploys cannot clash.
    pub fn recreate_stack(
        &self,
        name: &str,
        endpoint_id: Option<&str>,
        content: &str,
        mut remove_container: impl FnMut(&str) -> DeployResult<()>,
    ) -> DeployResult<Option<String>> {
        let stacks = self.stacks()?;
        let endpoints = self.endpoints()?;
        if endpoints.is_empty() {
            return Err(DeployError::Portainer("no Portainer endpoints found".into()));
        }
        let endpoint = match endpoint_id.map(str::trim).filter(|e| !e.is_empty()) {
            Some(id) => id.to_string(),
            None => select_endpoint(&endpoints).ok_or_else(|| {
                DeployError::Portainer(
                    "unable to determine Portainer endpoint id; set PORTAINER_ENDPOINT_ID".into(),
                )
            })?,
        };
        info!("using Portainer endpoint {endpoint}");

        for (stack_id, stack_endpoint) in matching_stacks(&stacks, name, &endpoint) {
            info!("removing existing stack {name} ({stack_id})");
            self.delete_stack(&stack_id, &stack_endpoint)?;
        }

        for container in crate::compose::container_names(content)? {
            remove_container(&container)?;
        }

        info!("creating stack {name}");
        let created = self.create_stack(name, content, &endpoint)?;
        if let Some(token) = extract_webhook_token(&created) {
            return Ok(Some(token));
        }
        let stack_id = field(&created, ["Id", "id"]);
        if stack_id.is_empty() {
            return Ok(None);
        }
        self.create_webhook(&stack_id, &endpoint)
    }
}

/// Remote shell snippet that starts Portainer if needed and joins
/// it to the proxy network.
#[must_use]
pub fn ensure_running_command(https_port: u16) -> String {
    format!(
        "docker network inspect {PROXY_NETWORK} >/dev/null 2>&1 || docker network create {PROXY_NETWORK} >/dev/null; \
         if docker ps --format '{{{{.Names}}}}' | grep -Fxq {PORTAINER_CONTAINER}; then \
         echo 'Portainer already running'; \
         elif docker ps -a --format '{{{{.Names}}}}' | grep -Fxq {PORTAINER_CONTAINER}; then \
         echo 'Starting existing Portainer container'; \
         docker start {PORTAINER_CONTAINER} >/dev/null; \
         else \
         echo 'Creating Portainer container'; \
         docker volume create portainer_data >/dev/null && \
         docker run -d --name {PORTAINER_CONTAINER} --restart=unless-stopped -p 8000:8000 -p {https_port}:9443 \
         -v /var/run/docker.sock:/var/run/docker.sock -v portainer_data:/data \
         {PORTAINER_IMAGE} >/dev/null; \
         fi; \
         docker network connect {PROXY_NETWORK} {PORTAINER_CONTAINER} >/dev/null 2>&1 || true"
    )
}

/// Remote login and pull. The token is expected on stdin.
#[must_use]
pub fn ghcr_login_pull_command(image: &str, username: &str) -> String {
    format!(
        "docker login ghcr.io -u {} --password-stdin >/dev/null && docker pull {}",
        ssh::quote(username),
        ssh::quote(image)
    )
}

/// Remove a container by name, ignoring absence.
#[must_use]
pub fn remove_container_command(name: &str) -> String {
    format!("docker rm -f {} >/dev/null 2>&1 || true", ssh::quote(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curl_output_split() {
        let r = parse_curl_output("{\"Id\": 3}\n201").unwrap();
        assert_eq!(r.status, 201);
        assert!(r.is_success());
        assert_eq!(r.json().unwrap()["Id"], 3);

        let r = parse_curl_output("404").unwrap();
        assert_eq!(r.status, 404);
        assert!(r.body.is_empty());
        assert!(parse_curl_output("garbage").is_err());
    }

    #[test]
    fn token_found_nested() {
        let payload = json!({"Id": 1, "AutoUpdate": {"Webhook": " abc "}});
        assert_eq!(extract_webhook_token(&payload).as_deref(), Some("abc"));
        let payload = json!([{"x": 1}, {"webhookToken": "t2"}]);
        assert_eq!(extract_webhook_token(&payload).as_deref(), Some("t2"));
        assert_eq!(extract_webhook_token(&json!({"Webhook": "  "})), None);
    }

    #[test]
    fn endpoint_prefers_local() {
        let endpoints = vec![
            json!({"Id": 7, "Name": "remote", "URL": "tcp://10.0.0.2:2375"}),
            json!({"Id": 2, "Name": "primary", "URL": "unix:///var/run/docker.sock"}),
        ];
        assert_eq!(select_endpoint(&endpoints).as_deref(), Some("2"));
        assert_eq!(select_endpoint(&endpoints[..1]).as_deref(), Some("7"));
        assert_eq!(select_endpoint(&[]), None);
    }

    #[test]
    fn stacks_match_name_and_endpoint() {
        let stacks = vec![
            json!({"Id": 1, "Name": "app", "EndpointId": 2}),
            json!({"Id": 2, "Name": "app", "EndpointId": 3}),
            json!({"id": 4, "name": "app", "endpointId": 2}),
            json!({"Id": 5, "Name": "other", "EndpointId": 2}),
        ];
        assert_eq!(
            matching_stacks(&stacks, "app", "2"),
            vec![("1".to_string(), "2".to_string()), ("4".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn urls_use_hostname() {
        assert_eq!(
            webhook_urls("deploy@box.lan", 9943, "tok"),
            vec![
                "https://box.lan:9943/api/stacks/webhooks/tok",
                "https://box.lan:9943/api/webhooks/tok",
            ]
        );
    }

    #[test]
    fn ensure_running_maps_https_port() {
        let cmd = ensure_running_command(9943);
        assert!(cmd.contains("-p 9943:9443"));
        assert!(cmd.contains("--format '{{.Names}}' | grep -Fxq portainer"));
        assert!(cmd.contains(PORTAINER_IMAGE));
    }

    #[test]
    fn login_command_reads_token_from_stdin() {
        let cmd = ghcr_login_pull_command("ghcr.io/acme/app:1", "acme");
        assert_eq!(
            cmd,
            "docker login ghcr.io -u acme --password-stdin >/dev/null && docker pull ghcr.io/acme/app:1"
        );
    }
}
