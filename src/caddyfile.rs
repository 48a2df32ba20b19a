use caddyfile_rs::{Caddyfile, Directive, Matcher, SiteBlock, format};

/// Where the proxy container writes its generated config.
pub const CADDYFILE_PATH: &str = "/config/caddy/Caddyfile";

const HSTS: &str =
    "header Strict-Transport-Security \"max-age=31536000; includeSubDomains; preload\"";

/// Render the proxy Caddyfile for `domain`, forwarding to the app
/// on loopback. Credentials and the ACME contact stay as Caddy
/// placeholders so they are read from the container environment
/// at start and never land in the manifest text.
///
/// Every route sits behind one `basic_auth /*` layer. Caddy answers
/// ACME HTTP challenges before site handlers run, so issuance does
/// not need a matcher excluding them.
#[must_use]
pub fn render_proxy(domain: &str, app_port: u16) -> String {
    let auth = Directive::new("basic_auth")
        .matcher(Matcher::Path("/*".to_string()))
        .block(vec![Directive::new("{$BASIC_AUTH_USER}").arg("{$BASIC_AUTH_HASH}")]);
    // Websocket upgrades for the editor.
    let proxy = Directive::new("reverse_proxy")
        .arg(&format!("http://127.0.0.1:{app_port}"))
        .block(vec![
            Directive::new("header_up")
                .arg("Upgrade")
                .arg("{http.request.header.Upgrade}"),
            Directive::new("header_up")
                .arg("Connection")
                .arg("{http.request.header.Connection}"),
        ]);
    let site = SiteBlock::new(domain)
        .log()
        .directive(Directive::new("encode zstd gzip"))
        .directive(Directive::new(HSTS))
        .directive(auth)
        .directive(proxy);

    let body = format(&Caddyfile::new().site(site));
    format!("{{\n\temail {{$ACME_EMAIL}}\n}}\n\n{body}")
}

/// Shell script run by the proxy container: write the Caddyfile
/// through a quoted heredoc, then exec Caddy on it.
///
/// Tabs are expanded so the script can be emitted as a YAML
/// literal block.
#[must_use]
pub fn proxy_bootstrap_script(domain: &str, app_port: u16) -> String {
    let caddyfile = render_proxy(domain, app_port).replace('\t', "  ");
    let mut lines = vec![
        "set -eu".to_string(),
        "mkdir -p /config/caddy".to_string(),
        format!("cat > {CADDYFILE_PATH} <<'CADDY'"),
    ];
    lines.extend(caddyfile.lines().map(|l| l.trim_end().to_string()));
    lines.push("CADDY".to_string());
    lines.push(String::new());
    lines.push(format!(
        "exec caddy run --config {CADDYFILE_PATH} --adapter caddyfile"
    ));
    lines.join("\n")
}
