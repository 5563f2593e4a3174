use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::errors::RemoteError;
use crate::core::remote::{RemoteExecutor, RemoteFs, RemoteTarget, shell_quote};

const FORBIDDEN_DIRECTIVES: &[&str] = &["exec", "lua_code_cache off", "perl_modules", "perl_require"];

const DANGEROUS_PATHS: &[&str] = &[
    r"/etc/passwd",
    r"/etc/shadow",
    r"/root/",
    r"/home/[^/\s;]*/\.",
    r"/var/log/",
    r"/proc/",
];

const SECURITY_HEADERS: &[&str] = &["X-Content-Type-Options", "X-Frame-Options", "X-XSS-Protection"];

const MAX_BODY_MB: f64 = 100.0;

/// Outcome of a preview. An invalid config is a normal result, not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub raw_output: Option<String>,
}

/// Local policy checks that need no host.
pub struct ConfigLinter {
    forbidden: Vec<(&'static str, Regex)>,
    dangerous: Vec<(&'static str, Regex)>,
    server_open: Regex,
    listen: Regex,
    server_name: Regex,
    proxy_pass: Regex,
    host_header: Regex,
    body_size: Regex,
    read_timeout: Regex,
}

impl ConfigLinter {
    pub fn new() -> Result<Self> {
        let mut forbidden = Vec::new();
        for directive in FORBIDDEN_DIRECTIVES {
            let words: Vec<String> = directive.split_whitespace().map(regex::escape).collect();
            let pattern = format!(r"(?m)(?:^|[{{;])\s*{}\b", words.join(r"\s+"));
            forbidden.push((*directive, Regex::new(&pattern)?));
        }
        let mut dangerous = Vec::new();
        for path in DANGEROUS_PATHS {
            dangerous.push((*path, Regex::new(&format!("(?i){}", path))?));
        }

        Ok(Self {
            forbidden,
            dangerous,
            server_open: Regex::new(r"^\s*server\s*\{")?,
            listen: Regex::new(r"\blisten\s")?,
            server_name: Regex::new(r"\bserver_name\s")?,
            proxy_pass: Regex::new(r"\bproxy_pass\s")?,
            host_header: Regex::new(r"(?i)\bproxy_set_header\s+Host\s")?,
            body_size: Regex::new(r"(?i)\bclient_max_body_size\s+([^;\s]+)\s*;")?,
            read_timeout: Regex::new(r"\bproxy_read_timeout\s")?,
        })
    }

    /// Returns `(errors, warnings)` in the order they were found.
    pub fn lint(&self, content: &str) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let code = strip_comments(content);

        for (directive, re) in &self.forbidden {
            if re.is_match(&code) {
                errors.push(format!("Forbidden directive '{}' detected", directive));
            }
        }
        for (pattern, re) in &self.dangerous {
            if re.is_match(&code) {
                errors.push(format!("Dangerous path pattern detected: {}", pattern));
            }
        }
        if !braces_balanced(&code) {
            errors.push("Unbalanced braces detected in configuration".to_string());
        }

        for (index, block) in self.server_blocks(&code).iter().enumerate() {
            errors.extend(self.lint_server_block(block, index + 1));
        }

        if !self.body_size.is_match(&code) {
            warnings.push("Consider setting client_max_body_size to limit upload size".to_string());
        }
        if !self.read_timeout.is_match(&code) {
            warnings.push(
                "Consider setting proxy_read_timeout to avoid hanging connections".to_string(),
            );
        }
        for header in SECURITY_HEADERS {
            if !code.contains(header) {
                warnings.push(format!("Consider adding security header: {}", header));
            }
        }

        (errors, warnings)
    }

    fn server_blocks(&self, code: &str) -> Vec<String> {
        let mut blocks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut depth = 0i32;
        for line in code.lines() {
            if current.is_empty() {
                if !self.server_open.is_match(line) {
                    continue;
                }
                depth = 0;
            }
            current.push(line);
            depth += brace_delta(line);
            if depth <= 0 {
                blocks.push(current.join("\n"));
                current.clear();
            }
        }
        blocks
    }

    fn lint_server_block(&self, block: &str, n: usize) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.listen.is_match(block) {
            errors.push(format!("Server block {}: missing 'listen' directive", n));
        }
        if !self.server_name.is_match(block) {
            errors.push(format!("Server block {}: missing 'server_name' directive", n));
        }
        if self.proxy_pass.is_match(block) && !self.host_header.is_match(block) {
            errors.push(format!(
                "Server block {}: proxy_pass without 'proxy_set_header Host'",
                n
            ));
        }
        if let Some(caps) = self.body_size.captures(block) {
            let raw = &caps[1];
            match size_in_mb(raw) {
                Some(mb) if mb > MAX_BODY_MB => errors.push(format!(
                    "Server block {}: client_max_body_size too large ({})",
                    n, raw
                )),
                Some(_) => {}
                None => errors.push(format!(
                    "Server block {}: invalid client_max_body_size '{}'",
                    n, raw
                )),
            }
        }
        errors
    }
}

fn strip_comments(content: &str) -> String {
    content
        .lines()
        .map(|line| match line.find('#') {
            Some(idx) if !in_quotes(&line[..idx]) => &line[..idx],
            _ => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn in_quotes(prefix: &str) -> bool {
    prefix.chars().filter(|c| *c == '"').count() % 2 == 1
        || prefix.chars().filter(|c| *c == '\'').count() % 2 == 1
}

fn brace_delta(line: &str) -> i32 {
    line.matches('{').count() as i32 - line.matches('}').count() as i32
}

/// Brace balance ignoring quoted strings and escaped characters.
fn braces_balanced(code: &str) -> bool {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in code.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match (c, quote) {
            ('\\', _) => escaped = true,
            ('"' | '\'', None) => quote = Some(c),
            (q, Some(open)) if q == open => quote = None,
            (_, Some(_)) => {}
            ('{', None) => depth += 1,
            ('}', None) => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0 && quote.is_none()
}

/// Parses nginx size syntax (`512k`, `10m`, `1g`, bare bytes).
fn size_in_mb(raw: &str) -> Option<f64> {
    let lower = raw.to_ascii_lowercase();
    let (digits, factor) = match lower.chars().last()? {
        'k' => (&lower[..lower.len() - 1], 1.0 / 1024.0),
        'm' => (&lower[..lower.len() - 1], 1.0),
        'g' => (&lower[..lower.len() - 1], 1024.0),
        _ => (lower.as_str(), 1.0 / (1024.0 * 1024.0)),
    };
    digits.parse::<u64>().ok().map(|n| n as f64 * factor)
}

/// Splits `nginx -t` output into errors and warnings.
fn parse_nginx_test(output: &str) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for line in output.lines() {
        let message = line.trim().trim_start_matches("nginx: ").to_string();
        if line.contains("[emerg]") || line.contains("[error]") || line.contains("[crit]") {
            errors.push(message);
        } else if line.contains("[warn]") {
            warnings.push(message);
        }
    }
    (errors, warnings)
}

/// Runs the local lint plus `nginx -t` against a staged copy of the
/// candidate. The live configuration is never touched or reloaded.
pub struct Validator {
    exec: Arc<dyn RemoteExecutor>,
    linter: ConfigLinter,
    timeout: Duration,
}

impl Validator {
    pub fn new(exec: Arc<dyn RemoteExecutor>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            exec,
            linter: ConfigLinter::new()?,
            timeout,
        })
    }

    pub async fn preview(
        &self,
        target: &RemoteTarget,
        content: &str,
    ) -> Result<ValidationResult, RemoteError> {
        let (mut errors, mut warnings) = self.linter.lint(content);

        let staged = format!("/tmp/vpsorch_validate_{}.conf", uuid::Uuid::new_v4().simple());
        let harness = format!("events {{}}\nhttp {{\n{}\n}}\n", content);
        let fs = RemoteFs::new(self.exec.as_ref(), target, self.timeout);

        let checked = match fs.write(&staged, &harness).await {
            Ok(()) => {
                self.exec
                    .run(
                        target,
                        &format!("nginx -t -c {}", shell_quote(&staged)),
                        self.timeout,
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = fs.remove(&staged).await {
            warn!("Failed to remove staged candidate {} on {}: {}", staged, target.address, e);
        }

        let out = checked?;
        let raw = out.combined();
        let (remote_errors, remote_warnings) = parse_nginx_test(&raw);
        let remote_failed = !out.success();
        let no_remote_detail = remote_errors.is_empty();
        errors.extend(remote_errors);
        warnings.extend(remote_warnings);
        if remote_failed && no_remote_detail {
            errors.push(format!("nginx -t failed: {}", raw));
        }

        debug!(
            "Preview on {}: {} errors, {} warnings",
            target.address,
            errors.len(),
            warnings.len()
        );
        Ok(ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            raw_output: Some(raw),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_configs {
    pub const GOOD: &str = "server {
    listen 80;
    server_name app.example.com;
    client_max_body_size 20m;
    add_header X-Content-Type-Options nosniff;
    add_header X-Frame-Options DENY;
    add_header X-XSS-Protection \"1; mode=block\";
    location / {
        proxy_pass http://127.0.0.1:8069;
        proxy_set_header Host $host;
        proxy_read_timeout 60s;
    }
}
";

    pub const BROKEN: &str = "server {
    listen 80;
    server_name app.example.com;
    location / {
        proxy_pass http://127.0.0.1:8069;
        proxy_set_header Host $host;
";
}
