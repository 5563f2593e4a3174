//! Scriptable in-memory executor for tests. Understands the file primitives
//! `RemoteFs` emits against an in-memory filesystem; every other command
//! succeeds with empty output unless a rule says otherwise.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{CommandOutput, Credential, RemoteExecutor, RemoteTarget, ShellSession};
use crate::core::errors::RemoteError;

#[derive(Clone)]
enum Response {
    Output(CommandOutput),
    Fail(RemoteError),
}

struct Rule {
    pattern: String,
    responses: VecDeque<Response>,
    delay: Option<Duration>,
}

#[derive(Default)]
struct FakeState {
    files: HashMap<String, String>,
    commands: Vec<String>,
    rules: Vec<Rule>,
}

#[derive(Default)]
pub struct FakeExecutor {
    state: Mutex<FakeState>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(&self) -> RemoteTarget {
        RemoteTarget {
            host_id: "host-1".to_string(),
            address: "203.0.113.10".to_string(),
            port: 22,
            username: "root".to_string(),
            credential: Credential::Password("secret".to_string()),
        }
    }

    fn push_rule(&self, pattern: &str, responses: Vec<Response>, delay: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        state.rules.push(Rule {
            pattern: pattern.to_string(),
            responses: responses.into(),
            delay,
        });
    }

    /// Any command containing `pattern` returns `output`. Later rules win.
    pub fn on(&self, pattern: &str, output: CommandOutput) {
        self.push_rule(pattern, vec![Response::Output(output)], None);
    }

    /// Successive matches consume `outputs` in order; the last one repeats.
    pub fn on_sequence(&self, pattern: &str, outputs: Vec<CommandOutput>) {
        let responses = outputs.into_iter().map(Response::Output).collect();
        self.push_rule(pattern, responses, None);
    }

    pub fn on_delayed(&self, pattern: &str, delay: Duration, output: CommandOutput) {
        self.push_rule(pattern, vec![Response::Output(output)], Some(delay));
    }

    pub fn fail(&self, pattern: &str, error: RemoteError) {
        self.push_rule(pattern, vec![Response::Fail(error)], None);
    }

    pub fn put_file(&self, path: &str, content: &str) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(path.to_string(), content.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn files_under(&self, prefix: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut paths: Vec<String> = state
            .files
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    fn scripted(&self, command: &str) -> Option<(Response, Option<Duration>)> {
        let mut state = self.state.lock().unwrap();
        let rule = state
            .rules
            .iter_mut()
            .rev()
            .find(|r| command.contains(&r.pattern))?;
        let response = if rule.responses.len() > 1 {
            rule.responses.pop_front()?
        } else {
            rule.responses.front()?.clone()
        };
        Some((response, rule.delay))
    }

    fn builtin(&self, command: &str) -> CommandOutput {
        let words = split_words(command);
        let args: Vec<&str> = words
            .iter()
            .skip(1)
            .map(String::as_str)
            .filter(|w| !w.starts_with('-'))
            .collect();
        let mut state = self.state.lock().unwrap();
        let files = &mut state.files;
        match words.first().map(String::as_str) {
            Some("cat") => match args.first().and_then(|p| files.get(*p)) {
                Some(content) => CommandOutput::ok(content),
                None => CommandOutput::failed(1, "cat: No such file or directory"),
            },
            Some("test") => match args.first() {
                Some(p) if files.contains_key(*p) => CommandOutput::ok(""),
                _ => CommandOutput::failed(1, ""),
            },
            Some("cp") | Some("ln") if args.len() == 2 => match files.get(args[0]).cloned() {
                Some(content) => {
                    files.insert(args[1].to_string(), content);
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(1, "No such file or directory"),
            },
            Some("mv") if args.len() == 2 => match files.remove(args[0]) {
                Some(content) => {
                    files.insert(args[1].to_string(), content);
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(1, "mv: cannot stat: No such file or directory"),
            },
            Some("rm") => {
                for p in args {
                    files.remove(p);
                }
                CommandOutput::ok("")
            }
            _ => CommandOutput::ok(""),
        }
    }
}

/// Splits a command line honoring single quotes and backslash escapes.
fn split_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(
        &self,
        _target: &RemoteTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        self.state
            .lock()
            .unwrap()
            .commands
            .push(command.to_string());

        match self.scripted(command) {
            Some((response, delay)) => {
                if let Some(delay) = delay {
                    if delay > timeout {
                        tokio::time::sleep(timeout).await;
                        return Err(RemoteError::Timeout {
                            host: "203.0.113.10".to_string(),
                            seconds: timeout.as_secs(),
                        });
                    }
                    tokio::time::sleep(delay).await;
                }
                match response {
                    Response::Output(out) => Ok(out),
                    Response::Fail(err) => Err(err),
                }
            }
            None => Ok(self.builtin(command)),
        }
    }

    async fn transfer(
        &self,
        _target: &RemoteTarget,
        payload: &[u8],
        remote_path: &str,
        _timeout: Duration,
    ) -> Result<(), RemoteError> {
        let marker = format!("upload {}", remote_path);
        self.state.lock().unwrap().commands.push(marker.clone());
        if let Some((Response::Fail(err), _)) = self.scripted(&marker) {
            return Err(err);
        }
        self.put_file(remote_path, &String::from_utf8_lossy(payload));
        Ok(())
    }

    /// Echo shell: whatever is written comes back prefixed with `$ `.
    async fn open_shell(
        &self,
        _target: &RemoteTarget,
        command: Option<&str>,
    ) -> Result<ShellSession, RemoteError> {
        let marker = format!("shell {}", command.unwrap_or("login"));
        self.state.lock().unwrap().commands.push(marker.clone());
        if let Some((Response::Fail(err), _)) = self.scripted(&marker) {
            return Err(err);
        }

        let (client, mut remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut echoed = b"$ ".to_vec();
                        echoed.extend_from_slice(&buf[..n]);
                        if remote.write_all(&echoed).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let (output, input) = tokio::io::split(client);
        Ok(ShellSession {
            input: Box::new(input),
            output: Box::new(output),
            child: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_words_handles_quotes_and_escapes() {
        assert_eq!(
            split_words(r"mv -f -- '/a b' '/it'\''s'"),
            vec!["mv", "-f", "--", "/a b", "/it's"]
        );
    }

    #[tokio::test]
    async fn sequences_advance_then_repeat_last() {
        let fake = FakeExecutor::new();
        let t = fake.target();
        fake.on_sequence(
            "systemctl is-active nginx",
            vec![CommandOutput::ok("active"), CommandOutput::ok("failed")],
        );
        let d = Duration::from_secs(1);
        let first = fake.run(&t, "systemctl is-active nginx", d).await.unwrap();
        let second = fake.run(&t, "systemctl is-active nginx", d).await.unwrap();
        let third = fake.run(&t, "systemctl is-active nginx", d).await.unwrap();
        assert_eq!(first.stdout, "active");
        assert_eq!(second.stdout, "failed");
        assert_eq!(third.stdout, "failed");
        assert_eq!(fake.count("is-active"), 3);
    }
}
