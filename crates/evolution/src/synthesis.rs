//! Code-synthesis collaborator.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Errors from the synthesis collaborator.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    /// The collaborator could not be reached or started
    #[error("synthesizer unavailable: {0}")]
    Unavailable(String),

    /// The collaborator reported a failure
    #[error("synthesizer failed: {0}")]
    Failed(String),

    /// The collaborator returned no code
    #[error("synthesizer returned no code")]
    Empty,

    /// The collaborator did not answer in time
    #[error("synthesizer timed out after {0:?}")]
    Timeout(Duration),
}

/// Produces candidate source code. A black box to the engine.
#[async_trait]
pub trait CodeSynthesizer: Send + Sync {
    /// Return source text for `problem_description`, guided by `parent_context`.
    async fn synthesize(&self, problem_description: &str, parent_context: &str) -> Result<String, SynthesisError>;
}

/// Runs an external command: prompt on stdin, code on stdout.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSynthesizer {
    /// Create a synthesizer for `program args...`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(120),
        }
    }

    /// Parse a shell-style command line.
    ///
    /// Words split on whitespace; single quotes, double quotes and
    /// backslash escapes group them. Returns `None` for an empty line or an
    /// unterminated quote.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = split_command_line(line)?.into_iter();
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Prompt written to the command's stdin.
    pub fn prompt(problem_description: &str, parent_context: &str) -> String {
        if parent_context.is_empty() {
            format!("# Problem\n{}\n", problem_description)
        } else {
            format!("# Problem\n{}\n\n# Context\n{}\n", problem_description, parent_context)
        }
    }
}

#[async_trait]
impl CodeSynthesizer for CommandSynthesizer {
    async fn synthesize(&self, problem_description: &str, parent_context: &str) -> Result<String, SynthesisError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SynthesisError::Unavailable(format!("{}: {}", self.program, e)))?;

        let prompt = Self::prompt(problem_description, parent_context);
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(prompt.as_bytes()).await {
                    // The command may answer without reading the whole prompt.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        debug!("Synthesizer closed stdin early");
                    }
                    other => other?,
                }
            }
            Ok::<(), std::io::Error>(())
        };
        let exchange = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.map_err(|e| SynthesisError::Failed(format!("writing prompt: {}", e)))?;
            output.map_err(|e| SynthesisError::Failed(e.to_string()))
        };

        // Dropping the exchange on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| SynthesisError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SynthesisError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let code = extract_code(&text);
        debug!(program = %self.program, bytes = code.len(), "Synthesized candidate");
        if code.trim().is_empty() {
            return Err(SynthesisError::Empty);
        }
        Ok(code)
    }
}

fn split_command_line(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        c => word.push(c),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            c @ ('"' | '\\' | '$' | '`') => word.push(c),
                            c => {
                                word.push('\\');
                                word.push(c);
                            }
                        },
                        c => word.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                word.push(chars.next()?);
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Some(words)
}

/// Strip a surrounding Markdown code fence, if the reply has one.
pub fn extract_code(reply: &str) -> String {
    let mut inside = false;
    let mut found = false;
    let mut body = Vec::new();
    for line in reply.lines() {
        if line.trim_start().starts_with("```") {
            if inside {
                found = true;
                break;
            }
            inside = true;
            continue;
        }
        if inside {
            body.push(line);
        }
    }
    if found {
        let mut code = body.join("\n");
        code.push('\n');
        code
    } else {
        reply.to_string()
    }
}
