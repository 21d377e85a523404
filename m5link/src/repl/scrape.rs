//! Extracting program output from the interpreter's terminal stream.
//!
//! Everything that knows what a REPL response looks like lives here, behind
//! [`scrape`]. Two shapes are recognized:
//!
//! ```text
//! raw REPL:    OK<stdout>\x04<stderr>\x04>
//! echo/prompt: <echoed source>\r\n<stdout>\r\n>>>
//! ```
//!
//! Prompt strings and the end marker come from [`Terminators`], since
//! firmware builds disagree on them.

/// First line of a Python traceback.
pub const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

/// Patterns that end (or abort) a REPL response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminators {
    /// Prompts that follow the output in echo mode.
    pub prompts: Vec<String>,
    /// Separator after stdout and after stderr in raw mode.
    pub end_marker: Option<char>,
    /// Text meaning the firmware itself failed or restarted.
    pub fault_markers: Vec<String>,
}

impl Default for Terminators {
    fn default() -> Self {
        Self {
            prompts: vec![">>> ".to_string()],
            end_marker: Some('\x04'),
            fault_markers: [
                "soft reboot",
                "Guru Meditation Error",
                "Brownout detector was triggered",
                "rst:0x",
                "could not enter raw repl",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Result of scraping a response buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scrape {
    /// No terminator yet; keep reading.
    Incomplete,
    /// A full response was recognized.
    Complete(ScrapedOutput),
}

/// The parts of a finished response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedOutput {
    /// What the program printed.
    pub output: String,
    /// Traceback or stderr text, if any.
    pub error: Option<String>,
    /// The firmware reported a fault; the session state is no longer known.
    pub fault: bool,
}

/// Scrape `buffer`, the text received since `echoed` was sent.
///
/// Fault markers inside a raw-mode body are program output until the board
/// shows a prompt again; anywhere else they end the exchange as a fault.
pub fn scrape(buffer: &str, echoed: &str, terminators: &Terminators) -> Scrape {
    let markers = &terminators.fault_markers;

    if let Some(marker) = terminators.end_marker {
        if let Some((output, trailing)) = scrape_raw(buffer, marker) {
            return match find_fault(trailing, markers) {
                Some(line) => fault(line),
                None => Scrape::Complete(output),
            };
        }
        if let Some(line) = raw_body(buffer).and_then(|body| find_fault(body, markers)) {
            let back_at_prompt = terminators
                .prompts
                .iter()
                .any(|prompt| strip_prompt(buffer, prompt).is_some());
            return if back_at_prompt {
                fault(line)
            } else {
                Scrape::Incomplete
            };
        }
    }

    if let Some(line) = find_fault(buffer, markers) {
        return fault(line);
    }

    terminators
        .prompts
        .iter()
        .find_map(|prompt| strip_prompt(buffer, prompt))
        .map_or(Scrape::Incomplete, |body| {
            Scrape::Complete(scrape_echo(body, echoed))
        })
}

fn fault(line: &str) -> Scrape {
    Scrape::Complete(ScrapedOutput {
        output: String::new(),
        error: Some(line.to_string()),
        fault: true,
    })
}

fn find_fault<'a>(buffer: &'a str, markers: &[String]) -> Option<&'a str> {
    markers
        .iter()
        .filter(|m| !m.is_empty())
        .find_map(|marker| buffer.find(marker.as_str()))
        .map(|pos| {
            let start = buffer[..pos].rfind('\n').map_or(0, |i| i + 1);
            let end = buffer[pos..].find('\n').map_or(buffer.len(), |i| pos + i);
            buffer[start..end].trim()
        })
}

/// Text after the `OK` that opens a raw-mode response.
fn raw_body(buffer: &str) -> Option<&str> {
    let pos = buffer.find("OK")?;
    buffer[..pos]
        .chars()
        .all(|c| c.is_whitespace() || c == '>')
        .then(|| &buffer[pos + 2..])
}

/// A finished raw-mode response and whatever followed its second marker.
fn scrape_raw(buffer: &str, marker: char) -> Option<(ScrapedOutput, &str)> {
    let mut parts = buffer.splitn(3, marker);
    let stdout = parts.next()?;
    let stderr = parts.next()?;
    // the second marker must have arrived too
    let trailing = parts.next()?;

    let stdout = raw_body(stdout).unwrap_or(stdout);
    let error = normalize(stderr);
    let output = ScrapedOutput {
        output: normalize(stdout),
        error: (!error.is_empty()).then_some(error),
        fault: false,
    };
    Some((output, trailing))
}

fn strip_prompt<'a>(buffer: &'a str, prompt: &str) -> Option<&'a str> {
    let prompt = prompt.trim_end();
    if prompt.is_empty() {
        return None;
    }
    let body = buffer
        .trim_end_matches([' ', '\t'])
        .strip_suffix(prompt)?;
    // the prompt has to start its own line
    (body.is_empty() || body.ends_with('\n')).then_some(body)
}

fn scrape_echo(body: &str, echoed: &str) -> ScrapedOutput {
    let mut lines: Vec<&str> = body
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }

    let mut start = 0;
    for echo in echoed.lines().map(str::trim).filter(|l| !l.is_empty()) {
        while lines.get(start).is_some_and(|line| line.is_empty()) {
            start += 1;
        }
        match lines.get(start) {
            Some(line) if strip_input_prompt(line).trim() == echo => start += 1,
            _ => break,
        }
    }

    let text = lines[start.min(lines.len())..].join("\n");
    match text.find(TRACEBACK_HEADER) {
        Some(pos) => ScrapedOutput {
            output: text[..pos].trim_end_matches('\n').to_string(),
            error: Some(text[pos..].trim_end().to_string()),
            fault: false,
        },
        None => ScrapedOutput {
            output: text,
            error: None,
            fault: false,
        },
    }
}

fn strip_input_prompt(line: &str) -> &str {
    line.strip_prefix(">>> ")
        .or_else(|| line.strip_prefix("... "))
        .unwrap_or(line)
}

/// Unify line endings and drop surrounding blank lines.
fn normalize(text: &str) -> String {
    text.split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim_matches('\n')
        .to_string()
}

/// Last meaningful line of a traceback (`OSError: [Errno 2] ENOENT`).
pub fn error_summary(error: &str) -> &str {
    error
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or("")
}

/// Whether an error text reports a missing file.
pub fn is_not_found(error: &str) -> bool {
    error.contains("ENOENT") || error.contains("[Errno 2]")
}

/// Inbound text accumulated for one exchange.
///
/// Bytes are decoded as they arrive; a multi-byte character split across
/// chunks is held back until it completes.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    pending: Vec<u8>,
    text: String,
    received: usize,
}

impl ResponseBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.received += chunk.len();
        self.pending.extend_from_slice(chunk);
        let decoded = drain_utf8_lossy(&mut self.pending);
        self.text.push_str(&decoded);
    }

    /// Text decoded so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Raw bytes received, decoded or not.
    pub fn received(&self) -> usize {
        self.received
    }

    /// The last `max_chars` characters, for error messages.
    pub fn tail(&self, max_chars: usize) -> String {
        let count = self.text.chars().count();
        self.text.chars().skip(count.saturating_sub(max_chars)).collect()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.text.clear();
        self.received = 0;
    }
}

/// Drain buffered bytes into text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                        output.push_str(valid);
                    }
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('\u{FFFD}');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        if valid_up_to > 0 {
                            buffer.drain(..valid_up_to);
                        }
                        break;
                    },
                }
            },
        }
    }

    output
}
